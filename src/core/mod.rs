/// Core connection abstractions: connectors, sockets, and nodes
pub mod connection;
pub mod node;
pub mod socket;

pub use connection::{Connector, TcpConnector, Transport};
pub use node::{Node, NodeState, PoolOptions, PooledSocket};
pub use socket::Socket;

use std::fmt;

/// What an operation needs from the node it is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Must reach the primary
    Write,
    /// May reach a secondary, depending on the session's consistency
    Read,
}

/// Last known classification of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Primary,
    Secondary,
    Arbiter,
    /// Known address that has not been classified yet
    Unknown,
    /// Unreachable or dropped from the replica set; excluded from routing
    Down,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Secondary => write!(f, "secondary"),
            NodeRole::Arbiter => write!(f, "arbiter"),
            NodeRole::Unknown => write!(f, "unknown"),
            NodeRole::Down => write!(f, "down"),
        }
    }
}
