//! enlace - a replica set aware client driver core for the MongoDB wire protocol
//!
//! The crate keeps a pool of sockets per database node, discovers replica set
//! topology with `ismaster`, routes writes to the primary and reads according
//! to the session's consistency, and frames requests and replies in the
//! legacy wire format.
//!
//! ```no_run
//! use enlace::{doc, Options, Session};
//!
//! # async fn run() -> enlace::EnlaceResult<()> {
//! let session = Session::new("127.0.0.1:27017,127.0.0.1:27018", Options::new());
//! session.use_database("admin");
//! let reply = session.current_database()?.command(doc! { "ping": 1 }).await?;
//! println!("{}", reply);
//! # Ok(())
//! # }
//! ```
pub mod cluster;
pub mod config;
pub mod core;
pub mod database;
pub mod error;
pub mod options;
pub mod protocol;
pub mod session;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use bson::{doc, Document};
pub use cluster::{Cluster, ClusterOptions, ReadBalancing, RefreshPolicy, StalePrimaryPolicy};
pub use config::{init_logging, DriverConfig};
pub use crate::core::{Connector, NodeRole, PooledSocket, Role, TcpConnector};
pub use database::Database;
pub use error::{EnlaceError, EnlaceResult, ErrorSeverity, ProtocolError};
pub use options::{Consistency, Options, Safe, Seeds};
pub use session::Session;
