/// Database nodes and their socket pools
use super::connection::Connector;
use super::socket::Socket;
use super::NodeRole;
use crate::error::{EnlaceError, EnlaceResult};
use parking_lot::{Mutex, RwLock};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Pool sizing and per-exchange timeout for every node of a cluster
#[derive(Debug, Clone, PartialEq)]
pub struct PoolOptions {
    /// Upper bound on sockets open to one node at a time
    pub pool_size: usize,
    pub operation_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            pool_size: 5,
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot of what the cluster currently believes about a node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub role: NodeRole,
    pub last_discovery: Option<SystemTime>,
    pub down_reason: Option<String>,
}

/// One database server and its pool of sockets
pub struct Node {
    address: String,
    state: RwLock<NodeState>,
    idle: Mutex<Vec<Socket>>,
    permits: Arc<Semaphore>,
    connector: Arc<dyn Connector>,
    options: PoolOptions,
}

impl Node {
    pub fn new(address: String, connector: Arc<dyn Connector>, options: PoolOptions) -> Self {
        Self {
            address,
            state: RwLock::new(NodeState {
                role: NodeRole::Unknown,
                last_discovery: None,
                down_reason: None,
            }),
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(options.pool_size.max(1))),
            connector,
            options,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn role(&self) -> NodeRole {
        self.state.read().role
    }

    pub fn state(&self) -> NodeState {
        self.state.read().clone()
    }

    /// Record the role a discovery reply reported for this node
    pub fn set_role(&self, role: NodeRole) {
        let mut state = self.state.write();
        if state.role != role {
            info!("Node {} is now {} (was {})", self.address, role, state.role);
        }
        state.role = role;
        state.last_discovery = Some(SystemTime::now());
        state.down_reason = None;
    }

    /// Exclude the node from routing until discovery restores it
    pub fn mark_down<S: Into<String>>(&self, reason: S) {
        let reason = reason.into();
        {
            let mut state = self.state.write();
            if state.role != NodeRole::Down {
                warn!("Marking node {} down: {}", self.address, reason);
            }
            state.role = NodeRole::Down;
            state.down_reason = Some(reason);
        }
        // Idle sockets to a failed node are unlikely to be usable
        self.idle.lock().clear();
    }

    /// Forget a primary classification without declaring the node down
    pub fn demote(&self) {
        let mut state = self.state.write();
        if state.role == NodeRole::Primary {
            info!("Node {} is no longer primary", self.address);
            state.role = NodeRole::Unknown;
        }
    }

    /// Check a socket out of the pool, opening a new connection when no idle
    /// socket is available. Waits while the pool is at capacity.
    pub async fn acquire(self: &Arc<Self>) -> EnlaceResult<PooledSocket> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| EnlaceError::connection_failure(format!("pool for {} is closed", self.address)))?;

        let idle = self.idle.lock().pop();
        let socket = match idle {
            Some(socket) => socket,
            None => self.connect().await?,
        };

        Ok(PooledSocket {
            socket: Some(socket),
            node: Arc::clone(self),
            _permit: permit,
        })
    }

    async fn connect(&self) -> EnlaceResult<Socket> {
        match self.connector.connect(&self.address).await {
            Ok(stream) => {
                debug!("Opened socket to {}", self.address);
                Ok(Socket::new(
                    self.address.clone(),
                    stream,
                    self.options.operation_timeout,
                ))
            }
            Err(e) => {
                // A connector rejecting the address itself says nothing
                // about the node's health
                if e.is_transport_failure() {
                    self.mark_down(e.to_string());
                }
                Err(EnlaceError::connection_failure(format!(
                    "could not connect to {}: {}",
                    self.address, e
                )))
            }
        }
    }

    fn checkin(&self, socket: Socket) {
        let mut idle = self.idle.lock();
        if idle.len() < self.options.pool_size {
            idle.push(socket);
        }
    }

    fn discard(&self, socket: Socket) {
        debug!("Dropping poisoned socket to {}", socket.address());
        self.mark_down("socket error during exchange");
    }

    /// Sockets waiting in the pool
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Sockets currently checked out
    pub fn in_use(&self) -> usize {
        self.options.pool_size.max(1) - self.permits.available_permits()
    }

    pub fn pool_size(&self) -> usize {
        self.options.pool_size
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("role", &self.role())
            .field("idle", &self.idle_count())
            .finish()
    }
}

/// A socket checked out of a node's pool.
///
/// Dropping the guard returns the socket to the pool, or discards it and
/// marks the node down if the socket was poisoned by an error.
pub struct PooledSocket {
    socket: Option<Socket>,
    node: Arc<Node>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSocket {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Deref for PooledSocket {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        // Only `drop` takes the socket out
        self.socket.as_ref().expect("pooled socket already released")
    }
}

impl DerefMut for PooledSocket {
    fn deref_mut(&mut self) -> &mut Socket {
        self.socket.as_mut().expect("pooled socket already released")
    }
}

impl Drop for PooledSocket {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            if socket.is_poisoned() {
                self.node.discard(socket);
            } else {
                self.node.checkin(socket);
            }
        }
    }
}
