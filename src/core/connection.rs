/// Transport establishment for node sockets
///
/// A `Connector` turns a `host:port` address into a byte stream. The default
/// `TcpConnector` dials TCP with a timeout; tests swap in in-memory streams.
use crate::error::{EnlaceError, EnlaceResult};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Byte stream carrying wire protocol frames
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Opens transports to node addresses
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> EnlaceResult<Box<dyn Transport>>;
}

/// TCP connector with connect timeout and keepalive
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    keepalive: Option<Duration>,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            keepalive: Some(Duration::from_secs(120)),
        }
    }

    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Configure a fresh stream for request/response traffic
    fn configure_stream(&self, stream: &TcpStream) -> Result<(), io::Error> {
        // Small command frames; don't wait on Nagle
        stream.set_nodelay(true)?;

        if let Some(time) = self.keepalive {
            let keepalive = socket2::TcpKeepalive::new().with_time(time);
            socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> EnlaceResult<Box<dyn Transport>> {
        debug!("Connecting to node {}", address);

        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = self.configure_stream(&stream) {
                    warn!("Failed to configure stream to {}: {}", address, e);
                }

                debug!("Connected to node {}", address);
                Ok(Box::new(stream))
            }
            Ok(Err(e)) => {
                debug!("Network error connecting to {}: {}", address, e);
                Err(EnlaceError::Network(e))
            }
            Err(_) => {
                debug!("Timeout connecting to {}", address);
                Err(EnlaceError::timeout(format!("connect to {}", address)))
            }
        }
    }
}
