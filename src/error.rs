/// Unified error handling for enlace
///
/// This module provides the error taxonomy used by every layer of the driver:
/// configuration errors, connection failures, wire protocol errors, and the
/// transport errors they wrap.

use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for enlace operations
#[derive(Debug, Error)]
pub enum EnlaceError {
    /// Transport-level errors (connect, read, write)
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// An operation needs a setting that was never supplied
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Errors loading or validating a configuration file
    #[error("Config file error: {0}")]
    Config(#[from] ConfigError),

    /// No node can serve the requested role
    #[error("Connection failure: {message}")]
    ConnectionFailure { message: String },

    /// Malformed or out-of-sequence wire data
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A safe write reached a node that is no longer primary
    #[error("Node {address} is no longer primary")]
    NotPrimary { address: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },
}

/// Wire protocol errors. Any of these discards the socket that produced it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid message length: {0}")]
    InvalidLength(i32),

    #[error("Unknown operation code: {0}")]
    UnknownOpCode(i32),

    #[error("Unexpected operation code {found}, expected {expected}")]
    UnexpectedOpCode { expected: i32, found: i32 },

    #[error("Message body truncated: {0}")]
    Truncated(String),

    #[error("{0} unexpected bytes after message body")]
    TrailingBytes(usize),

    #[error("Reply to unknown request {0}")]
    UnexpectedResponse(i32),

    #[error("Reply carried no documents")]
    EmptyReply,

    #[error("Document error: {0}")]
    Document(String),
}

impl From<bson::ser::Error> for ProtocolError {
    fn from(e: bson::ser::Error) -> Self {
        ProtocolError::Document(e.to_string())
    }
}

impl From<bson::de::Error> for ProtocolError {
    fn from(e: bson::de::Error) -> Self {
        ProtocolError::Document(e.to_string())
    }
}

/// Result type alias for enlace operations
pub type EnlaceResult<T> = Result<T, EnlaceError>;

/// Convenience methods for creating specific error types
impl EnlaceError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        EnlaceError::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection failure
    pub fn connection_failure<S: Into<String>>(message: S) -> Self {
        EnlaceError::ConnectionFailure {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        EnlaceError::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if this error means the connection or node behind it failed,
    /// as opposed to a bad request or setting
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            EnlaceError::Network(_) | EnlaceError::Protocol(_) | EnlaceError::Timeout { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EnlaceError::Configuration { .. } => ErrorSeverity::Critical,
            EnlaceError::Config(_) => ErrorSeverity::Critical,
            EnlaceError::Network(_) => ErrorSeverity::Warning,
            EnlaceError::ConnectionFailure { .. } => ErrorSeverity::Warning,
            EnlaceError::Timeout { .. } => ErrorSeverity::Warning,
            EnlaceError::NotPrimary { .. } => ErrorSeverity::Info,
            EnlaceError::Protocol(_) => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Errors that need a configuration change
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = EnlaceError::connection_failure("no primary");
        assert!(matches!(error, EnlaceError::ConnectionFailure { .. }));
        assert_eq!(error.to_string(), "Connection failure: no primary");
    }

    #[test]
    fn test_error_severity() {
        let config_error = EnlaceError::configuration("database not set");
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let network_error =
            EnlaceError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "test"));
        assert_eq!(network_error.severity(), ErrorSeverity::Warning);
        assert_eq!(ErrorSeverity::Warning.to_string(), "WARNING");
    }

    #[test]
    fn test_transport_failures() {
        let network_error =
            EnlaceError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "test"));
        assert!(network_error.is_transport_failure());

        let config_error = EnlaceError::configuration("test");
        assert!(!config_error.is_transport_failure());

        let protocol_error = EnlaceError::from(ProtocolError::UnknownOpCode(42));
        assert!(protocol_error.is_transport_failure());
    }

    #[test]
    fn test_protocol_error_display() {
        let error = EnlaceError::Protocol(ProtocolError::InvalidLength(4));
        assert_eq!(error.to_string(), "Protocol error: Invalid message length: 4");
    }
}
