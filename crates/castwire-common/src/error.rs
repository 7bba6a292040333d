//! Common error types for Castwire.

use thiserror::Error;

/// Result type alias using Castwire's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Castwire operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or out-of-sequence signaling message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket-level failure on the signaling connection
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer-connection engine rejected an operation
    #[error("engine error in {operation}: {message}")]
    Engine { operation: String, message: String },

    /// The signaling channel is not open
    #[error("signaling channel is not connected")]
    NotConnected,

    /// The session has not reached the data-ready state
    #[error("session is not ready for data")]
    NotReady,

    /// A previous session has not been closed yet
    #[error("a session is already connected")]
    AlreadyConnected,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create an engine error for the named operation.
    pub fn engine(operation: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::Engine {
            operation: operation.into(),
            message: msg.to_string(),
        }
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}
