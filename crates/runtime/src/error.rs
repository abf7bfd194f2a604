//! Error types for the co-pilot runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the co-pilot runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to establish the duplex connection.
    #[error("Failed to connect to agent endpoint: {0}")]
    ConnectionFailed(String),

    /// Transport-level error (socket send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol-level error (malformed or unexpected frame).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Channel closed unexpectedly.
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// Timeout waiting for an operation.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Returns true if the connection is unusable after this error.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::ChannelClosed | Error::ConnectionFailed(_) | Error::Transport(_)
        )
    }
}
