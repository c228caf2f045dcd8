//! Error types for the transport module.

use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Invalid publish URL.
    #[error("invalid publish URL: {0}")]
    InvalidUrl(String),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server rejected the connection or publish request.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// Send error.
    #[error("send error: {0}")]
    Send(String),

    /// Encoder configuration was not accepted before streaming.
    #[error("encoders not prepared")]
    NotPrepared,

    /// A stream attempt is already running.
    #[error("already streaming")]
    AlreadyStreaming,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
