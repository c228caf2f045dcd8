//! Session error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors a publish session can report.
///
/// Every variant is recovered locally: the session always returns to
/// `Idle` or `PreviewOnly` and retains the error for the caller to
/// inspect. Nothing here is fatal to the process.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SessionError {
    /// Camera or microphone authorization is missing.
    #[error("camera or microphone permission denied")]
    PermissionDenied,

    /// The target URL is blank or malformed.
    #[error("invalid stream URL: {0}")]
    InvalidUrl(String),

    /// The encoder rejected the video or audio configuration.
    #[error("encoder rejected the stream configuration")]
    PrepareFailed,

    /// The server rejected the credentials carried in the URL or key.
    #[error("authentication rejected by server")]
    AuthError,

    /// The transport reported a connection failure.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The server closed the stream without an explicit stop.
    #[error("stream disconnected unexpectedly")]
    UnexpectedDisconnect,

    /// A start was requested while an attempt is already connecting or
    /// live. Rejected without touching the running attempt.
    #[error("a publish attempt is already active")]
    AlreadyActive,
}

impl SessionError {
    /// Returns true if this error terminates a running attempt (as
    /// opposed to rejecting a request up front).
    pub fn ends_attempt(&self) -> bool {
        matches!(
            self,
            Self::AuthError | Self::ConnectionFailed(_) | Self::UnexpectedDisconnect
        )
    }
}
