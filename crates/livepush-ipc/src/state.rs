//! Publish session state machine types.

use serde::{Deserialize, Serialize};

/// The lifecycle state of a publish session.
///
/// A session moves from `Idle` through preview and connection states to
/// `Live`, and every attempt terminates back in `Idle` — either through
/// an explicit stop or through `Failed` followed by an automatic stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No preview, no stream.
    #[default]
    Idle,

    /// Local preview is running, nothing is being published.
    PreviewOnly,

    /// Validating and applying encoder configuration.
    Preparing,

    /// Outbound connection in flight.
    Connecting,

    /// Server requested authentication, awaiting the result.
    Authenticating,

    /// Publishing to the server.
    Live,

    /// Tearing down an active attempt.
    Stopping,

    /// The attempt ended in an error; an automatic stop follows.
    Failed,
}

impl SessionState {
    /// Returns true if the session is idle.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true if the session is publishing.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Returns true if a publish attempt is in flight (preparing,
    /// connecting, authenticating, or live).
    pub fn is_attempt_active(&self) -> bool {
        matches!(
            self,
            Self::Preparing | Self::Connecting | Self::Authenticating | Self::Live
        )
    }

    /// Returns true if a start request can be accepted in this state.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::PreviewOnly)
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::PreviewOnly => "PreviewOnly",
            Self::Preparing => "Preparing",
            Self::Connecting => "Connecting",
            Self::Authenticating => "Authenticating",
            Self::Live => "Live",
            Self::Stopping => "Stopping",
            Self::Failed => "Failed",
        }
    }
}
