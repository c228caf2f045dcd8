//! Events emitted by the session to its observers.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::state::SessionState;

/// Events the session emits after a transition commits.
///
/// The session makes no assumption about the thread draining these; a
/// presentation adapter re-dispatches onto whatever context it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Session state has changed.
    StateChanged {
        /// Previous state.
        previous: SessionState,

        /// Current state.
        current: SessionState,
    },

    /// The transport began dialing the target. Informational; the
    /// session remains in `Connecting`.
    ConnectionStarted {
        /// Destination URL.
        url: String,
    },

    /// New advisory estimate of the achievable send rate.
    BitrateUpdated {
        /// Measured bitrate in bits per second.
        bitrate_bps: u64,
    },

    /// An error was reported to the caller.
    Error {
        /// The error condition.
        error: SessionError,
    },
}
