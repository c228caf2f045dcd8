//! Asynchronous events delivered by a pipeline.

use crossbeam_channel::{Receiver, Sender};

use crate::EVENT_CHANNEL_CAPACITY;

/// An asynchronous callback from the pipeline, tagged with the publish
/// attempt it belongs to. Events whose attempt id has been superseded
/// are discarded by the session.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    /// The attempt id handed to `start_stream`.
    pub attempt: u64,

    /// What happened.
    pub kind: TransportEventKind,
}

/// The callback vocabulary of the pipeline.
#[derive(Debug, Clone)]
pub enum TransportEventKind {
    /// The outbound dial has begun.
    ConnectionStarted {
        /// Destination URL.
        url: String,
    },

    /// The server requires authentication before publishing.
    AuthRequired,

    /// Authentication succeeded.
    AuthSuccess,

    /// The server rejected the credentials.
    AuthError,

    /// The publish request was accepted; media can flow.
    ConnectionSuccess,

    /// The attempt failed with a transport-supplied reason.
    ConnectionFailed {
        /// Collaborator-supplied failure reason.
        reason: String,
    },

    /// The server closed an established stream.
    Disconnected,

    /// New estimate of the achievable send rate.
    BitrateMeasured {
        /// Measured bitrate in bits per second.
        bitrate_bps: u64,
    },
}

/// Creates a bounded transport event channel.
pub fn transport_event_channel() -> (Sender<TransportEvent>, Receiver<TransportEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
