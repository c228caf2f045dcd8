//! Publish session core.
//!
//! This crate owns the lifecycle of one outbound publish attempt: from
//! idle through preview, connecting, and live, back to idle on stop or
//! failure. It drives a [`Pipeline`] collaborator and reacts to the
//! asynchronous events the pipeline delivers.

mod pump;
mod session;

pub use pump::EventPump;
pub use session::PublishSession;

use std::sync::Arc;

use crossbeam_channel::Receiver;

use livepush_ipc::SessionEvent;
use livepush_transport::{Pipeline, TransportEvent};

/// Wire a session to a pipeline: creates the observer channel and the
/// background pump draining `transport_events` into the session.
pub fn spawn_session(
    pipeline: Box<dyn Pipeline>,
    transport_events: Receiver<TransportEvent>,
) -> (Arc<PublishSession>, Receiver<SessionEvent>, EventPump) {
    let (event_tx, event_rx) = livepush_ipc::event_channel();
    let session = Arc::new(PublishSession::new(pipeline, event_tx));
    let pump = EventPump::spawn(Arc::clone(&session), transport_events);
    (session, event_rx, pump)
}
