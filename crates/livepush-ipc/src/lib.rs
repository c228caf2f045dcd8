//! Typed session<->presentation messages for livepush.
//!
//! This crate defines the state, event, error, and configuration types
//! shared between the publish session core and whatever presentation
//! layer observes it.

mod error;
mod events;
mod state;
mod types;

pub use error::SessionError;
pub use events::SessionEvent;
pub use state::SessionState;
pub use types::{AudioConfig, StreamConfig, VideoConfig};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for observer events (Session → Presentation).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded observer event channel.
pub fn event_channel() -> (Sender<SessionEvent>, Receiver<SessionEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
