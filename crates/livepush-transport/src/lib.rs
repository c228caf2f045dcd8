//! RTMP publishing pipeline.
//!
//! This crate defines the collaborator boundary a publish session
//! drives — encoder preparation, preview, and one-shot outbound stream
//! attempts — plus a concrete RTMP implementation built on `rml_rtmp`.

mod error;
mod event;
mod pipeline;
mod rtmp;

pub use error::TransportError;
pub use event::{transport_event_channel, TransportEvent, TransportEventKind};
pub use pipeline::Pipeline;
pub use rtmp::{MediaPacket, RtmpPipeline};

/// Channel capacity for outgoing media packets.
pub const PACKET_CHANNEL_CAPACITY: usize = 30;

/// Channel capacity for transport events.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
