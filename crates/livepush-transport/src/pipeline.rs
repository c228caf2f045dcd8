//! The transport/encoder collaborator boundary.

use livepush_ipc::{AudioConfig, VideoConfig};

use crate::TransportResult;

/// The camera/encoder/transport collaborator a publish session drives.
///
/// Implementations accept encoder configuration up front, then carry
/// one outbound publish attempt per `start_stream` call. Attempt
/// outcomes arrive asynchronously as [`TransportEvent`]s tagged with the
/// attempt id the session supplied; the session discards events from
/// superseded attempts.
///
/// [`TransportEvent`]: crate::TransportEvent
pub trait Pipeline: Send {
    /// Offer the video encoder configuration. Returns false if the
    /// configuration is rejected.
    fn prepare_video(&mut self, config: &VideoConfig) -> bool;

    /// Offer the audio encoder configuration. Returns false if the
    /// configuration is rejected.
    fn prepare_audio(&mut self, config: &AudioConfig) -> bool;

    /// Begin producing a local preview.
    fn start_preview(&mut self);

    /// Stop the local preview.
    fn stop_preview(&mut self);

    /// Begin one outbound publish attempt to `url`. Events referencing
    /// this attempt carry the given id.
    fn start_stream(&mut self, url: &str, attempt: u64) -> TransportResult<()>;

    /// Tear down the active attempt, if any. Idempotent.
    fn stop_stream(&mut self);
}
