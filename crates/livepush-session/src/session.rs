//! The publish session state machine.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use livepush_ipc::{SessionError, SessionEvent, SessionState, StreamConfig};
use livepush_transport::{Pipeline, TransportEvent, TransportEventKind};

/// One outbound publish session.
///
/// All transitions happen under a single lock, so user intents from a
/// control thread and transport callbacks from the pump thread can
/// never interleave into an inconsistent state. Observers are notified
/// through the event channel only after a transition commits; emission
/// never blocks.
///
/// Every `start` (and `stop`) advances an attempt counter. Transport
/// events carry the attempt id they were started under, and events
/// from a superseded attempt are discarded without a transition.
pub struct PublishSession {
    inner: Mutex<Inner>,
    event_tx: Sender<SessionEvent>,
}

struct Inner {
    state: SessionState,
    attempt: u64,
    target_url: Option<String>,
    current_bitrate: Option<u64>,
    last_error: Option<SessionError>,
    previewing: bool,
    pipeline: Box<dyn Pipeline>,
}

impl PublishSession {
    /// Create a session driving the given pipeline, reporting observer
    /// events on `event_tx`.
    pub fn new(pipeline: Box<dyn Pipeline>, event_tx: Sender<SessionEvent>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                attempt: 0,
                target_url: None,
                current_bitrate: None,
                last_error: None,
                previewing: false,
                pipeline,
            }),
            event_tx,
        }
    }

    /// Report the camera and microphone authorization outcome. With
    /// both granted from `Idle`, the preview starts and the session
    /// moves to `PreviewOnly`; otherwise nothing changes and
    /// `PermissionDenied` is recorded.
    pub fn permissions_granted(
        &self,
        camera: bool,
        microphone: bool,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();

        if !camera || !microphone {
            info!(camera, microphone, "permissions missing");
            let error = SessionError::PermissionDenied;
            inner.last_error = Some(error.clone());
            self.emit(SessionEvent::Error {
                error: error.clone(),
            });
            return Err(error);
        }

        if inner.state.is_idle() {
            inner.pipeline.start_preview();
            inner.previewing = true;
            self.transition(&mut inner, SessionState::PreviewOnly);
        }

        Ok(())
    }

    /// Begin a publish attempt.
    ///
    /// Valid from `Idle` or `PreviewOnly`. Validates the URL, offers
    /// the encoder configuration to the pipeline, and hands the stream
    /// off to the transport. Returns immediately after committing to
    /// `Connecting`; the outcome arrives later as transport events.
    pub fn start(&self, config: StreamConfig) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();

        if !inner.state.can_start() {
            debug!(
                state = inner.state.name(),
                "start rejected, attempt already active"
            );
            let error = SessionError::AlreadyActive;
            self.emit(SessionEvent::Error {
                error: error.clone(),
            });
            return Err(error);
        }

        let url = config.url.trim().to_string();
        if let Err(error) = validate_url(&url) {
            inner.last_error = Some(error.clone());
            self.emit(SessionEvent::Error {
                error: error.clone(),
            });
            return Err(error);
        }

        info!(url = %url, "starting publish attempt");

        inner.last_error = None;
        inner.current_bitrate = None;
        inner.attempt += 1;
        let attempt = inner.attempt;
        let origin = inner.state;

        self.transition(&mut inner, SessionState::Preparing);

        let video_ok = inner.pipeline.prepare_video(&config.video);
        let audio_ok = inner.pipeline.prepare_audio(&config.audio);
        if !video_ok || !audio_ok {
            warn!(video_ok, audio_ok, "encoder rejected configuration");
            let error = SessionError::PrepareFailed;
            inner.last_error = Some(error.clone());
            self.transition(&mut inner, origin);
            self.emit(SessionEvent::Error {
                error: error.clone(),
            });
            return Err(error);
        }

        inner.target_url = Some(url.clone());
        self.transition(&mut inner, SessionState::Connecting);

        if let Err(e) = inner.pipeline.start_stream(&url, attempt) {
            let error = SessionError::ConnectionFailed(e.to_string());
            self.fail_attempt(&mut inner, error.clone());
            return Err(error);
        }

        Ok(())
    }

    /// Stop the session. Idempotent; always lands in `Idle`.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            SessionState::Idle => {}
            SessionState::PreviewOnly => {
                inner.pipeline.stop_preview();
                inner.previewing = false;
                self.transition(&mut inner, SessionState::Idle);
            }
            _ => {
                info!("stopping publish attempt");
                inner.attempt += 1; // supersede callbacks still in flight
                self.transition(&mut inner, SessionState::Stopping);
                self.teardown(&mut inner);
                self.transition(&mut inner, SessionState::Idle);
            }
        }
    }

    /// Dispatch an asynchronous transport event into the state machine.
    ///
    /// Events from a superseded attempt, and events that do not match a
    /// defined transition for the current state, are discarded.
    pub fn handle_transport_event(&self, event: TransportEvent) {
        let mut inner = self.inner.lock();

        if event.attempt != inner.attempt {
            debug!(
                event_attempt = event.attempt,
                current_attempt = inner.attempt,
                "discarding stale transport event"
            );
            return;
        }

        match (event.kind, inner.state) {
            (TransportEventKind::ConnectionStarted { url }, SessionState::Connecting) => {
                debug!(url = %url, "connection started");
                self.emit(SessionEvent::ConnectionStarted { url });
            }
            (TransportEventKind::AuthRequired, SessionState::Connecting) => {
                self.transition(&mut inner, SessionState::Authenticating);
            }
            (
                TransportEventKind::AuthSuccess | TransportEventKind::ConnectionSuccess,
                SessionState::Connecting | SessionState::Authenticating,
            ) => {
                self.transition(&mut inner, SessionState::Live);
            }
            (
                TransportEventKind::AuthError,
                SessionState::Connecting | SessionState::Authenticating,
            ) => {
                self.fail_attempt(&mut inner, SessionError::AuthError);
            }
            (
                TransportEventKind::ConnectionFailed { reason },
                SessionState::Connecting | SessionState::Authenticating | SessionState::Live,
            ) => {
                self.fail_attempt(&mut inner, SessionError::ConnectionFailed(reason));
            }
            (TransportEventKind::Disconnected, SessionState::Live) => {
                self.fail_attempt(&mut inner, SessionError::UnexpectedDisconnect);
            }
            (TransportEventKind::Disconnected, SessionState::Stopping) => {
                self.transition(&mut inner, SessionState::Idle);
            }
            (
                TransportEventKind::BitrateMeasured { bitrate_bps },
                SessionState::Connecting | SessionState::Authenticating | SessionState::Live,
            ) => {
                inner.current_bitrate = Some(bitrate_bps);
                self.emit(SessionEvent::BitrateUpdated { bitrate_bps });
            }
            (kind, state) => {
                debug!(event = ?kind, state = state.name(), "ignoring transport event");
            }
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Last advisory estimate of the achievable send rate, if any.
    pub fn current_bitrate(&self) -> Option<u64> {
        self.inner.lock().current_bitrate
    }

    /// The most recent failure, retained until the next start attempt.
    pub fn last_error(&self) -> Option<SessionError> {
        self.inner.lock().last_error.clone()
    }

    /// Target URL of the attempt in flight, if any.
    pub fn target_url(&self) -> Option<String> {
        self.inner.lock().target_url.clone()
    }

    /// Fatal callback handling: record the error, pass through `Failed`,
    /// tear everything down, land in `Idle`.
    fn fail_attempt(&self, inner: &mut Inner, error: SessionError) {
        warn!(%error, "publish attempt failed");
        inner.attempt += 1; // supersede callbacks still in flight
        inner.last_error = Some(error.clone());
        self.transition(inner, SessionState::Failed);
        self.emit(SessionEvent::Error { error });
        self.teardown(inner);
        self.transition(inner, SessionState::Idle);
    }

    fn teardown(&self, inner: &mut Inner) {
        inner.pipeline.stop_stream();
        if inner.previewing {
            inner.pipeline.stop_preview();
            inner.previewing = false;
        }
        inner.current_bitrate = None;
        inner.target_url = None;
    }

    fn transition(&self, inner: &mut Inner, next: SessionState) {
        let previous = inner.state;
        inner.state = next;

        debug!(
            previous = previous.name(),
            current = next.name(),
            "state transition"
        );

        self.emit(SessionEvent::StateChanged {
            previous,
            current: next,
        });
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("failed to deliver session event: {}", e);
        }
    }
}

impl Drop for PublishSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn validate_url(url: &str) -> Result<(), SessionError> {
    if url.is_empty() {
        return Err(SessionError::InvalidUrl("URL is blank".to_string()));
    }
    if !url.starts_with("rtmp://") && !url.starts_with("rtmps://") {
        return Err(SessionError::InvalidUrl(
            "URL must start with rtmp:// or rtmps://".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crossbeam_channel::Receiver;
    use parking_lot::Mutex;

    use livepush_ipc::{AudioConfig, VideoConfig};
    use livepush_transport::{TransportError, TransportResult};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        PrepareVideo,
        PrepareAudio,
        StartPreview,
        StopPreview,
        StartStream { url: String, attempt: u64 },
        StopStream,
    }

    /// Pipeline double that records calls and fails on demand.
    #[derive(Default)]
    struct FakePipeline {
        calls: Arc<Mutex<Vec<Call>>>,
        reject_video: bool,
        reject_audio: bool,
        fail_start: bool,
    }

    impl Pipeline for FakePipeline {
        fn prepare_video(&mut self, _config: &VideoConfig) -> bool {
            self.calls.lock().push(Call::PrepareVideo);
            !self.reject_video
        }

        fn prepare_audio(&mut self, _config: &AudioConfig) -> bool {
            self.calls.lock().push(Call::PrepareAudio);
            !self.reject_audio
        }

        fn start_preview(&mut self) {
            self.calls.lock().push(Call::StartPreview);
        }

        fn stop_preview(&mut self) {
            self.calls.lock().push(Call::StopPreview);
        }

        fn start_stream(&mut self, url: &str, attempt: u64) -> TransportResult<()> {
            self.calls.lock().push(Call::StartStream {
                url: url.to_string(),
                attempt,
            });
            if self.fail_start {
                Err(TransportError::Connection("dial failed".to_string()))
            } else {
                Ok(())
            }
        }

        fn stop_stream(&mut self) {
            self.calls.lock().push(Call::StopStream);
        }
    }

    struct Harness {
        session: PublishSession,
        events: Receiver<SessionEvent>,
        calls: Arc<Mutex<Vec<Call>>>,
    }

    fn harness() -> Harness {
        harness_with(FakePipeline::default())
    }

    fn harness_with(fake: FakePipeline) -> Harness {
        let calls = Arc::clone(&fake.calls);
        let (event_tx, events) = livepush_ipc::event_channel();
        let session = PublishSession::new(Box::new(fake), event_tx);
        Harness {
            session,
            events,
            calls,
        }
    }

    fn deliver(h: &Harness, kind: TransportEventKind) {
        let attempt = h.session.inner.lock().attempt;
        h.session.handle_transport_event(TransportEvent { attempt, kind });
    }

    fn deliver_with_attempt(h: &Harness, attempt: u64, kind: TransportEventKind) {
        h.session.handle_transport_event(TransportEvent { attempt, kind });
    }

    fn config() -> StreamConfig {
        StreamConfig::for_url("rtmp://host/app/key")
    }

    fn calls(h: &Harness) -> Vec<Call> {
        h.calls.lock().clone()
    }

    fn drain_edges(h: &Harness) -> Vec<(SessionState, SessionState)> {
        let mut edges = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let SessionEvent::StateChanged { previous, current } = event {
                edges.push((previous, current));
            }
        }
        edges
    }

    #[test]
    fn test_permissions_granted_starts_preview() {
        let h = harness();

        h.session.permissions_granted(true, true).unwrap();

        assert_eq!(h.session.state(), SessionState::PreviewOnly);
        assert!(calls(&h).contains(&Call::StartPreview));
    }

    #[test]
    fn test_permissions_denied_stays_idle() {
        let h = harness();

        let result = h.session.permissions_granted(true, false);

        assert_eq!(result, Err(SessionError::PermissionDenied));
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.session.last_error(), Some(SessionError::PermissionDenied));
        assert!(calls(&h).is_empty());
    }

    #[test]
    fn test_start_reaches_live_on_connection_success() {
        let h = harness();

        h.session.permissions_granted(true, true).unwrap();
        h.session.start(config()).unwrap();
        assert_eq!(h.session.state(), SessionState::Connecting);

        deliver(&h, TransportEventKind::ConnectionSuccess);

        assert_eq!(h.session.state(), SessionState::Live);
        assert_eq!(h.session.last_error(), None);
        assert_eq!(
            drain_edges(&h),
            vec![
                (SessionState::Idle, SessionState::PreviewOnly),
                (SessionState::PreviewOnly, SessionState::Preparing),
                (SessionState::Preparing, SessionState::Connecting),
                (SessionState::Connecting, SessionState::Live),
            ]
        );
    }

    #[test]
    fn test_start_with_blank_url_reports_invalid_url() {
        let h = harness();
        h.session.permissions_granted(true, true).unwrap();

        let result = h.session.start(StreamConfig::for_url("   "));

        assert!(matches!(result, Err(SessionError::InvalidUrl(_))));
        assert_eq!(h.session.state(), SessionState::PreviewOnly);
        assert!(matches!(
            h.session.last_error(),
            Some(SessionError::InvalidUrl(_))
        ));
        // Validation happens before the pipeline is touched
        assert_eq!(calls(&h), vec![Call::StartPreview]);
    }

    #[test]
    fn test_start_with_malformed_url_reports_invalid_url() {
        let h = harness();

        let result = h.session.start(StreamConfig::for_url("http://host/app/key"));

        assert!(matches!(result, Err(SessionError::InvalidUrl(_))));
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[test]
    fn test_start_while_active_reports_already_active() {
        let h = harness();
        h.session.start(config()).unwrap();

        let result = h.session.start(config());

        assert_eq!(result, Err(SessionError::AlreadyActive));
        assert_eq!(h.session.state(), SessionState::Connecting);
        // The running attempt is untouched: no error recorded, one start_stream call
        assert_eq!(h.session.last_error(), None);
        let stream_starts = calls(&h)
            .iter()
            .filter(|c| matches!(c, Call::StartStream { .. }))
            .count();
        assert_eq!(stream_starts, 1);

        deliver(&h, TransportEventKind::ConnectionSuccess);
        let result = h.session.start(config());
        assert_eq!(result, Err(SessionError::AlreadyActive));
        assert_eq!(h.session.state(), SessionState::Live);
    }

    #[test]
    fn test_prepare_failure_returns_to_preview() {
        let h = harness_with(FakePipeline {
            reject_video: true,
            ..FakePipeline::default()
        });
        h.session.permissions_granted(true, true).unwrap();

        let result = h.session.start(config());

        assert_eq!(result, Err(SessionError::PrepareFailed));
        assert_eq!(h.session.state(), SessionState::PreviewOnly);
        assert_eq!(h.session.last_error(), Some(SessionError::PrepareFailed));
        // No network attempt was made
        assert!(!calls(&h)
            .iter()
            .any(|c| matches!(c, Call::StartStream { .. })));
    }

    #[test]
    fn test_prepare_failure_from_idle_returns_to_idle() {
        let h = harness_with(FakePipeline {
            reject_audio: true,
            ..FakePipeline::default()
        });

        let result = h.session.start(config());

        assert_eq!(result, Err(SessionError::PrepareFailed));
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[test]
    fn test_auth_flow_reaches_live() {
        let h = harness();
        h.session.start(config()).unwrap();

        deliver(&h, TransportEventKind::AuthRequired);
        assert_eq!(h.session.state(), SessionState::Authenticating);

        deliver(&h, TransportEventKind::AuthSuccess);
        assert_eq!(h.session.state(), SessionState::Live);
    }

    #[test]
    fn test_auth_error_tears_down_to_idle() {
        let h = harness();
        h.session.start(config()).unwrap();
        deliver(&h, TransportEventKind::AuthRequired);

        deliver(&h, TransportEventKind::AuthError);

        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.session.last_error(), Some(SessionError::AuthError));
        assert!(calls(&h).contains(&Call::StopStream));
    }

    #[test]
    fn test_connection_failed_while_live_tears_down() {
        let h = harness();
        h.session.start(config()).unwrap();
        deliver(&h, TransportEventKind::ConnectionSuccess);

        deliver(
            &h,
            TransportEventKind::ConnectionFailed {
                reason: "timeout".to_string(),
            },
        );

        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(
            h.session.last_error(),
            Some(SessionError::ConnectionFailed("timeout".to_string()))
        );
        assert!(calls(&h).contains(&Call::StopStream));
    }

    #[test]
    fn test_unexpected_disconnect_fails_attempt() {
        let h = harness();
        h.session.start(config()).unwrap();
        deliver(&h, TransportEventKind::ConnectionSuccess);

        deliver(&h, TransportEventKind::Disconnected);

        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(
            h.session.last_error(),
            Some(SessionError::UnexpectedDisconnect)
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        let h = harness();

        h.session.stop();
        assert_eq!(h.session.state(), SessionState::Idle);

        h.session.permissions_granted(true, true).unwrap();
        h.session.start(config()).unwrap();
        deliver(&h, TransportEventKind::ConnectionSuccess);

        h.session.stop();
        h.session.stop();
        h.session.stop();
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[test]
    fn test_stop_from_preview_stops_preview() {
        let h = harness();
        h.session.permissions_granted(true, true).unwrap();

        h.session.stop();

        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(calls(&h).contains(&Call::StopPreview));
    }

    #[test]
    fn test_stale_success_after_stop_is_discarded() {
        let h = harness();
        h.session.start(config()).unwrap();
        let attempt = h.session.inner.lock().attempt;

        h.session.stop();
        deliver_with_attempt(&h, attempt, TransportEventKind::ConnectionSuccess);

        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[test]
    fn test_stale_failure_after_restart_is_discarded() {
        let h = harness();
        h.session.start(config()).unwrap();
        let first_attempt = h.session.inner.lock().attempt;
        h.session.stop();
        h.session.start(config()).unwrap();

        deliver_with_attempt(
            &h,
            first_attempt,
            TransportEventKind::ConnectionFailed {
                reason: "late".to_string(),
            },
        );

        assert_eq!(h.session.state(), SessionState::Connecting);
        assert_eq!(h.session.last_error(), None);
    }

    #[test]
    fn test_bitrate_updates_are_advisory() {
        let h = harness();
        h.session.start(config()).unwrap();
        deliver(&h, TransportEventKind::ConnectionSuccess);

        deliver(
            &h,
            TransportEventKind::BitrateMeasured {
                bitrate_bps: 1_500_000,
            },
        );

        assert_eq!(h.session.state(), SessionState::Live);
        assert_eq!(h.session.current_bitrate(), Some(1_500_000));
    }

    #[test]
    fn test_bitrate_cleared_after_teardown() {
        let h = harness();
        h.session.start(config()).unwrap();
        deliver(&h, TransportEventKind::ConnectionSuccess);
        deliver(
            &h,
            TransportEventKind::BitrateMeasured {
                bitrate_bps: 900_000,
            },
        );

        h.session.stop();

        assert_eq!(h.session.current_bitrate(), None);
    }

    #[test]
    fn test_connection_started_is_informational() {
        let h = harness();
        h.session.start(config()).unwrap();
        let edges_before = drain_edges(&h);

        deliver(
            &h,
            TransportEventKind::ConnectionStarted {
                url: "rtmp://host/app/key".to_string(),
            },
        );

        assert_eq!(h.session.state(), SessionState::Connecting);
        assert!(drain_edges(&h).is_empty());
        assert_eq!(
            edges_before,
            vec![
                (SessionState::Idle, SessionState::Preparing),
                (SessionState::Preparing, SessionState::Connecting),
            ]
        );
    }

    #[test]
    fn test_start_failure_when_transport_rejects_dial() {
        let h = harness_with(FakePipeline {
            fail_start: true,
            ..FakePipeline::default()
        });

        let result = h.session.start(config());

        assert!(matches!(result, Err(SessionError::ConnectionFailed(_))));
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(matches!(
            h.session.last_error(),
            Some(SessionError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_start_clears_previous_error() {
        let h = harness();
        h.session.start(config()).unwrap();
        deliver(
            &h,
            TransportEventKind::ConnectionFailed {
                reason: "timeout".to_string(),
            },
        );
        assert!(h.session.last_error().is_some());

        h.session.start(config()).unwrap();

        assert_eq!(h.session.last_error(), None);
        assert_eq!(h.session.state(), SessionState::Connecting);
    }

    #[test]
    fn test_events_only_follow_defined_edges() {
        const ALLOWED: &[(SessionState, SessionState)] = &[
            (SessionState::Idle, SessionState::PreviewOnly),
            (SessionState::Idle, SessionState::Preparing),
            (SessionState::PreviewOnly, SessionState::Preparing),
            (SessionState::Preparing, SessionState::Connecting),
            (SessionState::Preparing, SessionState::Idle),
            (SessionState::Preparing, SessionState::PreviewOnly),
            (SessionState::Connecting, SessionState::Authenticating),
            (SessionState::Connecting, SessionState::Live),
            (SessionState::Authenticating, SessionState::Live),
            (SessionState::Connecting, SessionState::Failed),
            (SessionState::Authenticating, SessionState::Failed),
            (SessionState::Live, SessionState::Failed),
            (SessionState::Failed, SessionState::Idle),
            (SessionState::Connecting, SessionState::Stopping),
            (SessionState::Authenticating, SessionState::Stopping),
            (SessionState::Live, SessionState::Stopping),
            (SessionState::Stopping, SessionState::Idle),
            (SessionState::PreviewOnly, SessionState::Idle),
        ];

        let h = harness();

        // A scripted run exercising every kind of transition, including
        // rejected requests and stale events.
        h.session.permissions_granted(true, true).unwrap();
        let _ = h.session.start(StreamConfig::for_url(""));
        h.session.start(config()).unwrap();
        let _ = h.session.start(config());
        deliver(&h, TransportEventKind::AuthRequired);
        deliver(&h, TransportEventKind::AuthSuccess);
        deliver(
            &h,
            TransportEventKind::BitrateMeasured {
                bitrate_bps: 800_000,
            },
        );
        deliver(
            &h,
            TransportEventKind::ConnectionFailed {
                reason: "timeout".to_string(),
            },
        );
        h.session.start(config()).unwrap();
        let stale = h.session.inner.lock().attempt - 1;
        deliver_with_attempt(&h, stale, TransportEventKind::Disconnected);
        h.session.stop();
        h.session.stop();

        for edge in drain_edges(&h) {
            assert!(ALLOWED.contains(&edge), "unexpected transition {edge:?}");
        }
        assert_eq!(h.session.state(), SessionState::Idle);
    }
}
