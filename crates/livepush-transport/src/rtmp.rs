//! RTMP publishing pipeline implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType,
};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tracing::{debug, info, trace, warn};
use url::Url;

use livepush_ipc::{AudioConfig, VideoConfig};

use crate::error::TransportError;
use crate::event::{TransportEvent, TransportEventKind};
use crate::pipeline::Pipeline;
use crate::{TransportResult, PACKET_CHANNEL_CAPACITY};

/// How long to wait for the server to accept a connect or publish
/// request before giving up on the attempt.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reporting interval for send-rate measurements.
const BITRATE_WINDOW: Duration = Duration::from_secs(1);

/// An encoded media packet ready for the wire, FLV-tagged by the host.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    /// Packet payload.
    pub data: Bytes,

    /// Presentation timestamp in milliseconds.
    pub timestamp_ms: u32,

    /// Whether this is a video packet.
    pub is_video: bool,

    /// Whether this is a keyframe (for video).
    pub is_keyframe: bool,
}

/// RTMP publishing pipeline.
///
/// One publish attempt per `start_stream` call: handshake, connect,
/// publish, then drain queued media packets until stopped or the
/// connection drops. There is no automatic reconnection; a failed
/// attempt is reported through the event channel and the next attempt
/// is the caller's decision.
pub struct RtmpPipeline {
    event_tx: Sender<TransportEvent>,
    runtime: Option<Runtime>,
    packet_tx: Option<Sender<MediaPacket>>,
    should_stop: Arc<AtomicBool>,
    video: Option<VideoConfig>,
    audio: Option<AudioConfig>,
    previewing: bool,
}

impl RtmpPipeline {
    /// Create a pipeline that reports events on the given channel.
    pub fn new(event_tx: Sender<TransportEvent>) -> Self {
        Self {
            event_tx,
            runtime: None,
            packet_tx: None,
            should_stop: Arc::new(AtomicBool::new(false)),
            video: None,
            audio: None,
            previewing: false,
        }
    }

    /// Sender for queuing media packets onto the active attempt, if one
    /// is running.
    pub fn packet_sender(&self) -> Option<Sender<MediaPacket>> {
        self.packet_tx.clone()
    }
}

impl Pipeline for RtmpPipeline {
    fn prepare_video(&mut self, config: &VideoConfig) -> bool {
        if !valid_video_config(config) {
            warn!(?config, "video configuration rejected");
            return false;
        }
        self.video = Some(*config);
        debug!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            bitrate_bps = config.bitrate_bps,
            "video configuration accepted"
        );
        true
    }

    fn prepare_audio(&mut self, config: &AudioConfig) -> bool {
        if !valid_audio_config(config) {
            warn!(?config, "audio configuration rejected");
            return false;
        }
        self.audio = Some(*config);
        debug!(
            bitrate_bps = config.bitrate_bps,
            sample_rate_hz = config.sample_rate_hz,
            stereo = config.stereo,
            "audio configuration accepted"
        );
        true
    }

    fn start_preview(&mut self) {
        if !self.previewing {
            self.previewing = true;
            info!("preview started");
        }
    }

    fn stop_preview(&mut self) {
        if self.previewing {
            self.previewing = false;
            info!("preview stopped");
        }
    }

    fn start_stream(&mut self, url: &str, attempt: u64) -> TransportResult<()> {
        if self.runtime.is_some() {
            return Err(TransportError::AlreadyStreaming);
        }
        if self.video.is_none() || self.audio.is_none() {
            return Err(TransportError::NotPrepared);
        }

        let target = parse_target(url)?;

        info!(url = %url, attempt, "starting publish attempt");

        let runtime = Runtime::new().map_err(TransportError::Io)?;
        let (packet_tx, packet_rx): (Sender<MediaPacket>, Receiver<MediaPacket>) =
            crossbeam_channel::bounded(PACKET_CHANNEL_CAPACITY);

        self.should_stop.store(false, Ordering::SeqCst);
        let should_stop = Arc::clone(&self.should_stop);

        let events = EventSink {
            attempt,
            tx: self.event_tx.clone(),
        };
        let url = url.to_string();

        runtime.spawn(async move {
            run_publish(target, url, events, packet_rx, should_stop).await;
        });

        self.runtime = Some(runtime);
        self.packet_tx = Some(packet_tx);

        Ok(())
    }

    fn stop_stream(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);

        // Drop the packet sender to signal shutdown
        self.packet_tx = None;

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(5));
            info!("publish attempt torn down");
        }
    }
}

impl Drop for RtmpPipeline {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

/// Emits events tagged with the attempt they belong to.
struct EventSink {
    attempt: u64,
    tx: Sender<TransportEvent>,
}

impl EventSink {
    fn emit(&self, kind: TransportEventKind) {
        let event = TransportEvent {
            attempt: self.attempt,
            kind,
        };
        if let Err(e) = self.tx.try_send(event) {
            warn!("failed to deliver transport event: {}", e);
        }
    }
}

/// Parsed publish destination.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamTarget {
    host: String,
    port: u16,
    app: String,
    key: String,
}

fn parse_target(url: &str) -> TransportResult<StreamTarget> {
    let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "rtmp" | "rtmps" => {}
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            )))
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl("missing host".to_string()))?
        .to_string();
    let port = parsed.port().unwrap_or(1935);

    let mut segments = parsed.path().trim_matches('/').splitn(2, '/');
    let app = match segments.next() {
        Some(app) if !app.is_empty() => app.to_string(),
        _ => {
            return Err(TransportError::InvalidUrl(
                "missing application name in URL path".to_string(),
            ))
        }
    };
    let key = segments.next().unwrap_or("").to_string();

    Ok(StreamTarget {
        host,
        port,
        app,
        key,
    })
}

fn valid_video_config(config: &VideoConfig) -> bool {
    config.width > 0
        && config.height > 0
        && config.fps > 0
        && config.bitrate_bps > 0
        && config.keyframe_interval_secs > 0
        && matches!(config.rotation_deg, 0 | 90 | 180 | 270)
}

fn valid_audio_config(config: &AudioConfig) -> bool {
    config.bitrate_bps > 0 && supported_sample_rate(config.sample_rate_hz)
}

fn supported_sample_rate(hz: u32) -> bool {
    matches!(
        hz,
        8_000 | 11_025 | 16_000 | 22_050 | 32_000 | 44_100 | 48_000
    )
}

/// A rejection whose description names an authorization problem maps to
/// an auth error; RTMP has no first-class auth failure signal.
fn is_auth_rejection(description: &str) -> bool {
    let lower = description.to_ascii_lowercase();
    lower.contains("auth") || lower.contains("unauthorized") || lower.contains("forbidden")
}

/// Established RTMP link in publishing mode.
struct PublishLink {
    stream: TcpStream,
    session: ClientSession,
}

/// Drives a single publish attempt from dial to teardown.
async fn run_publish(
    target: StreamTarget,
    url: String,
    events: EventSink,
    packets: Receiver<MediaPacket>,
    should_stop: Arc<AtomicBool>,
) {
    events.emit(TransportEventKind::ConnectionStarted { url });

    let mut link = match establish(&target).await {
        Ok(link) => link,
        Err(TransportError::Rejected(description)) => {
            warn!("server rejected attempt: {}", description);
            if is_auth_rejection(&description) {
                events.emit(TransportEventKind::AuthError);
            } else {
                events.emit(TransportEventKind::ConnectionFailed {
                    reason: description,
                });
            }
            return;
        }
        Err(e) => {
            warn!("publish attempt failed: {}", e);
            events.emit(TransportEventKind::ConnectionFailed {
                reason: e.to_string(),
            });
            return;
        }
    };

    info!(host = %target.host, app = %target.app, "publishing started");
    events.emit(TransportEventKind::ConnectionSuccess);

    let mut window_bytes: u64 = 0;
    let mut window_start = Instant::now();
    let mut read_buf = vec![0u8; 4096];

    loop {
        if should_stop.load(Ordering::SeqCst) {
            debug!("stop requested, leaving publish loop");
            break;
        }

        match packets.recv_timeout(Duration::from_millis(100)) {
            Ok(packet) => {
                let len = packet.data.len() as u64;
                if let Err(e) = write_packet(&mut link, &packet).await {
                    warn!("send error: {}", e);
                    events.emit(TransportEventKind::ConnectionFailed {
                        reason: e.to_string(),
                    });
                    return;
                }
                window_bytes += len;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                debug!("packet channel closed");
                break;
            }
        }

        // Surface server-initiated teardown between packets
        match link.stream.try_read(&mut read_buf) {
            Ok(0) => {
                info!("server closed the stream");
                events.emit(TransportEventKind::Disconnected);
                return;
            }
            Ok(n) => {
                if let Ok(results) = link.session.handle_input(&read_buf[..n]) {
                    for result in results {
                        if let ClientSessionResult::OutboundResponse(packet) = result {
                            if let Err(e) = link.stream.write_all(&packet.bytes).await {
                                warn!("send error: {}", e);
                                events.emit(TransportEventKind::ConnectionFailed {
                                    reason: e.to_string(),
                                });
                                return;
                            }
                        }
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("read error: {}", e);
                events.emit(TransportEventKind::ConnectionFailed {
                    reason: e.to_string(),
                });
                return;
            }
        }

        let elapsed = window_start.elapsed();
        if elapsed >= BITRATE_WINDOW {
            let bitrate_bps = ((window_bytes * 8) as f64 / elapsed.as_secs_f64()) as u64;
            events.emit(TransportEventKind::BitrateMeasured { bitrate_bps });
            window_bytes = 0;
            window_start = Instant::now();
        }
    }
}

/// Dial the server and negotiate up to accepted publishing.
async fn establish(target: &StreamTarget) -> TransportResult<PublishLink> {
    let addr = format!("{}:{}", target.host, target.port);
    debug!(host = %target.host, port = target.port, app = %target.app, "dialing RTMP server");

    let mut stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| TransportError::Connection(format!("TCP connect failed: {e}")))?;

    let leftover = handshake(&mut stream).await?;

    debug!("handshake complete, creating RTMP session");

    let config = ClientSessionConfig::new();
    let (mut session, initial_results) = ClientSession::new(config)
        .map_err(|e| TransportError::Connection(format!("session creation failed: {e:?}")))?;

    // Send initial session packets (chunk size, etc.)
    for result in initial_results {
        if let ClientSessionResult::OutboundResponse(packet) = result {
            stream
                .write_all(&packet.bytes)
                .await
                .map_err(TransportError::Io)?;
        }
    }

    if !leftover.is_empty() {
        let _ = session.handle_input(&leftover);
    }

    let request = session
        .request_connection(target.app.clone())
        .map_err(|e| TransportError::Connection(format!("connection request failed: {e:?}")))?;
    if let ClientSessionResult::OutboundResponse(packet) = request {
        stream
            .write_all(&packet.bytes)
            .await
            .map_err(TransportError::Io)?;
    }
    wait_for(&mut stream, &mut session, Milestone::ConnectionAccepted).await?;

    let request = session
        .request_publishing(target.key.clone(), PublishRequestType::Live)
        .map_err(|e| TransportError::Connection(format!("publish request failed: {e:?}")))?;
    if let ClientSessionResult::OutboundResponse(packet) = request {
        stream
            .write_all(&packet.bytes)
            .await
            .map_err(TransportError::Io)?;
    }
    wait_for(&mut stream, &mut session, Milestone::PublishAccepted).await?;

    Ok(PublishLink { stream, session })
}

/// Perform the client side of the RTMP handshake, returning any bytes
/// the server sent past it.
async fn handshake(stream: &mut TcpStream) -> TransportResult<Vec<u8>> {
    let mut handshake = Handshake::new(PeerType::Client);

    let p0_p1 = handshake
        .generate_outbound_p0_and_p1()
        .map_err(|e| TransportError::Connection(format!("handshake generation failed: {e:?}")))?;
    stream
        .write_all(&p0_p1)
        .await
        .map_err(TransportError::Io)?;

    let mut buf = vec![0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await.map_err(TransportError::Io)?;
        if n == 0 {
            return Err(TransportError::Connection(
                "connection closed during handshake".to_string(),
            ));
        }

        match handshake.process_bytes(&buf[..n]) {
            Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                if !response_bytes.is_empty() {
                    stream
                        .write_all(&response_bytes)
                        .await
                        .map_err(TransportError::Io)?;
                }
            }
            Ok(HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            }) => {
                if !response_bytes.is_empty() {
                    stream
                        .write_all(&response_bytes)
                        .await
                        .map_err(TransportError::Io)?;
                }
                return Ok(remaining_bytes);
            }
            Err(e) => {
                return Err(TransportError::Connection(format!(
                    "handshake failed: {e:?}"
                )))
            }
        }
    }
}

/// Negotiation milestones the server must acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Milestone {
    ConnectionAccepted,
    PublishAccepted,
}

impl Milestone {
    fn describe(self) -> &'static str {
        match self {
            Self::ConnectionAccepted => "connection acceptance",
            Self::PublishAccepted => "publish acceptance",
        }
    }
}

/// Pump the session until the server acknowledges `milestone`, rejects
/// the request, or the deadline passes.
async fn wait_for(
    stream: &mut TcpStream,
    session: &mut ClientSession,
    milestone: Milestone,
) -> TransportResult<()> {
    let deadline = Instant::now() + ACCEPT_TIMEOUT;
    let mut buf = vec![0u8; 4096];

    while Instant::now() < deadline {
        let n = match tokio::time::timeout(Duration::from_millis(250), stream.read(&mut buf)).await
        {
            Err(_) => continue,
            Ok(read) => read.map_err(TransportError::Io)?,
        };
        if n == 0 {
            return Err(TransportError::Connection(
                "connection closed by server".to_string(),
            ));
        }

        let results = session
            .handle_input(&buf[..n])
            .map_err(|e| TransportError::Connection(format!("session input error: {e:?}")))?;

        for result in results {
            match result {
                ClientSessionResult::OutboundResponse(packet) => {
                    stream
                        .write_all(&packet.bytes)
                        .await
                        .map_err(TransportError::Io)?;
                }
                ClientSessionResult::RaisedEvent(event) => match (milestone, event) {
                    (Milestone::ConnectionAccepted, ClientSessionEvent::ConnectionRequestAccepted) => {
                        debug!("connection accepted by server");
                        return Ok(());
                    }
                    (Milestone::PublishAccepted, ClientSessionEvent::PublishRequestAccepted) => {
                        debug!("publish request accepted");
                        return Ok(());
                    }
                    (_, ClientSessionEvent::ConnectionRequestRejected { description }) => {
                        return Err(TransportError::Rejected(description));
                    }
                    (_, event) => {
                        trace!("ignoring session event: {:?}", event);
                    }
                },
                _ => {}
            }
        }
    }

    Err(TransportError::Connection(format!(
        "timeout waiting for {}",
        milestone.describe()
    )))
}

async fn write_packet(link: &mut PublishLink, packet: &MediaPacket) -> TransportResult<()> {
    let timestamp = RtmpTimestamp::new(packet.timestamp_ms);

    let result = if packet.is_video {
        link.session.publish_video_data(
            packet.data.clone(),
            timestamp,
            !packet.is_keyframe, // can_be_dropped: true for non-keyframes
        )
    } else {
        link.session.publish_audio_data(
            packet.data.clone(),
            timestamp,
            false, // can_be_dropped: audio is important
        )
    };

    let session_result =
        result.map_err(|e| TransportError::Send(format!("failed to publish data: {e:?}")))?;

    if let ClientSessionResult::OutboundResponse(outbound) = session_result {
        link.stream
            .write_all(&outbound.bytes)
            .await
            .map_err(TransportError::Io)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_defaults_port() {
        let target = parse_target("rtmp://live.example.com/app/streamkey").unwrap();

        assert_eq!(target.host, "live.example.com");
        assert_eq!(target.port, 1935);
        assert_eq!(target.app, "app");
        assert_eq!(target.key, "streamkey");
    }

    #[test]
    fn test_parse_target_honors_explicit_port_and_nested_key() {
        let target = parse_target("rtmps://host:2935/live/room/secret").unwrap();

        assert_eq!(target.port, 2935);
        assert_eq!(target.app, "live");
        assert_eq!(target.key, "room/secret");
    }

    #[test]
    fn test_parse_target_allows_missing_key() {
        let target = parse_target("rtmp://host/app").unwrap();

        assert_eq!(target.app, "app");
        assert_eq!(target.key, "");
    }

    #[test]
    fn test_parse_target_rejects_bad_input() {
        assert!(matches!(
            parse_target("http://host/app/key"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_target("rtmp://host"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_target("not a url"),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_video_config_validation() {
        let good = VideoConfig::default();
        assert!(valid_video_config(&good));

        let zero_bitrate = VideoConfig {
            bitrate_bps: 0,
            ..VideoConfig::default()
        };
        assert!(!valid_video_config(&zero_bitrate));

        let zero_dims = VideoConfig {
            width: 0,
            ..VideoConfig::default()
        };
        assert!(!valid_video_config(&zero_dims));

        let odd_rotation = VideoConfig {
            rotation_deg: 45,
            ..VideoConfig::default()
        };
        assert!(!valid_video_config(&odd_rotation));
    }

    #[test]
    fn test_audio_config_validation() {
        let good = AudioConfig::default();
        assert!(valid_audio_config(&good));

        let odd_rate = AudioConfig {
            sample_rate_hz: 12_345,
            ..AudioConfig::default()
        };
        assert!(!valid_audio_config(&odd_rate));

        let zero_bitrate = AudioConfig {
            bitrate_bps: 0,
            ..AudioConfig::default()
        };
        assert!(!valid_audio_config(&zero_bitrate));
    }

    #[test]
    fn test_auth_rejection_classification() {
        assert!(is_auth_rejection("Authentication required"));
        assert!(is_auth_rejection("401 Unauthorized"));
        assert!(!is_auth_rejection("No such application"));
    }

    #[test]
    fn test_prepare_rejects_bad_configs() {
        let (tx, _rx) = crate::transport_event_channel();
        let mut pipeline = RtmpPipeline::new(tx);

        assert!(pipeline.prepare_video(&VideoConfig::default()));
        assert!(!pipeline.prepare_video(&VideoConfig {
            fps: 0,
            ..VideoConfig::default()
        }));
        assert!(pipeline.prepare_audio(&AudioConfig::default()));
    }

    #[test]
    fn test_start_stream_requires_prepared_encoders() {
        let (tx, _rx) = crate::transport_event_channel();
        let mut pipeline = RtmpPipeline::new(tx);

        assert!(matches!(
            pipeline.start_stream("rtmp://host/app/key", 1),
            Err(TransportError::NotPrepared)
        ));
    }
}
