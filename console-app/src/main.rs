//! Console host for the livepush publisher.
//!
//! Wires an RTMP pipeline to a publish session, drives start/stop from
//! stdin commands, and renders session events as status lines.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::thread;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::Receiver;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livepush_ipc::{SessionError, SessionEvent, SessionState, StreamConfig};
use livepush_session::spawn_session;
use livepush_transport::{transport_event_channel, RtmpPipeline};

/// Publish a camera/microphone A/V stream to an RTMP server.
#[derive(Debug, Parser)]
#[command(name = "livepush")]
struct Args {
    /// Destination URL (e.g. rtmp://host/app/streamkey).
    url: Option<String>,

    /// Path to a JSON stream configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Initialize logging.
fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "livepush=info,livepush_session=debug,livepush_transport=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str(&raw).context("parsing config file")?
        }
        None => StreamConfig::default(),
    };

    if let Some(url) = &args.url {
        config.url = url.clone();
    }

    Ok(config)
}

/// Render a session event as a status line, if it warrants one.
fn status_line(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::StateChanged { current, .. } => Some(
            match current {
                SessionState::Idle => "Status: Idle",
                SessionState::PreviewOnly => "Status: Preview started",
                SessionState::Preparing => "Status: Preparing...",
                SessionState::Connecting => "Status: Connecting...",
                SessionState::Authenticating => "Status: Authenticating...",
                SessionState::Live => "Status: LIVE",
                SessionState::Stopping => "Status: Stopping...",
                SessionState::Failed => "Status: Failed",
            }
            .to_string(),
        ),
        SessionEvent::ConnectionStarted { url } => Some(format!("Status: Connecting to {url}")),
        SessionEvent::BitrateUpdated { bitrate_bps } => {
            Some(format!("Bitrate: {} kbps", bitrate_bps / 1000))
        }
        SessionEvent::Error { error } => Some(match error {
            SessionError::PermissionDenied => "Status: Missing permissions".to_string(),
            SessionError::InvalidUrl(_) => "Status: Please enter a valid RTMP URL".to_string(),
            SessionError::PrepareFailed => "Status: Prepare encoder failed".to_string(),
            SessionError::AuthError => "Status: Auth error".to_string(),
            SessionError::ConnectionFailed(reason) => format!("Status: Failed - {reason}"),
            SessionError::UnexpectedDisconnect => "Status: Disconnected".to_string(),
            SessionError::AlreadyActive => "Status: Already streaming".to_string(),
        }),
    }
}

/// Re-dispatch session events onto the console's own output context.
fn spawn_status_printer(events: Receiver<SessionEvent>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for event in events {
            if let Some(line) = status_line(&event) {
                println!("{line}");
            }
        }
    })
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let args = Args::parse();
    let config = load_config(&args)?;

    let (transport_tx, transport_rx) = transport_event_channel();
    let pipeline = RtmpPipeline::new(transport_tx);
    let (session, observer_rx, mut pump) = spawn_session(Box::new(pipeline), transport_rx);

    let printer = spawn_status_printer(observer_rx);

    // The console host has no OS permission prompt to run
    session.permissions_granted(true, true)?;

    println!("Commands: start | stop | quit");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        match line.trim() {
            "start" => {
                if let Err(error) = session.start(config.clone()) {
                    eprintln!("start rejected: {error}");
                }
            }
            "stop" => session.stop(),
            "quit" | "exit" => break,
            "" => {}
            other => eprintln!("unknown command: {other}"),
        }
    }

    info!("shutting down");
    session.stop();
    pump.shutdown();
    drop(session);
    let _ = printer.join();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lines_mirror_session_events() {
        let live = SessionEvent::StateChanged {
            previous: SessionState::Connecting,
            current: SessionState::Live,
        };
        assert_eq!(status_line(&live).unwrap(), "Status: LIVE");

        let failed = SessionEvent::Error {
            error: SessionError::ConnectionFailed("timeout".to_string()),
        };
        assert_eq!(status_line(&failed).unwrap(), "Status: Failed - timeout");

        let bitrate = SessionEvent::BitrateUpdated {
            bitrate_bps: 2_500_000,
        };
        assert_eq!(status_line(&bitrate).unwrap(), "Bitrate: 2500 kbps");
    }
}
