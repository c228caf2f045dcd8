//! Background thread feeding transport events into the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, info};

use livepush_transport::TransportEvent;

use crate::session::PublishSession;

/// Drains the pipeline's event channel into the session.
///
/// This is the background actor of the concurrency model: transport
/// callbacks enter the session's lock from here, never from the
/// transport's own threads. The pump stops when shut down or when the
/// event channel disconnects, and the thread is joined on drop.
pub struct EventPump {
    thread: Option<JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
}

impl EventPump {
    /// Spawn the pump thread.
    pub fn spawn(session: Arc<PublishSession>, events: Receiver<TransportEvent>) -> Self {
        let should_stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&should_stop);

        let thread = thread::spawn(move || {
            debug!("transport event pump starting");

            loop {
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }

                match events.recv_timeout(Duration::from_millis(100)) {
                    Ok(event) => session.handle_transport_event(event),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        info!("transport event channel disconnected");
                        break;
                    }
                }
            }

            debug!("transport event pump stopped");
        });

        Self {
            thread: Some(thread),
            should_stop,
        }
    }

    /// Stop the pump and join its thread.
    pub fn shutdown(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}
