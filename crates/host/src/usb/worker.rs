//! USB event loop thread
//!
//! Dedicated thread that pumps library events and client events for the
//! driver and answers commands from the Tokio runtime. Commands are checked
//! without blocking at the top of every iteration so a shutdown request is
//! seen within one pair of event timeouts.

use crate::usb::backend::{ClientHandle, HostError, UsbHost};
use crate::usb::client::ClientEventHandler;
use crate::usb::session::DeviceSession;
use common::{DriverCommand, DriverStatus, DriverWorker, EventQueue};
use parking_lot::Mutex;
use protocol::MidiEvent;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Back-off after a failing library event call
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Timeouts for one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTimeouts {
    pub host_events: Duration,
    pub client_events: Duration,
    /// Client events handled per iteration before checking commands again
    pub max_client_events: usize,
}

impl Default for LoopTimeouts {
    fn default() -> Self {
        Self {
            host_events: Duration::from_millis(10),
            client_events: Duration::from_millis(10),
            max_client_events: 5,
        }
    }
}

/// The driver's event loop
pub struct EventLoop<H: UsbHost> {
    host: Arc<H>,
    client: ClientHandle,
    handler: ClientEventHandler<H>,
    session: Arc<Mutex<DeviceSession>>,
    queue: EventQueue<MidiEvent>,
    worker: DriverWorker,
    timeouts: LoopTimeouts,
    running: Arc<AtomicBool>,
}

impl<H: UsbHost> EventLoop<H> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: Arc<H>,
        client: ClientHandle,
        handler: ClientEventHandler<H>,
        session: Arc<Mutex<DeviceSession>>,
        queue: EventQueue<MidiEvent>,
        worker: DriverWorker,
        timeouts: LoopTimeouts,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            host,
            client,
            handler,
            session,
            queue,
            worker,
            timeouts,
            running,
        }
    }

    /// Run until a Shutdown command arrives or `running` is cleared
    ///
    /// On exit `running` is cleared so the transfer pump stops as well.
    pub fn run(self) {
        info!("USB MIDI event loop started");

        while self.running.load(Ordering::Acquire) {
            match self.worker.try_recv_command() {
                Some(DriverCommand::Shutdown) => {
                    info!("USB MIDI event loop shutting down");
                    break;
                }
                Some(DriverCommand::Status { response }) => {
                    let _ = response.send(self.status());
                }
                None => {}
            }

            self.pump_lib_events();
            self.pump_client_events();
        }

        self.running.store(false, Ordering::Release);
        info!("USB MIDI event loop stopped");
    }

    fn pump_lib_events(&self) {
        match self.host.handle_lib_events(self.timeouts.host_events) {
            Ok(flags) => {
                if flags.no_clients {
                    info!("No more clients registered");
                }
                if flags.all_free {
                    info!("All devices freed");
                }
            }
            Err(HostError::Timeout) | Err(HostError::Interrupted) => {}
            Err(e) => {
                warn!(op = "handle_lib_events", code = e.code(), "{}", e);
                std::thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    fn pump_client_events(&self) {
        let mut wait = self.timeouts.client_events;

        for _ in 0..self.timeouts.max_client_events.max(1) {
            match self.host.next_client_event(self.client, wait) {
                Ok(event) => {
                    debug!("Client event: {:?}", event);
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        self.handler.handle(event)
                    }));
                    match result {
                        Ok(notes) => {
                            for note in notes {
                                self.worker.publish(note);
                            }
                        }
                        Err(e) => error!("Panic in client event handler: {:?}", e),
                    }
                }
                Err(HostError::Timeout) => return,
                Err(e) => {
                    warn!(op = "handle_client_events", code = e.code(), "{}", e);
                    return;
                }
            }
            wait = Duration::ZERO;
        }
    }

    fn status(&self) -> DriverStatus {
        let session = self.session.lock();
        DriverStatus {
            state: session.state().to_string(),
            device: session.device().map(|d| d.0),
            interface_claimed: session.is_claimed(),
            ready: session.is_ready(),
            queued_events: self.queue.len(),
            dropped_events: self.queue.dropped(),
        }
    }
}

/// Spawn the event loop thread
pub fn spawn_event_loop<H: UsbHost>(event_loop: EventLoop<H>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-midi-host".to_string())
        .spawn(move || event_loop.run())
}
