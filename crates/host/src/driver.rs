//! Driver lifecycle
//!
//! The driver goes through three stages, each consuming the previous one:
//!
//! ```text
//! MidiDriver::install ──> InstalledDriver ──register_client──> RegisteredDriver
//!                                                  ──start_event_loop──> RunningDriver
//! ```
//!
//! Installing creates the event queue and the gate, so a consumer can hold
//! its [`MidiEvents`] handle before any device shows up.

use crate::usb::backend::{ClientConfig, ClientHandle, HostError, HostResult, UsbHost};
use crate::usb::client::ClientEventHandler;
use crate::usb::session::DeviceSession;
use crate::usb::transfers::{TransferHandler, spawn_transfer_pump};
use crate::usb::worker::{EventLoop, LoopTimeouts, spawn_event_loop};
use common::{DEFAULT_QUEUE_CAPACITY, DriverWorker, EventQueue, Gate, GateGuard};
use parking_lot::Mutex;
use protocol::MidiEvent;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunables for one driver instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    /// Capacity of the MIDI event queue
    pub queue_capacity: usize,
    /// IN transfers kept in flight per device
    pub in_transfers: usize,
    /// Depth of the host's client event queue
    pub max_client_events: usize,
    pub host_event_timeout: Duration,
    pub client_event_timeout: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            in_transfers: 1,
            max_client_events: 5,
            host_event_timeout: Duration::from_millis(10),
            client_event_timeout: Duration::from_millis(10),
        }
    }
}

/// Consumer side of the driver: decoded events plus the gate
#[derive(Clone)]
pub struct MidiEvents {
    queue: EventQueue<MidiEvent>,
    gate: Gate,
}

impl MidiEvents {
    /// Next event in arrival order, waiting up to `wait`
    pub fn try_pop(&self, wait: Duration) -> Option<MidiEvent> {
        self.queue.try_pop(wait)
    }

    /// Everything queued right now
    pub fn drain(&self) -> Vec<MidiEvent> {
        self.queue.drain()
    }

    /// Take the gate, keeping the transfer pump from resubmitting
    ///
    /// `None` waits indefinitely.
    pub fn acquire_gate(&self, wait: Option<Duration>) -> bool {
        self.gate.acquire(wait)
    }

    pub fn release_gate(&self) {
        self.gate.release();
    }

    /// Hold the gate for the lifetime of the returned guard
    pub fn exclusive(&self, wait: Option<Duration>) -> Option<GateGuard<'_>> {
        self.gate.exclusive(wait)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Events lost to a full queue since install
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Entry point of the lifecycle
pub struct MidiDriver;

impl MidiDriver {
    /// Take ownership of an installed host stack and create the queue and gate
    pub fn install<H: UsbHost>(host: H, settings: DriverSettings) -> HostResult<InstalledDriver<H>> {
        if settings.queue_capacity == 0 || settings.in_transfers == 0 {
            return Err(HostError::InvalidParam);
        }

        let events = MidiEvents {
            queue: EventQueue::new(settings.queue_capacity),
            gate: Gate::new(),
        };
        info!(
            "USB MIDI driver installed (queue {}, {} IN transfers)",
            settings.queue_capacity, settings.in_transfers
        );

        Ok(InstalledDriver {
            host: Arc::new(host),
            settings,
            events,
        })
    }
}

pub struct InstalledDriver<H: UsbHost> {
    host: Arc<H>,
    settings: DriverSettings,
    events: MidiEvents,
}

impl<H: UsbHost> InstalledDriver<H> {
    pub fn events(&self) -> MidiEvents {
        self.events.clone()
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    /// Register the driver's single client with the host
    pub fn register_client(self) -> HostResult<RegisteredDriver<H>> {
        let config = ClientConfig {
            max_event_messages: self.settings.max_client_events,
        };
        let client = self.host.register_client(&config)?;
        debug!("Registered client {:?}", client);

        Ok(RegisteredDriver {
            host: self.host,
            settings: self.settings,
            events: self.events,
            client,
        })
    }
}

pub struct RegisteredDriver<H: UsbHost> {
    host: Arc<H>,
    settings: DriverSettings,
    events: MidiEvents,
    client: ClientHandle,
}

impl<H: UsbHost> RegisteredDriver<H> {
    pub fn client(&self) -> ClientHandle {
        self.client
    }

    pub fn events(&self) -> MidiEvents {
        self.events.clone()
    }

    /// Spawn the event loop and the transfer pump
    ///
    /// `worker` is the USB-thread end of the driver bridge; commands sent
    /// on the matching `DriverBridge` reach the event loop.
    pub fn start_event_loop(self, worker: DriverWorker) -> std::io::Result<RunningDriver> {
        let session = Arc::new(Mutex::new(DeviceSession::new(
            self.client,
            self.settings.in_transfers,
        )));
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let handler = TransferHandler::new(
            Arc::clone(&self.host),
            Arc::clone(&session),
            self.events.queue.clone(),
            self.events.gate.clone(),
        );
        let transfer_pump = spawn_transfer_pump(handler, completion_rx, Arc::clone(&running))?;

        let event_loop = EventLoop::new(
            Arc::clone(&self.host),
            self.client,
            ClientEventHandler::new(Arc::clone(&self.host), Arc::clone(&session), completion_tx),
            Arc::clone(&session),
            self.events.queue.clone(),
            worker,
            LoopTimeouts {
                host_events: self.settings.host_event_timeout,
                client_events: self.settings.client_event_timeout,
                max_client_events: self.settings.max_client_events,
            },
            Arc::clone(&running),
        );
        let event_loop = match spawn_event_loop(event_loop) {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::Release);
                let _ = transfer_pump.join();
                return Err(e);
            }
        };

        Ok(RunningDriver {
            event_loop,
            transfer_pump,
            events: self.events,
            session,
            running,
        })
    }
}

/// A driver whose threads are running
pub struct RunningDriver {
    event_loop: JoinHandle<()>,
    transfer_pump: JoinHandle<()>,
    events: MidiEvents,
    session: Arc<Mutex<DeviceSession>>,
    running: Arc<AtomicBool>,
}

impl RunningDriver {
    pub fn events(&self) -> MidiEvents {
        self.events.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the current device has both transfers provisioned
    pub fn is_ready(&self) -> bool {
        self.session.lock().is_ready()
    }

    pub fn session(&self) -> &Arc<Mutex<DeviceSession>> {
        &self.session
    }

    /// Ask both threads to stop without going through the bridge
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Wait for both threads to finish
    ///
    /// The transfer pump can sit in step 5 waiting for the gate; the gate
    /// is given once more so it can wind down.
    pub fn join(self) {
        if self.event_loop.join().is_err() {
            warn!("Event loop thread panicked");
        }
        self.running.store(false, Ordering::Release);
        self.events.release_gate();
        if self.transfer_pump.join().is_err() {
            warn!("Transfer pump thread panicked");
        }
        debug!("USB MIDI driver stopped");
    }
}
