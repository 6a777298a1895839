//! IN transfer completion handling
//!
//! Completed transfers come back over a crossbeam channel and are handled
//! one at a time on the transfer pump thread. For each one the handler:
//!
//! 1. gives the gate back to consumers,
//! 2. drops transfers of a device that is no longer current,
//! 3. drops failed or non-IN transfers without resubmitting them,
//! 4. decodes the packets into the event queue (dropping on overflow),
//! 5. blocks until the gate is available again,
//! 6. resubmits the same transfer.

use crate::usb::backend::{SubmitError, Transfer, TransferStatus, UsbHost};
use crate::usb::session::DeviceSession;
use common::{EventQueue, Gate};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use protocol::{MidiEvent, decode_packets};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// How often the pump checks for shutdown while idle
const PUMP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What happened to one completed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Belonged to a device that is no longer current
    Stale,
    /// Failed or not an IN transfer; not resubmitted
    Dropped(TransferStatus),
    /// Decoded and handed back to the host
    Resubmitted { queued: usize, lost: usize },
    /// Decoded, but the host refused it back; the pipe is idle
    ResubmitFailed { queued: usize, lost: usize },
}

/// Runs the completion steps for IN transfers
pub struct TransferHandler<H: UsbHost> {
    host: Arc<H>,
    session: Arc<Mutex<DeviceSession>>,
    queue: EventQueue<MidiEvent>,
    gate: Gate,
}

impl<H: UsbHost> TransferHandler<H> {
    pub fn new(
        host: Arc<H>,
        session: Arc<Mutex<DeviceSession>>,
        queue: EventQueue<MidiEvent>,
        gate: Gate,
    ) -> Self {
        Self {
            host,
            session,
            queue,
            gate,
        }
    }

    pub fn on_complete(&self, transfer: Transfer) -> Completion {
        self.gate.release();

        let current = self.session.lock().device();
        if transfer.device() != current {
            debug!(
                "Transfer {:?} belongs to {:?}, current device is {:?}; dropped",
                transfer.id(),
                transfer.device(),
                current
            );
            return Completion::Stale;
        }

        if transfer.status() != TransferStatus::Completed || !transfer.is_in() {
            info!(
                op = "transfer_complete",
                code = transfer.status().code(),
                "Transfer on endpoint {:#04x} ended with {:?}; not resubmitted",
                transfer.endpoint(),
                transfer.status()
            );
            return Completion::Dropped(transfer.status());
        }

        let mut queued = 0;
        let mut lost = 0;
        for event in decode_packets(transfer.data()) {
            trace!("{}", event);
            if self.queue.push(event) {
                queued += 1;
            } else {
                lost += 1;
            }
        }
        if lost > 0 {
            warn!("MIDI queue full, {} events dropped", lost);
        }

        self.gate.acquire(None);

        match self.host.transfer_submit(transfer) {
            Ok(()) => Completion::Resubmitted { queued, lost },
            Err(SubmitError { error, transfer }) => {
                warn!(
                    op = "transfer_submit",
                    code = error.code(),
                    "Resubmitting IN transfer failed: {}",
                    error
                );
                if self.session.lock().park_in_transfer(transfer).is_some() {
                    debug!("Refused transfer no longer has a slot, released");
                }
                Completion::ResubmitFailed { queued, lost }
            }
        }
    }
}

/// Run `handler` on every completion until `running` is cleared
pub fn run_transfer_pump<H: UsbHost>(
    handler: TransferHandler<H>,
    completions: Receiver<Transfer>,
    running: Arc<AtomicBool>,
) {
    debug!("Transfer pump started");

    while running.load(Ordering::Acquire) {
        match completions.recv_timeout(PUMP_POLL_INTERVAL) {
            Ok(transfer) => {
                let outcome = handler.on_complete(transfer);
                trace!("Transfer completion: {:?}", outcome);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("Transfer pump stopped");
}

/// Spawn the transfer pump on its own thread
pub fn spawn_transfer_pump<H: UsbHost>(
    handler: TransferHandler<H>,
    completions: Receiver<Transfer>,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-midi-xfer".to_string())
        .spawn(move || run_transfer_pump(handler, completions, running))
}
