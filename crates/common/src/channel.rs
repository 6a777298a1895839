//! Async channel bridge between Tokio runtime and USB thread

use async_channel::{Receiver, Sender, bounded};

/// Snapshot of the driver, answered by the USB thread
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStatus {
    /// Session state name (idle, device-opened, interface-claimed, ready)
    pub state: String,
    /// Current device handle, if a device was opened
    pub device: Option<u32>,
    pub interface_claimed: bool,
    pub ready: bool,
    /// Events waiting in the MIDI queue
    pub queued_events: usize,
    /// Events dropped on a full queue
    pub dropped_events: u64,
}

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum DriverCommand {
    /// Report the current driver status
    Status {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<DriverStatus>,
    },

    /// Stop the event loop
    Shutdown,
}

/// Notifications from the USB thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// A device was announced and opened
    DeviceOpened {
        /// Host-assigned device handle
        device: u32,
    },

    /// Both IN and OUT transfers are provisioned
    MidiReady {
        /// Host-assigned device handle
        device: u32,
    },

    /// The configuration descriptor could not be used
    DescriptorRejected {
        /// Host-assigned device handle
        device: u32,
        /// Human-readable reason
        reason: String,
    },

    /// The host reported the device as removed
    DeviceGone {
        /// Host-assigned device handle
        device: u32,
    },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct DriverBridge {
    cmd_tx: Sender<DriverCommand>,
    event_rx: Receiver<DriverEvent>,
}

impl DriverBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: DriverCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Ask the USB thread for its status
    pub async fn status(&self) -> crate::Result<DriverStatus> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send_command(DriverCommand::Status { response: tx })
            .await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<DriverEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send a command from a blocking context
    pub fn send_command_blocking(&self, cmd: DriverCommand) -> crate::Result<()> {
        self.cmd_tx
            .send_blocking(cmd)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for USB thread (blocking)
pub struct DriverWorker {
    pub(crate) cmd_rx: Receiver<DriverCommand>,
    pub(crate) event_tx: Sender<DriverEvent>,
}

impl DriverWorker {
    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<DriverCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Publish an event without blocking
    ///
    /// Events are informational; when nobody drains them they are dropped.
    pub fn publish(&self, event: DriverEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::trace!("Driver event not delivered: {}", e);
        }
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (DriverBridge for Tokio, DriverWorker for USB thread)
pub fn create_driver_bridge() -> (DriverBridge, DriverWorker) {
    let (cmd_tx, cmd_rx) = bounded(16);
    let (event_tx, event_rx) = bounded(64);

    (
        DriverBridge { cmd_tx, event_rx },
        DriverWorker { cmd_rx, event_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_round_trip() {
        let (bridge, worker) = create_driver_bridge();

        let handle = std::thread::spawn(move || {
            loop {
                if let Some(DriverCommand::Status { response }) = worker.try_recv_command() {
                    let _ = response.send(DriverStatus {
                        state: "idle".to_string(),
                        ..Default::default()
                    });
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        });

        let status = bridge.status().await.unwrap();
        assert_eq!(status.state, "idle");
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_events_flow_to_tokio() {
        let (bridge, worker) = create_driver_bridge();
        worker.publish(DriverEvent::MidiReady { device: 3 });

        let event = bridge.recv_event().await.unwrap();
        assert_eq!(event, DriverEvent::MidiReady { device: 3 });
    }
}
