//! Client event handling

use crate::usb::backend::{ClientEvent, CompletionSender, DeviceAddress, DeviceHandle, UsbHost};
use crate::usb::enumeration::parse_configuration;
use crate::usb::session::DeviceSession;
use common::DriverEvent;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reacts to NEW_DEVICE and DEVICE_GONE for the driver's client
pub struct ClientEventHandler<H: UsbHost> {
    host: Arc<H>,
    session: Arc<Mutex<DeviceSession>>,
    completions: CompletionSender,
}

impl<H: UsbHost> ClientEventHandler<H> {
    pub fn new(
        host: Arc<H>,
        session: Arc<Mutex<DeviceSession>>,
        completions: CompletionSender,
    ) -> Self {
        Self {
            host,
            session,
            completions,
        }
    }

    /// Handle one client event, returning notifications for the bridge
    pub fn handle(&self, event: ClientEvent) -> Vec<DriverEvent> {
        match event {
            ClientEvent::NewDevice { address } => self.new_device(address),
            ClientEvent::DeviceGone { device } => {
                info!("Device gone: {}", device);
                vec![DriverEvent::DeviceGone { device: device.0 }]
            }
        }
    }

    fn new_device(&self, address: DeviceAddress) -> Vec<DriverEvent> {
        info!("New device at {}", address);
        let mut notes = Vec::new();
        let client = self.session.lock().client();

        let device = match self.host.device_open(client, address) {
            Ok(device) => device,
            Err(e) => {
                warn!(op = "device_open", code = e.code(), "Cannot open {}: {}", address, e);
                return notes;
            }
        };
        self.session.lock().open(device);
        notes.push(DriverEvent::DeviceOpened { device: device.0 });

        self.log_device_info(device);

        let bytes = match self.host.active_config_descriptor(device) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    op = "get_active_config_descriptor",
                    code = e.code(),
                    "Device {}: {}",
                    device,
                    e
                );
                notes.push(DriverEvent::DescriptorRejected {
                    device: device.0,
                    reason: e.to_string(),
                });
                return notes;
            }
        };

        let mut session = self.session.lock();
        match parse_configuration(&*self.host, &mut session, &bytes, &self.completions) {
            Ok(outcome) => {
                debug!(
                    "Walked {} descriptors, claimed={}, state={}",
                    outcome.descriptors,
                    outcome.claimed,
                    session.state()
                );
                if outcome.became_ready {
                    notes.push(DriverEvent::MidiReady { device: device.0 });
                }
            }
            Err(e) => {
                warn!(
                    op = "parse_configuration",
                    "Invalid USB descriptor on device {}: {}",
                    device,
                    e
                );
                notes.push(DriverEvent::DescriptorRejected {
                    device: device.0,
                    reason: e.to_string(),
                });
            }
        }
        notes
    }

    fn log_device_info(&self, device: DeviceHandle) {
        match self.host.device_info(device) {
            Ok(info) => info!(
                "Device {} at {}: {:04x}:{:04x}, {:?} speed, bMaxPacketSize0={}, configuration {}",
                device,
                info.address,
                info.vendor_id,
                info.product_id,
                info.speed,
                info.max_packet_size0,
                info.configuration_value
            ),
            Err(e) => warn!(op = "device_info", code = e.code(), "Device {}: {}", device, e),
        }
    }
}
