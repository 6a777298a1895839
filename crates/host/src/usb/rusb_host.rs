//! libusb host stack
//!
//! [`UsbHost`] on top of rusb. Devices are announced through a hotplug
//! callback (or a one-off enumeration where hotplug is unavailable); only
//! devices that pass the VID:PID filters and expose a MIDI-streaming
//! interface reach the driver.
//!
//! rusb transfers are synchronous, so every (device, endpoint) pair gets a
//! small pipe thread that performs submitted transfers in order and hands
//! them back through their completion channel.

use crate::usb::backend::{
    ClientConfig, ClientEvent, ClientHandle, DeviceAddress, DeviceHandle, DeviceInfo, DeviceSpeed,
    HostError, HostResult, LibEventFlags, SubmitError, Transfer, TransferId, TransferStatus,
    UsbHost,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::Mutex;
use protocol::descriptor::{CLASS_AUDIO, SUBCLASS_MIDI_STREAMING, kind};
use rusb::{
    Context, Device, Direction, Hotplug, HotplugBuilder, Recipient, Registration, RequestType,
    UsbContext,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Timeout for descriptor reads on the control pipe
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Bulk OUT timeout
const OUT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a pending bulk IN read waits before checking for shutdown
const IN_POLL_INTERVAL: Duration = Duration::from_millis(100);

const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const CONFIG_HEADER_LEN: usize = 9;

/// Linux Foundation root hubs
const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;
const HUB_CLASS: u8 = 0x09;

/// Raw hotplug notification, resolved to a [`ClientEvent`] on the loop thread
#[derive(Debug, Clone, Copy)]
enum Notice {
    Arrived(DeviceAddress),
    Left(DeviceAddress),
}

struct OpenDevice {
    address: DeviceAddress,
    handle: Arc<rusb::DeviceHandle<Context>>,
    /// One pipe thread per endpoint, fed through these senders
    pipes: HashMap<u8, Sender<Transfer>>,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct HostState {
    client: Option<ClientHandle>,
    notices: Option<Receiver<Notice>>,
    hotplug: Option<Registration<Context>>,
    open: HashMap<DeviceHandle, OpenDevice>,
    next_device: u32,
    flags: LibEventFlags,
}

/// USB host backed by libusb
pub struct RusbHost {
    context: Context,
    filters: Vec<String>,
    state: Mutex<HostState>,
    next_transfer: AtomicU64,
}

impl RusbHost {
    /// Create the libusb context
    ///
    /// `filters` are "VID:PID" strings as accepted by the config file.
    pub fn install(filters: Vec<String>) -> HostResult<Self> {
        let context = Context::new()?;
        info!(
            "libusb host installed (hotplug {})",
            if rusb::has_hotplug() { "available" } else { "unavailable" }
        );
        Ok(Self {
            context,
            filters,
            state: Mutex::new(HostState {
                next_device: 1,
                ..HostState::default()
            }),
            next_transfer: AtomicU64::new(1),
        })
    }

    fn lookup(&self, device: DeviceHandle) -> HostResult<(DeviceAddress, Arc<rusb::DeviceHandle<Context>>)> {
        let state = self.state.lock();
        let open = state.open.get(&device).ok_or(HostError::NoDevice)?;
        Ok((open.address, Arc::clone(&open.handle)))
    }

    fn check_client(&self, client: ClientHandle) -> HostResult<()> {
        if self.state.lock().client == Some(client) {
            Ok(())
        } else {
            Err(HostError::InvalidParam)
        }
    }

    /// Announce devices already present when hotplug is unavailable
    fn announce_present(&self, notices: &Sender<Notice>) -> HostResult<usize> {
        let mut announced = 0;
        for device in self.context.devices()?.iter() {
            if is_midi_candidate(&device, &self.filters) {
                let address = DeviceAddress::new(device.bus_number(), device.address());
                if notices.try_send(Notice::Arrived(address)).is_ok() {
                    announced += 1;
                } else {
                    warn!("Client event queue full, {} not announced", address);
                }
            }
        }
        Ok(announced)
    }

    /// Drop bookkeeping for an unplugged device
    fn forget(&self, address: DeviceAddress) -> Option<DeviceHandle> {
        let mut state = self.state.lock();
        let device = state
            .open
            .iter()
            .find(|(_, open)| open.address == address)
            .map(|(handle, _)| *handle)?;
        if let Some(open) = state.open.remove(&device) {
            open.alive.store(false, Ordering::Release);
        }
        if state.open.is_empty() {
            state.flags.all_free = true;
        }
        Some(device)
    }

    fn read_active_config(&self, handle: &rusb::DeviceHandle<Context>) -> HostResult<Vec<u8>> {
        let active = handle.active_configuration()?;
        let count = handle.device().device_descriptor()?.num_configurations();
        let request_type = rusb::request_type(Direction::In, RequestType::Standard, Recipient::Device);

        for index in 0..count {
            let value = (u16::from(kind::CONFIGURATION) << 8) | u16::from(index);

            let mut header = [0u8; CONFIG_HEADER_LEN];
            let n = handle.read_control(
                request_type,
                REQUEST_GET_DESCRIPTOR,
                value,
                0,
                &mut header,
                CONTROL_TIMEOUT,
            )?;
            if n < CONFIG_HEADER_LEN || header[5] != active {
                continue;
            }

            let total = usize::from(u16::from_le_bytes([header[2], header[3]]));
            let mut bytes = vec![0u8; total.max(CONFIG_HEADER_LEN)];
            let n = handle.read_control(
                request_type,
                REQUEST_GET_DESCRIPTOR,
                value,
                0,
                &mut bytes,
                CONTROL_TIMEOUT,
            )?;
            bytes.truncate(n);
            debug!("Read configuration {} ({} bytes)", active, n);
            return Ok(bytes);
        }

        Err(HostError::NotFound)
    }
}

impl Drop for RusbHost {
    fn drop(&mut self) {
        for open in self.state.lock().open.values() {
            open.alive.store(false, Ordering::Release);
        }
    }
}

impl UsbHost for RusbHost {
    fn register_client(&self, config: &ClientConfig) -> HostResult<ClientHandle> {
        if self.state.lock().client.is_some() {
            return Err(HostError::InvalidState);
        }

        let (tx, rx) = bounded(config.max_event_messages.max(1));
        let client = ClientHandle(1);
        {
            let mut state = self.state.lock();
            state.client = Some(client);
            state.notices = Some(rx);
        }

        if rusb::has_hotplug() {
            let callback = MidiHotplug {
                notices: tx,
                filters: self.filters.clone(),
            };
            let registration = HotplugBuilder::new()
                .enumerate(true)
                .register(&self.context, Box::new(callback))?;
            self.state.lock().hotplug = Some(registration);
            debug!("Hot-plug callbacks registered");
        } else {
            let announced = self.announce_present(&tx)?;
            warn!(
                "Hot-plug unsupported; {} MIDI devices present now are all that will be seen",
                announced
            );
        }

        Ok(client)
    }

    fn handle_lib_events(&self, timeout: Duration) -> HostResult<LibEventFlags> {
        self.context.handle_events(Some(timeout))?;
        Ok(std::mem::take(&mut self.state.lock().flags))
    }

    fn next_client_event(
        &self,
        client: ClientHandle,
        timeout: Duration,
    ) -> HostResult<ClientEvent> {
        let notices = {
            let state = self.state.lock();
            if state.client != Some(client) {
                return Err(HostError::InvalidParam);
            }
            state.notices.clone().ok_or(HostError::InvalidState)?
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let notice = match notices.recv_timeout(remaining) {
                Ok(notice) => notice,
                Err(RecvTimeoutError::Timeout) => return Err(HostError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(HostError::InvalidState),
            };
            match notice {
                Notice::Arrived(address) => return Ok(ClientEvent::NewDevice { address }),
                Notice::Left(address) => {
                    if let Some(device) = self.forget(address) {
                        return Ok(ClientEvent::DeviceGone { device });
                    }
                    debug!("Unplugged {} was never opened", address);
                }
            }
        }
    }

    fn device_open(
        &self,
        client: ClientHandle,
        address: DeviceAddress,
    ) -> HostResult<DeviceHandle> {
        self.check_client(client)?;

        let device = self
            .context
            .devices()?
            .iter()
            .find(|d| d.bus_number() == address.bus && d.address() == address.address)
            .ok_or(HostError::NoDevice)?;
        let handle = device.open()?;

        let mut state = self.state.lock();
        let id = DeviceHandle(state.next_device);
        state.next_device += 1;
        state.open.insert(
            id,
            OpenDevice {
                address,
                handle: Arc::new(handle),
                pipes: HashMap::new(),
                alive: Arc::new(AtomicBool::new(true)),
            },
        );
        debug!("Opened {} as device {}", address, id);
        Ok(id)
    }

    fn device_info(&self, device: DeviceHandle) -> HostResult<DeviceInfo> {
        let (address, handle) = self.lookup(device)?;
        let usb_device = handle.device();
        let desc = usb_device.device_descriptor()?;

        Ok(DeviceInfo {
            address,
            speed: map_device_speed(usb_device.speed()),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            max_packet_size0: desc.max_packet_size(),
            configuration_value: handle.active_configuration().unwrap_or(0),
        })
    }

    fn active_config_descriptor(&self, device: DeviceHandle) -> HostResult<Vec<u8>> {
        let (_, handle) = self.lookup(device)?;
        self.read_active_config(&handle)
    }

    fn interface_claim(
        &self,
        client: ClientHandle,
        device: DeviceHandle,
        interface: u8,
        alternate_setting: u8,
    ) -> HostResult<()> {
        self.check_client(client)?;
        let (_, handle) = self.lookup(device)?;

        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                if let Err(e) = handle.detach_kernel_driver(interface) {
                    warn!("Failed to detach kernel driver from interface {}: {}", interface, e);
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        handle.claim_interface(interface)?;
        if alternate_setting != 0 {
            handle.set_alternate_setting(interface, alternate_setting)?;
        }
        Ok(())
    }

    fn transfer_alloc(&self, size: usize) -> HostResult<Transfer> {
        if size == 0 {
            return Err(HostError::InvalidParam);
        }
        let id = TransferId(self.next_transfer.fetch_add(1, Ordering::Relaxed));
        Ok(Transfer::new(id, size))
    }

    fn transfer_submit(&self, transfer: Transfer) -> Result<(), SubmitError> {
        let Some(device) = transfer.device().filter(|_| transfer.is_bound()) else {
            return Err(SubmitError::new(HostError::InvalidParam, transfer));
        };
        let endpoint = transfer.endpoint();

        let pipe = {
            let mut state = self.state.lock();
            let Some(open) = state.open.get_mut(&device) else {
                return Err(SubmitError::new(HostError::NoDevice, transfer));
            };
            match open.pipes.get(&endpoint) {
                Some(pipe) => pipe.clone(),
                None => {
                    let (tx, rx) = unbounded();
                    let handle = Arc::clone(&open.handle);
                    let alive = Arc::clone(&open.alive);
                    let spawned = std::thread::Builder::new()
                        .name(format!("usb-pipe-{:02x}", endpoint))
                        .spawn(move || run_pipe(handle, endpoint, alive, rx));
                    if let Err(e) = spawned {
                        return Err(SubmitError::new(HostError::Other(e.to_string()), transfer));
                    }
                    open.pipes.insert(endpoint, tx.clone());
                    tx
                }
            }
        };

        pipe.send(transfer)
            .map_err(|e| SubmitError::new(HostError::NoDevice, e.into_inner()))
    }
}

/// Perform transfers for one endpoint until its device is closed
fn run_pipe(
    handle: Arc<rusb::DeviceHandle<Context>>,
    endpoint: u8,
    alive: Arc<AtomicBool>,
    transfers: Receiver<Transfer>,
) {
    for mut transfer in transfers.iter() {
        let (status, n) = if transfer.is_in() {
            read_until_data(&handle, endpoint, &alive, &mut transfer)
        } else {
            match handle.write_bulk(endpoint, transfer.buffer_mut(), OUT_TIMEOUT) {
                Ok(n) => (TransferStatus::Completed, n),
                Err(e) => (TransferStatus::from(e), 0),
            }
        };
        transfer.complete(status, n);
    }
    debug!("Pipe {:#04x} closed", endpoint);
}

/// A bulk IN transfer stays pending until the device sends something
fn read_until_data(
    handle: &rusb::DeviceHandle<Context>,
    endpoint: u8,
    alive: &AtomicBool,
    transfer: &mut Transfer,
) -> (TransferStatus, usize) {
    loop {
        if !alive.load(Ordering::Acquire) {
            return (TransferStatus::Cancelled, 0);
        }
        match handle.read_bulk(endpoint, transfer.buffer_mut(), IN_POLL_INTERVAL) {
            Ok(n) => return (TransferStatus::Completed, n),
            Err(rusb::Error::Timeout) => continue,
            Err(e) => return (TransferStatus::from(e), 0),
        }
    }
}

/// Hot-plug callback forwarding arrivals of MIDI devices
struct MidiHotplug {
    notices: Sender<Notice>,
    filters: Vec<String>,
}

impl<T: UsbContext> Hotplug<T> for MidiHotplug {
    fn device_arrived(&mut self, device: Device<T>) {
        if !is_midi_candidate(&device, &self.filters) {
            return;
        }
        let address = DeviceAddress::new(device.bus_number(), device.address());
        debug!("Hot-plug: MIDI device arrived at {}", address);
        if self.notices.try_send(Notice::Arrived(address)).is_err() {
            warn!("Client event queue full, {} not announced", address);
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        let address = DeviceAddress::new(device.bus_number(), device.address());
        debug!("Hot-plug: device left {}", address);
        if self.notices.try_send(Notice::Left(address)).is_err() {
            warn!("Client event queue full, removal of {} lost", address);
        }
    }
}

/// A device worth announcing: allowed by the filters, not a root hub, and
/// exposing a MIDI-streaming interface
fn is_midi_candidate<T: UsbContext>(device: &Device<T>, filters: &[String]) -> bool {
    let desc = match device.device_descriptor() {
        Ok(desc) => desc,
        Err(_) => return false,
    };

    if desc.vendor_id() == ROOT_HUB_VENDOR_ID && desc.class_code() == HUB_CLASS {
        return false;
    }

    if !check_filter(desc.vendor_id(), desc.product_id(), filters) {
        debug!(
            "Device ignored by filter: bus={}, addr={}, vid={:#06x}, pid={:#06x}",
            device.bus_number(),
            device.address(),
            desc.vendor_id(),
            desc.product_id()
        );
        return false;
    }

    let config = match device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))
    {
        Ok(config) => config,
        Err(e) => {
            debug!("No configuration for {:04x}:{:04x}: {}", desc.vendor_id(), desc.product_id(), e);
            return false;
        }
    };

    config
        .interfaces()
        .flat_map(|interface| interface.descriptors())
        .any(|d| d.class_code() == CLASS_AUDIO && d.sub_class_code() == SUBCLASS_MIDI_STREAMING)
}

/// Check if a VID/PID pair is allowed by the filters
///
/// Filter format is "0xVID:0xPID" with `*` for either half; no filters
/// allows everything.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| {
        let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
            return false;
        };
        id_matches(filter_vid, vid) && id_matches(filter_pid, pid)
    })
}

fn id_matches(pattern: &str, id: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let digits = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(digits, 16).is_ok_and(|v| v == id)
}

fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

/// One line of `--list-devices` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiDeviceSummary {
    pub address: DeviceAddress,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product: Option<String>,
}

/// MIDI devices currently attached that the filters allow
pub fn list_midi_devices(filters: &[String]) -> HostResult<Vec<MidiDeviceSummary>> {
    let context = Context::new()?;
    let mut found = Vec::new();

    for device in context.devices()?.iter() {
        if !is_midi_candidate(&device, filters) {
            continue;
        }
        let desc = device.device_descriptor()?;
        let product = device
            .open()
            .and_then(|handle| handle.read_product_string_ascii(&desc))
            .ok();
        found.push(MidiDeviceSummary {
            address: DeviceAddress::new(device.bus_number(), device.address()),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            product,
        });
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec![
            "0x1234:0x5678".to_string(),
            "0xABCD:*".to_string(),
        ];

        assert!(check_filter(0x1234, 0x5678, &filters));
        assert!(check_filter(0xABCD, 0x1111, &filters));
        assert!(check_filter(0xABCD, 0x9999, &filters));

        assert!(!check_filter(0x1234, 0x9999, &filters));
        assert!(!check_filter(0x9999, 0x5678, &filters));
        assert!(!check_filter(0x0000, 0x0000, &filters));

        assert!(check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_filter_ignores_malformed_entries() {
        let filters = vec!["1234".to_string(), "0xZZZZ:*".to_string()];
        assert!(!check_filter(0x1234, 0x0001, &filters));
    }

    #[test]
    fn test_map_device_speed() {
        assert_eq!(map_device_speed(rusb::Speed::Low), DeviceSpeed::Low);
        assert_eq!(map_device_speed(rusb::Speed::High), DeviceSpeed::High);
        assert_eq!(map_device_speed(rusb::Speed::Unknown), DeviceSpeed::Unknown);
    }

    #[test]
    fn test_install_without_permissions() {
        // libusb may be unavailable in CI; both outcomes are acceptable
        match RusbHost::install(Vec::new()) {
            Ok(host) => {
                let client = host.register_client(&ClientConfig::default());
                if let Ok(client) = client {
                    let _ = host.next_client_event(client, Duration::ZERO);
                }
            }
            Err(e) => eprintln!("libusb unavailable: {}", e),
        }
    }
}
