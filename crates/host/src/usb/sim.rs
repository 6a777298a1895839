//! In-process USB host
//!
//! A [`UsbHost`] with virtual devices, used by the test suite and by
//! `--simulate`. Devices are attached and detached by hand, IN transfers
//! stay pending until [`SimulatedHost::feed`] delivers bytes, and every host
//! operation can be made to fail once via [`SimulatedHost::fail_next`].

use crate::usb::backend::{
    ClientConfig, ClientEvent, ClientHandle, DeviceAddress, DeviceHandle, DeviceInfo, DeviceSpeed,
    HostError, HostResult, LibEventFlags, SubmitError, Transfer, TransferId, TransferStatus,
    UsbHost,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// pid.codes test VID
pub const SIM_VENDOR_ID: u16 = 0x1209;
pub const SIM_PRODUCT_ID: u16 = 0x4d49;

/// Host operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    RegisterClient,
    LibEvents,
    ClientEvents,
    DeviceOpen,
    DeviceInfo,
    ConfigDescriptor,
    InterfaceClaim,
    TransferAlloc,
    TransferSubmit,
}

/// An interface claim as the host saw it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimRecord {
    pub device: DeviceHandle,
    pub interface: u8,
    pub alternate_setting: u8,
}

#[derive(Debug, Clone)]
struct SimDevice {
    descriptor: Vec<u8>,
    handle: Option<DeviceHandle>,
}

#[derive(Debug, Default)]
struct SimState {
    client: Option<ClientHandle>,
    attached: HashMap<DeviceAddress, SimDevice>,
    opened: HashMap<DeviceHandle, DeviceAddress>,
    next_device: u32,
    next_transfer: u64,
    pending_in: VecDeque<Transfer>,
    buffered: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    claims: Vec<ClaimRecord>,
    failures: HashMap<HostOp, VecDeque<HostError>>,
    allocations: usize,
    submissions: usize,
    flags: LibEventFlags,
}

impl SimState {
    fn take_failure(&mut self, op: HostOp) -> HostResult<()> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn opened_device(&self, device: DeviceHandle) -> HostResult<&SimDevice> {
        self.opened
            .get(&device)
            .and_then(|address| self.attached.get(address))
            .ok_or(HostError::NoDevice)
    }
}

/// Shared handle to the simulated host; clones see the same devices
#[derive(Clone)]
pub struct SimulatedHost {
    state: Arc<Mutex<SimState>>,
    events_tx: Sender<ClientEvent>,
    events_rx: Receiver<ClientEvent>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        let state = SimState {
            next_device: 1,
            next_transfer: 1,
            ..SimState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            events_tx,
            events_rx,
        }
    }

    /// Attach a class-compliant MIDI keyboard at `address`
    pub fn attach(&self, address: DeviceAddress) {
        self.attach_with_descriptor(address, protocol::midi_device_config(64));
    }

    /// Attach a device whose active configuration is `descriptor`
    pub fn attach_with_descriptor(&self, address: DeviceAddress, descriptor: Vec<u8>) {
        self.state.lock().attached.insert(
            address,
            SimDevice {
                descriptor,
                handle: None,
            },
        );
        debug!("Simulated device attached at {}", address);
        let _ = self.events_tx.send(ClientEvent::NewDevice { address });
    }

    /// Unplug the device at `address`
    ///
    /// Pending IN transfers of the device complete with `NoDevice`.
    pub fn detach(&self, address: DeviceAddress) {
        let mut cancelled = Vec::new();
        let gone = {
            let mut state = self.state.lock();
            let handle = state.attached.remove(&address).and_then(|d| d.handle);
            if let Some(handle) = handle {
                state.opened.remove(&handle);
                let (theirs, rest): (VecDeque<_>, VecDeque<_>) = state
                    .pending_in
                    .drain(..)
                    .partition(|t| t.device() == Some(handle));
                state.pending_in = rest;
                cancelled.extend(theirs);
                if state.opened.is_empty() {
                    state.flags.all_free = true;
                }
            }
            handle
        };

        for transfer in cancelled {
            transfer.complete(TransferStatus::NoDevice, 0);
        }
        if let Some(device) = gone {
            let _ = self.events_tx.send(ClientEvent::DeviceGone { device });
        }
    }

    /// Deliver bytes to the oldest pending IN transfer
    ///
    /// With nothing pending the bytes are kept for the next submit and
    /// `false` is returned.
    pub fn feed(&self, bytes: &[u8]) -> bool {
        let transfer = self.state.lock().pending_in.pop_front();
        match transfer {
            Some(transfer) => {
                deliver(transfer, bytes);
                true
            }
            None => {
                self.state.lock().buffered.push_back(bytes.to_vec());
                false
            }
        }
    }

    /// Deliver bytes to a pending IN transfer of `device`
    pub fn feed_device(&self, device: DeviceHandle, bytes: &[u8]) -> bool {
        let transfer = {
            let mut state = self.state.lock();
            let index = state
                .pending_in
                .iter()
                .position(|t| t.device() == Some(device));
            index.and_then(|i| state.pending_in.remove(i))
        };
        match transfer {
            Some(transfer) => {
                deliver(transfer, bytes);
                true
            }
            None => false,
        }
    }

    /// Complete every pending IN transfer with `status` and no data
    pub fn complete_pending(&self, status: TransferStatus) -> usize {
        let pending: Vec<Transfer> = self.state.lock().pending_in.drain(..).collect();
        let count = pending.len();
        for transfer in pending {
            transfer.complete(status, 0);
        }
        count
    }

    /// Make the next call of `op` fail with `error`
    pub fn fail_next(&self, op: HostOp, error: HostError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub fn claims(&self) -> Vec<ClaimRecord> {
        self.state.lock().claims.clone()
    }

    pub fn allocations(&self) -> usize {
        self.state.lock().allocations
    }

    /// Accepted submits, IN and OUT
    pub fn submissions(&self) -> usize {
        self.state.lock().submissions
    }

    pub fn pending_in(&self) -> usize {
        self.state.lock().pending_in.len()
    }

    pub fn pending_ids(&self) -> Vec<TransferId> {
        self.state.lock().pending_in.iter().map(Transfer::id).collect()
    }

    /// Payloads of completed OUT transfers
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    /// Handle of the device opened at `address`, if any
    pub fn handle_of(&self, address: DeviceAddress) -> Option<DeviceHandle> {
        self.state
            .lock()
            .attached
            .get(&address)
            .and_then(|d| d.handle)
    }
}

fn deliver(mut transfer: Transfer, bytes: &[u8]) {
    let buffer = transfer.buffer_mut();
    let n = bytes.len().min(buffer.len());
    buffer[..n].copy_from_slice(&bytes[..n]);
    transfer.complete(TransferStatus::Completed, n);
}

impl UsbHost for SimulatedHost {
    fn register_client(&self, config: &ClientConfig) -> HostResult<ClientHandle> {
        let mut state = self.state.lock();
        state.take_failure(HostOp::RegisterClient)?;
        if state.client.is_some() {
            return Err(HostError::InvalidState);
        }
        if config.max_event_messages == 0 {
            return Err(HostError::InvalidParam);
        }
        let client = ClientHandle(1);
        state.client = Some(client);
        Ok(client)
    }

    fn handle_lib_events(&self, timeout: Duration) -> HostResult<LibEventFlags> {
        let flags = {
            let mut state = self.state.lock();
            state.take_failure(HostOp::LibEvents)?;
            std::mem::take(&mut state.flags)
        };
        if flags.is_empty() && !timeout.is_zero() {
            std::thread::sleep(timeout);
        }
        Ok(flags)
    }

    fn next_client_event(
        &self,
        client: ClientHandle,
        timeout: Duration,
    ) -> HostResult<ClientEvent> {
        {
            let mut state = self.state.lock();
            state.take_failure(HostOp::ClientEvents)?;
            if state.client != Some(client) {
                return Err(HostError::InvalidParam);
            }
        }
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => Err(HostError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(HostError::NoDevice),
        }
    }

    fn device_open(
        &self,
        client: ClientHandle,
        address: DeviceAddress,
    ) -> HostResult<DeviceHandle> {
        let mut state = self.state.lock();
        state.take_failure(HostOp::DeviceOpen)?;
        if state.client != Some(client) {
            return Err(HostError::InvalidParam);
        }
        if !state.attached.contains_key(&address) {
            return Err(HostError::NoDevice);
        }
        let handle = DeviceHandle(state.next_device);
        state.next_device += 1;
        state.opened.insert(handle, address);
        if let Some(device) = state.attached.get_mut(&address) {
            device.handle = Some(handle);
        }
        Ok(handle)
    }

    fn device_info(&self, device: DeviceHandle) -> HostResult<DeviceInfo> {
        let mut state = self.state.lock();
        state.take_failure(HostOp::DeviceInfo)?;
        let address = *state.opened.get(&device).ok_or(HostError::NoDevice)?;
        let sim = state.opened_device(device)?;
        Ok(DeviceInfo {
            address,
            speed: DeviceSpeed::Full,
            vendor_id: SIM_VENDOR_ID,
            product_id: SIM_PRODUCT_ID,
            max_packet_size0: 64,
            configuration_value: sim.descriptor.get(5).copied().unwrap_or(0),
        })
    }

    fn active_config_descriptor(&self, device: DeviceHandle) -> HostResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.take_failure(HostOp::ConfigDescriptor)?;
        Ok(state.opened_device(device)?.descriptor.clone())
    }

    fn interface_claim(
        &self,
        client: ClientHandle,
        device: DeviceHandle,
        interface: u8,
        alternate_setting: u8,
    ) -> HostResult<()> {
        let mut state = self.state.lock();
        state.take_failure(HostOp::InterfaceClaim)?;
        if state.client != Some(client) {
            return Err(HostError::InvalidParam);
        }
        state.opened_device(device)?;
        state.claims.push(ClaimRecord {
            device,
            interface,
            alternate_setting,
        });
        Ok(())
    }

    fn transfer_alloc(&self, size: usize) -> HostResult<Transfer> {
        let mut state = self.state.lock();
        state.take_failure(HostOp::TransferAlloc)?;
        if size == 0 {
            return Err(HostError::InvalidParam);
        }
        let id = TransferId(state.next_transfer);
        state.next_transfer += 1;
        state.allocations += 1;
        Ok(Transfer::new(id, size))
    }

    fn transfer_submit(&self, mut transfer: Transfer) -> Result<(), SubmitError> {
        let mut state = self.state.lock();
        if let Err(e) = state.take_failure(HostOp::TransferSubmit) {
            return Err(SubmitError::new(e, transfer));
        }
        if !transfer.is_bound() {
            return Err(SubmitError::new(HostError::InvalidParam, transfer));
        }
        let known = transfer
            .device()
            .is_some_and(|device| state.opened.contains_key(&device));
        if !known {
            return Err(SubmitError::new(HostError::NoDevice, transfer));
        }
        state.submissions += 1;

        if transfer.is_in() {
            let buffered = state.buffered.pop_front();
            match buffered {
                Some(bytes) => {
                    drop(state);
                    deliver(transfer, &bytes);
                }
                None => state.pending_in.push_back(transfer),
            }
        } else {
            let n = transfer.num_bytes();
            state.sent.push(transfer.buffer_mut().to_vec());
            drop(state);
            transfer.complete(TransferStatus::Completed, n);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered() -> (SimulatedHost, ClientHandle) {
        let host = SimulatedHost::new();
        let client = host.register_client(&ClientConfig::default()).unwrap();
        (host, client)
    }

    #[test]
    fn test_single_client() {
        let (host, _client) = registered();
        assert_eq!(
            host.register_client(&ClientConfig::default()),
            Err(HostError::InvalidState)
        );
    }

    #[test]
    fn test_attach_announces_device() {
        let (host, client) = registered();
        let address = DeviceAddress::new(1, 4);
        host.attach(address);

        let event = host
            .next_client_event(client, Duration::from_millis(10))
            .unwrap();
        assert_eq!(event, ClientEvent::NewDevice { address });
        assert_eq!(
            host.next_client_event(client, Duration::ZERO),
            Err(HostError::Timeout)
        );
    }

    #[test]
    fn test_fail_next_fires_once() {
        let (host, client) = registered();
        let address = DeviceAddress::new(1, 1);
        host.attach(address);
        host.fail_next(HostOp::DeviceOpen, HostError::Access);

        assert_eq!(host.device_open(client, address), Err(HostError::Access));
        assert!(host.device_open(client, address).is_ok());
    }

    #[test]
    fn test_in_transfer_waits_for_data() {
        let (host, client) = registered();
        let address = DeviceAddress::new(1, 1);
        host.attach(address);
        let device = host.device_open(client, address).unwrap();

        let (tx, rx) = unbounded();
        let mut transfer = host.transfer_alloc(64).unwrap();
        transfer.bind(device, 0x81, 64, tx);
        host.transfer_submit(transfer).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(host.pending_in(), 1);

        assert!(host.feed(&[0x09, 0x90, 0x3C, 0x64]));
        let done = rx.try_recv().unwrap();
        assert_eq!(done.status(), TransferStatus::Completed);
        assert_eq!(done.data(), &[0x09, 0x90, 0x3C, 0x64]);
    }

    #[test]
    fn test_buffered_data_completes_next_submit() {
        let (host, client) = registered();
        let address = DeviceAddress::new(1, 1);
        host.attach(address);
        let device = host.device_open(client, address).unwrap();

        assert!(!host.feed(&[0x0B, 0xB0, 0x40, 0x7F]));

        let (tx, rx) = unbounded();
        let mut transfer = host.transfer_alloc(64).unwrap();
        transfer.bind(device, 0x81, 64, tx);
        host.transfer_submit(transfer).unwrap();
        assert_eq!(rx.try_recv().unwrap().data().len(), 4);
    }

    #[test]
    fn test_detach_cancels_pending() {
        let (host, client) = registered();
        let address = DeviceAddress::new(1, 1);
        host.attach(address);
        let device = host.device_open(client, address).unwrap();

        let (tx, rx) = unbounded();
        let mut transfer = host.transfer_alloc(64).unwrap();
        transfer.bind(device, 0x81, 64, tx);
        host.transfer_submit(transfer).unwrap();

        host.detach(address);
        assert_eq!(rx.try_recv().unwrap().status(), TransferStatus::NoDevice);

        let _ = host.next_client_event(client, Duration::ZERO);
        assert_eq!(
            host.next_client_event(client, Duration::ZERO),
            Ok(ClientEvent::DeviceGone { device })
        );
        let flags = host.handle_lib_events(Duration::ZERO).unwrap();
        assert!(flags.all_free);
    }

    #[test]
    fn test_unbound_submit_is_refused() {
        let (host, _client) = registered();
        let transfer = host.transfer_alloc(8).unwrap();
        let err = host.transfer_submit(transfer).unwrap_err();
        assert_eq!(err.error, HostError::InvalidParam);
        assert_eq!(err.transfer.capacity(), 8);
    }
}
