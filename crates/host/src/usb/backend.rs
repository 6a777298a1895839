//! Host-stack seam
//!
//! Everything the driver needs from a USB host stack goes through the
//! [`UsbHost`] trait. The libusb implementation lives in
//! [`rusb_host`](super::rusb_host), the in-process one used by tests and
//! `--simulate` in [`sim`](super::sim).
//!
//! Methods take `&self`: the event loop thread and the transfer pump thread
//! call into the same host concurrently, so implementations keep their
//! state behind their own locks.

use crossbeam_channel::Sender;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Result type for host-stack calls
pub type HostResult<T> = Result<T, HostError>;

/// Failure reported by the host stack
///
/// Variants mirror the libusb error set; [`HostError::code`] gives the
/// numeric code that ends up in the `code=` field of log lines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("input/output error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("access denied")]
    Access,
    #[error("no such device")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("operation timed out")]
    Timeout,
    #[error("overflow")]
    Overflow,
    #[error("pipe error")]
    Pipe,
    #[error("system call interrupted")]
    Interrupted,
    #[error("insufficient memory")]
    NoMem,
    #[error("operation not supported")]
    NotSupported,
    #[error("invalid state")]
    InvalidState,
    #[error("{0}")]
    Other(String),
}

impl HostError {
    /// libusb-style numeric error code
    pub fn code(&self) -> i32 {
        match self {
            HostError::Io => -1,
            HostError::InvalidParam => -2,
            HostError::Access => -3,
            HostError::NoDevice => -4,
            HostError::NotFound => -5,
            HostError::Busy => -6,
            HostError::Timeout => -7,
            HostError::Overflow => -8,
            HostError::Pipe => -9,
            HostError::Interrupted => -10,
            HostError::NoMem => -11,
            HostError::NotSupported => -12,
            HostError::InvalidState => -13,
            HostError::Other(_) => -99,
        }
    }
}

impl From<rusb::Error> for HostError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Io => HostError::Io,
            rusb::Error::InvalidParam => HostError::InvalidParam,
            rusb::Error::Access => HostError::Access,
            rusb::Error::NoDevice => HostError::NoDevice,
            rusb::Error::NotFound => HostError::NotFound,
            rusb::Error::Busy => HostError::Busy,
            rusb::Error::Timeout => HostError::Timeout,
            rusb::Error::Overflow => HostError::Overflow,
            rusb::Error::Pipe => HostError::Pipe,
            rusb::Error::Interrupted => HostError::Interrupted,
            rusb::Error::NoMem => HostError::NoMem,
            rusb::Error::NotSupported => HostError::NotSupported,
            _ => HostError::Other(err.to_string()),
        }
    }
}

/// Registered client identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(pub u32);

/// Opened device identity, unique for the lifetime of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Bus position of an announced device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    pub bus: u8,
    pub address: u8,
}

impl DeviceAddress {
    pub const fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
    Unknown,
}

/// Diagnostic snapshot of an opened device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: DeviceAddress,
    pub speed: DeviceSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bMaxPacketSize0 of the default control pipe
    pub max_packet_size0: u8,
    /// bConfigurationValue of the active configuration (0 if unconfigured)
    pub configuration_value: u8,
}

/// Per-client notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A device was attached and may be opened
    NewDevice { address: DeviceAddress },
    /// A device this client opened went away
    DeviceGone { device: DeviceHandle },
}

/// Library-level flags reported by [`UsbHost::handle_lib_events`]
///
/// Hosts set each flag once per transition, not on every call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LibEventFlags {
    /// The last client deregistered
    pub no_clients: bool,
    /// Every opened device has been closed
    pub all_free: bool,
}

impl LibEventFlags {
    pub fn is_empty(&self) -> bool {
        !self.no_clients && !self.all_free
    }
}

/// Options for [`UsbHost::register_client`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Depth of the client event queue
    pub max_event_messages: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_event_messages: 5,
        }
    }
}

/// Completion status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Not yet completed
    Pending,
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    /// Numeric status for logging
    pub fn code(&self) -> i32 {
        match self {
            TransferStatus::Completed => 0,
            TransferStatus::Error => 1,
            TransferStatus::TimedOut => 2,
            TransferStatus::Cancelled => 3,
            TransferStatus::Stall => 4,
            TransferStatus::NoDevice => 5,
            TransferStatus::Overflow => 6,
            TransferStatus::Pending => -1,
        }
    }
}

impl From<rusb::Error> for TransferStatus {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => TransferStatus::TimedOut,
            rusb::Error::Pipe => TransferStatus::Stall,
            rusb::Error::NoDevice => TransferStatus::NoDevice,
            rusb::Error::Overflow => TransferStatus::Overflow,
            rusb::Error::Interrupted => TransferStatus::Cancelled,
            _ => TransferStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);

/// Where a completed transfer is handed back to its owner
pub type CompletionSender = Sender<Transfer>;

/// A reusable transfer object
///
/// Ownership moves into the host on submit and comes back through the
/// bound completion channel once the host calls [`Transfer::complete`].
#[derive(Debug)]
pub struct Transfer {
    id: TransferId,
    buffer: Vec<u8>,
    device: Option<DeviceHandle>,
    endpoint: u8,
    num_bytes: usize,
    actual_num_bytes: usize,
    status: TransferStatus,
    completion: Option<CompletionSender>,
}

impl Transfer {
    /// Allocate an unbound transfer with a zeroed buffer of `size` bytes
    pub fn new(id: TransferId, size: usize) -> Self {
        Self {
            id,
            buffer: vec![0u8; size],
            device: None,
            endpoint: 0,
            num_bytes: size,
            actual_num_bytes: 0,
            status: TransferStatus::Pending,
            completion: None,
        }
    }

    /// Attach the transfer to a device endpoint and a completion channel
    ///
    /// `num_bytes` is clamped to the allocated buffer.
    pub fn bind(
        &mut self,
        device: DeviceHandle,
        endpoint: u8,
        num_bytes: usize,
        completion: CompletionSender,
    ) {
        self.device = Some(device);
        self.endpoint = endpoint;
        self.num_bytes = num_bytes.min(self.buffer.len());
        self.completion = Some(completion);
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn device(&self) -> Option<DeviceHandle> {
        self.device
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn is_in(&self) -> bool {
        self.endpoint & protocol::descriptor::ENDPOINT_DIR_IN != 0
    }

    pub fn is_bound(&self) -> bool {
        self.device.is_some() && self.completion.is_some()
    }

    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    pub fn actual_num_bytes(&self) -> usize {
        self.actual_num_bytes
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes received by the last completion
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_num_bytes]
    }

    /// The region the host reads into or writes from
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.num_bytes]
    }

    /// Copy outgoing bytes into the buffer and set the length to send
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.buffer.len());
        self.buffer[..n].copy_from_slice(&bytes[..n]);
        self.num_bytes = n;
        n
    }

    /// Record the outcome and hand the transfer back to its owner
    ///
    /// Called by host implementations once the hardware is done with it.
    pub fn complete(mut self, status: TransferStatus, actual_num_bytes: usize) {
        self.status = status;
        self.actual_num_bytes = actual_num_bytes.min(self.num_bytes);
        match self.completion.clone() {
            Some(completion) => {
                if completion.send(self).is_err() {
                    trace!("Transfer completion receiver is gone");
                }
            }
            None => trace!("Completed transfer {:?} has no owner", self.id),
        }
    }
}

/// A submit that the host refused; the transfer is handed back untouched
#[derive(Debug, Error)]
#[error("transfer submit failed: {error}")]
pub struct SubmitError {
    pub error: HostError,
    pub transfer: Transfer,
}

impl SubmitError {
    pub fn new(error: HostError, transfer: Transfer) -> Self {
        Self { error, transfer }
    }
}

/// Operations the driver needs from a USB host stack
pub trait UsbHost: Send + Sync + 'static {
    /// Register the single driver client
    fn register_client(&self, config: &ClientConfig) -> HostResult<ClientHandle>;

    /// Process library-level events, waiting up to `timeout`
    fn handle_lib_events(&self, timeout: Duration) -> HostResult<LibEventFlags>;

    /// Next event for `client`; `Err(HostError::Timeout)` when none arrived in time
    fn next_client_event(&self, client: ClientHandle, timeout: Duration)
    -> HostResult<ClientEvent>;

    fn device_open(&self, client: ClientHandle, address: DeviceAddress)
    -> HostResult<DeviceHandle>;

    fn device_info(&self, device: DeviceHandle) -> HostResult<DeviceInfo>;

    /// Raw bytes of the active configuration descriptor
    fn active_config_descriptor(&self, device: DeviceHandle) -> HostResult<Vec<u8>>;

    fn interface_claim(
        &self,
        client: ClientHandle,
        device: DeviceHandle,
        interface: u8,
        alternate_setting: u8,
    ) -> HostResult<()>;

    /// Allocate a transfer with a `size`-byte buffer
    fn transfer_alloc(&self, size: usize) -> HostResult<Transfer>;

    /// Queue a bound transfer; it comes back through its completion channel
    fn transfer_submit(&self, transfer: Transfer) -> Result<(), SubmitError>;
}
