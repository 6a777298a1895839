//! Configuration walk for a newly opened device
//!
//! Walks the active configuration once, claims the first MIDI-streaming
//! interface and provisions transfers for the bulk endpoints that belong to
//! it. The descriptor chain is bounds-checked as a whole before anything is
//! dispatched, so a corrupt configuration claims and allocates nothing.

use crate::usb::backend::{CompletionSender, HostError, SubmitError, UsbHost};
use crate::usb::session::{DeviceSession, InSlot};
use protocol::{ConfigDescriptor, Descriptor, EndpointDescriptor, InterfaceDescriptor, TransferKind};
use tracing::{debug, info, warn};

/// What a completed walk achieved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkOutcome {
    /// Descriptors visited, the configuration header included
    pub descriptors: usize,
    pub claimed: bool,
    /// The session is ready after this walk and was not before
    pub became_ready: bool,
}

/// Walk `bytes` and provision `session` from it
pub fn parse_configuration<H: UsbHost + ?Sized>(
    host: &H,
    session: &mut DeviceSession,
    bytes: &[u8],
    completions: &CompletionSender,
) -> protocol::Result<WalkOutcome> {
    let config = ConfigDescriptor::new(bytes)?;
    let header = config.header();
    debug!(
        "Configuration {}: {} bytes, {} interfaces",
        header.configuration_value,
        config.total_length(),
        header.num_interfaces
    );

    let descriptors = config.walk().collect::<protocol::Result<Vec<_>>>()?;

    let was_ready = session.is_ready();
    let mut outcome = WalkOutcome {
        descriptors: descriptors.len(),
        ..WalkOutcome::default()
    };
    let mut inside_claimed = false;

    for descriptor in descriptors {
        match descriptor {
            Descriptor::Configuration(_) => {}
            Descriptor::Interface(interface) => {
                if !session.is_claimed() {
                    claim_interface(host, session, &interface);
                }
                inside_claimed = session.claimed_interface()
                    == Some((interface.number, interface.alternate_setting));
            }
            Descriptor::Endpoint(endpoint) => {
                if inside_claimed {
                    provision_endpoint(host, session, &endpoint, completions);
                } else {
                    debug!(
                        "Endpoint {:#04x} outside the MIDI interface, skipped",
                        endpoint.address
                    );
                }
            }
            Descriptor::Standard { .. } | Descriptor::ClassSpecific { .. } => {}
            Descriptor::Unknown { kind, raw } => {
                info!("Unknown USB descriptor type {:#04x} ({} bytes)", kind, raw.len());
            }
        }
    }

    outcome.claimed = session.is_claimed();
    outcome.became_ready = !was_ready && session.is_ready();
    Ok(outcome)
}

/// Claim `interface` if it is a MIDI-streaming interface
///
/// Any mismatch or host failure leaves the session unclaimed so a later
/// interface may still be tried.
pub fn claim_interface<H: UsbHost + ?Sized>(
    host: &H,
    session: &mut DeviceSession,
    interface: &InterfaceDescriptor,
) -> bool {
    if !interface.is_midi_streaming() {
        debug!(
            "Interface {} (class {:#04x}, subclass {:#04x}) is not MIDI streaming",
            interface.number, interface.class, interface.subclass
        );
        session.mark_unclaimed();
        return false;
    }

    let Some(device) = session.device() else {
        warn!(op = "interface_claim", code = HostError::InvalidState.code(), "No open device");
        session.mark_unclaimed();
        return false;
    };

    if let Err(e) = host.interface_claim(
        session.client(),
        device,
        interface.number,
        interface.alternate_setting,
    ) {
        warn!(
            op = "interface_claim",
            code = e.code(),
            "Failed to claim interface {}: {}",
            interface.number,
            e
        );
        session.mark_unclaimed();
        return false;
    }

    match session.mark_claimed(interface.number, interface.alternate_setting) {
        Ok(()) => {
            info!(
                "Claimed MIDI interface {} (alt {}) on device {}",
                interface.number, interface.alternate_setting, device
            );
            true
        }
        Err(e) => {
            warn!(op = "interface_claim", code = e.code(), "Session refused claim: {}", e);
            false
        }
    }
}

/// Allocate (and for IN, submit) a transfer for a bulk endpoint
///
/// A non-bulk endpoint takes the session out of `Ready`; a later bulk
/// endpoint may bring it back. Returns `true` when this endpoint made the
/// session ready.
pub fn provision_endpoint<H: UsbHost + ?Sized>(
    host: &H,
    session: &mut DeviceSession,
    endpoint: &EndpointDescriptor,
    completions: &CompletionSender,
) -> bool {
    if endpoint.transfer_kind() != TransferKind::Bulk {
        warn!(
            op = "endpoint_check",
            code = HostError::NotSupported.code(),
            "Endpoint {:#04x} is {:?}, not bulk; rejected",
            endpoint.address,
            endpoint.transfer_kind()
        );
        session.mark_not_ready();
        return false;
    }

    let Some(device) = session.device() else {
        return false;
    };
    let size = endpoint.max_packet_size();

    if endpoint.is_in() {
        provision_in(host, session, endpoint, size, completions);
    } else if session.has_out_transfer() {
        debug!("OUT transfer already allocated, endpoint {:#04x} ignored", endpoint.address);
    } else {
        match host.transfer_alloc(size) {
            Ok(mut transfer) => {
                transfer.bind(device, endpoint.address, size, completions.clone());
                debug!("Allocated OUT transfer on endpoint {:#04x}", endpoint.address);
                session.set_out_transfer(transfer);
            }
            Err(e) => {
                warn!(
                    op = "transfer_alloc",
                    code = e.code(),
                    "OUT transfer for endpoint {:#04x}: {}",
                    endpoint.address,
                    e
                );
            }
        }
    }

    let became_ready = session.refresh_readiness();
    if became_ready {
        info!("MIDI is ready on device {}", device);
    }
    became_ready
}

fn provision_in<H: UsbHost + ?Sized>(
    host: &H,
    session: &mut DeviceSession,
    endpoint: &EndpointDescriptor,
    size: usize,
    completions: &CompletionSender,
) {
    let Some(device) = session.device() else {
        return;
    };
    if session.first_empty_in_slot().is_none() {
        debug!("IN slots already filled, endpoint {:#04x} ignored", endpoint.address);
        return;
    }

    for index in 0..session.in_slot_count() {
        if !matches!(session.in_slot(index), Some(InSlot::Empty)) {
            continue;
        }
        // a failed slot stays empty; the rest are still tried
        let mut transfer = match host.transfer_alloc(size) {
            Ok(transfer) => transfer,
            Err(e) => {
                warn!(
                    op = "transfer_alloc",
                    code = e.code(),
                    "IN transfer {} for endpoint {:#04x}: {}",
                    index,
                    endpoint.address,
                    e
                );
                continue;
            }
        };
        transfer.bind(device, endpoint.address, size, completions.clone());
        let id = transfer.id();
        session.set_in_slot(index, InSlot::InFlight(id));

        match host.transfer_submit(transfer) {
            Ok(()) => debug!(
                "Submitted IN transfer {} ({} bytes) on endpoint {:#04x}",
                index, size, endpoint.address
            ),
            Err(SubmitError { error, transfer }) => {
                warn!(
                    op = "transfer_submit",
                    code = error.code(),
                    "IN transfer {} on endpoint {:#04x}: {}",
                    index,
                    endpoint.address,
                    error
                );
                session.set_in_slot(index, InSlot::Parked(transfer));
            }
        }
    }
}
