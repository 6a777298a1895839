//! Per-device session state
//!
//! One session is shared between the event loop (which provisions it) and
//! the transfer pump (which reads the current device for stale checks).
//!
//! ```text
//! Idle --open--> DeviceOpened --claim--> InterfaceClaimed --IN+OUT--> Ready
//!   ^                 |
//!   +-----open--------+  (a new device always restarts at DeviceOpened)
//! ```

use crate::usb::backend::{ClientHandle, DeviceHandle, HostError, HostResult, Transfer, TransferId};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    DeviceOpened,
    InterfaceClaimed,
    Ready,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::DeviceOpened => "device-opened",
            SessionState::InterfaceClaimed => "interface-claimed",
            SessionState::Ready => "ready",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One IN transfer slot
#[derive(Debug, Default)]
pub enum InSlot {
    #[default]
    Empty,
    /// Owned by the host until it completes
    InFlight(TransferId),
    /// Allocated but the host refused it; the pipe sits idle
    Parked(Transfer),
}

impl InSlot {
    pub fn is_allocated(&self) -> bool {
        !matches!(self, InSlot::Empty)
    }

    fn holds(&self, id: TransferId) -> bool {
        match self {
            InSlot::Empty => false,
            InSlot::InFlight(current) => *current == id,
            InSlot::Parked(transfer) => transfer.id() == id,
        }
    }
}

/// The driver's view of the one device it manages
#[derive(Debug)]
pub struct DeviceSession {
    client: ClientHandle,
    device: Option<DeviceHandle>,
    state: SessionState,
    claimed: Option<(u8, u8)>,
    in_slots: Vec<InSlot>,
    out_transfer: Option<Transfer>,
}

impl DeviceSession {
    /// Fresh idle session with `in_slots` IN transfer slots (at least one)
    pub fn new(client: ClientHandle, in_slots: usize) -> Self {
        let mut slots = Vec::with_capacity(in_slots.max(1));
        slots.resize_with(in_slots.max(1), InSlot::default);
        Self {
            client,
            device: None,
            state: SessionState::Idle,
            claimed: None,
            in_slots: slots,
            out_transfer: None,
        }
    }

    pub fn client(&self) -> ClientHandle {
        self.client
    }

    pub fn device(&self) -> Option<DeviceHandle> {
        self.device
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Start over with a newly opened device
    ///
    /// Transfers of the previous device are forgotten here; in-flight ones
    /// come back later and are rejected as stale.
    pub fn open(&mut self, device: DeviceHandle) {
        self.device = Some(device);
        self.state = SessionState::DeviceOpened;
        self.claimed = None;
        self.out_transfer = None;
        for slot in &mut self.in_slots {
            *slot = InSlot::Empty;
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.is_some()
    }

    /// (interface number, alternate setting) of the claimed interface
    pub fn claimed_interface(&self) -> Option<(u8, u8)> {
        self.claimed
    }

    pub fn mark_claimed(&mut self, interface: u8, alternate_setting: u8) -> HostResult<()> {
        if self.state != SessionState::DeviceOpened || self.claimed.is_some() {
            return Err(HostError::InvalidState);
        }
        self.claimed = Some((interface, alternate_setting));
        self.state = SessionState::InterfaceClaimed;
        Ok(())
    }

    pub fn mark_unclaimed(&mut self) {
        self.claimed = None;
        if self.device.is_some() {
            self.state = SessionState::DeviceOpened;
        }
    }

    pub fn in_slot_count(&self) -> usize {
        self.in_slots.len()
    }

    pub fn in_slot(&self, index: usize) -> Option<&InSlot> {
        self.in_slots.get(index)
    }

    /// Index of the first slot with nothing allocated in it
    pub fn first_empty_in_slot(&self) -> Option<usize> {
        self.in_slots
            .iter()
            .position(|slot| matches!(slot, InSlot::Empty))
    }

    pub fn set_in_slot(&mut self, index: usize, slot: InSlot) {
        if let Some(current) = self.in_slots.get_mut(index) {
            *current = slot;
        }
    }

    /// Keep a transfer the host refused to resubmit in the slot it belongs to
    ///
    /// Returns the transfer back if no slot of this session owns it.
    pub fn park_in_transfer(&mut self, transfer: Transfer) -> Option<Transfer> {
        let id = transfer.id();
        match self.in_slots.iter_mut().find(|slot| slot.holds(id)) {
            Some(slot) => {
                *slot = InSlot::Parked(transfer);
                None
            }
            None => Some(transfer),
        }
    }

    pub fn has_out_transfer(&self) -> bool {
        self.out_transfer.is_some()
    }

    pub fn set_out_transfer(&mut self, transfer: Transfer) {
        self.out_transfer = Some(transfer);
    }

    /// Borrow the OUT transfer for sending
    pub fn take_out_transfer(&mut self) -> Option<Transfer> {
        self.out_transfer.take()
    }

    /// At least one IN and one OUT transfer are allocated
    pub fn buffers_ready(&self) -> bool {
        self.in_slots.first().is_some_and(InSlot::is_allocated) && self.out_transfer.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Leave `Ready` after a rejected endpoint; allocated transfers stay
    pub fn mark_not_ready(&mut self) {
        if self.state == SessionState::Ready {
            self.state = SessionState::InterfaceClaimed;
        }
    }

    /// Re-evaluate readiness from the allocated transfers
    ///
    /// Returns `true` only on the transition into `Ready`.
    pub fn refresh_readiness(&mut self) -> bool {
        let buffers = self.buffers_ready();
        match self.state {
            SessionState::InterfaceClaimed if buffers => {
                self.state = SessionState::Ready;
                true
            }
            SessionState::Ready if !buffers => {
                self.state = SessionState::InterfaceClaimed;
                false
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened() -> DeviceSession {
        let mut session = DeviceSession::new(ClientHandle(1), 1);
        session.open(DeviceHandle(1));
        session
    }

    #[test]
    fn test_new_session_is_idle() {
        let session = DeviceSession::new(ClientHandle(1), 0);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.in_slot_count(), 1);
        assert!(session.device().is_none());
    }

    #[test]
    fn test_claim_requires_open_device() {
        let mut session = DeviceSession::new(ClientHandle(1), 1);
        assert_eq!(session.mark_claimed(1, 0), Err(HostError::InvalidState));

        session.open(DeviceHandle(1));
        assert!(session.mark_claimed(1, 0).is_ok());
        assert_eq!(session.state(), SessionState::InterfaceClaimed);
        assert_eq!(session.mark_claimed(2, 0), Err(HostError::InvalidState));
    }

    #[test]
    fn test_ready_needs_both_directions() {
        let mut session = opened();
        session.mark_claimed(1, 0).unwrap();

        session.set_out_transfer(Transfer::new(TransferId(1), 64));
        assert!(!session.refresh_readiness());

        session.set_in_slot(0, InSlot::InFlight(TransferId(2)));
        assert!(session.refresh_readiness());
        assert!(session.is_ready());
        assert!(!session.refresh_readiness());
    }

    #[test]
    fn test_ready_drops_back_without_out() {
        let mut session = opened();
        session.mark_claimed(1, 0).unwrap();
        session.set_out_transfer(Transfer::new(TransferId(1), 64));
        session.set_in_slot(0, InSlot::InFlight(TransferId(2)));
        session.refresh_readiness();

        let out = session.take_out_transfer();
        assert!(out.is_some());
        session.refresh_readiness();
        assert_eq!(session.state(), SessionState::InterfaceClaimed);
    }

    #[test]
    fn test_not_ready_until_refreshed() {
        let mut session = opened();
        session.mark_claimed(1, 0).unwrap();
        session.set_out_transfer(Transfer::new(TransferId(1), 64));
        session.set_in_slot(0, InSlot::InFlight(TransferId(2)));
        assert!(session.refresh_readiness());

        session.mark_not_ready();
        assert_eq!(session.state(), SessionState::InterfaceClaimed);
        assert!(session.has_out_transfer());

        // a later bulk endpoint re-evaluates from the buffers
        assert!(session.refresh_readiness());
    }

    #[test]
    fn test_open_resets_everything() {
        let mut session = opened();
        session.mark_claimed(1, 0).unwrap();
        session.set_in_slot(0, InSlot::InFlight(TransferId(5)));

        session.open(DeviceHandle(2));
        assert_eq!(session.device(), Some(DeviceHandle(2)));
        assert_eq!(session.state(), SessionState::DeviceOpened);
        assert!(!session.is_claimed());
        assert_eq!(session.first_empty_in_slot(), Some(0));
    }

    #[test]
    fn test_park_only_known_transfers() {
        let mut session = opened();
        session.set_in_slot(0, InSlot::InFlight(TransferId(9)));

        assert!(session.park_in_transfer(Transfer::new(TransferId(9), 8)).is_none());
        assert!(matches!(session.in_slot(0), Some(InSlot::Parked(_))));

        let stranger = session.park_in_transfer(Transfer::new(TransferId(10), 8));
        assert!(stranger.is_some());
    }
}
