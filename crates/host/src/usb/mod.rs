//! USB subsystem
//!
//! The driver runs on two dedicated threads so the Tokio runtime never
//! blocks on USB:
//!
//! - the event loop ([`worker`]) pumps library and client events, opens
//!   announced devices and provisions them ([`client`], [`enumeration`]);
//! - the transfer pump ([`transfers`]) handles completed IN transfers,
//!   feeds the event queue and resubmits.
//!
//! Both talk to the host stack through [`backend::UsbHost`], implemented by
//! libusb ([`rusb_host`]) and by an in-process simulation ([`sim`]).

pub mod backend;
pub mod client;
pub mod enumeration;
pub mod rusb_host;
pub mod session;
pub mod sim;
pub mod transfers;
pub mod worker;

pub use backend::{
    ClientConfig, ClientEvent, ClientHandle, DeviceAddress, DeviceHandle, DeviceInfo, HostError,
    HostResult, LibEventFlags, SubmitError, Transfer, TransferId, TransferStatus, UsbHost,
};
pub use rusb_host::RusbHost;
pub use session::{DeviceSession, SessionState};
pub use sim::SimulatedHost;
pub use worker::{EventLoop, LoopTimeouts, spawn_event_loop};
