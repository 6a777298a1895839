//! Common utilities for usb-midi-host
//!
//! Runtime plumbing shared by the driver and its consumers: the bounded
//! event queue, the resubmission gate, the async bridge between the Tokio
//! runtime and the USB thread, error handling and logging setup.

pub mod channel;
pub mod error;
pub mod gate;
pub mod logging;
pub mod queue;
pub mod test_utils;

pub use channel::{
    DriverBridge, DriverCommand, DriverEvent, DriverStatus, DriverWorker, create_driver_bridge,
};
pub use error::{Error, Result};
pub use gate::{Gate, GateGuard};
pub use logging::setup_logging;
pub use queue::{DEFAULT_QUEUE_CAPACITY, EventQueue};
