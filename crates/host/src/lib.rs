//! USB-MIDI host driver
//!
//! Watches the USB host stack for class-compliant MIDI devices, claims the
//! MIDI-streaming interface of the first one announced, keeps a bulk IN
//! transfer in flight and decodes what arrives into a bounded queue of
//! channel-voice [`MidiEvent`](protocol::MidiEvent)s.
//!
//! ```no_run
//! use common::create_driver_bridge;
//! use host::{DriverSettings, MidiDriver, usb::RusbHost};
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let (_bridge, worker) = create_driver_bridge();
//! let host = RusbHost::install(Vec::new())?;
//! let driver = MidiDriver::install(host, DriverSettings::default())?
//!     .register_client()?
//!     .start_event_loop(worker)?;
//!
//! let events = driver.events();
//! while let Some(event) = events.try_pop(Duration::from_secs(1)) {
//!     println!("{event}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod usb;

pub use config::HostConfig;
pub use driver::{
    DriverSettings, InstalledDriver, MidiDriver, MidiEvents, RegisteredDriver, RunningDriver,
};
