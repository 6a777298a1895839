//! Wire formats for a USB-MIDI host
//!
//! This crate is pure data handling with no I/O:
//!
//! - [`descriptor`]: bounds-checked walking of USB configuration descriptors
//! - [`packet`]: the 4-byte USB-MIDI event packet and its discard rules
//! - [`event`]: decoded channel-voice [`MidiEvent`]s
//! - [`builder`]: synthesizing configuration descriptors
//!
//! # Example
//!
//! ```
//! use protocol::{MidiMessage, decode_packets};
//!
//! let received = [0x09, 0x90, 0x3C, 0x64, 0x00, 0x00, 0x00, 0x00];
//! let events: Vec<_> = decode_packets(&received).collect();
//!
//! assert_eq!(events.len(), 1);
//! assert_eq!(
//!     events[0].message,
//!     MidiMessage::NoteOn { note: 0x3C, velocity: 0x64 }
//! );
//! ```

pub mod builder;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod packet;

pub use builder::{ConfigBuilder, midi_device_config};
pub use descriptor::{
    ConfigDescriptor, ConfigHeader, Descriptor, DescriptorWalker, EndpointDescriptor,
    InterfaceDescriptor, TransferKind,
};
pub use error::{ProtocolError, Result};
pub use event::{Channel, ControlChange, MidiEvent, MidiMessage};
pub use packet::{Discard, PACKET_SIZE, PacketDecoder, UsbMidiEventPacket, decode_packets};
