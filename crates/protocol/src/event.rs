//! Decoded MIDI channel-voice events
//!
//! A [`MidiEvent`] is a small `Copy` value: it is produced by the transfer
//! path, copied into the event queue and handed to a consumer by value.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel-voice status nibbles (upper four bits of the status byte)
pub mod status {
    pub const NOTE_OFF: u8 = 0x8;
    pub const NOTE_ON: u8 = 0x9;
    pub const POLY_PRESSURE: u8 = 0xA;
    pub const CONTROL_CHANGE: u8 = 0xB;
    pub const PROGRAM_CHANGE: u8 = 0xC;
    pub const CHANNEL_PRESSURE: u8 = 0xD;
    pub const PITCH_BEND: u8 = 0xE;
}

/// MIDI channel, 0..=15 on the wire (displayed as 1..=16)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Channel(u8);

impl Channel {
    /// Build a channel from the low nibble of a status byte
    pub const fn from_nibble(nibble: u8) -> Self {
        Self(nibble & 0x0F)
    }

    /// Zero-based channel index
    pub const fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0 + 1)
    }
}

/// Controller numbers with a name; everything else is `Other`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlChange {
    SustainPedal,
    Portamento,
    Sostenuto,
    SoftPedal,
    Other(u8),
}

impl ControlChange {
    pub const fn from_number(number: u8) -> Self {
        match number {
            0x40 => Self::SustainPedal,
            0x41 => Self::Portamento,
            0x42 => Self::Sostenuto,
            0x43 => Self::SoftPedal,
            n => Self::Other(n),
        }
    }

    pub const fn number(self) -> u8 {
        match self {
            Self::SustainPedal => 0x40,
            Self::Portamento => 0x41,
            Self::Sostenuto => 0x42,
            Self::SoftPedal => 0x43,
            Self::Other(n) => n,
        }
    }
}

/// Payload of a channel-voice message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MidiMessage {
    NoteOff { note: u8, velocity: u8 },
    NoteOn { note: u8, velocity: u8 },
    PolyPressure { note: u8, pressure: u8 },
    ControlChange { controller: ControlChange, value: u8 },
    ProgramChange { program: u8 },
    ChannelPressure { pressure: u8 },
    /// Raw data bytes; see [`MidiMessage::pitch_bend`]
    PitchBend { lsb: u8, msb: u8 },
}

impl MidiMessage {
    /// Decode from a status nibble and the two data bytes
    ///
    /// Returns `None` for system messages (nibble 0xF) and non-status nibbles.
    /// Data bytes are carried as received, high bit included.
    pub fn from_parts(status_nibble: u8, d1: u8, d2: u8) -> Option<Self> {
        let message = match status_nibble {
            status::NOTE_OFF => Self::NoteOff {
                note: d1,
                velocity: d2,
            },
            status::NOTE_ON => Self::NoteOn {
                note: d1,
                velocity: d2,
            },
            status::POLY_PRESSURE => Self::PolyPressure {
                note: d1,
                pressure: d2,
            },
            status::CONTROL_CHANGE => Self::ControlChange {
                controller: ControlChange::from_number(d1),
                value: d2,
            },
            status::PROGRAM_CHANGE => Self::ProgramChange { program: d1 },
            status::CHANNEL_PRESSURE => Self::ChannelPressure { pressure: d1 },
            status::PITCH_BEND => Self::PitchBend { lsb: d1, msb: d2 },
            _ => return None,
        };
        Some(message)
    }

    /// 14-bit pitch-bend value (0x2000 is centre) from the low seven bits
    /// of each data byte
    pub const fn pitch_bend(&self) -> Option<u16> {
        match *self {
            Self::PitchBend { lsb, msb } => {
                Some((lsb & 0x7F) as u16 | (((msb & 0x7F) as u16) << 7))
            }
            _ => None,
        }
    }

    /// Status nibble of this message
    pub const fn status_nibble(&self) -> u8 {
        match self {
            Self::NoteOff { .. } => status::NOTE_OFF,
            Self::NoteOn { .. } => status::NOTE_ON,
            Self::PolyPressure { .. } => status::POLY_PRESSURE,
            Self::ControlChange { .. } => status::CONTROL_CHANGE,
            Self::ProgramChange { .. } => status::PROGRAM_CHANGE,
            Self::ChannelPressure { .. } => status::CHANNEL_PRESSURE,
            Self::PitchBend { .. } => status::PITCH_BEND,
        }
    }
}

/// A decoded channel-voice event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub channel: Channel,
    pub message: MidiMessage,
}

impl MidiEvent {
    pub const fn new(channel: Channel, message: MidiMessage) -> Self {
        Self { channel, message }
    }

    /// The full status byte (`status << 4 | channel`)
    pub const fn status_byte(&self) -> u8 {
        (self.message.status_nibble() << 4) | self.channel.index()
    }
}

impl fmt::Display for MidiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            MidiMessage::NoteOff { note, velocity } => {
                write!(f, "{} note-off {} vel {}", self.channel, note, velocity)
            }
            MidiMessage::NoteOn { note, velocity } => {
                write!(f, "{} note-on {} vel {}", self.channel, note, velocity)
            }
            MidiMessage::PolyPressure { note, pressure } => {
                write!(f, "{} poly-pressure {} {}", self.channel, note, pressure)
            }
            MidiMessage::ControlChange { controller, value } => {
                write!(f, "{} cc {:?} = {}", self.channel, controller, value)
            }
            MidiMessage::ProgramChange { program } => {
                write!(f, "{} program {}", self.channel, program)
            }
            MidiMessage::ChannelPressure { pressure } => {
                write!(f, "{} pressure {}", self.channel, pressure)
            }
            MidiMessage::PitchBend { .. } => {
                let value = self.message.pitch_bend().unwrap_or_default();
                write!(f, "{} pitch-bend {}", self.channel, value)
            }
        }
    }
}
