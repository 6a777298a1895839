//! USB-MIDI event packets
//!
//! A MIDI-streaming bulk endpoint carries a sequence of 4-byte packets:
//!
//! ```text
//! byte0   cable number (high nibble) | code index number (low nibble)
//! byte1   MIDI status byte (status << 4 | channel)
//! byte2   data byte 1
//! byte3   data byte 2
//! ```
//!
//! Only byte1..=3 are interpreted. byte0 matters solely for recognizing
//! all-zero padding.

use crate::event::{Channel, MidiEvent, MidiMessage};

/// Size of one USB-MIDI event packet
pub const PACKET_SIZE: usize = 4;

/// Timing clock system real-time status
pub const TIMING_CLOCK: u8 = 0xF8;
/// Active sensing system real-time status
pub const ACTIVE_SENSING: u8 = 0xFE;

/// Why a packet produced no event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// All four bytes zero
    Padding,
    /// Timing clock or active sensing
    RealTime,
    /// byte1 is not a status byte (e.g. a SysEx continuation)
    NotStatus,
    /// A system message other than the filtered real-time ones
    System,
}

/// One 4-byte USB-MIDI event packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbMidiEventPacket(pub [u8; PACKET_SIZE]);

impl UsbMidiEventPacket {
    /// Build from a 4-byte slice; `None` if the slice is not exactly 4 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; PACKET_SIZE]>::try_from(bytes).ok().map(Self)
    }

    pub const fn cable_number(&self) -> u8 {
        self.0[0] >> 4
    }

    pub const fn code_index(&self) -> u8 {
        self.0[0] & 0x0F
    }

    pub const fn status(&self) -> u8 {
        self.0[1]
    }

    /// Decode into a channel-voice event, or say why there is none
    pub fn decode(&self) -> Result<MidiEvent, Discard> {
        let [b0, b1, b2, b3] = self.0;

        if b0 == 0 && b1 == 0 && b2 == 0 && b3 == 0 {
            return Err(Discard::Padding);
        }
        if b1 == TIMING_CLOCK || b1 == ACTIVE_SENSING {
            return Err(Discard::RealTime);
        }
        if b1 & 0x80 == 0 {
            return Err(Discard::NotStatus);
        }

        MidiMessage::from_parts(b1 >> 4, b2, b3)
            .map(|message| MidiEvent::new(Channel::from_nibble(b1), message))
            .ok_or(Discard::System)
    }
}

/// Iterator over the events carried by a received bulk buffer
///
/// Walks `buf` in 4-byte strides; a trailing partial packet is ignored.
pub struct PacketDecoder<'a> {
    chunks: std::slice::ChunksExact<'a, u8>,
}

impl<'a> PacketDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            chunks: buf.chunks_exact(PACKET_SIZE),
        }
    }
}

impl Iterator for PacketDecoder<'_> {
    type Item = MidiEvent;

    fn next(&mut self) -> Option<MidiEvent> {
        for chunk in self.chunks.by_ref() {
            if let Some(event) = UsbMidiEventPacket::from_slice(chunk).and_then(|p| p.decode().ok())
            {
                return Some(event);
            }
        }
        None
    }
}

/// Decode every event in a received buffer
pub fn decode_packets(buf: &[u8]) -> PacketDecoder<'_> {
    PacketDecoder::new(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ControlChange;

    #[test]
    fn test_note_on() {
        let event = UsbMidiEventPacket([0x09, 0x90, 0x3C, 0x64]).decode().unwrap();
        assert_eq!(event.channel.index(), 0);
        assert_eq!(
            event.message,
            MidiMessage::NoteOn {
                note: 0x3C,
                velocity: 0x64
            }
        );
    }

    #[test]
    fn test_control_change() {
        let event = UsbMidiEventPacket([0x0B, 0xB2, 0x40, 0x7F]).decode().unwrap();
        assert_eq!(event.channel.index(), 2);
        assert_eq!(
            event.message,
            MidiMessage::ControlChange {
                controller: ControlChange::SustainPedal,
                value: 0x7F
            }
        );
    }

    #[test]
    fn test_discard_rules() {
        assert_eq!(
            UsbMidiEventPacket([0, 0, 0, 0]).decode(),
            Err(Discard::Padding)
        );
        assert_eq!(
            UsbMidiEventPacket([0x0F, 0xF8, 0, 0]).decode(),
            Err(Discard::RealTime)
        );
        assert_eq!(
            UsbMidiEventPacket([0x0F, 0xFE, 0, 0]).decode(),
            Err(Discard::RealTime)
        );
        assert_eq!(
            UsbMidiEventPacket([0x04, 0x43, 0x12, 0x00]).decode(),
            Err(Discard::NotStatus)
        );
        assert_eq!(
            UsbMidiEventPacket([0x0F, 0xFA, 0, 0]).decode(),
            Err(Discard::System)
        );
    }

    #[test]
    fn test_cable_and_code_index() {
        let packet = UsbMidiEventPacket([0x19, 0x90, 0x3C, 0x64]);
        assert_eq!(packet.cable_number(), 1);
        assert_eq!(packet.code_index(), 0x9);
    }

    #[test]
    fn test_decoder_skips_padding_and_partial_tail() {
        let buf = [
            0x09, 0x90, 0x3C, 0x64, // note on
            0x00, 0x00, 0x00, 0x00, // padding
            0x0F, 0xF8, 0x00, 0x00, // clock
            0x08, 0x80, 0x3C, 0x00, // note off
            0x09, 0x90, // partial
        ];
        let events: Vec<_> = decode_packets(&buf).collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1].message, MidiMessage::NoteOff { note: 0x3C, .. }));
    }
}
