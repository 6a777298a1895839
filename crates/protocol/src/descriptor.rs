//! USB configuration descriptors
//!
//! A configuration descriptor is a flat buffer of chained sub-descriptors,
//! each starting with `(bLength, bDescriptorType)`. [`DescriptorWalker`]
//! visits them in order and refuses to step past the declared total length.

use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Standard and class-specific descriptor type codes
pub mod kind {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const DEVICE_QUALIFIER: u8 = 0x06;
    pub const OTHER_SPEED_CONFIGURATION: u8 = 0x07;
    pub const INTERFACE_POWER: u8 = 0x08;
    pub const OTG: u8 = 0x09;
    pub const DEBUG: u8 = 0x0A;
    pub const INTERFACE_ASSOCIATION: u8 = 0x0B;
    pub const CS_INTERFACE: u8 = 0x24;
    pub const CS_ENDPOINT: u8 = 0x25;
}

/// USB interface class for audio
pub const CLASS_AUDIO: u8 = 0x01;
/// Audio subclass: audio control
pub const SUBCLASS_AUDIO_CONTROL: u8 = 0x01;
/// Audio subclass: MIDI streaming
pub const SUBCLASS_MIDI_STREAMING: u8 = 0x03;

/// Direction bit of bEndpointAddress
pub const ENDPOINT_DIR_IN: u8 = 0x80;

const CONFIG_HEADER_LEN: usize = 9;
const INTERFACE_LEN: usize = 9;
const ENDPOINT_LEN: usize = 7;

/// Fixed fields of the configuration descriptor itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigHeader {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigHeader {
    fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < CONFIG_HEADER_LEN {
            return Err(ProtocolError::ShortDescriptor {
                kind: "configuration",
                length: raw.len(),
                needed: CONFIG_HEADER_LEN,
            });
        }
        Ok(Self {
            total_length: LittleEndian::read_u16(&raw[2..4]),
            num_interfaces: raw[4],
            configuration_value: raw[5],
            attributes: raw[7],
            max_power: raw[8],
        })
    }
}

/// Standard interface descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceDescriptor {
    fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < INTERFACE_LEN {
            return Err(ProtocolError::ShortDescriptor {
                kind: "interface",
                length: raw.len(),
                needed: INTERFACE_LEN,
            });
        }
        Ok(Self {
            number: raw[2],
            alternate_setting: raw[3],
            num_endpoints: raw[4],
            class: raw[5],
            subclass: raw[6],
            protocol: raw[7],
        })
    }

    /// Audio class, MIDI-streaming subclass, protocol 0
    pub fn is_midi_streaming(&self) -> bool {
        self.class == CLASS_AUDIO && self.subclass == SUBCLASS_MIDI_STREAMING && self.protocol == 0
    }
}

/// Endpoint transfer type (bmAttributes bits 1..0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Standard endpoint descriptor
///
/// Audio-class endpoints are 9 bytes long; the two trailing bytes
/// (bRefresh, bSynchAddress) are not needed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    /// Raw wMaxPacketSize, including high-bandwidth bits
    pub max_packet_size_raw: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < ENDPOINT_LEN {
            return Err(ProtocolError::ShortDescriptor {
                kind: "endpoint",
                length: raw.len(),
                needed: ENDPOINT_LEN,
            });
        }
        Ok(Self {
            address: raw[2],
            attributes: raw[3],
            max_packet_size_raw: LittleEndian::read_u16(&raw[4..6]),
            interval: raw[6],
        })
    }

    pub fn is_in(&self) -> bool {
        self.address & ENDPOINT_DIR_IN != 0
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub fn transfer_kind(&self) -> TransferKind {
        match self.attributes & 0x03 {
            0 => TransferKind::Control,
            1 => TransferKind::Isochronous,
            2 => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        }
    }

    /// Packet size in bytes (bits 10..0)
    pub fn max_packet_size(&self) -> usize {
        usize::from(self.max_packet_size_raw & 0x07FF)
    }
}

/// One sub-descriptor found by the walker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor<'a> {
    Configuration(ConfigHeader),
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    /// A standard descriptor with nothing to act on (device, string, ...)
    Standard { kind: u8 },
    /// CS_INTERFACE / CS_ENDPOINT payloads
    ClassSpecific { kind: u8, raw: &'a [u8] },
    Unknown { kind: u8, raw: &'a [u8] },
}

impl<'a> Descriptor<'a> {
    fn parse(kind: u8, raw: &'a [u8]) -> Result<Self> {
        Ok(match kind {
            kind::CONFIGURATION => Self::Configuration(ConfigHeader::parse(raw)?),
            kind::INTERFACE => Self::Interface(InterfaceDescriptor::parse(raw)?),
            kind::ENDPOINT => Self::Endpoint(EndpointDescriptor::parse(raw)?),
            kind::DEVICE
            | kind::STRING
            | kind::DEVICE_QUALIFIER
            | kind::OTHER_SPEED_CONFIGURATION
            | kind::INTERFACE_POWER
            | kind::OTG
            | kind::DEBUG
            | kind::INTERFACE_ASSOCIATION => Self::Standard { kind },
            kind::CS_INTERFACE | kind::CS_ENDPOINT => Self::ClassSpecific { kind, raw },
            _ => Self::Unknown { kind, raw },
        })
    }
}

/// Linear, single-pass walk over chained sub-descriptors
///
/// Yields at most one error, then stops for good.
#[derive(Debug, Clone)]
pub struct DescriptorWalker<'a> {
    buf: &'a [u8],
    total: usize,
    offset: usize,
    done: bool,
}

impl<'a> DescriptorWalker<'a> {
    /// Walk `buf` up to `total_length` bytes
    ///
    /// The walk never reads beyond `min(total_length, buf.len())`.
    pub fn new(buf: &'a [u8], total_length: usize) -> Self {
        Self {
            buf,
            total: total_length,
            offset: 0,
            done: false,
        }
    }

    /// Current cursor position
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn fail(&mut self, err: ProtocolError) -> Option<Result<Descriptor<'a>>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<'a> Iterator for DescriptorWalker<'a> {
    type Item = Result<Descriptor<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let limit = self.total.min(self.buf.len());
        if self.done || self.offset >= limit {
            return None;
        }

        let length = usize::from(self.buf[self.offset]);
        if length < 2 || self.offset + length > limit {
            return self.fail(ProtocolError::CorruptDescriptor {
                offset: self.offset,
                length,
                total: self.total,
            });
        }

        let raw = &self.buf[self.offset..self.offset + length];
        match Descriptor::parse(raw[1], raw) {
            Ok(descriptor) => {
                self.offset += length;
                Some(Ok(descriptor))
            }
            Err(e) => self.fail(e),
        }
    }
}

/// A complete configuration descriptor as returned by GET_DESCRIPTOR
#[derive(Debug, Clone, Copy)]
pub struct ConfigDescriptor<'a> {
    bytes: &'a [u8],
    header: ConfigHeader,
}

impl<'a> ConfigDescriptor<'a> {
    /// Validate the header and the declared total length
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < CONFIG_HEADER_LEN
            || usize::from(bytes[0]) < CONFIG_HEADER_LEN
            || bytes[1] != kind::CONFIGURATION
        {
            return Err(ProtocolError::InvalidConfigHeader);
        }

        let header = ConfigHeader::parse(&bytes[..CONFIG_HEADER_LEN])?;
        let declared = usize::from(header.total_length);
        if declared > bytes.len() {
            return Err(ProtocolError::TruncatedConfiguration {
                declared,
                available: bytes.len(),
            });
        }

        Ok(Self { bytes, header })
    }

    pub fn header(&self) -> ConfigHeader {
        self.header
    }

    pub fn total_length(&self) -> usize {
        usize::from(self.header.total_length)
    }

    /// Walk every sub-descriptor, starting with the configuration header
    pub fn walk(&self) -> DescriptorWalker<'a> {
        DescriptorWalker::new(self.bytes, self.total_length())
    }

    /// True if any interface in this configuration is MIDI streaming
    ///
    /// Stops quietly at the first corrupt descriptor.
    pub fn has_midi_streaming(&self) -> bool {
        self.walk()
            .map_while(|d| d.ok())
            .any(|d| matches!(d, Descriptor::Interface(i) if i.is_midi_streaming()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: [u8; 25] = [
        0x09, 0x02, 0x19, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, // config
        0x09, 0x04, 0x01, 0x00, 0x01, 0x01, 0x03, 0x00, 0x00, // MIDI streaming interface
        0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00, // bulk IN, 64 bytes
    ];

    #[test]
    fn test_walk_typed_descriptors() {
        let config = ConfigDescriptor::new(&CONFIG).unwrap();
        let descriptors: Vec<_> = config.walk().collect::<Result<_>>().unwrap();

        assert_eq!(descriptors.len(), 3);
        assert!(matches!(descriptors[0], Descriptor::Configuration(h) if h.num_interfaces == 1));
        match descriptors[1] {
            Descriptor::Interface(i) => {
                assert!(i.is_midi_streaming());
                assert_eq!(i.number, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        match descriptors[2] {
            Descriptor::Endpoint(ep) => {
                assert!(ep.is_in());
                assert_eq!(ep.transfer_kind(), TransferKind::Bulk);
                assert_eq!(ep.max_packet_size(), 64);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(config.has_midi_streaming());
    }

    #[test]
    fn test_overrun_stops_walk() {
        let mut bytes = CONFIG;
        bytes[18] = 0x20; // endpoint bLength overruns wTotalLength
        let config = ConfigDescriptor::new(&bytes).unwrap();
        let mut walker = config.walk();

        assert!(walker.next().unwrap().is_ok());
        assert!(walker.next().unwrap().is_ok());
        assert_eq!(
            walker.next(),
            Some(Err(ProtocolError::CorruptDescriptor {
                offset: 18,
                length: 0x20,
                total: 25
            }))
        );
        assert_eq!(walker.next(), None);
    }

    #[test]
    fn test_zero_length_is_corruption() {
        let mut bytes = CONFIG;
        bytes[9] = 0;
        let config = ConfigDescriptor::new(&bytes).unwrap();
        let results: Vec<_> = config.walk().collect();
        assert_eq!(results.len(), 2);
        assert!(results[1].is_err());
    }

    #[test]
    fn test_truncated_configuration() {
        let err = ConfigDescriptor::new(&CONFIG[..20]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::TruncatedConfiguration {
                declared: 25,
                available: 20
            }
        );
    }

    #[test]
    fn test_invalid_header() {
        assert_eq!(
            ConfigDescriptor::new(&CONFIG[9..]).unwrap_err(),
            ProtocolError::InvalidConfigHeader
        );
    }

    #[test]
    fn test_transfer_kind_uses_type_bits() {
        let interrupt = EndpointDescriptor {
            address: 0x81,
            attributes: 0x03,
            max_packet_size_raw: 8,
            interval: 1,
        };
        assert_eq!(interrupt.transfer_kind(), TransferKind::Interrupt);

        let high_bandwidth = EndpointDescriptor {
            address: 0x02,
            attributes: 0x02,
            max_packet_size_raw: 0x0A00,
            interval: 0,
        };
        assert_eq!(high_bandwidth.max_packet_size(), 0x200);
        assert!(!high_bandwidth.is_in());
        assert_eq!(high_bandwidth.number(), 2);
    }

    #[test]
    fn test_unknown_descriptor_is_yielded() {
        let bytes = [
            0x09, 0x02, 0x0C, 0x00, 0x00, 0x01, 0x00, 0x80, 0x32, // config
            0x03, 0x42, 0x00, // vendor type 0x42
        ];
        let config = ConfigDescriptor::new(&bytes).unwrap();
        let last = config.walk().last().unwrap().unwrap();
        assert!(matches!(last, Descriptor::Unknown { kind: 0x42, .. }));
    }
}
