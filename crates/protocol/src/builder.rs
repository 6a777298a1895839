//! Configuration descriptor builder
//!
//! Produces the raw byte layout a device returns for GET_DESCRIPTOR
//! (Configuration). Used by the simulated host and by tests that need
//! well-formed or deliberately broken descriptors.

use crate::descriptor::{CLASS_AUDIO, SUBCLASS_AUDIO_CONTROL, SUBCLASS_MIDI_STREAMING, kind};
use byteorder::{ByteOrder, LittleEndian};

/// bmAttributes value for a bulk endpoint
pub const ATTR_BULK: u8 = 0x02;
/// bmAttributes value for an interrupt endpoint
pub const ATTR_INTERRUPT: u8 = 0x03;

/// Incrementally assembles a configuration descriptor
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    configuration_value: u8,
    num_interfaces: u8,
    body: Vec<u8>,
}

impl ConfigBuilder {
    pub fn new(configuration_value: u8) -> Self {
        Self {
            configuration_value,
            num_interfaces: 0,
            body: Vec::new(),
        }
    }

    /// Standard interface descriptor; alt-setting 0 counts towards bNumInterfaces
    pub fn interface(
        mut self,
        number: u8,
        alternate_setting: u8,
        class: u8,
        subclass: u8,
        protocol: u8,
        num_endpoints: u8,
    ) -> Self {
        if alternate_setting == 0 {
            self.num_interfaces += 1;
        }
        self.body.extend_from_slice(&[
            9,
            kind::INTERFACE,
            number,
            alternate_setting,
            num_endpoints,
            class,
            subclass,
            protocol,
            0,
        ]);
        self
    }

    /// 7-byte standard endpoint descriptor
    pub fn endpoint(mut self, address: u8, attributes: u8, max_packet_size: u16) -> Self {
        let mut ep = [7, kind::ENDPOINT, address, attributes, 0, 0, 0];
        LittleEndian::write_u16(&mut ep[4..6], max_packet_size);
        self.body.extend_from_slice(&ep);
        self
    }

    /// 9-byte audio-class endpoint descriptor (bRefresh, bSynchAddress zeroed)
    pub fn audio_endpoint(mut self, address: u8, attributes: u8, max_packet_size: u16) -> Self {
        let mut ep = [9, kind::ENDPOINT, address, attributes, 0, 0, 0, 0, 0];
        LittleEndian::write_u16(&mut ep[4..6], max_packet_size);
        self.body.extend_from_slice(&ep);
        self
    }

    /// Class-specific descriptor with the given type and payload
    pub fn class_specific(mut self, descriptor_type: u8, payload: &[u8]) -> Self {
        self.body.push((payload.len() + 2) as u8);
        self.body.push(descriptor_type);
        self.body.extend_from_slice(payload);
        self
    }

    /// Append raw bytes as-is (no length bookkeeping)
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.body.extend_from_slice(bytes);
        self
    }

    /// Emit the descriptor with a correct wTotalLength
    pub fn build(self) -> Vec<u8> {
        let total = (9 + self.body.len()) as u16;
        let mut out = vec![
            9,
            kind::CONFIGURATION,
            0,
            0,
            self.num_interfaces,
            self.configuration_value,
            0,
            0x80,
            50,
        ];
        LittleEndian::write_u16(&mut out[2..4], total);
        out.extend_from_slice(&self.body);
        out
    }
}

/// A class-compliant single-cable USB-MIDI device
///
/// Audio-control interface 0, MIDI-streaming interface 1 with one bulk OUT
/// (0x01) and one bulk IN (0x81) endpoint.
pub fn midi_device_config(max_packet_size: u16) -> Vec<u8> {
    ConfigBuilder::new(1)
        .interface(0, 0, CLASS_AUDIO, SUBCLASS_AUDIO_CONTROL, 0, 0)
        .class_specific(kind::CS_INTERFACE, &[0x01, 0x00, 0x01, 0x09, 0x00, 0x01, 0x01])
        .interface(1, 0, CLASS_AUDIO, SUBCLASS_MIDI_STREAMING, 0, 2)
        .class_specific(kind::CS_INTERFACE, &[0x01, 0x00, 0x01, 0x41, 0x00])
        .class_specific(kind::CS_INTERFACE, &[0x02, 0x01, 0x01, 0x00])
        .class_specific(kind::CS_INTERFACE, &[0x02, 0x02, 0x02, 0x00])
        .class_specific(kind::CS_INTERFACE, &[0x03, 0x01, 0x03, 0x01, 0x02, 0x01, 0x00])
        .class_specific(kind::CS_INTERFACE, &[0x03, 0x02, 0x04, 0x01, 0x01, 0x01, 0x00])
        .audio_endpoint(0x01, ATTR_BULK, max_packet_size)
        .class_specific(kind::CS_ENDPOINT, &[0x01, 0x01, 0x01])
        .audio_endpoint(0x81, ATTR_BULK, max_packet_size)
        .class_specific(kind::CS_ENDPOINT, &[0x01, 0x01, 0x03])
        .build()
}
