use endian_codec::{DecodeBE, EncodeBE, PackedSize};

use crate::proto::pdu::Direction;

pub const GET_STATUS: u8 = 0x00;
pub const CLEAR_FEATURE: u8 = 0x01;
pub const SET_FEATURE: u8 = 0x03;
pub const GET_DESCRIPTOR: u8 = 0x06;
pub const GET_CONFIGURATION: u8 = 0x08;
pub const SET_CONFIGURATION: u8 = 0x09;
pub const GET_INTERFACE: u8 = 0x0A;
pub const SET_INTERFACE: u8 = 0x0B;

/// `wValue` of `CLEAR_FEATURE` addressed to an endpoint
pub const ENDPOINT_HALT: u16 = 0x00;

/// Bits 6..5 of `bmRequestType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RequestType {
    Standard = 0x00,
    Class = 0x20,
    Vendor = 0x40,
}

/// Bits 4..0 of `bmRequestType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Recipient {
    Device = 0x00,
    Interface = 0x01,
    Endpoint = 0x02,
    Other = 0x03,
}

/// The 8 byte control transfer setup stage.
///
/// Unlike the header it is embedded in, the multi-byte fields of a setup
/// packet are little endian on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const fn new(
        direction: Direction,
        request_type: RequestType,
        recipient: Recipient,
        request: u8,
    ) -> Self {
        let dir = match direction {
            Direction::Out => 0x00,
            Direction::In => 0x80,
        };

        Self {
            request_type: dir | request_type as u8 | recipient as u8,
            request,
            value: 0,
            index: 0,
            length: 0,
        }
    }

    pub const fn with_value(mut self, value: u16) -> Self {
        self.value = value;
        self
    }

    pub const fn with_index(mut self, index: u16) -> Self {
        self.index = index;
        self
    }

    pub const fn with_length(mut self, length: u16) -> Self {
        self.length = length;
        self
    }

    /// Direction of the data stage, taken from bit 7 of `bmRequestType`
    pub const fn direction(&self) -> Direction {
        Direction::from_address(self.request_type)
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let [v0, v1] = self.value.to_le_bytes();
        let [i0, i1] = self.index.to_le_bytes();
        let [l0, l1] = self.length.to_le_bytes();

        [self.request_type, self.request, v0, v1, i0, i1, l0, l1]
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

impl PackedSize for SetupPacket {
    const PACKED_LEN: usize = 8;
}

impl EncodeBE for SetupPacket {
    fn encode_as_be_bytes(&self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_bytes());
    }
}

impl DecodeBE for SetupPacket {
    fn decode_from_be_bytes(bytes: &[u8]) -> Self {
        let mut buffer = [0; 8];
        buffer.copy_from_slice(bytes);

        Self::from_bytes(buffer)
    }
}
