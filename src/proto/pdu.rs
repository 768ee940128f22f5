//! USB/IP transfer PDUs (`USBIP_CMD_SUBMIT`, `USBIP_CMD_UNLINK`,
//! `USBIP_RET_SUBMIT`, `USBIP_RET_UNLINK`) as exchanged once the socket has
//! been handed over to the virtual host controller.
//!
//! Every PDU starts with a fixed 48 byte header in network byte order. The
//! header is followed by the transfer buffer (OUT submits and IN replies) and,
//! for isochronous transfers, by `number_of_packets` packed
//! [`IsoPacketDescriptor`]s.
//!
//! Layout reference: `<linux>/Documentation/usb/usbip_protocol.rst`

use core::fmt;

use endian_codec::{DecodeBE, EncodeBE, PackedSize};

use crate::{
    proto::setup::SetupPacket,
    status::{WireFlags, WireStatus},
};

pub const USBIP_HEADER_SIZE: usize = 48;
pub const ISO_PACKET_DESCRIPTOR_SIZE: usize = 16;

/// Upper bound for `number_of_packets` accepted by the Linux stub driver
pub const MAX_ISO_PACKETS: u32 = 1024;

/// Value of `number_of_packets` for anything that is not an isochronous
/// transfer
pub const NUMBER_OF_PACKETS_NON_ISOCH: i32 = -1;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("PDU is truncated (expected {expected} bytes, got {actual})")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown USB/IP command code {0:#x}")]
    UnknownCommand(u32),
    #[error("unexpected {0} PDU")]
    UnexpectedCommand(Command),
    #[error("invalid transfer direction {0}")]
    InvalidDirection(u32),
    #[error("invalid endpoint number {0}")]
    InvalidEndpoint(u32),
    #[error("field `{field}` has a negative value ({value})")]
    NegativeLength { field: &'static str, value: i32 },
    #[error("number_of_packets ({0}) is out of range")]
    InvalidNumberOfPackets(i32),
    #[error("sequence number {0} is invalid")]
    InvalidSeqNum(SeqNum),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    num_enum::TryFromPrimitive,
    num_enum::IntoPrimitive,
    strum::Display,
)]
#[repr(u32)]
pub enum Command {
    #[strum(serialize = "CMD_SUBMIT")]
    CmdSubmit = 1,
    #[strum(serialize = "CMD_UNLINK")]
    CmdUnlink = 2,
    #[strum(serialize = "RET_SUBMIT")]
    RetSubmit = 3,
    #[strum(serialize = "RET_UNLINK")]
    RetUnlink = 4,
}

/// Transfer direction as seen from the host (`USBIP_DIR_OUT`, `USBIP_DIR_IN`)
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    num_enum::TryFromPrimitive,
    num_enum::IntoPrimitive,
    serde::Serialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum Direction {
    #[default]
    Out = 0,
    In = 1,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address or `bmRequestType`
    pub const fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 { Self::In } else { Self::Out }
    }

    pub const fn is_in(self) -> bool {
        matches!(self, Self::In)
    }
}

/// Sequence number of a request on one connection.
///
/// The lowest bit carries the [`Direction`] of the transfer, the remaining
/// bits a per-device counter. Servers always zero the `direction` field of
/// `RET_SUBMIT`, so this is the only way to know the size of a reply whose
/// request has already been canceled. Zero is never issued.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize,
)]
#[serde(transparent)]
pub struct SeqNum(u32);

impl SeqNum {
    pub const fn new(counter: u32, direction: Direction) -> Self {
        Self((counter << 1) | direction as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn counter(self) -> u32 {
        self.0 >> 1
    }

    pub const fn direction(self) -> Direction {
        if self.0 & 1 == 0 {
            Direction::Out
        } else {
            Direction::In
        }
    }

    pub const fn is_valid(self) -> bool {
        self.counter() != 0
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fields shared by all four PDU kinds (`usbip_header_basic`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderBasic {
    pub seqnum: SeqNum,
    /// `bus_num << 16 | dev_num` of the device on the exporting host
    pub devid: u32,
    /// Always [`Direction::Out`] in replies sent by the server
    pub direction: Direction,
    /// Endpoint number without the direction bit, always zero in replies
    pub ep: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdSubmit {
    pub transfer_flags: WireFlags,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    /// `None` for anything but isochronous transfers
    pub number_of_packets: Option<u32>,
    pub interval: u32,
    pub setup: SetupPacket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSubmit {
    pub status: WireStatus,
    pub actual_length: u32,
    pub start_frame: u32,
    /// `None` for anything but isochronous transfers
    pub number_of_packets: Option<u32>,
    pub error_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    /// Sequence number of the `CMD_SUBMIT` to cancel
    pub target: SeqNum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    /// `-ECONNRESET` if the URB was unlinked, zero if it had already completed
    pub status: WireStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderBody {
    CmdSubmit(CmdSubmit),
    CmdUnlink(CmdUnlink),
    RetSubmit(RetSubmit),
    RetUnlink(RetUnlink),
}

/// Where the isochronous packet descriptors begin, relative to the first byte
/// after the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoDescriptorLocation {
    pub offset: usize,
    pub count: usize,
}

/// A decoded `usbip_header` in host representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    pub basic: HeaderBasic,
    pub body: HeaderBody,
}

impl PduHeader {
    pub fn command(&self) -> Command {
        match self.body {
            HeaderBody::CmdSubmit(_) => Command::CmdSubmit,
            HeaderBody::CmdUnlink(_) => Command::CmdUnlink,
            HeaderBody::RetSubmit(_) => Command::RetSubmit,
            HeaderBody::RetUnlink(_) => Command::RetUnlink,
        }
    }

    /// Serializes the header into network byte order
    pub fn to_wire(&self) -> [u8; USBIP_HEADER_SIZE] {
        let mut bytes = [0; USBIP_HEADER_SIZE];
        let (basic, body) = bytes.split_at_mut(RawHeaderBasic::PACKED_LEN);

        RawHeaderBasic {
            command: self.command().into(),
            seqnum: self.basic.seqnum.raw(),
            devid: self.basic.devid,
            direction: self.basic.direction.into(),
            ep: self.basic.ep,
        }
        .encode_as_be_bytes(basic);

        match &self.body {
            HeaderBody::CmdSubmit(s) => RawCmdSubmit {
                transfer_flags: s.transfer_flags.bits(),
                transfer_buffer_length: s.transfer_buffer_length as i32,
                start_frame: s.start_frame as i32,
                number_of_packets: encode_number_of_packets(s.number_of_packets),
                interval: s.interval as i32,
                setup: s.setup,
            }
            .encode_as_be_bytes(body),
            HeaderBody::RetSubmit(r) => RawRetSubmit {
                status: r.status.raw(),
                actual_length: r.actual_length as i32,
                start_frame: r.start_frame as i32,
                number_of_packets: encode_number_of_packets(r.number_of_packets),
                error_count: r.error_count as i32,
                _padding: Padding,
            }
            .encode_as_be_bytes(body),
            HeaderBody::CmdUnlink(u) => RawCmdUnlink {
                seqnum: u.target.raw(),
                _padding: Padding,
            }
            .encode_as_be_bytes(body),
            HeaderBody::RetUnlink(u) => RawRetUnlink {
                status: u.status.raw(),
                _padding: Padding,
            }
            .encode_as_be_bytes(body),
        }

        bytes
    }

    /// Parses a header received in network byte order
    pub fn to_host(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let Some(bytes) = bytes.get(..USBIP_HEADER_SIZE) else {
            return Err(ProtocolError::Truncated {
                expected: USBIP_HEADER_SIZE,
                actual: bytes.len(),
            });
        };

        let (basic, body) = bytes.split_at(RawHeaderBasic::PACKED_LEN);
        let raw = RawHeaderBasic::decode_from_be_bytes(basic);

        let command = Command::try_from(raw.command)
            .map_err(|_| ProtocolError::UnknownCommand(raw.command))?;
        let direction = Direction::try_from(raw.direction)
            .map_err(|_| ProtocolError::InvalidDirection(raw.direction))?;

        if raw.ep > 0x0F {
            return Err(ProtocolError::InvalidEndpoint(raw.ep));
        }

        let body = match command {
            Command::CmdSubmit => {
                let r = RawCmdSubmit::decode_from_be_bytes(body);

                HeaderBody::CmdSubmit(CmdSubmit {
                    transfer_flags: WireFlags::from_bits_retain(r.transfer_flags),
                    transfer_buffer_length: non_negative(
                        "transfer_buffer_length",
                        r.transfer_buffer_length,
                    )?,
                    start_frame: r.start_frame as u32,
                    number_of_packets: decode_number_of_packets(r.number_of_packets)?,
                    interval: r.interval as u32,
                    setup: r.setup,
                })
            }
            Command::RetSubmit => {
                let r = RawRetSubmit::decode_from_be_bytes(body);

                HeaderBody::RetSubmit(RetSubmit {
                    status: WireStatus::from_raw(r.status),
                    actual_length: non_negative("actual_length", r.actual_length)?,
                    start_frame: r.start_frame as u32,
                    number_of_packets: decode_number_of_packets(r.number_of_packets)?,
                    error_count: non_negative("error_count", r.error_count)?,
                })
            }
            Command::CmdUnlink => HeaderBody::CmdUnlink(CmdUnlink {
                target: SeqNum::from_raw(RawCmdUnlink::decode_from_be_bytes(body).seqnum),
            }),
            Command::RetUnlink => HeaderBody::RetUnlink(RetUnlink {
                status: WireStatus::from_raw(RawRetUnlink::decode_from_be_bytes(body).status),
            }),
        };

        Ok(Self {
            basic: HeaderBasic {
                seqnum: SeqNum::from_raw(raw.seqnum),
                devid: raw.devid,
                direction,
                ep: raw.ep,
            },
            body,
        })
    }

    fn number_of_packets(&self) -> usize {
        match &self.body {
            HeaderBody::CmdSubmit(s) => s.number_of_packets,
            HeaderBody::RetSubmit(r) => r.number_of_packets,
            HeaderBody::CmdUnlink(_) | HeaderBody::RetUnlink(_) => None,
        }
        .unwrap_or_default() as usize
    }

    /// Computes where the isochronous packet descriptors start.
    ///
    /// `direction` must be the direction of the original request: servers
    /// zero the direction field of `RET_SUBMIT`.
    pub fn isoc_descriptor_location(&self, direction: Direction) -> Option<IsoDescriptorLocation> {
        let data = match &self.body {
            HeaderBody::CmdSubmit(s) if s.number_of_packets.is_some() => match direction {
                Direction::Out => s.transfer_buffer_length,
                Direction::In => 0,
            },
            HeaderBody::RetSubmit(r) if r.number_of_packets.is_some() => match direction {
                Direction::Out => 0,
                Direction::In => r.actual_length,
            },
            _ => return None,
        };

        Some(IsoDescriptorLocation {
            offset: data as usize,
            count: self.number_of_packets(),
        })
    }

    /// Number of bytes following the header on the wire
    pub fn payload_size(&self, direction: Direction) -> usize {
        let data = match &self.body {
            HeaderBody::CmdSubmit(s) if direction == Direction::Out => s.transfer_buffer_length,
            HeaderBody::RetSubmit(r) if direction == Direction::In => r.actual_length,
            _ => 0,
        } as usize;

        data + self.number_of_packets() * ISO_PACKET_DESCRIPTOR_SIZE
    }

    pub fn total_size(&self, direction: Direction) -> usize {
        USBIP_HEADER_SIZE + self.payload_size(direction)
    }
}

fn non_negative(field: &'static str, value: i32) -> Result<u32, ProtocolError> {
    u32::try_from(value).map_err(|_| ProtocolError::NegativeLength { field, value })
}

fn decode_number_of_packets(value: i32) -> Result<Option<u32>, ProtocolError> {
    match value {
        NUMBER_OF_PACKETS_NON_ISOCH => Ok(None),
        n if (0..=MAX_ISO_PACKETS as i32).contains(&n) => Ok(Some(n as u32)),
        n => Err(ProtocolError::InvalidNumberOfPackets(n)),
    }
}

fn encode_number_of_packets(value: Option<u32>) -> i32 {
    value.map_or(NUMBER_OF_PACKETS_NON_ISOCH, |n| n as i32)
}

/// `usbip_iso_packet_descriptor`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

/// Appends `descriptors` to `out` in network byte order
pub fn encode_iso_descriptors(descriptors: &[IsoPacketDescriptor], out: &mut Vec<u8>) {
    let start = out.len();
    out.resize(start + descriptors.len() * ISO_PACKET_DESCRIPTOR_SIZE, 0);

    for (d, chunk) in descriptors
        .iter()
        .zip(out[start..].chunks_exact_mut(ISO_PACKET_DESCRIPTOR_SIZE))
    {
        d.encode_as_be_bytes(chunk);
    }
}

/// Reads `count` descriptors from the start of `bytes`
pub fn decode_iso_descriptors(
    bytes: &[u8],
    count: usize,
) -> Result<Vec<IsoPacketDescriptor>, ProtocolError> {
    let expected = count * ISO_PACKET_DESCRIPTOR_SIZE;

    let Some(bytes) = bytes.get(..expected) else {
        return Err(ProtocolError::Truncated {
            expected,
            actual: bytes.len(),
        });
    };

    Ok(bytes
        .chunks_exact(ISO_PACKET_DESCRIPTOR_SIZE)
        .map(IsoPacketDescriptor::decode_from_be_bytes)
        .collect())
}

/// An outbound PDU: header plus everything that follows it on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub header: PduHeader,
    pub payload: Vec<u8>,
}

impl Pdu {
    pub fn seqnum(&self) -> SeqNum {
        self.header.basic.seqnum
    }

    pub fn set_seqnum(&mut self, seqnum: SeqNum) {
        self.header.basic.seqnum = seqnum;
    }

    pub fn direction(&self) -> Direction {
        self.header.basic.direction
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(USBIP_HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.header.to_wire());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

// implicitly packed due to layout, so we can avoid using `#[repr(packed)]`
#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
struct RawHeaderBasic {
    command: u32,
    seqnum: u32,
    devid: u32,
    direction: u32,
    ep: u32,
}

#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
struct RawCmdSubmit {
    transfer_flags: u32,
    transfer_buffer_length: i32,
    start_frame: i32,
    number_of_packets: i32,
    interval: i32,
    setup: SetupPacket,
}

#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
struct RawRetSubmit {
    status: i32,
    actual_length: i32,
    start_frame: i32,
    number_of_packets: i32,
    error_count: i32,
    _padding: Padding<8>,
}

#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
struct RawCmdUnlink {
    seqnum: u32,
    _padding: Padding<24>,
}

#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
struct RawRetUnlink {
    status: i32,
    _padding: Padding<24>,
}

/// Unused tail of the header union. Written as zeros, ignored when read.
#[derive(Debug, Clone, Copy, Default)]
struct Padding<const N: usize>;

impl<const N: usize> PackedSize for Padding<N> {
    const PACKED_LEN: usize = N;
}

impl<const N: usize> EncodeBE for Padding<N> {
    fn encode_as_be_bytes(&self, bytes: &mut [u8]) {
        bytes.fill(0);
    }
}

impl<const N: usize> DecodeBE for Padding<N> {
    fn decode_from_be_bytes(_bytes: &[u8]) -> Self {
        Self
    }
}

const _: () = {
    let basic = RawHeaderBasic::PACKED_LEN;

    assert!(basic + RawCmdSubmit::PACKED_LEN == USBIP_HEADER_SIZE);
    assert!(basic + RawRetSubmit::PACKED_LEN == USBIP_HEADER_SIZE);
    assert!(basic + RawCmdUnlink::PACKED_LEN == USBIP_HEADER_SIZE);
    assert!(basic + RawRetUnlink::PACKED_LEN == USBIP_HEADER_SIZE);
    assert!(IsoPacketDescriptor::PACKED_LEN == ISO_PACKET_DESCRIPTOR_SIZE);
};
