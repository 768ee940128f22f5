//! Encoders turning local requests into `CMD_SUBMIT` PDUs and decoders
//! applying `RET_SUBMIT` replies back onto them.
//!
//! Encoders leave the sequence number at zero; the session stamps it once
//! the request has been registered.

use crate::{
    descriptor::{DescriptorStore, EndpointInfo, PipeType},
    proto::{
        Command, Direction, HeaderBasic, HeaderBody, Pdu, PduHeader, ProtocolError, SeqNum,
        SetupPacket,
        pdu::{CmdSubmit, CmdUnlink, MAX_ISO_PACKETS, RetSubmit},
    },
    status::{WireFlags, local_status_from_wire},
    urb::{TransferBuffer, TransferError, TransferRequest},
};

pub mod bulk;
pub mod control;
pub mod isoch;
pub mod select;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("transfer length {length} exceeds the buffer ({capacity} bytes)")]
    BufferOverrun { length: u32, capacity: usize },
    #[error("transfer length {0} does not fit into wLength")]
    LengthTooLarge(u32),
    #[error("endpoint {0:#04x} is not part of the active configuration")]
    UnknownEndpoint(u8),
    #[error("endpoint {address:#04x} is a {actual} pipe")]
    WrongPipeType { address: u8, actual: PipeType },
    #[error("unsupported descriptor type {0:#04x}")]
    UnsupportedDescriptorType(u8),
    #[error("isochronous transfer has {count} packets, at most {max} are allowed")]
    TooManyPackets { count: usize, max: u32 },
    #[error("isochronous transfer has no packets")]
    NoPackets,
    #[error("isochronous packet {index} lies outside the transfer buffer")]
    PacketOutOfBounds { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected {0} reply")]
    UnexpectedReply(Command),
    #[error("payload holds {actual} bytes, {expected} expected")]
    Truncated { expected: usize, actual: usize },
    #[error("server wrote {actual} bytes of a {requested} byte transfer")]
    LengthExceeded { requested: u32, actual: u32 },
    #[error("reply has {actual} isochronous packets, request had {expected}")]
    PacketCountMismatch { expected: usize, actual: usize },
    #[error("isochronous packet offsets decrease at packet {index}")]
    PacketOffsetDecreased { index: usize },
    #[error("isochronous packet {index} moved past its requested offset")]
    PacketOffsetMoved { index: usize },
    #[error("isochronous packet {index} is larger than requested")]
    PacketOverrun { index: usize },
    #[error("isochronous packets carry {sum} bytes, reply announces {actual_length}")]
    PacketLengthMismatch { sum: u64, actual_length: u32 },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What encoders need to know about the device
#[derive(Clone, Copy)]
pub struct EncodeContext<'a> {
    pub devid: u32,
    pub endpoints: &'a dyn DescriptorStore,
    pub max_iso_packets: u32,
}

impl<'a> EncodeContext<'a> {
    pub fn new(devid: u32, endpoints: &'a dyn DescriptorStore) -> Self {
        Self {
            devid,
            endpoints,
            max_iso_packets: MAX_ISO_PACKETS,
        }
    }

    fn pipe(&self, address: u8, allowed: &[PipeType]) -> Result<EndpointInfo, EncodeError> {
        let info = self
            .endpoints
            .endpoint(address)
            .ok_or(EncodeError::UnknownEndpoint(address))?;

        if !allowed.contains(&info.pipe_type) {
            return Err(EncodeError::WrongPipeType {
                address,
                actual: info.pipe_type,
            });
        }

        Ok(info)
    }
}

/// Builds the `CMD_SUBMIT` for a request
pub fn encode(request: &TransferRequest, ctx: &EncodeContext) -> Result<Pdu, EncodeError> {
    match request {
        TransferRequest::Control(r) => control::encode_control(r, ctx),
        TransferRequest::VendorOrClass(r) => control::encode_vendor_or_class(r, ctx),
        TransferRequest::GetDescriptor(r) => control::encode_get_descriptor(r, ctx),
        TransferRequest::GetStatus(r) => control::encode_get_status(r, ctx),
        TransferRequest::BulkOrInterrupt(r) => bulk::encode(r, ctx),
        TransferRequest::Isoch(r) => isoch::encode(r, ctx),
        TransferRequest::SelectConfiguration(r) => Ok(select::encode_select_configuration(r, ctx)),
        TransferRequest::SelectInterface(r) => Ok(select::encode_select_interface(r, ctx)),
        TransferRequest::ResetPipe(r) => select::encode_reset_pipe(r, ctx),
    }
}

/// Applies a `RET_SUBMIT` to the request it answers.
///
/// `direction` is the direction of the request, `payload` everything that
/// followed the reply header. On success the request status reflects the
/// status reported by the device, which may itself be an error (a STALL for
/// example). Replies that cannot be applied, including IN data that does
/// not fit the buffer, leave the request status at `InvalidParameter`.
pub fn decode(
    request: &mut TransferRequest,
    reply: &RetSubmit,
    direction: Direction,
    payload: &[u8],
) -> Result<(), TransferError> {
    let result = match request {
        TransferRequest::Control(r) => complete_data_stage(&mut r.buffer, direction, reply, payload),
        TransferRequest::VendorOrClass(r) => {
            complete_data_stage(&mut r.buffer, direction, reply, payload)
        }
        TransferRequest::GetDescriptor(r) => {
            complete_data_stage(&mut r.buffer, direction, reply, payload)
        }
        TransferRequest::GetStatus(r) => complete_data_stage(&mut r.buffer, direction, reply, payload),
        TransferRequest::BulkOrInterrupt(r) => {
            complete_data_stage(&mut r.buffer, direction, reply, payload)
        }
        TransferRequest::Isoch(r) => isoch::decode(r, reply, direction, payload),
        TransferRequest::SelectConfiguration(_)
        | TransferRequest::SelectInterface(_)
        | TransferRequest::ResetPipe(_) => Ok(()),
    };

    match &result {
        Ok(()) => {
            if let TransferRequest::Isoch(r) = request {
                isoch::apply_status(r, reply);
            } else {
                request.set_status(local_status_from_wire(reply.status));
            }
        }
        Err(e) => request.set_status(e.status()),
    }

    result
}

/// Builds the `CMD_UNLINK` canceling `target`
pub fn encode_unlink(devid: u32, target: SeqNum) -> Pdu {
    Pdu {
        header: PduHeader {
            basic: HeaderBasic {
                seqnum: SeqNum::default(),
                devid,
                direction: Direction::Out,
                ep: 0,
            },
            body: HeaderBody::CmdUnlink(CmdUnlink { target }),
        },
        payload: Vec::new(),
    }
}

/// Header fields shared by every submit
pub(crate) struct Submit {
    pub direction: Direction,
    pub endpoint_address: u8,
    pub transfer_flags: WireFlags,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: Option<u32>,
    pub interval: u32,
    pub setup: SetupPacket,
}

impl Submit {
    pub fn into_pdu(self, ctx: &EncodeContext, payload: Vec<u8>) -> Pdu {
        Pdu {
            header: PduHeader {
                basic: HeaderBasic {
                    seqnum: SeqNum::default(),
                    devid: ctx.devid,
                    direction: self.direction,
                    ep: u32::from(self.endpoint_address & 0x7F),
                },
                body: HeaderBody::CmdSubmit(CmdSubmit {
                    transfer_flags: self.transfer_flags,
                    transfer_buffer_length: self.transfer_buffer_length,
                    start_frame: self.start_frame,
                    number_of_packets: self.number_of_packets,
                    interval: self.interval,
                    setup: self.setup,
                }),
            },
            payload,
        }
    }
}

/// Bytes sent along with a submit: the active part of the buffer for OUT
/// transfers, nothing for IN transfers
pub(crate) fn outbound_data(
    buffer: &TransferBuffer,
    direction: Direction,
) -> Result<Vec<u8>, EncodeError> {
    let data = buffer.active().ok_or(EncodeError::BufferOverrun {
        length: buffer.length,
        capacity: buffer.data.len(),
    })?;

    Ok(match direction {
        Direction::Out => data.to_vec(),
        Direction::In => Vec::new(),
    })
}

/// Copies the data of an IN reply into the caller's buffer and shrinks its
/// length to what was actually transferred
pub(crate) fn complete_data_stage(
    buffer: &mut TransferBuffer,
    direction: Direction,
    reply: &RetSubmit,
    payload: &[u8],
) -> Result<(), TransferError> {
    let actual = reply.actual_length;

    if actual > buffer.length {
        return Err(match direction {
            Direction::In => TransferError::BufferTooSmall {
                required: actual,
                available: buffer.length,
            },
            Direction::Out => DecodeError::LengthExceeded {
                requested: buffer.length,
                actual,
            }
            .into(),
        });
    }

    if direction == Direction::In {
        let data = payload
            .get(..actual as usize)
            .ok_or(DecodeError::Truncated {
                expected: actual as usize,
                actual: payload.len(),
            })?;

        let Some(dst) = buffer.data.get_mut(..actual as usize) else {
            return Err(TransferError::BufferTooSmall {
                required: actual,
                available: buffer.data.len() as u32,
            });
        };

        dst.copy_from_slice(data);
    }

    buffer.length = actual;

    Ok(())
}
