//! Isochronous transfers.
//!
//! Locally every packet is addressed by its absolute offset in the transfer
//! buffer. On the wire the data of an IN reply is packed: packet `i` starts
//! right after the `actual_length` bytes of packet `i - 1`.

use crate::{
    descriptor::PipeType,
    proto::{
        Direction, Pdu, SetupPacket,
        pdu::{IsoPacketDescriptor, RetSubmit, decode_iso_descriptors, encode_iso_descriptors},
    },
    status::{
        TransferFlags, UsbdStatus, WireStatus, local_status_from_wire, local_status_from_wire_ex,
        wire_flags_from_local,
    },
    transfer::{DecodeError, EncodeContext, EncodeError, Submit, bulk::fix_direction, outbound_data},
    urb::{IsochTransfer, TransferError},
};

/// `(offset, length)` of every packet as requested. A packet extends up to
/// the next packet's offset, the last one to the end of the transfer.
fn packet_layout(r: &IsochTransfer) -> Result<Vec<(u32, u32)>, EncodeError> {
    let end = r.buffer.length;

    r.packets
        .iter()
        .enumerate()
        .map(|(index, packet)| {
            let next = r.packets.get(index + 1).map_or(end, |p| p.offset);

            if packet.offset > next || next > end {
                return Err(EncodeError::PacketOutOfBounds { index });
            }

            Ok((packet.offset, next - packet.offset))
        })
        .collect()
}

pub fn encode(r: &IsochTransfer, ctx: &EncodeContext) -> Result<Pdu, EncodeError> {
    let pipe = ctx.pipe(r.endpoint_address, &[PipeType::Isochronous])?;

    let count = r.packets.len();

    if count == 0 {
        return Err(EncodeError::NoPackets);
    }

    if count > ctx.max_iso_packets as usize {
        return Err(EncodeError::TooManyPackets {
            count,
            max: ctx.max_iso_packets,
        });
    }

    let layout = packet_layout(r)?;

    let direction = pipe.direction();
    let flags = fix_direction(r.flags, direction);

    let descriptors: Vec<_> = layout
        .iter()
        .map(|&(offset, length)| IsoPacketDescriptor {
            offset,
            length,
            actual_length: 0,
            status: 0,
        })
        .collect();

    let mut payload = outbound_data(&r.buffer, direction)?;
    encode_iso_descriptors(&descriptors, &mut payload);

    let start_frame = if flags.contains(TransferFlags::START_ISO_TRANSFER_ASAP) {
        0
    } else {
        r.start_frame
    };

    Ok(Submit {
        direction,
        endpoint_address: pipe.address,
        transfer_flags: wire_flags_from_local(flags, direction.is_in()),
        transfer_buffer_length: r.buffer.length,
        start_frame,
        number_of_packets: Some(count as u32),
        interval: u32::from(pipe.interval),
        setup: SetupPacket::default(),
    }
    .into_pdu(ctx, payload))
}

/// Checks the whole reply before touching the request, so a corrupt reply
/// never leaves it partially updated
pub fn decode(
    r: &mut IsochTransfer,
    reply: &RetSubmit,
    direction: Direction,
    payload: &[u8],
) -> Result<(), TransferError> {
    let count = r.packets.len();
    let replied = reply.number_of_packets.unwrap_or_default() as usize;

    if replied != count {
        return Err(DecodeError::PacketCountMismatch {
            expected: count,
            actual: replied,
        }
        .into());
    }

    let actual = reply.actual_length;

    if actual > r.buffer.length {
        return Err(match direction {
            Direction::In => TransferError::BufferTooSmall {
                required: actual,
                available: r.buffer.length,
            },
            Direction::Out => DecodeError::LengthExceeded {
                requested: r.buffer.length,
                actual,
            }
            .into(),
        });
    }

    let data_len = match direction {
        Direction::In => actual as usize,
        Direction::Out => 0,
    };

    let (data, descriptors) = if payload.len() >= data_len {
        payload.split_at(data_len)
    } else {
        return Err(DecodeError::Truncated {
            expected: data_len,
            actual: payload.len(),
        }
        .into());
    };

    let descriptors = decode_iso_descriptors(descriptors, count).map_err(DecodeError::from)?;

    let layout = packet_layout(r).map_err(|_| DecodeError::PacketOffsetMoved { index: 0 })?;

    let mut previous = 0;
    let mut sum = 0u64;

    for (index, (d, &(offset, length))) in descriptors.iter().zip(&layout).enumerate() {
        if d.offset < previous {
            return Err(DecodeError::PacketOffsetDecreased { index }.into());
        }

        if d.offset > offset {
            return Err(DecodeError::PacketOffsetMoved { index }.into());
        }

        if d.actual_length > length {
            return Err(DecodeError::PacketOverrun { index }.into());
        }

        previous = d.offset;
        sum += u64::from(d.actual_length);
    }

    if direction == Direction::In && sum != u64::from(actual) {
        return Err(DecodeError::PacketLengthMismatch {
            sum,
            actual_length: actual,
        }
        .into());
    }

    let mut cursor = 0;

    for ((packet, d), &(offset, _)) in r.packets.iter_mut().zip(&descriptors).zip(&layout) {
        let len = d.actual_length as usize;

        if direction == Direction::In {
            let start = offset as usize;

            if let Some(dst) = r.buffer.data.get_mut(start..start + len) {
                dst.copy_from_slice(&data[cursor..cursor + len]);
            }

            cursor += len;
        }

        packet.length = d.actual_length;
        packet.status = local_status_from_wire_ex(WireStatus::from_raw(d.status), true);
    }

    r.buffer.length = actual;
    r.error_count = reply.error_count;

    if r.flags.contains(TransferFlags::START_ISO_TRANSFER_ASAP) {
        r.start_frame = reply.start_frame;
    }

    Ok(())
}

/// Status of the whole transfer. A transfer whose every packet failed is
/// reported as failed even if the reply status is zero.
pub(crate) fn apply_status(r: &mut IsochTransfer, reply: &RetSubmit) {
    let count = r.packets.len();

    r.status = if count > 0 && r.error_count as usize == count {
        UsbdStatus::IsochRequestFailed
    } else {
        local_status_from_wire(reply.status)
    };
}
