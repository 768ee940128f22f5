//! Requests carried by a control pipe: raw control transfers, vendor and
//! class requests and the standard GET_DESCRIPTOR / GET_STATUS requests.

use crate::{
    descriptor::{
        BOS, CONFIGURATION, DEVICE, DEVICE_QUALIFIER, INTERFACE, OTHER_SPEED_CONFIGURATION,
        PipeType, STRING,
    },
    proto::{
        Direction, Pdu, SetupPacket,
        setup::{GET_DESCRIPTOR, GET_STATUS, Recipient, RequestType},
    },
    status::{TransferFlags, wire_flags_from_local},
    transfer::{EncodeContext, EncodeError, Submit, outbound_data},
    urb::{
        ControlTransfer, DescriptorRequest, GetStatusRequest, TransferBuffer, VendorOrClassRequest,
    },
};

fn control_submit(
    ctx: &EncodeContext,
    endpoint_address: u8,
    setup: SetupPacket,
    flags: TransferFlags,
    buffer: &TransferBuffer,
) -> Result<Pdu, EncodeError> {
    ctx.pipe(endpoint_address, &[PipeType::Control])?;

    let direction = setup.direction();
    let payload = outbound_data(buffer, direction)?;

    Ok(Submit {
        direction,
        endpoint_address,
        transfer_flags: wire_flags_from_local(flags, direction.is_in()),
        transfer_buffer_length: buffer.length,
        start_frame: 0,
        number_of_packets: None,
        interval: 0,
        setup,
    }
    .into_pdu(ctx, payload))
}

fn w_length(buffer: &TransferBuffer) -> Result<u16, EncodeError> {
    u16::try_from(buffer.length).map_err(|_| EncodeError::LengthTooLarge(buffer.length))
}

/// The setup packet is sent as given, the data stage direction follows
/// `bmRequestType`. Flags whose direction disagrees with it are corrected and
/// then allow short transfers.
pub fn encode_control(r: &ControlTransfer, ctx: &EncodeContext) -> Result<Pdu, EncodeError> {
    let dir_in = r.setup.direction().is_in();
    let mut flags = r.flags;

    if dir_in != flags.contains(TransferFlags::DIRECTION_IN) {
        tracing::debug!(
            request_type = r.setup.request_type,
            flags = ?r.flags,
            "transfer flags disagree with bmRequestType, using bmRequestType"
        );

        flags.set(TransferFlags::DIRECTION_IN, dir_in);
        flags |= TransferFlags::SHORT_TRANSFER_OK;
    }

    control_submit(ctx, r.endpoint_address, r.setup, flags, &r.buffer)
}

pub fn encode_vendor_or_class(
    r: &VendorOrClassRequest,
    ctx: &EncodeContext,
) -> Result<Pdu, EncodeError> {
    let direction = if r.flags.contains(TransferFlags::DIRECTION_IN) {
        Direction::In
    } else {
        Direction::Out
    };

    let setup = SetupPacket::new(direction, r.request_type, r.recipient, r.request)
        .with_value(r.value)
        .with_index(r.index)
        .with_length(w_length(&r.buffer)?);

    control_submit(ctx, 0, setup, r.flags, &r.buffer)
}

pub fn encode_get_descriptor(
    r: &DescriptorRequest,
    ctx: &EncodeContext,
) -> Result<Pdu, EncodeError> {
    let index = match r.recipient {
        Recipient::Device => match r.descriptor_type {
            DEVICE | CONFIGURATION | DEVICE_QUALIFIER | OTHER_SPEED_CONFIGURATION | BOS => 0,
            STRING => r.language_id,
            INTERFACE => u16::from(r.index),
            other => return Err(EncodeError::UnsupportedDescriptorType(other)),
        },
        // class descriptors (HID report etc.) are addressed to an interface
        // or endpoint, which goes into wIndex
        _ => r.language_id,
    };

    let setup = SetupPacket::new(
        Direction::In,
        RequestType::Standard,
        r.recipient,
        GET_DESCRIPTOR,
    )
    .with_value(u16::from(r.descriptor_type) << 8 | u16::from(r.index))
    .with_index(index)
    .with_length(w_length(&r.buffer)?);

    control_submit(
        ctx,
        0,
        setup,
        TransferFlags::DIRECTION_IN | TransferFlags::SHORT_TRANSFER_OK,
        &r.buffer,
    )
}

pub fn encode_get_status(r: &GetStatusRequest, ctx: &EncodeContext) -> Result<Pdu, EncodeError> {
    let setup = SetupPacket::new(Direction::In, RequestType::Standard, r.recipient, GET_STATUS)
        .with_index(r.index)
        .with_length(w_length(&r.buffer)?);

    control_submit(
        ctx,
        0,
        setup,
        TransferFlags::DIRECTION_IN | TransferFlags::SHORT_TRANSFER_OK,
        &r.buffer,
    )
}
