use crate::{
    descriptor::PipeType,
    proto::{Direction, Pdu, SetupPacket},
    status::{TransferFlags, wire_flags_from_local},
    transfer::{EncodeContext, EncodeError, Submit, outbound_data},
    urb::BulkOrInterruptTransfer,
};

/// Bulk and interrupt transfers. The direction always comes from the
/// endpoint address, whatever the flags say.
pub fn encode(r: &BulkOrInterruptTransfer, ctx: &EncodeContext) -> Result<Pdu, EncodeError> {
    let pipe = ctx.pipe(r.endpoint_address, &[PipeType::Bulk, PipeType::Interrupt])?;

    let direction = pipe.direction();
    let flags = fix_direction(r.flags, direction);
    let payload = outbound_data(&r.buffer, direction)?;

    Ok(Submit {
        direction,
        endpoint_address: pipe.address,
        transfer_flags: wire_flags_from_local(flags, direction.is_in()),
        transfer_buffer_length: r.buffer.length,
        start_frame: 0,
        number_of_packets: None,
        interval: u32::from(pipe.interval),
        setup: SetupPacket::default(),
    }
    .into_pdu(ctx, payload))
}

pub(crate) fn fix_direction(flags: TransferFlags, direction: Direction) -> TransferFlags {
    let fixed = flags.difference(TransferFlags::DIRECTION_IN)
        | match direction {
            Direction::In => TransferFlags::DIRECTION_IN,
            Direction::Out => TransferFlags::empty(),
        };

    if fixed != flags {
        tracing::debug!(?flags, ?direction, "fixed transfer direction");
    }

    fixed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        proto::Command,
        status::{UsbdStatus, WireFlags, WireStatus},
        transfer::{
            decode,
            tests::{endpoints, reply, submit_body},
        },
        urb::{TransferBuffer, TransferRequest},
    };

    fn bulk(endpoint_address: u8, flags: TransferFlags, buffer: TransferBuffer) -> BulkOrInterruptTransfer {
        BulkOrInterruptTransfer {
            endpoint_address,
            flags,
            buffer,
            status: UsbdStatus::Pending,
        }
    }

    #[test]
    fn bulk_in_short_read() {
        let map = endpoints();
        let ctx = EncodeContext::new(1, &map);

        let request = bulk(
            0x81,
            TransferFlags::DIRECTION_IN | TransferFlags::SHORT_TRANSFER_OK,
            TransferBuffer::for_read(64),
        );
        let pdu = encode(&request, &ctx).unwrap();
        let body = submit_body(&pdu);

        assert_eq!(pdu.header.command(), Command::CmdSubmit);
        assert_eq!(pdu.header.basic.direction, Direction::In);
        assert_eq!(pdu.header.basic.ep, 1);
        assert_eq!(body.transfer_buffer_length, 64);
        assert_eq!(body.setup, SetupPacket::default());
        assert!(pdu.payload.is_empty());

        let mut request = TransferRequest::BulkOrInterrupt(request);
        let data = [0x5A; 40];

        decode(&mut request, &reply(WireStatus::SUCCESS, 40), Direction::In, &data).unwrap();

        let TransferRequest::BulkOrInterrupt(r) = request else {
            unreachable!()
        };

        assert_eq!(r.status, UsbdStatus::Success);
        assert_eq!(r.buffer.length, 40);
        assert_eq!(&r.buffer.data[..40], &data[..]);
        assert!(r.buffer.data[40..].iter().all(|&b| b == 0));
    }

    #[test]
    fn strict_read_sets_short_not_ok() {
        let map = endpoints();
        let ctx = EncodeContext::new(1, &map);

        let pdu = encode(
            &bulk(0x81, TransferFlags::DIRECTION_IN, TransferBuffer::for_read(512)),
            &ctx,
        )
        .unwrap();

        assert_eq!(submit_body(&pdu).transfer_flags, WireFlags::SHORT_NOT_OK);
    }

    #[test]
    fn direction_comes_from_endpoint() {
        let map = endpoints();
        let ctx = EncodeContext::new(1, &map);

        // caller claims IN on an OUT endpoint
        let pdu = encode(
            &bulk(0x02, TransferFlags::DIRECTION_IN, TransferBuffer::for_write(vec![1, 2, 3])),
            &ctx,
        )
        .unwrap();

        assert_eq!(pdu.header.basic.direction, Direction::Out);
        assert_eq!(pdu.header.basic.ep, 2);
        assert_eq!(submit_body(&pdu).transfer_flags, WireFlags::empty());
        assert_eq!(pdu.payload, vec![1, 2, 3]);
    }

    #[test]
    fn interrupt_uses_endpoint_interval() {
        let map = endpoints();
        let ctx = EncodeContext::new(1, &map);

        let pdu = encode(
            &bulk(0x83, TransferFlags::DIRECTION_IN, TransferBuffer::for_read(8)),
            &ctx,
        )
        .unwrap();

        assert_eq!(submit_body(&pdu).interval, 10);
    }

    #[test]
    fn only_bulk_and_interrupt_pipes() {
        let map = endpoints();
        let ctx = EncodeContext::new(1, &map);

        assert!(matches!(
            encode(&bulk(0x84, TransferFlags::empty(), TransferBuffer::for_read(8)), &ctx),
            Err(EncodeError::WrongPipeType { address: 0x84, .. })
        ));
        assert_eq!(
            encode(&bulk(0x86, TransferFlags::empty(), TransferBuffer::for_read(8)), &ctx),
            Err(EncodeError::UnknownEndpoint(0x86))
        );
    }

    #[test]
    fn stall_is_reported_through_status() {
        let mut request = TransferRequest::BulkOrInterrupt(bulk(
            0x02,
            TransferFlags::empty(),
            TransferBuffer::for_write(vec![0; 16]),
        ));

        decode(&mut request, &reply(WireStatus::from_raw(-32), 0), Direction::Out, &[]).unwrap();

        assert_eq!(request.status(), UsbdStatus::StallPid);
        assert_eq!(request.buffer().map(|b| b.length), Some(0));
    }
}
