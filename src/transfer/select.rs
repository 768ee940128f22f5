//! Requests that have no transfer of their own locally and travel as
//! standard control requests on the default pipe.

use crate::{
    descriptor::PipeType,
    proto::{
        Direction, Pdu, SetupPacket,
        setup::{CLEAR_FEATURE, ENDPOINT_HALT, Recipient, RequestType, SET_CONFIGURATION, SET_INTERFACE},
    },
    status::WireFlags,
    transfer::{EncodeContext, EncodeError, Submit},
    urb::{ResetPipe, SelectConfiguration, SelectInterface},
};

fn no_data_submit(ctx: &EncodeContext, setup: SetupPacket) -> Pdu {
    Submit {
        direction: Direction::Out,
        endpoint_address: 0,
        transfer_flags: WireFlags::empty(),
        transfer_buffer_length: 0,
        start_frame: 0,
        number_of_packets: None,
        interval: 0,
        setup,
    }
    .into_pdu(ctx, Vec::new())
}

/// `SET_CONFIGURATION`
pub fn encode_select_configuration(r: &SelectConfiguration, ctx: &EncodeContext) -> Pdu {
    let setup = SetupPacket::new(
        Direction::Out,
        RequestType::Standard,
        Recipient::Device,
        SET_CONFIGURATION,
    )
    .with_value(u16::from(r.configuration_value));

    no_data_submit(ctx, setup)
}

/// `SET_INTERFACE`
pub fn encode_select_interface(r: &SelectInterface, ctx: &EncodeContext) -> Pdu {
    let setup = SetupPacket::new(
        Direction::Out,
        RequestType::Standard,
        Recipient::Interface,
        SET_INTERFACE,
    )
    .with_value(u16::from(r.alternate_setting))
    .with_index(u16::from(r.interface_number));

    no_data_submit(ctx, setup)
}

/// `CLEAR_FEATURE(ENDPOINT_HALT)`. The default pipe cannot be halted.
pub fn encode_reset_pipe(r: &ResetPipe, ctx: &EncodeContext) -> Result<Pdu, EncodeError> {
    ctx.pipe(
        r.endpoint_address,
        &[PipeType::Bulk, PipeType::Interrupt, PipeType::Isochronous],
    )?;

    let setup = SetupPacket::new(
        Direction::Out,
        RequestType::Standard,
        Recipient::Endpoint,
        CLEAR_FEATURE,
    )
    .with_value(ENDPOINT_HALT)
    .with_index(u16::from(r.endpoint_address));

    Ok(no_data_submit(ctx, setup))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        status::UsbdStatus,
        transfer::tests::{endpoints, submit_body},
    };

    #[test]
    fn select_configuration() {
        let map = endpoints();
        let ctx = EncodeContext::new(1, &map);

        let pdu = encode_select_configuration(
            &SelectConfiguration {
                configuration_value: 2,
                status: UsbdStatus::Pending,
            },
            &ctx,
        );
        let body = submit_body(&pdu);

        assert_eq!(body.setup.to_bytes(), [0x00, 0x09, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(body.transfer_buffer_length, 0);
        assert_eq!(pdu.header.basic.direction, Direction::Out);
        assert_eq!(pdu.header.basic.ep, 0);
        assert!(pdu.payload.is_empty());
    }

    #[test]
    fn select_interface() {
        let map = endpoints();
        let ctx = EncodeContext::new(1, &map);

        let pdu = encode_select_interface(
            &SelectInterface {
                interface_number: 3,
                alternate_setting: 1,
                status: UsbdStatus::Pending,
            },
            &ctx,
        );

        assert_eq!(
            submit_body(&pdu).setup.to_bytes(),
            [0x01, 0x0B, 0x01, 0x00, 0x03, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn reset_pipe() {
        let map = endpoints();
        let ctx = EncodeContext::new(1, &map);

        let pdu = encode_reset_pipe(
            &ResetPipe {
                endpoint_address: 0x81,
                status: UsbdStatus::Pending,
            },
            &ctx,
        )
        .unwrap();

        assert_eq!(
            submit_body(&pdu).setup.to_bytes(),
            [0x02, 0x01, 0x00, 0x00, 0x81, 0x00, 0x00, 0x00]
        );
        assert_eq!(pdu.header.basic.ep, 0);

        assert!(matches!(
            encode_reset_pipe(
                &ResetPipe {
                    endpoint_address: 0,
                    status: UsbdStatus::Pending,
                },
                &ctx,
            ),
            Err(EncodeError::WrongPipeType { address: 0, .. })
        ));
    }
}
