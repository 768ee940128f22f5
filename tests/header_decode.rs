//! Arbitrary bytes off the wire never panic the header decoder.

use proptest::prelude::*;
use usbip::proto::{
    Direction, HeaderBody, PduHeader,
    pdu::{MAX_ISO_PACKETS, USBIP_HEADER_SIZE},
};

proptest! {
    #[test]
    fn decoding_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..96)) {
        let decoded = PduHeader::to_host(&bytes);

        if bytes.len() < USBIP_HEADER_SIZE {
            prop_assert!(decoded.is_err());
        }

        if let Ok(header) = decoded {
            prop_assert!(header.basic.ep <= 15);

            for direction in [Direction::In, Direction::Out] {
                prop_assert!(header.total_size(direction) >= USBIP_HEADER_SIZE);
            }
        }
    }

    #[test]
    fn decoded_packet_counts_are_bounded(
        command in 1u32..=4,
        fields in proptest::array::uniform32(any::<u8>()),
        number_of_packets in any::<i32>(),
    ) {
        let mut bytes = [0; USBIP_HEADER_SIZE];
        bytes[..4].copy_from_slice(&command.to_be_bytes());
        bytes[16..48].copy_from_slice(&fields);
        bytes[12..16].copy_from_slice(&1u32.to_be_bytes());
        bytes[16..20].copy_from_slice(&0u32.to_be_bytes());
        bytes[32..36].copy_from_slice(&number_of_packets.to_be_bytes());

        let count = match PduHeader::to_host(&bytes) {
            Ok(PduHeader { body: HeaderBody::CmdSubmit(cmd), .. }) => cmd.number_of_packets,
            Ok(PduHeader { body: HeaderBody::RetSubmit(ret), .. }) => ret.number_of_packets,
            _ => None,
        };

        if let Some(count) = count {
            prop_assert!(count <= MAX_ISO_PACKETS);
        }
    }
}
