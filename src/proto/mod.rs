pub mod char_buf;
pub mod op;
pub mod pdu;
pub mod setup;

pub use pdu::{
    Command, Direction, HeaderBasic, HeaderBody, IsoPacketDescriptor, Pdu, PduHeader,
    ProtocolError, SeqNum,
};
pub use setup::SetupPacket;
