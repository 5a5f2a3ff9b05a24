//! Wire format for the udrop peer-to-peer transfer protocol.
//!
//! Every datagram exchanged between peers and with the coordination server
//! is a single framed packet: a fixed 20-byte big-endian header protected by
//! a CRC-32, followed by at most [`MAX_PAYLOAD`] payload bytes. The total
//! datagram never exceeds [`MAX_DATAGRAM`] bytes so it survives common path
//! MTUs without fragmentation.
//!
//! Decoding is strict. A datagram that is short, carries the wrong magic or
//! version, overstates or understates its payload length, fails the header
//! CRC, or names an unknown message type is rejected as a whole; no partial
//! parse is ever exposed.

mod endpoint;
mod error;
mod packet;
mod payload;
mod types;

pub use endpoint::{decode_endpoint, encode_endpoint};
pub use error::WireError;
pub use packet::{
    Packet, looks_like_packet, HEADER_LEN, MAGIC, MAX_DATAGRAM, MAX_PAYLOAD, VERSION,
};
pub use payload::{
    decode_endpoint_payload, encode_endpoint_payload, AuthPayload, ChallengePayload,
    CompletePayload, DataHeader, ErrorPayload, FileAccept, FileMetadata, RegisterPayload,
    SackInfo, DATA_HEADER_LEN,
};
pub use types::{Flags, PacketType};
