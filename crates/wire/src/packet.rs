use crate::{Flags, PacketType, WireError};

/// First two bytes of every udrop datagram.
pub const MAGIC: [u8; 2] = [0xA1, 0x7F];

/// Protocol version carried in byte 2.
pub const VERSION: u8 = 1;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 20;

/// Largest payload a single packet may carry.
pub const MAX_PAYLOAD: usize = 1180;

/// Largest whole datagram: header plus maximal payload.
pub const MAX_DATAGRAM: usize = HEADER_LEN + MAX_PAYLOAD;

/// A decoded protocol packet.
///
/// `sequence` is only meaningful for windowed [`PacketType::Data`] traffic;
/// control packets carry zero. Comparing sequences across the 32-bit wrap
/// is the transport's job (`transport::seq`), not the codec's.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    /// Message type resolved from the header.
    pub packet_type: PacketType,
    /// Informational flag bits.
    pub flags: Flags,
    /// Opaque 32-bit connection identifier.
    pub connection_id: u32,
    /// 32-bit sequence number, wrapping.
    pub sequence: u32,
    /// Payload bytes, at most [`MAX_PAYLOAD`].
    pub payload: Vec<u8>,
}

impl Packet {
    /// Builds a packet with default flags and an empty payload.
    #[must_use]
    pub fn header_only(packet_type: PacketType, connection_id: u32) -> Self {
        Self {
            packet_type,
            flags: Flags::default(),
            connection_id,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    /// Builds a control packet carrying `payload`.
    #[must_use]
    pub fn control(packet_type: PacketType, connection_id: u32, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            flags: Flags::default(),
            connection_id,
            sequence: 0,
            payload,
        }
    }

    /// Serialises the packet into a single datagram.
    ///
    /// Lays out the 20-byte header, computes the CRC-32 over bytes 0..16 and
    /// stores it at bytes 16..20, then appends the payload.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                len: self.payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&MAGIC);
        buf.push(VERSION);
        buf.push(self.packet_type.as_wire());
        buf.push(self.flags.bits());
        buf.extend_from_slice(&self.connection_id.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.push(0); // reserved

        let crc = crc32fast::hash(&buf[..16]);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parses one datagram into a packet, validating every header field.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_LEN {
            return Err(WireError::malformed("short datagram"));
        }
        if data.len() > MAX_DATAGRAM {
            return Err(WireError::malformed("oversized datagram"));
        }
        if data[0..2] != MAGIC {
            return Err(WireError::malformed("bad magic"));
        }
        if data[2] != VERSION {
            return Err(WireError::malformed("unsupported version"));
        }

        let payload_length = u16::from_be_bytes([data[13], data[14]]) as usize;
        if payload_length > MAX_PAYLOAD {
            return Err(WireError::malformed("payload length out of range"));
        }
        if data.len() < HEADER_LEN + payload_length {
            return Err(WireError::malformed("truncated payload"));
        }
        if data.len() > HEADER_LEN + payload_length {
            return Err(WireError::malformed("trailing bytes"));
        }

        let stored_crc = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
        if crc32fast::hash(&data[..16]) != stored_crc {
            return Err(WireError::malformed("header crc mismatch"));
        }

        let packet_type = PacketType::from_wire(data[3])?;
        Ok(Self {
            packet_type,
            flags: Flags::from_bits(data[4]),
            connection_id: u32::from_be_bytes([data[5], data[6], data[7], data[8]]),
            sequence: u32::from_be_bytes([data[9], data[10], data[11], data[12]]),
            payload: data[HEADER_LEN..].to_vec(),
        })
    }
}

/// Cheap magic-only probe.
///
/// The hole-punch loop uses this to tell our datagrams from stray traffic
/// without paying for a full decode; it deliberately ignores everything past
/// the magic so a corrupt-but-ours packet still counts as ours.
#[must_use]
pub fn looks_like_packet(data: &[u8]) -> bool {
    data.len() >= 2 && data[0..2] == MAGIC
}
