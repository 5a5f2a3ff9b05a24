use crate::WireError;

/// Message types carried in the packet header.
///
/// The numeric space is partitioned: `0x0x` connection maintenance, `0x1x`
/// transfer negotiation, `0x2x` data plane, `0x3x` transfer completion,
/// `0xCx` coordination traffic, `0xFF` fatal error.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum PacketType {
    /// Hole-punch probe.
    Punch = 0x01,
    /// Acknowledges a received [`PacketType::Punch`].
    PunchAck = 0x02,
    /// Connection liveness probe.
    Keepalive = 0x03,
    /// Reply to [`PacketType::Keepalive`].
    KeepaliveAck = 0x04,
    /// Offers a file: metadata payload.
    FileOffer = 0x10,
    /// Accepts an offer; carries the resume offset.
    FileAccept = 0x11,
    /// Declines an offer.
    FileReject = 0x12,
    /// A windowed data chunk.
    Data = 0x20,
    /// Selective acknowledgment for received data.
    Sack = 0x21,
    /// Sender finished; carries the whole-file digest.
    Complete = 0x30,
    /// Receiver verified the digest.
    Verified = 0x31,
    /// Best-effort abort notification.
    Cancel = 0x32,
    /// Client joins a coordination session.
    CoordRegister = 0xC0,
    /// Server challenge: 32-byte nonce.
    CoordChallenge = 0xC1,
    /// Client proof: HMAC over nonce and session id.
    CoordAuth = 0xC2,
    /// Authentication succeeded; echoes the observed endpoint.
    CoordOk = 0xC3,
    /// The other peer's public endpoint.
    CoordPeerInfo = 0xC4,
    /// Refreshes the session idle timer.
    CoordKeepalive = 0xC5,
    /// Reserved for relayed traffic.
    CoordRelay = 0xC6,
    /// Liveness probe to the coordination server.
    CoordPing = 0xC7,
    /// Reply to [`PacketType::CoordPing`].
    CoordPong = 0xC8,
    /// Coordination failure: code and message.
    CoordError = 0xCF,
    /// Fatal peer-level error.
    Error = 0xFF,
}

impl PacketType {
    /// Resolves a wire byte into a message type.
    pub fn from_wire(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0x01 => Self::Punch,
            0x02 => Self::PunchAck,
            0x03 => Self::Keepalive,
            0x04 => Self::KeepaliveAck,
            0x10 => Self::FileOffer,
            0x11 => Self::FileAccept,
            0x12 => Self::FileReject,
            0x20 => Self::Data,
            0x21 => Self::Sack,
            0x30 => Self::Complete,
            0x31 => Self::Verified,
            0x32 => Self::Cancel,
            0xC0 => Self::CoordRegister,
            0xC1 => Self::CoordChallenge,
            0xC2 => Self::CoordAuth,
            0xC3 => Self::CoordOk,
            0xC4 => Self::CoordPeerInfo,
            0xC5 => Self::CoordKeepalive,
            0xC6 => Self::CoordRelay,
            0xC7 => Self::CoordPing,
            0xC8 => Self::CoordPong,
            0xCF => Self::CoordError,
            0xFF => Self::Error,
            _ => return Err(WireError::malformed("unknown packet type")),
        })
    }

    /// Returns the wire byte for this type.
    #[must_use]
    pub const fn as_wire(self) -> u8 {
        self as u8
    }
}

/// Header flag bits.
///
/// The bits are informational today: peers set them to describe the payload
/// but no current code path branches on them.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Flags(u8);

impl Flags {
    /// Payload travels inside an encrypted transport.
    pub const ENCRYPTED: u8 = 0b0000_0001;
    /// Payload bytes are compressed.
    pub const COMPRESSED: u8 = 0b0000_0010;
    /// Packet was forwarded by a relay.
    pub const RELAYED: u8 = 0b0000_0100;

    /// Wraps a raw flag byte.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Returns the raw flag byte.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns a copy with the given bits set.
    #[must_use]
    pub const fn with(self, bits: u8) -> Self {
        Self(self.0 | bits)
    }

    /// Reports whether every bit in `bits` is set.
    #[must_use]
    pub const fn contains(self, bits: u8) -> bool {
        self.0 & bits == bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_declared_type_round_trips() {
        let all = [
            PacketType::Punch,
            PacketType::PunchAck,
            PacketType::Keepalive,
            PacketType::KeepaliveAck,
            PacketType::FileOffer,
            PacketType::FileAccept,
            PacketType::FileReject,
            PacketType::Data,
            PacketType::Sack,
            PacketType::Complete,
            PacketType::Verified,
            PacketType::Cancel,
            PacketType::CoordRegister,
            PacketType::CoordChallenge,
            PacketType::CoordAuth,
            PacketType::CoordOk,
            PacketType::CoordPeerInfo,
            PacketType::CoordKeepalive,
            PacketType::CoordRelay,
            PacketType::CoordPing,
            PacketType::CoordPong,
            PacketType::CoordError,
            PacketType::Error,
        ];
        for ty in all {
            assert_eq!(PacketType::from_wire(ty.as_wire()), Ok(ty));
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert_eq!(
            PacketType::from_wire(0xFE),
            Err(WireError::malformed("unknown packet type"))
        );
        assert!(PacketType::from_wire(0x00).is_err());
    }

    #[test]
    fn flag_bits_compose() {
        let flags = Flags::default().with(Flags::ENCRYPTED).with(Flags::RELAYED);
        assert!(flags.contains(Flags::ENCRYPTED));
        assert!(flags.contains(Flags::RELAYED));
        assert!(!flags.contains(Flags::COMPRESSED));
        assert_eq!(flags.bits(), 0b0000_0101);
    }
}
