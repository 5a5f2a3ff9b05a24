//! Property tests for the framed packet codec.

use proptest::prelude::*;

use wire::{looks_like_packet, Flags, Packet, PacketType, WireError, HEADER_LEN};

fn arb_packet_type() -> impl Strategy<Value = PacketType> {
    prop_oneof![
        Just(PacketType::Punch),
        Just(PacketType::PunchAck),
        Just(PacketType::Keepalive),
        Just(PacketType::KeepaliveAck),
        Just(PacketType::FileOffer),
        Just(PacketType::FileAccept),
        Just(PacketType::FileReject),
        Just(PacketType::Data),
        Just(PacketType::Sack),
        Just(PacketType::Complete),
        Just(PacketType::Verified),
        Just(PacketType::Cancel),
        Just(PacketType::CoordRegister),
        Just(PacketType::CoordChallenge),
        Just(PacketType::CoordAuth),
        Just(PacketType::CoordOk),
        Just(PacketType::CoordPeerInfo),
        Just(PacketType::CoordKeepalive),
        Just(PacketType::CoordRelay),
        Just(PacketType::CoordPing),
        Just(PacketType::CoordPong),
        Just(PacketType::CoordError),
        Just(PacketType::Error),
    ]
}

fn arb_packet() -> impl Strategy<Value = Packet> {
    (
        arb_packet_type(),
        any::<u8>(),
        any::<u32>(),
        any::<u32>(),
        proptest::collection::vec(any::<u8>(), 0..=1180),
    )
        .prop_map(|(packet_type, flags, connection_id, sequence, payload)| Packet {
            packet_type,
            flags: Flags::from_bits(flags),
            connection_id,
            sequence,
            payload,
        })
}

proptest! {
    #[test]
    fn decode_inverts_encode(packet in arb_packet()) {
        let encoded = packet.encode().expect("valid packet encodes");
        prop_assert!(encoded.len() <= 1200);
        prop_assert_eq!(Packet::decode(&encoded).expect("decodes"), packet);
    }

    #[test]
    fn any_header_corruption_is_caught(packet in arb_packet(), index in 0usize..16, bit in 0u8..8) {
        let mut encoded = packet.encode().expect("valid packet encodes");
        encoded[index] ^= 1 << bit;
        // Every single-bit header corruption must fail: either a field check
        // (magic, version, length) or the CRC trips.
        prop_assert!(Packet::decode(&encoded).is_err());
    }

    #[test]
    fn crc_corruption_is_caught(packet in arb_packet(), index in 16usize..HEADER_LEN, bit in 0u8..8) {
        let mut encoded = packet.encode().expect("valid packet encodes");
        encoded[index] ^= 1 << bit;
        prop_assert_eq!(
            Packet::decode(&encoded),
            Err(WireError::MalformedPacket { reason: "header crc mismatch" })
        );
    }

    #[test]
    fn magic_probe_accepts_all_encodings(packet in arb_packet()) {
        let encoded = packet.encode().expect("valid packet encodes");
        prop_assert!(looks_like_packet(&encoded));
    }
}

#[test]
fn unknown_type_with_recomputed_crc_is_rejected() {
    let packet = Packet::header_only(PacketType::Data, 1);
    let mut encoded = packet.encode().expect("encode");
    encoded[3] = 0xFE;
    let crc = crc32fast::hash(&encoded[..16]);
    encoded[16..20].copy_from_slice(&crc.to_be_bytes());
    assert_eq!(
        Packet::decode(&encoded),
        Err(WireError::MalformedPacket {
            reason: "unknown packet type"
        })
    );
}
