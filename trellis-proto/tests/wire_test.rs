use smallvec::smallvec;
use trellis_proto::ids::{Epoch, LinkSeq, NodeId};
use trellis_proto::wire::{
    DhHello, E2eAck, FragmentHeader, HbhAck, LinkPing, LinkTail, OverlayHeader, PacketHeader,
    PacketType, PathMask, PingKind, PrioFloodHeader, RelFloodHeader, RelFloodTail, RelType,
    Routing, StatusChange,
};

#[test]
fn packet_header_round_trips_and_carries_the_endian_mark() {
    let header = PacketHeader {
        ptype: PacketType::LinkData,
        sender: NodeId(7),
        ctrl_link_id: 0xdead_beef,
        data_len: 1234,
        ack_len: 48,
        seq_no: 0,
    };
    let mut buf = Vec::new();
    header.encode(&mut buf);
    assert_eq!(buf.len(), PacketHeader::WIRE_LEN);

    // The type word's low bit is the endianness marker.
    let word = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    assert_eq!(word & 0x1, 0x1);
    assert_eq!(PacketType::peek(&buf), Some(PacketType::LinkData));

    let decoded = PacketHeader::decode(&mut &buf[..]).unwrap();
    assert_eq!(decoded, header);
}

#[test]
fn unknown_type_words_are_rejected() {
    let mut buf = Vec::new();
    PacketHeader {
        ptype: PacketType::LinkAck,
        sender: NodeId(1),
        ctrl_link_id: 0,
        data_len: 0,
        ack_len: 0,
        seq_no: 0,
    }
    .encode(&mut buf);
    buf[3] = 0xfe; // clobber the type word
    assert!(PacketHeader::decode(&mut &buf[..]).is_err());
}

#[test]
fn link_tail_with_nacks_round_trips() {
    let tail = LinkTail {
        link_seq: LinkSeq(42),
        seq_nonce: 0x0123_4567_89ab_cdef,
        aru: 41,
        aru_nonce: 0xfeed_face_cafe_beef,
        incarnation: Epoch(1_700_000_000),
        aru_incarnation: Epoch(1_700_000_100),
        nacks: smallvec![37, 39, 40],
    };
    let mut buf = Vec::new();
    tail.encode(&mut buf);
    assert_eq!(buf.len(), tail.wire_len());

    let decoded = LinkTail::decode(&buf, buf.len()).unwrap();
    assert_eq!(decoded, tail);

    // A tail whose nack region is not a whole number of entries is invalid.
    assert!(LinkTail::decode(&buf[..buf.len() - 3], buf.len() - 3).is_err());
}

#[test]
fn fragment_trailer_reads_from_the_end() {
    let mut region = Vec::new();
    region.extend_from_slice(b"payload bytes");
    FragmentHeader {
        frag_len: 13,
        frag_idx: 2,
        frag_total: 3,
    }
    .encode(&mut region);

    let fh = FragmentHeader::read_at_end(&region, region.len()).unwrap();
    assert_eq!(fh.frag_len, 13);
    assert_eq!(fh.frag_idx, 2);
    assert_eq!(fh.frag_total, 3);
}

#[test]
fn ping_and_dh_round_trip() {
    let ping = LinkPing {
        kind: PingKind::Pong,
        seq: 9,
        nonce: 0x1111_2222_3333_4444,
        incarnation: Epoch(5),
        aru_incarnation: Epoch(6),
    };
    let mut buf = Vec::new();
    ping.encode(&mut buf);
    assert_eq!(LinkPing::decode(&mut &buf[..]).unwrap(), ping);

    let hello = DhHello {
        local_iface: trellis_proto::ids::InterfaceId(1),
        remote_iface: trellis_proto::ids::InterfaceId(2),
        incarnation: Epoch(100),
        aru_incarnation: Epoch(0),
        public_key: [0xaa; 32],
        config_hash: [0xbb; 32],
        signature: [0xcc; 64],
    };
    let mut buf = Vec::new();
    hello.encode(&mut buf);
    assert_eq!(buf.len(), DhHello::WIRE_LEN);
    assert_eq!(DhHello::decode(&mut &buf[..]).unwrap(), hello);
}

#[test]
fn overlay_and_flood_headers_round_trip() {
    let overlay = OverlayHeader {
        src: NodeId(3),
        dst: NodeId(9),
        len: 512,
        ttl: 64,
        routing: Routing::PriorityFlood,
    };
    let mut buf = Vec::new();
    overlay.encode(&mut buf);
    assert_eq!(buf[OverlayHeader::TTL_OFFSET], 64);
    assert_eq!(OverlayHeader::decode(&mut &buf[..]).unwrap(), overlay);

    let prio = PrioFloodHeader {
        incarnation: 1_700_000_000,
        seq_num: 77,
        priority: 10,
        origin_sec: 1_700_000_001,
        origin_usec: 500_000,
        expire_sec: 1_700_000_601,
        expire_usec: 500_000,
    };
    let mut buf = Vec::new();
    prio.encode(&mut buf);
    assert_eq!(PrioFloodHeader::decode(&mut &buf[..]).unwrap(), prio);
    assert_eq!(prio.expire_usecs() - prio.origin_usecs(), 600_000_000);

    let rel = RelFloodHeader {
        src: NodeId(2),
        dst: NodeId(5),
        src_epoch: Epoch(1234),
        seq_num: 88,
        rtype: RelType::Data,
    };
    let mut buf = Vec::new();
    rel.encode(&mut buf);
    assert_eq!(RelFloodHeader::decode(&mut &buf[..]).unwrap(), rel);

    let tail = RelFloodTail { ack_len: 48 };
    let mut buf = Vec::new();
    tail.encode(&mut buf);
    assert_eq!(RelFloodTail::decode(&mut &buf[..]).unwrap(), tail);

    let ack = HbhAck {
        src: NodeId(2),
        dst: NodeId(5),
        src_epoch: Epoch(1234),
        sow: 80,
        aru: 87,
    };
    let mut buf = Vec::new();
    ack.encode(&mut buf);
    assert_eq!(buf.len(), HbhAck::WIRE_LEN);
    assert_eq!(HbhAck::decode(&mut &buf[..]).unwrap(), ack);
}

#[test]
fn e2e_and_status_change_round_trip() {
    let mut e2e = E2eAck::new(NodeId(4), 6);
    e2e.cells[2].dest_epoch = Epoch(10);
    e2e.cells[2].src_epoch = Epoch(20);
    e2e.cells[2].aru = 30;
    let mut buf = Vec::new();
    e2e.encode(&mut buf);
    assert_eq!(buf.len(), E2eAck::wire_len(6));
    let decoded = E2eAck::decode(&mut &buf[..], 6).unwrap();
    assert_eq!(decoded, e2e);
    assert!(E2eAck::decode(&mut &buf[..], 8).is_err(), "wrong cell count");

    let mut sc = StatusChange::new(NodeId(4), 6);
    sc.epoch = Epoch(99);
    sc.cells[5].seq = 3;
    sc.cells[5].cost = -1;
    let mut buf = Vec::new();
    sc.encode(&mut buf);
    assert_eq!(buf.len(), StatusChange::wire_len(6));
    assert_eq!(StatusChange::decode(&mut &buf[..], 6).unwrap(), sc);
}

#[test]
fn path_mask_set_operations() {
    let mut a = PathMask::empty(16);
    a.set(NodeId(1));
    a.set(NodeId(9));
    let mut b = a.clone();
    b.set(NodeId(12));

    assert!(b.is_superset(&a));
    assert!(!a.is_superset(&b));
    assert!(b.contains(NodeId(12)));
    assert!(!a.contains(NodeId(12)));

    a.merge(&b);
    assert!(a.is_superset(&b) && b.is_superset(&a));

    let full = PathMask::full(16);
    assert!(full.contains(NodeId(16)));
    assert!(full.is_superset(&a));
}

mod mask_props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Merging always yields a superset of both operands, and the
        /// superset relation survives an encode/decode round trip.
        #[test]
        fn merge_produces_a_superset(
            xs in prop::collection::vec(1u16..=32, 0..10),
            ys in prop::collection::vec(1u16..=32, 0..10),
        ) {
            let mut a = PathMask::empty(32);
            for x in &xs {
                a.set(NodeId(*x));
            }
            let mut b = PathMask::empty(32);
            for y in &ys {
                b.set(NodeId(*y));
            }

            let mut merged = a.clone();
            merged.merge(&b);
            prop_assert!(merged.is_superset(&a));
            prop_assert!(merged.is_superset(&b));
            for n in xs.iter().chain(ys.iter()) {
                prop_assert!(merged.contains(NodeId(*n)));
            }

            let mut buf = Vec::new();
            merged.encode(&mut buf);
            let decoded = PathMask::decode(&mut &buf[..], 32).unwrap();
            prop_assert_eq!(decoded, merged);
        }
    }
}
