use bytes::Bytes;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use trellis_link::{BurstBudget, Datagram, LinkEvent, LinkSession, SendStatus, SessionParams};
use trellis_proto::config::{ConfigHash, LinkConfig, PrioConfig, RelConfig};
use trellis_proto::crypto::{NodeIdentity, NodeVerifier};
use trellis_proto::ids::{Epoch, InterfaceId, NodeId};

fn make_pair(cfg: LinkConfig) -> (LinkSession, LinkSession, BurstBudget, Instant) {
    let now = Instant::now();
    let cfg = Arc::new(cfg);
    let hash = ConfigHash::compute(&cfg, &PrioConfig::default(), &RelConfig::default(), b"t");

    let id_a = NodeIdentity::from_seed(NodeId(1), &[1u8; 32]);
    let id_b = NodeIdentity::from_seed(NodeId(2), &[2u8; 32]);
    let mut verifier = NodeVerifier::new(4);
    verifier.insert(NodeId(1), id_a.verifying_key());
    verifier.insert(NodeId(2), id_b.verifying_key());
    let verifier = Arc::new(verifier);

    let a = LinkSession::new(
        SessionParams {
            cfg: cfg.clone(),
            local_node: NodeId(1),
            peer_node: NodeId(2),
            local_iface: InterfaceId(11),
            remote_iface: InterfaceId(22),
            ctrl_link_id: 7,
            my_incarnation: Epoch(1000),
            identity: Arc::new(id_a),
            verifier: verifier.clone(),
            config_hash: hash,
        },
        now,
        rand::rngs::StdRng::seed_from_u64(11),
    );
    let b = LinkSession::new(
        SessionParams {
            cfg: cfg.clone(),
            local_node: NodeId(2),
            peer_node: NodeId(1),
            local_iface: InterfaceId(22),
            remote_iface: InterfaceId(11),
            ctrl_link_id: 7,
            my_incarnation: Epoch(2000),
            identity: Arc::new(id_b),
            verifier,
            config_hash: hash,
        },
        now,
        rand::rngs::StdRng::seed_from_u64(22),
    );
    let burst = BurstBudget::new(&cfg, now);
    (a, b, burst, now)
}

/// Exchange queued datagrams in both directions until the wire is quiet.
fn pump(
    a: &mut LinkSession,
    b: &mut LinkSession,
    mut a_out: Vec<Datagram>,
    mut b_out: Vec<Datagram>,
    now: Instant,
    burst: &mut BurstBudget,
) {
    for _ in 0..64 {
        if a_out.is_empty() && b_out.is_empty() {
            break;
        }
        let mut next_b: Vec<Datagram> = Vec::new();
        for dg in a_out.drain(..) {
            next_b.extend(b.handle_datagram(&dg, now, burst));
        }
        let mut next_a: Vec<Datagram> = Vec::new();
        for dg in b_out.drain(..) {
            next_a.extend(a.handle_datagram(&dg, now, burst));
        }
        a_out = next_a;
        b_out = next_b;
    }
}

fn drain_deliveries(session: &mut LinkSession, sink: &mut Vec<Bytes>) {
    while let Some(event) = session.poll_event() {
        if let LinkEvent::Deliver(msg) = event {
            sink.push(msg);
        }
    }
}

fn establish(
    a: &mut LinkSession,
    b: &mut LinkSession,
    now: &mut Instant,
    burst: &mut BurstBudget,
) {
    let a0 = a.start(*now);
    let b0 = b.start(*now);
    pump(a, b, a0, b0, *now, burst);
    // A few ping rounds complete establishment and sync incarnations.
    for _ in 0..4 {
        *now += Duration::from_millis(250);
        let ap = a.poll(*now, burst);
        let bp = b.poll(*now, burst);
        pump(a, b, ap, bp, *now, burst);
    }
}

#[test]
fn crypto_link_delivers_one_thousand_in_order() {
    let (mut a, mut b, mut burst, mut now) = make_pair(LinkConfig::default());
    establish(&mut a, &mut b, &mut now, &mut burst);

    let total = 1000usize;
    let mut sent = 0usize;
    let mut delivered: Vec<Bytes> = Vec::new();

    let mut rounds = 0;
    while delivered.len() < total {
        rounds += 1;
        assert!(rounds < 5000, "no progress after {rounds} rounds");

        let mut a_out = Vec::new();
        while sent < total {
            let body = Bytes::from(format!("message number {sent:05}"));
            let (status, dgs) = a.send(body, now);
            match status {
                SendStatus::Ok => {
                    a_out.extend(dgs);
                    sent += 1;
                }
                SendStatus::Full => break,
                SendStatus::Drop => panic!("unexpected drop"),
            }
            assert!(a.window_invariant_holds());
        }

        pump(&mut a, &mut b, a_out, Vec::new(), now, &mut burst);
        drain_deliveries(&mut b, &mut delivered);

        now += Duration::from_millis(15);
        let ap = a.poll(now, &mut burst);
        let bp = b.poll(now, &mut burst);
        pump(&mut a, &mut b, ap, bp, now, &mut burst);
        drain_deliveries(&mut b, &mut delivered);
        assert!(a.window_invariant_holds());
    }

    assert_eq!(delivered.len(), total);
    for (i, msg) in delivered.iter().enumerate() {
        assert_eq!(&msg[..], format!("message number {i:05}").as_bytes());
    }

    // Everything acknowledged: tail catches up with head once acks settle.
    for _ in 0..8 {
        now += Duration::from_millis(15);
        let ap = a.poll(now, &mut burst);
        let bp = b.poll(now, &mut burst);
        pump(&mut a, &mut b, ap, bp, now, &mut burst);
    }
    let (tail, _, head) = a.window_cursors();
    assert_eq!(tail, head, "window should fully drain");
}

#[test]
fn lossy_link_recovers_via_nacks() {
    let mut cfg = LinkConfig::default();
    cfg.crypto = false;
    cfg.encrypt = false;
    let (mut a, mut b, mut burst, mut now) = make_pair(cfg);
    establish(&mut a, &mut b, &mut now, &mut burst);

    let total = 60usize;
    let mut delivered: Vec<Bytes> = Vec::new();
    let mut drop_counter = 0usize;

    let mut sent = 0usize;
    let mut rounds = 0;
    while delivered.len() < total {
        rounds += 1;
        assert!(rounds < 2000, "no progress under loss");

        while sent < total {
            let (status, dgs) = a.send(Bytes::from(format!("payload {sent}")), now);
            match status {
                SendStatus::Ok => {
                    for dg in dgs {
                        // Drop every third first-transmission datagram.
                        drop_counter += 1;
                        if drop_counter % 3 != 0 {
                            let replies = b.handle_datagram(&dg, now, &mut burst);
                            pump(&mut a, &mut b, Vec::new(), replies, now, &mut burst);
                        }
                    }
                    sent += 1;
                }
                SendStatus::Full => break,
                SendStatus::Drop => panic!("unexpected drop"),
            }
        }

        now += Duration::from_millis(25);
        let ap = a.poll(now, &mut burst);
        let bp = b.poll(now, &mut burst);
        pump(&mut a, &mut b, ap, bp, now, &mut burst);
        drain_deliveries(&mut b, &mut delivered);
    }

    for (i, msg) in delivered.iter().enumerate() {
        assert_eq!(&msg[..], format!("payload {i}").as_bytes());
    }
}

#[test]
fn forged_cumulative_ack_is_ignored() {
    use smallvec::SmallVec;
    use trellis_proto::wire::{LinkTail, PacketHeader, PacketType};

    let mut cfg = LinkConfig::default();
    cfg.crypto = false;
    cfg.encrypt = false;
    let (mut a, mut b, mut burst, mut now) = make_pair(cfg);
    establish(&mut a, &mut b, &mut now, &mut burst);

    // Queue two messages but do not let the acks flow back.
    let (s1, _dgs1) = a.send(Bytes::from_static(b"first"), now);
    let (s2, _dgs2) = a.send(Bytes::from_static(b"second"), now);
    assert_eq!(s1, SendStatus::Ok);
    assert_eq!(s2, SendStatus::Ok);
    let (tail_before, _, _) = a.window_cursors();

    // An attacker replays an ack claiming receipt of seq 1 with a bogus
    // nonce digest.
    let forged_tail = LinkTail {
        link_seq: trellis_proto::ids::LinkSeq(0),
        seq_nonce: 0,
        aru: 1,
        aru_nonce: 0xdead_beef_dead_beef,
        incarnation: Epoch(2000),
        aru_incarnation: Epoch(1000),
        nacks: SmallVec::new(),
    };
    let header = PacketHeader {
        ptype: PacketType::LinkAck,
        sender: NodeId(2),
        ctrl_link_id: 7,
        data_len: 0,
        ack_len: forged_tail.wire_len() as u16,
        seq_no: 0,
    };
    let mut forged = Vec::new();
    header.encode(&mut forged);
    forged_tail.encode(&mut forged);

    let replies = a.handle_datagram(&forged, now, &mut burst);
    assert!(replies.is_empty());
    let (tail_after, _, _) = a.window_cursors();
    assert_eq!(tail_before, tail_after, "forged ack must not move the window");
}

#[test]
fn peer_restart_resets_the_stream() {
    let mut cfg = LinkConfig::default();
    cfg.crypto = false;
    cfg.encrypt = false;
    let (mut a, mut b, mut burst, mut now) = make_pair(cfg.clone());
    establish(&mut a, &mut b, &mut now, &mut burst);

    let mut delivered = Vec::new();
    let (_, dgs) = a.send(Bytes::from_static(b"before restart"), now);
    pump(&mut a, &mut b, dgs, Vec::new(), now, &mut burst);
    drain_deliveries(&mut b, &mut delivered);
    assert_eq!(delivered.len(), 1);

    // B crashes and comes back with a later incarnation.
    let hash = ConfigHash::compute(&cfg, &PrioConfig::default(), &RelConfig::default(), b"t");
    let id_b = NodeIdentity::from_seed(NodeId(2), &[2u8; 32]);
    let mut verifier = NodeVerifier::new(4);
    let id_a = NodeIdentity::from_seed(NodeId(1), &[1u8; 32]);
    verifier.insert(NodeId(1), id_a.verifying_key());
    verifier.insert(NodeId(2), id_b.verifying_key());
    let mut b2 = LinkSession::new(
        SessionParams {
            cfg: Arc::new(cfg),
            local_node: NodeId(2),
            peer_node: NodeId(1),
            local_iface: InterfaceId(22),
            remote_iface: InterfaceId(11),
            ctrl_link_id: 7,
            my_incarnation: Epoch(3000),
            identity: Arc::new(id_b),
            verifier: Arc::new(verifier),
            config_hash: hash,
        },
        now,
        rand::rngs::StdRng::seed_from_u64(33),
    );
    // A's stored response window from the first exchange must lapse before
    // it will accept another incarnation change.
    now += Duration::from_secs(2);
    let b0 = b2.start(now);
    pump(&mut a, &mut b2, Vec::new(), b0, now, &mut burst);
    for _ in 0..4 {
        now += Duration::from_millis(250);
        let ap = a.poll(now, &mut burst);
        let bp = b2.poll(now, &mut burst);
        pump(&mut a, &mut b2, ap, bp, now, &mut burst);
    }

    let mut restarted = false;
    while let Some(event) = a.poll_event() {
        if matches!(event, LinkEvent::PeerRestarted) {
            restarted = true;
        }
    }
    assert!(restarted, "A should notice B's new incarnation");

    // The fresh stream starts at the first sequence again and delivers.
    let (status, dgs) = a.send(Bytes::from_static(b"after restart"), now);
    assert_eq!(status, SendStatus::Ok);
    pump(&mut a, &mut b2, dgs, Vec::new(), now, &mut burst);
    let mut delivered2 = Vec::new();
    drain_deliveries(&mut b2, &mut delivered2);
    assert_eq!(delivered2.len(), 1);
    assert_eq!(&delivered2[0][..], b"after restart");
}

#[test]
fn queued_data_survives_until_handshake_completes() {
    let mut cfg = LinkConfig::default();
    cfg.reintroduce_messages = true;
    let (mut a, mut b, mut burst, mut now) = make_pair(cfg);

    // Queue before any handshake: nothing can go on the wire yet.
    let a0 = a.start(now);
    let b0 = b.start(now);
    let (status, dgs) = a.send(Bytes::from_static(b"early bird"), now);
    assert_eq!(status, SendStatus::Ok);
    assert!(dgs.is_empty(), "no sealed packets before a key exists");

    pump(&mut a, &mut b, a0, b0, now, &mut burst);
    let mut delivered = Vec::new();
    for _ in 0..8 {
        now += Duration::from_millis(250);
        let ap = a.poll(now, &mut burst);
        let bp = b.poll(now, &mut burst);
        pump(&mut a, &mut b, ap, bp, now, &mut burst);
        drain_deliveries(&mut b, &mut delivered);
        if !delivered.is_empty() {
            break;
        }
    }
    assert_eq!(delivered.len(), 1);
    assert_eq!(&delivered[0][..], b"early bird");
}

#[test]
fn large_message_fragments_and_reassembles() {
    let (mut a, mut b, mut burst, mut now) = make_pair(LinkConfig::default());
    establish(&mut a, &mut b, &mut now, &mut burst);

    let big: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let (status, dgs) = a.send(Bytes::from(big.clone()), now);
    assert_eq!(status, SendStatus::Ok);

    let mut delivered = Vec::new();
    pump(&mut a, &mut b, dgs, Vec::new(), now, &mut burst);
    drain_deliveries(&mut b, &mut delivered);
    for _ in 0..32 {
        if !delivered.is_empty() {
            break;
        }
        now += Duration::from_millis(15);
        let ap = a.poll(now, &mut burst);
        let bp = b.poll(now, &mut burst);
        pump(&mut a, &mut b, ap, bp, now, &mut burst);
        drain_deliveries(&mut b, &mut delivered);
    }
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].len(), big.len());
    assert_eq!(&delivered[0][..], &big[..]);
}
