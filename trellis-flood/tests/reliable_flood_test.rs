mod common;

use common::World;
use trellis_link::LinkStatus;
use trellis_proto::ids::NodeId;

#[test]
fn handshake_completes_and_data_flows_in_order() {
    let mut world = World::new(&[1, 2], &[(1, 2, 10)]);
    world.bring_links_up();
    world.pump(50);

    assert!(world.node(1).rel.can_flow_send(NodeId(2)), "handshake with 2");
    assert!(world.node(2).rel.can_flow_send(NodeId(1)), "handshake with 1");

    let verifier = world.verifier.clone();
    let identity = world.node(1).identity.clone();
    for i in 0..5u32 {
        let payload = format!("reliable message {i}");
        let now = world.now;
        let node = world.node(1);
        node.rel
            .inject(
                payload.as_bytes(),
                NodeId(2),
                0,
                &mut node.net,
                &identity,
                &verifier,
                now,
            )
            .expect("flow open");
    }
    world.pump(100);

    let mut delivered = Vec::new();
    while let Some(msg) = world.node(2).rel.poll_delivery() {
        delivered.push(msg);
    }
    assert_eq!(delivered.len(), 5);
    for (i, msg) in delivered.iter().enumerate() {
        let expect = format!("reliable message {i}");
        // Payload sits between the overlay header and the flood header.
        let payload = &msg[8..8 + expect.len()];
        assert_eq!(payload, expect.as_bytes());
    }
    let (count, _) = world.node(2).rel.delivered_from(NodeId(1));
    assert_eq!(count, 5);
}

#[test]
fn triangle_survives_a_lossy_leg() {
    let mut world = World::new(
        &[1, 2, 3],
        &[(1, 2, 10), (2, 3, 10), (1, 3, 10)],
    );
    world.drop_pct.insert((2, 3), 30);
    world.drop_pct.insert((3, 2), 30);
    world.bring_links_up();
    world.pump(80);

    assert!(world.node(1).rel.can_flow_send(NodeId(3)));

    let verifier = world.verifier.clone();
    let identity = world.node(1).identity.clone();
    let now = world.now;
    let node = world.node(1);
    node.rel
        .inject(
            b"across the triangle",
            NodeId(3),
            2,
            &mut node.net,
            &identity,
            &verifier,
            now,
        )
        .expect("flow open");
    world.pump(150);

    let (count, bytes) = world.node(3).rel.delivered_from(NodeId(1));
    assert_eq!(count, 1, "delivered exactly once despite loss");
    assert_eq!(bytes, b"across the triangle".len() as u64);
}

#[test]
fn destination_restart_resets_the_flow_without_replay() {
    let mut world = World::new(&[1, 2], &[(1, 2, 10)]);
    world.bring_links_up();
    world.pump(50);

    let verifier = world.verifier.clone();
    let identity = world.node(1).identity.clone();
    let now = world.now;
    let node = world.node(1);
    node.rel
        .inject(b"pre-restart", NodeId(2), 0, &mut node.net, &identity, &verifier, now)
        .expect("flow open");
    world.pump(80);
    assert_eq!(world.node(2).rel.delivered_from(NodeId(1)).0, 1);

    // Node 2 crashes and restarts with a later epoch.
    {
        let later = world.now.saturating_add(std::time::Duration::from_secs(5));
        let node2 = world.node(2);
        node2.rel = trellis_flood::ReliableFlood::new(
            trellis_proto::config::RelConfig::default(),
            &node2.net,
            10_000,
            later,
        );
    }
    world.now = world.now.saturating_add(std::time::Duration::from_secs(5));
    world.bring_links_up();
    world.pump(120);

    assert!(
        world.node(1).rel.can_flow_send(NodeId(2)),
        "handshake re-established after restart"
    );

    let now = world.now;
    let node = world.node(1);
    node.rel
        .inject(b"post-restart", NodeId(2), 0, &mut node.net, &identity, &verifier, now)
        .expect("flow reopened");
    world.pump(80);

    // The fresh engine only ever saw the post-restart message.
    assert_eq!(world.node(2).rel.delivered_from(NodeId(1)).0, 1);
    let delivered = world.node(2).rel.poll_delivery().expect("delivered");
    assert_eq!(&delivered[8..8 + 12], b"post-restart");
}

#[test]
fn non_monotone_e2e_is_rejected() {
    let mut world = World::new(&[1, 2], &[(1, 2, 10)]);
    world.bring_links_up();
    world.pump(50);

    let verifier = world.verifier.clone();
    let identity = world.node(1).identity.clone();
    for i in 0..3 {
        let now = world.now;
        let node = world.node(1);
        node.rel
            .inject(
                format!("msg {i}").as_bytes(),
                NodeId(2),
                0,
                &mut node.net,
                &identity,
                &verifier,
                now,
            )
            .expect("flow open");
    }
    world.pump(100);

    let good = world
        .node(1)
        .rel
        .stored_e2e(NodeId(2))
        .expect("E2E from 2 stored")
        .clone();
    let good_aru = good.cells[1].aru;
    assert!(good_aru >= 3, "destination acked the three messages");

    // An attacker replays an E2E whose cell went backwards.
    let mut stale = good.clone();
    stale.cells[1].aru -= 1;
    let sig2 = {
        let mut bytes = Vec::new();
        stale.encode(&mut bytes);
        world.node(2).identity.sign_parts(&[&b"RFE2"[..], &bytes])
    };
    let msg = {
        use trellis_proto::wire::{OverlayHeader, RelFloodHeader, RelFloodTail, RelType, Routing};
        let mut payload = Vec::new();
        stale.encode(&mut payload);
        let mut m = Vec::new();
        OverlayHeader {
            src: NodeId(2),
            dst: NodeId(1),
            len: payload.len() as u16,
            ttl: 255,
            routing: Routing::ReliableFlood,
        }
        .encode(&mut m);
        m.extend_from_slice(&payload);
        RelFloodHeader {
            src: NodeId(0),
            dst: NodeId(0),
            src_epoch: trellis_proto::ids::Epoch(0),
            seq_num: 0,
            rtype: RelType::E2e,
        }
        .encode(&mut m);
        m.extend_from_slice(&sig2);
        RelFloodTail { ack_len: 0 }.encode(&mut m);
        bytes::Bytes::from(m)
    };

    let now = world.now;
    let node = world.node(1);
    node.rel.disseminate(
        Some(NodeId(2)),
        msg,
        &mut node.net,
        &identity,
        &verifier,
        now,
    );

    let stored = world.node(1).rel.stored_e2e(NodeId(2)).expect("still stored");
    assert_eq!(stored.cells[1].aru, good_aru, "stale E2E must not regress state");
}

#[test]
fn status_change_validation_and_single_application() {
    let mut world = World::new(
        &[1, 2, 3],
        &[(1, 2, 10), (2, 3, 10), (1, 3, 10)],
    );
    world.bring_links_up();
    world.pump(50);

    // Node 1 sees its link to 2 die.
    {
        let now = world.now;
        let identity = world.node(1).identity.clone();
        let node = world.node(1);
        node.rel.generate_link_status_change(
            NodeId(2),
            LinkStatus::Dead,
            &mut node.net,
            &identity,
            now,
        );
        assert_eq!(node.net.cost(NodeId(1), NodeId(2)), Some(-1));
    }
    world.pump(80);

    // The signed change propagated to node 3 and applied exactly once.
    assert_eq!(world.node(3).net.cost(NodeId(1), NodeId(2)), Some(-1));
    // Unrelated edges untouched.
    assert_eq!(world.node(3).net.cost(NodeId(2), NodeId(3)), Some(10));
}

#[test]
fn route_change_restamps_in_flight_messages() {
    // Diamond: 1-2-4 is cheap, 1-3-4 expensive. A single-path message rides
    // through 2 until that link dies, then gets restamped onto 3's side.
    let mut world = World::new(
        &[1, 2, 3, 4],
        &[(1, 2, 10), (2, 4, 10), (1, 3, 50), (3, 4, 50)],
    );
    world.bring_links_up();
    world.pump(80);
    assert!(world.node(1).rel.can_flow_send(NodeId(4)));

    // Everyone reports their links alive so the cell baselines are sane.
    for id in [1u16, 2, 3, 4] {
        let now = world.now;
        let identity = world.node(id).identity.clone();
        let node = world.node(id);
        let ngbrs: Vec<NodeId> = node.net.neighbors_of(node.id).to_vec();
        for ngbr in ngbrs {
            node.rel
                .generate_link_status_change(ngbr, LinkStatus::Live, &mut node.net, &identity, now);
        }
    }
    world.pump(80);

    // Cut both directions of the cheap branch before injecting, so only the
    // restamped copy can arrive.
    world.drop_pct.insert((1, 2), 100);
    world.drop_pct.insert((2, 1), 100);

    let verifier = world.verifier.clone();
    let identity = world.node(1).identity.clone();
    let now = world.now;
    let node = world.node(1);
    node.rel
        .inject(b"reroute me", NodeId(4), 1, &mut node.net, &identity, &verifier, now)
        .expect("flow open");
    world.pump(20);
    assert_eq!(
        world.node(4).rel.delivered_from(NodeId(1)).0,
        0,
        "single path through the dead leg cannot deliver"
    );

    // The link layer reports 1-2 dead; restamping widens the mask.
    {
        let now = world.now;
        let node = world.node(1);
        node.rel.generate_link_status_change(
            NodeId(2),
            LinkStatus::Dead,
            &mut node.net,
            &identity,
            now,
        );
    }
    world.pump(150);

    assert_eq!(
        world.node(4).rel.delivered_from(NodeId(1)).0,
        1,
        "restamped message delivers via the surviving branch"
    );
}

#[test]
fn session_blocking_resumes_after_handshake() {
    let mut world = World::new(&[1, 2], &[(1, 2, 10)]);

    // Before any E2E exchange the flow is closed.
    assert!(!world.node(1).rel.can_flow_send(NodeId(2)));
    assert!(world.node(1).rel.block_session(77, NodeId(2)));

    world.bring_links_up();
    world.pump(50);

    let mut resumed = Vec::new();
    while let Some(event) = world.node(1).rel.poll_event() {
        let trellis_flood::RelEvent::ResumeSessions(dst) = event;
        resumed.extend(world.node(1).rel.resume_sessions(dst));
    }
    assert_eq!(resumed, vec![77], "blocked session resumes once the flow opens");
}
