mod common;

use common::World;
use proptest::prelude::*;
use trellis_proto::ids::{Epoch, NodeId};
use trellis_proto::wire::{
    E2eAck, OverlayHeader, RelFloodHeader, RelFloodTail, RelType, Routing,
};

fn e2e_message(e2e: &E2eAck, world: &mut World, signer: u16) -> bytes::Bytes {
    let mut payload = Vec::new();
    e2e.encode(&mut payload);
    let sig = world
        .node(signer)
        .identity
        .sign_parts(&[&b"RFE2"[..], &payload]);

    let mut m = Vec::new();
    OverlayHeader {
        src: NodeId(signer),
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
        src_epoch: Epoch(0),
        seq_num: 0,
        rtype: RelType::E2e,
    }
    .encode(&mut m);
    m.extend_from_slice(&sig);
    RelFloodTail { ack_len: 0 }.encode(&mut m);
    bytes::Bytes::from(m)
}

type CellTriple = (u32, u32, u64);

fn cell_key(cell: &trellis_proto::wire::E2eCell) -> (u32, u32, u64) {
    (cell.dest_epoch.0, cell.src_epoch.0, cell.aru)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever mix of fresh and stale E2Es arrives, the stored cells only
    /// ever move forward (lexicographically per cell).
    #[test]
    fn stored_e2e_cells_never_regress(
        updates in prop::collection::vec(any::<[CellTriple; 2]>(), 1..16)
    ) {
        let mut world = World::new(&[1, 2], &[(1, 2, 10)]);
        world.bring_links_up();

        for cells in updates {
            let mut e2e = E2eAck::new(NodeId(2), 2);
            for (i, &(de, se, aru)) in cells.iter().enumerate() {
                let cell = &mut e2e.cells[i + 1];
                cell.dest_epoch = Epoch(de % 4);
                cell.src_epoch = Epoch(se % 4);
                cell.aru = aru % 6;
            }
            let msg = e2e_message(&e2e, &mut world, 2);

            let before: Option<Vec<_>> = world
                .node(1)
                .rel
                .stored_e2e(NodeId(2))
                .map(|s| s.cells.iter().map(cell_key).collect());

            let verifier = world.verifier.clone();
            let now = world.now;
            let node = world.node(1);
            let identity = node.identity.clone();
            node.rel
                .disseminate(Some(NodeId(2)), msg, &mut node.net, &identity, &verifier, now);

            if let (Some(before), Some(after)) = (
                before,
                world.node(1).rel.stored_e2e(NodeId(2)),
            ) {
                for (b, a) in before.iter().zip(after.cells.iter().map(|c| cell_key(c))) {
                    prop_assert!(a >= *b, "cell regressed: {b:?} -> {a:?}");
                }
            }
        }
    }
}
