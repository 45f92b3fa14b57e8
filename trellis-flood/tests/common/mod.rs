//! A tiny in-memory overlay: one network view, identity and engine pair per
//! node, with a message pump that moves engine output across configurable
//! legs (including lossy ones).
#![allow(dead_code)]

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use trellis_flood::{Network, PriorityFlood, ReliableFlood, WallTime};
use trellis_link::SendStatus;
use trellis_proto::config::{PrioConfig, RelConfig};
use trellis_proto::crypto::{NodeIdentity, NodeVerifier};
use trellis_proto::ids::NodeId;

pub const START: WallTime = WallTime(1_700_000_000_000_000);

pub struct TestNode {
    pub id: NodeId,
    pub net: Network,
    pub identity: Arc<NodeIdentity>,
    pub prio: PriorityFlood,
    pub rel: ReliableFlood,
}

pub struct World {
    pub nodes: HashMap<u16, TestNode>,
    pub verifier: Arc<NodeVerifier>,
    /// Fraction (out of 100) of messages dropped per directed leg.
    pub drop_pct: HashMap<(u16, u16), u32>,
    pub drop_counter: u32,
    pub now: WallTime,
}

impl World {
    pub fn new(node_ids: &[u16], edges: &[(u16, u16, i16)]) -> Self {
        let node_count = *node_ids.iter().max().expect("some nodes");
        let edge_list: Vec<(NodeId, NodeId, i16)> = edges
            .iter()
            .map(|&(a, b, c)| (NodeId(a), NodeId(b), c))
            .collect();

        let mut verifier = NodeVerifier::new(node_count);
        let identities: HashMap<u16, Arc<NodeIdentity>> = node_ids
            .iter()
            .map(|&id| {
                let identity = NodeIdentity::from_seed(NodeId(id), &[id as u8; 32]);
                verifier.insert(NodeId(id), identity.verifying_key());
                (id, Arc::new(identity))
            })
            .collect();
        let verifier = Arc::new(verifier);

        let nodes = node_ids
            .iter()
            .map(|&id| {
                let net = Network::new(node_count, NodeId(id), &edge_list);
                let prio = PriorityFlood::new(PrioConfig::default(), &net, START);
                let rel = ReliableFlood::new(RelConfig::default(), &net, 10_000, START);
                (
                    id,
                    TestNode {
                        id: NodeId(id),
                        identity: identities[&id].clone(),
                        prio,
                        rel,
                        net,
                    },
                )
            })
            .collect();

        World {
            nodes,
            verifier,
            drop_pct: HashMap::new(),
            drop_counter: 0,
            now: START,
        }
    }

    /// Every node treats each link as freshly established.
    pub fn bring_links_up(&mut self) {
        let ids: Vec<u16> = self.nodes.keys().copied().collect();
        for id in ids {
            let node = self.nodes.get_mut(&id).expect("node exists");
            for idx in 1..=node.net.my_degree() {
                node.rel.neighbor_transfer(idx, &node.net);
            }
        }
    }

    fn should_drop(&mut self, from: u16, to: u16) -> bool {
        let pct = self.drop_pct.get(&(from, to)).copied().unwrap_or(0);
        if pct == 0 {
            return false;
        }
        // Deterministic striping rather than randomness.
        self.drop_counter = self.drop_counter.wrapping_add(37);
        (self.drop_counter % 100) < pct
    }

    /// Service every engine until the overlay goes quiet or `max_rounds`
    /// passes, advancing time a little each round.
    pub fn pump(&mut self, max_rounds: usize) {
        for _ in 0..max_rounds {
            let mut moved = false;
            let ids: Vec<u16> = self.nodes.keys().copied().collect();

            for &id in &ids {
                // (from, to, message, reliable?)
                let mut outbox: Vec<(u16, u16, Bytes, bool)> = Vec::new();
                {
                    let node = self.nodes.get_mut(&id).expect("node exists");
                    node.rel.poll(self.now);

                    for idx in 1..=node.net.my_degree() {
                        let peer = node.net.my_neighbor(idx).0;

                        for _ in 0..64 {
                            if !node.rel.has_pending(idx) {
                                break;
                            }
                            let mut sent: Vec<Bytes> = Vec::new();
                            let n = {
                                let TestNode { rel, net, identity, .. } = node;
                                rel.send_one(idx, net, identity, self.now, &mut |m| {
                                    sent.push(m);
                                    SendStatus::Ok
                                })
                            };
                            for m in sent {
                                outbox.push((id, peer, m, true));
                            }
                            if n == 0 {
                                break;
                            }
                        }

                        for _ in 0..64 {
                            if !node.prio.has_pending(idx) {
                                break;
                            }
                            let mut sent: Vec<Bytes> = Vec::new();
                            let n = node.prio.send_one(idx, self.now, &mut |m| {
                                sent.push(m);
                                SendStatus::Ok
                            });
                            for m in sent {
                                outbox.push((id, peer, m, false));
                            }
                            if n == 0 {
                                break;
                            }
                        }
                    }
                }

                for (from, to, msg, reliable) in outbox {
                    moved = true;
                    if self.should_drop(from, to) {
                        continue;
                    }
                    let verifier = self.verifier.clone();
                    let target = self.nodes.get_mut(&to).expect("target exists");
                    let TestNode { rel, prio, net, identity, .. } = target;
                    if reliable {
                        rel.disseminate(
                            Some(NodeId(from)),
                            msg,
                            net,
                            identity,
                            &verifier,
                            self.now,
                        );
                    } else {
                        prio.disseminate(Some(NodeId(from)), msg, net, &verifier, self.now);
                    }
                }
            }

            self.now = self.now.saturating_add(std::time::Duration::from_millis(40));
            if !moved {
                // One extra idle round lets paced timeouts fire.
                let all_quiet = ids.iter().all(|&id| {
                    let node = &self.nodes[&id];
                    (1..=node.net.my_degree()).all(|i| !node.rel.has_pending(i))
                });
                if all_quiet {
                    break;
                }
            }
        }
    }

    pub fn node(&mut self, id: u16) -> &mut TestNode {
        self.nodes.get_mut(&id).expect("node exists")
    }
}
