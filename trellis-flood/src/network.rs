//! The configured overlay topology with live edge costs, and the k-disjoint
//! path masks computed over it.
//!
//! Reference costs come from the configuration and are immutable; live costs
//! move with signed status changes but may never drop below the reference
//! (-1 marks a down link). Mask computations are cached per (destination,
//! path count) and the cache is cleared whenever any cost moves.

use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::debug;
use trellis_proto::ids::NodeId;
use trellis_proto::wire::PathMask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EdgeKey(NodeId, NodeId);

impl EdgeKey {
    fn new(a: NodeId, b: NodeId) -> Self {
        if a.0 <= b.0 {
            EdgeKey(a, b)
        } else {
            EdgeKey(b, a)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EdgeState {
    ref_cost: i16,
    cost: i16,
}

pub struct Network {
    my_id: NodeId,
    node_count: u16,
    neighbors: Vec<Vec<NodeId>>,
    edges: HashMap<EdgeKey, EdgeState>,
    mask_cache: HashMap<(NodeId, u16), PathMask>,
}

impl Network {
    /// Build from the configured edge list `(a, b, reference cost)`.
    pub fn new(node_count: u16, my_id: NodeId, edge_list: &[(NodeId, NodeId, i16)]) -> Self {
        let mut neighbors = vec![Vec::new(); node_count as usize + 1];
        let mut edges = HashMap::new();
        for &(a, b, cost) in edge_list {
            edges.insert(
                EdgeKey::new(a, b),
                EdgeState {
                    ref_cost: cost,
                    cost,
                },
            );
            neighbors[a.index()].push(b);
            neighbors[b.index()].push(a);
        }
        for list in &mut neighbors {
            list.sort_unstable();
            list.dedup();
        }
        Network {
            my_id,
            node_count,
            neighbors,
            edges,
            mask_cache: HashMap::new(),
        }
    }

    pub fn my_id(&self) -> NodeId {
        self.my_id
    }

    pub fn node_count(&self) -> u16 {
        self.node_count
    }

    pub fn neighbors_of(&self, node: NodeId) -> &[NodeId] {
        &self.neighbors[node.index()]
    }

    pub fn degree(&self, node: NodeId) -> usize {
        self.neighbors[node.index()].len()
    }

    pub fn my_degree(&self) -> usize {
        self.degree(self.my_id)
    }

    /// 1-based position of `ngbr` among our neighbors, the index every
    /// per-neighbor engine array is keyed by.
    pub fn neighbor_index(&self, ngbr: NodeId) -> Option<usize> {
        self.neighbors[self.my_id.index()]
            .iter()
            .position(|&n| n == ngbr)
            .map(|p| p + 1)
    }

    pub fn my_neighbor(&self, index: usize) -> NodeId {
        self.neighbors[self.my_id.index()][index - 1]
    }

    pub fn are_neighbors(&self, a: NodeId, b: NodeId) -> bool {
        self.neighbors[a.index()].contains(&b)
    }

    pub fn ref_cost(&self, a: NodeId, b: NodeId) -> Option<i16> {
        self.edges.get(&EdgeKey::new(a, b)).map(|e| e.ref_cost)
    }

    pub fn cost(&self, a: NodeId, b: NodeId) -> Option<i16> {
        self.edges.get(&EdgeKey::new(a, b)).map(|e| e.cost)
    }

    /// Apply a validated cost to an edge. Returns true when the cost
    /// actually changed (and the mask cache was invalidated). A cost below
    /// the reference (other than -1, link down) is rejected.
    pub fn apply_cost(&mut self, a: NodeId, b: NodeId, cost: i16) -> bool {
        let Some(edge) = self.edges.get_mut(&EdgeKey::new(a, b)) else {
            debug!(%a, %b, "cost change for unknown edge");
            return false;
        };
        if cost != -1 && cost < edge.ref_cost {
            debug!(cost, ref_cost = edge.ref_cost, "cost below reference, rejected");
            return false;
        }
        if edge.cost == cost {
            return false;
        }
        edge.cost = cost;
        self.mask_cache.clear();
        true
    }

    /// The k-path mask from us to `dst`: every node on the `num_paths`
    /// cheapest node-disjoint paths. `num_paths == 0` selects flooding (all
    /// nodes set).
    pub fn stamp_mask(&mut self, dst: NodeId, num_paths: u16) -> Option<PathMask> {
        if !dst.is_valid(self.node_count) {
            return None;
        }
        if num_paths == 0 {
            return Some(PathMask::full(self.node_count));
        }
        if let Some(mask) = self.mask_cache.get(&(dst, num_paths)) {
            return Some(mask.clone());
        }

        let mut mask = PathMask::empty(self.node_count);
        mask.set(self.my_id);
        mask.set(dst);
        let mut banned: HashSet<NodeId> = HashSet::new();
        let mut found_any = false;

        for _ in 0..num_paths {
            let Some(path) = self.shortest_path(dst, &banned) else {
                break;
            };
            found_any = true;
            for &node in &path {
                mask.set(node);
                if node != self.my_id && node != dst {
                    banned.insert(node);
                }
            }
        }

        if !found_any {
            return None;
        }
        self.mask_cache.insert((dst, num_paths), mask.clone());
        Some(mask)
    }

    /// Dijkstra from us to `dst` over live edges, avoiding banned
    /// intermediate nodes. Returns the node path including both endpoints.
    fn shortest_path(&self, dst: NodeId, banned: &HashSet<NodeId>) -> Option<Vec<NodeId>> {
        let n = self.node_count as usize + 1;
        let mut dist = vec![u64::MAX; n];
        let mut prev: Vec<Option<NodeId>> = vec![None; n];
        let mut heap = BinaryHeap::new();

        dist[self.my_id.index()] = 0;
        heap.push(std::cmp::Reverse((0u64, self.my_id.0)));

        while let Some(std::cmp::Reverse((d, node))) = heap.pop() {
            let node = NodeId(node);
            if d > dist[node.index()] {
                continue;
            }
            if node == dst {
                break;
            }
            for &next in self.neighbors_of(node) {
                if next != dst && banned.contains(&next) {
                    continue;
                }
                let Some(cost) = self.cost(node, next) else {
                    continue;
                };
                if cost < 0 {
                    continue;
                }
                let nd = d + cost as u64;
                if nd < dist[next.index()] {
                    dist[next.index()] = nd;
                    prev[next.index()] = Some(node);
                    heap.push(std::cmp::Reverse((nd, next.0)));
                }
            }
        }

        if dist[dst.index()] == u64::MAX {
            return None;
        }
        let mut path = vec![dst];
        let mut cur = dst;
        while let Some(p) = prev[cur.index()] {
            path.push(p);
            cur = p;
        }
        path.reverse();
        Some(path)
    }

    /// Deterministic byte encoding of the configured topology, folded into
    /// the configuration hash.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut keys: Vec<(&EdgeKey, &EdgeState)> = self.edges.iter().collect();
        keys.sort_by_key(|(k, _)| (k.0 .0, k.1 .0));
        let mut out = Vec::with_capacity(2 + keys.len() * 6);
        out.extend_from_slice(&self.node_count.to_be_bytes());
        for (key, state) in keys {
            out.extend_from_slice(&key.0 .0.to_be_bytes());
            out.extend_from_slice(&key.1 .0.to_be_bytes());
            out.extend_from_slice(&state.ref_cost.to_be_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Network {
        Network::new(
            3,
            NodeId(1),
            &[
                (NodeId(1), NodeId(2), 10),
                (NodeId(2), NodeId(3), 10),
                (NodeId(1), NodeId(3), 25),
            ],
        )
    }

    #[test]
    fn two_disjoint_paths_cover_the_triangle() {
        let mut net = triangle();
        let mask = net.stamp_mask(NodeId(3), 2).expect("paths exist");
        assert!(mask.contains(NodeId(1)));
        assert!(mask.contains(NodeId(2)));
        assert!(mask.contains(NodeId(3)));
    }

    #[test]
    fn one_path_takes_the_cheap_route() {
        let mut net = triangle();
        let mask = net.stamp_mask(NodeId(3), 1).expect("path exists");
        assert!(mask.contains(NodeId(2)), "cheapest route goes through 2");
    }

    #[test]
    fn down_edge_reroutes_and_invalidates_cache() {
        let mut net = triangle();
        let before = net.stamp_mask(NodeId(3), 1).unwrap();
        assert!(before.contains(NodeId(2)));

        assert!(net.apply_cost(NodeId(1), NodeId(2), -1));
        let after = net.stamp_mask(NodeId(3), 1).unwrap();
        assert!(
            !after.contains(NodeId(2)),
            "direct 1-3 edge is the only live route"
        );
    }

    #[test]
    fn cost_below_reference_is_rejected() {
        let mut net = triangle();
        assert!(!net.apply_cost(NodeId(1), NodeId(2), 5));
        assert_eq!(net.cost(NodeId(1), NodeId(2)), Some(10));
    }

    #[test]
    fn neighbor_indexing_is_one_based_and_sorted() {
        let net = triangle();
        assert_eq!(net.my_degree(), 2);
        assert_eq!(net.neighbor_index(NodeId(2)), Some(1));
        assert_eq!(net.neighbor_index(NodeId(3)), Some(2));
        assert_eq!(net.my_neighbor(2), NodeId(3));
    }
}
