//! Per-flow windows and the per-neighbor reliable-flood state.

use crate::time::WallTime;
use std::collections::{BTreeMap, VecDeque};
use trellis_proto::constants::MAX_MESS_PER_FLOW;
use trellis_proto::ids::{Epoch, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SlotStatus {
    #[default]
    Empty,
    NewUnsent,
    NewSent,
    RestampedUnsent,
    RestampedSent,
}

impl SlotStatus {
    pub fn is_sent(self) -> bool {
        matches!(self, SlotStatus::NewSent | SlotStatus::RestampedSent)
    }
}

/// The window of one (source, destination) flow: up to `MAX_MESS_PER_FLOW`
/// stored messages with per-neighbor sending state.
///
/// Invariants: `sow <= next_seq[n] <= head_seq`; a slot holds a message iff
/// any status is non-empty; stored messages carry a valid signature.
pub(crate) struct FlowBuffer {
    /// Stored message (overlay header through signature; no tail) per slot.
    pub msgs: Vec<Option<Vec<u8>>>,
    /// Per slot, per neighbor (1-based) sending status.
    pub status: Vec<Vec<SlotStatus>>,
    /// k-paths choice at injection time; 0 = flooding. Only meaningful at
    /// the source.
    pub num_paths: Vec<u16>,
    /// Lowest sequence not yet acknowledged on all paths.
    pub sow: u64,
    /// Next sequence to assign or receive.
    pub head_seq: u64,
    /// Next sequence to send toward each neighbor.
    pub next_seq: Vec<u64>,
    /// Highest source epoch seen on this flow.
    pub src_epoch: Epoch,
}

impl FlowBuffer {
    pub fn new(degree: usize) -> Self {
        let slots = MAX_MESS_PER_FLOW as usize;
        FlowBuffer {
            msgs: (0..slots).map(|_| None).collect(),
            status: (0..slots)
                .map(|_| vec![SlotStatus::Empty; degree + 1])
                .collect(),
            num_paths: vec![0; slots],
            sow: 1,
            head_seq: 1,
            next_seq: vec![1; degree + 1],
            src_epoch: Epoch(0),
        }
    }

    pub fn slot(seq: u64) -> usize {
        (seq % MAX_MESS_PER_FLOW) as usize
    }

    pub fn has_room(&self) -> bool {
        self.head_seq < self.sow + MAX_MESS_PER_FLOW
    }

    pub fn clear_slot(&mut self, seq: u64) {
        let idx = Self::slot(seq);
        self.msgs[idx] = None;
        for status in &mut self.status[idx] {
            *status = SlotStatus::Empty;
        }
        self.num_paths[idx] = 0;
    }

    /// Skip `next_seq[ngbr]` past everything already sent toward `ngbr`.
    pub fn advance_next_seq(&mut self, ngbr: usize) {
        while self.next_seq[ngbr] < self.head_seq
            && self.status[Self::slot(self.next_seq[ngbr])][ngbr].is_sent()
        {
            self.next_seq[ngbr] += 1;
        }
    }

    /// Release every slot through `upto` and pull the window cursors up.
    pub fn release_through(&mut self, upto: u64) -> bool {
        let mut progressed = false;
        while self.sow <= upto {
            self.clear_slot(self.sow);
            self.sow += 1;
            progressed = true;
        }
        if self.head_seq < self.sow {
            self.head_seq = self.sow;
        }
        for ngbr in 1..self.next_seq.len() {
            if self.next_seq[ngbr] < self.sow {
                self.next_seq[ngbr] = self.sow;
            }
            self.advance_next_seq(ngbr);
        }
        progressed
    }
}

/// Lazily allocated table of flow buffers, indexed `[source][destination]`.
pub(crate) struct FlowTable {
    degree: usize,
    flows: Vec<Vec<Option<Box<FlowBuffer>>>>,
}

impl FlowTable {
    pub fn new(node_count: u16, degree: usize) -> Self {
        let n = node_count as usize + 1;
        FlowTable {
            degree,
            flows: (0..n).map(|_| (0..n).map(|_| None).collect()).collect(),
        }
    }

    pub fn get(&self, src: NodeId, dst: NodeId) -> Option<&FlowBuffer> {
        self.flows[src.index()][dst.index()].as_deref()
    }

    pub fn get_mut(&mut self, src: NodeId, dst: NodeId) -> &mut FlowBuffer {
        let degree = self.degree;
        self.flows[src.index()][dst.index()]
            .get_or_insert_with(|| Box::new(FlowBuffer::new(degree)))
    }

    /// Iterate over every materialized flow toward `dst`.
    pub fn sources_toward(&self, dst: NodeId) -> Vec<NodeId> {
        (1..self.flows.len())
            .filter(|&s| self.flows[s][dst.index()].is_some())
            .map(|s| NodeId(s as u16))
            .collect()
    }

    /// Iterate over every materialized flow originated by `src`.
    pub fn destinations_from(&self, src: NodeId) -> Vec<NodeId> {
        (1..self.flows.len())
            .filter(|&d| self.flows[src.index()][d].is_some())
            .map(|d| NodeId(d as u16))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FlowQEntry {
    pub src: NodeId,
    pub dst: NodeId,
    pub penalty: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PacedStat {
    /// Pacing cursor: last send time, bumped by one interval when queued.
    pub timeout: WallTime,
    pub unsent: bool,
}

/// Per-neighbor reliable-flood state: the acknowledged-state matrices, the
/// flow fair queues, per-destination E2E and status-change pacing, and the
/// queue of hop-by-hop acks owed.
pub(crate) struct RelLinkData {
    /// Highest contiguous sequence the neighbor has per flow.
    pub flow_aru: Vec<Vec<u64>>,
    /// The neighbor's window start per flow.
    pub flow_sow: Vec<Vec<u64>>,
    pub norm: VecDeque<FlowQEntry>,
    pub urgent: VecDeque<FlowQEntry>,
    pub in_flow_queue: Vec<Vec<bool>>,
    pub e2e_stats: Vec<PacedStat>,
    /// Flows blocked until the E2E for their destination goes out first.
    pub e2e_flow_block: Vec<Vec<bool>>,
    pub sc_stats: Vec<PacedStat>,
    pub hbh_unsent: VecDeque<(NodeId, NodeId)>,
    pub unsent_state: Vec<Vec<bool>>,
    pub unsent_state_count: u32,
    pub saa_trigger: u32,
    pub e2e_ready: bool,
    pub e2e_queue: BTreeMap<(WallTime, u16), ()>,
    pub sc_ready: bool,
    pub sc_queue: BTreeMap<(WallTime, u16), ()>,
    pub saa_deadline: Option<WallTime>,
    pub total_pkts_sent: u64,
}

impl RelLinkData {
    pub fn new(node_count: u16, saa_threshold: u32) -> Self {
        let n = node_count as usize + 1;
        RelLinkData {
            flow_aru: vec![vec![0; n]; n],
            flow_sow: vec![vec![1; n]; n],
            norm: VecDeque::new(),
            urgent: VecDeque::new(),
            in_flow_queue: vec![vec![false; n]; n],
            e2e_stats: vec![PacedStat::default(); n],
            e2e_flow_block: vec![vec![false; n]; n],
            sc_stats: vec![PacedStat::default(); n],
            hbh_unsent: VecDeque::new(),
            unsent_state: vec![vec![false; n]; n],
            unsent_state_count: 0,
            saa_trigger: saa_threshold.saturating_sub(1),
            e2e_ready: false,
            e2e_queue: BTreeMap::new(),
            sc_ready: false,
            sc_queue: BTreeMap::new(),
            saa_deadline: None,
            total_pkts_sent: 0,
        }
    }

    /// Queue one flow's state for hop-by-hop acknowledgment, once.
    pub fn queue_unsent_state(&mut self, src: NodeId, dst: NodeId) {
        if !self.unsent_state[src.index()][dst.index()] {
            self.unsent_state[src.index()][dst.index()] = true;
            self.hbh_unsent.push_back((src, dst));
            self.unsent_state_count += 1;
        }
    }

    /// Queue a flow into the urgent fair queue, once.
    pub fn queue_flow_urgent(&mut self, src: NodeId, dst: NodeId) {
        if !self.in_flow_queue[src.index()][dst.index()] {
            self.in_flow_queue[src.index()][dst.index()] = true;
            self.urgent.push_back(FlowQEntry {
                src,
                dst,
                penalty: 1,
            });
        }
    }

    /// Queue a flow into the normal fair queue, once.
    pub fn queue_flow_norm(&mut self, src: NodeId, dst: NodeId) {
        if !self.in_flow_queue[src.index()][dst.index()] {
            self.in_flow_queue[src.index()][dst.index()] = true;
            self.norm.push_back(FlowQEntry {
                src,
                dst,
                penalty: 1,
            });
        }
    }
}
