//! Reliable flooding: per-(source, destination) flows with hop-by-hop ack
//! piggybacking, signed end-to-end acks, source-incarnation recovery,
//! restamping under route changes, and signed link-status propagation.
//!
//! A flow's handshake bootstraps through E2E propagation: every daemon's own
//! E2E carries, per peer, the epoch it will use as a source toward that
//! peer. A destination accepting a new source epoch echoes it back in its
//! E2E; only once the source sees its current epoch reflected (with a zero
//! ARU) may the session layer send on that flow.

mod flow;
mod send;

use crate::network::Network;
use crate::time::WallTime;
use crate::DisseminateStatus;
use bytes::Bytes;
use flow::{FlowTable, RelLinkData, SlotStatus};
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use trellis_proto::config::RelConfig;
use trellis_proto::constants::MAX_MESS_PER_FLOW;
use trellis_proto::crypto::{NodeIdentity, NodeVerifier, SIGNATURE_LEN};
use trellis_proto::ids::{Epoch, NodeId};
use trellis_proto::wire::{
    E2eAck, HbhAck, OverlayHeader, PathMask, RelFloodHeader, RelFloodTail, RelType, StatusChange,
};

pub(crate) const DATA_DOMAIN: &[u8; 4] = b"RFLD";
pub(crate) const E2E_DOMAIN: &[u8; 4] = b"RFE2";
pub(crate) const SC_DOMAIN: &[u8; 4] = b"RFSC";

/// Events the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelEvent {
    /// Blocked sessions toward this destination may resume.
    ResumeSessions(NodeId),
}

pub struct ReliableFlood {
    pub(crate) cfg: RelConfig,
    pub(crate) my_id: NodeId,
    pub(crate) node_count: u16,
    pub(crate) degree: usize,
    pub(crate) loss_penalty: u32,

    /// Next sequence to assign per destination (as a source).
    pub(crate) flow_seq_no: Vec<u64>,
    /// Epoch used when sending to each destination.
    pub(crate) flow_source_epoch: Vec<Epoch>,
    pub(crate) handshake_complete: Vec<bool>,
    pub(crate) flows: FlowTable,

    /// Latest accepted E2E per destination (`dest == 0` marks none), with
    /// its signature.
    pub(crate) e2e: Vec<E2eAck>,
    pub(crate) e2e_sig: Vec<[u8; SIGNATURE_LEN]>,
    pub(crate) status_change: Vec<StatusChange>,
    pub(crate) sc_sig: Vec<[u8; SIGNATURE_LEN]>,

    pub(crate) edge: Vec<RelLinkData>,

    pub(crate) initial_e2e: bool,
    pub(crate) e2e_stop: bool,
    pub(crate) local_sc_progress: bool,
    pub(crate) gen_e2e_deadline: Option<WallTime>,
    pub(crate) gen_sc_deadline: Option<WallTime>,

    pub(crate) blocked_sessions: Vec<VecDeque<u32>>,
    pub(crate) deliveries: VecDeque<Bytes>,
    pub(crate) events: VecDeque<RelEvent>,

    /// Bytes and count delivered per source, for operators.
    pub(crate) recv_bytes: Vec<u64>,
    pub(crate) recv_count: Vec<u64>,
}

impl ReliableFlood {
    pub fn new(cfg: RelConfig, net: &Network, loss_penalty: u32, now: WallTime) -> Self {
        let node_count = net.node_count();
        let my_id = net.my_id();
        let degree = net.my_degree();
        let n = node_count as usize + 1;
        let epoch = Epoch(now.sec());

        let mut engine = ReliableFlood {
            my_id,
            node_count,
            degree,
            loss_penalty,
            flow_seq_no: vec![1; n],
            flow_source_epoch: vec![epoch; n],
            handshake_complete: vec![false; n],
            flows: FlowTable::new(node_count, degree),
            e2e: (0..n).map(|_| E2eAck::new(NodeId(0), node_count)).collect(),
            e2e_sig: vec![[0; SIGNATURE_LEN]; n],
            status_change: (0..n)
                .map(|i| StatusChange::new(NodeId(i as u16), node_count))
                .collect(),
            sc_sig: vec![[0; SIGNATURE_LEN]; n],
            edge: (0..=degree)
                .map(|_| RelLinkData::new(node_count, cfg.saa_threshold))
                .collect(),
            initial_e2e: true,
            e2e_stop: false,
            local_sc_progress: false,
            gen_e2e_deadline: None,
            gen_sc_deadline: None,
            blocked_sessions: vec![VecDeque::new(); n],
            deliveries: VecDeque::new(),
            events: VecDeque::new(),
            recv_bytes: vec![0; n],
            recv_count: vec![0; n],
            cfg,
        };

        // This daemon completes the handshake with itself, and its own E2E
        // advertises the epoch it will use toward every peer.
        engine.handshake_complete[my_id.index()] = true;
        engine.flows.get_mut(my_id, my_id).src_epoch = epoch;
        engine.e2e[my_id.index()].dest = my_id;
        for cell in engine.e2e[my_id.index()].cells.iter_mut().skip(1) {
            cell.dest_epoch = epoch;
        }

        // Our own links count as down until they prove themselves.
        for &ngbr in net.neighbors_of(my_id) {
            engine.status_change[my_id.index()].cells[ngbr.index()].cost = -1;
        }

        engine
    }

    pub fn poll_delivery(&mut self) -> Option<Bytes> {
        self.deliveries.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<RelEvent> {
        self.events.pop_front()
    }

    pub fn delivered_from(&self, src: NodeId) -> (u64, u64) {
        (self.recv_count[src.index()], self.recv_bytes[src.index()])
    }

    /// Latest accepted E2E for a destination, if any.
    pub fn stored_e2e(&self, dst: NodeId) -> Option<&E2eAck> {
        let e2e = &self.e2e[dst.index()];
        (e2e.dest == dst).then_some(e2e)
    }

    // ------------------------------------------------------------------
    // Session interface
    // ------------------------------------------------------------------

    /// Can the session layer hand us a message for `dst` right now? True
    /// when the flow window has room and the epoch handshake is complete.
    pub fn can_flow_send(&self, dst: NodeId) -> bool {
        if !dst.is_valid(self.node_count) {
            return false;
        }
        if !self.handshake_complete[dst.index()] {
            return false;
        }
        match self.flows.get(self.my_id, dst) {
            Some(fb) => fb.has_room() && self.flow_source_epoch[dst.index()] == fb.src_epoch,
            None => false,
        }
    }

    /// Register a blocked session for resumption once `dst`'s flow opens.
    pub fn block_session(&mut self, session: u32, dst: NodeId) -> bool {
        if !dst.is_valid(self.node_count) || self.can_flow_send(dst) {
            return false;
        }
        self.blocked_sessions[dst.index()].push_back(session);
        true
    }

    /// Drain sessions that may resume toward `dst`, in blocking order.
    pub fn resume_sessions(&mut self, dst: NodeId) -> Vec<u32> {
        let mut resumed = Vec::new();
        while !self.blocked_sessions[dst.index()].is_empty() && self.can_flow_send(dst) {
            resumed.push(self.blocked_sessions[dst.index()].pop_front().expect("nonempty"));
        }
        resumed
    }

    /// Anything to offer this neighbor when the link has room?
    pub fn has_pending(&self, ngbr_index: usize) -> bool {
        let ed = &self.edge[ngbr_index];
        ed.sc_ready
            || ed.e2e_ready
            || !ed.urgent.is_empty()
            || !ed.norm.is_empty()
            || (ed.unsent_state_count > 0 && ed.saa_deadline.is_none() && ed.saa_trigger > 0)
    }

    // ------------------------------------------------------------------
    // Dissemination entry
    // ------------------------------------------------------------------

    /// Process one reliable-flood message arriving from a neighbor link.
    pub fn disseminate(
        &mut self,
        last_hop: Option<NodeId>,
        msg: Bytes,
        net: &mut Network,
        identity: &NodeIdentity,
        verifier: &NodeVerifier,
        now: WallTime,
    ) -> DisseminateStatus {
        let last_hop_index = match last_hop {
            None => 0,
            Some(node) => match net.neighbor_index(node) {
                Some(idx) => idx,
                None => {
                    debug!(%node, "reliable-flood message from a non-neighbor");
                    return DisseminateStatus::NoRoute;
                }
            },
        };

        let Some(parsed) = parse_message(&msg, self.node_count) else {
            warn!("malformed reliable-flood message");
            return DisseminateStatus::NoRoute;
        };

        let old_counts: Vec<u32> = (0..=self.degree)
            .map(|i| self.edge[i].unsent_state_count)
            .collect();
        let mut state_change = false;
        let mut ret = DisseminateStatus::Ok;

        match parsed.rel_hdr.rtype {
            RelType::E2e => {
                let Ok(e2e) = E2eAck::decode(&mut &parsed.payload[..], self.node_count) else {
                    return DisseminateStatus::NoRoute;
                };
                if self.cfg.crypto
                    && verifier
                        .verify_parts(e2e.dest, &[E2E_DOMAIN, parsed.payload], parsed.signature)
                        .is_err()
                {
                    warn!(dest = %e2e.dest, "E2E signature failed");
                    return DisseminateStatus::NoRoute;
                }
                self.process_acks(last_hop_index, &parsed.acks, net, &mut state_change, now);
                let sig: [u8; SIGNATURE_LEN] =
                    parsed.signature.try_into().expect("fixed signature length");
                self.process_e2e(last_hop_index, e2e, sig, net, now);
                ret = DisseminateStatus::NoRoute;
            }
            RelType::Data => {
                if self.cfg.crypto {
                    let prefix = signed_prefix(parsed.base);
                    if verifier
                        .verify_parts(
                            parsed.rel_hdr.src,
                            &[DATA_DOMAIN, &prefix],
                            parsed.signature,
                        )
                        .is_err()
                    {
                        warn!(src = %parsed.rel_hdr.src, "data signature failed");
                        return DisseminateStatus::NoRoute;
                    }
                }
                self.process_acks(last_hop_index, &parsed.acks, net, &mut state_change, now);
                if !parsed.rel_hdr.src.is_valid(self.node_count)
                    || !parsed.rel_hdr.dst.is_valid(self.node_count)
                {
                    return DisseminateStatus::NoRoute;
                }
                ret = self.process_data(
                    last_hop_index,
                    &parsed,
                    None,
                    net,
                    &mut state_change,
                    now,
                );
            }
            RelType::Saa => {
                self.process_acks(last_hop_index, &parsed.acks, net, &mut state_change, now);
                ret = DisseminateStatus::NoRoute;
            }
            RelType::StatusChange => {
                let Ok(sc) = StatusChange::decode(&mut &parsed.payload[..], self.node_count)
                else {
                    return DisseminateStatus::NoRoute;
                };
                if self.cfg.crypto
                    && verifier
                        .verify_parts(sc.creator, &[SC_DOMAIN, parsed.payload], parsed.signature)
                        .is_err()
                {
                    warn!(creator = %sc.creator, "status-change signature failed");
                    return DisseminateStatus::NoRoute;
                }
                self.process_acks(last_hop_index, &parsed.acks, net, &mut state_change, now);
                let sig: [u8; SIGNATURE_LEN] =
                    parsed.signature.try_into().expect("fixed signature length");
                self.process_status_change(last_hop_index, sc, sig, net, identity, now);
                ret = DisseminateStatus::NoRoute;
            }
        }

        // Progress since the last standalone ack toward each neighbor?
        for i in 1..=self.degree {
            let ed = &mut self.edge[i];
            if state_change {
                ed.saa_trigger += 1;
            }
            if ed.unsent_state_count == old_counts[i]
                && ed.saa_trigger >= self.cfg.saa_threshold
                && ed.saa_deadline.is_none()
            {
                ed.saa_deadline = Some(now);
            }
        }

        ret
    }

    // ------------------------------------------------------------------
    // Hop-by-hop acks
    // ------------------------------------------------------------------

    fn process_acks(
        &mut self,
        last_hop_index: usize,
        acks: &[HbhAck],
        net: &Network,
        state_change: &mut bool,
        _now: WallTime,
    ) {
        if last_hop_index == 0 {
            return;
        }
        for ack in acks {
            if !ack.src.is_valid(self.node_count) || !ack.dst.is_valid(self.node_count) {
                warn!("HBH ack with invalid flow endpoints");
                return;
            }
            let (s, d) = (ack.src, ack.dst);
            let fb = self.flows.get_mut(s, d);
            if fb.src_epoch != ack.src_epoch {
                continue;
            }

            let ed = &mut self.edge[last_hop_index];
            if ed.flow_sow[s.index()][d.index()] < ack.sow {
                ed.flow_sow[s.index()][d.index()] = ack.sow;
            }

            if ed.flow_aru[s.index()][d.index()] < ack.aru {
                // Keep the sentinel one below the wrap point.
                let aru = if ack.aru == u64::MAX {
                    u64::MAX - 1
                } else {
                    ack.aru
                };
                ed.flow_aru[s.index()][d.index()] = aru;

                // Skip transmissions the neighbor provably has.
                if self.cfg.hbh_opt && fb.next_seq[last_hop_index] <= aru {
                    loop {
                        let next = fb.next_seq[last_hop_index];
                        if next >= fb.head_seq {
                            break;
                        }
                        let idx = FlowTable::slot_of(next);
                        let status = fb.status[idx][last_hop_index];
                        if status.is_sent() {
                            fb.next_seq[last_hop_index] += 1;
                        } else if status == SlotStatus::NewUnsent && next <= aru {
                            fb.status[idx][last_hop_index] = SlotStatus::NewSent;
                            fb.next_seq[last_hop_index] += 1;
                        } else {
                            break;
                        }
                    }
                }

                if self.cfg.hbh_advance {
                    let mut min = fb.head_seq - 1;
                    for j in 1..=self.degree {
                        let aru_j = self.edge[j].flow_aru[s.index()][d.index()];
                        if aru_j < min {
                            min = aru_j;
                        }
                        if !self.cfg.hbh_opt && fb.next_seq[j].saturating_sub(1) < min {
                            min = fb.next_seq[j] - 1;
                        }
                    }
                    let progressed = fb.sow <= min;
                    if progressed {
                        *state_change = true;
                        fb.release_through(min);
                        if s == self.my_id && !self.blocked_sessions[d.index()].is_empty() {
                            self.events.push_back(RelEvent::ResumeSessions(d));
                        }
                        for j in 1..=self.degree {
                            self.edge[j].queue_unsent_state(s, d);
                        }
                    }
                }
            }

            // If the flow toward this neighbor became unblocked, requeue it.
            let fb = self.flows.get_mut(s, d);
            let next = fb.next_seq[last_hop_index];
            let ed = &self.edge[last_hop_index];
            if !ed.in_flow_queue[s.index()][d.index()]
                && next < ed.flow_sow[s.index()][d.index()] + MAX_MESS_PER_FLOW
                && next < fb.head_seq
            {
                let idx = FlowTable::slot_of(next);
                let on_path = fb.msgs[idx]
                    .as_deref()
                    .map(|m| stored_mask_contains(m, self.node_count, net.my_neighbor(last_hop_index)))
                    .unwrap_or(false);
                if on_path {
                    self.edge[last_hop_index].queue_flow_norm(s, d);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------

    pub(crate) fn process_data(
        &mut self,
        last_hop_index: usize,
        parsed: &ParsedRel<'_>,
        num_paths: Option<u16>,
        net: &Network,
        state_change: &mut bool,
        now: WallTime,
    ) -> DisseminateStatus {
        let r_hdr = parsed.rel_hdr;
        let (src, dst) = (r_hdr.src, r_hdr.dst);
        let mask = parsed.mask.as_ref().expect("data carries a mask");
        if !self.cfg.e2e_opt {
            // Without periodic end-to-end acks, only the handshake E2Es flow.
            self.e2e_stop = true;
        }
        let fb = self.flows.get_mut(src, dst);

        if r_hdr.src_epoch > fb.src_epoch {
            if last_hop_index == 0 {
                warn!("message injected before the flow handshake completed");
            } else {
                debug!(
                    theirs = r_hdr.src_epoch.0,
                    stored = fb.src_epoch.0,
                    "source epoch ahead of stored"
                );
            }
            return DisseminateStatus::NoRoute;
        }
        if r_hdr.src_epoch < fb.src_epoch || r_hdr.src_epoch.0 == 0 {
            debug!(%src, %dst, "stale or zero source epoch");
            return DisseminateStatus::NoRoute;
        }

        if r_hdr.seq_num < fb.sow || r_hdr.seq_num > fb.head_seq {
            return DisseminateStatus::NoRoute;
        }

        let restamped = r_hdr.seq_num != fb.head_seq;
        if restamped {
            let idx = FlowTable::slot_of(r_hdr.seq_num);
            let Some(stored) = fb.msgs[idx].as_deref() else {
                warn!("restamp for a sequence we never stored");
                return DisseminateStatus::NoRoute;
            };
            let stored_mask = stored_mask_of(stored, self.node_count);
            if *mask == stored_mask {
                // Exact duplicate: the neighbor clearly has it.
                if self.cfg.hbh_opt {
                    match fb.status[idx][last_hop_index] {
                        SlotStatus::NewUnsent => {
                            fb.status[idx][last_hop_index] = SlotStatus::NewSent
                        }
                        SlotStatus::RestampedUnsent => {
                            fb.status[idx][last_hop_index] = SlotStatus::RestampedSent
                        }
                        _ => {}
                    }
                }
                fb.advance_next_seq(last_hop_index);
                return DisseminateStatus::NoRoute;
            }
            if !mask.is_superset(&stored_mask) {
                warn!(
                    seq = r_hdr.seq_num,
                    "restamped mask is not a superset of the stored one"
                );
                return DisseminateStatus::NoRoute;
            }
        }

        if r_hdr.seq_num >= fb.sow + MAX_MESS_PER_FLOW {
            debug!(%src, %dst, "flow window full, backpressure in effect");
            return DisseminateStatus::NoRoute;
        }

        if !restamped {
            fb.head_seq += 1;
            *state_change = true;
        }

        if dst == self.my_id {
            if !restamped {
                fb.sow += 1;
                for i in 1..=self.degree {
                    fb.next_seq[i] = fb.head_seq;
                }
                if self.gen_e2e_deadline.is_none() {
                    self.gen_e2e_deadline = Some(now.saturating_add(self.cfg.e2e_ack_timeout));
                }
                self.recv_bytes[src.index()] += parsed.overlay.len as u64;
                self.recv_count[src.index()] += 1;
                self.deliveries.push_back(Bytes::copy_from_slice(parsed.base));
            }
        } else {
            let idx = FlowTable::slot_of(r_hdr.seq_num);
            fb.msgs[idx] = Some(parsed.base.to_vec());
            for ngbr in 1..=self.degree {
                let ngbr_node = net.my_neighbor(ngbr);
                let came_this_way = ngbr == last_hop_index || ngbr_node == src;
                fb.status[idx][ngbr] = match (restamped, self.cfg.hbh_opt && came_this_way) {
                    (false, true) => SlotStatus::NewSent,
                    (false, false) => SlotStatus::NewUnsent,
                    (true, true) => SlotStatus::RestampedSent,
                    (true, false) => SlotStatus::RestampedUnsent,
                };
                fb.advance_next_seq(ngbr);
            }
            if last_hop_index == 0 && !restamped {
                fb.num_paths[idx] = num_paths.unwrap_or(0);
            }

            if self.cfg.hbh_advance && !restamped {
                let mut min = fb.head_seq - 1;
                for j in 1..=self.degree {
                    let aru_j = self.edge[j].flow_aru[src.index()][dst.index()];
                    if aru_j < min {
                        min = aru_j;
                    }
                    if !self.cfg.hbh_opt && fb.next_seq[j].saturating_sub(1) < min {
                        min = fb.next_seq[j] - 1;
                    }
                }
                fb.release_through(min);
            } else if restamped {
                for ngbr in 1..=self.degree {
                    if fb.next_seq[ngbr] > r_hdr.seq_num {
                        fb.next_seq[ngbr] = r_hdr.seq_num;
                    }
                    fb.advance_next_seq(ngbr);
                }
            }
        }

        // Update neighbor views and queue further hops.
        let fb = self.flows.get_mut(src, dst);
        for i in 1..=self.degree {
            let ngbr_node = net.my_neighbor(i);
            let from_this_side = i == last_hop_index || ngbr_node == src;

            if !(self.cfg.hbh_advance && !self.cfg.hbh_opt) && from_this_side {
                let ed = &mut self.edge[i];
                if ed.flow_aru[src.index()][dst.index()] < r_hdr.seq_num {
                    ed.flow_aru[src.index()][dst.index()] = r_hdr.seq_num;
                }
            } else if !self.edge[i].in_flow_queue[src.index()][dst.index()]
                && fb.next_seq[i] == r_hdr.seq_num
                && mask.contains(ngbr_node)
            {
                self.edge[i].queue_flow_urgent(src, dst);
            }

            if *state_change {
                self.edge[i].queue_unsent_state(src, dst);
            }
        }

        DisseminateStatus::Ok
    }

    // ------------------------------------------------------------------
    // End-to-end acks
    // ------------------------------------------------------------------

    fn process_e2e(
        &mut self,
        last_hop_index: usize,
        e2e_new: E2eAck,
        sig: [u8; SIGNATURE_LEN],
        net: &Network,
        now: WallTime,
    ) {
        let d = e2e_new.dest;
        if !d.is_valid(self.node_count) {
            return;
        }
        let my = self.my_id.index();

        // Accept only when every cell is >= the stored one.
        let e2e_old = &self.e2e[d.index()];
        let mut store = false;
        for i in 1..=self.node_count as usize {
            let new = e2e_new.cells[i];
            let old = e2e_old.cells[i];
            let new_key = (new.dest_epoch.0, new.src_epoch.0, new.aru);
            let old_key = (old.dest_epoch.0, old.src_epoch.0, old.aru);
            if new_key < old_key {
                debug!(dest = %d, cell = i, "non-monotone E2E rejected");
                return;
            }
            if new_key > old_key {
                store = true;
            }
        }
        if !store {
            return;
        }

        // A higher dest-epoch in our own cell means the destination
        // restarted: start the flow handshake over.
        if e2e_new.cells[my].dest_epoch > self.e2e[d.index()].cells[my].dest_epoch {
            self.handshake_complete[d.index()] = false;

            if self.flow_seq_no[d.index()] > 1 {
                self.flow_seq_no[d.index()] = 1;
                self.flow_source_epoch[d.index()] = Epoch(now.sec());
                self.e2e[my].cells[d.index()].dest_epoch = self.flow_source_epoch[d.index()];
            }

            self.e2e[my].cells[d.index()].src_epoch = e2e_new.cells[my].dest_epoch;
            self.e2e[my].cells[d.index()].aru = 0;

            let fb = self.flows.get_mut(d, self.my_id);
            fb.sow = 1;
            fb.head_seq = 1;
            for i in 1..=self.degree {
                fb.next_seq[i] = 1;
            }
            fb.src_epoch = e2e_new.cells[my].dest_epoch;

            self.initial_e2e = true;
            if self.gen_e2e_deadline.is_none() {
                self.gen_e2e_deadline = Some(now);
            }
        }

        if !self.handshake_complete[d.index()]
            && e2e_new.cells[my].src_epoch == self.flow_source_epoch[d.index()]
        {
            if e2e_new.cells[my].aru != 0 {
                warn!(dest = %d, "handshake E2E with a nonzero aru");
                return;
            }
            info!(dest = %d, "flow handshake complete");
            self.handshake_complete[d.index()] = true;
        }

        for i in 1..=self.node_count as usize {
            let src = NodeId(i as u16);
            let new = e2e_new.cells[i];
            let old = self.e2e[d.index()].cells[i];

            if new.dest_epoch > old.dest_epoch {
                // Destination changed epochs: all stored state for the flow
                // is void; it will never accept the old epoch again.
                let fb = self.flows.get_mut(src, d);
                for k in fb.sow..fb.head_seq {
                    fb.clear_slot(k);
                }
                fb.sow = new.aru + 1;
                fb.head_seq = new.aru + 1;
                for k in 1..=self.degree {
                    fb.next_seq[k] = new.aru + 1;
                    fb.advance_next_seq(k);
                    self.edge[k].flow_aru[i][d.index()] = new.aru;
                    self.edge[k].flow_sow[i][d.index()] = new.aru + 1;
                }
                fb.src_epoch = new.src_epoch;
            } else if new.src_epoch > old.src_epoch {
                // Destination finished its handshake with this source.
                let fb = self.flows.get_mut(src, d);
                fb.release_through(new.aru);
                fb.sow = new.aru + 1;
                if fb.head_seq < fb.sow {
                    fb.head_seq = fb.sow;
                }
                for k in 1..=self.degree {
                    if fb.next_seq[k] < new.aru + 1 {
                        fb.next_seq[k] = new.aru + 1;
                    }
                    fb.advance_next_seq(k);
                    self.edge[k].flow_aru[i][d.index()] = new.aru;
                    self.edge[k].flow_sow[i][d.index()] = new.aru + 1;
                }
                fb.src_epoch = new.src_epoch;
            } else if new.aru > old.aru {
                // Plain cumulative progress.
                let fb = self.flows.get_mut(src, d);
                fb.release_through(new.aru);
                for k in 1..=self.degree {
                    let ed = &mut self.edge[k];
                    if ed.flow_aru[i][d.index()] < new.aru {
                        ed.flow_aru[i][d.index()] = new.aru;
                    }
                    if ed.flow_sow[i][d.index()] <= new.aru {
                        ed.flow_sow[i][d.index()] = new.aru + 1;
                    }
                }
            } else {
                continue;
            }

            // Make the E2E go out before further data of this flow, except
            // back toward where it came from.
            let fb = self.flows.get_mut(src, d);
            for j in 1..=self.degree {
                if j != last_hop_index {
                    self.edge[j].e2e_flow_block[d.index()][i] = true;
                } else {
                    let next = fb.next_seq[j];
                    if !self.edge[j].in_flow_queue[i][d.index()] && next < fb.head_seq {
                        let idx = FlowTable::slot_of(next);
                        let on_path = fb.msgs[idx]
                            .as_deref()
                            .map(|m| {
                                stored_mask_contains(m, self.node_count, net.my_neighbor(j))
                            })
                            .unwrap_or(false);
                        if on_path {
                            self.edge[j].queue_flow_norm(src, d);
                        }
                    }
                }
            }
        }

        // Pace re-forwarding toward the other neighbors.
        for j in 1..=self.degree {
            if j == last_hop_index {
                continue;
            }
            let ed = &mut self.edge[j];
            if !ed.e2e_stats[d.index()].unsent {
                ed.e2e_stats[d.index()].unsent = true;
                let next_at = ed.e2e_stats[d.index()]
                    .timeout
                    .saturating_add(self.cfg.e2e_ack_timeout);
                ed.e2e_stats[d.index()].timeout = next_at;
                ed.e2e_queue.insert((next_at, d.0), ());
            }
        }

        self.e2e[d.index()] = e2e_new;
        self.e2e_sig[d.index()] = sig;

        let fb = self.flows.get_mut(self.my_id, d);
        if !self.blocked_sessions[d.index()].is_empty()
            && fb.has_room()
            && self.handshake_complete[d.index()]
        {
            self.events.push_back(RelEvent::ResumeSessions(d));
        }
    }
}

// ----------------------------------------------------------------------
// Message layout helpers
// ----------------------------------------------------------------------

pub(crate) struct ParsedRel<'a> {
    pub overlay: OverlayHeader,
    pub rel_hdr: RelFloodHeader,
    pub payload: &'a [u8],
    pub mask: Option<PathMask>,
    /// The static portion (overlay through signature); what gets stored and
    /// forwarded.
    pub base: &'a [u8],
    pub signature: &'a [u8],
    pub acks: Vec<HbhAck>,
}

/// Parse `overlay | payload | rel_hdr | [mask] | [sig] | tail | acks`.
pub(crate) fn parse_message(msg: &[u8], node_count: u16) -> Option<ParsedRel<'_>> {
    let overlay = OverlayHeader::decode(&mut &msg[..]).ok()?;
    let rel_off = OverlayHeader::WIRE_LEN + overlay.len as usize;
    let rel_hdr = RelFloodHeader::decode(&mut msg.get(rel_off..)?).ok()?;
    let after = rel_off + RelFloodHeader::WIRE_LEN;

    let mask_len = PathMask::wire_len(node_count);
    let (mask, sig_off) = match rel_hdr.rtype {
        RelType::Data => {
            let mask = PathMask::decode(&mut msg.get(after..)?, node_count).ok()?;
            (Some(mask), after + mask_len)
        }
        RelType::E2e | RelType::StatusChange => (None, after),
        RelType::Saa => (None, after),
    };
    let base_end = match rel_hdr.rtype {
        RelType::Saa => sig_off,
        _ => sig_off + SIGNATURE_LEN,
    };

    let tail = RelFloodTail::decode(&mut msg.get(base_end..)?).ok()?;
    let acks_off = base_end + RelFloodTail::WIRE_LEN;
    if msg.len() != acks_off + tail.ack_len as usize {
        return None;
    }
    if tail.ack_len as usize % HbhAck::WIRE_LEN != 0 {
        return None;
    }
    let mut acks = Vec::with_capacity(tail.ack_len as usize / HbhAck::WIRE_LEN);
    let mut cursor = &msg[acks_off..];
    for _ in 0..tail.ack_len as usize / HbhAck::WIRE_LEN {
        acks.push(HbhAck::decode(&mut cursor).ok()?);
    }

    let signature = if matches!(rel_hdr.rtype, RelType::Saa) {
        &msg[base_end..base_end]
    } else {
        &msg[sig_off..sig_off + SIGNATURE_LEN]
    };

    Some(ParsedRel {
        overlay,
        rel_hdr,
        payload: &msg[OverlayHeader::WIRE_LEN..rel_off],
        mask,
        base: &msg[..base_end],
        signature,
        acks,
    })
}

/// The signed portion of a stored data message with the TTL zeroed.
pub(crate) fn signed_prefix(base: &[u8]) -> Vec<u8> {
    let mut prefix = base[..base.len() - SIGNATURE_LEN].to_vec();
    prefix[OverlayHeader::TTL_OFFSET] = 0;
    prefix
}

/// Mask embedded in a stored data message.
pub(crate) fn stored_mask_of(stored: &[u8], node_count: u16) -> PathMask {
    let overlay = OverlayHeader::decode(&mut &stored[..]).expect("stored messages parse");
    let off = OverlayHeader::WIRE_LEN + overlay.len as usize + RelFloodHeader::WIRE_LEN;
    PathMask::decode(&mut &stored[off..], node_count).expect("stored messages carry a mask")
}

pub(crate) fn stored_mask_contains(stored: &[u8], node_count: u16, node: NodeId) -> bool {
    stored_mask_of(stored, node_count).contains(node)
}

impl FlowTable {
    pub(crate) fn slot_of(seq: u64) -> usize {
        (seq % MAX_MESS_PER_FLOW) as usize
    }
}
