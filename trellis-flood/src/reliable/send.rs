//! Sending side of the reliable flood: injection at the source, the
//! per-neighbor send scheduler (status changes before end-to-end acks before
//! data before standalone acks), E2E and status-change generation, restamping
//! after routing changes, and the state transfer offered to a restarted
//! neighbor.

use super::flow::{FlowQEntry, FlowTable, SlotStatus};
use super::{
    parse_message, signed_prefix, stored_mask_contains, stored_mask_of, ReliableFlood,
    DATA_DOMAIN, E2E_DOMAIN, SC_DOMAIN,
};
use crate::network::Network;
use crate::time::WallTime;
use crate::{DisseminateStatus, FloodError};
use bytes::Bytes;
use tracing::{debug, info, warn};
use trellis_link::{LinkStatus, SendStatus};
use trellis_proto::constants::{MAX_MESS_PER_FLOW, MAX_PACKET_SIZE};
use trellis_proto::crypto::{NodeIdentity, NodeVerifier, ZeroScope, SIGNATURE_LEN};
use trellis_proto::ids::{Epoch, NodeId};
use trellis_proto::wire::{
    E2eAck, HbhAck, OverlayHeader, RelFloodHeader, RelFloodTail, RelType, Routing, StatusChange,
};

/// Packets-per-message estimate for fair-queue penalties.
fn packets_in(len: usize) -> u16 {
    len.div_ceil(MAX_PACKET_SIZE - 200).max(1) as u16
}

/// How many hop-by-hop acks fit in the slack of the message's last packet.
fn ack_budget(msg_len: usize) -> usize {
    let frag = MAX_PACKET_SIZE - 200;
    let used = msg_len % frag;
    (frag - used) / HbhAck::WIRE_LEN
}

impl ReliableFlood {
    // ------------------------------------------------------------------
    // Injection
    // ------------------------------------------------------------------

    /// Stamp, sign and store a new message originating here. The caller must
    /// have seen `can_flow_send(dst)`; otherwise the flow is blocked.
    #[allow(clippy::too_many_arguments)]
    pub fn inject(
        &mut self,
        payload: &[u8],
        dst: NodeId,
        num_paths: u16,
        net: &mut Network,
        identity: &NodeIdentity,
        _verifier: &NodeVerifier,
        now: WallTime,
    ) -> Result<DisseminateStatus, FloodError> {
        if !dst.is_valid(self.node_count) {
            return Err(FloodError::UnknownDestination);
        }
        if !self.can_flow_send(dst) {
            return Err(FloodError::FlowBlocked);
        }
        if payload.len() > u16::MAX as usize {
            return Err(FloodError::TooLarge);
        }
        let mask = net.stamp_mask(dst, num_paths).ok_or(FloodError::NoRoute)?;

        let seq = self.flow_seq_no[dst.index()];
        self.flow_seq_no[dst.index()] += 1;

        let overlay = OverlayHeader {
            src: self.my_id,
            dst,
            len: payload.len() as u16,
            ttl: 64,
            routing: Routing::ReliableFlood,
        };
        let r_hdr = RelFloodHeader {
            src: self.my_id,
            dst,
            src_epoch: self.flow_source_epoch[dst.index()],
            seq_num: seq,
            rtype: RelType::Data,
        };

        let mut msg = Vec::with_capacity(
            OverlayHeader::WIRE_LEN
                + payload.len()
                + RelFloodHeader::WIRE_LEN
                + mask.as_bytes().len()
                + SIGNATURE_LEN
                + RelFloodTail::WIRE_LEN,
        );
        overlay.encode(&mut msg);
        msg.extend_from_slice(payload);
        r_hdr.encode(&mut msg);
        mask.encode(&mut msg);
        msg.extend_from_slice(&[0u8; SIGNATURE_LEN]);

        let sig = {
            let prefix = signed_prefix(&msg);
            identity.sign_parts(&[DATA_DOMAIN, &prefix])
        };
        let sig_off = msg.len() - SIGNATURE_LEN;
        msg[sig_off..].copy_from_slice(&sig);

        RelFloodTail { ack_len: 0 }.encode(&mut msg);

        let parsed = parse_message(&msg, self.node_count).expect("self-built message parses");
        let mut state_change = false;
        let ret = self.process_data(0, &parsed, Some(num_paths), net, &mut state_change, now);

        for i in 1..=self.degree {
            let ed = &mut self.edge[i];
            if state_change {
                ed.saa_trigger += 1;
            }
            if ed.saa_trigger >= self.cfg.saa_threshold && ed.saa_deadline.is_none() {
                ed.saa_deadline = Some(now);
            }
        }
        Ok(ret)
    }

    // ------------------------------------------------------------------
    // Send scheduler
    // ------------------------------------------------------------------

    /// Offer one link slot to this neighbor: a pending status change first,
    /// then a pending E2E, then data through the flow fair queue, then a
    /// standalone ack when acknowledgment state is owed.
    pub fn send_one(
        &mut self,
        ngbr_index: usize,
        net: &mut Network,
        identity: &NodeIdentity,
        now: WallTime,
        send: &mut dyn FnMut(Bytes) -> SendStatus,
    ) -> usize {
        if self.edge[ngbr_index].sc_ready {
            return self.send_status_change(ngbr_index, net, identity, now, send);
        }
        if self.edge[ngbr_index].e2e_ready {
            return self.send_e2e(ngbr_index, net, identity, now, send);
        }
        let sent = self.send_data(ngbr_index, net, now, send);
        if sent > 0 {
            return sent;
        }
        let ed = &self.edge[ngbr_index];
        if ed.unsent_state_count > 0 && ed.saa_deadline.is_none() && ed.saa_trigger > 0 {
            return self.send_saa(ngbr_index, net, now, send);
        }
        0
    }

    fn send_data(
        &mut self,
        ngbr_index: usize,
        net: &Network,
        now: WallTime,
        send: &mut dyn FnMut(Bytes) -> SendStatus,
    ) -> usize {
        let ngbr_node = net.my_neighbor(ngbr_index);
        loop {
            let from_urgent;
            let entry: FlowQEntry;
            {
                let ed = &mut self.edge[ngbr_index];
                if let Some(front) = ed.urgent.front_mut() {
                    front.penalty = front.penalty.saturating_sub(1);
                    entry = *front;
                    from_urgent = true;
                } else if let Some(front) = ed.norm.front_mut() {
                    front.penalty = front.penalty.saturating_sub(1);
                    entry = *front;
                    from_urgent = false;
                } else {
                    return 0;
                }
            }
            let (s, d) = (entry.src, entry.dst);

            // Eligibility of the flow's next message toward this neighbor.
            let eligible = entry.penalty == 0 && {
                let ed = &self.edge[ngbr_index];
                let fb = self.flows.get_mut(s, d);
                let next = fb.next_seq[ngbr_index];
                let within_window =
                    next < ed.flow_sow[s.index()][d.index()] + MAX_MESS_PER_FLOW;
                let has_data = next < fb.head_seq;
                let blocked = ed.e2e_flow_block[d.index()][s.index()];
                let gated = s == self.my_id && !self.handshake_complete[d.index()];
                let on_path = has_data
                    && fb.msgs[FlowTable::slot_of(next)]
                        .as_deref()
                        .map(|m| stored_mask_contains(m, self.node_count, ngbr_node))
                        .unwrap_or(false);
                within_window && has_data && !blocked && !gated && on_path
            };

            if !eligible {
                let ed = &mut self.edge[ngbr_index];
                if from_urgent {
                    // Not its turn (or blocked): cycle to the normal queue.
                    let e = ed.urgent.pop_front().expect("front exists");
                    ed.norm.push_back(e);
                } else if entry.penalty > 0 {
                    let e = ed.norm.pop_front().expect("front exists");
                    ed.norm.push_back(e);
                } else {
                    ed.norm.pop_front();
                    ed.in_flow_queue[s.index()][d.index()] = false;
                }
                continue;
            }

            // Build: stored message plus a fresh tail with piggybacked acks.
            let (seq, mut out) = {
                let fb = self.flows.get_mut(s, d);
                let next = fb.next_seq[ngbr_index];
                let idx = FlowTable::slot_of(next);
                (next, fb.msgs[idx].clone().expect("eligible slot holds a message"))
            };
            let budget = ack_budget(out.len() + RelFloodTail::WIRE_LEN);
            let acks = self.collect_acks(ngbr_index, budget);
            RelFloodTail {
                ack_len: (acks.len() * HbhAck::WIRE_LEN) as u16,
            }
            .encode(&mut out);
            for ack in &acks {
                ack.encode(&mut out);
            }
            let msg_len = out.len();

            match send(Bytes::from(out)) {
                SendStatus::Ok => {}
                SendStatus::Full | SendStatus::Drop => {
                    // Undo the consumed penalty and the popped acks stay
                    // cleared; they ride the next packet.
                    for ack in acks {
                        self.edge[ngbr_index].queue_unsent_state(ack.src, ack.dst);
                    }
                    let ed = &mut self.edge[ngbr_index];
                    let front = if from_urgent {
                        ed.urgent.front_mut()
                    } else {
                        ed.norm.front_mut()
                    };
                    if let Some(f) = front {
                        f.penalty += 1;
                    }
                    return 0;
                }
            }

            let ed = &mut self.edge[ngbr_index];
            ed.total_pkts_sent += 1;
            if !acks.is_empty() {
                ed.saa_trigger = 0;
                ed.saa_deadline = Some(now.saturating_add(self.cfg.hbh_ack_timeout));
            }
            let mut fq = if from_urgent {
                ed.urgent.pop_front().expect("front exists")
            } else {
                ed.norm.pop_front().expect("front exists")
            };
            fq.penalty = packets_in(msg_len);
            ed.norm.push_back(fq);

            let fb = self.flows.get_mut(s, d);
            let idx = FlowTable::slot_of(seq);
            match fb.status[idx][ngbr_index] {
                SlotStatus::NewUnsent => fb.status[idx][ngbr_index] = SlotStatus::NewSent,
                SlotStatus::RestampedUnsent => {
                    fb.status[idx][ngbr_index] = SlotStatus::RestampedSent
                }
                other => warn!(?other, seq, "sent a message in an unexpected state"),
            }
            fb.advance_next_seq(ngbr_index);

            // Without the per-neighbor opt, sending itself may advance the
            // window.
            if self.cfg.hbh_advance && !self.cfg.hbh_opt {
                let mut min = fb.head_seq - 1;
                for j in 1..=self.degree {
                    let aru_j = self.edge[j].flow_aru[s.index()][d.index()];
                    if aru_j < min {
                        min = aru_j;
                    }
                    if fb.next_seq[j].saturating_sub(1) < min {
                        min = fb.next_seq[j] - 1;
                    }
                }
                let progressed = fb.sow <= min;
                if progressed {
                    fb.release_through(min);
                    if s == self.my_id && !self.blocked_sessions[d.index()].is_empty() {
                        self.events.push_back(super::RelEvent::ResumeSessions(d));
                    }
                    for j in 1..=self.degree {
                        self.edge[j].queue_unsent_state(s, d);
                        self.edge[j].saa_trigger += 1;
                        if self.edge[j].saa_deadline.is_none() {
                            self.edge[j].saa_deadline =
                                Some(now.saturating_add(self.cfg.hbh_ack_timeout));
                        }
                    }
                }
            }

            return msg_len;
        }
    }

    fn send_e2e(
        &mut self,
        ngbr_index: usize,
        net: &Network,
        identity: &NodeIdentity,
        now: WallTime,
        send: &mut dyn FnMut(Bytes) -> SendStatus,
    ) -> usize {
        let Some((&(queued_at, d_raw), _)) = self.edge[ngbr_index].e2e_queue.iter().next() else {
            self.edge[ngbr_index].e2e_ready = false;
            return 0;
        };
        let d = NodeId(d_raw);

        // Our own E2E is re-signed fresh at send time; forwarded ones carry
        // the destination's stored signature.
        if d == self.my_id && self.cfg.crypto {
            let bytes = e2e_bytes(&self.e2e[d.index()]);
            self.e2e_sig[d.index()] = identity.sign_parts(&[E2E_DOMAIN, &bytes]);
        }

        let payload = e2e_bytes(&self.e2e[d.index()]);
        let msg_len_base = OverlayHeader::WIRE_LEN
            + payload.len()
            + RelFloodHeader::WIRE_LEN
            + SIGNATURE_LEN
            + RelFloodTail::WIRE_LEN;
        let budget = ack_budget(msg_len_base);
        let acks = self.collect_acks(ngbr_index, budget);
        let had_acks = !acks.is_empty();

        let msg = build_control_message(
            self.my_id,
            net.my_neighbor(ngbr_index),
            &payload,
            RelType::E2e,
            &self.e2e_sig[d.index()],
            &acks,
        );
        let msg_len = msg.len();

        match send(msg) {
            SendStatus::Ok => {
                let ed = &mut self.edge[ngbr_index];
                ed.e2e_queue.remove(&(queued_at, d_raw));
                ed.e2e_stats[d.index()].unsent = false;
                ed.e2e_stats[d.index()].timeout = now;
                ed.e2e_ready = ed
                    .e2e_queue
                    .iter()
                    .next()
                    .is_some_and(|(&(t, _), _)| t <= now);
                if had_acks {
                    ed.saa_trigger = 0;
                    ed.saa_deadline = Some(now.saturating_add(self.cfg.hbh_ack_timeout));
                }

                // The E2E went first; unblock its flows toward this neighbor.
                for i in 1..=self.node_count as usize {
                    self.edge[ngbr_index].e2e_flow_block[d.index()][i] = false;
                    let src = NodeId(i as u16);
                    let Some(fb) = self.flows.get(src, d) else {
                        continue;
                    };
                    let next = fb.next_seq[ngbr_index];
                    if !self.edge[ngbr_index].in_flow_queue[i][d.index()]
                        && next < fb.head_seq
                        && fb.msgs[FlowTable::slot_of(next)]
                            .as_deref()
                            .map(|m| {
                                stored_mask_contains(
                                    m,
                                    self.node_count,
                                    net.my_neighbor(ngbr_index),
                                )
                            })
                            .unwrap_or(false)
                    {
                        self.edge[ngbr_index].queue_flow_norm(src, d);
                    }
                }
                msg_len
            }
            SendStatus::Full | SendStatus::Drop => {
                for ack in acks {
                    self.edge[ngbr_index].queue_unsent_state(ack.src, ack.dst);
                }
                let ed = &mut self.edge[ngbr_index];
                ed.e2e_queue.remove(&(queued_at, d_raw));
                let retry = now.saturating_add(self.cfg.e2e_ack_timeout);
                ed.e2e_stats[d.index()].timeout = retry;
                ed.e2e_stats[d.index()].unsent = true;
                ed.e2e_queue.insert((retry, d_raw), ());
                ed.e2e_ready = false;
                0
            }
        }
    }

    fn send_status_change(
        &mut self,
        ngbr_index: usize,
        net: &Network,
        identity: &NodeIdentity,
        now: WallTime,
        send: &mut dyn FnMut(Bytes) -> SendStatus,
    ) -> usize {
        let Some((&(queued_at, c_raw), _)) = self.edge[ngbr_index].sc_queue.iter().next() else {
            self.edge[ngbr_index].sc_ready = false;
            return 0;
        };
        let creator = NodeId(c_raw);

        if creator == self.my_id && self.cfg.crypto {
            let bytes = sc_bytes(&self.status_change[creator.index()]);
            self.sc_sig[creator.index()] = identity.sign_parts(&[SC_DOMAIN, &bytes]);
        }

        let payload = sc_bytes(&self.status_change[creator.index()]);
        let budget = ack_budget(
            OverlayHeader::WIRE_LEN
                + payload.len()
                + RelFloodHeader::WIRE_LEN
                + SIGNATURE_LEN
                + RelFloodTail::WIRE_LEN,
        );
        let acks = self.collect_acks(ngbr_index, budget);
        let had_acks = !acks.is_empty();

        let msg = build_control_message(
            self.my_id,
            net.my_neighbor(ngbr_index),
            &payload,
            RelType::StatusChange,
            &self.sc_sig[creator.index()],
            &acks,
        );
        let msg_len = msg.len();

        match send(msg) {
            SendStatus::Ok => {
                let ed = &mut self.edge[ngbr_index];
                ed.sc_queue.remove(&(queued_at, c_raw));
                ed.sc_stats[creator.index()].unsent = false;
                ed.sc_stats[creator.index()].timeout = now;
                ed.sc_ready = ed
                    .sc_queue
                    .iter()
                    .next()
                    .is_some_and(|(&(t, _), _)| t <= now);
                if had_acks {
                    ed.saa_trigger = 0;
                    ed.saa_deadline = Some(now.saturating_add(self.cfg.hbh_ack_timeout));
                }
                msg_len
            }
            SendStatus::Full | SendStatus::Drop => {
                for ack in acks {
                    self.edge[ngbr_index].queue_unsent_state(ack.src, ack.dst);
                }
                let ed = &mut self.edge[ngbr_index];
                ed.sc_queue.remove(&(queued_at, c_raw));
                let retry = now.saturating_add(self.cfg.status_change_timeout);
                ed.sc_stats[creator.index()].timeout = retry;
                ed.sc_stats[creator.index()].unsent = true;
                ed.sc_queue.insert((retry, c_raw), ());
                ed.sc_ready = false;
                0
            }
        }
    }

    fn send_saa(
        &mut self,
        ngbr_index: usize,
        net: &Network,
        now: WallTime,
        send: &mut dyn FnMut(Bytes) -> SendStatus,
    ) -> usize {
        let base_len = OverlayHeader::WIRE_LEN + RelFloodHeader::WIRE_LEN + RelFloodTail::WIRE_LEN;
        let acks = self.collect_acks(ngbr_index, ack_budget(base_len));
        if acks.is_empty() {
            return 0;
        }

        let msg = build_control_message(
            self.my_id,
            net.my_neighbor(ngbr_index),
            &[],
            RelType::Saa,
            &[],
            &acks,
        );
        let msg_len = msg.len();

        match send(msg) {
            SendStatus::Ok => {
                let ed = &mut self.edge[ngbr_index];
                ed.saa_trigger = 0;
                ed.saa_deadline = Some(now.saturating_add(self.cfg.hbh_ack_timeout));
                msg_len
            }
            SendStatus::Full | SendStatus::Drop => {
                for ack in acks {
                    self.edge[ngbr_index].queue_unsent_state(ack.src, ack.dst);
                }
                0
            }
        }
    }

    /// Drain owed hop-by-hop acks, up to the space budget.
    fn collect_acks(&mut self, ngbr_index: usize, max: usize) -> Vec<HbhAck> {
        let mut acks = Vec::new();
        while acks.len() < max {
            let Some((s, d)) = self.edge[ngbr_index].hbh_unsent.pop_front() else {
                break;
            };
            let fb = self.flows.get_mut(s, d);
            acks.push(HbhAck {
                src: s,
                dst: d,
                src_epoch: fb.src_epoch,
                sow: fb.sow,
                aru: fb.head_seq - 1,
            });
            let ed = &mut self.edge[ngbr_index];
            ed.unsent_state[s.index()][d.index()] = false;
            ed.unsent_state_count -= 1;
        }
        acks
    }

    // ------------------------------------------------------------------
    // E2E and status-change generation
    // ------------------------------------------------------------------

    /// Refresh our own end-to-end ack from the flows we terminate and, when
    /// it moved (or a handshake response is owed), queue it to every
    /// neighbor. Runs at `e2e_ack_timeout` while there is progress.
    pub fn gen_e2e(&mut self, now: WallTime, send: bool) {
        if !self.cfg.e2e_opt && self.e2e_stop {
            return;
        }
        let my = self.my_id.index();

        if !self.initial_e2e {
            let mut progress = false;
            for i in 1..=self.node_count as usize {
                let Some(fb) = self.flows.get(NodeId(i as u16), self.my_id) else {
                    continue;
                };
                let cell = &mut self.e2e[my].cells[i];
                if cell.src_epoch == fb.src_epoch && cell.aru < fb.head_seq - 1 {
                    cell.aru = fb.head_seq - 1;
                    progress = true;
                } else if cell.src_epoch == fb.src_epoch && cell.aru > fb.head_seq - 1 {
                    warn!("our aru went backwards since the last E2E");
                }
            }
            if !progress {
                return;
            }
        }
        self.initial_e2e = false;
        if !send {
            return;
        }

        self.gen_e2e_deadline = Some(now.saturating_add(self.cfg.e2e_ack_timeout));
        for i in 1..=self.degree {
            let ed = &mut self.edge[i];
            if ed.e2e_stats[my].unsent {
                continue;
            }
            ed.e2e_stats[my].unsent = true;
            ed.e2e_queue.insert((now, self.my_id.0), ());
        }
    }

    /// One of our own links changed status: recost the edge, restamp what
    /// that invalidates, and advertise a new signed status change.
    pub fn generate_link_status_change(
        &mut self,
        ngbr_node: NodeId,
        status: LinkStatus,
        net: &mut Network,
        identity: &NodeIdentity,
        now: WallTime,
    ) {
        let Some(ref_cost) = net.ref_cost(self.my_id, ngbr_node) else {
            warn!(%ngbr_node, "status change for an unconfigured edge");
            return;
        };
        let cost = match status {
            LinkStatus::Dead => -1,
            LinkStatus::Live => ref_cost,
            LinkStatus::Lossy => {
                (ref_cost as i64 + self.loss_penalty as i64).min(i16::MAX as i64) as i16
            }
        };
        info!(ngbr = %ngbr_node, ?status, cost, "link status change");

        net.apply_cost(self.my_id, ngbr_node, cost);
        self.restamp(net, identity, now);

        let my = self.my_id.index();
        if self.status_change[my].epoch.0 == 0 {
            self.status_change[my].epoch = self.flow_source_epoch[my];
        }
        self.status_change[my].cells[ngbr_node.index()].seq += 1;
        self.status_change[my].cells[ngbr_node.index()].cost = cost;
        self.local_sc_progress = true;
        if self.gen_sc_deadline.is_none() {
            self.gen_sc_deadline = Some(now);
        }
    }

    /// Queue our own status change to every neighbor; self-rearming while
    /// changes keep arriving.
    pub(crate) fn gen_status_change(&mut self, now: WallTime) {
        if !self.local_sc_progress {
            self.gen_sc_deadline = None;
            return;
        }
        self.local_sc_progress = false;
        self.gen_sc_deadline = Some(now.saturating_add(self.cfg.status_change_timeout));

        let my = self.my_id.index();
        for i in 1..=self.degree {
            let ed = &mut self.edge[i];
            if ed.sc_stats[my].unsent {
                continue;
            }
            ed.sc_stats[my].unsent = true;
            ed.sc_queue.insert((now, self.my_id.0), ());
        }
    }

    /// Validate and apply a status change received from the network.
    pub(crate) fn process_status_change(
        &mut self,
        last_hop_index: usize,
        sc_new: StatusChange,
        sig: [u8; SIGNATURE_LEN],
        net: &mut Network,
        identity: &NodeIdentity,
        now: WallTime,
    ) {
        let creator = sc_new.creator;
        if !creator.is_valid(self.node_count) {
            return;
        }
        let sc_old = &self.status_change[creator.index()];

        let mut new_epoch = false;
        let mut new_content = false;
        let mut old_content = false;

        if sc_new.epoch < sc_old.epoch {
            debug!(%creator, "status change with an old epoch");
            return;
        } else if sc_new.epoch > sc_old.epoch {
            new_epoch = true;
            new_content = true;
        }

        for i in 1..=self.node_count as usize {
            let node = NodeId(i as u16);
            let is_neighbor = net.are_neighbors(creator, node);

            // A creator may only speak about its own adjacent links.
            if !is_neighbor && (sc_new.cells[i].seq > 0 || sc_new.cells[i].cost != 0) {
                warn!(%creator, about = %node, "status change alters a non-adjacent link");
                return;
            }
            if is_neighbor {
                let Some(ref_cost) = net.ref_cost(creator, node) else {
                    continue;
                };
                if sc_new.cells[i].cost != -1 && sc_new.cells[i].cost < ref_cost {
                    warn!(cost = sc_new.cells[i].cost, ref_cost, "cost below reference");
                    return;
                }
            }
            if !new_epoch {
                if sc_new.cells[i].seq < sc_old.cells[i].seq {
                    old_content = true;
                } else if sc_new.cells[i].seq > sc_old.cells[i].seq {
                    new_content = true;
                }
            }
        }

        // Mixing newer and older cells in one message is a protocol
        // violation by the creator or a replayer.
        if !new_epoch && old_content && new_content {
            warn!(%creator, "status change mixes old and new content");
            return;
        }
        if !new_content {
            return;
        }

        for i in 1..=self.node_count as usize {
            let node = NodeId(i as u16);
            if net.are_neighbors(creator, node)
                && (new_epoch || sc_new.cells[i].seq > self.status_change[creator.index()].cells[i].seq)
            {
                net.apply_cost(creator, node, sc_new.cells[i].cost);
            }
        }

        self.status_change[creator.index()] = sc_new;
        self.sc_sig[creator.index()] = sig;

        for j in 1..=self.degree {
            if j == last_hop_index {
                continue;
            }
            let ed = &mut self.edge[j];
            if !ed.sc_stats[creator.index()].unsent {
                ed.sc_stats[creator.index()].unsent = true;
                let next_at = ed.sc_stats[creator.index()]
                    .timeout
                    .saturating_add(self.cfg.status_change_timeout);
                ed.sc_stats[creator.index()].timeout = next_at;
                ed.sc_queue.insert((next_at, creator.0), ());
            }
        }

        // Routing moved; our in-flight messages may need wider masks.
        self.restamp(net, identity, now);
    }

    /// Recompute masks for every unacknowledged self-originated message and,
    /// where the current routing demands a superset, rewrite the stored
    /// mask, re-sign, and mark the message for retransmission everywhere.
    pub fn restamp(&mut self, net: &mut Network, identity: &NodeIdentity, _now: WallTime) {
        let destinations = self.flows.destinations_from(self.my_id);
        for d in destinations {
            if d == self.my_id {
                continue;
            }
            let mut restamped_any = false;
            {
                let node_count = self.node_count;
                let crypto = self.cfg.crypto;
                let fb = self.flows.get_mut(self.my_id, d);
                if fb.sow == fb.head_seq {
                    continue;
                }
                let mut error = false;
                for seq in fb.sow..fb.head_seq {
                    if error {
                        break;
                    }
                    let idx = FlowTable::slot_of(seq);
                    let num_paths = fb.num_paths[idx];
                    let Some(mut fresh) = net.stamp_mask(d, num_paths) else {
                        error = true;
                        continue;
                    };
                    let Some(stored) = fb.msgs[idx].as_mut() else {
                        continue;
                    };
                    let old_mask = stored_mask_of(stored, node_count);
                    fresh.merge(&old_mask);
                    if fresh == old_mask {
                        continue;
                    }

                    // Write the superset mask and re-sign in place.
                    let overlay =
                        OverlayHeader::decode(&mut &stored[..]).expect("stored messages parse");
                    let mask_off = OverlayHeader::WIRE_LEN
                        + overlay.len as usize
                        + RelFloodHeader::WIRE_LEN;
                    let mask_bytes = fresh.as_bytes();
                    stored[mask_off..mask_off + mask_bytes.len()].copy_from_slice(mask_bytes);

                    if crypto {
                        let sig_off = stored.len() - SIGNATURE_LEN;
                        let (signed_part, sig_part) = stored.split_at_mut(sig_off);
                        let sig = {
                            let scope =
                                ZeroScope::new(signed_part, OverlayHeader::TTL_OFFSET, None);
                            identity.sign_parts(&[DATA_DOMAIN, scope.bytes()])
                        };
                        sig_part.copy_from_slice(&sig);
                    }

                    restamped_any = true;
                    for ngbr in 1..=fb.next_seq.len() - 1 {
                        fb.status[idx][ngbr] = SlotStatus::RestampedUnsent;
                    }
                }
            }

            if restamped_any {
                for k in 1..=self.degree {
                    let fb = self.flows.get_mut(self.my_id, d);
                    let mut resend_start = fb.sow;
                    while resend_start < fb.head_seq
                        && fb.status[FlowTable::slot_of(resend_start)][k].is_sent()
                    {
                        resend_start += 1;
                    }
                    fb.next_seq[k] = resend_start;

                    let next = fb.next_seq[k];
                    if next < fb.head_seq {
                        let on_path = fb.msgs[FlowTable::slot_of(next)]
                            .as_deref()
                            .map(|m| stored_mask_contains(m, self.node_count, net.my_neighbor(k)))
                            .unwrap_or(false);
                        if on_path {
                            self.edge[k].queue_flow_urgent(self.my_id, d);
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Neighbor state transfer
    // ------------------------------------------------------------------

    /// The link layer detected that this neighbor lost its state (new
    /// incarnation): re-offer every stored E2E and status change, and mark
    /// everything we ever sent it as unsent again.
    pub fn neighbor_transfer(&mut self, ngbr_index: usize, net: &Network) {
        let ngbr_node = net.my_neighbor(ngbr_index);
        info!(ngbr = %ngbr_node, "state transfer to restarted neighbor");

        for creator in 1..=self.node_count as usize {
            let ed = &mut self.edge[ngbr_index];
            if !ed.sc_stats[creator].unsent
                && NodeId(creator as u16) != ngbr_node
                && self.status_change[creator].epoch.0 > 0
            {
                ed.sc_stats[creator].unsent = true;
                let next_at = ed.sc_stats[creator]
                    .timeout
                    .saturating_add(self.cfg.status_change_timeout);
                ed.sc_stats[creator].timeout = next_at;
                ed.sc_queue.insert((next_at, creator as u16), ());
            }
        }

        for d in 1..=self.node_count as usize {
            let dst = NodeId(d as u16);
            {
                let ed = &mut self.edge[ngbr_index];
                if !ed.e2e_stats[d].unsent && dst != ngbr_node && self.e2e[d].dest == dst {
                    ed.e2e_stats[d].unsent = true;
                    let next_at = ed.e2e_stats[d]
                        .timeout
                        .saturating_add(self.cfg.e2e_ack_timeout);
                    ed.e2e_stats[d].timeout = next_at;
                    ed.e2e_queue.insert((next_at, d as u16), ());
                    for s in 1..=self.node_count as usize {
                        ed.e2e_flow_block[d][s] = true;
                    }
                }
            }

            for src in self.flows.sources_toward(dst) {
                let fb = self.flows.get_mut(src, dst);
                for seq in fb.sow..fb.head_seq {
                    let idx = FlowTable::slot_of(seq);
                    match fb.status[idx][ngbr_index] {
                        SlotStatus::NewSent => fb.status[idx][ngbr_index] = SlotStatus::NewUnsent,
                        SlotStatus::RestampedSent => {
                            fb.status[idx][ngbr_index] = SlotStatus::RestampedUnsent
                        }
                        _ => {}
                    }
                }
                fb.next_seq[ngbr_index] = fb.sow;

                let next = fb.next_seq[ngbr_index];
                if next < fb.head_seq {
                    let on_path = fb.msgs[FlowTable::slot_of(next)]
                        .as_deref()
                        .map(|m| stored_mask_contains(m, self.node_count, ngbr_node))
                        .unwrap_or(false);
                    if on_path {
                        self.edge[ngbr_index].queue_flow_urgent(src, dst);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Fire due engine timers; the daemon then services neighbors that have
    /// pending work.
    pub fn poll(&mut self, now: WallTime) {
        if self.gen_e2e_deadline.is_some_and(|t| t <= now) {
            self.gen_e2e_deadline = None;
            self.gen_e2e(now, true);
        }
        if self.gen_sc_deadline.is_some_and(|t| t <= now) {
            self.gen_status_change(now);
        }

        for i in 1..=self.degree {
            let ed = &mut self.edge[i];
            if let Some((&(t, _), _)) = ed.e2e_queue.iter().next() {
                if t <= now {
                    ed.e2e_ready = true;
                }
            }
            if let Some((&(t, _), _)) = ed.sc_queue.iter().next() {
                if t <= now {
                    ed.sc_ready = true;
                }
            }
            if ed.saa_deadline.is_some_and(|t| t <= now) {
                ed.saa_deadline = None;
                if ed.saa_trigger == 0 {
                    // Quiet since the last ack: prime so the next state
                    // change acks promptly, and stop the timer.
                    ed.saa_trigger = self.cfg.saa_threshold.saturating_sub(1);
                }
            }
        }
    }

    /// Earliest engine deadline.
    pub fn next_wakeup(&self) -> Option<WallTime> {
        let mut next = None;
        let mut fold = |t: Option<WallTime>| {
            next = match (next, t) {
                (None, t) => t,
                (n, None) => n,
                (Some(a), Some(b)) => Some(a.min(b)),
            };
        };
        fold(self.gen_e2e_deadline);
        fold(self.gen_sc_deadline);
        for i in 1..=self.degree {
            let ed = &self.edge[i];
            fold(ed.e2e_queue.iter().next().map(|(&(t, _), _)| t));
            fold(ed.sc_queue.iter().next().map(|(&(t, _), _)| t));
            fold(ed.saa_deadline);
        }
        next
    }
}

/// `overlay | payload | rel_hdr | [sig] | tail | acks` for SAA, E2E and
/// status-change messages.
fn build_control_message(
    my_id: NodeId,
    ngbr: NodeId,
    payload: &[u8],
    rtype: RelType,
    sig: &[u8],
    acks: &[HbhAck],
) -> Bytes {
    let overlay = OverlayHeader {
        src: my_id,
        dst: ngbr,
        len: payload.len() as u16,
        ttl: 255,
        routing: Routing::ReliableFlood,
    };
    let r_hdr = RelFloodHeader {
        src: NodeId(0),
        dst: NodeId(0),
        src_epoch: Epoch(0),
        seq_num: 0,
        rtype,
    };
    let mut msg = Vec::with_capacity(
        OverlayHeader::WIRE_LEN
            + payload.len()
            + RelFloodHeader::WIRE_LEN
            + sig.len()
            + RelFloodTail::WIRE_LEN
            + acks.len() * HbhAck::WIRE_LEN,
    );
    overlay.encode(&mut msg);
    msg.extend_from_slice(payload);
    r_hdr.encode(&mut msg);
    msg.extend_from_slice(sig);
    RelFloodTail {
        ack_len: (acks.len() * HbhAck::WIRE_LEN) as u16,
    }
    .encode(&mut msg);
    for ack in acks {
        ack.encode(&mut msg);
    }
    Bytes::from(msg)
}

pub(crate) fn e2e_bytes(e2e: &E2eAck) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + e2e.cells.len() * 16);
    e2e.encode(&mut out);
    out
}

pub(crate) fn sc_bytes(sc: &StatusChange) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + sc.cells.len() * 6);
    sc.encode(&mut out);
    out
}
