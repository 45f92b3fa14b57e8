//! Priority-based flooding.
//!
//! Each origin's messages live in a per-source "belly" keyed by
//! `(incarnation, seq)`. Toward every neighbor a message is in exactly one
//! state (needed, received from that side, on the wire, dropped, expired, or
//! excluded by its path mask), and neighbors pull from per-(source,
//! priority) queues through a penalty-based sender fair queue. Stores are
//! bounded: when a neighbor's backlog exceeds the configured cap, the
//! heaviest source loses its lowest-priority, oldest message.

use crate::network::Network;
use crate::time::WallTime;
use crate::{DisseminateStatus, FloodError};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};
use trellis_proto::config::PrioConfig;
use trellis_proto::constants::{MAX_PACKET_SIZE, MAX_PRIORITY};
use trellis_proto::crypto::{NodeIdentity, NodeVerifier, SIGNATURE_LEN};
use trellis_proto::ids::NodeId;
use trellis_proto::wire::{OverlayHeader, PathMask, PrioFloodHeader, Routing};

/// Domain tag mixed into every priority-flood signature.
const SIGN_DOMAIN: &[u8; 4] = b"PFLD";

/// Rough packets-per-message estimate used for fair-queue penalties and
/// per-neighbor accounting.
fn packets_in(len: usize) -> u16 {
    len.div_ceil(MAX_PACKET_SIZE - 200).max(1) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NgbrStatus {
    Need,
    Recv,
    OnLink,
    Dropped,
    Expired,
    NotInMask,
}

type MsgKey = (u64, u64);

struct FloodEntry {
    expire: WallTime,
    origin: WallTime,
    priority: u8,
    need_count: u16,
    msg: Option<Bytes>,
    msg_len: usize,
    ns: Vec<NgbrStatus>,
}

#[derive(Debug, Clone, Copy)]
struct FairEntry {
    src: NodeId,
    penalty: u16,
}

/// Per-neighbor sending state.
struct PrioLinkData {
    total_msg: u32,
    msg_count: Vec<u32>,
    in_send_queue: Vec<bool>,
    /// Per source, per priority level, keys in arrival order. Entries whose
    /// belly state moved on are skipped lazily at pop time.
    pq: Vec<Vec<VecDeque<MsgKey>>>,
    norm: VecDeque<FairEntry>,
    urgent: VecDeque<FairEntry>,
    sent_messages: u64,
}

impl PrioLinkData {
    fn new(node_count: u16) -> Self {
        let n = node_count as usize + 1;
        PrioLinkData {
            total_msg: 0,
            msg_count: vec![0; n],
            in_send_queue: vec![false; n],
            pq: (0..n)
                .map(|_| (0..MAX_PRIORITY as usize + 1).map(|_| VecDeque::new()).collect())
                .collect(),
            norm: VecDeque::new(),
            urgent: VecDeque::new(),
            sent_messages: 0,
        }
    }
}

/// Per-origin delivery statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginStats {
    pub num_msgs: u64,
    pub num_highprio: u64,
    pub bytes: u64,
    pub latency_usecs: u64,
    pub latency_highprio_usecs: u64,
    pub worst_latency_usecs: u64,
    pub worst_latency_highprio_usecs: u64,
}

pub struct PriorityFlood {
    cfg: PrioConfig,
    my_id: NodeId,
    node_count: u16,
    degree: usize,
    seq_no: u64,
    node_incarnation: Vec<u64>,
    belly: Vec<HashMap<MsgKey, FloodEntry>>,
    edge: Vec<PrioLinkData>,
    deliveries: VecDeque<Bytes>,
    stats: Vec<OriginStats>,
    total_dropped: u64,
}

impl PriorityFlood {
    pub fn new(cfg: PrioConfig, net: &Network, now: WallTime) -> Self {
        let node_count = net.node_count();
        let degree = net.my_degree();
        let n = node_count as usize + 1;
        let mut node_incarnation = vec![0u64; n];
        node_incarnation[net.my_id().index()] = now.sec() as u64;
        let per_origin_capacity = cfg.min_belly_size as usize / n.max(1);
        PriorityFlood {
            cfg,
            my_id: net.my_id(),
            node_count,
            degree,
            seq_no: 0,
            node_incarnation,
            belly: (0..n)
                .map(|_| HashMap::with_capacity(per_origin_capacity))
                .collect(),
            edge: (0..=degree).map(|_| PrioLinkData::new(node_count)).collect(),
            deliveries: VecDeque::new(),
            stats: vec![OriginStats::default(); n],
            total_dropped: 0,
        }
    }

    pub fn poll_delivery(&mut self) -> Option<Bytes> {
        self.deliveries.pop_front()
    }

    pub fn stats_for(&self, origin: NodeId) -> &OriginStats {
        &self.stats[origin.index()]
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped
    }

    /// Anything queued toward this neighbor?
    pub fn has_pending(&self, ngbr_index: usize) -> bool {
        let pl = &self.edge[ngbr_index];
        !pl.urgent.is_empty() || !pl.norm.is_empty()
    }

    // ------------------------------------------------------------------
    // Injection (origin)
    // ------------------------------------------------------------------

    /// Stamp, sign and disseminate a new message originating here.
    #[allow(clippy::too_many_arguments)]
    pub fn inject(
        &mut self,
        payload: &[u8],
        dst: NodeId,
        priority: u8,
        num_paths: u16,
        net: &mut Network,
        identity: &NodeIdentity,
        verifier: &NodeVerifier,
        now: WallTime,
    ) -> Result<DisseminateStatus, FloodError> {
        if !dst.is_valid(self.node_count) {
            return Err(FloodError::UnknownDestination);
        }
        if payload.len() > u16::MAX as usize {
            return Err(FloodError::TooLarge);
        }
        let mask = net
            .stamp_mask(dst, num_paths)
            .ok_or(FloodError::NoRoute)?;

        let priority = if priority == 0 {
            self.cfg.default_priority
        } else {
            priority
        };
        let expire = now.saturating_add(self.cfg.default_expire);
        self.seq_no += 1;

        let overlay = OverlayHeader {
            src: self.my_id,
            dst,
            len: payload.len() as u16,
            ttl: 64,
            routing: Routing::PriorityFlood,
        };
        let f_hdr = PrioFloodHeader {
            incarnation: self.node_incarnation[self.my_id.index()],
            seq_num: self.seq_no,
            priority: priority as u32,
            origin_sec: now.sec(),
            origin_usec: now.usec(),
            expire_sec: expire.sec(),
            expire_usec: expire.usec(),
        };

        let mut msg = Vec::with_capacity(
            OverlayHeader::WIRE_LEN
                + payload.len()
                + PrioFloodHeader::WIRE_LEN
                + mask.as_bytes().len()
                + SIGNATURE_LEN,
        );
        overlay.encode(&mut msg);
        msg.extend_from_slice(payload);
        f_hdr.encode(&mut msg);
        mask.encode(&mut msg);

        let prefix = signed_prefix(&msg);
        let signature = identity.sign_parts(&[SIGN_DOMAIN, &prefix]);
        msg.extend_from_slice(&signature);

        Ok(self.disseminate(None, Bytes::from(msg), net, verifier, now))
    }

    // ------------------------------------------------------------------
    // Dissemination
    // ------------------------------------------------------------------

    /// Process one priority-flood message: from a neighbor link
    /// (`last_hop = Some(..)`) or freshly injected here (`None`).
    pub fn disseminate(
        &mut self,
        last_hop: Option<NodeId>,
        msg: Bytes,
        net: &mut Network,
        verifier: &NodeVerifier,
        now: WallTime,
    ) -> DisseminateStatus {
        let mut ret = DisseminateStatus::Ok;

        let last_hop_index = match last_hop {
            None => 0,
            Some(node) => match net.neighbor_index(node) {
                Some(idx) => idx,
                None => {
                    debug!(%node, "message from a non-neighbor");
                    return DisseminateStatus::NoRoute;
                }
            },
        };

        // Framing.
        let Ok(overlay) = OverlayHeader::decode(&mut &msg[..]) else {
            return DisseminateStatus::NoRoute;
        };
        let mask_len = PathMask::wire_len(self.node_count);
        let expected = OverlayHeader::WIRE_LEN
            + overlay.len as usize
            + PrioFloodHeader::WIRE_LEN
            + mask_len
            + SIGNATURE_LEN;
        if msg.len() != expected {
            warn!(got = msg.len(), expected, "invalid priority-flood size");
            return DisseminateStatus::NoRoute;
        }
        let hdr_off = OverlayHeader::WIRE_LEN + overlay.len as usize;
        let Ok(f_hdr) = PrioFloodHeader::decode(&mut &msg[hdr_off..]) else {
            return DisseminateStatus::NoRoute;
        };
        let mask_off = hdr_off + PrioFloodHeader::WIRE_LEN;
        let Ok(mask) = PathMask::decode(&mut &msg[mask_off..], self.node_count) else {
            return DisseminateStatus::NoRoute;
        };

        let src_id = overlay.src;
        if !src_id.is_valid(self.node_count) {
            return DisseminateStatus::NoRoute;
        }

        // Authenticity.
        if self.cfg.crypto {
            let prefix = signed_prefix(&msg);
            if verifier
                .verify_parts(src_id, &[SIGN_DOMAIN, &prefix], &msg[msg.len() - SIGNATURE_LEN..])
                .is_err()
            {
                warn!(origin = %src_id, "priority-flood signature failed");
                return DisseminateStatus::NoRoute;
            }
        }

        // Source incarnation.
        if f_hdr.incarnation < self.node_incarnation[src_id.index()] {
            return DisseminateStatus::NoRoute;
        } else if f_hdr.incarnation > self.node_incarnation[src_id.index()] {
            self.node_incarnation[src_id.index()] = f_hdr.incarnation;
        }

        let key: MsgKey = (f_hdr.incarnation, f_hdr.seq_num);
        let last_hop_node = last_hop.unwrap_or(self.my_id);

        if !self.belly[src_id.index()].contains_key(&key) {
            // New message.
            let expire = WallTime::from_parts(f_hdr.expire_sec, f_hdr.expire_usec);
            let origin = WallTime::from_parts(f_hdr.origin_sec, f_hdr.origin_usec);
            if expire <= now {
                debug!(origin = %src_id, seq = f_hdr.seq_num, "expired on arrival");
                return DisseminateStatus::NoRoute;
            }
            if f_hdr.priority == 0 || f_hdr.priority > MAX_PRIORITY as u32 {
                debug!(priority = f_hdr.priority, "invalid priority");
                return DisseminateStatus::NoRoute;
            }

            if overlay.dst == self.my_id {
                self.record_delivery(src_id, &overlay, f_hdr.priority as u8, origin, now);
                self.deliveries.push_back(msg.clone());
            }

            let mut entry = FloodEntry {
                expire,
                origin,
                priority: f_hdr.priority as u8,
                need_count: self.degree as u16,
                msg: Some(msg.clone()),
                msg_len: msg.len(),
                ns: vec![NgbrStatus::Need; self.degree + 1],
            };
            let packets = packets_in(entry.msg_len);

            for ngbr_iter in 1..=self.degree {
                let ngbr_node = net.my_neighbor(ngbr_iter);

                if ngbr_node == last_hop_node || ngbr_node == overlay.src {
                    entry.ns[ngbr_iter] = NgbrStatus::Recv;
                    entry.need_count -= 1;
                } else if !mask.contains(ngbr_node) {
                    entry.ns[ngbr_iter] = NgbrStatus::NotInMask;
                    entry.need_count -= 1;
                } else if overlay.dst == self.my_id {
                    entry.ns[ngbr_iter] = NgbrStatus::Dropped;
                    entry.need_count -= 1;
                } else {
                    let pl = &mut self.edge[ngbr_iter];
                    pl.pq[src_id.index()][f_hdr.priority as usize].push_back(key);
                    if !pl.in_send_queue[src_id.index()] {
                        pl.in_send_queue[src_id.index()] = true;
                        pl.urgent.push_back(FairEntry {
                            src: src_id,
                            penalty: 1,
                        });
                    }
                    pl.msg_count[src_id.index()] += packets as u32;
                    pl.total_msg += packets as u32;

                    // Over capacity: evict the heaviest sender's lowest
                    // priority, oldest message toward this neighbor.
                    if pl.total_msg > self.cfg.max_mess_stored {
                        self.evict_hog(ngbr_iter, &mut entry, src_id, key);
                        ret = DisseminateStatus::BuffDrop;
                    }
                }
            }

            if entry.need_count == 0 {
                entry.msg = None;
            }
            self.belly[src_id.index()].insert(key, entry);
        } else {
            // Duplicate.
            if last_hop.is_none() {
                return DisseminateStatus::NoRoute;
            }
            let entry = self.belly[src_id.index()].get_mut(&key).expect("present");
            if entry.need_count == 0 {
                return DisseminateStatus::NoRoute;
            }
            if entry.ns[last_hop_index] == NgbrStatus::Need {
                // The neighbor that just sent it clearly has it.
                Self::cleanup_entry(
                    &mut self.edge,
                    entry,
                    src_id,
                    last_hop_index..=last_hop_index,
                    NgbrStatus::Recv,
                );
            }
            ret = DisseminateStatus::NoRoute;
        }

        ret
    }

    fn record_delivery(
        &mut self,
        src_id: NodeId,
        overlay: &OverlayHeader,
        priority: u8,
        origin: WallTime,
        now: WallTime,
    ) {
        let stats = &mut self.stats[src_id.index()];
        stats.num_msgs += 1;
        stats.bytes += overlay.len as u64;
        let latency = now.saturating_sub(origin).as_micros() as u64;
        stats.latency_usecs += latency;
        if stats.worst_latency_usecs < latency {
            stats.worst_latency_usecs = latency;
        }
        if priority == MAX_PRIORITY {
            stats.num_highprio += 1;
            stats.latency_highprio_usecs += latency;
            if stats.worst_latency_highprio_usecs < latency {
                stats.worst_latency_highprio_usecs = latency;
            }
        }
    }

    /// Move a message out of the Need state toward a range of neighbors,
    /// fixing the per-neighbor accounting; releases the payload when nobody
    /// needs it anymore.
    fn cleanup_entry(
        edge: &mut [PrioLinkData],
        entry: &mut FloodEntry,
        src: NodeId,
        range: std::ops::RangeInclusive<usize>,
        flag: NgbrStatus,
    ) {
        if entry.need_count == 0 {
            return;
        }
        let packets = packets_in(entry.msg_len) as u32;
        for i in range {
            if entry.ns[i] != NgbrStatus::Need {
                continue;
            }
            let pl = &mut edge[i];
            pl.msg_count[src.index()] -= packets;
            pl.total_msg -= packets;
            entry.ns[i] = flag;
            entry.need_count -= 1;
            if entry.need_count == 0 {
                break;
            }
        }
        if entry.need_count == 0 {
            entry.msg = None;
        }
    }

    fn evict_hog(&mut self, ngbr_index: usize, current: &mut FloodEntry, current_src: NodeId, current_key: MsgKey) {
        let pl = &self.edge[ngbr_index];
        let mut hog = 0usize;
        let mut max_usage = 0u32;
        for (i, &count) in pl.msg_count.iter().enumerate() {
            if count > max_usage {
                hog = i;
                max_usage = count;
            }
        }
        if hog == 0 {
            return;
        }

        // Lowest-priority, oldest entry of the hog toward this neighbor.
        let victim = 'found: {
            for prio in 1..=MAX_PRIORITY as usize {
                let queue = &self.edge[ngbr_index].pq[hog][prio];
                for &key in queue {
                    if key == current_key && hog == current_src.index() {
                        // The message being inserted right now lives on the
                        // stack, not in the belly yet.
                        break 'found Some((key, true));
                    }
                    if let Some(e) = self.belly[hog].get(&key) {
                        if e.ns[ngbr_index] == NgbrStatus::Need {
                            break 'found Some((key, false));
                        }
                    }
                }
            }
            None
        };

        match victim {
            Some((_, true)) => {
                Self::cleanup_entry(
                    &mut self.edge,
                    current,
                    current_src,
                    ngbr_index..=ngbr_index,
                    NgbrStatus::Dropped,
                );
                self.total_dropped += 1;
            }
            Some((key, false)) => {
                let entry = self.belly[hog].get_mut(&key).expect("victim exists");
                Self::cleanup_entry(
                    &mut self.edge,
                    entry,
                    NodeId(hog as u16),
                    ngbr_index..=ngbr_index,
                    NgbrStatus::Dropped,
                );
                self.total_dropped += 1;
            }
            None => warn!("belly over capacity but no evictable entry found"),
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send at most one message toward a neighbor, honoring the sender fair
    /// queue. Returns the bytes handed to the link (0 when nothing was
    /// sendable).
    pub fn send_one(
        &mut self,
        ngbr_index: usize,
        now: WallTime,
        send: &mut dyn FnMut(Bytes) -> trellis_link::SendStatus,
    ) -> usize {
        loop {
            // Pick a sender: urgent first, then normal.
            let from_urgent;
            let src;
            {
                let pl = &mut self.edge[ngbr_index];
                if let Some(front) = pl.urgent.front_mut() {
                    front.penalty = front.penalty.saturating_sub(1);
                    let entry = *front;
                    if entry.penalty > 0 || pl.msg_count[entry.src.index()] == 0 {
                        pl.urgent.pop_front();
                        pl.norm.push_back(entry);
                        continue;
                    }
                    from_urgent = true;
                    src = entry.src;
                } else if let Some(front) = pl.norm.front_mut() {
                    front.penalty = front.penalty.saturating_sub(1);
                    let entry = *front;
                    if entry.penalty > 0 {
                        pl.norm.pop_front();
                        pl.norm.push_back(entry);
                        continue;
                    }
                    if pl.msg_count[entry.src.index()] == 0 {
                        pl.norm.pop_front();
                        pl.in_send_queue[entry.src.index()] = false;
                        continue;
                    }
                    from_urgent = false;
                    src = entry.src;
                } else {
                    return 0;
                }
            }

            // This sender's highest-priority live entry toward us.
            let Some(key) = self.pick_highest(ngbr_index, src) else {
                // Accounting said there was something; drop the stale entry.
                let pl = &mut self.edge[ngbr_index];
                if from_urgent {
                    pl.urgent.pop_front();
                } else {
                    pl.norm.pop_front();
                }
                pl.in_send_queue[src.index()] = false;
                continue;
            };

            let entry = self.belly[src.index()].get_mut(&key).expect("picked live");

            if entry.expire <= now {
                Self::cleanup_entry(&mut self.edge, entry, src, 1..=self.degree, NgbrStatus::Expired);
                let pl = &mut self.edge[ngbr_index];
                let front = if from_urgent {
                    pl.urgent.front_mut()
                } else {
                    pl.norm.front_mut()
                };
                if let Some(f) = front {
                    f.penalty = 1;
                }
                continue;
            }

            let msg = entry.msg.clone().expect("needed entries hold their message");
            let msg_len = entry.msg_len;
            match send(msg) {
                trellis_link::SendStatus::Ok => {
                    let packets = packets_in(msg_len);
                    Self::cleanup_entry(
                        &mut self.edge,
                        entry,
                        src,
                        ngbr_index..=ngbr_index,
                        NgbrStatus::OnLink,
                    );
                    let pl = &mut self.edge[ngbr_index];
                    pl.sent_messages += 1;
                    if from_urgent {
                        pl.urgent.pop_front();
                    } else {
                        pl.norm.pop_front();
                    }
                    pl.norm.push_back(FairEntry {
                        src,
                        penalty: packets,
                    });
                    return msg_len;
                }
                trellis_link::SendStatus::Full | trellis_link::SendStatus::Drop => {
                    let pl = &mut self.edge[ngbr_index];
                    let front = if from_urgent {
                        pl.urgent.front_mut()
                    } else {
                        pl.norm.front_mut()
                    };
                    if let Some(f) = front {
                        f.penalty += 1;
                    }
                    return 0;
                }
            }
        }
    }

    /// Front of the sender's highest non-empty priority queue toward a
    /// neighbor, discarding entries whose state moved on.
    fn pick_highest(&mut self, ngbr_index: usize, src: NodeId) -> Option<MsgKey> {
        for prio in (1..=MAX_PRIORITY as usize).rev() {
            loop {
                let Some(&key) = self.edge[ngbr_index].pq[src.index()][prio].front() else {
                    break;
                };
                let live = self.belly[src.index()]
                    .get(&key)
                    .map(|e| e.ns[ngbr_index] == NgbrStatus::Need)
                    .unwrap_or(false);
                if live {
                    return Some(key);
                }
                self.edge[ngbr_index].pq[src.index()][prio].pop_front();
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    /// Drop every expired belly entry. Runs on the configured period.
    pub fn garbage_collect(&mut self, now: WallTime) -> usize {
        let mut collected = 0;
        for src in 1..=self.node_count {
            let src = NodeId(src);
            let keys: Vec<MsgKey> = self.belly[src.index()]
                .iter()
                .filter(|(_, e)| e.expire <= now)
                .map(|(k, _)| *k)
                .collect();
            for key in keys {
                if let Some(mut entry) = self.belly[src.index()].remove(&key) {
                    Self::cleanup_entry(
                        &mut self.edge,
                        &mut entry,
                        src,
                        1..=self.degree,
                        NgbrStatus::Expired,
                    );
                    collected += 1;
                }
            }
        }
        collected
    }

    pub fn gc_period(&self) -> std::time::Duration {
        self.cfg.garbage_collection
    }
}

/// The signed portion of a message with its mutable TTL zeroed: everything
/// up to the signature.
fn signed_prefix(msg: &[u8]) -> Vec<u8> {
    let mut prefix = msg[..msg.len() - SIGNATURE_LEN].to_vec();
    prefix[OverlayHeader::TTL_OFFSET] = 0;
    prefix
}
