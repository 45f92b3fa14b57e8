//! The per-neighbor link engine.
//!
//! A `LinkSession` is a sans-io state machine: the daemon feeds it received
//! datagrams and deadline polls, and it returns datagrams to transmit plus a
//! queue of upward events. All reliability behavior lives here: the sliding
//! windows with their nonce digests, NACK recovery, the TCP-fair window,
//! ping/pong RTT estimation, loss tracking, the leaky bucket, the
//! dissemination resource queue, and the signed DH handshake.

use crate::bucket::TokenBucket;
use crate::fairness::TcpFairness;
use crate::loss::{LinkStatus, LossHistory};
use crate::reassembly::{self, Reassembler};
use crate::resources::{DissemId, ResourceQueue};
use crate::rtt::{DerivedTimeouts, RttEstimator};
use crate::window::{InCell, IncomingWindow, OutgoingWindow};
use bytes::Bytes;
use rand::RngCore;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use trellis_proto::config::{ConfigHash, LinkConfig};
use trellis_proto::constants::{
    FLOW_CTRL_KBPS, LINK_START_SEQ, MAX_PACKET_SIZE, MAX_PKTS_PER_MESSAGE, MAX_SEND_ON_LINK,
};
use trellis_proto::crypto::{LinkDh, LinkKeys, NodeIdentity, NodeVerifier};
use trellis_proto::ids::{Epoch, InterfaceId, NodeId};
use trellis_proto::wire::{
    DhHello, FragmentHeader, LinkPing, LinkTail, PacketHeader, PacketType, PingKind,
};

/// A raw datagram ready for the socket.
pub type Datagram = Vec<u8>;

/// Events surfaced to the daemon.
#[derive(Debug)]
pub enum LinkEvent {
    /// A complete message (overlay header onward), in order unless the
    /// unordered single-packet fast path fired.
    Deliver(Bytes),
    /// LIVE/LOSSY/DEAD transition; the reliable engine advertises these.
    StatusChanged(LinkStatus),
    /// The neighbor's incarnation changed; flood state toward it must be
    /// re-offered.
    PeerRestarted,
    /// Window slots or bucket tokens may have freed up; run the assignment
    /// loop.
    ResourcesAvailable,
    /// The outgoing window filled while session blocking is on.
    SessionsBlocked,
    /// The outgoing window has room again.
    SessionsUnblocked,
    /// Provably malformed traffic from the neighbor (log-only enforcement).
    NeighborMisbehaved(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    Full,
    Drop,
}

/// Retransmission budget shared by every link of the daemon.
#[derive(Debug)]
pub struct BurstBudget {
    count: u32,
    window_end: Instant,
    batch: u32,
    window: Duration,
}

impl BurstBudget {
    pub fn new(cfg: &LinkConfig, now: Instant) -> Self {
        let usec = cfg.send_batch_size as u64 * MAX_PACKET_SIZE as u64 * 8 * 1000 / FLOW_CTRL_KBPS;
        BurstBudget {
            count: 0,
            window_end: now,
            batch: cfg.send_batch_size,
            window: Duration::from_micros(usec),
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        if now >= self.window_end {
            self.count = 0;
            self.window_end = now + self.window;
        }
        if self.count < self.batch {
            self.count += 1;
            true
        } else {
            false
        }
    }

    fn next_window(&self) -> Instant {
        self.window_end
    }
}

struct PendingMessage {
    data: Bytes,
    next_frag: u8,
    total: u8,
    offset: usize,
}

#[derive(Default)]
struct CryptoState {
    /// 0 = none, 1 = local keypair generated, 2 = shared key computed.
    key_computed: u8,
    established: bool,
    dh: Option<LinkDh>,
    dh_pkt: Option<Datagram>,
    keys: Option<LinkKeys>,
}

/// Identity of one link endpoint pairing.
pub struct SessionParams {
    pub cfg: Arc<LinkConfig>,
    pub local_node: NodeId,
    pub peer_node: NodeId,
    pub local_iface: InterfaceId,
    pub remote_iface: InterfaceId,
    pub ctrl_link_id: u32,
    pub my_incarnation: Epoch,
    pub identity: Arc<NodeIdentity>,
    pub verifier: Arc<NodeVerifier>,
    pub config_hash: ConfigHash,
}

pub struct LinkSession {
    cfg: Arc<LinkConfig>,
    local_node: NodeId,
    peer_node: NodeId,
    local_iface: InterfaceId,
    remote_iface: InterfaceId,
    ctrl_link_id: u32,
    identity: Arc<NodeIdentity>,
    verifier: Arc<NodeVerifier>,
    config_hash: ConfigHash,

    my_incarnation: Epoch,
    ngbr_incarnation: Epoch,
    incarnation_response: Option<Instant>,

    outgoing: OutgoingWindow,
    incoming: IncomingWindow,
    pending: Option<PendingMessage>,
    reassembler: Reassembler,

    fairness: TcpFairness,
    rtt: RttEstimator,
    timeouts: DerivedTimeouts,
    loss: LossHistory,
    bucket: TokenBucket,
    resources: ResourceQueue,
    crypto: CryptoState,
    link_status: LinkStatus,

    incoming_msg_count: u32,
    pong_gate: Option<Instant>,

    ack_deadline: Option<Instant>,
    reliable_deadline: Option<Instant>,
    retransm_deadline: Option<Instant>,
    ping_deadline: Option<Instant>,
    dh_deadline: Option<Instant>,
    loss_deadline: Option<Instant>,

    events: VecDeque<LinkEvent>,
    rng: rand::rngs::StdRng,
}

impl LinkSession {
    pub fn new(params: SessionParams, now: Instant, rng: rand::rngs::StdRng) -> Self {
        let cfg = params.cfg;
        let rtt = RttEstimator::new(&cfg);
        let timeouts = DerivedTimeouts::from_estimate(&rtt, &cfg);
        LinkSession {
            local_node: params.local_node,
            peer_node: params.peer_node,
            local_iface: params.local_iface,
            remote_iface: params.remote_iface,
            ctrl_link_id: params.ctrl_link_id,
            identity: params.identity,
            verifier: params.verifier,
            config_hash: params.config_hash,
            my_incarnation: params.my_incarnation,
            ngbr_incarnation: Epoch(0),
            incarnation_response: None,
            outgoing: OutgoingWindow::new(LINK_START_SEQ),
            incoming: IncomingWindow::new(LINK_START_SEQ),
            pending: None,
            reassembler: Reassembler::new(),
            fairness: TcpFairness::new(cfg.tcp_fairness),
            loss: LossHistory::new(&cfg),
            bucket: TokenBucket::new(now),
            resources: ResourceQueue::default(),
            crypto: CryptoState::default(),
            // Under intrusion tolerance a link must prove itself alive
            // (pongs, then a clean loss rate) before routing trusts it.
            link_status: if cfg.intrusion_tolerance_mode {
                LinkStatus::Dead
            } else {
                LinkStatus::Live
            },
            incoming_msg_count: 0,
            pong_gate: None,
            ack_deadline: None,
            reliable_deadline: None,
            retransm_deadline: None,
            ping_deadline: None,
            dh_deadline: None,
            loss_deadline: None,
            events: VecDeque::new(),
            rtt,
            timeouts,
            cfg,
            rng,
        }
    }

    /// Arm the initial timers; with crypto on this also emits the first DH
    /// handshake packet.
    pub fn start(&mut self, now: Instant) -> Vec<Datagram> {
        let mut out = Vec::new();
        self.ack_deadline = Some(now + self.cfg.ack_timeout);
        if self.cfg.crypto {
            self.key_exchange(now, &mut out);
        } else {
            self.ping_deadline = Some(now + self.cfg.ping_timeout);
            self.loss_deadline = Some(now + self.cfg.loss_calc_time_trigger);
        }
        out
    }

    pub fn peer_node(&self) -> NodeId {
        self.peer_node
    }

    pub fn link_status(&self) -> LinkStatus {
        self.link_status
    }

    pub fn rtt_ms(&self) -> f64 {
        self.rtt.rtt_ms()
    }

    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    /// Room left in the outgoing window?
    pub fn full(&self) -> bool {
        self.outgoing.is_full() || self.pending.is_some()
    }

    fn body_budget(&self) -> usize {
        let seal = if self.cfg.crypto {
            LinkKeys::SEAL_OVERHEAD
        } else {
            0
        };
        MAX_PACKET_SIZE - PacketHeader::WIRE_LEN - seal
    }

    /// Data-region budget of one packet, leaving room for the tail and at
    /// least one NACK entry.
    fn max_data_len(&self) -> usize {
        self.body_budget() - LinkTail::BASE_LEN - 8
    }

    fn max_frag_payload(&self) -> usize {
        self.max_data_len() - FragmentHeader::WIRE_LEN
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Enqueue one message for the peer. `body` is the overlay message
    /// starting at its overlay header; it is fragmented across packets and
    /// transmitted as congestion control allows.
    pub fn send(&mut self, body: Bytes, now: Instant) -> (SendStatus, Vec<Datagram>) {
        if self.full() {
            return (SendStatus::Full, Vec::new());
        }
        let frag_count = body.len().div_ceil(self.max_frag_payload()).max(1);
        if frag_count > MAX_PKTS_PER_MESSAGE {
            warn!(len = body.len(), "message exceeds fragmentation budget");
            return (SendStatus::Drop, Vec::new());
        }

        self.pending = Some(PendingMessage {
            data: body,
            next_frag: 1,
            total: frag_count as u8,
            offset: 0,
        });
        self.pack_fragments(now);

        if self.cfg.session_blocking && self.outgoing.is_full() {
            self.events.push_back(LinkEvent::SessionsBlocked);
        }

        let out = self.push_tcp_window(now);
        (SendStatus::Ok, out)
    }

    /// Pack fragments of the pending message into free window slots.
    fn pack_fragments(&mut self, now: Instant) {
        while !self.outgoing.is_full() {
            let Some(pending) = &mut self.pending else {
                return;
            };
            let max_data_len = {
                let seal = if self.cfg.crypto {
                    LinkKeys::SEAL_OVERHEAD
                } else {
                    0
                };
                MAX_PACKET_SIZE - PacketHeader::WIRE_LEN - seal - LinkTail::BASE_LEN - 8
            };
            let max_payload = max_data_len - FragmentHeader::WIRE_LEN;

            let mut data = Vec::with_capacity(max_data_len);
            let first_frag_idx = pending.next_frag;
            while pending.next_frag <= pending.total {
                let remaining = pending.data.len() - pending.offset;
                let chunk = remaining.min(max_payload);
                if data.len() + chunk + FragmentHeader::WIRE_LEN > max_data_len {
                    break;
                }
                reassembly::pack_fragment(
                    &mut data,
                    &pending.data[pending.offset..pending.offset + chunk],
                    pending.next_frag,
                    pending.total,
                );
                pending.offset += chunk;
                pending.next_frag += 1;
            }

            let nonce = (self.rng.next_u32() as u64) << 32 | self.rng.next_u32() as u64;
            self.outgoing
                .push(data, first_frag_idx, nonce, now + self.timeouts.initial_nack);

            if self.loss.count_unique() {
                self.loss_deadline = Some(now);
            }

            let done = self
                .pending
                .as_ref()
                .map(|p| p.next_frag > p.total)
                .unwrap_or(true);
            if done {
                self.pending = None;
                return;
            }
        }
    }

    /// Transmit every packet newly admitted by the congestion window.
    fn push_tcp_window(&mut self, now: Instant) -> Vec<Datagram> {
        let mut out = Vec::new();
        let limit = self
            .outgoing
            .head_seq
            .min(self.outgoing.tail_seq + self.fairness.usable());
        while self.outgoing.tcp_head_seq < limit {
            let seq = self.outgoing.tcp_head_seq;
            if let Some(slot) = self.outgoing.slot_mut(seq) {
                slot.timestamp = now + self.timeouts.initial_nack;
            }
            self.outgoing.tcp_head_seq += 1;
            if let Some(dg) = self.send_data_msg(seq, now) {
                out.push(dg);
            }
        }
        out
    }

    /// Build and seal the packet holding `seq`, with a fresh tail and any
    /// NACKs that fit.
    fn send_data_msg(&mut self, seq: u64, now: Instant) -> Option<Datagram> {
        let data_len = self.outgoing.slot(seq)?.data.len();
        let nonce = self.outgoing.slot(seq)?.nonce;

        let nack_budget = self.body_budget() - data_len - LinkTail::BASE_LEN;
        let nacks = self.collect_nacks(nack_budget / 8, now);
        let had_nacks = !nacks.is_empty();

        let tail = LinkTail {
            link_seq: trellis_proto::ids::LinkSeq(seq),
            seq_nonce: nonce,
            aru: self.incoming.aru(),
            aru_nonce: self.incoming.aru_nonce_digest,
            incarnation: self.my_incarnation,
            aru_incarnation: self.ngbr_incarnation,
            nacks,
        };

        let header = PacketHeader {
            ptype: PacketType::LinkData,
            sender: self.local_node,
            ctrl_link_id: self.ctrl_link_id,
            data_len: data_len as u16,
            ack_len: tail.wire_len() as u16,
            seq_no: 0,
        };

        let mut body = Vec::with_capacity(data_len + tail.wire_len());
        body.extend_from_slice(&self.outgoing.slot(seq)?.data);
        tail.encode(&mut body);

        let dg = self.seal(&header, &body)?;

        if had_nacks {
            self.incoming_msg_count = 0;
            self.ack_deadline = Some(now + self.cfg.ack_timeout);
        }
        self.reliable_deadline = Some(now + self.timeouts.reliable);
        Some(dg)
    }

    fn send_ack(&mut self, now: Instant) -> Option<Datagram> {
        let nack_budget = (self.body_budget() - LinkTail::BASE_LEN) / 8;
        let tail = LinkTail {
            link_seq: trellis_proto::ids::LinkSeq(0),
            seq_nonce: 0,
            aru: self.incoming.aru(),
            aru_nonce: self.incoming.aru_nonce_digest,
            incarnation: self.my_incarnation,
            aru_incarnation: self.ngbr_incarnation,
            nacks: self.collect_nacks(nack_budget, now),
        };
        let header = PacketHeader {
            ptype: PacketType::LinkAck,
            sender: self.local_node,
            ctrl_link_id: self.ctrl_link_id,
            data_len: 0,
            ack_len: tail.wire_len() as u16,
            seq_no: 0,
        };
        let mut body = Vec::with_capacity(tail.wire_len());
        tail.encode(&mut body);
        self.seal(&header, &body)
    }

    /// Gather expired NACK cells into an outgoing tail, restamping their
    /// next eligibility.
    fn collect_nacks(&mut self, max: usize, now: Instant) -> SmallVec<[u64; 8]> {
        let mut nacks = SmallVec::new();
        for seq in self.incoming.tail_seq..self.incoming.head_seq {
            if nacks.len() >= max {
                break;
            }
            if let InCell::Nack { expire } = self.incoming.cell(seq) {
                if *expire <= now {
                    nacks.push(seq);
                    *self.incoming.cell_mut(seq) = InCell::Nack {
                        expire: now + self.timeouts.nack,
                    };
                }
            }
        }
        nacks
    }

    fn seal(&mut self, header: &PacketHeader, body: &[u8]) -> Option<Datagram> {
        let mut header_bytes = Vec::with_capacity(PacketHeader::WIRE_LEN);
        header.encode(&mut header_bytes);
        if self.cfg.crypto {
            if self.crypto.key_computed != 2 {
                trace!("no DH key yet, dropping outbound packet");
                return None;
            }
            let keys = self.crypto.keys.as_ref()?;
            Some(keys.seal(&header_bytes, body, self.cfg.encrypt, &mut self.rng))
        } else {
            header_bytes.extend_from_slice(body);
            Some(header_bytes)
        }
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Entry point for a datagram from the socket.
    pub fn handle_datagram(
        &mut self,
        raw: &[u8],
        now: Instant,
        burst: &mut BurstBudget,
    ) -> Vec<Datagram> {
        let mut out = Vec::new();
        if raw.len() < PacketHeader::WIRE_LEN {
            return out;
        }
        let header = match PacketHeader::decode(&mut &raw[..PacketHeader::WIRE_LEN]) {
            Ok(h) => h,
            Err(err) => {
                trace!(%err, "undecodable packet header");
                return out;
            }
        };
        let header_bytes = &raw[..PacketHeader::WIRE_LEN];
        let sealed_body = &raw[PacketHeader::WIRE_LEN..];

        let body: Vec<u8>;
        if self.cfg.crypto {
            if self.crypto.key_computed == 2 {
                let keys = self.crypto.keys.as_ref().expect("keys exist at state 2");
                match keys.unseal(header_bytes, sealed_body, self.cfg.encrypt) {
                    Ok(plain) => {
                        self.dh_established(now);
                        body = plain;
                    }
                    Err(_) => {
                        if header.ptype == PacketType::DiffieHellman {
                            self.process_dh(&header, sealed_body, now, &mut out);
                        } else {
                            debug!("dropping unauthenticated packet");
                        }
                        return out;
                    }
                }
            } else if header.ptype == PacketType::DiffieHellman {
                self.process_dh(&header, sealed_body, now, &mut out);
                return out;
            } else {
                debug!("dropping packet before key establishment");
                return out;
            }
        } else {
            body = sealed_body.to_vec();
        }

        match header.ptype {
            PacketType::LinkData | PacketType::LinkAck => {
                self.process_data_or_ack(&header, &body, now, burst, &mut out)
            }
            PacketType::LinkPing => self.process_ping(&header, &body, now, &mut out),
            PacketType::DiffieHellman => {
                // Crypto off: handshake traffic is meaningless.
                debug!("DH packet on a non-crypto link, dropping");
            }
        }
        out
    }

    fn process_data_or_ack(
        &mut self,
        header: &PacketHeader,
        body: &[u8],
        now: Instant,
        burst: &mut BurstBudget,
        out: &mut Vec<Datagram>,
    ) {
        let data_len = header.data_len as usize;
        let ack_len = header.ack_len as usize;
        if body.len() < data_len + ack_len {
            debug!("packet shorter than its declared lengths");
            return;
        }
        let tail = match LinkTail::decode(&body[data_len..data_len + ack_len], ack_len) {
            Ok(tail) => tail,
            Err(err) => {
                debug!(%err, "undecodable link tail");
                return;
            }
        };

        if tail.incarnation != self.ngbr_incarnation {
            debug!(
                theirs = tail.incarnation.0,
                stored = self.ngbr_incarnation.0,
                "neighbor incarnation mismatch"
            );
            return;
        }
        if tail.aru_incarnation != self.my_incarnation {
            debug!("peer's view of our incarnation is stale");
            return;
        }

        self.process_it_ack(&body[..data_len], &tail, now, burst, out);
    }

    /// The combined ack/data path: validate the advertised ARU against our
    /// nonce digest, absorb NACKs, then store and drain a data packet.
    fn process_it_ack(
        &mut self,
        data: &[u8],
        tail: &LinkTail,
        now: Instant,
        burst: &mut BurstBudget,
        out: &mut Vec<Datagram>,
    ) {
        // (1) Advertised cumulative ack.
        if self.outgoing.tail_seq <= tail.aru && tail.aru < self.outgoing.tcp_head_seq {
            if tail.aru_nonce != self.outgoing.digest_at(tail.aru) {
                debug!(aru = tail.aru, "aru nonce digest mismatch, ignoring ack");
                return;
            }
            let was_full = self.outgoing.is_full();
            self.fairness.maybe_resolve_loss(tail.aru);
            let released = self.outgoing.release_through(tail.aru);
            for _ in 0..released {
                self.fairness.on_ack();
            }
            out.extend(self.push_tcp_window(now));
            self.pack_fragments(now);
            if !self.outgoing.is_full() {
                if self.cfg.session_blocking && was_full {
                    self.events.push_back(LinkEvent::SessionsUnblocked);
                }
                if !self.resources.is_empty() {
                    self.events.push_back(LinkEvent::ResourcesAvailable);
                }
            }
        }

        // (2) NACK requests.
        if !tail.nacks.is_empty() {
            for &nack_seq in &tail.nacks {
                if nack_seq >= self.outgoing.tail_seq && nack_seq < self.outgoing.tcp_head_seq {
                    if let Some(slot) = self.outgoing.slot_mut(nack_seq) {
                        slot.nacked = true;
                    }
                }
            }
            self.fairness.on_nack(tail.aru);
            self.handle_retransmissions(now, burst, out);
        }

        // (3) Data packet payload.
        if tail.link_seq.0 == 0 {
            return;
        }
        let link_seq = tail.link_seq.0;

        self.incoming_msg_count += 1;
        if self.incoming_msg_count >= self.cfg.msg_per_saa {
            if let Some(dg) = self.send_ack(now) {
                out.push(dg);
            }
            self.incoming_msg_count = 0;
            self.ack_deadline = Some(now + self.cfg.ack_timeout);
        }

        if link_seq < self.incoming.tail_seq {
            return;
        }
        if !self.incoming.in_window(link_seq) {
            warn!(
                link_seq,
                tail = self.incoming.tail_seq,
                "link sequence beyond the receive window"
            );
            return;
        }
        if matches!(self.incoming.cell(link_seq), InCell::Recvd { .. }) {
            return;
        }

        // Record the packet and stamp NACK cells over any fresh gap.
        for gap in self.incoming.head_seq..link_seq {
            if matches!(self.incoming.cell(gap), InCell::Empty) {
                *self.incoming.cell_mut(gap) = InCell::Nack {
                    expire: now + self.timeouts.initial_nack,
                };
            }
        }
        if link_seq >= self.incoming.head_seq {
            self.incoming.head_seq = link_seq + 1;
        }
        *self.incoming.cell_mut(link_seq) = InCell::Recvd {
            data: data.to_vec(),
            nonce: tail.seq_nonce,
        };

        // Unordered fast path for whole single-packet messages.
        if !self.cfg.ordered_delivery && reassembly::is_single_packet_message(data) {
            let mut lone = Reassembler::new();
            match lone.absorb(data) {
                Ok(Some(msg)) => self.events.push_back(LinkEvent::Deliver(msg)),
                Ok(None) => warn!("single-packet message did not complete"),
                Err(reason) => {
                    self.events.push_back(LinkEvent::NeighborMisbehaved(reason));
                    return;
                }
            }
        }

        // Drain in order from the tail.
        while let InCell::Recvd { .. } = self.incoming.cell(self.incoming.tail_seq) {
            let seq = self.incoming.tail_seq;
            let cell = std::mem::take(self.incoming.cell_mut(seq));
            let InCell::Recvd { data, nonce } = cell else {
                unreachable!()
            };
            self.incoming.aru_nonce_digest ^= nonce;
            self.incoming.tail_seq += 1;

            if self.cfg.ordered_delivery || !reassembly::is_single_packet_message(&data) {
                match self.reassembler.absorb(&data) {
                    Ok(Some(msg)) => self.events.push_back(LinkEvent::Deliver(msg)),
                    Ok(None) => {}
                    Err(reason) => {
                        self.events.push_back(LinkEvent::NeighborMisbehaved(reason));
                    }
                }
            }
        }
    }

    /// Retransmit NACKed slots whose timestamps are due, within the shared
    /// burst budget.
    fn handle_retransmissions(
        &mut self,
        now: Instant,
        burst: &mut BurstBudget,
        out: &mut Vec<Datagram>,
    ) {
        self.retransm_deadline = None;
        let mut seq = self.outgoing.tail_seq;
        while seq < self.outgoing.tcp_head_seq {
            let due = match self.outgoing.slot(seq) {
                Some(slot) => slot.nacked && slot.timestamp <= now,
                None => false,
            };
            if due {
                if !burst.try_take(now) {
                    self.retransm_deadline = Some(burst.next_window());
                    return;
                }
                if let Some(slot) = self.outgoing.slot_mut(seq) {
                    slot.resent = true;
                    slot.nacked = false;
                    slot.timestamp = now + self.timeouts.nack;
                }
                if let Some(dg) = self.send_data_msg(seq, now) {
                    out.push(dg);
                }
                self.loss.count_retransmission();
            }
            seq += 1;
        }
    }

    // ------------------------------------------------------------------
    // Ping / pong
    // ------------------------------------------------------------------

    fn process_ping(
        &mut self,
        header: &PacketHeader,
        body: &[u8],
        now: Instant,
        out: &mut Vec<Datagram>,
    ) {
        if header.data_len as usize != LinkPing::WIRE_LEN || body.len() < LinkPing::WIRE_LEN {
            debug!("invalid ping size");
            return;
        }
        let ping = match LinkPing::decode(&mut &body[..LinkPing::WIRE_LEN]) {
            Ok(p) => p,
            Err(_) => return,
        };

        // Cheap pre-checks before touching incarnations.
        if ping.kind == PingKind::Pong
            && (ping.seq >= self.rtt.next_ping_seq
                || ping.seq + trellis_proto::constants::MAX_PING_HIST < self.rtt.next_ping_seq)
        {
            return;
        }
        if ping.kind == PingKind::Ping {
            if let Some(gate) = self.pong_gate {
                if gate > now {
                    return;
                }
            }
        }

        if ping.incarnation < self.ngbr_incarnation {
            return;
        }
        if ping.incarnation > self.ngbr_incarnation {
            if let Some(resp) = self.incarnation_response {
                if resp > now {
                    return;
                }
            }
            self.incarnation_change(ping.incarnation, now);
            self.reliable_deadline = Some(now);
        }
        if ping.aru_incarnation > self.my_incarnation {
            warn!("peer claims a future incarnation for us");
            return;
        }

        match ping.kind {
            PingKind::Ping => {
                let pong = LinkPing {
                    kind: PingKind::Pong,
                    seq: ping.seq,
                    nonce: ping.nonce,
                    incarnation: self.my_incarnation,
                    aru_incarnation: self.ngbr_incarnation,
                };
                self.pong_gate = Some(now + self.cfg.ping_timeout / 2);
                if let Some(dg) = self.build_ping_packet(&pong) {
                    out.push(dg);
                }
            }
            PingKind::Pong => {
                if let Some(sent) = self.rtt.accept_pong(ping.seq, ping.nonce) {
                    self.rtt.update(now.saturating_duration_since(sent));
                    self.timeouts = DerivedTimeouts::from_estimate(&self.rtt, &self.cfg);
                    if ping.seq > self.rtt.last_pong_seq_recv {
                        self.rtt.last_pong_seq_recv = ping.seq;
                        if self.cfg.intrusion_tolerance_mode
                            && self.link_status == LinkStatus::Dead
                        {
                            // A recovering link is first considered lossy; the
                            // loss calculator may promote it later.
                            self.link_status = LinkStatus::Lossy;
                            self.events
                                .push_back(LinkEvent::StatusChanged(LinkStatus::Lossy));
                        }
                    }
                }
            }
        }
    }

    fn build_ping_packet(&mut self, ping: &LinkPing) -> Option<Datagram> {
        let header = PacketHeader {
            ptype: PacketType::LinkPing,
            sender: self.local_node,
            ctrl_link_id: self.ctrl_link_id,
            data_len: LinkPing::WIRE_LEN as u16,
            ack_len: 0,
            seq_no: 0,
        };
        let mut body = Vec::with_capacity(LinkPing::WIRE_LEN);
        ping.encode(&mut body);
        self.seal(&header, &body)
    }

    fn fire_ping(&mut self, now: Instant, out: &mut Vec<Datagram>) {
        if self.cfg.crypto && self.crypto.key_computed != 2 {
            return;
        }
        let seq = self.rtt.next_ping_seq;
        let nonce = (self.rng.next_u32() as u64) << 32 | self.rng.next_u32() as u64;
        if self.rtt.record_ping(seq, nonce, now) {
            self.loss.count_retransmission();
        }
        self.rtt.next_ping_seq += 1;

        let ping = LinkPing {
            kind: PingKind::Ping,
            seq,
            nonce,
            incarnation: self.my_incarnation,
            aru_incarnation: self.ngbr_incarnation,
        };
        if let Some(dg) = self.build_ping_packet(&ping) {
            out.push(dg);
        }
        if self.loss.count_unique() {
            self.loss_deadline = Some(now);
        }

        if self.cfg.intrusion_tolerance_mode
            && self.link_status != LinkStatus::Dead
            && self.rtt.next_ping_seq > self.rtt.last_pong_seq_recv + self.cfg.ping_threshold
        {
            self.link_status = LinkStatus::Dead;
            self.events
                .push_back(LinkEvent::StatusChanged(LinkStatus::Dead));
        }
    }

    // ------------------------------------------------------------------
    // Diffie-Hellman handshake
    // ------------------------------------------------------------------

    /// Generate (or regenerate) our half of the exchange and queue the
    /// signed hello for repeated transmission.
    pub fn key_exchange(&mut self, now: Instant, out: &mut Vec<Datagram>) {
        let dh = LinkDh::generate(&mut self.rng);

        self.crypto.established = false;
        self.crypto.key_computed = 1;
        self.crypto.dh_pkt = None;
        self.ping_deadline = None;

        let header = PacketHeader {
            ptype: PacketType::DiffieHellman,
            sender: self.local_node,
            ctrl_link_id: self.ctrl_link_id,
            data_len: DhHello::WIRE_LEN as u16,
            ack_len: 0,
            seq_no: 0,
        };
        let mut header_bytes = Vec::with_capacity(PacketHeader::WIRE_LEN);
        header.encode(&mut header_bytes);

        let mut hello = DhHello {
            local_iface: self.local_iface,
            remote_iface: self.remote_iface,
            incarnation: self.my_incarnation,
            aru_incarnation: self.ngbr_incarnation,
            public_key: dh.public(),
            config_hash: self.config_hash.0,
            signature: [0u8; 64],
        };
        let mut body = Vec::with_capacity(DhHello::WIRE_LEN);
        hello.encode(&mut body);
        let signature = self
            .identity
            .sign_parts(&[&header_bytes, &body[..DhHello::SIGNED_LEN]]);
        hello.signature = signature;

        let mut pkt = header_bytes;
        body.clear();
        hello.encode(&mut body);
        pkt.extend_from_slice(&body);

        self.crypto.dh = Some(dh);
        self.crypto.dh_pkt = Some(pkt.clone());
        out.push(pkt);
        self.dh_deadline = Some(now + self.cfg.dh_timeout);
    }

    fn process_dh(
        &mut self,
        header: &PacketHeader,
        body: &[u8],
        now: Instant,
        out: &mut Vec<Datagram>,
    ) {
        if !self.cfg.crypto {
            return;
        }
        if let Some(resp) = self.incarnation_response {
            if resp > now {
                debug!("DH ignored: incarnation response has not timed out");
                return;
            }
        }
        let hello = match DhHello::decode(&mut &body[..]) {
            Ok(h) => h,
            Err(err) => {
                debug!(%err, "undecodable DH hello");
                return;
            }
        };
        if hello.local_iface != self.remote_iface || hello.remote_iface != self.local_iface {
            debug!("DH hello for the wrong leg");
            return;
        }
        if hello.incarnation <= self.ngbr_incarnation {
            debug!(
                theirs = hello.incarnation.0,
                stored = self.ngbr_incarnation.0,
                "DH hello with stale incarnation"
            );
            return;
        }
        if hello.aru_incarnation > self.my_incarnation {
            debug!("DH hello claims a future incarnation for us");
            return;
        }
        if hello.config_hash != self.config_hash.0 {
            warn!("configuration hash mismatch, refusing to pair");
            return;
        }

        // Signature covers the header with seq_no zeroed plus the body's
        // signed prefix.
        let mut zeroed = *header;
        zeroed.seq_no = 0;
        let mut header_bytes = Vec::with_capacity(PacketHeader::WIRE_LEN);
        zeroed.encode(&mut header_bytes);
        if self
            .verifier
            .verify_parts(
                self.peer_node,
                &[&header_bytes, &body[..DhHello::SIGNED_LEN]],
                &hello.signature,
            )
            .is_err()
        {
            warn!(peer = %self.peer_node, "DH hello signature failed to verify");
            return;
        }

        if self.crypto.key_computed != 1 {
            // Fresh exchange from our side too.
            self.key_exchange(now, out);
        }

        let dh = self.crypto.dh.as_ref().expect("keypair exists after exchange");
        self.crypto.keys = Some(dh.derive(&hello.public_key));
        self.crypto.key_computed = 2;

        self.ping_deadline = Some(now + self.cfg.ping_timeout);
        self.loss_deadline = Some(now + self.cfg.loss_calc_time_trigger);

        self.incarnation_change(hello.incarnation, now);
    }

    /// First authentic traffic under the new key finishes the handshake.
    fn dh_established(&mut self, now: Instant) {
        if self.cfg.crypto && !self.crypto.established {
            self.crypto.established = true;
            self.crypto.dh_pkt = None;
            self.dh_deadline = None;
            self.reliable_deadline = Some(now);
        }
    }

    // ------------------------------------------------------------------
    // Incarnation change
    // ------------------------------------------------------------------

    fn incarnation_change(&mut self, new_inc: Epoch, now: Instant) {
        debug!(peer = %self.peer_node, incarnation = new_inc.0, "neighbor incarnation change");
        self.incarnation_response = Some(now + self.cfg.incarnation_timeout);
        self.ngbr_incarnation = new_inc;

        self.incoming.clear(LINK_START_SEQ);
        self.reassembler.reset();

        if !self.cfg.reintroduce_messages {
            self.outgoing.clear(LINK_START_SEQ);
            self.pending = None;
        } else {
            // Drop partially-sent messages up to the next message boundary,
            // then repack the surviving whole messages with fresh nonces.
            let mut slots = self.outgoing.drain_in_order();
            let skip = slots
                .iter()
                .take_while(|slot| slot.first_frag_idx != 1)
                .count();
            slots.drain(..skip);
            self.outgoing.clear(LINK_START_SEQ);
            for slot in slots {
                let nonce = (self.rng.next_u32() as u64) << 32 | self.rng.next_u32() as u64;
                self.outgoing.push(
                    slot.data,
                    slot.first_frag_idx,
                    nonce,
                    now + self.timeouts.initial_nack,
                );
            }
            self.outgoing.tcp_head_seq =
                (LINK_START_SEQ + 1).min(self.outgoing.head_seq);
            self.pack_fragments(now);
        }

        self.fairness.reset();
        self.events.push_back(LinkEvent::PeerRestarted);
        self.events.push_back(LinkEvent::ResourcesAvailable);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Fire every due timer. The daemon calls this at (or after) the instant
    /// returned by [`next_wakeup`](Self::next_wakeup).
    pub fn poll(&mut self, now: Instant, burst: &mut BurstBudget) -> Vec<Datagram> {
        let mut out = Vec::new();

        self.bucket.refill(now);
        if self.resources.needed_tokens && self.bucket.tokens() > 0 {
            self.resources.needed_tokens = false;
            self.events.push_back(LinkEvent::ResourcesAvailable);
        }

        if due(self.ack_deadline, now) {
            if self.incoming_msg_count == 0 {
                // Nothing arrived since the last ack: prime the counter so
                // the next arrival acks immediately, and stop the timer.
                self.incoming_msg_count = self.cfg.msg_per_saa.saturating_sub(1);
                self.ack_deadline = None;
            } else {
                if let Some(dg) = self.send_ack(now) {
                    out.push(dg);
                }
                self.incoming_msg_count = 0;
                self.ack_deadline = Some(now + self.cfg.ack_timeout);
            }
        }

        if due(self.reliable_deadline, now) {
            if self.outgoing.tcp_head_seq > self.outgoing.tail_seq {
                let seq = self.outgoing.tcp_head_seq - 1;
                if let Some(slot) = self.outgoing.slot_mut(seq) {
                    slot.resent = true;
                    slot.timestamp = now + self.timeouts.nack;
                }
                if let Some(dg) = self.send_data_msg(seq, now) {
                    out.push(dg);
                }
                self.reliable_deadline = Some(now + self.timeouts.reliable);
            } else {
                self.reliable_deadline = None;
            }
        }

        if due(self.retransm_deadline, now) {
            self.handle_retransmissions(now, burst, &mut out);
        }

        if due(self.ping_deadline, now) {
            self.fire_ping(now, &mut out);
            self.ping_deadline = Some(now + self.cfg.ping_timeout);
        }

        if due(self.dh_deadline, now) {
            if !self.crypto.established {
                if let Some(pkt) = &self.crypto.dh_pkt {
                    out.push(pkt.clone());
                }
                self.dh_deadline = Some(now + self.cfg.dh_timeout);
            } else {
                self.dh_deadline = None;
            }
        }

        if due(self.loss_deadline, now) {
            let rate = self.loss.recalculate();
            if self.cfg.intrusion_tolerance_mode {
                if self.link_status == LinkStatus::Lossy && rate < self.cfg.loss_threshold {
                    self.link_status = LinkStatus::Live;
                    self.events
                        .push_back(LinkEvent::StatusChanged(LinkStatus::Live));
                } else if self.link_status == LinkStatus::Live && rate >= self.cfg.loss_threshold {
                    self.link_status = LinkStatus::Lossy;
                    self.events
                        .push_back(LinkEvent::StatusChanged(LinkStatus::Lossy));
                }
            }
            self.loss_deadline = Some(now + self.cfg.loss_calc_time_trigger);
        }

        out
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        for deadline in [
            self.ack_deadline,
            self.reliable_deadline,
            self.retransm_deadline,
            self.ping_deadline,
            self.dh_deadline,
            self.loss_deadline,
        ] {
            next = match (next, deadline) {
                (None, d) => d,
                (n, None) => n,
                (Some(a), Some(b)) => Some(a.min(b)),
            };
        }
        if self.resources.needed_tokens {
            if let Some(fill) = self.bucket.next_fill() {
                next = Some(next.map_or(fill, |n| n.min(fill)));
            }
        }
        next
    }

    // ------------------------------------------------------------------
    // Dissemination resource scheduling
    // ------------------------------------------------------------------

    /// A dissemination engine registers its intent to send toward this
    /// neighbor; duplicate registrations are no-ops.
    pub fn request_resources(&mut self, dissem: DissemId) {
        self.resources.request(dissem);
    }

    /// Offer the next queued engine a slot, if the window and bucket allow.
    pub fn begin_assign(&mut self, now: Instant) -> Option<DissemId> {
        self.bucket.refill(now);
        if self.full() || self.bucket.tokens() == 0 {
            if !self.resources.is_empty() {
                self.resources.needed_tokens = true;
            }
            return None;
        }
        self.resources.pop()
    }

    /// Report the outcome of an assignment: bytes handed to `send`, and
    /// whether the engine still has more queued toward this neighbor.
    pub fn finish_assign(&mut self, dissem: DissemId, bytes_sent: usize, more: bool) {
        self.bucket.spend(bytes_sent as u64);
        if more {
            self.resources.requeue(dissem);
        }
    }

    /// Invariant check used by tests: the three sequence cursors stay
    /// ordered and within one window of each other.
    pub fn window_invariant_holds(&self) -> bool {
        self.outgoing.tail_seq <= self.outgoing.tcp_head_seq
            && self.outgoing.tcp_head_seq <= self.outgoing.head_seq
            && self.outgoing.head_seq <= self.outgoing.tail_seq + MAX_SEND_ON_LINK
    }

    #[doc(hidden)]
    pub fn window_cursors(&self) -> (u64, u64, u64) {
        (
            self.outgoing.tail_seq,
            self.outgoing.tcp_head_seq,
            self.outgoing.head_seq,
        )
    }
}

fn due(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|d| d <= now)
}
