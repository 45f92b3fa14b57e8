//! The single-threaded daemon: one UDP socket, a mio poll loop, the timer
//! wheel, and the wiring between link sessions and the dissemination
//! engines. Every handler runs to completion; the only blocking point is
//! the poll call itself, bounded by the earliest timer deadline.

use crate::timers::{TimerFn, TimerWheel};
use bytes::Bytes;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use trellis_flood::{Network, PriorityFlood, RelEvent, ReliableFlood, WallTime};
use trellis_link::{BurstBudget, Datagram, DissemId, LinkEvent, LinkSession, SessionParams};
use trellis_proto::config::{ConfigHash, LinkConfig, PrioConfig, RelConfig};
use trellis_proto::crypto::{NodeIdentity, NodeVerifier};
use trellis_proto::ids::{Epoch, InterfaceId, NodeId};
use trellis_proto::wire::{OverlayHeader, Routing};

const SOCKET: Token = Token(0);

pub struct DaemonConfig {
    pub my_id: NodeId,
    pub node_count: u16,
    pub bind: SocketAddr,
    pub peers: HashMap<NodeId, SocketAddr>,
    pub edges: Vec<(NodeId, NodeId, i16)>,
    pub link: LinkConfig,
    pub prio: PrioConfig,
    pub rel: RelConfig,
    pub identity: NodeIdentity,
    pub verifier: NodeVerifier,
}

pub struct Daemon {
    my_id: NodeId,
    socket: UdpSocket,
    poll: Poll,
    net: Network,
    prio: PriorityFlood,
    rel: ReliableFlood,
    /// Link sessions indexed by neighbor index (1-based, slot 0 unused).
    links: Vec<Option<LinkSession>>,
    peer_addrs: Vec<SocketAddr>,
    addr_to_index: HashMap<SocketAddr, usize>,
    wheel: TimerWheel,
    burst: BurstBudget,
    identity: Arc<NodeIdentity>,
    verifier_handle: Arc<NodeVerifier>,
    prio_cfg: PrioConfig,
    delivered: u64,
}

impl Daemon {
    pub fn new(cfg: DaemonConfig) -> std::io::Result<Self> {
        let now = Instant::now();
        let wall = wall_now();
        let net = Network::new(cfg.node_count, cfg.my_id, &cfg.edges);

        let link_cfg = Arc::new(cfg.link);
        let identity = Arc::new(cfg.identity);
        let verifier = Arc::new(cfg.verifier);
        let hash = ConfigHash::compute(&link_cfg, &cfg.prio, &cfg.rel, &net.canonical_bytes());
        let my_incarnation = Epoch(wall.sec());

        let mut links: Vec<Option<LinkSession>> = Vec::with_capacity(net.my_degree() + 1);
        links.push(None);
        let mut peer_addrs = vec![cfg.bind];
        let mut addr_to_index = HashMap::new();
        let mut rng_seed = rand::random::<u64>();
        for idx in 1..=net.my_degree() {
            let peer = net.my_neighbor(idx);
            let addr = *cfg.peers.get(&peer).ok_or_else(|| {
                std::io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("no address configured for neighbor {peer}"),
                )
            })?;
            use rand::SeedableRng;
            rng_seed = rng_seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
            links.push(Some(LinkSession::new(
                SessionParams {
                    cfg: link_cfg.clone(),
                    local_node: cfg.my_id,
                    peer_node: peer,
                    local_iface: InterfaceId(cfg.my_id.0 as u32),
                    remote_iface: InterfaceId(peer.0 as u32),
                    ctrl_link_id: idx as u32,
                    my_incarnation,
                    identity: identity.clone(),
                    verifier: verifier.clone(),
                    config_hash: hash,
                },
                now,
                rand::rngs::StdRng::seed_from_u64(rng_seed),
            )));
            peer_addrs.push(addr);
            addr_to_index.insert(addr, idx);
        }

        let mut socket = UdpSocket::bind(cfg.bind)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET, Interest::READABLE)?;

        let prio = PriorityFlood::new(cfg.prio.clone(), &net, wall);
        let rel = ReliableFlood::new(cfg.rel, &net, link_cfg.loss_penalty, wall);
        let burst = BurstBudget::new(&link_cfg, now);

        Ok(Daemon {
            my_id: cfg.my_id,
            socket,
            poll,
            net,
            prio,
            rel,
            links,
            peer_addrs,
            addr_to_index,
            wheel: TimerWheel::new(),
            burst,
            identity,
            verifier_handle: verifier,
            prio_cfg: cfg.prio,
            delivered: 0,
        })
    }

    pub fn run(&mut self) -> std::io::Result<()> {
        info!(id = %self.my_id, "trellis daemon starting");
        let now = Instant::now();

        for idx in 1..=self.net.my_degree() {
            let out = self.links[idx].as_mut().expect("link exists").start(now);
            self.transmit(idx, out);
            self.reschedule_link(idx);
        }
        self.wheel
            .enqueue((TimerFn::PrioGc, 0), now + self.prio_cfg.garbage_collection);
        self.wheel.enqueue((TimerFn::RelPoll, 0), now);

        let mut events = Events::with_capacity(64);
        let mut buf = [0u8; 65536];

        loop {
            let timeout = self
                .wheel
                .next_deadline()
                .map(|at| at.saturating_duration_since(Instant::now()));
            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            for event in events.iter() {
                if event.token() == SOCKET {
                    loop {
                        match self.socket.recv_from(&mut buf) {
                            Ok((len, from)) => self.on_datagram(&buf[..len], from),
                            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                            Err(err) => {
                                warn!(%err, "socket receive error");
                                break;
                            }
                        }
                    }
                }
            }

            let now = Instant::now();
            while let Some((timer, key)) = self.wheel.pop_due(now) {
                self.on_timer(timer, key, now);
            }

            self.service_all(now);
        }
    }

    fn wall(&self) -> WallTime {
        wall_now()
    }

    fn transmit(&mut self, ngbr_index: usize, datagrams: Vec<Datagram>) {
        let addr = self.peer_addrs[ngbr_index];
        for dg in datagrams {
            if let Err(err) = self.socket.send_to(&dg, addr) {
                if err.kind() != ErrorKind::WouldBlock {
                    debug!(%err, %addr, "send failed");
                }
            }
        }
    }

    fn on_datagram(&mut self, raw: &[u8], from: SocketAddr) {
        let Some(&idx) = self.addr_to_index.get(&from) else {
            debug!(%from, "datagram from unknown source");
            return;
        };
        let now = Instant::now();
        let replies = {
            let link = self.links[idx].as_mut().expect("link exists");
            link.handle_datagram(raw, now, &mut self.burst)
        };
        self.transmit(idx, replies);
        self.drain_link_events(idx, now);
        self.reschedule_link(idx);
    }

    fn on_timer(&mut self, timer: TimerFn, key: u64, now: Instant) {
        match timer {
            TimerFn::LinkPoll => {
                let idx = key as usize;
                let out = {
                    let link = self.links[idx].as_mut().expect("link exists");
                    link.poll(now, &mut self.burst)
                };
                self.transmit(idx, out);
                self.drain_link_events(idx, now);
                self.reschedule_link(idx);
            }
            TimerFn::RelPoll => {
                let wall = self.wall();
                self.rel.poll(wall);
                self.reschedule_rel(now);
            }
            TimerFn::PrioGc => {
                let collected = self.prio.garbage_collect(self.wall());
                if collected > 0 {
                    debug!(collected, "priority garbage collection");
                }
                self.wheel
                    .enqueue((TimerFn::PrioGc, 0), now + self.prio_cfg.garbage_collection);
            }
        }
    }

    fn reschedule_link(&mut self, idx: usize) {
        if let Some(at) = self.links[idx].as_ref().expect("link exists").next_wakeup() {
            self.wheel.requeue((TimerFn::LinkPoll, idx as u64), at);
        } else {
            self.wheel.dequeue((TimerFn::LinkPoll, idx as u64));
        }
    }

    fn reschedule_rel(&mut self, now: Instant) {
        if let Some(at) = self.rel.next_wakeup() {
            let wall = self.wall();
            let delay = at.saturating_sub(wall);
            self.wheel.requeue((TimerFn::RelPoll, 0), now + delay);
        } else {
            self.wheel.dequeue((TimerFn::RelPoll, 0));
        }
    }

    fn drain_link_events(&mut self, idx: usize, now: Instant) {
        loop {
            let event = {
                let link = self.links[idx].as_mut().expect("link exists");
                link.poll_event()
            };
            let Some(event) = event else { break };
            match event {
                LinkEvent::Deliver(msg) => self.deliver(idx, msg, now),
                LinkEvent::StatusChanged(status) => {
                    let wall = self.wall();
                    let ngbr = self.net.my_neighbor(idx);
                    self.rel.generate_link_status_change(
                        ngbr,
                        status,
                        &mut self.net,
                        &self.identity,
                        wall,
                    );
                    self.reschedule_rel(now);
                }
                LinkEvent::PeerRestarted => {
                    self.rel.neighbor_transfer(idx, &self.net);
                    self.reschedule_rel(now);
                }
                LinkEvent::ResourcesAvailable => {
                    // Serviced by the main loop's service pass.
                }
                LinkEvent::SessionsBlocked => debug!(ngbr = idx, "link window full"),
                LinkEvent::SessionsUnblocked => debug!(ngbr = idx, "link window open"),
                LinkEvent::NeighborMisbehaved(reason) => {
                    warn!(ngbr = idx, reason, "misbehaving neighbor (log-only)");
                }
            }
        }
    }

    /// A complete message surfaced from a link: route to its engine, then
    /// surface engine deliveries and resumptions.
    fn deliver(&mut self, idx: usize, msg: Bytes, now: Instant) {
        let Ok(overlay) = OverlayHeader::decode(&mut &msg[..]) else {
            debug!("undecodable overlay header from link");
            return;
        };
        let from = self.net.my_neighbor(idx);
        let wall = self.wall();
        let verifier = self.rel_verifier();
        match overlay.routing {
            Routing::PriorityFlood => {
                self.prio
                    .disseminate(Some(from), msg, &mut self.net, &verifier, wall);
                while let Some(delivery) = self.prio.poll_delivery() {
                    self.delivered += 1;
                    info!(
                        total = self.delivered,
                        bytes = delivery.len(),
                        "priority delivery"
                    );
                }
            }
            Routing::ReliableFlood => {
                self.rel.disseminate(
                    Some(from),
                    msg,
                    &mut self.net,
                    &self.identity,
                    &verifier,
                    wall,
                );
                while let Some(delivery) = self.rel.poll_delivery() {
                    self.delivered += 1;
                    info!(
                        total = self.delivered,
                        bytes = delivery.len(),
                        "reliable delivery"
                    );
                }
                while let Some(RelEvent::ResumeSessions(dst)) = self.rel.poll_event() {
                    for session in self.rel.resume_sessions(dst) {
                        info!(session, %dst, "session resumed");
                    }
                }
                self.reschedule_rel(now);
            }
        }
    }

    fn rel_verifier(&self) -> Arc<NodeVerifier> {
        // The verifier lives inside every link session already; the engines
        // share the daemon's copy.
        self.verifier_handle.clone()
    }

    /// Offer link slots to the engines, in the links' fair-queue order.
    fn service_all(&mut self, now: Instant) {
        let wall = self.wall();
        for idx in 1..=self.net.my_degree() {
            if self.prio.has_pending(idx) {
                self.links[idx]
                    .as_mut()
                    .expect("link exists")
                    .request_resources(DissemId::PriorityFlood);
            }
            if self.rel.has_pending(idx) {
                self.links[idx]
                    .as_mut()
                    .expect("link exists")
                    .request_resources(DissemId::ReliableFlood);
            }

            loop {
                let Some(dissem) = self.links[idx]
                    .as_mut()
                    .expect("link exists")
                    .begin_assign(now)
                else {
                    break;
                };

                let mut outgoing: Vec<Datagram> = Vec::new();
                let bytes = {
                    let Daemon {
                        links,
                        prio,
                        rel,
                        net,
                        identity,
                        ..
                    } = self;
                    let link = links[idx].as_mut().expect("link exists");
                    let mut forward = |m: Bytes| {
                        let (status, dgs) = link.send(m, now);
                        outgoing.extend(dgs);
                        status
                    };
                    match dissem {
                        DissemId::PriorityFlood => prio.send_one(idx, wall, &mut forward),
                        DissemId::ReliableFlood => {
                            rel.send_one(idx, net, identity, wall, &mut forward)
                        }
                    }
                };
                self.transmit(idx, outgoing);

                let more = match dissem {
                    DissemId::PriorityFlood => self.prio.has_pending(idx),
                    DissemId::ReliableFlood => self.rel.has_pending(idx),
                };
                self.links[idx]
                    .as_mut()
                    .expect("link exists")
                    .finish_assign(dissem, bytes, more && bytes > 0);
                if bytes == 0 {
                    break;
                }
            }
            self.reschedule_link(idx);
        }
    }
}

fn wall_now() -> WallTime {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    WallTime(since_epoch.as_micros() as u64)
}
