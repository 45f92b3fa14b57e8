//! The two sliding-window rings of a link.
//!
//! Sequence numbers index the rings modulo `MAX_SEND_ON_LINK`. On the
//! outgoing side each occupied cell owns one packed packet (header plus data
//! region) and its nonce; the running XOR of nonces up to a sequence is the
//! digest a peer must echo to prove cumulative receipt. On the incoming side
//! a cell is empty, a recorded gap awaiting NACK, or a received packet.

use std::time::Instant;
use trellis_proto::constants::MAX_SEND_ON_LINK;

#[derive(Debug)]
pub struct OutSlot {
    /// Data region of the packet: fragments with trailing fragment headers.
    pub data: Vec<u8>,
    /// Fragment index of the first fragment in this packet; 1 when the
    /// packet begins a message (needed to find message boundaries when
    /// reintroducing after an incarnation change).
    pub first_frag_idx: u8,
    pub nonce: u64,
    /// Next retransmission eligibility.
    pub timestamp: Instant,
    pub resent: bool,
    pub nacked: bool,
}

#[derive(Debug, Default)]
pub enum InCell {
    #[default]
    Empty,
    Nack {
        expire: Instant,
    },
    Recvd {
        data: Vec<u8>,
        nonce: u64,
    },
}

pub struct OutgoingWindow {
    slots: Vec<Option<OutSlot>>,
    pub nonce_digest: Vec<u64>,
    /// Lowest unacknowledged sequence.
    pub tail_seq: u64,
    /// Next sequence eligible to transmit under congestion control.
    pub tcp_head_seq: u64,
    /// Next sequence to assign.
    pub head_seq: u64,
}

impl OutgoingWindow {
    pub fn new(start_seq: u64) -> Self {
        OutgoingWindow {
            slots: (0..MAX_SEND_ON_LINK).map(|_| None).collect(),
            nonce_digest: vec![0; MAX_SEND_ON_LINK as usize],
            tail_seq: start_seq,
            tcp_head_seq: start_seq,
            head_seq: start_seq,
        }
    }

    pub fn len(&self) -> u64 {
        self.head_seq - self.tail_seq
    }

    pub fn is_full(&self) -> bool {
        self.len() >= MAX_SEND_ON_LINK
    }

    pub fn slot(&self, seq: u64) -> Option<&OutSlot> {
        self.slots[(seq % MAX_SEND_ON_LINK) as usize].as_ref()
    }

    pub fn slot_mut(&mut self, seq: u64) -> Option<&mut OutSlot> {
        self.slots[(seq % MAX_SEND_ON_LINK) as usize].as_mut()
    }

    pub fn digest_at(&self, seq: u64) -> u64 {
        self.nonce_digest[(seq % MAX_SEND_ON_LINK) as usize]
    }

    /// Install a freshly packed packet at `head_seq`, chaining its nonce into
    /// the digest, and advance the head. The window must not be full.
    pub fn push(&mut self, data: Vec<u8>, first_frag_idx: u8, nonce: u64, timestamp: Instant) -> u64 {
        debug_assert!(!self.is_full());
        let seq = self.head_seq;
        let index = (seq % MAX_SEND_ON_LINK) as usize;
        let prev = (seq.wrapping_sub(1) % MAX_SEND_ON_LINK) as usize;
        self.nonce_digest[index] = nonce ^ self.nonce_digest[prev];
        self.slots[index] = Some(OutSlot {
            data,
            first_frag_idx,
            nonce,
            timestamp,
            resent: false,
            nacked: false,
        });
        self.head_seq += 1;
        seq
    }

    /// Release every slot up to and including `aru` and advance the tail.
    /// Returns the number of packets released.
    pub fn release_through(&mut self, aru: u64) -> u64 {
        let mut released = 0;
        for seq in self.tail_seq..=aru {
            self.slots[(seq % MAX_SEND_ON_LINK) as usize] = None;
            released += 1;
        }
        self.tail_seq = aru + 1;
        released
    }

    pub fn clear(&mut self, start_seq: u64) {
        for slot in &mut self.slots {
            *slot = None;
        }
        for digest in &mut self.nonce_digest {
            *digest = 0;
        }
        self.tail_seq = start_seq;
        self.tcp_head_seq = start_seq;
        self.head_seq = start_seq;
    }

    /// Take the occupied slots between tail and head in sequence order,
    /// leaving the window empty. Used when reintroducing messages across an
    /// incarnation change.
    pub fn drain_in_order(&mut self) -> Vec<OutSlot> {
        let mut out = Vec::with_capacity(self.len() as usize);
        for seq in self.tail_seq..self.head_seq {
            if let Some(slot) = self.slots[(seq % MAX_SEND_ON_LINK) as usize].take() {
                out.push(slot);
            }
        }
        out
    }
}

pub struct IncomingWindow {
    cells: Vec<InCell>,
    pub nonces: Vec<u64>,
    /// Lowest sequence not yet consumed in order.
    pub tail_seq: u64,
    /// One past the highest sequence seen.
    pub head_seq: u64,
    /// Running XOR of consumed-cell nonces up to `tail_seq - 1`.
    pub aru_nonce_digest: u64,
}

impl IncomingWindow {
    pub fn new(start_seq: u64) -> Self {
        IncomingWindow {
            cells: (0..MAX_SEND_ON_LINK).map(|_| InCell::Empty).collect(),
            nonces: vec![0; MAX_SEND_ON_LINK as usize],
            tail_seq: start_seq,
            head_seq: start_seq,
            aru_nonce_digest: 0,
        }
    }

    pub fn cell(&self, seq: u64) -> &InCell {
        &self.cells[(seq % MAX_SEND_ON_LINK) as usize]
    }

    pub fn cell_mut(&mut self, seq: u64) -> &mut InCell {
        &mut self.cells[(seq % MAX_SEND_ON_LINK) as usize]
    }

    pub fn aru(&self) -> u64 {
        self.tail_seq - 1
    }

    pub fn in_window(&self, seq: u64) -> bool {
        seq >= self.tail_seq && seq < self.tail_seq + MAX_SEND_ON_LINK
    }

    pub fn clear(&mut self, start_seq: u64) {
        for cell in &mut self.cells {
            *cell = InCell::Empty;
        }
        for nonce in &mut self.nonces {
            *nonce = 0;
        }
        self.tail_seq = start_seq;
        self.head_seq = start_seq;
        self.aru_nonce_digest = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_chains_across_slots() {
        let now = Instant::now();
        let mut win = OutgoingWindow::new(1);
        win.push(vec![1], 1, 0xa, now);
        win.push(vec![2], 1, 0xb, now);
        win.push(vec![3], 1, 0xc, now);
        assert_eq!(win.digest_at(1), 0xa);
        assert_eq!(win.digest_at(2), 0xa ^ 0xb);
        assert_eq!(win.digest_at(3), 0xa ^ 0xb ^ 0xc);
    }

    #[test]
    fn release_moves_tail() {
        let now = Instant::now();
        let mut win = OutgoingWindow::new(1);
        for i in 0..5u8 {
            win.push(vec![i], 1, i as u64, now);
        }
        assert_eq!(win.release_through(3), 3);
        assert_eq!(win.tail_seq, 4);
        assert!(win.slot(3).is_none());
        assert!(win.slot(4).is_some());
    }
}
