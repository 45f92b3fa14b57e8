use super::need;
use crate::error::ProtoError;
use crate::ids::{Epoch, NodeId};
use bytes::{Buf, BufMut};

/// Per-destination k-path routing hint: one bit per node id, set when that
/// node lies on one of the chosen paths and must forward the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMask {
    bits: Vec<u8>,
}

impl PathMask {
    pub fn wire_len(node_count: u16) -> usize {
        (node_count as usize + 1).div_ceil(8)
    }

    pub fn empty(node_count: u16) -> Self {
        PathMask {
            bits: vec![0; Self::wire_len(node_count)],
        }
    }

    /// A mask with every node set; num_paths == 0 means plain flooding.
    pub fn full(node_count: u16) -> Self {
        PathMask {
            bits: vec![0xff; Self::wire_len(node_count)],
        }
    }

    pub fn set(&mut self, node: NodeId) {
        let i = node.index();
        self.bits[i / 8] |= 1 << (i % 8);
    }

    pub fn contains(&self, node: NodeId) -> bool {
        let i = node.index();
        i / 8 < self.bits.len() && self.bits[i / 8] & (1 << (i % 8)) != 0
    }

    /// Union `other` into self.
    pub fn merge(&mut self, other: &PathMask) {
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a |= b;
        }
    }

    /// True when every bit of `other` is also set in self.
    pub fn is_superset(&self, other: &PathMask) -> bool {
        self.bits
            .iter()
            .zip(&other.bits)
            .all(|(a, b)| a & b == *b)
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.bits);
    }

    pub fn decode<B: Buf>(buf: &mut B, node_count: u16) -> Result<Self, ProtoError> {
        let len = Self::wire_len(node_count);
        need(buf, len)?;
        let mut bits = vec![0; len];
        buf.copy_to_slice(&mut bits);
        Ok(PathMask { bits })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

/// Header of a priority-flooded message, carried between the payload and the
/// path mask. `(incarnation, seq_num)` identify the message within its
/// origin; origin and expiry are wall-clock stamps set by the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioFloodHeader {
    pub incarnation: u64,
    pub seq_num: u64,
    pub priority: u32,
    pub origin_sec: u32,
    pub origin_usec: u32,
    pub expire_sec: u32,
    pub expire_usec: u32,
}

impl PrioFloodHeader {
    pub const WIRE_LEN: usize = 36;

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.incarnation);
        buf.put_u64(self.seq_num);
        buf.put_u32(self.priority);
        buf.put_u32(self.origin_sec);
        buf.put_u32(self.origin_usec);
        buf.put_u32(self.expire_sec);
        buf.put_u32(self.expire_usec);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ProtoError> {
        need(buf, Self::WIRE_LEN)?;
        Ok(PrioFloodHeader {
            incarnation: buf.get_u64(),
            seq_num: buf.get_u64(),
            priority: buf.get_u32(),
            origin_sec: buf.get_u32(),
            origin_usec: buf.get_u32(),
            expire_sec: buf.get_u32(),
            expire_usec: buf.get_u32(),
        })
    }

    /// Expiry as microseconds since the epoch.
    pub fn expire_usecs(&self) -> u64 {
        self.expire_sec as u64 * 1_000_000 + self.expire_usec as u64
    }

    pub fn origin_usecs(&self) -> u64 {
        self.origin_sec as u64 * 1_000_000 + self.origin_usec as u64
    }
}

/// Message kinds sharing the reliable-flood framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelType {
    Data,
    Saa,
    E2e,
    StatusChange,
}

impl RelType {
    fn word(self) -> u8 {
        match self {
            RelType::Data => 1,
            RelType::Saa => 2,
            RelType::E2e => 3,
            RelType::StatusChange => 4,
        }
    }

    fn from_word(w: u8) -> Result<Self, ProtoError> {
        match w {
            1 => Ok(RelType::Data),
            2 => Ok(RelType::Saa),
            3 => Ok(RelType::E2e),
            4 => Ok(RelType::StatusChange),
            _ => Err(ProtoError::InvalidField("rel_flood type")),
        }
    }
}

/// Header of a reliable-flood message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelFloodHeader {
    pub src: NodeId,
    pub dst: NodeId,
    pub src_epoch: Epoch,
    pub seq_num: u64,
    pub rtype: RelType,
}

impl RelFloodHeader {
    pub const WIRE_LEN: usize = 17;

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.src.0);
        buf.put_u16(self.dst.0);
        buf.put_u32(self.src_epoch.0);
        buf.put_u64(self.seq_num);
        buf.put_u8(self.rtype.word());
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ProtoError> {
        need(buf, Self::WIRE_LEN)?;
        Ok(RelFloodHeader {
            src: NodeId(buf.get_u16()),
            dst: NodeId(buf.get_u16()),
            src_epoch: Epoch(buf.get_u32()),
            seq_num: buf.get_u64(),
            rtype: RelType::from_word(buf.get_u8())?,
        })
    }
}

/// Dynamic, unsigned tail appended at each hop; `ack_len` bytes of
/// [`HbhAck`] entries follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelFloodTail {
    pub ack_len: u16,
}

impl RelFloodTail {
    pub const WIRE_LEN: usize = 2;

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.ack_len);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ProtoError> {
        need(buf, Self::WIRE_LEN)?;
        Ok(RelFloodTail {
            ack_len: buf.get_u16(),
        })
    }
}

/// Hop-by-hop acknowledgement for one flow, piggybacked on any
/// reliable-flood packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HbhAck {
    pub src: NodeId,
    pub dst: NodeId,
    pub src_epoch: Epoch,
    pub sow: u64,
    pub aru: u64,
}

impl HbhAck {
    pub const WIRE_LEN: usize = 24;

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.src.0);
        buf.put_u16(self.dst.0);
        buf.put_u32(self.src_epoch.0);
        buf.put_u64(self.sow);
        buf.put_u64(self.aru);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ProtoError> {
        need(buf, Self::WIRE_LEN)?;
        Ok(HbhAck {
            src: NodeId(buf.get_u16()),
            dst: NodeId(buf.get_u16()),
            src_epoch: Epoch(buf.get_u32()),
            sow: buf.get_u64(),
            aru: buf.get_u64(),
        })
    }
}

/// One cell of an end-to-end ack: the destination's view of the flow from
/// source `i` to it. Cells compare lexicographically on
/// `(dest_epoch, src_epoch, aru)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct E2eCell {
    pub dest_epoch: Epoch,
    pub src_epoch: Epoch,
    pub aru: u64,
}

impl E2eCell {
    pub const WIRE_LEN: usize = 16;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.dest_epoch.0);
        buf.put_u32(self.src_epoch.0);
        buf.put_u64(self.aru);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        E2eCell {
            dest_epoch: Epoch(buf.get_u32()),
            src_epoch: Epoch(buf.get_u32()),
            aru: buf.get_u64(),
        }
    }
}

/// End-to-end acknowledgement produced and signed by a destination,
/// summarizing its ARU per potential source. `cells` is 1-indexed by node
/// id; index 0 is unused padding so engine code reads naturally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct E2eAck {
    pub dest: NodeId,
    pub cells: Vec<E2eCell>,
}

impl E2eAck {
    pub fn new(dest: NodeId, node_count: u16) -> Self {
        E2eAck {
            dest,
            cells: vec![E2eCell::default(); node_count as usize + 1],
        }
    }

    pub fn wire_len(node_count: u16) -> usize {
        4 + node_count as usize * E2eCell::WIRE_LEN
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.dest.0);
        buf.put_u16(self.cells.len() as u16 - 1);
        for cell in &self.cells[1..] {
            cell.encode(buf);
        }
    }

    pub fn decode<B: Buf>(buf: &mut B, node_count: u16) -> Result<Self, ProtoError> {
        need(buf, Self::wire_len(node_count))?;
        let dest = NodeId(buf.get_u16());
        let count = buf.get_u16();
        if count != node_count {
            return Err(ProtoError::InvalidField("e2e cell count"));
        }
        let mut cells = vec![E2eCell::default(); node_count as usize + 1];
        for cell in cells.iter_mut().skip(1) {
            *cell = E2eCell::decode(buf);
        }
        Ok(E2eAck { dest, cells })
    }
}

/// One cell of a status change: the creator's link to neighbor `i`.
/// Non-neighbor cells must stay `(0, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScCell {
    pub seq: u32,
    pub cost: i16,
}

/// Signed, monotonically versioned advertisement of a node's own adjacent
/// link costs. `cost == -1` means the link is down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub creator: NodeId,
    pub epoch: Epoch,
    pub cells: Vec<ScCell>,
}

impl StatusChange {
    pub fn new(creator: NodeId, node_count: u16) -> Self {
        StatusChange {
            creator,
            epoch: Epoch(0),
            cells: vec![ScCell::default(); node_count as usize + 1],
        }
    }

    pub fn wire_len(node_count: u16) -> usize {
        8 + node_count as usize * 6
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.creator.0);
        buf.put_u32(self.epoch.0);
        buf.put_u16(self.cells.len() as u16 - 1);
        for cell in &self.cells[1..] {
            buf.put_u32(cell.seq);
            buf.put_i16(cell.cost);
        }
    }

    pub fn decode<B: Buf>(buf: &mut B, node_count: u16) -> Result<Self, ProtoError> {
        need(buf, Self::wire_len(node_count))?;
        let creator = NodeId(buf.get_u16());
        let epoch = Epoch(buf.get_u32());
        let count = buf.get_u16();
        if count != node_count {
            return Err(ProtoError::InvalidField("status change cell count"));
        }
        let mut cells = vec![ScCell::default(); node_count as usize + 1];
        for cell in cells.iter_mut().skip(1) {
            *cell = ScCell {
                seq: buf.get_u32(),
                cost: buf.get_i16(),
            };
        }
        Ok(StatusChange { creator, epoch, cells })
    }
}
