//! Wire-level headers. All multi-byte fields are network byte order.
//!
//! Layout of one link datagram:
//!
//! ```text
//! PacketHeader | body
//! ```
//!
//! where `body` is sealed (ciphertext | IV | HMAC) once a link key is
//! established, and for data packets decrypts to
//! `fragments[data_len] | LinkTail | nacks[..]`.

mod flood;
mod link;

pub use flood::{
    E2eAck, E2eCell, HbhAck, PathMask, PrioFloodHeader, RelFloodHeader, RelFloodTail, RelType,
    ScCell, StatusChange,
};
pub use link::{DhHello, FragmentHeader, LinkPing, LinkTail, PingKind};

use crate::error::ProtoError;
use crate::ids::NodeId;
use bytes::{Buf, BufMut};

/// Low-order marker bit on the type word. Always set by our encoders; a
/// clear bit identifies a foreign byte-order encoder. Decoding is
/// field-ordered and does not depend on it.
pub const ENDIAN_MARK: u32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    LinkData,
    LinkAck,
    LinkPing,
    DiffieHellman,
}

impl PacketType {
    pub fn word(self) -> u32 {
        match self {
            PacketType::LinkData => 0x10,
            PacketType::LinkAck => 0x12,
            PacketType::LinkPing => 0x14,
            PacketType::DiffieHellman => 0x16,
        }
    }

    pub fn from_word(word: u32) -> Result<Self, ProtoError> {
        match word & !ENDIAN_MARK {
            0x10 => Ok(PacketType::LinkData),
            0x12 => Ok(PacketType::LinkAck),
            0x14 => Ok(PacketType::LinkPing),
            0x16 => Ok(PacketType::DiffieHellman),
            other => Err(ProtoError::InvalidType(other)),
        }
    }

    /// Peek at the type word of a raw datagram without consuming it. Used to
    /// let possible DH packets through when authentication fails.
    pub fn peek(raw: &[u8]) -> Option<Self> {
        if raw.len() < 4 {
            return None;
        }
        let word = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        Self::from_word(word).ok()
    }
}

pub(crate) fn need<B: Buf>(buf: &B, needed: usize) -> Result<(), ProtoError> {
    if buf.remaining() < needed {
        Err(ProtoError::Truncated {
            needed,
            had: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

/// Leading header of every link datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub ptype: PacketType,
    pub sender: NodeId,
    pub ctrl_link_id: u32,
    pub data_len: u16,
    pub ack_len: u16,
    pub seq_no: u32,
}

impl PacketHeader {
    pub const WIRE_LEN: usize = 18;

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.ptype.word() | ENDIAN_MARK);
        buf.put_u16(self.sender.0);
        buf.put_u32(self.ctrl_link_id);
        buf.put_u16(self.data_len);
        buf.put_u16(self.ack_len);
        buf.put_u32(self.seq_no);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ProtoError> {
        need(buf, Self::WIRE_LEN)?;
        let word = buf.get_u32();
        let ptype = PacketType::from_word(word)?;
        if word & ENDIAN_MARK == 0 {
            tracing::trace!("packet type word without endian marker");
        }
        Ok(PacketHeader {
            ptype,
            sender: NodeId(buf.get_u16()),
            ctrl_link_id: buf.get_u32(),
            data_len: buf.get_u16(),
            ack_len: buf.get_u16(),
            seq_no: buf.get_u32(),
        })
    }
}

/// Routing selector carried in the overlay header of every disseminated
/// message. The C ancestor dispatched on a function pointer; a closed enum
/// keeps dispatch exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    PriorityFlood,
    ReliableFlood,
}

impl Routing {
    fn word(self) -> u8 {
        match self {
            Routing::PriorityFlood => 1,
            Routing::ReliableFlood => 2,
        }
    }

    fn from_word(w: u8) -> Result<Self, ProtoError> {
        match w {
            1 => Ok(Routing::PriorityFlood),
            2 => Ok(Routing::ReliableFlood),
            _ => Err(ProtoError::InvalidField("routing")),
        }
    }
}

/// Inner header of every disseminated message: addressing, payload length,
/// TTL and routing. The TTL is mutable in transit and therefore zeroed
/// during signing and verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayHeader {
    pub src: NodeId,
    pub dst: NodeId,
    pub len: u16,
    pub ttl: u8,
    pub routing: Routing,
}

impl OverlayHeader {
    pub const WIRE_LEN: usize = 8;

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.src.0);
        buf.put_u16(self.dst.0);
        buf.put_u16(self.len);
        buf.put_u8(self.ttl);
        buf.put_u8(self.routing.word());
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ProtoError> {
        need(buf, Self::WIRE_LEN)?;
        Ok(OverlayHeader {
            src: NodeId(buf.get_u16()),
            dst: NodeId(buf.get_u16()),
            len: buf.get_u16(),
            ttl: buf.get_u8(),
            routing: Routing::from_word(buf.get_u8())?,
        })
    }

    /// Byte offset of the TTL field within an encoded header.
    pub const TTL_OFFSET: usize = 6;
}
