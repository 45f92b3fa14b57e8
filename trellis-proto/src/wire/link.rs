use super::need;
use crate::constants::HMAC_LEN;
use crate::error::ProtoError;
use crate::ids::{Epoch, InterfaceId, LinkSeq};
use bytes::{Buf, BufMut};
use smallvec::SmallVec;

/// Trailer appended to each fragment inside a data packet. Fragments are
/// parsed back-to-front: the trailer at the end of the data region describes
/// the fragment bytes immediately before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub frag_len: u16,
    /// 1-based index of this fragment within its message.
    pub frag_idx: u8,
    pub frag_total: u8,
}

impl FragmentHeader {
    pub const WIRE_LEN: usize = 4;

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.frag_len);
        buf.put_u8(self.frag_idx);
        buf.put_u8(self.frag_total);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ProtoError> {
        need(buf, Self::WIRE_LEN)?;
        Ok(FragmentHeader {
            frag_len: buf.get_u16(),
            frag_idx: buf.get_u8(),
            frag_total: buf.get_u8(),
        })
    }

    /// Read the trailer that ends at `end` within `data`.
    pub fn read_at_end(data: &[u8], end: usize) -> Result<Self, ProtoError> {
        if end < Self::WIRE_LEN {
            return Err(ProtoError::Truncated {
                needed: Self::WIRE_LEN,
                had: end,
            });
        }
        let mut slice = &data[end - Self::WIRE_LEN..end];
        Self::decode(&mut slice)
    }
}

/// Reliability tail present on every data and ack packet: the packet's own
/// sequence and nonce, the cumulative ARU with its nonce digest, and the two
/// incarnations. Optionally followed by 64-bit NACK sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTail {
    pub link_seq: LinkSeq,
    pub seq_nonce: u64,
    pub aru: u64,
    pub aru_nonce: u64,
    pub incarnation: Epoch,
    pub aru_incarnation: Epoch,
    pub nacks: SmallVec<[u64; 8]>,
}

impl LinkTail {
    pub const BASE_LEN: usize = 40;

    pub fn wire_len(&self) -> usize {
        Self::BASE_LEN + self.nacks.len() * 8
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.link_seq.0);
        buf.put_u64(self.seq_nonce);
        buf.put_u64(self.aru);
        buf.put_u64(self.aru_nonce);
        buf.put_u32(self.incarnation.0);
        buf.put_u32(self.aru_incarnation.0);
        for nack in &self.nacks {
            buf.put_u64(*nack);
        }
    }

    /// Decode a tail of exactly `ack_len` bytes (base tail plus a whole
    /// number of NACK entries).
    pub fn decode(mut buf: &[u8], ack_len: usize) -> Result<Self, ProtoError> {
        if ack_len < Self::BASE_LEN || (ack_len - Self::BASE_LEN) % 8 != 0 {
            return Err(ProtoError::InvalidField("ack_len"));
        }
        need(&buf, ack_len)?;
        let mut tail = LinkTail {
            link_seq: LinkSeq(buf.get_u64()),
            seq_nonce: buf.get_u64(),
            aru: buf.get_u64(),
            aru_nonce: buf.get_u64(),
            incarnation: Epoch(buf.get_u32()),
            aru_incarnation: Epoch(buf.get_u32()),
            nacks: SmallVec::new(),
        };
        for _ in 0..(ack_len - Self::BASE_LEN) / 8 {
            tail.nacks.push(buf.get_u64());
        }
        Ok(tail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingKind {
    Ping,
    Pong,
}

/// Body of a LinkPing packet. Pings carry a nonce so a PONG cannot be forged
/// ahead of time, and both incarnations so either side can detect a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkPing {
    pub kind: PingKind,
    pub seq: u64,
    pub nonce: u64,
    pub incarnation: Epoch,
    pub aru_incarnation: Epoch,
}

impl LinkPing {
    pub const WIRE_LEN: usize = 25;

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(match self.kind {
            PingKind::Ping => 1,
            PingKind::Pong => 2,
        });
        buf.put_u64(self.seq);
        buf.put_u64(self.nonce);
        buf.put_u32(self.incarnation.0);
        buf.put_u32(self.aru_incarnation.0);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ProtoError> {
        need(buf, Self::WIRE_LEN)?;
        let kind = match buf.get_u8() {
            1 => PingKind::Ping,
            2 => PingKind::Pong,
            _ => return Err(ProtoError::InvalidField("ping kind")),
        };
        Ok(LinkPing {
            kind,
            seq: buf.get_u64(),
            nonce: buf.get_u64(),
            incarnation: Epoch(buf.get_u32()),
            aru_incarnation: Epoch(buf.get_u32()),
        })
    }
}

/// Signed Diffie-Hellman handshake body. The signature covers the packet
/// header (with `seq_no` zeroed) and the body up to but not including the
/// signature itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhHello {
    pub local_iface: InterfaceId,
    pub remote_iface: InterfaceId,
    pub incarnation: Epoch,
    pub aru_incarnation: Epoch,
    pub public_key: [u8; 32],
    pub config_hash: [u8; HMAC_LEN],
    pub signature: [u8; 64],
}

impl DhHello {
    pub const WIRE_LEN: usize = 4 + 4 + 4 + 4 + 2 + 32 + HMAC_LEN + 64;
    /// Length of the signed prefix of the body.
    pub const SIGNED_LEN: usize = Self::WIRE_LEN - 64;

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.local_iface.0);
        buf.put_u32(self.remote_iface.0);
        buf.put_u32(self.incarnation.0);
        buf.put_u32(self.aru_incarnation.0);
        buf.put_u16(self.public_key.len() as u16);
        buf.put_slice(&self.public_key);
        buf.put_slice(&self.config_hash);
        buf.put_slice(&self.signature);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ProtoError> {
        need(buf, Self::WIRE_LEN)?;
        let local_iface = InterfaceId(buf.get_u32());
        let remote_iface = InterfaceId(buf.get_u32());
        let incarnation = Epoch(buf.get_u32());
        let aru_incarnation = Epoch(buf.get_u32());
        let key_len = buf.get_u16();
        if key_len != 32 {
            return Err(ProtoError::InvalidField("dh public key length"));
        }
        let mut public_key = [0u8; 32];
        buf.copy_to_slice(&mut public_key);
        let mut config_hash = [0u8; HMAC_LEN];
        buf.copy_to_slice(&mut config_hash);
        let mut signature = [0u8; 64];
        buf.copy_to_slice(&mut signature);
        Ok(DhHello {
            local_iface,
            remote_iface,
            incarnation,
            aru_incarnation,
            public_key,
            config_hash,
            signature,
        })
    }
}
