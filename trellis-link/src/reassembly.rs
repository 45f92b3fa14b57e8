//! Rebuilding messages from the fragments packed into link packets.
//!
//! Fragments sit in the packet data region back to front: each 4-byte
//! trailer describes the fragment bytes immediately before it, so the region
//! is walked in reverse and then replayed in increasing fragment order.

use bytes::Bytes;
use trellis_proto::constants::MAX_PKTS_PER_MESSAGE;
use trellis_proto::wire::FragmentHeader;

/// A fragment located inside a packet: payload range plus its trailer.
#[derive(Debug, Clone, Copy)]
pub struct LocatedFragment {
    pub start: usize,
    pub len: usize,
    pub idx: u8,
    pub total: u8,
}

/// Walk the data region and return its fragments in increasing index order.
/// Any framing inconsistency is a protocol violation by the neighbor.
pub fn locate_fragments(data: &[u8]) -> Result<Vec<LocatedFragment>, &'static str> {
    let mut fragments: Vec<LocatedFragment> = Vec::new();
    let mut end = data.len();
    let mut expected_idx: Option<u8> = None;
    let mut total: Option<u8> = None;

    while end > 0 {
        let fh = FragmentHeader::read_at_end(data, end).map_err(|_| "truncated fragment header")?;
        if fh.frag_total == 0 || fh.frag_total as usize > MAX_PKTS_PER_MESSAGE {
            return Err("invalid fragment total");
        }
        match total {
            None => total = Some(fh.frag_total),
            Some(t) if t != fh.frag_total => return Err("inconsistent fragment totals"),
            _ => {}
        }
        if fh.frag_idx == 0 || fh.frag_idx > fh.frag_total {
            return Err("fragment index out of range");
        }
        if let Some(expected) = expected_idx {
            if fh.frag_idx != expected {
                return Err("non-consecutive fragment indices");
            }
        }
        expected_idx = fh.frag_idx.checked_sub(1);

        let tail_start = end - FragmentHeader::WIRE_LEN;
        let len = fh.frag_len as usize;
        if len > tail_start {
            return Err("fragment length runs past packet start");
        }
        fragments.push(LocatedFragment {
            start: tail_start - len,
            len,
            idx: fh.frag_idx,
            total: fh.frag_total,
        });
        end = tail_start - len;
    }

    fragments.reverse();
    Ok(fragments)
}

/// True when the data region holds exactly one whole message (a candidate
/// for out-of-order delivery when ordered delivery is off).
pub fn is_single_packet_message(data: &[u8]) -> bool {
    FragmentHeader::read_at_end(data, data.len())
        .map(|fh| fh.frag_total == 1)
        .unwrap_or(false)
}

/// Accumulates fragments of the in-order message stream.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
    next_idx: u8,
    total: u8,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler {
            buf: Vec::new(),
            next_idx: 1,
            total: 0,
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.next_idx = 1;
        self.total = 0;
    }

    pub fn in_progress(&self) -> bool {
        self.next_idx != 1 || self.total != 0
    }

    /// Absorb one packet's data region. Returns completed messages (usually
    /// zero or one; a packet carrying the tail of one message cannot also
    /// start another under the consecutive-index rule, so at most one).
    pub fn absorb(&mut self, data: &[u8]) -> Result<Option<Bytes>, &'static str> {
        let fragments = locate_fragments(data)?;
        let mut completed = None;

        for frag in fragments {
            if self.total == 0 {
                self.total = frag.total;
            } else if self.total != frag.total {
                return Err("fragment total changed mid-message");
            }
            if frag.idx != self.next_idx {
                self.reset();
                return Err("unexpected fragment index");
            }
            self.buf
                .extend_from_slice(&data[frag.start..frag.start + frag.len]);
            self.next_idx += 1;

            if self.next_idx == self.total + 1 {
                completed = Some(Bytes::from(std::mem::take(&mut self.buf)));
                self.next_idx = 1;
                self.total = 0;
            }
        }
        Ok(completed)
    }
}

/// Append `payload` bytes and a trailer to `out`, forming one packed fragment.
pub fn pack_fragment(out: &mut Vec<u8>, payload: &[u8], idx: u8, total: u8) {
    out.extend_from_slice(payload);
    FragmentHeader {
        frag_len: payload.len() as u16,
        frag_idx: idx,
        frag_total: total,
    }
    .encode(out);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_three_fragments() {
        let mut re = Reassembler::new();
        let message = b"abcdefghij";

        let mut pkt1 = Vec::new();
        pack_fragment(&mut pkt1, &message[..4], 1, 3);
        let mut pkt2 = Vec::new();
        pack_fragment(&mut pkt2, &message[4..8], 2, 3);
        let mut pkt3 = Vec::new();
        pack_fragment(&mut pkt3, &message[8..], 3, 3);

        assert_eq!(re.absorb(&pkt1).unwrap(), None);
        assert_eq!(re.absorb(&pkt2).unwrap(), None);
        let done = re.absorb(&pkt3).unwrap().expect("complete");
        assert_eq!(&done[..], message);
        assert!(!re.in_progress());
    }

    #[test]
    fn packed_pair_in_one_packet() {
        let mut pkt = Vec::new();
        pack_fragment(&mut pkt, b"1111", 1, 2);
        pack_fragment(&mut pkt, b"22", 2, 2);

        let frags = locate_fragments(&pkt).unwrap();
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].idx, 1);
        assert_eq!(frags[1].idx, 2);

        let mut re = Reassembler::new();
        assert_eq!(&re.absorb(&pkt).unwrap().unwrap()[..], b"111122");
    }

    #[test]
    fn bogus_framing_is_rejected() {
        let mut pkt = Vec::new();
        pack_fragment(&mut pkt, b"abcd", 2, 3);
        pack_fragment(&mut pkt, b"ef", 1, 3);
        assert!(locate_fragments(&pkt).is_err(), "indices must descend");

        let mut huge = Vec::new();
        pack_fragment(&mut huge, b"x", 1, 1);
        huge[1] = 0x01; // corrupt the trailer's length field
        let mut re = Reassembler::new();
        assert!(re.absorb(&huge).is_err());
    }
}
