//! Protocol-wide sizing constants. Values that daemons must agree on are
//! folded into the configuration hash; the rest are local sizing choices.

/// Maximum UDP payload of one link packet, including the link tail but not
/// the IP/UDP headers.
pub const MAX_PACKET_SIZE: usize = 1400;

/// Size of the sliding window on each link, in packets. Sequence numbers are
/// stored modulo this value.
pub const MAX_SEND_ON_LINK: u64 = 100;

/// First sequence number used on a (re)initialized link. Sequence 0 is
/// reserved for standalone acks.
pub const LINK_START_SEQ: u64 = 1;

/// Upper bound on the number of fragments a single message may occupy.
pub const MAX_PKTS_PER_MESSAGE: usize = 50;

/// Entries in the ping history ring.
pub const MAX_PING_HIST: u64 = 16;

/// Buckets in the loss-rate history ladder.
pub const LOSS_HISTORY_SIZE: usize = 10;

/// Bandwidth allocated per link for first-time transmissions (leaky bucket).
pub const RATE_LIMIT_KBPS: u64 = 250_000;

/// Leaky bucket capacity in bytes.
pub const BUCKET_CAP: u64 = 200_000 + MAX_PACKET_SIZE as u64;

/// Microseconds between bucket refills.
pub const BUCKET_FILL_USEC: u64 = 300;

/// Bandwidth allocated to retransmission bursts, across all links.
pub const FLOW_CTRL_KBPS: u64 = 25_000;

/// Highest priority a flooded message may carry (valid range 1..=MAX_PRIORITY).
pub const MAX_PRIORITY: u8 = 10;

/// Window of in-flight messages per reliable (source, destination) flow.
pub const MAX_MESS_PER_FLOW: u64 = 1000;

/// Hard cap on nodes expressible in multipath bitmasks and E2E cell arrays.
pub const MAX_NODES: u16 = 256;

/// AES-128-CBC block and IV length.
pub const CIPHER_BLOCK_LEN: usize = 16;

/// HMAC-SHA256 output length; also the configuration hash length.
pub const HMAC_LEN: usize = 32;
