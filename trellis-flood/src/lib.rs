//! # Trellis Flood
//!
//! The two dissemination engines layered above the intrusion-tolerant link:
//!
//! - **Priority flooding**: source-ordered dissemination of signed messages
//!   with per-destination k-path masks, bounded per-neighbor stores and
//!   expiration.
//! - **Reliable flooding**: end-to-end reliable delivery per (source,
//!   destination) flow with hop-by-hop ack piggybacking, signed end-to-end
//!   acks, source-incarnation recovery, restamping under route changes, and
//!   signed link-status propagation.
//!
//! Both engines are sans-io. They never touch a socket: the daemon feeds
//! them received messages and offers them link slots through the resource
//! fair queue, and they hand back wire-ready message bodies.

pub mod error;
pub mod network;
pub mod priority;
pub mod reliable;
pub mod time;

pub use error::FloodError;
pub use network::Network;
pub use priority::PriorityFlood;
pub use reliable::{RelEvent, ReliableFlood};
pub use time::WallTime;

/// Outcome of handing a message to a dissemination engine, mirroring the
/// buffer status contract of the session interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisseminateStatus {
    /// Accepted and queued (or delivered).
    Ok,
    /// Accepted, but an older stored message was evicted to make room.
    BuffDrop,
    /// Rejected: not stored and not forwarded.
    NoRoute,
}
