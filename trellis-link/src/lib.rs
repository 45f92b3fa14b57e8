//! # Trellis Link
//!
//! The intrusion-tolerant per-neighbor link: an ordered stream of
//! arbitrary-length messages over UDP datagrams, with bounded memory,
//! authenticated and optionally encrypted, tolerating loss, reordering and
//! peer restarts.
//!
//! ## Architecture
//!
//! - **Reliability**: cumulative ARU attested by a running XOR of per-packet
//!   nonces, plus NACK-based selective recovery.
//! - **Congestion control**: a TCP-fair window (slow start / additive
//!   increase / halving on resolved loss).
//! - **Key establishment**: X25519 Diffie-Hellman authenticated by node
//!   signatures over the exchange and the configuration hash.
//! - **Scheduling**: a leaky bucket and a fair queue of dissemination
//!   engines competing for window slots.
//!
//! Sessions are sans-io: the daemon owns the sockets and the clock.

pub mod bucket;
pub mod error;
pub mod fairness;
pub mod loss;
pub mod reassembly;
pub mod resources;
pub mod rtt;
pub mod session;
pub mod window;

pub use error::LinkError;
pub use loss::LinkStatus;
pub use resources::DissemId;
pub use session::{BurstBudget, Datagram, LinkEvent, LinkSession, SendStatus, SessionParams};
