//! # Trellis Proto
//!
//! Wire formats, identifiers, configuration blocks and crypto primitives
//! shared by the Trellis overlay daemon.
//!
//! Every header on the wire is encoded in network byte order through
//! fixed-order accessors; engines keep host-order values internally. The
//! packet type word carries an endianness marker in its low bit so receivers
//! can detect foreign encoders, but decoding never depends on it.

pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod ids;
pub mod wire;

pub use config::{ConfigHash, LinkConfig, PrioConfig, RelConfig};
pub use crypto::{LinkKeys, NodeIdentity, NodeVerifier, SIGNATURE_LEN};
pub use error::ProtoError;
pub use ids::{Epoch, FlowSeq, InterfaceId, LinkSeq, NodeId};
