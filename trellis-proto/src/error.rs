use thiserror::Error;

/// Errors surfaced while encoding, decoding or authenticating wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("packet truncated: needed {needed} bytes, had {had}")]
    Truncated { needed: usize, had: usize },
    #[error("invalid packet type {0:#x}")]
    InvalidType(u32),
    #[error("invalid field value: {0}")]
    InvalidField(&'static str),
    #[error("message too large")]
    TooLarge,
    #[error("authentication failed")]
    BadMac,
    #[error("signature verification failed")]
    BadSignature,
    #[error("configuration hash mismatch")]
    ConfigMismatch,
    #[error("no key established")]
    NoKey,
}
