use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("outgoing window is full")]
    WindowFull,
    #[error("message exceeds the maximum reassembled size")]
    MessageTooLarge,
    #[error("link is unavailable")]
    Unavailable,
}
