use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FloodError {
    #[error("destination is not a configured node")]
    UnknownDestination,
    #[error("flow window is full or the handshake is incomplete")]
    FlowBlocked,
    #[error("no usable route to the destination")]
    NoRoute,
    #[error("payload too large for a single overlay message")]
    TooLarge,
}
