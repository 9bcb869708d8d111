use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("channel closed")]
    Closed,

    #[error("{0}")]
    Remote(String),

    #[error("failed to encode frame: {0}")]
    Encode(String),
}
