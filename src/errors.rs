use thiserror::Error;

pub type TransferResult<T> = std::result::Result<T, TransferError>;

/// Failures of the transfer engine that callers are expected to match on.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("receiver did not answer the transfer offer in time")]
    ConsentTimeout,
    #[error("receiver declined the transfer")]
    Declined,
    #[error("direct channel did not open within {0:?}")]
    ChannelTimeout(std::time::Duration),
    #[error("malformed frame: {0}")]
    Frame(String),
    #[error("chunk failed to decrypt: {0}")]
    Decryption(String),
    #[error("peer {0} is not registered")]
    UnregisteredPeer(String),
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u32, got: u32 },
    #[error("transport closed")]
    Closed,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl TransferError {
    pub fn frame(msg: impl Into<String>) -> Self {
        Self::Frame(msg.into())
    }

    /// Errors that end a session without anything being written or streamed.
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::Declined | Self::ConsentTimeout)
    }
}
