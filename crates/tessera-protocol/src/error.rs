//! Transfer error types.
//!
//! A session reports exactly one terminal error through its handle; nothing
//! here is retried internally.

use core::fmt;

use tessera_core::abort::AbortCode;
use tessera_core::error::BufferError;
use tessera_core::types::PeerId;

/// Which side decided to abandon a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOrigin {
    Local,
    Remote,
}

impl fmt::Display for AbortOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortOrigin::Local => f.write_str("local"),
            AbortOrigin::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("peer restarted")]
    PeerRestarted,

    #[error("transfer timed out")]
    Timeout,

    #[error("sender stopped responding")]
    SenderUnresponsive,

    #[error("receiver never acknowledged the block")]
    ReceiverUnresponsive,

    #[error("aborted ({origin}): {code}: {description}")]
    Aborted {
        origin: AbortOrigin,
        code: AbortCode,
        description: String,
    },

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TransferError {
    /// Reason code to put in a `SendAborted` for this failure.
    pub fn abort_code(&self) -> AbortCode {
        match self {
            TransferError::PeerDisconnected => AbortCode::Disconnected,
            TransferError::PeerRestarted => AbortCode::Restarted,
            TransferError::Timeout => AbortCode::Timeout,
            TransferError::SenderUnresponsive => AbortCode::SenderDied,
            TransferError::ReceiverUnresponsive => AbortCode::ReceiverUnresponsive,
            TransferError::Aborted { code, .. } => *code,
            TransferError::Buffer(_) | TransferError::Internal(_) => AbortCode::Internal,
        }
    }

    pub(crate) fn local(code: AbortCode, description: impl Into<String>) -> Self {
        TransferError::Aborted {
            origin: AbortOrigin::Local,
            code,
            description: description.into(),
        }
    }
}

/// Failure handing a message to a peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    #[error("message expired before it was acknowledged")]
    Expired,

    #[error("fatal send error: {0}")]
    Fatal(String),
}

impl From<SendError> for TransferError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::NotConnected(_) => TransferError::PeerDisconnected,
            SendError::Expired => TransferError::Timeout,
            SendError::Fatal(msg) => TransferError::Internal(msg),
        }
    }
}
