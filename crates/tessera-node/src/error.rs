//! Error types for the node.

use tessera_core::types::{PeerId, TransferId};
use tessera_interfaces::InterfaceError;
use tessera_protocol::TransferError;

/// Errors that can occur during node operation.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("interface error: {0}")]
    Interface(#[from] InterfaceError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("transfer {transfer_id} with {peer} is already running")]
    DuplicateTransfer { peer: PeerId, transfer_id: TransferId },
    #[error("node already running")]
    AlreadyRunning,
}
