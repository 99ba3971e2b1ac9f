//! Error types for the transport layer.

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport not started")]
    NotConnected,
    #[error("transport stopped")]
    Stopped,
    /// The socket buffer is full; retry on a later tick.
    #[error("send would block")]
    WouldBlock,
    #[error("datagram of {size} bytes exceeds MTU {mtu}")]
    Oversized { size: usize, mtu: usize },
    #[error("transmit failed: {0}")]
    TransmitFailed(String),
}

impl InterfaceError {
    /// Whether the same send may succeed if attempted again later.
    pub fn is_transient(&self) -> bool {
        match self {
            InterfaceError::WouldBlock => true,
            InterfaceError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
