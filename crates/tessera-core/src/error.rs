//! Error types for the tessera-core crate.

use crate::abort::AbortReason;

/// A byte slice did not have the length a fixed-size field requires.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid length: expected {expected} bytes, got {actual}")]
pub struct InvalidLength {
    pub expected: usize,
    pub actual: usize,
}

/// Failure decoding a transfer message or a datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("payload too short: need at least {min} bytes, got {actual}")]
    TooShort { min: usize, actual: usize },

    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("unknown datagram kind: {0:#04x}")]
    UnknownDatagramKind(u8),

    #[error("unsupported datagram version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("encoded size {size} exceeds limit {limit}")]
    TooLarge { size: usize, limit: usize },
}

/// Failure operating on a [`BlockBuffer`](crate::buffer::BlockBuffer).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("packet size must be non-zero")]
    ZeroPacketSize,

    #[error("block of {len} bytes needs more than u32::MAX packets of {packet_size} bytes")]
    TooManyPackets { len: usize, packet_size: u32 },

    #[error("packet index {index} out of range (packet count {count})")]
    IndexOutOfRange { index: u32, count: u32 },

    #[error("packet {index} has wrong length: expected {expected}, got {actual}")]
    WrongPacketLength {
        index: u32,
        expected: usize,
        actual: usize,
    },

    #[error("packet {0} has not been received")]
    NotReceived(u32),

    #[error("block is incomplete: {received} of {count} packets received")]
    Incomplete { received: u32, count: u32 },

    #[error("buffer aborted: {0}")]
    Aborted(AbortReason),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortCode;

    #[test]
    fn codec_error_display() {
        assert_eq!(
            CodecError::TooShort { min: 9, actual: 3 }.to_string(),
            "payload too short: need at least 9 bytes, got 3"
        );
        assert_eq!(
            CodecError::UnknownMessageType(0x7f).to_string(),
            "unknown message type: 0x7f"
        );
    }

    #[test]
    fn buffer_error_display_includes_reason() {
        let err = BufferError::Aborted(AbortReason::new(AbortCode::Cancelled, "user gave up"));
        assert_eq!(err.to_string(), "buffer aborted: cancelled: user gave up");
    }
}
