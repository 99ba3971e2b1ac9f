//! Core types, block buffer, and wire formats for the Tessera overlay.
//!
//! This crate holds the pieces shared by every layer: peer and transfer
//! identifiers, the coalescing range set and packet bitmap used for
//! bookkeeping, the shared block buffer, and the transfer-message and
//! datagram codecs.

pub mod abort;
pub mod bitmap;
pub mod buffer;
mod codec;
pub mod constants;
pub mod datagram;
pub mod error;
pub mod message;
pub mod ranges;
pub mod types;

pub use abort::{AbortCode, AbortReason};
pub use bitmap::PacketBitmap;
pub use buffer::{BlockBuffer, BufferListener, ListenerId};
pub use datagram::{AckRange, Datagram, Fragment};
pub use error::{BufferError, CodecError, InvalidLength};
pub use message::{MessageKind, Priority, TransferMessage};
pub use ranges::RangeSet;
pub use types::{BootId, PeerId, TransferId};
