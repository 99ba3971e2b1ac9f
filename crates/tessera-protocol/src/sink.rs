//! Seam between transfer sessions and whatever carries their messages.
//!
//! The node implements [`MessageSink`] on top of its per-peer outgoing
//! queues; tests use the in-memory network in [`crate::testing`].

use std::sync::Arc;
use std::time::Duration;

use tessera_core::message::TransferMessage;
use tessera_core::types::PeerId;

use crate::error::SendError;

/// Progress notifications for one handed-over message.
///
/// Each method fires at most once per message. `sent` fires when the last
/// byte of the message first reaches the wire; exactly one of
/// `acknowledged`, `disconnected` or `failed` fires afterwards.
pub trait SendCallback: Send + Sync {
    fn sent(&self) {}

    fn acknowledged(&self) {}

    fn disconnected(&self) {}

    fn failed(&self, _error: &SendError) {}
}

pub trait MessageSink: Send + Sync + 'static {
    /// Queue `message` for `peer`. Never blocks; the priority class comes
    /// from [`TransferMessage::priority`].
    fn send(
        &self,
        peer: PeerId,
        message: TransferMessage,
        callback: Option<Arc<dyn SendCallback>>,
    ) -> Result<(), SendError>;

    /// Smoothed round-trip estimate to `peer`, if one has been measured.
    fn round_trip_estimate(&self, _peer: PeerId) -> Option<Duration> {
        None
    }
}
