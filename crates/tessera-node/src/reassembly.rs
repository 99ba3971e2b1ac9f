//! Inbound fragment reassembly for one peer.

use std::collections::HashMap;
use std::time::Duration;

use tessera_core::datagram::Fragment;
use tessera_core::ranges::RangeSet;
use tokio::time::Instant;

/// Largest message a peer may send us.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// How long a completed message id is remembered for duplicate detection.
pub const COMPLETED_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, PartialEq, Eq)]
pub enum Assembled {
    /// Stored; more fragments needed.
    Partial,
    /// The fragment finished its message.
    Complete(Vec<u8>),
    /// Part of a message already delivered. Acknowledge, do not deliver.
    Duplicate,
    /// Inconsistent with what we know about the message. Not acknowledged.
    Rejected(&'static str),
}

impl Assembled {
    /// Whether the sender should get an ack for the fragment.
    pub fn should_ack(&self) -> bool {
        !matches!(self, Assembled::Rejected(_))
    }
}

struct Partial {
    data: Vec<u8>,
    received: RangeSet,
    updated: Instant,
}

#[derive(Default)]
pub struct InboundAssembler {
    partial: HashMap<u32, Partial>,
    completed: HashMap<u32, Instant>,
}

impl InboundAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partial_count(&self) -> usize {
        self.partial.len()
    }

    pub fn accept(&mut self, fragment: &Fragment, now: Instant) -> Assembled {
        if fragment.total_len == 0 || fragment.total_len > MAX_MESSAGE_SIZE {
            return Assembled::Rejected("bad message length");
        }
        if fragment.data.is_empty() || fragment.end() > fragment.total_len {
            return Assembled::Rejected("fragment outside message");
        }
        if self.completed.contains_key(&fragment.message_id) {
            return Assembled::Duplicate;
        }

        let partial = self
            .partial
            .entry(fragment.message_id)
            .or_insert_with(|| Partial {
                data: vec![0; fragment.total_len as usize],
                received: RangeSet::new(),
                updated: now,
            });
        if partial.data.len() != fragment.total_len as usize {
            return Assembled::Rejected("message length changed");
        }

        let (start, end) = (fragment.offset, fragment.end());
        partial.data[start as usize..end as usize].copy_from_slice(&fragment.data);
        partial.received.insert(start, end);
        partial.updated = now;

        if !partial.received.covers(0, fragment.total_len) {
            return Assembled::Partial;
        }
        let data = self
            .partial
            .remove(&fragment.message_id)
            .map(|p| p.data)
            .unwrap_or_default();
        self.completed.insert(fragment.message_id, now);
        Assembled::Complete(data)
    }

    /// Forget completed ids older than [`COMPLETED_TTL`] and partial
    /// messages untouched for `partial_ttl`.
    pub fn prune(&mut self, now: Instant, partial_ttl: Duration) {
        self.completed
            .retain(|_, at| now.saturating_duration_since(*at) < COMPLETED_TTL);
        self.partial
            .retain(|_, p| now.saturating_duration_since(p.updated) < partial_ttl);
    }

    /// Drop all state, e.g. after the peer restarted and reuses ids.
    pub fn reset(&mut self) {
        self.partial.clear();
        self.completed.clear();
    }
}
