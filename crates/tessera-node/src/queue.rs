//! Per-peer queue of serialized transfer messages.
//!
//! Each message is cut into fragments on demand by the scheduler. Sent and
//! acknowledged bytes are tracked as coalescing [`RangeSet`]s, so a message
//! survives any mix of lost fragments, duplicate acks and resends. When no
//! ack has arrived for [`SPECULATIVE_RESEND_AFTER`], everything sent but
//! unacknowledged becomes eligible again.
//!
//! Callbacks are never invoked under the queue's owner lock: every mutating
//! operation pushes [`Notification`]s into a caller-supplied vector which is
//! fired once the lock is released.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use tessera_core::datagram::Fragment;
use tessera_core::message::Priority;
use tessera_core::ranges::RangeSet;
use tessera_protocol::{SendCallback, SendError};
use tokio::time::Instant;

/// Sent but unacknowledged bytes are resent after this long without an ack.
pub const SPECULATIVE_RESEND_AFTER: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum Delivery {
    Sent,
    Acknowledged,
    Disconnected,
    Failed(SendError),
}

/// A callback invocation deferred until locks are released.
#[must_use]
pub struct Notification {
    callback: Arc<dyn SendCallback>,
    delivery: Delivery,
}

impl Notification {
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn fire(self) {
        match &self.delivery {
            Delivery::Sent => self.callback.sent(),
            Delivery::Acknowledged => self.callback.acknowledged(),
            Delivery::Disconnected => self.callback.disconnected(),
            Delivery::Failed(e) => self.callback.failed(e),
        }
    }
}

pub fn fire_all(notifications: Vec<Notification>) {
    for n in notifications {
        n.fire();
    }
}

// ---------------------------------------------------------------------------
// QueuedMessage
// ---------------------------------------------------------------------------

/// One transmission of a fragment, for RTT sampling.
struct InFlight {
    range: Range<u32>,
    at: Instant,
    /// Overlaps an earlier transmission; its ack is ambiguous.
    resent: bool,
}

pub struct QueuedMessage {
    id: u32,
    payload: Vec<u8>,
    priority: Priority,
    callback: Option<Arc<dyn SendCallback>>,
    sent: RangeSet,
    acked: RangeSet,
    in_flight: Vec<InFlight>,
    /// Last ack, or the first send if nothing was acked yet.
    last_progress: Option<Instant>,
    expires_at: Instant,
    sent_reported: bool,
    done: bool,
}

impl QueuedMessage {
    pub fn new(
        id: u32,
        payload: Vec<u8>,
        priority: Priority,
        callback: Option<Arc<dyn SendCallback>>,
        expires_at: Instant,
    ) -> Self {
        Self {
            id,
            payload,
            priority,
            callback,
            sent: RangeSet::new(),
            acked: RangeSet::new(),
            in_flight: Vec::new(),
            last_progress: None,
            expires_at,
            sent_reported: false,
            done: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn sent(&self) -> &RangeSet {
        &self.sent
    }

    pub fn acked(&self) -> &RangeSet {
        &self.acked
    }

    /// Acknowledged, failed or expired. A done message never fires again.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acked.covers(0, self.len())
    }

    fn notify(&self, delivery: Delivery, out: &mut Vec<Notification>) {
        if let Some(callback) = &self.callback {
            out.push(Notification {
                callback: Arc::clone(callback),
                delivery,
            });
        }
    }

    fn next_unsent(&self) -> Option<Range<u32>> {
        let mut covered = self.sent.clone();
        for r in self.acked.iter() {
            covered.insert(r.start, r.end);
        }
        covered.first_gap(self.len())
    }

    fn is_stale(&self, now: Instant) -> bool {
        self.last_progress
            .is_some_and(|at| now.saturating_duration_since(at) >= SPECULATIVE_RESEND_AFTER)
    }

    /// Whether [`take_fragment`](Self::take_fragment) would return data at `now`.
    pub fn has_sendable(&self, now: Instant) -> bool {
        !self.done && (self.next_unsent().is_some() || self.is_stale(now))
    }

    /// When unacknowledged data next becomes eligible for a speculative
    /// resend, if everything has been sent.
    pub fn resend_at(&self) -> Option<Instant> {
        if self.done || self.next_unsent().is_some() {
            return None;
        }
        self.last_progress.map(|at| at + SPECULATIVE_RESEND_AFTER)
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Cut the next fragment of at most `max_len` bytes and mark it sent.
    ///
    /// Never-sent bytes come first. Acknowledged bytes are never returned.
    pub fn take_fragment(
        &mut self,
        max_len: usize,
        now: Instant,
        out: &mut Vec<Notification>,
    ) -> Option<Fragment> {
        if self.done || max_len == 0 {
            return None;
        }
        let gap = match self.next_unsent() {
            Some(gap) => gap,
            None if self.is_stale(now) => {
                self.sent = self.acked.clone();
                self.last_progress = Some(now);
                self.next_unsent()?
            }
            None => return None,
        };

        let max_len = u32::try_from(max_len).unwrap_or(u32::MAX);
        let range = gap.start..gap.end.min(gap.start.saturating_add(max_len));
        self.sent.insert(range.start, range.end);
        self.last_progress.get_or_insert(now);

        let resent = self
            .in_flight
            .iter()
            .any(|f| f.range.start < range.end && range.start < f.range.end);
        self.in_flight
            .retain(|f| f.range.end <= range.start || range.end <= f.range.start);
        self.in_flight.push(InFlight {
            range: range.clone(),
            at: now,
            resent,
        });

        if !self.sent_reported && self.next_unsent().is_none() {
            self.sent_reported = true;
            self.notify(Delivery::Sent, out);
        }

        Some(Fragment {
            message_id: self.id,
            total_len: self.len(),
            offset: range.start,
            data: self.payload[range.start as usize..range.end as usize].to_vec(),
        })
    }

    /// Record that the peer holds `[start, end)`. Returns a round-trip
    /// sample when the ack unambiguously matches one transmission.
    pub fn ack(
        &mut self,
        start: u32,
        end: u32,
        now: Instant,
        out: &mut Vec<Notification>,
    ) -> Option<Duration> {
        if start >= end || end > self.len() {
            tracing::warn!(
                message_id = self.id,
                start,
                end,
                len = self.len(),
                "dropping malformed ack range"
            );
            return None;
        }
        if self.done {
            return None;
        }

        self.acked.insert(start, end);
        self.last_progress = Some(now);

        let sample = self
            .in_flight
            .iter()
            .find(|f| f.range == (start..end) && !f.resent)
            .map(|f| now.saturating_duration_since(f.at));
        self.in_flight
            .retain(|f| f.range.start < start || f.range.end > end);

        if self.is_acknowledged() {
            self.done = true;
            self.in_flight.clear();
            if !self.sent_reported {
                self.sent_reported = true;
                self.notify(Delivery::Sent, out);
            }
            self.notify(Delivery::Acknowledged, out);
        }
        sample
    }

    /// Forget `[start, end)` entirely so it is sent again.
    pub fn lost(&mut self, start: u32, end: u32) {
        if start >= end || end > self.len() {
            tracing::warn!(
                message_id = self.id,
                start,
                end,
                len = self.len(),
                "dropping malformed loss range"
            );
            return;
        }
        self.sent.remove(start, end);
        self.acked.remove(start, end);
    }

    fn fail(&mut self, delivery: Delivery, out: &mut Vec<Notification>) {
        if self.done {
            return;
        }
        self.done = true;
        self.notify(delivery, out);
    }
}

// ---------------------------------------------------------------------------
// OutgoingMessageQueue
// ---------------------------------------------------------------------------

/// Messages waiting for one peer, keyed by message id.
#[derive(Default)]
pub struct OutgoingMessageQueue {
    messages: BTreeMap<u32, QueuedMessage>,
    next_id: u32,
}

impl OutgoingMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&QueuedMessage> {
        self.messages.get(&id)
    }

    /// Queue `payload` and return its message id. An empty payload is
    /// complete as soon as it is queued.
    pub fn enqueue(
        &mut self,
        payload: Vec<u8>,
        priority: Priority,
        callback: Option<Arc<dyn SendCallback>>,
        expires_at: Instant,
        out: &mut Vec<Notification>,
    ) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let mut message = QueuedMessage::new(id, payload, priority, callback, expires_at);
        if message.is_empty() {
            message.notify(Delivery::Sent, out);
            message.notify(Delivery::Acknowledged, out);
            return id;
        }
        self.messages.insert(id, message);
        id
    }

    /// Next fragment across all messages, control traffic first, oldest
    /// message first within a class.
    pub fn take_fragment(
        &mut self,
        max_len: usize,
        now: Instant,
        out: &mut Vec<Notification>,
    ) -> Option<Fragment> {
        for priority in [Priority::Control, Priority::Bulk] {
            for message in self.messages.values_mut() {
                if message.priority != priority {
                    continue;
                }
                if let Some(fragment) = message.take_fragment(max_len, now, out) {
                    return Some(fragment);
                }
            }
        }
        None
    }

    pub fn ack(
        &mut self,
        message_id: u32,
        start: u32,
        end: u32,
        now: Instant,
        out: &mut Vec<Notification>,
    ) -> Option<Duration> {
        let Some(message) = self.messages.get_mut(&message_id) else {
            tracing::trace!(message_id, "ack for unknown or finished message");
            return None;
        };
        let sample = message.ack(start, end, now, out);
        if message.is_done() {
            self.messages.remove(&message_id);
        }
        sample
    }

    pub fn lost(&mut self, message_id: u32, start: u32, end: u32) {
        if let Some(message) = self.messages.get_mut(&message_id) {
            message.lost(start, end);
        }
    }

    /// Fail every message whose expiry has passed. Returns how many expired.
    pub fn expire(&mut self, now: Instant, out: &mut Vec<Notification>) -> usize {
        let before = self.messages.len();
        self.messages.retain(|_, message| {
            if message.expires_at > now {
                return true;
            }
            message.fail(Delivery::Failed(SendError::Expired), out);
            false
        });
        before - self.messages.len()
    }

    /// The peer went away: every queued message fails as disconnected.
    pub fn disconnect_all(&mut self, out: &mut Vec<Notification>) {
        for (_, mut message) in std::mem::take(&mut self.messages) {
            message.fail(Delivery::Disconnected, out);
        }
    }

    pub fn fail_all(&mut self, error: &SendError, out: &mut Vec<Notification>) {
        for (_, mut message) in std::mem::take(&mut self.messages) {
            message.fail(Delivery::Failed(error.clone()), out);
        }
    }

    pub fn has_sendable(&self, now: Instant) -> bool {
        self.messages.values().any(|m| m.has_sendable(now))
    }

    /// Earliest time a queued message needs attention without new input:
    /// a speculative resend or an expiry.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.messages
            .values()
            .flat_map(|m| [m.resend_at(), Some(m.expires_at)])
            .flatten()
            .min()
    }
}
