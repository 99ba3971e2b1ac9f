//! Correlation of inbound transfer messages with outstanding expectations.
//!
//! A caller registers a [`MessageFilter`] with a timeout and awaits the
//! returned [`Expectation`]. Each expectation resolves exactly once, to the
//! first of: a matching message, its deadline passing, or the required
//! source peer disconnecting or restarting. Expectations are never re-armed;
//! a caller that wants the next message registers again.
//!
//! Inbound messages are matched against expectations in registration order
//! and go to the first match only. A message nobody is waiting for is kept
//! for a short while in a bounded FIFO, so a message arriving between one
//! expectation resolving and the next being registered is not lost.
//!
//! Deadlines are kept in a min-heap; [`FilterDispatcher::run_reaper`] sleeps
//! until the earliest one and resolves whatever has expired.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use tessera_core::message::{MessageKind, TransferMessage};
use tessera_core::types::{PeerId, TransferId};
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;

use crate::config::DispatcherConfig;

// ---- Filters ----

/// Set of message kinds, one bit per [`MessageKind`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindSet(u8);

impl KindSet {
    pub const ALL: KindSet = KindSet(u8::MAX);

    pub const fn empty() -> Self {
        KindSet(0)
    }

    pub const fn with(self, kind: MessageKind) -> Self {
        KindSet(self.0 | kind.bit())
    }

    pub const fn contains(self, kind: MessageKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

impl FromIterator<MessageKind> for KindSet {
    fn from_iter<I: IntoIterator<Item = MessageKind>>(iter: I) -> Self {
        iter.into_iter().fold(KindSet::empty(), KindSet::with)
    }
}

/// Predicate over `(source, message)`.
///
/// A `Match` requires every field it names to be equal; `Or` matches if
/// either side does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFilter {
    Match {
        kinds: KindSet,
        transfer_id: Option<TransferId>,
        source: Option<PeerId>,
    },
    Or(Box<MessageFilter>, Box<MessageFilter>),
}

impl MessageFilter {
    /// Matches any of `kinds`, from anyone, for any transfer.
    pub fn kinds(kinds: impl IntoIterator<Item = MessageKind>) -> Self {
        MessageFilter::Match {
            kinds: kinds.into_iter().collect(),
            transfer_id: None,
            source: None,
        }
    }

    pub fn kind(kind: MessageKind) -> Self {
        Self::kinds([kind])
    }

    /// Restrict to one transfer. Applies to both sides of an `Or`.
    #[must_use]
    pub fn transfer(self, id: TransferId) -> Self {
        match self {
            MessageFilter::Match { kinds, source, .. } => MessageFilter::Match {
                kinds,
                transfer_id: Some(id),
                source,
            },
            MessageFilter::Or(a, b) => {
                MessageFilter::Or(Box::new(a.transfer(id)), Box::new(b.transfer(id)))
            }
        }
    }

    /// Restrict to one source peer. Applies to both sides of an `Or`.
    #[must_use]
    pub fn source(self, peer: PeerId) -> Self {
        match self {
            MessageFilter::Match {
                kinds, transfer_id, ..
            } => MessageFilter::Match {
                kinds,
                transfer_id,
                source: Some(peer),
            },
            MessageFilter::Or(a, b) => {
                MessageFilter::Or(Box::new(a.source(peer)), Box::new(b.source(peer)))
            }
        }
    }

    #[must_use]
    pub fn or(self, other: MessageFilter) -> Self {
        MessageFilter::Or(Box::new(self), Box::new(other))
    }

    pub fn matches(&self, from: PeerId, message: &TransferMessage) -> bool {
        match self {
            MessageFilter::Match {
                kinds,
                transfer_id,
                source,
            } => {
                kinds.contains(message.kind())
                    && transfer_id.is_none_or(|id| id == message.transfer_id())
                    && source.is_none_or(|p| p == from)
            }
            MessageFilter::Or(a, b) => a.matches(from, message) || b.matches(from, message),
        }
    }

    /// True if any branch insists on `peer` as the source. Losing that peer
    /// resolves the whole expectation.
    pub fn requires_source(&self, peer: PeerId) -> bool {
        match self {
            MessageFilter::Match { source, .. } => *source == Some(peer),
            MessageFilter::Or(a, b) => a.requires_source(peer) || b.requires_source(peer),
        }
    }
}

// ---- Outcomes ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    Matched {
        from: PeerId,
        message: TransferMessage,
    },
    TimedOut,
    Disconnected(PeerId),
    Restarted(PeerId),
    /// The dispatcher shut down.
    Closed,
}

// ---- Dispatcher ----

struct Pending {
    filter: MessageFilter,
    deadline: Instant,
    tx: oneshot::Sender<FilterOutcome>,
}

struct Unclaimed {
    from: PeerId,
    message: TransferMessage,
    at: Instant,
}

#[derive(Default)]
struct DispatcherState {
    next_id: u64,
    pending: BTreeMap<u64, Pending>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    unclaimed: VecDeque<Unclaimed>,
    closed: bool,
}

struct DispatcherInner {
    config: DispatcherConfig,
    state: Mutex<DispatcherState>,
    wake: Notify,
}

impl DispatcherInner {
    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct FilterDispatcher {
    inner: Arc<DispatcherInner>,
}

impl FilterDispatcher {
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                state: Mutex::new(DispatcherState::default()),
                wake: Notify::new(),
            }),
        }
    }

    /// Register `filter`, resolving with `TimedOut` after `timeout`.
    ///
    /// A still-fresh unclaimed message that matches resolves the
    /// expectation immediately.
    pub fn expect(&self, filter: MessageFilter, timeout: Duration) -> Expectation {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let mut state = self.inner.lock();

        if state.closed {
            let _ = tx.send(FilterOutcome::Closed);
            return Expectation::resolved(rx, Weak::new());
        }

        prune_unclaimed(&mut state, now, self.inner.config.unclaimed_ttl);
        let claimed = state
            .unclaimed
            .iter()
            .position(|u| filter.matches(u.from, &u.message))
            .and_then(|pos| state.unclaimed.remove(pos));
        if let Some(u) = claimed {
            tracing::trace!(
                from = %u.from,
                kind = %u.message.kind(),
                transfer_id = %u.message.transfer_id(),
                "expectation claimed buffered message"
            );
            let _ = tx.send(FilterOutcome::Matched {
                from: u.from,
                message: u.message,
            });
            return Expectation::resolved(rx, Arc::downgrade(&self.inner));
        }

        let id = state.next_id;
        state.next_id += 1;
        let deadline = now + timeout;
        let earliest = state
            .deadlines
            .peek()
            .is_none_or(|Reverse((d, _))| deadline < *d);
        state.pending.insert(
            id,
            Pending {
                filter,
                deadline,
                tx,
            },
        );
        state.deadlines.push(Reverse((deadline, id)));
        drop(state);

        if earliest {
            self.inner.wake.notify_one();
        }

        Expectation {
            id: Some(id),
            rx,
            dispatcher: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an inbound message to the oldest matching expectation.
    ///
    /// Returns `false` if nothing matched; the message is then buffered for
    /// a later `expect`.
    pub fn dispatch(&self, from: PeerId, message: TransferMessage) -> bool {
        let now = Instant::now();
        let mut state = self.inner.lock();
        if state.closed {
            return false;
        }

        let mut message = message;
        loop {
            let hit = state
                .pending
                .iter()
                .find(|(_, p)| p.deadline > now && p.filter.matches(from, &message))
                .map(|(id, _)| *id);
            let Some(id) = hit else { break };
            let Some(pending) = state.pending.remove(&id) else {
                break;
            };
            match pending.tx.send(FilterOutcome::Matched { from, message }) {
                Ok(()) => return true,
                // Waiter went away without deregistering; try the next one.
                Err(FilterOutcome::Matched { message: m, .. }) => message = m,
                Err(_) => return true,
            }
        }

        tracing::trace!(
            from = %from,
            kind = %message.kind(),
            transfer_id = %message.transfer_id(),
            "no expectation for message, buffering"
        );
        prune_unclaimed(&mut state, now, self.inner.config.unclaimed_ttl);
        if state.unclaimed.len() >= self.inner.config.unclaimed_capacity {
            state.unclaimed.pop_front();
        }
        state.unclaimed.push_back(Unclaimed {
            from,
            message,
            at: now,
        });
        false
    }

    /// Resolve every expectation requiring `peer` with `Disconnected`.
    pub fn peer_disconnected(&self, peer: PeerId) -> usize {
        self.drop_peer(peer, FilterOutcome::Disconnected(peer))
    }

    /// Resolve every expectation requiring `peer` with `Restarted`.
    pub fn peer_restarted(&self, peer: PeerId) -> usize {
        self.drop_peer(peer, FilterOutcome::Restarted(peer))
    }

    fn drop_peer(&self, peer: PeerId, outcome: FilterOutcome) -> usize {
        let mut state = self.inner.lock();
        let ids: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, p)| p.filter.requires_source(peer))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(p) = state.pending.remove(id) {
                let _ = p.tx.send(outcome.clone());
            }
        }
        state.unclaimed.retain(|u| u.from != peer);
        drop(state);

        if !ids.is_empty() {
            tracing::debug!(peer = %peer, resolved = ids.len(), outcome = ?outcome, "resolved expectations for peer");
        }
        ids.len()
    }

    /// Resolve every expectation whose deadline is at or before `now`.
    pub fn expire(&self, now: Instant) -> usize {
        let mut state = self.inner.lock();
        let mut expired = 0;
        while let Some(Reverse((deadline, id))) = state.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            state.deadlines.pop();
            // ids are never reused, so a missing id was resolved earlier
            if let Some(p) = state.pending.remove(&id) {
                let _ = p.tx.send(FilterOutcome::TimedOut);
                expired += 1;
            }
        }
        prune_unclaimed(&mut state, now, self.inner.config.unclaimed_ttl);
        expired
    }

    /// Earliest live deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut state = self.inner.lock();
        while let Some(Reverse((deadline, id))) = state.deadlines.peek().copied() {
            if state.pending.contains_key(&id) {
                return Some(deadline);
            }
            state.deadlines.pop();
        }
        None
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn unclaimed_count(&self) -> usize {
        self.inner.lock().unclaimed.len()
    }

    /// Resolve everything with `Closed` and refuse further registrations.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        let pending = std::mem::take(&mut state.pending);
        state.deadlines.clear();
        state.unclaimed.clear();
        drop(state);
        for (_, p) in pending {
            let _ = p.tx.send(FilterOutcome::Closed);
        }
        self.inner.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Timeout loop. Returns once the dispatcher is closed.
    pub async fn run_reaper(self) {
        loop {
            if self.is_closed() {
                break;
            }
            let next = self.next_deadline();
            let sleep = async {
                match next {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                () = sleep => {
                    let expired = self.expire(Instant::now());
                    if expired > 0 {
                        tracing::trace!(expired, "expectations timed out");
                    }
                }
                () = self.inner.wake.notified() => {}
            }
        }
        tracing::debug!("filter reaper stopped");
    }

    /// Spawn [`run_reaper`](Self::run_reaper) on the current runtime.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.clone().run_reaper())
    }

    fn deregister(inner: &DispatcherInner, id: u64) {
        inner.lock().pending.remove(&id);
    }

    fn requeue(inner: &DispatcherInner, from: PeerId, message: TransferMessage) {
        inner.lock().unclaimed.push_front(Unclaimed {
            from,
            message,
            at: Instant::now(),
        });
    }
}

impl Default for FilterDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn prune_unclaimed(state: &mut DispatcherState, now: Instant, ttl: Duration) {
    while state
        .unclaimed
        .front()
        .is_some_and(|u| now.saturating_duration_since(u.at) > ttl)
    {
        state.unclaimed.pop_front();
    }
}

// ---- Expectation ----

/// Awaitable result of [`FilterDispatcher::expect`].
///
/// Dropping an unresolved expectation deregisters it. A message that was
/// matched to it but never observed goes back to the unclaimed buffer.
pub struct Expectation {
    id: Option<u64>,
    rx: oneshot::Receiver<FilterOutcome>,
    dispatcher: Weak<DispatcherInner>,
}

impl Expectation {
    fn resolved(rx: oneshot::Receiver<FilterOutcome>, dispatcher: Weak<DispatcherInner>) -> Self {
        Self {
            id: None,
            rx,
            dispatcher,
        }
    }
}

impl Future for Expectation {
    type Output = FilterOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.id = None;
                Poll::Ready(result.unwrap_or(FilterOutcome::Closed))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Expectation {
    fn drop(&mut self) {
        let Some(inner) = self.dispatcher.upgrade() else {
            return;
        };
        if let Some(id) = self.id.take() {
            FilterDispatcher::deregister(&inner, id);
        }
        if let Ok(FilterOutcome::Matched { from, message }) = self.rx.try_recv() {
            FilterDispatcher::requeue(&inner, from, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(b: u8) -> PeerId {
        PeerId::new([b; 16])
    }

    fn all_sent(id: u64) -> TransferMessage {
        TransferMessage::AllSent {
            transfer_id: TransferId::new(id),
        }
    }

    fn all_received(id: u64) -> TransferMessage {
        TransferMessage::AllReceived {
            transfer_id: TransferId::new(id),
        }
    }

    #[test]
    fn filter_fields_must_all_match() {
        let f = MessageFilter::kind(MessageKind::AllSent)
            .transfer(TransferId::new(1))
            .source(peer(1));
        assert!(f.matches(peer(1), &all_sent(1)));
        assert!(!f.matches(peer(2), &all_sent(1)));
        assert!(!f.matches(peer(1), &all_sent(2)));
        assert!(!f.matches(peer(1), &all_received(1)));
    }

    #[test]
    fn or_filter_matches_either_branch() {
        let f = MessageFilter::kind(MessageKind::AllSent)
            .source(peer(1))
            .or(MessageFilter::kind(MessageKind::AllReceived));
        assert!(f.matches(peer(1), &all_sent(5)));
        assert!(f.matches(peer(9), &all_received(5)));
        assert!(!f.matches(peer(9), &all_sent(5)));
        assert!(f.requires_source(peer(1)));
        assert!(!f.requires_source(peer(9)));
    }

    #[tokio::test]
    async fn dispatch_resolves_first_registered_match() {
        let d = FilterDispatcher::new();
        let filter = MessageFilter::kind(MessageKind::AllSent);
        let first = d.expect(filter.clone(), Duration::from_secs(5));
        let second = d.expect(filter, Duration::from_secs(5));

        assert!(d.dispatch(peer(1), all_sent(1)));
        assert_eq!(d.pending_count(), 1);
        assert_eq!(
            first.await,
            FilterOutcome::Matched {
                from: peer(1),
                message: all_sent(1)
            }
        );
        drop(second);
        assert_eq!(d.pending_count(), 0);
    }

    #[tokio::test]
    async fn unmatched_message_waits_for_late_expectation() {
        let d = FilterDispatcher::new();
        assert!(!d.dispatch(peer(1), all_sent(3)));
        assert_eq!(d.unclaimed_count(), 1);

        let e = d.expect(
            MessageFilter::kind(MessageKind::AllSent).transfer(TransferId::new(3)),
            Duration::from_secs(1),
        );
        assert!(matches!(e.await, FilterOutcome::Matched { .. }));
        assert_eq!(d.unclaimed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_messages_expire() {
        let d = FilterDispatcher::new();
        d.dispatch(peer(1), all_sent(3));
        tokio::time::advance(Duration::from_secs(11)).await;

        let _reaper = d.spawn_reaper();
        let e = d.expect(
            MessageFilter::kind(MessageKind::AllSent),
            Duration::from_secs(1),
        );
        assert_eq!(e.await, FilterOutcome::TimedOut);
    }

    #[tokio::test]
    async fn unclaimed_buffer_is_bounded() {
        let d = FilterDispatcher::with_config(DispatcherConfig {
            unclaimed_capacity: 2,
            unclaimed_ttl: Duration::from_secs(10),
        });
        for i in 0..5 {
            d.dispatch(peer(1), all_sent(i));
        }
        assert_eq!(d.unclaimed_count(), 2);

        // oldest were evicted
        let evicted = d.expect(
            MessageFilter::kind(MessageKind::AllSent).transfer(TransferId::new(0)),
            Duration::from_secs(1),
        );
        assert_eq!(d.pending_count(), 1);
        drop(evicted);

        let kept = d.expect(
            MessageFilter::kind(MessageKind::AllSent).transfer(TransferId::new(4)),
            Duration::from_secs(1),
        );
        assert!(matches!(kept.await, FilterOutcome::Matched { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_times_out_expectations() {
        let d = FilterDispatcher::new();
        let _reaper = d.spawn_reaper();

        let long = d.expect(MessageFilter::kind(MessageKind::AllSent), Duration::from_secs(60));
        let short = d.expect(MessageFilter::kind(MessageKind::AllSent), Duration::from_secs(2));

        let started = Instant::now();
        assert_eq!(short.await, FilterOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(d.pending_count(), 1);
        assert_eq!(long.await, FilterOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn expired_expectation_does_not_match() {
        let d = FilterDispatcher::new();
        let e = d.expect(MessageFilter::kind(MessageKind::AllSent), Duration::ZERO);
        assert!(!d.dispatch(peer(1), all_sent(1)));
        assert_eq!(d.expire(Instant::now()), 1);
        assert_eq!(e.await, FilterOutcome::TimedOut);
    }

    #[tokio::test]
    async fn disconnect_resolves_only_that_peers_expectations() {
        let d = FilterDispatcher::new();
        let a = d.expect(
            MessageFilter::kind(MessageKind::AllSent).source(peer(1)),
            Duration::from_secs(5),
        );
        let b = d.expect(
            MessageFilter::kind(MessageKind::AllSent).source(peer(2)),
            Duration::from_secs(5),
        );
        let any = d.expect(MessageFilter::kind(MessageKind::AllSent), Duration::from_secs(5));

        assert_eq!(d.peer_disconnected(peer(1)), 1);
        assert_eq!(a.await, FilterOutcome::Disconnected(peer(1)));

        assert_eq!(d.peer_restarted(peer(2)), 1);
        assert_eq!(b.await, FilterOutcome::Restarted(peer(2)));

        assert_eq!(d.pending_count(), 1);
        drop(any);
    }

    #[tokio::test]
    async fn disconnect_purges_unclaimed_from_peer() {
        let d = FilterDispatcher::new();
        d.dispatch(peer(1), all_sent(1));
        d.dispatch(peer(2), all_sent(1));
        d.peer_disconnected(peer(1));
        assert_eq!(d.unclaimed_count(), 1);
    }

    #[tokio::test]
    async fn dropped_expectation_deregisters() {
        let d = FilterDispatcher::new();
        let e = d.expect(MessageFilter::kind(MessageKind::AllSent), Duration::from_secs(5));
        assert_eq!(d.pending_count(), 1);
        drop(e);
        assert_eq!(d.pending_count(), 0);
        assert_eq!(d.next_deadline(), None);
    }

    #[tokio::test]
    async fn matched_but_unobserved_message_is_requeued() {
        let d = FilterDispatcher::new();
        let e = d.expect(MessageFilter::kind(MessageKind::AllSent), Duration::from_secs(5));
        assert!(d.dispatch(peer(1), all_sent(7)));
        drop(e);
        assert_eq!(d.unclaimed_count(), 1);

        let again = d.expect(MessageFilter::kind(MessageKind::AllSent), Duration::from_secs(5));
        assert_eq!(
            again.await,
            FilterOutcome::Matched {
                from: peer(1),
                message: all_sent(7)
            }
        );
    }

    #[tokio::test]
    async fn close_resolves_everything() {
        let d = FilterDispatcher::new();
        let reaper = d.spawn_reaper();
        let e = d.expect(MessageFilter::kind(MessageKind::AllSent), Duration::from_secs(5));
        d.close();
        assert_eq!(e.await, FilterOutcome::Closed);
        let late = d.expect(MessageFilter::kind(MessageKind::AllSent), Duration::from_secs(5));
        assert_eq!(late.await, FilterOutcome::Closed);
        reaper.await.unwrap();
    }
}
