//! Transmit side of a block transfer.
//!
//! A sender walks a FIFO of packet indices, handing each packet to the
//! peer's outgoing queue as a `PacketTransmit` that also carries the set of
//! packets already on the wire. Only a few packets are handed over ahead of
//! the wire at any time, so requeued packets get out quickly.
//!
//! Progress is driven by send callbacks, not by a dedicated loop: each time
//! a packet reaches the wire the next one is pulled. A small task waits for
//! the receiver's `MissingPacketNotification`, `AllReceived` and
//! `SendAborted` messages.
//!
//! Once everything has been sent the sender announces `AllSent` and gives
//! the receiver `send_timeout` to confirm. A sender never aborts its buffer:
//! the same buffer may be feeding other senders.
//!
//! Lock order is buffer before session; neither is held while calling the
//! sink.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tessera_core::abort::{AbortCode, AbortReason};
use tessera_core::bitmap::PacketBitmap;
use tessera_core::buffer::{BlockBuffer, BufferListener, ListenerId};
use tessera_core::message::{MessageKind, TransferMessage};
use tessera_core::types::{PeerId, TransferId};
use tokio::sync::{Notify, oneshot, watch};
use tokio::time::Instant;

use crate::context::TransferContext;
use crate::error::{AbortOrigin, SendError, TransferError};
use crate::filter::{FilterOutcome, MessageFilter};
use crate::sink::SendCallback;
use crate::stats::TransferStats;

struct SenderState {
    unsent: VecDeque<u32>,
    /// Membership of `unsent`.
    in_unsent: PacketBitmap,
    /// Handed to the sink, not yet on the wire.
    queued: HashSet<u32>,
    sent: PacketBitmap,
    all_sent_at: Option<Instant>,
    finished: bool,
    listener: Option<ListenerId>,
    result_tx: Option<oneshot::Sender<Result<(), TransferError>>>,
    stats: TransferStats,
}

impl SenderState {
    fn schedule_back(&mut self, index: u32) {
        if !self.in_unsent.set(index) {
            self.unsent.push_back(index);
        }
    }
}

struct SenderSession {
    peer: PeerId,
    transfer_id: TransferId,
    buffer: BlockBuffer,
    ctx: TransferContext,
    wake: Notify,
    done: watch::Sender<bool>,
    state: Mutex<SenderState>,
}

pub(crate) fn start(
    ctx: TransferContext,
    peer: PeerId,
    transfer_id: TransferId,
    buffer: BlockBuffer,
) -> SendHandle {
    let (result_tx, result_rx) = oneshot::channel();
    let (done, _) = watch::channel(false);
    let packet_count = buffer.packet_count();

    let session = Arc::new(SenderSession {
        peer,
        transfer_id,
        buffer: buffer.clone(),
        ctx,
        wake: Notify::new(),
        done,
        state: Mutex::new(SenderState {
            unsent: VecDeque::new(),
            in_unsent: PacketBitmap::new(packet_count),
            queued: HashSet::new(),
            sent: PacketBitmap::new(packet_count),
            all_sent_at: None,
            finished: false,
            listener: None,
            result_tx: Some(result_tx),
            stats: TransferStats::default(),
        }),
    });

    tracing::info!(
        peer = %peer,
        transfer_id = %transfer_id,
        len = buffer.len(),
        packets = packet_count,
        have = buffer.received_count(),
        "starting block send"
    );

    // Subscribe before taking the snapshot so no arrival is missed; the
    // membership bitmap absorbs the overlap.
    let listener = buffer.subscribe(Arc::new(SenderListener(Arc::downgrade(&session))));
    let received = buffer.received_bitmap();
    let late_listener = {
        let mut state = session.lock();
        if state.finished {
            Some(listener)
        } else {
            state.listener = Some(listener);
            for index in received.iter_ones() {
                state.schedule_back(index);
            }
            None
        }
    };
    if let Some(id) = late_listener {
        buffer.unsubscribe(id);
    }

    tokio::spawn(Arc::clone(&session).run());
    session.pump();

    SendHandle {
        session,
        result: result_rx,
    }
}

impl SenderSession {
    fn lock(&self) -> MutexGuard<'_, SenderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand packets to the sink until the in-flight limit is reached.
    fn pump(self: &Arc<Self>) {
        loop {
            if let Some(reason) = self.buffer.abort_reason() {
                self.upstream_aborted(&reason);
                return;
            }

            let next = {
                let mut state = self.lock();
                if state.finished || state.queued.len() >= self.ctx.config.max_queued_packets {
                    return;
                }
                match state.unsent.pop_front() {
                    Some(index) => {
                        state.in_unsent.clear(index);
                        state.queued.insert(index);
                        let mut sent = state.sent.clone();
                        sent.set(index);
                        Some((index, sent))
                    }
                    None => None,
                }
            };
            let Some((index, sent)) = next else { break };

            let data = match self.buffer.packet(index) {
                Ok(data) => data,
                Err(e) => {
                    self.finish(Err(TransferError::Buffer(e)), true);
                    return;
                }
            };
            let message = TransferMessage::PacketTransmit {
                transfer_id: self.transfer_id,
                packet_index: index,
                sent,
                data,
            };
            let callback = Arc::new(PacketCallback {
                session: Arc::downgrade(self),
                index,
            });
            if let Err(e) = self.ctx.sink.send(self.peer, message, Some(callback)) {
                self.finish(Err(e.into()), false);
                return;
            }
            tracing::trace!(
                peer = %self.peer,
                transfer_id = %self.transfer_id,
                index,
                "packet handed to queue"
            );
        }
        self.maybe_all_sent();
    }

    fn maybe_all_sent(&self) {
        let announce = {
            let mut state = self.lock();
            let done = !state.finished
                && state.all_sent_at.is_none()
                && state.unsent.is_empty()
                && state.queued.is_empty()
                && state.sent.is_full();
            if done {
                state.all_sent_at = Some(Instant::now());
            }
            done
        };
        if !announce {
            return;
        }

        tracing::debug!(
            peer = %self.peer,
            transfer_id = %self.transfer_id,
            "all packets sent, awaiting confirmation"
        );
        let message = TransferMessage::AllSent {
            transfer_id: self.transfer_id,
        };
        if let Err(e) = self.ctx.sink.send(self.peer, message, None) {
            self.finish(Err(e.into()), false);
        }
    }

    fn packet_sent(self: &Arc<Self>, index: u32) {
        {
            let mut state = self.lock();
            if state.finished {
                return;
            }
            state.queued.remove(&index);
            state.sent.set(index);
            state.stats.packets_sent += 1;
        }
        self.pump();
    }

    fn packet_failed(&self, index: u32, error: TransferError) {
        tracing::debug!(
            peer = %self.peer,
            transfer_id = %self.transfer_id,
            index,
            error = %error,
            "packet could not be delivered"
        );
        self.finish(Err(error), false);
    }

    /// The buffer gained a packet (forwarding a block still being received).
    fn packet_arrived(self: &Arc<Self>, index: u32) {
        {
            let mut state = self.lock();
            if state.finished {
                return;
            }
            state.schedule_back(index);
        }
        self.pump();
    }

    fn upstream_aborted(&self, reason: &AbortReason) {
        self.finish(
            Err(TransferError::Aborted {
                origin: AbortOrigin::Local,
                code: reason.code,
                description: reason.description.clone(),
            }),
            true,
        );
    }

    fn missing_reported(self: &Arc<Self>, packets: &[u32]) {
        let available: Vec<u32> = packets
            .iter()
            .copied()
            .filter(|&index| {
                let have = self.buffer.is_received(index);
                if !have {
                    tracing::debug!(
                        peer = %self.peer,
                        transfer_id = %self.transfer_id,
                        index,
                        "receiver asked for a packet we do not have"
                    );
                }
                have
            })
            .collect();

        let requeued = {
            let mut state = self.lock();
            if state.finished {
                return;
            }
            state.stats.missing_reports += 1;
            let mut requeued = 0u64;
            for &index in available.iter().rev() {
                if state.queued.contains(&index) || state.in_unsent.get(index) {
                    continue;
                }
                state.sent.clear(index);
                state.in_unsent.set(index);
                state.unsent.push_front(index);
                requeued += 1;
            }
            if requeued > 0 {
                state.all_sent_at = None;
                state.stats.packets_resent += requeued;
            }
            requeued
        };

        tracing::debug!(
            peer = %self.peer,
            transfer_id = %self.transfer_id,
            reported = packets.len(),
            requeued,
            "receiver reported missing packets"
        );
        self.pump();
    }

    fn send_timed_out(&self) {
        let stalled = self
            .lock()
            .all_sent_at
            .is_some_and(|at| at.elapsed() >= self.ctx.config.send_timeout);
        if stalled {
            tracing::warn!(
                peer = %self.peer,
                transfer_id = %self.transfer_id,
                timeout_secs = self.ctx.config.send_timeout.as_secs(),
                "receiver never confirmed the block"
            );
            self.finish(Err(TransferError::ReceiverUnresponsive), true);
        }
    }

    /// Record the terminal result. Only the first call has any effect.
    fn finish(&self, result: Result<(), TransferError>, notify_peer: bool) {
        let (result_tx, listener, stats) = {
            let mut state = self.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            state.unsent.clear();
            (state.result_tx.take(), state.listener.take(), state.stats)
        };
        if let Some(id) = listener {
            self.buffer.unsubscribe(id);
        }

        match &result {
            Ok(()) => tracing::info!(
                peer = %self.peer,
                transfer_id = %self.transfer_id,
                sent = stats.packets_sent,
                resent = stats.packets_resent,
                "block send complete"
            ),
            Err(e) => {
                tracing::info!(
                    peer = %self.peer,
                    transfer_id = %self.transfer_id,
                    error = %e,
                    sent = stats.packets_sent,
                    "block send failed"
                );
                if notify_peer {
                    let message = TransferMessage::SendAborted {
                        transfer_id: self.transfer_id,
                        code: e.abort_code(),
                        description: e.to_string(),
                    };
                    if let Err(send_err) = self.ctx.sink.send(self.peer, message, None) {
                        tracing::debug!(peer = %self.peer, error = %send_err, "could not send abort");
                    }
                }
            }
        }

        if let Some(tx) = result_tx {
            let _ = tx.send(result);
        }
        self.done.send_replace(true);
        self.wake.notify_one();
    }

    async fn run(self: Arc<Self>) {
        let filter = MessageFilter::kinds([
            MessageKind::MissingPacketNotification,
            MessageKind::AllReceived,
            MessageKind::SendAborted,
        ])
        .transfer(self.transfer_id)
        .source(self.peer);
        let send_timeout = self.ctx.config.send_timeout;

        loop {
            let timeout = {
                let state = self.lock();
                if state.finished {
                    break;
                }
                match state.all_sent_at {
                    Some(at) => (at + send_timeout).saturating_duration_since(Instant::now()),
                    None => send_timeout,
                }
            };

            let expectation = self.ctx.dispatcher.expect(filter.clone(), timeout);
            let outcome = tokio::select! {
                biased;
                outcome = expectation => outcome,
                () = self.wake.notified() => continue,
            };

            match outcome {
                FilterOutcome::Matched { message, .. } => match message {
                    TransferMessage::MissingPacketNotification { packets, .. } => {
                        self.missing_reported(&packets)
                    }
                    TransferMessage::AllReceived { .. } => self.finish(Ok(()), false),
                    TransferMessage::SendAborted {
                        code, description, ..
                    } => self.finish(
                        Err(TransferError::Aborted {
                            origin: AbortOrigin::Remote,
                            code,
                            description,
                        }),
                        false,
                    ),
                    other => tracing::warn!(
                        peer = %self.peer,
                        kind = %other.kind(),
                        "unexpected message for sender"
                    ),
                },
                FilterOutcome::TimedOut => self.send_timed_out(),
                FilterOutcome::Disconnected(_) => {
                    self.finish(Err(TransferError::PeerDisconnected), false)
                }
                FilterOutcome::Restarted(_) => self.finish(Err(TransferError::PeerRestarted), false),
                FilterOutcome::Closed => self.finish(
                    Err(TransferError::Internal("dispatcher closed".into())),
                    false,
                ),
            }
        }
    }
}

struct SenderListener(Weak<SenderSession>);

impl BufferListener for SenderListener {
    fn packet_received(&self, index: u32) {
        if let Some(session) = self.0.upgrade() {
            session.packet_arrived(index);
        }
    }

    fn aborted(&self, reason: &AbortReason) {
        if let Some(session) = self.0.upgrade() {
            session.upstream_aborted(reason);
        }
    }
}

struct PacketCallback {
    session: Weak<SenderSession>,
    index: u32,
}

impl SendCallback for PacketCallback {
    fn sent(&self) {
        if let Some(session) = self.session.upgrade() {
            session.packet_sent(self.index);
        }
    }

    fn disconnected(&self) {
        if let Some(session) = self.session.upgrade() {
            session.packet_failed(self.index, TransferError::PeerDisconnected);
        }
    }

    fn failed(&self, error: &SendError) {
        if let Some(session) = self.session.upgrade() {
            session.packet_failed(self.index, error.clone().into());
        }
    }
}

/// Caller's view of a running send.
pub struct SendHandle {
    session: Arc<SenderSession>,
    result: oneshot::Receiver<Result<(), TransferError>>,
}

impl SendHandle {
    pub fn peer(&self) -> PeerId {
        self.session.peer
    }

    pub fn transfer_id(&self) -> TransferId {
        self.session.transfer_id
    }

    pub fn stats(&self) -> TransferStats {
        self.session.lock().stats
    }

    pub fn is_finished(&self) -> bool {
        self.session.lock().finished
    }

    /// Flips to `true` once the session has a result.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.session.done.subscribe()
    }

    /// Give up on the transfer and tell the receiver.
    pub fn cancel(&self) {
        self.session.finish(
            Err(TransferError::local(AbortCode::Cancelled, "cancelled by sender")),
            true,
        );
    }

    /// Wait for the terminal result.
    pub async fn wait(self) -> Result<(), TransferError> {
        self.result
            .await
            .unwrap_or_else(|_| Err(TransferError::Internal("sender session dropped".into())))
    }
}
