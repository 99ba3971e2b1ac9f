//! Receive side of a block transfer.
//!
//! The receiver owns its buffer until the block is complete. It waits for
//! `PacketTransmit`, `AllSent` and `SendAborted` from the sender, bounded by
//! `receipt_timeout`:
//!
//! - a packet is stored, and the sender's view of what it has put on the
//!   wire is compared with what arrived. Anything missing that was not
//!   requested within the last holdoff is requested in one notification;
//! - `AllSent` or a timeout triggers a full sweep of missing packets. Each
//!   sweep counts against the sender until a new packet is stored; after
//!   `max_consecutive_missing_reports` sweeps in a row the sender is
//!   presumed dead;
//! - `SendAborted`, a disconnect or a restart end the transfer.
//!
//! Every failure aborts the buffer. Once the buffer is full the receiver
//! answers `AllReceived` (unless told not to) and hands the buffer back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tessera_core::abort::{AbortCode, AbortReason};
use tessera_core::bitmap::PacketBitmap;
use tessera_core::buffer::{BlockBuffer, BufferListener};
use tessera_core::error::BufferError;
use tessera_core::message::{MessageKind, TransferMessage};
use tessera_core::types::{PeerId, TransferId};
use tokio::sync::{Notify, oneshot, watch};
use tokio::time::Instant;

use crate::context::TransferContext;
use crate::error::{AbortOrigin, TransferError};
use crate::filter::{FilterOutcome, MessageFilter};
use crate::stats::TransferStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Send `AllReceived` as soon as the buffer is full. Disable when the
    /// content must be verified first; the caller then confirms with
    /// [`TransferContext::acknowledge`] or refuses with
    /// [`TransferContext::reject`].
    pub acknowledge_completion: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            acknowledge_completion: true,
        }
    }
}

struct ReceiverShared {
    wake: Notify,
    stats: Mutex<TransferStats>,
}

impl ReceiverShared {
    fn stats(&self) -> MutexGuard<'_, TransferStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ReceiverListener(Weak<ReceiverShared>);

impl BufferListener for ReceiverListener {
    fn packet_received(&self, _index: u32) {}

    fn aborted(&self, _reason: &AbortReason) {
        if let Some(shared) = self.0.upgrade() {
            shared.wake.notify_one();
        }
    }
}

struct Receiver {
    ctx: TransferContext,
    peer: PeerId,
    transfer_id: TransferId,
    buffer: BlockBuffer,
    options: ReceiveOptions,
    shared: Arc<ReceiverShared>,
    /// Earliest time each packet may be requested again.
    requested: HashMap<u32, Instant>,
    no_progress: u32,
    sender_aborted: bool,
}

pub(crate) fn start(
    ctx: TransferContext,
    peer: PeerId,
    transfer_id: TransferId,
    buffer: BlockBuffer,
    options: ReceiveOptions,
) -> ReceiveHandle {
    let (result_tx, result_rx) = oneshot::channel();
    let (done_tx, done_rx) = watch::channel(false);
    let shared = Arc::new(ReceiverShared {
        wake: Notify::new(),
        stats: Mutex::new(TransferStats::default()),
    });
    let listener = buffer.subscribe(Arc::new(ReceiverListener(Arc::downgrade(&shared))));

    tracing::info!(
        peer = %peer,
        transfer_id = %transfer_id,
        len = buffer.len(),
        packets = buffer.packet_count(),
        "starting block receive"
    );

    let mut receiver = Receiver {
        ctx,
        peer,
        transfer_id,
        buffer: buffer.clone(),
        options,
        shared: Arc::clone(&shared),
        requested: HashMap::new(),
        no_progress: 0,
        sender_aborted: false,
    };

    tokio::spawn(async move {
        let result = receiver.run().await;
        receiver.buffer.unsubscribe(listener);
        let stats = *receiver.shared.stats();
        match &result {
            Ok(()) => tracing::info!(
                peer = %receiver.peer,
                transfer_id = %receiver.transfer_id,
                received = stats.packets_received,
                duplicates = stats.duplicate_packets,
                missing_reports = stats.missing_reports,
                "block receive complete"
            ),
            Err(e) => tracing::info!(
                peer = %receiver.peer,
                transfer_id = %receiver.transfer_id,
                error = %e,
                received = stats.packets_received,
                "block receive failed"
            ),
        }
        let _ = result_tx.send(result.map(|()| receiver.buffer.clone()));
        done_tx.send_replace(true);
    });

    ReceiveHandle {
        peer,
        transfer_id,
        buffer,
        shared,
        result: result_rx,
        done: done_rx,
    }
}

impl Receiver {
    async fn run(&mut self) -> Result<(), TransferError> {
        let filter = MessageFilter::kinds([
            MessageKind::PacketTransmit,
            MessageKind::AllSent,
            MessageKind::SendAborted,
        ])
        .transfer(self.transfer_id)
        .source(self.peer);

        loop {
            if let Some(reason) = self.buffer.abort_reason() {
                return Err(self.aborted_locally(reason));
            }
            if self.buffer.is_complete() {
                self.completed();
                return Ok(());
            }

            let expectation = self
                .ctx
                .dispatcher
                .expect(filter.clone(), self.ctx.config.receipt_timeout);
            let outcome = tokio::select! {
                biased;
                outcome = expectation => outcome,
                () = self.shared.wake.notified() => continue,
            };

            match outcome {
                FilterOutcome::Matched { message, .. } => match message {
                    TransferMessage::PacketTransmit {
                        packet_index,
                        sent,
                        data,
                        ..
                    } => self.packet(packet_index, &sent, &data),
                    TransferMessage::AllSent { .. } => self.report_missing("sender finished")?,
                    TransferMessage::SendAborted {
                        code, description, ..
                    } => {
                        self.sender_aborted = true;
                        self.buffer.abort(code, description.clone());
                        return Err(TransferError::Aborted {
                            origin: AbortOrigin::Remote,
                            code,
                            description,
                        });
                    }
                    other => tracing::warn!(
                        peer = %self.peer,
                        kind = %other.kind(),
                        "unexpected message for receiver"
                    ),
                },
                FilterOutcome::TimedOut => self.report_missing("receipt timeout")?,
                FilterOutcome::Disconnected(_) => {
                    self.buffer
                        .abort(AbortCode::Disconnected, "sender disconnected");
                    return Err(TransferError::PeerDisconnected);
                }
                FilterOutcome::Restarted(_) => {
                    self.buffer.abort(AbortCode::Restarted, "sender restarted");
                    return Err(TransferError::PeerRestarted);
                }
                FilterOutcome::Closed => {
                    self.buffer.abort(AbortCode::Internal, "node shutting down");
                    return Err(TransferError::Internal("dispatcher closed".into()));
                }
            }
        }
    }

    fn packet(&mut self, index: u32, sent: &PacketBitmap, data: &[u8]) {
        if sent.len() != self.buffer.packet_count() {
            tracing::warn!(
                peer = %self.peer,
                transfer_id = %self.transfer_id,
                bitmap = sent.len(),
                packets = self.buffer.packet_count(),
                "sender bitmap does not match block size, dropping packet"
            );
            return;
        }
        match self.buffer.add_packet(index, data) {
            Ok(true) => {
                self.shared.stats().packets_received += 1;
                self.no_progress = 0;
            }
            Ok(false) => self.shared.stats().duplicate_packets += 1,
            // picked up at the top of the loop
            Err(BufferError::Aborted(_)) => return,
            Err(e) => {
                tracing::warn!(
                    peer = %self.peer,
                    transfer_id = %self.transfer_id,
                    index,
                    error = %e,
                    "dropping malformed packet"
                );
                return;
            }
        }
        self.requested.remove(&index);

        let now = Instant::now();
        let received = self.buffer.received_bitmap();
        let missing: Vec<u32> = sent
            .difference(&received)
            .filter(|i| self.requested.get(i).is_none_or(|&at| now >= at))
            .collect();
        if !missing.is_empty() {
            self.request(missing, now);
        }
    }

    /// A sweep with no new packet since the last one. Gives up once
    /// `max_consecutive_missing_reports` sweeps in a row went unanswered.
    fn report_missing(&mut self, why: &'static str) -> Result<(), TransferError> {
        if self.no_progress >= self.ctx.config.max_consecutive_missing_reports {
            tracing::warn!(
                peer = %self.peer,
                transfer_id = %self.transfer_id,
                reports = self.no_progress,
                why,
                "sender stopped responding"
            );
            self.buffer
                .abort(AbortCode::SenderDied, "sender stopped responding");
            self.notify_sender(AbortCode::SenderDied, "no packets received");
            return Err(TransferError::SenderUnresponsive);
        }
        self.no_progress += 1;
        self.sweep(why);
        Ok(())
    }

    /// Request every packet not yet received, ignoring the holdoff.
    fn sweep(&mut self, why: &'static str) {
        let missing: Vec<u32> = self.buffer.received_bitmap().iter_zeros().collect();
        if missing.is_empty() {
            return;
        }
        tracing::debug!(
            peer = %self.peer,
            transfer_id = %self.transfer_id,
            missing = missing.len(),
            why,
            "requesting all missing packets"
        );
        self.request(missing, Instant::now());
    }

    fn request(&mut self, packets: Vec<u32>, now: Instant) {
        let holdoff = self
            .ctx
            .config
            .resend_holdoff(self.ctx.sink.round_trip_estimate(self.peer));
        for &index in &packets {
            self.requested.insert(index, now + holdoff);
        }
        tracing::trace!(
            peer = %self.peer,
            transfer_id = %self.transfer_id,
            packets = ?packets,
            "sending missing packet notification"
        );
        self.shared.stats().missing_reports += 1;
        let message = TransferMessage::MissingPacketNotification {
            transfer_id: self.transfer_id,
            packets,
        };
        if let Err(e) = self.ctx.sink.send(self.peer, message, None) {
            tracing::debug!(peer = %self.peer, error = %e, "could not request missing packets");
        }
    }

    fn completed(&self) {
        if !self.options.acknowledge_completion {
            return;
        }
        let message = TransferMessage::AllReceived {
            transfer_id: self.transfer_id,
        };
        if let Err(e) = self.ctx.sink.send(self.peer, message, None) {
            tracing::debug!(peer = %self.peer, error = %e, "could not confirm block");
        }
    }

    fn aborted_locally(&self, reason: AbortReason) -> TransferError {
        if !self.sender_aborted {
            self.notify_sender(reason.code, &reason.description);
        }
        TransferError::Aborted {
            origin: AbortOrigin::Local,
            code: reason.code,
            description: reason.description,
        }
    }

    fn notify_sender(&self, code: AbortCode, description: &str) {
        let message = TransferMessage::SendAborted {
            transfer_id: self.transfer_id,
            code,
            description: description.to_string(),
        };
        if let Err(e) = self.ctx.sink.send(self.peer, message, None) {
            tracing::debug!(peer = %self.peer, error = %e, "could not send abort");
        }
    }
}

/// Caller's view of a running receive.
pub struct ReceiveHandle {
    peer: PeerId,
    transfer_id: TransferId,
    buffer: BlockBuffer,
    shared: Arc<ReceiverShared>,
    result: oneshot::Receiver<Result<BlockBuffer, TransferError>>,
    done: watch::Receiver<bool>,
}

impl std::fmt::Debug for ReceiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveHandle")
            .field("peer", &self.peer)
            .field("transfer_id", &self.transfer_id)
            .finish_non_exhaustive()
    }
}

impl ReceiveHandle {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    /// The buffer being filled. Useful to start forwarding before the
    /// receive completes.
    pub fn buffer(&self) -> &BlockBuffer {
        &self.buffer
    }

    pub fn stats(&self) -> TransferStats {
        *self.shared.stats()
    }

    pub fn done(&self) -> watch::Receiver<bool> {
        self.done.clone()
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Abort the receive and tell the sender.
    pub fn cancel(&self) {
        self.buffer
            .abort(AbortCode::Cancelled, "cancelled by receiver");
    }

    /// Wait for the filled buffer or the terminal error.
    pub async fn wait(self) -> Result<BlockBuffer, TransferError> {
        self.result
            .await
            .unwrap_or_else(|_| Err(TransferError::Internal("receiver task dropped".into())))
    }
}
