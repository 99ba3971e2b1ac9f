//! The node's single cooperative send loop.
//!
//! Each tick: bump the heartbeat, expire stale messages, refill the
//! bandwidth bucket, then walk the peers round-robin. A peer silent past the
//! dead-peer timeout is disconnected. A peer whose handshake is due gets one.
//! Otherwise a connected peer gets at most one data datagram carrying its
//! pending acks and, budget permitting, one fragment. Due timed jobs run
//! last. The loop then sleeps until the earliest deadline it saw, capped by
//! the coalescing delay, or until an enqueue wakes it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tessera_core::constants::{ACK_ENTRY_SIZE, MAX_ACKS_PER_DATAGRAM, max_fragment_payload};
use tessera_core::datagram::Datagram;
use tessera_core::types::PeerId;
use tessera_interfaces::{DatagramTransport, InterfaceError};
use tessera_protocol::SendError;
use tokio::time::Instant;

use crate::events::NodeEvent;
use crate::jobs::{JobKind, run_inline};
use crate::node::NodeShared;
use crate::queue::{Notification, fire_all};
use crate::throttle::TokenBucket;

/// Retry spacing after the transport refused a datagram.
const TRANSIENT_RETRY: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub mtu: usize,
    pub coalescing_delay: Duration,
    /// Bytes per second, 0 for unlimited.
    pub bandwidth_limit: u64,
    pub bucket_capacity: u64,
    pub dead_peer_timeout: Duration,
    pub handshake_interval: Duration,
    pub ack_delay: Duration,
    pub message_expiry: Duration,
}

impl SchedulerConfig {
    /// Acks one datagram may carry while leaving half the MTU for data.
    pub fn ack_capacity(&self) -> usize {
        MAX_ACKS_PER_DATAGRAM.min(self.mtu / 2 / ACK_ENTRY_SIZE).max(1)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        crate::config::NodeConfig::default().scheduler_config()
    }
}

/// Work collected under the peer lock, acted on after it is released.
#[derive(Default)]
struct TickOutput {
    notifications: Vec<Notification>,
    disconnected: Vec<PeerId>,
}

pub(crate) async fn run<T: DatagramTransport>(shared: Arc<NodeShared<T>>) {
    let config = shared.scheduler.clone();
    let start = Instant::now();
    let mut bucket = if config.bandwidth_limit == 0 {
        TokenBucket::unlimited(start)
    } else {
        TokenBucket::new(config.bandwidth_limit, config.bucket_capacity, start)
    };
    let handshake = match (Datagram::Handshake {
        node_id: shared.node_id,
        boot_id: shared.boot_id,
    })
    .encode()
    {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("cannot encode handshake, scheduler not running: {e}");
            return;
        }
    };
    let mut stop = shared.shutdown.subscribe();

    tracing::debug!(
        mtu = config.mtu,
        bandwidth_limit = config.bandwidth_limit,
        "scheduler started"
    );

    loop {
        if *stop.borrow() {
            break;
        }
        shared.heartbeat.beat();

        let now = Instant::now();
        let mut output = TickOutput::default();
        let mut next = tick(&*shared, &config, &handshake, &mut bucket, now, &mut output);

        fire_all(output.notifications);
        for peer in output.disconnected {
            shared.context.dispatcher.peer_disconnected(peer);
            shared.events.publish(NodeEvent::PeerDisconnected { peer });
        }

        run_due_jobs(&*shared, now);
        if let Some(at) = shared.lock_jobs().next_deadline() {
            next = next.min(at);
        }

        let now = Instant::now();
        if next <= now {
            tokio::task::yield_now().await;
            continue;
        }
        let until = next.min(now + config.coalescing_delay);
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            () = shared.wake.notified() => {}
            () = tokio::time::sleep_until(until) => {}
        }
    }

    tracing::debug!("scheduler stopped");
}

/// One pass over all peers. Returns the next time the loop has work.
fn tick<T: DatagramTransport>(
    shared: &NodeShared<T>,
    config: &SchedulerConfig,
    handshake: &[u8],
    bucket: &mut TokenBucket,
    now: Instant,
    output: &mut TickOutput,
) -> Instant {
    let mut next = now + config.coalescing_delay;
    let ack_capacity = config.ack_capacity();
    let out = &mut output.notifications;

    let mut peers = shared.lock_peers();
    for peer in peers.iter_mut() {
        let expired = peer.queue.expire(now, out);
        if expired > 0 {
            tracing::debug!(peer = %peer.id, expired, "messages expired before acknowledgement");
        }
    }

    bucket.refill(now);
    let mut exhausted_at = None;

    for idx in peers.round_robin() {
        let peer = peers.at_mut(idx);

        if peer.is_dead(now, config.dead_peer_timeout) {
            tracing::warn!(peer = %peer.id, addr = %peer.addr, "peer silent too long, disconnecting");
            peer.disconnect(now, out);
            output.disconnected.push(peer.id);
        }

        if peer.next_handshake <= now {
            peer.next_handshake = match shared.transport.try_send_to(handshake, peer.addr) {
                Ok(()) => {
                    tracing::trace!(peer = %peer.id, addr = %peer.addr, "handshake sent");
                    now + config.handshake_interval
                }
                Err(e) => {
                    tracing::debug!(peer = %peer.id, "handshake not sent: {e}");
                    now + config.coalescing_delay
                }
            };
            next = next.min(peer.next_handshake);
            if peer.connected {
                // data goes out on the next tick
                next = now;
            }
            continue;
        }
        next = next.min(peer.next_handshake);
        if !peer.connected {
            continue;
        }
        if let Some(at) = peer.dead_at(config.dead_peer_timeout) {
            next = next.min(at);
        }

        let mut fragment = None;
        if peer.queue.has_sendable(now) {
            if exhausted_at.is_none() && bucket.available_tokens() < config.mtu as u64 {
                exhausted_at = Some(idx);
            }
            if exhausted_at.is_none() {
                let acks = peer.pending_ack_count().min(ack_capacity);
                fragment = peer
                    .queue
                    .take_fragment(max_fragment_payload(config.mtu, acks), now, out);
            }
        }
        let acks = if fragment.is_some() || peer.acks_due(now, ack_capacity) {
            peer.take_acks(ack_capacity)
        } else {
            Vec::new()
        };

        if !acks.is_empty() || fragment.is_some() {
            let carries_data = fragment.is_some();
            let datagram = Datagram::Data { acks, fragment };
            match send_datagram(&shared.transport, &datagram, peer.addr) {
                Ok(len) => {
                    if carries_data {
                        bucket.consume(len as u64);
                    }
                    tracing::trace!(peer = %peer.id, len, "datagram sent");
                }
                Err(e) => {
                    if let Datagram::Data { acks, fragment } = datagram {
                        if let Some(f) = &fragment {
                            peer.queue.lost(f.message_id, f.offset, f.end());
                        }
                        peer.restore_acks(acks, now);
                    }
                    if is_retryable(&e) {
                        tracing::debug!(peer = %peer.id, "datagram deferred: {e}");
                        next = next.min(now + TRANSIENT_RETRY);
                        continue;
                    }
                    tracing::warn!(peer = %peer.id, "failing queued messages after send error: {e}");
                    peer.queue.fail_all(&SendError::Fatal(e.to_string()), out);
                }
            }
        }

        if let Some(at) = peer.ack_deadline() {
            next = next.min(at);
        }
        if let Some(at) = peer.queue.next_deadline() {
            next = next.min(at);
        }
        if peer.queue.has_sendable(now) {
            if exhausted_at.is_some() {
                let wait = Duration::from_nanos(bucket.nanos_until(config.mtu as u64));
                next = next.min(now + wait);
            } else {
                next = now;
            }
        }
    }

    if let Some(idx) = exhausted_at {
        // the next pass starts after the peer that ran out of budget
        peers.cursor = (idx + 1) % peers.len();
    }
    next
}

fn send_datagram<T: DatagramTransport>(
    transport: &T,
    datagram: &Datagram,
    target: SocketAddr,
) -> Result<usize, InterfaceError> {
    let bytes = datagram
        .encode()
        .map_err(|e| InterfaceError::TransmitFailed(e.to_string()))?;
    transport.try_send_to(&bytes, target)?;
    Ok(bytes.len())
}

/// Whether a refused datagram should simply be tried again later.
fn is_retryable(error: &InterfaceError) -> bool {
    error.is_transient() || matches!(error, InterfaceError::NotConnected | InterfaceError::Stopped)
}

fn run_due_jobs<T: DatagramTransport>(shared: &NodeShared<T>, now: Instant) {
    let due = shared.lock_jobs().take_due(now);
    for job in due {
        match job.kind {
            JobKind::Inline => {
                run_inline(&job.name, job.run);
            }
            JobKind::Pooled => shared.pool.execute(job.run, job.name),
        }
    }
}
