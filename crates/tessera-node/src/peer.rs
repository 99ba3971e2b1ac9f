//! Per-peer link state and the peer table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tessera_core::datagram::AckRange;
use tessera_core::types::{BootId, PeerId};
use tokio::time::Instant;

use crate::queue::{Notification, OutgoingMessageQueue};
use crate::reassembly::InboundAssembler;

/// What a received handshake meant for the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTransition {
    /// Already connected, same incarnation.
    Keepalive,
    Connected { boot_id: BootId },
    /// Connected peer announced a new boot id; its old state is gone.
    Restarted { boot_id: BootId },
}

pub struct PeerState {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub connected: bool,
    pub boot_id: Option<BootId>,
    pub last_heard: Option<Instant>,
    pub next_handshake: Instant,
    pub queue: OutgoingMessageQueue,
    pub assembler: InboundAssembler,
    pending_acks: Vec<AckRange>,
    ack_deadline: Option<Instant>,
    srtt: Option<Duration>,
}

impl PeerState {
    pub fn new(id: PeerId, addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            addr,
            connected: false,
            boot_id: None,
            last_heard: None,
            next_handshake: now,
            queue: OutgoingMessageQueue::new(),
            assembler: InboundAssembler::new(),
            pending_acks: Vec::new(),
            ack_deadline: None,
            srtt: None,
        }
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Fold a round-trip sample into the smoothed estimate (gain 1/8).
    pub fn record_rtt(&mut self, sample: Duration) {
        self.srtt = Some(match self.srtt {
            Some(srtt) => (srtt * 7 + sample) / 8,
            None => sample,
        });
    }

    /// Queue an ack for the next datagram, due no later than `delay` from now.
    pub fn push_ack(&mut self, ack: AckRange, now: Instant, delay: Duration) {
        if !self.pending_acks.contains(&ack) {
            self.pending_acks.push(ack);
        }
        self.ack_deadline.get_or_insert(now + delay);
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    pub fn ack_deadline(&self) -> Option<Instant> {
        self.ack_deadline
    }

    pub fn acks_due(&self, now: Instant, max: usize) -> bool {
        self.pending_acks.len() >= max || self.ack_deadline.is_some_and(|at| at <= now)
    }

    /// Take up to `max` acks for one datagram, oldest first.
    pub fn take_acks(&mut self, max: usize) -> Vec<AckRange> {
        let n = self.pending_acks.len().min(max);
        let acks: Vec<AckRange> = self.pending_acks.drain(..n).collect();
        if self.pending_acks.is_empty() {
            self.ack_deadline = None;
        }
        acks
    }

    /// Put acks back after a failed send.
    pub fn restore_acks(&mut self, mut acks: Vec<AckRange>, now: Instant) {
        acks.append(&mut self.pending_acks);
        self.pending_acks = acks;
        if !self.pending_acks.is_empty() {
            self.ack_deadline.get_or_insert(now);
        }
    }

    fn clear_link_state(&mut self, out: &mut Vec<Notification>) {
        self.queue.disconnect_all(out);
        self.assembler.reset();
        self.pending_acks.clear();
        self.ack_deadline = None;
        self.srtt = None;
    }

    /// Mark the peer gone. Every queued message fails as disconnected.
    pub fn disconnect(&mut self, now: Instant, out: &mut Vec<Notification>) {
        self.connected = false;
        self.clear_link_state(out);
        self.next_handshake = now;
    }

    pub fn on_handshake(
        &mut self,
        boot_id: BootId,
        now: Instant,
        out: &mut Vec<Notification>,
    ) -> PeerTransition {
        self.last_heard = Some(now);
        if self.connected {
            if self.boot_id == Some(boot_id) {
                return PeerTransition::Keepalive;
            }
            self.clear_link_state(out);
            self.boot_id = Some(boot_id);
            self.next_handshake = now;
            return PeerTransition::Restarted { boot_id };
        }
        if self.boot_id.is_some_and(|old| old != boot_id) {
            // messages from the previous incarnation cannot be resumed
            self.clear_link_state(out);
        }
        self.connected = true;
        self.boot_id = Some(boot_id);
        self.next_handshake = now;
        PeerTransition::Connected { boot_id }
    }

    /// Silent for longer than `timeout` while connected.
    pub fn is_dead(&self, now: Instant, timeout: Duration) -> bool {
        self.connected
            && self
                .last_heard
                .is_none_or(|heard| now.saturating_duration_since(heard) > timeout)
    }

    /// When [`is_dead`](Self::is_dead) will first hold, absent traffic.
    pub fn dead_at(&self, timeout: Duration) -> Option<Instant> {
        if !self.connected {
            return None;
        }
        self.last_heard.map(|heard| heard + timeout + Duration::from_millis(1))
    }
}

// ---------------------------------------------------------------------------
// PeerTable
// ---------------------------------------------------------------------------

/// Peers in round-robin order, indexed by id and by address.
#[derive(Default)]
pub struct PeerTable {
    peers: Vec<PeerState>,
    by_id: HashMap<PeerId, usize>,
    by_addr: HashMap<SocketAddr, usize>,
    /// Where the next scheduler pass starts.
    pub cursor: usize,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Add a peer, or update the address of a known one.
    pub fn insert(&mut self, id: PeerId, addr: SocketAddr, now: Instant) {
        if let Some(&idx) = self.by_id.get(&id) {
            self.set_addr(idx, addr);
            return;
        }
        let idx = self.peers.len();
        self.peers.push(PeerState::new(id, addr, now));
        self.by_id.insert(id, idx);
        self.by_addr.insert(addr, idx);
    }

    pub fn index_of(&self, id: &PeerId) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    pub fn index_by_addr(&self, addr: &SocketAddr) -> Option<usize> {
        self.by_addr.get(addr).copied()
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerState> {
        self.index_of(id).map(|idx| &self.peers[idx])
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut PeerState> {
        self.index_of(id).map(|idx| &mut self.peers[idx])
    }

    pub fn at(&self, idx: usize) -> &PeerState {
        &self.peers[idx]
    }

    pub fn at_mut(&mut self, idx: usize) -> &mut PeerState {
        &mut self.peers[idx]
    }

    /// The peer moved, e.g. after a NAT rebinding.
    pub fn set_addr(&mut self, idx: usize, addr: SocketAddr) {
        let old = self.peers[idx].addr;
        if old == addr {
            return;
        }
        if self.by_addr.get(&old) == Some(&idx) {
            self.by_addr.remove(&old);
        }
        self.by_addr.insert(addr, idx);
        self.peers[idx].addr = addr;
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerState> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerState> {
        self.peers.iter_mut()
    }

    /// Peer indices starting at the cursor, wrapping once.
    pub fn round_robin(&self) -> impl Iterator<Item = usize> + use<> {
        let n = self.peers.len();
        let start = if n == 0 { 0 } else { self.cursor % n };
        (start..n).chain(0..start)
    }
}
