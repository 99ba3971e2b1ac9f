//! In-memory lossy network for exercising transfers without sockets.
//!
//! Every joined peer gets its own [`FilterDispatcher`] and a [`MessageSink`]
//! that delivers into the destination's dispatcher after a fixed latency.
//! Loss is injected per message: a seeded random drop rate for packet data,
//! one-shot drops of specific packets or kinds, and permanent drops of a
//! kind. Dropped messages still report `sent`, like a datagram lost after
//! leaving the socket.
//!
//! ```rust,ignore
//! let net = TestNetwork::new(7);
//! let a = net.join(peer_a, TransferConfig::default());
//! let b = net.join(peer_b, TransferConfig::default());
//! net.set_loss_rate(0.3);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera_core::message::{MessageKind, TransferMessage};
use tessera_core::types::{PeerId, TransferId};

use crate::config::TransferConfig;
use crate::context::TransferContext;
use crate::error::SendError;
use crate::filter::FilterDispatcher;
use crate::sink::{MessageSink, SendCallback};

/// One message that crossed (or failed to cross) the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: PeerId,
    pub to: PeerId,
    pub message: TransferMessage,
    pub dropped: bool,
}

#[derive(Default)]
struct NetState {
    nodes: HashMap<PeerId, FilterDispatcher>,
    down: HashSet<(PeerId, PeerId)>,
    loss_rate: f64,
    drop_packets_once: HashSet<(TransferId, u32)>,
    drop_kinds_once: HashMap<MessageKind, usize>,
    drop_kinds: HashSet<MessageKind>,
    log: Vec<Delivery>,
}

struct NetInner {
    latency: Duration,
    rng: Mutex<StdRng>,
    state: Mutex<NetState>,
}

impl NetInner {
    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct TestNetwork {
    inner: Arc<NetInner>,
}

impl TestNetwork {
    /// Network with 5 ms one-way latency and a seeded loss generator.
    pub fn new(seed: u64) -> Self {
        Self::with_latency(seed, Duration::from_millis(5))
    }

    pub fn with_latency(seed: u64, latency: Duration) -> Self {
        Self {
            inner: Arc::new(NetInner {
                latency,
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                state: Mutex::new(NetState::default()),
            }),
        }
    }

    /// Attach `peer`, spawning its dispatcher's reaper on the current runtime.
    pub fn join(&self, peer: PeerId, config: TransferConfig) -> TransferContext {
        let dispatcher = FilterDispatcher::new();
        dispatcher.spawn_reaper();
        self.inner.lock().nodes.insert(peer, dispatcher.clone());
        let sink = Arc::new(TestSink {
            from: peer,
            net: Arc::downgrade(&self.inner),
        });
        TransferContext::new(dispatcher, sink, config)
    }

    /// Fraction of `PacketTransmit` messages to drop at random.
    pub fn set_loss_rate(&self, rate: f64) {
        self.inner.lock().loss_rate = rate.clamp(0.0, 1.0);
    }

    /// Drop the first transmission of one packet.
    pub fn drop_packet_once(&self, transfer_id: TransferId, index: u32) {
        self.inner
            .lock()
            .drop_packets_once
            .insert((transfer_id, index));
    }

    /// Drop the next `count` messages of `kind`.
    pub fn drop_kind_times(&self, kind: MessageKind, count: usize) {
        *self.inner.lock().drop_kinds_once.entry(kind).or_default() += count;
    }

    /// Drop every message of `kind` from now on.
    pub fn drop_kind(&self, kind: MessageKind) {
        self.inner.lock().drop_kinds.insert(kind);
    }

    /// Cut the link between `a` and `b` and report the disconnect to both.
    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        let (da, db) = {
            let mut state = self.inner.lock();
            state.down.insert((a, b));
            state.down.insert((b, a));
            (state.nodes.get(&a).cloned(), state.nodes.get(&b).cloned())
        };
        if let Some(d) = da {
            d.peer_disconnected(b);
        }
        if let Some(d) = db {
            d.peer_disconnected(a);
        }
    }

    /// Report that `restarted` came back with fresh state, as seen by `observer`.
    pub fn restart(&self, observer: PeerId, restarted: PeerId) {
        let d = self.inner.lock().nodes.get(&observer).cloned();
        if let Some(d) = d {
            d.peer_restarted(restarted);
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.inner.lock().log.clone()
    }

    /// Messages of `kind` handed to the network, dropped ones included.
    pub fn count(&self, kind: MessageKind) -> usize {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|d| d.message.kind() == kind)
            .count()
    }

    pub fn dropped(&self, kind: MessageKind) -> usize {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|d| d.dropped && d.message.kind() == kind)
            .count()
    }
}

struct TestSink {
    from: PeerId,
    net: Weak<NetInner>,
}

impl TestSink {
    fn should_drop(net: &NetInner, state: &mut NetState, message: &TransferMessage) -> bool {
        let kind = message.kind();
        if state.drop_kinds.contains(&kind) {
            return true;
        }
        match state.drop_kinds_once.get_mut(&kind) {
            Some(n) if *n > 0 => {
                *n -= 1;
                return true;
            }
            _ => {}
        }
        if let TransferMessage::PacketTransmit {
            transfer_id,
            packet_index,
            ..
        } = message
        {
            if state
                .drop_packets_once
                .remove(&(*transfer_id, *packet_index))
            {
                return true;
            }
            if state.loss_rate > 0.0 {
                let roll: f64 = net
                    .rng
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .r#gen();
                return roll < state.loss_rate;
            }
        }
        false
    }
}

impl MessageSink for TestSink {
    fn send(
        &self,
        peer: PeerId,
        message: TransferMessage,
        callback: Option<Arc<dyn SendCallback>>,
    ) -> Result<(), SendError> {
        let net = self
            .net
            .upgrade()
            .ok_or_else(|| SendError::Fatal("network gone".into()))?;

        let (target, dropped) = {
            let mut state = net.lock();
            if state.down.contains(&(self.from, peer)) {
                return Err(SendError::NotConnected(peer));
            }
            let Some(target) = state.nodes.get(&peer).cloned() else {
                return Err(SendError::NotConnected(peer));
            };
            let dropped = Self::should_drop(&net, &mut state, &message);
            state.log.push(Delivery {
                from: self.from,
                to: peer,
                message: message.clone(),
                dropped,
            });
            (target, dropped)
        };

        let from = self.from;
        let latency = net.latency;
        let net = Arc::downgrade(&net);
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let link_up = net
                .upgrade()
                .is_some_and(|n| !n.lock().down.contains(&(from, peer)));
            if !link_up {
                if let Some(cb) = &callback {
                    cb.disconnected();
                }
                return;
            }
            if let Some(cb) = &callback {
                cb.sent();
            }
            if !dropped {
                target.dispatch(from, message);
                if let Some(cb) = &callback {
                    cb.acknowledged();
                }
            }
        });
        Ok(())
    }

    fn round_trip_estimate(&self, _peer: PeerId) -> Option<Duration> {
        self.net.upgrade().map(|n| n.latency * 2)
    }
}
