//! Peer lifecycle events broadcast to anyone interested.

use tessera_core::types::{BootId, PeerId};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    PeerConnected { peer: PeerId, boot_id: BootId },
    PeerDisconnected { peer: PeerId },
    /// A connected peer came back with a new boot id and lost its state.
    PeerRestarted { peer: PeerId, boot_id: BootId },
}

impl NodeEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            NodeEvent::PeerConnected { peer, .. }
            | NodeEvent::PeerDisconnected { peer }
            | NodeEvent::PeerRestarted { peer, .. } => *peer,
        }
    }
}

/// Slow subscribers miss events (`RecvError::Lagged`); publishers never block.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: NodeEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
