//! Node orchestration: transport, peers, scheduler and the transfer API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tessera_core::abort::AbortCode;
use tessera_core::buffer::BlockBuffer;
use tessera_core::datagram::{AckRange, Datagram, Fragment};
use tessera_core::message::TransferMessage;
use tessera_core::types::{BootId, PeerId, TransferId};
use tessera_interfaces::{DatagramTransport, InterfaceError, ShutdownToken, UdpConfig, UdpTransport};
use tessera_protocol::{
    FilterDispatcher, MessageSink, ReceiveHandle, ReceiveOptions, SendCallback, SendError,
    SendHandle, TransferContext,
};
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::Instant;

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::events::{EventBus, NodeEvent};
use crate::jobs::{JobKind, JobQueue, TimedJob, WorkerPool};
use crate::peer::{PeerTable, PeerTransition};
use crate::queue::fire_all;
use crate::reassembly::Assembled;
use crate::scheduler::{self, SchedulerConfig};
use crate::watchdog::{Heartbeat, RestartHook, Watchdog, exit_hook};

/// How often housekeeping runs on the scheduler loop.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Direction {
    Send,
    Receive,
}

type SessionKey = (PeerId, TransferId, Direction);

/// State shared by the node handle, the scheduler, the receive task and the
/// message sink handed to transfer sessions.
pub(crate) struct NodeShared<T> {
    pub(crate) node_id: PeerId,
    pub(crate) boot_id: BootId,
    pub(crate) transport: T,
    pub(crate) scheduler: SchedulerConfig,
    pub(crate) context: TransferContext,
    pub(crate) events: EventBus,
    pub(crate) heartbeat: Arc<Heartbeat>,
    pub(crate) shutdown: Arc<ShutdownToken>,
    pub(crate) pool: WorkerPool,
    pub(crate) wake: Notify,
    peers: Mutex<PeerTable>,
    jobs: Mutex<JobQueue>,
    /// Done flags of live sessions, for duplicate detection.
    sessions: Mutex<HashMap<SessionKey, watch::Receiver<bool>>>,
}

impl<T: DatagramTransport> NodeShared<T> {
    pub(crate) fn lock_peers(&self) -> MutexGuard<'_, PeerTable> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_jobs(&self) -> MutexGuard<'_, JobQueue> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, watch::Receiver<bool>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self, delay: Duration, job: TimedJob) {
        self.lock_jobs().schedule(Instant::now() + delay, job);
        self.wake.notify_one();
    }

    fn enqueue(
        &self,
        peer: PeerId,
        message: TransferMessage,
        callback: Option<Arc<dyn SendCallback>>,
    ) -> Result<(), SendError> {
        if self.shutdown.is_stopped() {
            return Err(SendError::Fatal("node is shutting down".into()));
        }
        let now = Instant::now();
        let mut out = Vec::new();
        {
            let mut peers = self.lock_peers();
            let state = peers
                .get_mut(&peer)
                .filter(|p| p.connected)
                .ok_or(SendError::NotConnected(peer))?;
            let id = state.queue.enqueue(
                message.encode(),
                message.priority(),
                callback,
                now + self.scheduler.message_expiry,
                &mut out,
            );
            tracing::trace!(
                peer = %peer,
                message_id = id,
                kind = %message.kind(),
                transfer_id = %message.transfer_id(),
                "message queued"
            );
        }
        fire_all(out);
        self.wake.notify_one();
        Ok(())
    }

    fn handle_datagram(&self, from: SocketAddr, bytes: &[u8]) {
        match Datagram::decode(bytes) {
            Ok(Datagram::Handshake { node_id, boot_id }) => self.handle_handshake(from, node_id, boot_id),
            Ok(Datagram::Data { acks, fragment }) => self.handle_data(from, acks, fragment),
            Err(e) => tracing::debug!(%from, "dropping malformed datagram: {e}"),
        }
    }

    fn handle_handshake(&self, from: SocketAddr, node_id: PeerId, boot_id: BootId) {
        if node_id == self.node_id {
            tracing::trace!(%from, "ignoring our own handshake");
            return;
        }
        let now = Instant::now();
        let mut out = Vec::new();
        let transition = {
            let mut peers = self.lock_peers();
            let Some(idx) = peers.index_of(&node_id) else {
                tracing::debug!(peer = %node_id, %from, "handshake from unconfigured peer");
                return;
            };
            peers.set_addr(idx, from);
            peers.at_mut(idx).on_handshake(boot_id, now, &mut out)
        };
        fire_all(out);

        match transition {
            PeerTransition::Keepalive => {
                tracing::trace!(peer = %node_id, "keepalive");
                return;
            }
            PeerTransition::Connected { boot_id } => {
                tracing::info!(peer = %node_id, %from, ?boot_id, "peer connected");
                self.events.publish(NodeEvent::PeerConnected {
                    peer: node_id,
                    boot_id,
                });
            }
            PeerTransition::Restarted { boot_id } => {
                let resolved = self.context.dispatcher.peer_restarted(node_id);
                tracing::warn!(peer = %node_id, ?boot_id, resolved, "peer restarted");
                self.events.publish(NodeEvent::PeerRestarted {
                    peer: node_id,
                    boot_id,
                });
            }
        }
        self.wake.notify_one();
    }

    fn handle_data(&self, from: SocketAddr, acks: Vec<AckRange>, fragment: Option<Fragment>) {
        let now = Instant::now();
        let mut out = Vec::new();
        let mut completed = None;
        let peer_id = {
            let mut peers = self.lock_peers();
            let Some(idx) = peers.index_by_addr(&from) else {
                tracing::trace!(%from, "data from unknown address");
                return;
            };
            let peer = peers.at_mut(idx);
            if !peer.connected {
                tracing::trace!(peer = %peer.id, "data before handshake, dropping");
                return;
            }
            peer.last_heard = Some(now);

            for ack in acks {
                if let Some(sample) = peer.queue.ack(ack.message_id, ack.start, ack.end, now, &mut out) {
                    peer.record_rtt(sample);
                }
            }

            if let Some(fragment) = fragment {
                let outcome = peer.assembler.accept(&fragment, now);
                if outcome.should_ack() {
                    let ack = AckRange {
                        message_id: fragment.message_id,
                        start: fragment.offset,
                        end: fragment.end(),
                    };
                    peer.push_ack(ack, now, self.scheduler.ack_delay);
                }
                match outcome {
                    Assembled::Complete(payload) => completed = Some(payload),
                    Assembled::Rejected(reason) => tracing::warn!(
                        peer = %peer.id,
                        message_id = fragment.message_id,
                        reason,
                        "rejecting fragment"
                    ),
                    Assembled::Partial | Assembled::Duplicate => {}
                }
            }
            peer.id
        };
        fire_all(out);

        if let Some(payload) = completed {
            match TransferMessage::decode(&payload) {
                Ok(message) => {
                    self.context.dispatcher.dispatch(peer_id, message);
                }
                Err(e) => tracing::warn!(peer = %peer_id, "dropping undecodable message: {e}"),
            }
        }
        self.wake.notify_one();
    }

    /// Drop stale reassembly state and forget finished sessions.
    fn maintenance(&self) {
        let now = Instant::now();
        let mut partial = 0;
        for peer in self.lock_peers().iter_mut() {
            peer.assembler.prune(now, self.scheduler.message_expiry);
            partial += peer.assembler.partial_count();
        }
        let sessions = {
            let mut sessions = self.lock_sessions();
            sessions.retain(|_, done| !*done.borrow());
            sessions.len()
        };
        tracing::debug!(sessions, partial, "maintenance");
    }

    fn claim_session<H>(
        &self,
        key: SessionKey,
        start: impl FnOnce() -> Result<H, NodeError>,
        done: impl FnOnce(&H) -> watch::Receiver<bool>,
    ) -> Result<H, NodeError> {
        let (peer, transfer_id, _) = key;
        if self.lock_peers().index_of(&peer).is_none() {
            return Err(NodeError::UnknownPeer(peer));
        }
        let mut sessions = self.lock_sessions();
        if sessions.get(&key).is_some_and(|rx| !*rx.borrow()) {
            return Err(NodeError::DuplicateTransfer { peer, transfer_id });
        }
        let handle = start()?;
        sessions.insert(key, done(&handle));
        Ok(handle)
    }
}

fn schedule_maintenance<T: DatagramTransport>(shared: &Arc<NodeShared<T>>) {
    let weak = Arc::downgrade(shared);
    let job = TimedJob::new("maintenance", JobKind::Inline, move || {
        if let Some(shared) = weak.upgrade() {
            shared.maintenance();
            schedule_maintenance(&shared);
        }
    });
    shared.schedule(MAINTENANCE_INTERVAL, job);
}

async fn receive_loop<T: DatagramTransport>(shared: Arc<NodeShared<T>>) {
    loop {
        tokio::select! {
            biased;
            () = shared.shutdown.stopped() => break,
            result = shared.transport.receive() => match result {
                Ok((from, bytes)) => shared.handle_datagram(from, &bytes),
                Err(InterfaceError::Stopped) => break,
                Err(e) if e.is_transient() => {
                    tracing::debug!(interface = shared.transport.name(), "transient receive error: {e}");
                }
                Err(e) => {
                    tracing::warn!(interface = shared.transport.name(), "receive error, stopping: {e}");
                    break;
                }
            },
        }
    }
    tracing::debug!("receive loop stopped");
}

// ---------------------------------------------------------------------------
// NodeSink
// ---------------------------------------------------------------------------

/// The [`MessageSink`] transfer sessions talk to: per-peer outgoing queues.
struct NodeSink<T> {
    shared: Weak<NodeShared<T>>,
}

impl<T: DatagramTransport> MessageSink for NodeSink<T> {
    fn send(
        &self,
        peer: PeerId,
        message: TransferMessage,
        callback: Option<Arc<dyn SendCallback>>,
    ) -> Result<(), SendError> {
        match self.shared.upgrade() {
            Some(shared) => shared.enqueue(peer, message, callback),
            None => Err(SendError::Fatal("node stopped".into())),
        }
    }

    fn round_trip_estimate(&self, peer: PeerId) -> Option<Duration> {
        let shared = self.shared.upgrade()?;
        let peers = shared.lock_peers();
        peers.get(&peer).and_then(|p| p.srtt())
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Handle for signalling shutdown from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    token: Arc<ShutdownToken>,
}

impl ShutdownHandle {
    /// Signal the node to shut down.
    pub fn shutdown(&self) {
        self.token.signal_stop();
    }
}

/// A Tessera node: one datagram transport, a static set of peers, and the
/// block-transfer API on top.
pub struct Node<T: DatagramTransport = UdpTransport> {
    shared: Arc<NodeShared<T>>,
    enable_watchdog: bool,
    watchdog_stall: Duration,
    restart_hook: RestartHook,
    watchdog: Option<Watchdog>,
    started: bool,
}

impl Node<UdpTransport> {
    /// Create a node listening on the configured UDP address.
    pub fn bind(config: NodeConfig) -> Result<Self, NodeError> {
        let addr = config.listen_addr()?;
        let transport = UdpTransport::new(UdpConfig::new("udp", addr, config.node.mtu));
        Self::new(config, transport)
    }
}

impl<T: DatagramTransport> Node<T> {
    /// Create a node on top of `transport`. Nothing runs until [`start`](Self::start).
    pub fn new(config: NodeConfig, transport: T) -> Result<Self, NodeError> {
        config.validate()?;
        let node_id = config.node_id()?;
        let scheduler = config.scheduler_config();
        let transfer = config.transfer_config();

        let now = Instant::now();
        let mut peers = PeerTable::new();
        for (id, addr) in config.peers()? {
            if id == node_id {
                tracing::warn!(peer = %id, "ignoring ourselves in the peer list");
                continue;
            }
            peers.insert(id, addr, now);
        }

        let shared = Arc::new_cyclic(|weak: &Weak<NodeShared<T>>| {
            let sink: Arc<dyn MessageSink> = Arc::new(NodeSink {
                shared: weak.clone(),
            });
            NodeShared {
                node_id,
                boot_id: BootId::random(),
                transport,
                scheduler,
                context: TransferContext::new(FilterDispatcher::new(), sink, transfer),
                events: EventBus::new(),
                heartbeat: Arc::new(Heartbeat::new()),
                shutdown: Arc::new(ShutdownToken::new()),
                pool: WorkerPool::new(config.scheduler.worker_threads),
                wake: Notify::new(),
                peers: Mutex::new(peers),
                jobs: Mutex::new(JobQueue::new()),
                sessions: Mutex::new(HashMap::new()),
            }
        });

        Ok(Self {
            shared,
            enable_watchdog: config.scheduler.enable_watchdog,
            watchdog_stall: Duration::from_secs(config.scheduler.watchdog_stall_secs),
            restart_hook: exit_hook(),
            watchdog: None,
            started: false,
        })
    }

    /// Replace what the watchdog does when the scheduler stalls.
    pub fn with_restart_hook(mut self, hook: RestartHook) -> Self {
        self.restart_hook = hook;
        self
    }

    /// Start the transport, the receive loop, the scheduler and the watchdog.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if self.started {
            return Err(NodeError::AlreadyRunning);
        }
        let shared = Arc::clone(&self.shared);
        shared.transport.start().await?;
        self.started = true;
        shared.shutdown.set_online();

        shared
            .shutdown
            .add_task(tokio::spawn(receive_loop(Arc::clone(&shared))))
            .await;
        shared
            .shutdown
            .add_task(tokio::spawn(scheduler::run(Arc::clone(&shared))))
            .await;
        shared
            .shutdown
            .add_task(shared.context.dispatcher.spawn_reaper())
            .await;
        schedule_maintenance(&shared);

        if self.enable_watchdog {
            self.watchdog = Some(Watchdog::spawn(
                Arc::clone(&shared.heartbeat),
                self.watchdog_stall,
                Arc::clone(&self.restart_hook),
            )?);
        }

        tracing::info!(
            node_id = %shared.node_id,
            boot_id = ?shared.boot_id,
            addr = ?shared.transport.local_addr(),
            peers = shared.lock_peers().len(),
            "node started"
        );
        Ok(())
    }

    /// Wait until shutdown is signalled.
    pub async fn run(&self) {
        self.shared.shutdown.stopped().await;
        tracing::info!("shutdown signal received");
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: Arc::clone(&self.shared.shutdown),
        }
    }

    /// Stop everything. Running transfers fail; queued messages are dropped.
    pub async fn shutdown(mut self) {
        tracing::info!("shutting down node");
        let shared = Arc::clone(&self.shared);
        shared.shutdown.signal_stop();
        shared.wake.notify_one();
        shared.context.dispatcher.close();
        shared.shutdown.join_all().await;

        let mut out = Vec::new();
        let stopping = SendError::Fatal("node is shutting down".into());
        for peer in shared.lock_peers().iter_mut() {
            peer.queue.fail_all(&stopping, &mut out);
        }
        fire_all(out);

        shared.pool.close();
        if self.started {
            if let Err(e) = shared.transport.stop().await {
                tracing::warn!(interface = shared.transport.name(), "error stopping transport: {e}");
            }
        }
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
        tracing::info!("node shutdown complete");
    }

    pub fn node_id(&self) -> PeerId {
        self.shared.node_id
    }

    pub fn boot_id(&self) -> BootId {
        self.shared.boot_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.transport.local_addr()
    }

    /// Add a peer at runtime, or move a known one to `addr`.
    pub fn add_peer(&self, id: PeerId, addr: SocketAddr) {
        if id == self.shared.node_id {
            return;
        }
        self.shared.lock_peers().insert(id, addr, Instant::now());
        self.shared.wake.notify_one();
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.shared
            .lock_peers()
            .get(&peer)
            .is_some_and(|p| p.connected)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.shared
            .lock_peers()
            .iter()
            .filter(|p| p.connected)
            .map(|p| p.id)
            .collect()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.shared.events.subscribe()
    }

    /// The context sessions run in; for callers driving sessions directly.
    pub fn transfer_context(&self) -> TransferContext {
        self.shared.context.clone()
    }

    /// Send `buffer` to `peer`. The buffer may still be filling.
    pub fn start_send(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        buffer: BlockBuffer,
    ) -> Result<SendHandle, NodeError> {
        let context = &self.shared.context;
        self.shared.claim_session(
            (peer, transfer_id, Direction::Send),
            || {
                tracing::info!(peer = %peer, transfer_id = %transfer_id, len = buffer.len(), "starting send");
                Ok(context.start_send(peer, transfer_id, buffer))
            },
            SendHandle::done,
        )
    }

    /// Receive a block of `len` bytes from `peer`, acknowledging on completion.
    pub fn start_receive(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        len: usize,
    ) -> Result<ReceiveHandle, NodeError> {
        self.start_receive_with(peer, transfer_id, len, ReceiveOptions::default())
    }

    pub fn start_receive_with(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        len: usize,
        options: ReceiveOptions,
    ) -> Result<ReceiveHandle, NodeError> {
        let context = &self.shared.context;
        self.shared.claim_session(
            (peer, transfer_id, Direction::Receive),
            || {
                tracing::info!(peer = %peer, transfer_id = %transfer_id, len, "starting receive");
                Ok(context.start_receive(peer, transfer_id, len, options)?)
            },
            ReceiveHandle::done,
        )
    }

    /// Confirm a verified block to its sender.
    pub fn acknowledge(&self, peer: PeerId, transfer_id: TransferId) -> Result<(), NodeError> {
        self.shared
            .context
            .acknowledge(peer, transfer_id)
            .map_err(|e| NodeError::Transfer(e.into()))
    }

    /// Refuse a received block; the sender fails with `code`.
    pub fn reject(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        code: AbortCode,
        description: impl Into<String>,
    ) -> Result<(), NodeError> {
        self.shared
            .context
            .reject(peer, transfer_id, code, description)
            .map_err(|e| NodeError::Transfer(e.into()))
    }

    /// Run `f` after `delay` on the scheduler loop or the worker pool.
    pub fn schedule_job(
        &self,
        delay: Duration,
        name: impl Into<String>,
        kind: JobKind,
        f: impl FnOnce() + Send + 'static,
    ) {
        self.shared.schedule(delay, TimedJob::new(name, kind, f));
    }

    /// Heartbeats recorded by the scheduler loop so far.
    pub fn scheduler_beats(&self) -> u64 {
        self.shared.heartbeat.beats()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tessera_interfaces::MemoryNetwork;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn lone_node() -> Node<tessera_interfaces::MemoryTransport> {
        let net = MemoryNetwork::new(1);
        let mut config = NodeConfig::default();
        config.scheduler.enable_watchdog = false;
        Node::new(config, net.transport("lone", addr(1), 1280)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_fails() {
        let mut node = lone_node();
        node.start().await.unwrap();
        assert!(matches!(node.start().await, Err(NodeError::AlreadyRunning)));
        node.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_after_shutdown_signal() {
        let mut node = lone_node();
        node.start().await.unwrap();
        node.shutdown_handle().shutdown();
        tokio::time::timeout(Duration::from_millis(100), node.run())
            .await
            .expect("run should exit after shutdown");
        node.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_without_start() {
        lone_node().shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_peer_is_rejected() {
        let node = lone_node();
        let stranger = PeerId::new([9; 16]);
        let err = node.start_receive(stranger, TransferId::new(1), 10).unwrap_err();
        assert!(matches!(err, NodeError::UnknownPeer(p) if p == stranger));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_jobs_run_on_the_loop() {
        let mut node = lone_node();
        node.start().await.unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        node.schedule_job(Duration::from_secs(2), "flag", JobKind::Inline, move || {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!ran.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(ran.load(Ordering::SeqCst));
        assert!(node.scheduler_beats() > 0);
        node.shutdown().await;
    }
}
