//! Whole-node tests: two or more nodes linked by the in-memory network.
//!
//! Time is paused, so handshakes, ack delays and dead-peer timeouts elapse
//! as soon as every task is idle.

use std::net::SocketAddr;
use std::time::Duration;

use tessera_core::abort::AbortCode;
use tessera_core::buffer::BlockBuffer;
use tessera_core::types::{PeerId, TransferId};
use tessera_interfaces::{MemoryNetwork, MemoryTransport};
use tessera_node::config::PeerEntry;
use tessera_node::{Node, NodeConfig, NodeError, NodeEvent};
use tessera_protocol::{AbortOrigin, ReceiveOptions, TransferError};
use tokio::sync::broadcast;
use tokio::time::Instant;

const TID: TransferId = TransferId::new(7);

fn id(n: u8) -> PeerId {
    PeerId::new([n; 16])
}

fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 4810))
}

fn block(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 13 % 251) as u8).collect()
}

/// Config for node `n` knowing every node in `peers`.
fn config(n: u8, peers: &[u8]) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.node_id = Some(id(n).to_string());
    config.node.listen = addr(n).to_string();
    config.scheduler.enable_watchdog = false;
    config.peers = peers
        .iter()
        .map(|&p| PeerEntry {
            id: id(p).to_string(),
            address: addr(p).to_string(),
        })
        .collect();
    config
}

fn node(net: &MemoryNetwork, n: u8, config: NodeConfig) -> Node<MemoryTransport> {
    tessera_node::logging::init_for_tests();
    let transport = net.transport(format!("mem-{n}"), addr(n), config.node.mtu);
    Node::new(config, transport).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_event(rx: &mut broadcast::Receiver<NodeEvent>, within: Duration) -> NodeEvent {
    tokio::time::timeout(within, rx.recv())
        .await
        .expect("no event in time")
        .expect("event bus closed")
}

/// Start nodes 1 and 2 and wait until they see each other.
async fn connected_pair(
    net: &MemoryNetwork,
    a: NodeConfig,
    b: NodeConfig,
) -> (Node<MemoryTransport>, Node<MemoryTransport>) {
    let mut a = node(net, 1, a);
    let mut b = node(net, 2, b);
    a.start().await.unwrap();
    b.start().await.unwrap();
    wait_until(|| a.is_connected(id(2)) && b.is_connected(id(1))).await;
    (a, b)
}

async fn transfer(
    a: &Node<MemoryTransport>,
    b: &Node<MemoryTransport>,
    transfer_id: TransferId,
    data: &[u8],
) {
    let rx = b.start_receive(id(1), transfer_id, data.len()).unwrap();
    let buffer = BlockBuffer::from_data(data.to_vec(), 1024).unwrap();
    let tx = a.start_send(id(2), transfer_id, buffer).unwrap();

    tx.wait().await.unwrap();
    let received = rx.wait().await.unwrap();
    assert_eq!(received.to_vec().unwrap(), data);
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn handshake_connects_peers_and_announces_it() {
    let net = MemoryNetwork::new(1);
    let mut a = node(&net, 1, config(1, &[2]));
    let mut b = node(&net, 2, config(2, &[1]));
    let mut events = a.subscribe_events();

    a.start().await.unwrap();
    b.start().await.unwrap();

    let event = next_event(&mut events, Duration::from_secs(1)).await;
    assert_eq!(
        event,
        NodeEvent::PeerConnected {
            peer: id(2),
            boot_id: b.boot_id(),
        }
    );
    wait_until(|| b.is_connected(id(1))).await;
    assert_eq!(a.connected_peers(), vec![id(2)]);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn keepalives_hold_an_idle_link() {
    let net = MemoryNetwork::new(2);
    let (a, b) = connected_pair(&net, config(1, &[2]), config(2, &[1])).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(a.is_connected(id(2)));
    assert!(b.is_connected(id(1)));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_disconnected_and_transfers_fail() {
    let net = MemoryNetwork::new(3);
    let mut cfg = config(2, &[1]);
    cfg.scheduler.dead_peer_timeout_secs = 10;
    let (a, b) = connected_pair(&net, config(1, &[2]), cfg).await;
    let mut events = b.subscribe_events();

    let rx = b.start_receive(id(1), TID, 4096).unwrap();
    let started = Instant::now();
    net.cut(addr(1), addr(2));

    let event = next_event(&mut events, Duration::from_secs(20)).await;
    assert_eq!(event, NodeEvent::PeerDisconnected { peer: id(1) });
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(!b.is_connected(id(1)));
    assert_eq!(rx.wait().await.unwrap_err(), TransferError::PeerDisconnected);

    net.restore(addr(1), addr(2));
    wait_until(|| b.is_connected(id(1))).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn restarted_peer_fails_running_receives() {
    let net = MemoryNetwork::new(4);
    let (a, b) = connected_pair(&net, config(1, &[2]), config(2, &[1])).await;
    let mut events = b.subscribe_events();
    let old_boot = a.boot_id();

    let rx = b.start_receive(id(1), TID, 4096).unwrap();
    a.shutdown().await;

    let mut a = node(&net, 1, config(1, &[2]));
    assert_ne!(a.boot_id(), old_boot);
    a.start().await.unwrap();

    let event = next_event(&mut events, Duration::from_secs(1)).await;
    assert_eq!(
        event,
        NodeEvent::PeerRestarted {
            peer: id(1),
            boot_id: a.boot_id(),
        }
    );
    assert_eq!(rx.wait().await.unwrap_err(), TransferError::PeerRestarted);

    // the new incarnation is usable right away
    wait_until(|| a.is_connected(id(2))).await;
    transfer(&a, &b, TransferId::new(8), &block(3000)).await;

    a.shutdown().await;
    b.shutdown().await;
}

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn block_transfer_between_nodes() {
    let net = MemoryNetwork::new(5);
    let (a, b) = connected_pair(&net, config(1, &[2]), config(2, &[1])).await;

    transfer(&a, &b, TID, &block(100_000)).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn small_mtu_splits_packets_into_fragments() {
    let net = MemoryNetwork::new(6);
    let mut cfg_a = config(1, &[2]);
    let mut cfg_b = config(2, &[1]);
    cfg_a.node.mtu = 256;
    cfg_b.node.mtu = 256;
    let (a, b) = connected_pair(&net, cfg_a, cfg_b).await;

    transfer(&a, &b, TID, &block(8192)).await;
    // 8 packets of ~1 KiB cannot fit in fewer than 5 datagrams each
    assert!(net.delivered() >= 40);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transfer_survives_a_lossy_link() {
    let net = MemoryNetwork::new(7);
    let (a, b) = connected_pair(&net, config(1, &[2]), config(2, &[1])).await;
    net.set_drop_rate(0.05);

    let data = block(50_000);
    tokio::time::timeout(Duration::from_secs(600), transfer(&a, &b, TID, &data))
        .await
        .expect("transfer should finish despite loss");
    assert!(net.dropped() > 0);

    net.set_drop_rate(0.0);
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn bandwidth_limit_paces_the_sender() {
    let net = MemoryNetwork::new(8);
    let mut cfg_a = config(1, &[2]);
    cfg_a.scheduler.bandwidth_limit = 50_000;
    let (a, b) = connected_pair(&net, cfg_a, config(2, &[1])).await;

    let started = Instant::now();
    transfer(&a, &b, TID, &block(200_000)).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "finished too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(30), "took too long: {elapsed:?}");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn limited_bandwidth_is_shared_between_peers() {
    let net = MemoryNetwork::new(15);
    let mut cfg_a = config(1, &[2, 3]);
    cfg_a.scheduler.bandwidth_limit = 50_000;
    let mut a = node(&net, 1, cfg_a);
    let mut b = node(&net, 2, config(2, &[1]));
    let mut c = node(&net, 3, config(3, &[1]));
    a.start().await.unwrap();
    b.start().await.unwrap();
    c.start().await.unwrap();
    wait_until(|| a.connected_peers().len() == 2 && b.is_connected(id(1)) && c.is_connected(id(1)))
        .await;

    let data = block(200_000);
    let _rx_b = b.start_receive(id(1), TID, data.len()).unwrap();
    let _rx_c = c.start_receive(id(1), TID, data.len()).unwrap();
    let tx_b = a
        .start_send(id(2), TID, BlockBuffer::from_data(data.clone(), 1024).unwrap())
        .unwrap();
    let tx_c = a
        .start_send(id(3), TID, BlockBuffer::from_data(data, 1024).unwrap())
        .unwrap();

    // well short of the ~8s both blocks need at this rate
    tokio::time::sleep(Duration::from_secs(2)).await;
    let to_b = tx_b.stats().packets_sent;
    let to_c = tx_c.stats().packets_sent;
    assert!(!tx_b.is_finished() && !tx_c.is_finished());
    assert!(to_b >= 20 && to_c >= 20, "b got {to_b} packets, c got {to_c}");
    let (lo, hi) = (to_b.min(to_c), to_b.max(to_c));
    assert!(hi <= lo + lo / 2, "unfair split: b {to_b}, c {to_c}");

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn receiver_can_reject_after_verification() {
    let net = MemoryNetwork::new(9);
    let (a, b) = connected_pair(&net, config(1, &[2]), config(2, &[1])).await;
    let data = block(5000);

    let rx = b
        .start_receive_with(
            id(1),
            TID,
            data.len(),
            ReceiveOptions {
                acknowledge_completion: false,
            },
        )
        .unwrap();
    let tx = a
        .start_send(id(2), TID, BlockBuffer::from_data(data, 1024).unwrap())
        .unwrap();

    rx.wait().await.unwrap();
    b.reject(id(1), TID, AbortCode::Internal, "checksum mismatch").unwrap();

    let err = tx.wait().await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::Aborted {
            origin: AbortOrigin::Remote,
            code: AbortCode::Internal,
            ..
        }
    ));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_transfer_ids_are_refused_while_live() {
    let net = MemoryNetwork::new(10);
    let (a, b) = connected_pair(&net, config(1, &[2]), config(2, &[1])).await;

    let first = b.start_receive(id(1), TID, 1000).unwrap();
    let err = b.start_receive(id(1), TID, 1000).unwrap_err();
    assert!(matches!(
        err,
        NodeError::DuplicateTransfer { peer, transfer_id } if peer == id(1) && transfer_id == TID
    ));

    // the other direction is a different session
    let buffer = BlockBuffer::from_data(vec![1; 10], 1024).unwrap();
    let _send = b.start_send(id(1), TID, buffer).unwrap();

    first.cancel();
    wait_until(|| first.is_finished()).await;
    let again = b.start_receive(id(1), TID, 1000);
    assert!(again.is_ok());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_peers_are_refused() {
    let net = MemoryNetwork::new(11);
    let (a, b) = connected_pair(&net, config(1, &[2]), config(2, &[1])).await;

    let buffer = BlockBuffer::from_data(vec![0; 100], 1024).unwrap();
    assert!(matches!(
        a.start_send(id(9), TID, buffer),
        Err(NodeError::UnknownPeer(p)) if p == id(9)
    ));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sending_to_an_unreachable_peer_fails_fast() {
    let net = MemoryNetwork::new(12);
    let mut a = node(&net, 1, config(1, &[3]));
    a.start().await.unwrap();

    let buffer = BlockBuffer::from_data(vec![0; 100], 1024).unwrap();
    let tx = a.start_send(id(3), TID, buffer).unwrap();
    let err = tokio::time::timeout(Duration::from_secs(1), tx.wait())
        .await
        .expect("send should fail without waiting for timeouts")
        .unwrap_err();
    assert_eq!(err, TransferError::PeerDisconnected);

    a.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_running_transfers() {
    let net = MemoryNetwork::new(13);
    let (a, b) = connected_pair(&net, config(1, &[2]), config(2, &[1])).await;

    let rx = b.start_receive(id(1), TID, 4096).unwrap();
    b.shutdown().await;
    assert!(rx.wait().await.is_err());

    a.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn three_nodes_transfer_concurrently() {
    let net = MemoryNetwork::new(14);
    let mut a = node(&net, 1, config(1, &[2, 3]));
    let mut b = node(&net, 2, config(2, &[1, 3]));
    let mut c = node(&net, 3, config(3, &[1, 2]));
    a.start().await.unwrap();
    b.start().await.unwrap();
    c.start().await.unwrap();
    wait_until(|| a.connected_peers().len() == 2 && b.is_connected(id(1)) && c.is_connected(id(1)))
        .await;

    let to_b = block(20_000);
    let to_c: Vec<u8> = block(30_000).into_iter().rev().collect();
    let rx_b = b.start_receive(id(1), TID, to_b.len()).unwrap();
    let rx_c = c.start_receive(id(1), TID, to_c.len()).unwrap();
    let tx_b = a
        .start_send(id(2), TID, BlockBuffer::from_data(to_b.clone(), 1024).unwrap())
        .unwrap();
    let tx_c = a
        .start_send(id(3), TID, BlockBuffer::from_data(to_c.clone(), 1024).unwrap())
        .unwrap();

    let (sent_b, sent_c, got_b, got_c) = tokio::join!(tx_b.wait(), tx_c.wait(), rx_b.wait(), rx_c.wait());
    sent_b.unwrap();
    sent_c.unwrap();
    assert_eq!(got_b.unwrap().to_vec().unwrap(), to_b);
    assert_eq!(got_c.unwrap().to_vec().unwrap(), to_c);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}
