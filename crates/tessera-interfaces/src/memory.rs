//! In-process datagram network.
//!
//! [`MemoryNetwork`] is a hub that routes datagrams between
//! [`MemoryTransport`]s by socket address, with no latency. Links can be
//! cut and restored, and a seeded drop rate simulates loss. Delivery goes
//! through bounded channels, so it works under paused tokio time where real
//! sockets cannot.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::error::InterfaceError;
use crate::shutdown::ShutdownToken;
use crate::traits::DatagramTransport;

const ENDPOINT_CAPACITY: usize = 4096;

type Inbound = (SocketAddr, Vec<u8>);

struct Hub {
    endpoints: HashMap<SocketAddr, mpsc::Sender<Inbound>>,
    cut: HashSet<(SocketAddr, SocketAddr)>,
    drop_rate: f64,
    rng: StdRng,
    delivered: u64,
    dropped: u64,
}

#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    /// A lossless network; `seed` drives the drop decisions once a drop
    /// rate is set.
    pub fn new(seed: u64) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                endpoints: HashMap::new(),
                cut: HashSet::new(),
                drop_rate: 0.0,
                rng: StdRng::seed_from_u64(seed),
                delivered: 0,
                dropped: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// An unstarted transport that will listen on `addr`.
    pub fn transport(&self, name: impl Into<String>, addr: SocketAddr, mtu: usize) -> MemoryTransport {
        let (tx, rx) = mpsc::channel(ENDPOINT_CAPACITY);
        MemoryTransport {
            name: name.into(),
            addr,
            mtu,
            network: self.clone(),
            tx,
            rx: AsyncMutex::new(rx),
            shutdown: ShutdownToken::new(),
        }
    }

    /// Drop all traffic between `a` and `b`, both directions.
    pub fn cut(&self, a: SocketAddr, b: SocketAddr) {
        let mut hub = self.lock();
        hub.cut.insert((a, b));
        hub.cut.insert((b, a));
    }

    pub fn restore(&self, a: SocketAddr, b: SocketAddr) {
        let mut hub = self.lock();
        hub.cut.remove(&(a, b));
        hub.cut.remove(&(b, a));
    }

    /// Fraction of datagrams to drop at random.
    pub fn set_drop_rate(&self, rate: f64) {
        self.lock().drop_rate = rate.clamp(0.0, 1.0);
    }

    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn route(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let mut hub = self.lock();
        let lost = hub.cut.contains(&(from, to)) || {
            let rate = hub.drop_rate;
            rate > 0.0 && hub.rng.r#gen::<f64>() < rate
        };
        let delivered = !lost
            && hub
                .endpoints
                .get(&to)
                .is_some_and(|tx| tx.try_send((from, data.to_vec())).is_ok());
        if delivered {
            hub.delivered += 1;
        } else {
            hub.dropped += 1;
        }
    }
}

pub struct MemoryTransport {
    name: String,
    addr: SocketAddr,
    mtu: usize,
    network: MemoryNetwork,
    tx: mpsc::Sender<Inbound>,
    rx: AsyncMutex<mpsc::Receiver<Inbound>>,
    shutdown: ShutdownToken,
}

impl DatagramTransport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.shutdown.is_online().then_some(self.addr)
    }

    fn is_connected(&self) -> bool {
        self.shutdown.is_online()
    }

    async fn start(&self) -> Result<(), InterfaceError> {
        let mut hub = self.network.lock();
        if hub.endpoints.contains_key(&self.addr) {
            return Err(InterfaceError::Io(std::io::Error::from(
                std::io::ErrorKind::AddrInUse,
            )));
        }
        hub.endpoints.insert(self.addr, self.tx.clone());
        self.shutdown.set_online();
        Ok(())
    }

    async fn stop(&self) -> Result<(), InterfaceError> {
        if self.shutdown.is_online() {
            self.network.lock().endpoints.remove(&self.addr);
        }
        self.shutdown.signal_stop();
        Ok(())
    }

    fn try_send_to(&self, data: &[u8], target: SocketAddr) -> Result<(), InterfaceError> {
        if !self.shutdown.is_online() {
            return Err(InterfaceError::NotConnected);
        }
        if data.len() > self.mtu {
            return Err(InterfaceError::Oversized {
                size: data.len(),
                mtu: self.mtu,
            });
        }
        self.network.route(self.addr, target, data);
        Ok(())
    }

    async fn receive(&self) -> Result<(SocketAddr, Vec<u8>), InterfaceError> {
        let mut stop_rx = self.shutdown.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            item = rx.recv() => item.ok_or(InterfaceError::Stopped),
            _ = stop_rx.wait_for(|stopped| *stopped) => Err(InterfaceError::Stopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn routes_by_address() {
        let net = MemoryNetwork::new(1);
        let a = net.transport("a", addr(1), 1280);
        let b = net.transport("b", addr(2), 1280);
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.try_send_to(b"hello", addr(2)).unwrap();
        let (from, data) = b.receive().await.unwrap();
        assert_eq!(from, addr(1));
        assert_eq!(data, b"hello");
        assert_eq!(net.delivered(), 1);
    }

    #[tokio::test]
    async fn unknown_destination_is_silently_dropped() {
        let net = MemoryNetwork::new(1);
        let a = net.transport("a", addr(1), 1280);
        a.start().await.unwrap();
        a.try_send_to(b"anyone?", addr(99)).unwrap();
        assert_eq!(net.dropped(), 1);
    }

    #[tokio::test]
    async fn cut_link_drops_both_directions_until_restored() {
        let net = MemoryNetwork::new(1);
        let a = net.transport("a", addr(1), 1280);
        let b = net.transport("b", addr(2), 1280);
        a.start().await.unwrap();
        b.start().await.unwrap();

        net.cut(addr(1), addr(2));
        a.try_send_to(b"x", addr(2)).unwrap();
        b.try_send_to(b"y", addr(1)).unwrap();
        assert_eq!(net.dropped(), 2);

        net.restore(addr(1), addr(2));
        a.try_send_to(b"z", addr(2)).unwrap();
        assert_eq!(b.receive().await.unwrap().1, b"z");
    }

    #[tokio::test]
    async fn drop_rate_is_applied() {
        let net = MemoryNetwork::new(7);
        let a = net.transport("a", addr(1), 1280);
        let b = net.transport("b", addr(2), 1280);
        a.start().await.unwrap();
        b.start().await.unwrap();
        net.set_drop_rate(0.5);

        for _ in 0..200 {
            a.try_send_to(b"d", addr(2)).unwrap();
        }
        let dropped = net.dropped();
        assert!((50..150).contains(&dropped), "dropped {dropped} of 200");
        assert_eq!(net.delivered() + dropped, 200);
    }

    #[tokio::test]
    async fn address_cannot_be_bound_twice() {
        let net = MemoryNetwork::new(1);
        let a = net.transport("a", addr(1), 1280);
        let dup = net.transport("dup", addr(1), 1280);
        a.start().await.unwrap();
        assert!(matches!(dup.start().await, Err(InterfaceError::Io(_))));
    }

    #[tokio::test]
    async fn conformance() {
        let net = MemoryNetwork::new(1);
        let t = net.transport("mem", addr(5), 512);
        testing::assert_pre_start_conformance(&t);
        t.start().await.unwrap();
        testing::assert_rejects_oversized(&t);
        testing::assert_stop_conformance(&t).await;
        assert!(matches!(t.receive().await, Err(InterfaceError::Stopped)));
    }
}
