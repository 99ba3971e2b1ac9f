//! UDP transport.
//!
//! One socket serves every peer. A read loop copies inbound datagrams into
//! a channel; sends go straight to the socket with `try_send_to`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::UdpSocket;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::InterfaceError;
use crate::shutdown::ShutdownToken;
use crate::traits::DatagramTransport;

/// Receive buffer size; anything longer than this is truncated by the OS
/// and then rejected by the datagram decoder.
pub const UDP_RECV_BUFFER: usize = 2048;

/// Inbound datagrams buffered between the read loop and the node.
const INBOUND_CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub name: String,
    pub bind_addr: SocketAddr,
    pub mtu: usize,
}

impl UdpConfig {
    pub fn new(name: impl Into<String>, bind_addr: SocketAddr, mtu: usize) -> Self {
        Self {
            name: name.into(),
            bind_addr,
            mtu,
        }
    }
}

// ---------------------------------------------------------------------------
// UdpTransport
// ---------------------------------------------------------------------------

pub struct UdpTransport {
    config: UdpConfig,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    rx_receiver: AsyncMutex<mpsc::Receiver<(SocketAddr, Vec<u8>)>>,
    rx_sender: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    shutdown: ShutdownToken,
}

impl UdpTransport {
    pub fn new(config: UdpConfig) -> Self {
        let (rx_sender, rx_receiver) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        Self {
            config,
            socket: Mutex::new(None),
            rx_receiver: AsyncMutex::new(rx_receiver),
            rx_sender,
            shutdown: ShutdownToken::new(),
        }
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn read_loop(
        socket: Arc<UdpSocket>,
        tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
        mut stop_rx: watch::Receiver<bool>,
        name: String,
    ) {
        let mut buf = vec![0u8; UDP_RECV_BUFFER];

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, src)) => {
                            if tx.try_send((src, buf[..n].to_vec())).is_err() {
                                // node is behind or gone; UDP may drop
                                debug!(transport = %name, from = %src, "inbound queue full, dropping datagram");
                            }
                        }
                        Err(e) => {
                            // ICMP unreachable and friends surface here; keep reading
                            warn!(transport = %name, error = %e, "recv error");
                            if *stop_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
                _ = stop_rx.changed() => break,
            }
        }
        debug!(transport = %name, "read loop stopped");
    }
}

impl DatagramTransport for UdpTransport {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn mtu(&self) -> usize {
        self.config.mtu
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket().and_then(|s| s.local_addr().ok())
    }

    fn is_connected(&self) -> bool {
        self.shutdown.is_online()
    }

    async fn start(&self) -> Result<(), InterfaceError> {
        let socket = Arc::new(UdpSocket::bind(self.config.bind_addr).await?);
        info!(
            transport = %self.config.name,
            addr = %socket.local_addr().unwrap_or(self.config.bind_addr),
            "bound"
        );

        *self.socket.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&socket));
        self.shutdown.set_online();

        let handle = tokio::spawn(Self::read_loop(
            socket,
            self.rx_sender.clone(),
            self.shutdown.subscribe(),
            self.config.name.clone(),
        ));
        self.shutdown.add_task(handle).await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), InterfaceError> {
        self.shutdown.signal_stop();
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shutdown.join_all().await;
        Ok(())
    }

    fn try_send_to(&self, data: &[u8], target: SocketAddr) -> Result<(), InterfaceError> {
        if !self.shutdown.is_online() {
            return Err(InterfaceError::NotConnected);
        }
        if data.len() > self.config.mtu {
            return Err(InterfaceError::Oversized {
                size: data.len(),
                mtu: self.config.mtu,
            });
        }
        let socket = self.socket().ok_or(InterfaceError::NotConnected)?;

        match socket.try_send_to(data, target) {
            Ok(sent) if sent == data.len() => Ok(()),
            Ok(sent) => Err(InterfaceError::TransmitFailed(format!(
                "sent {sent} of {} bytes",
                data.len()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(InterfaceError::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    async fn receive(&self) -> Result<(SocketAddr, Vec<u8>), InterfaceError> {
        let mut stop_rx = self.shutdown.subscribe();
        let mut rx = self.rx_receiver.lock().await;
        tokio::select! {
            item = rx.recv() => item.ok_or(InterfaceError::Stopped),
            _ = stop_rx.wait_for(|stopped| *stopped) => Err(InterfaceError::Stopped),
        }
    }
}
