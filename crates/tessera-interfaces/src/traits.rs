//! The transport seam between the node and the network.

use std::net::SocketAddr;

use crate::error::InterfaceError;

/// An unreliable, unordered datagram service.
///
/// Sends are synchronous and non-blocking so the scheduler can push a
/// datagram per peer per tick without yielding; a full socket buffer is
/// reported as a transient error and the datagram is retried on a later
/// tick. Receives are async and meant to be drained by one task.
pub trait DatagramTransport: Send + Sync + 'static {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Largest datagram this transport accepts.
    fn mtu(&self) -> usize;

    /// Bound address, once started.
    fn local_addr(&self) -> Option<SocketAddr>;

    fn is_connected(&self) -> bool;

    /// Bind and spawn whatever background work the transport needs.
    fn start(&self) -> impl Future<Output = Result<(), InterfaceError>> + Send;

    /// Release resources. Calling it twice is harmless.
    fn stop(&self) -> impl Future<Output = Result<(), InterfaceError>> + Send;

    /// Hand one datagram to the network without waiting.
    fn try_send_to(&self, data: &[u8], target: SocketAddr) -> Result<(), InterfaceError>;

    /// Next inbound datagram and its source.
    fn receive(
        &self,
    ) -> impl Future<Output = Result<(SocketAddr, Vec<u8>), InterfaceError>> + Send;
}
