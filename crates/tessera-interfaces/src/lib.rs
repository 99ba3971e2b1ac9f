//! Datagram transports for the Tessera overlay.
//!
//! A transport moves whole datagrams between socket addresses with no
//! delivery guarantee. The node's scheduler is the only writer; a single
//! receive task drains inbound datagrams.

pub mod error;
pub mod memory;
pub mod shutdown;
pub mod testing;
pub mod traits;
pub mod udp;

pub use error::InterfaceError;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use shutdown::ShutdownToken;
pub use traits::DatagramTransport;
pub use udp::{UdpConfig, UdpTransport};
