//! Block-transfer state machines for the Tessera overlay.
//!
//! This crate implements the reliability layer on top of an unreliable
//! per-peer message service: the filter dispatcher that correlates inbound
//! messages with outstanding expectations, and the sender and receiver
//! sessions that move one block between two peers. Sessions only see peers
//! through the [`MessageSink`] seam and inbound traffic through the
//! dispatcher, so they run unchanged over the node's UDP queues or the
//! in-memory [`testing`] network.

pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod filter;
pub mod receiver;
pub mod sender;
pub mod sink;
pub mod stats;
pub mod testing;

pub use config::{DispatcherConfig, TransferConfig};
pub use context::TransferContext;
pub use error::{AbortOrigin, SendError, TransferError};
pub use filter::{Expectation, FilterDispatcher, FilterOutcome, KindSet, MessageFilter};
pub use receiver::{ReceiveHandle, ReceiveOptions};
pub use sender::SendHandle;
pub use sink::{MessageSink, SendCallback};
pub use stats::TransferStats;
