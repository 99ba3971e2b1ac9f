//! Node orchestration for the Tessera overlay.
//!
//! This crate turns the transfer state machines into a running node: it
//! keeps one link per configured peer over a datagram transport, fragments
//! and retransmits queued messages, reassembles inbound ones and feeds them
//! to the filter dispatcher, and drives all outbound traffic from a single
//! scheduler loop guarded by a watchdog.

pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod logging;
pub mod node;
pub mod peer;
pub mod queue;
pub mod reassembly;
pub mod scheduler;
pub mod throttle;
pub mod watchdog;

pub use config::NodeConfig;
pub use error::NodeError;
pub use events::NodeEvent;
pub use jobs::JobKind;
pub use node::{Node, ShutdownHandle};
pub use scheduler::SchedulerConfig;
