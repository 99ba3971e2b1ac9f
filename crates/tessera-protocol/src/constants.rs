//! Block-transfer timing defaults.
//!
//! These are the values a node uses when its configuration does not
//! override them. See [`TransferConfig`](crate::config::TransferConfig).

use std::time::Duration;

pub use tessera_core::constants::DEFAULT_PACKET_SIZE;

/// How long a receiver waits for any transfer message before counting a
/// no-progress timeout and re-requesting every missing packet.
pub const RECEIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a sender waits for `AllReceived` after putting the last
/// packet on the wire.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Consecutive receipt timeouts without progress before the receiver gives
/// up on the sender.
pub const MAX_CONSECUTIVE_MISSING_REPORTS: u32 = 4;

/// Floor for the per-packet re-request holdoff. The effective holdoff is
/// `max(MIN_RESEND_HOLDOFF, 2 * rtt)`.
pub const MIN_RESEND_HOLDOFF: Duration = Duration::from_millis(500);

/// Packets a sender hands to the outgoing queue before they reach the
/// wire. Keeping this small lets resends jump ahead of fresh data.
pub const MAX_QUEUED_PACKETS: usize = 4;

/// Unmatched messages kept for late-registering expectations.
pub const UNCLAIMED_CAPACITY: usize = 256;

/// How long an unmatched message stays claimable.
pub const UNCLAIMED_TTL: Duration = Duration::from_secs(10);
