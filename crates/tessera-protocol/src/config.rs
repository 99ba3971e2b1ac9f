//! Tunables shared by senders and receivers.

use std::time::Duration;

use crate::constants::{
    DEFAULT_PACKET_SIZE, MAX_CONSECUTIVE_MISSING_REPORTS, MAX_QUEUED_PACKETS, MIN_RESEND_HOLDOFF,
    RECEIPT_TIMEOUT, SEND_TIMEOUT, UNCLAIMED_CAPACITY, UNCLAIMED_TTL,
};

#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    pub packet_size: u32,
    pub receipt_timeout: Duration,
    pub send_timeout: Duration,
    pub max_consecutive_missing_reports: u32,
    pub min_resend_holdoff: Duration,
    pub max_queued_packets: usize,
}

impl TransferConfig {
    pub fn new() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            receipt_timeout: RECEIPT_TIMEOUT,
            send_timeout: SEND_TIMEOUT,
            max_consecutive_missing_reports: MAX_CONSECUTIVE_MISSING_REPORTS,
            min_resend_holdoff: MIN_RESEND_HOLDOFF,
            max_queued_packets: MAX_QUEUED_PACKETS,
        }
    }

    /// Minimum spacing between two requests for the same packet.
    pub fn resend_holdoff(&self, rtt: Option<Duration>) -> Duration {
        match rtt {
            Some(rtt) => self.min_resend_holdoff.max(rtt.saturating_mul(2)),
            None => self.min_resend_holdoff,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Limits on the dispatcher's unclaimed-message buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub unclaimed_capacity: usize,
    pub unclaimed_ttl: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            unclaimed_capacity: UNCLAIMED_CAPACITY,
            unclaimed_ttl: UNCLAIMED_TTL,
        }
    }
}
