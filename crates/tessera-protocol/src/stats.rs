/// Per-session counters, reported when a transfer ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Packets that reached the wire, resends included.
    pub packets_sent: u64,
    /// Packets queued again after the receiver reported them missing.
    pub packets_resent: u64,
    /// New packets stored by the receiver.
    pub packets_received: u64,
    /// Packets the receiver already had.
    pub duplicate_packets: u64,
    /// Loss notifications sent (receiver) or handled (sender).
    pub missing_reports: u64,
}
