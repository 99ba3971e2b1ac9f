//! TOML-based configuration for Tessera nodes.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tessera_core::constants::{DEFAULT_MTU, DEFAULT_PACKET_SIZE, MIN_MTU};
use tessera_core::types::PeerId;
use tessera_protocol::TransferConfig;

use crate::error::NodeError;
use crate::scheduler::SchedulerConfig;

/// Largest packet size a transfer may use.
pub const MAX_PACKET_SIZE: u32 = 64 * 1024;

/// Largest UDP payload over IPv4.
pub const MAX_MTU: usize = 65_507;

/// Top-level node configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub transfer: TransferSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

/// A `[[peers]]` entry. Peers are static; there is no discovery.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerEntry {
    /// Hex-encoded 16-byte node id.
    pub id: String,
    pub address: String,
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("failed to read config file: {e}")))?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, NodeError> {
        let config: Self =
            toml::from_str(s).map_err(|e| NodeError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        let packet_size = self.transfer.packet_size;
        if packet_size == 0 || packet_size > MAX_PACKET_SIZE {
            return Err(NodeError::Config(format!(
                "packet_size must be between 1 and {MAX_PACKET_SIZE}, got {packet_size}"
            )));
        }
        let mtu = self.node.mtu;
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(NodeError::Config(format!(
                "mtu must be between {MIN_MTU} and {MAX_MTU}, got {mtu}"
            )));
        }
        let capacity = self.scheduler.bucket_capacity;
        if self.scheduler.bandwidth_limit > 0 && capacity != 0 && capacity < mtu as u64 {
            return Err(NodeError::Config(format!(
                "bucket_capacity ({capacity}) must hold at least one datagram ({mtu})"
            )));
        }
        self.listen_addr()?;
        if let Some(id) = &self.node.node_id {
            parse_peer_id(id)?;
        }
        self.peers()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, NodeError> {
        parse_socket_addr(&self.node.listen)
    }

    /// Configured node id, or a fresh random one.
    pub fn node_id(&self) -> Result<PeerId, NodeError> {
        match &self.node.node_id {
            Some(id) => parse_peer_id(id),
            None => Ok(PeerId::random()),
        }
    }

    pub fn peers(&self) -> Result<Vec<(PeerId, SocketAddr)>, NodeError> {
        self.peers
            .iter()
            .map(|p| Ok((parse_peer_id(&p.id)?, parse_socket_addr(&p.address)?)))
            .collect()
    }

    pub fn transfer_config(&self) -> TransferConfig {
        let t = &self.transfer;
        TransferConfig {
            packet_size: t.packet_size,
            receipt_timeout: Duration::from_secs(t.receipt_timeout_secs),
            send_timeout: Duration::from_secs(t.send_timeout_secs),
            max_consecutive_missing_reports: t.max_consecutive_missing_reports,
            min_resend_holdoff: Duration::from_millis(t.min_resend_holdoff_ms),
            max_queued_packets: t.max_queued_packets,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let s = &self.scheduler;
        let bucket_capacity = if s.bucket_capacity == 0 {
            // a quarter second of traffic, never less than a few datagrams
            (s.bandwidth_limit / 4).max(4 * self.node.mtu as u64)
        } else {
            s.bucket_capacity
        };
        SchedulerConfig {
            mtu: self.node.mtu,
            coalescing_delay: Duration::from_millis(s.coalescing_delay_ms),
            bandwidth_limit: s.bandwidth_limit,
            bucket_capacity,
            dead_peer_timeout: Duration::from_secs(s.dead_peer_timeout_secs),
            handshake_interval: Duration::from_secs(s.handshake_interval_secs),
            ack_delay: Duration::from_millis(s.ack_delay_ms),
            message_expiry: Duration::from_secs(s.message_expiry_secs),
        }
    }
}

fn parse_peer_id(s: &str) -> Result<PeerId, NodeError> {
    s.parse()
        .map_err(|e| NodeError::Config(format!("invalid peer id '{s}': {e}")))
}

fn parse_socket_addr(s: &str) -> Result<SocketAddr, NodeError> {
    s.parse()
        .map_err(|e| NodeError::Config(format!("invalid socket address '{s}': {e}")))
}

/// The `[node]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Hex node id. A random one is generated per process when absent.
    pub node_id: Option<String>,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

fn default_listen() -> String {
    "0.0.0.0:4810".to_string()
}

fn default_mtu() -> usize {
    DEFAULT_MTU
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            node_id: None,
            mtu: default_mtu(),
        }
    }
}

/// The `[transfer]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferSection {
    #[serde(default = "default_packet_size")]
    pub packet_size: u32,
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_max_consecutive_missing_reports")]
    pub max_consecutive_missing_reports: u32,
    #[serde(default = "default_min_resend_holdoff_ms")]
    pub min_resend_holdoff_ms: u64,
    #[serde(default = "default_max_queued_packets")]
    pub max_queued_packets: usize,
}

fn default_packet_size() -> u32 {
    DEFAULT_PACKET_SIZE
}

fn default_receipt_timeout_secs() -> u64 {
    30
}

fn default_send_timeout_secs() -> u64 {
    60
}

fn default_max_consecutive_missing_reports() -> u32 {
    4
}

fn default_min_resend_holdoff_ms() -> u64 {
    500
}

fn default_max_queued_packets() -> usize {
    4
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            packet_size: default_packet_size(),
            receipt_timeout_secs: default_receipt_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            max_consecutive_missing_reports: default_max_consecutive_missing_reports(),
            min_resend_holdoff_ms: default_min_resend_holdoff_ms(),
            max_queued_packets: default_max_queued_packets(),
        }
    }
}

/// The `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_coalescing_delay_ms")]
    pub coalescing_delay_ms: u64,
    /// Outbound bytes per second. 0 disables throttling.
    #[serde(default)]
    pub bandwidth_limit: u64,
    /// Burst size in bytes. 0 picks one from the limit and MTU.
    #[serde(default)]
    pub bucket_capacity: u64,
    #[serde(default = "default_dead_peer_timeout_secs")]
    pub dead_peer_timeout_secs: u64,
    #[serde(default = "default_handshake_interval_secs")]
    pub handshake_interval_secs: u64,
    #[serde(default = "default_ack_delay_ms")]
    pub ack_delay_ms: u64,
    #[serde(default = "default_message_expiry_secs")]
    pub message_expiry_secs: u64,
    #[serde(default = "default_watchdog_stall_secs")]
    pub watchdog_stall_secs: u64,
    #[serde(default = "default_enable_watchdog")]
    pub enable_watchdog: bool,
    /// Concurrency of the pool running heavy timed jobs.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

fn default_coalescing_delay_ms() -> u64 {
    100
}

fn default_dead_peer_timeout_secs() -> u64 {
    30
}

fn default_handshake_interval_secs() -> u64 {
    5
}

fn default_ack_delay_ms() -> u64 {
    20
}

fn default_message_expiry_secs() -> u64 {
    300
}

fn default_watchdog_stall_secs() -> u64 {
    180
}

fn default_enable_watchdog() -> bool {
    true
}

fn default_worker_threads() -> usize {
    4
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            coalescing_delay_ms: default_coalescing_delay_ms(),
            bandwidth_limit: 0,
            bucket_capacity: 0,
            dead_peer_timeout_secs: default_dead_peer_timeout_secs(),
            handshake_interval_secs: default_handshake_interval_secs(),
            ack_delay_ms: default_ack_delay_ms(),
            message_expiry_secs: default_message_expiry_secs(),
            watchdog_stall_secs: default_watchdog_stall_secs(),
            enable_watchdog: default_enable_watchdog(),
            worker_threads: default_worker_threads(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// The `[logging]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = NodeConfig::parse("").unwrap();
        assert_eq!(config.node.listen, "0.0.0.0:4810");
        assert_eq!(config.node.mtu, 1280);
        assert_eq!(config.transfer.packet_size, 1024);
        assert_eq!(config.scheduler.coalescing_delay_ms, 100);
        assert!(config.scheduler.enable_watchdog);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.peers.is_empty());
        assert_eq!(config.transfer_config(), TransferConfig::default());
    }

    #[test]
    fn full_config_parses() {
        let toml = r#"
[node]
listen = "127.0.0.1:9000"
node_id = "000102030405060708090a0b0c0d0e0f"
mtu = 1400

[transfer]
packet_size = 512
receipt_timeout_secs = 10
min_resend_holdoff_ms = 250

[scheduler]
bandwidth_limit = 100000
ack_delay_ms = 5
enable_watchdog = false

[logging]
level = "debug"
format = "json"

[[peers]]
id = "f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff"
address = "10.0.0.2:4810"
"#;
        let config = NodeConfig::parse(toml).unwrap();
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(
            config.node_id().unwrap().to_string(),
            "000102030405060708090a0b0c0d0e0f"
        );
        assert_eq!(config.logging.format, LogFormat::Json);

        let transfer = config.transfer_config();
        assert_eq!(transfer.packet_size, 512);
        assert_eq!(transfer.receipt_timeout, Duration::from_secs(10));
        assert_eq!(transfer.min_resend_holdoff, Duration::from_millis(250));
        assert_eq!(transfer.send_timeout, Duration::from_secs(60));

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.mtu, 1400);
        assert_eq!(scheduler.ack_delay, Duration::from_millis(5));
        assert_eq!(scheduler.bandwidth_limit, 100_000);
        assert_eq!(scheduler.bucket_capacity, 25_000);

        let peers = config.peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].1, "10.0.0.2:4810".parse().unwrap());
    }

    #[test]
    fn missing_node_id_is_random() {
        let config = NodeConfig::default();
        assert_ne!(config.node_id().unwrap(), config.node_id().unwrap());
    }

    #[test]
    fn rejects_zero_packet_size() {
        let err = NodeConfig::parse("[transfer]\npacket_size = 0\n").unwrap_err();
        assert!(matches!(err, NodeError::Config(ref msg) if msg.contains("packet_size")));
    }

    #[test]
    fn rejects_oversized_packet_size() {
        assert!(NodeConfig::parse("[transfer]\npacket_size = 70000\n").is_err());
    }

    #[test]
    fn rejects_small_mtu() {
        let err = NodeConfig::parse("[node]\nmtu = 100\n").unwrap_err();
        assert!(matches!(err, NodeError::Config(ref msg) if msg.contains("mtu")));
    }

    #[test]
    fn rejects_bad_peer_id() {
        let toml = "[[peers]]\nid = \"xyz\"\naddress = \"10.0.0.2:4810\"\n";
        let err = NodeConfig::parse(toml).unwrap_err();
        assert!(matches!(err, NodeError::Config(ref msg) if msg.contains("peer id")));
    }

    #[test]
    fn rejects_bad_address() {
        let toml = "[[peers]]\nid = \"000102030405060708090a0b0c0d0e0f\"\naddress = \"nowhere\"\n";
        assert!(NodeConfig::parse(toml).is_err());
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert!(NodeConfig::parse("[logging]\nformat = \"xml\"\n").is_err());
    }

    #[test]
    fn load_missing_file() {
        let err = NodeConfig::load(Path::new("/nonexistent/tessera.toml")).unwrap_err();
        assert!(matches!(err, NodeError::Config(ref msg) if msg.contains("read")));
    }
}
