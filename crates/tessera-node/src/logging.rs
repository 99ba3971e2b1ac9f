//! Tracing subscriber configuration for Tessera nodes.
//!
//! Log levels follow these conventions:
//! - ERROR: Unrecoverable failures, scheduler stalls
//! - WARN: Recoverable anomalies (malformed datagrams, unresponsive peers)
//! - INFO: Transfer and peer lifecycle (transfer started/finished, peer connected)
//! - DEBUG: Protocol state changes (loss reports, resends, handshakes)
//! - TRACE: Wire-level detail (fragments, acks, individual packets)

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingSection};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize the tracing subscriber with human-readable output.
///
/// `RUST_LOG` overrides `default_level` when set.
pub fn init(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(filter(default_level))
        .init();
}

/// Initialize the tracing subscriber with JSON output.
pub fn init_json(default_level: &str) {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter(default_level))
        .init();
}

/// Initialize from the `[logging]` section. `RUST_LOG_FORMAT=json` forces
/// JSON output regardless of the configured format.
pub fn init_from_config(logging: &LoggingSection) {
    let json = logging.format == LogFormat::Json
        || std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json");
    if json {
        init_json(&logging.level);
    } else {
        init(&logging.level);
    }
}

/// Initialize the tracing subscriber for tests.
///
/// Uses `try_init` to avoid panicking if called multiple times.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .with_test_writer()
        .try_init();
}
