//! Conformance assertions shared by every [`DatagramTransport`].
//!
//! ```rust,ignore
//! let t = MyTransport::new(config);
//! testing::assert_pre_start_conformance(&t);
//! t.start().await?;
//! testing::assert_rejects_oversized(&t);
//! testing::assert_stop_conformance(&t).await;
//! ```

use std::net::SocketAddr;

use crate::error::InterfaceError;
use crate::traits::DatagramTransport;

fn discard_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9))
}

pub fn assert_has_name(t: &impl DatagramTransport) {
    assert!(!t.name().is_empty(), "transport name must not be empty");
}

pub fn assert_not_connected_before_start(t: &impl DatagramTransport) {
    assert!(
        !t.is_connected(),
        "transport should not be connected before start()"
    );
}

pub fn assert_send_before_start_fails(t: &impl DatagramTransport) {
    match t.try_send_to(&[0x42; 20], discard_addr()) {
        Err(InterfaceError::NotConnected) => {}
        Err(e) => panic!("unexpected error from send before start: {e}"),
        Ok(()) => panic!("send should fail before start()"),
    }
}

/// Name, connection state and send behaviour of an unstarted transport.
pub fn assert_pre_start_conformance(t: &impl DatagramTransport) {
    assert_has_name(t);
    assert_not_connected_before_start(t);
    assert_send_before_start_fails(t);
    assert!(t.mtu() > 0, "MTU must be positive");
}

/// A started transport refuses datagrams longer than its MTU.
pub fn assert_rejects_oversized(t: &impl DatagramTransport) {
    let big = vec![0u8; t.mtu() + 1];
    match t.try_send_to(&big, discard_addr()) {
        Err(InterfaceError::Oversized { size, mtu }) => {
            assert_eq!(size, t.mtu() + 1);
            assert_eq!(mtu, t.mtu());
        }
        other => panic!("expected Oversized, got {other:?}"),
    }
}

/// `stop()` succeeds, disconnects, and can be repeated.
pub async fn assert_stop_conformance(t: &impl DatagramTransport) {
    let result = t.stop().await;
    assert!(result.is_ok(), "stop() should succeed: {:?}", result.err());
    assert!(!t.is_connected(), "is_connected() should be false after stop()");
    let again = t.stop().await;
    assert!(again.is_ok(), "second stop() should be idempotent: {:?}", again.err());
}
