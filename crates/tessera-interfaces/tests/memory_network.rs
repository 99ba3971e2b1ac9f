//! The in-memory network as seen from outside the crate: loss, partitions
//! and address reuse.

use std::net::SocketAddr;
use std::time::Duration;

use tessera_interfaces::{DatagramTransport, InterfaceError, MemoryNetwork};

fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([192, 168, 0, n], 7000))
}

#[tokio::test]
async fn drop_rate_loses_roughly_that_share() {
    let net = MemoryNetwork::new(99);
    let a = net.transport("a", addr(1), 512);
    let b = net.transport("b", addr(2), 512);
    a.start().await.unwrap();
    b.start().await.unwrap();

    net.set_drop_rate(0.25);
    for i in 0..400u32 {
        a.try_send_to(&i.to_be_bytes(), addr(2)).unwrap();
    }
    let dropped = net.dropped();
    assert_eq!(net.delivered() + dropped, 400);
    assert!((60..=140).contains(&dropped), "dropped {dropped} of 400");

    for _ in 0..net.delivered() {
        let (from, data) = b.receive().await.unwrap();
        assert_eq!(from, addr(1));
        assert_eq!(data.len(), 4);
    }
}

#[tokio::test]
async fn partition_blocks_both_directions_until_restored() {
    let net = MemoryNetwork::new(1);
    let a = net.transport("a", addr(1), 512);
    let b = net.transport("b", addr(2), 512);
    a.start().await.unwrap();
    b.start().await.unwrap();

    net.cut(addr(1), addr(2));
    a.try_send_to(b"ping", addr(2)).unwrap();
    b.try_send_to(b"pong", addr(1)).unwrap();
    assert_eq!(net.dropped(), 2);
    assert!(
        tokio::time::timeout(Duration::from_millis(20), b.receive())
            .await
            .is_err()
    );

    net.restore(addr(1), addr(2));
    a.try_send_to(b"ping", addr(2)).unwrap();
    assert_eq!(b.receive().await.unwrap().1, b"ping");
}

#[tokio::test]
async fn address_is_free_again_after_stop() {
    let net = MemoryNetwork::new(1);
    let first = net.transport("first", addr(1), 512);
    first.start().await.unwrap();

    let second = net.transport("second", addr(1), 512);
    assert!(matches!(second.start().await, Err(InterfaceError::Io(_))));

    first.stop().await.unwrap();
    let third = net.transport("third", addr(1), 512);
    third.start().await.unwrap();
    assert_eq!(third.local_addr(), Some(addr(1)));
}
