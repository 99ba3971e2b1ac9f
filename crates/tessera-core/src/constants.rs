//! Wire constants for transfer messages and datagrams.

/// Default packet size for block transfers, in bytes.
pub const DEFAULT_PACKET_SIZE: u32 = 1024;

/// Default maximum datagram size handed to the socket.
pub const DEFAULT_MTU: usize = 1280;

/// Smallest MTU a node will accept in its configuration.
pub const MIN_MTU: usize = 256;

/// Datagram format version. Datagrams with any other version are dropped.
pub const DATAGRAM_VERSION: u8 = 1;

// Transfer message type bytes
pub const MSG_PACKET_TRANSMIT: u8 = 0x01;
pub const MSG_MISSING_PACKETS: u8 = 0x02;
pub const MSG_ALL_SENT: u8 = 0x03;
pub const MSG_ALL_RECEIVED: u8 = 0x04;
pub const MSG_SEND_ABORTED: u8 = 0x05;

/// type(1) + transfer_id(8)
pub const MESSAGE_HEADER_SIZE: usize = 9;

/// index(4) + bitmap_len(4) + data_len(4), excluding bitmap and data bytes.
pub const PACKET_TRANSMIT_OVERHEAD: usize = 12;

// Datagram kinds
pub const DATAGRAM_HANDSHAKE: u8 = 0x01;
pub const DATAGRAM_DATA: u8 = 0x02;

/// version(1) + kind(1)
pub const DATAGRAM_HEADER_SIZE: usize = 2;

/// version(1) + kind(1) + node_id(16) + boot_id(8)
pub const HANDSHAKE_SIZE: usize = DATAGRAM_HEADER_SIZE + 16 + 8;

/// message_id(4) + start(4) + end(4)
pub const ACK_ENTRY_SIZE: usize = 12;

/// Acks carried by one datagram at most; the count is a single byte.
pub const MAX_ACKS_PER_DATAGRAM: usize = 32;

/// has_fragment(1) + message_id(4) + total_len(4) + offset(4) + data_len(2)
pub const FRAGMENT_HEADER_SIZE: usize = 15;

/// Fixed part of a data datagram: header + ack_count(1) + has_fragment flag.
pub const DATA_DATAGRAM_MIN_SIZE: usize = DATAGRAM_HEADER_SIZE + 1 + 1;

/// Largest fragment payload that fits an `mtu`-sized datagram carrying
/// `acks` acknowledgements.
pub const fn max_fragment_payload(mtu: usize, acks: usize) -> usize {
    mtu.saturating_sub(DATAGRAM_HEADER_SIZE + 1 + acks * ACK_ENTRY_SIZE + FRAGMENT_HEADER_SIZE)
}
