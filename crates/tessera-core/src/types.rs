//! Newtype wrappers for identifiers carried on the wire.
//!
//! Peers, transfers and process incarnations are all plain integers or byte
//! arrays underneath; the wrappers keep them from being mixed up.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer};

use crate::error::InvalidLength;

fn fmt_hex(bytes: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for byte in bytes {
        write!(f, "{:02x}", byte)?;
    }
    Ok(())
}

/// Length in bytes of a peer identifier.
pub const PEER_ID_LEN: usize = 16;

/// A 16-byte peer identifier.
///
/// Peers are opaque addressable endpoints to the transfer layer; the id is
/// only used for correlation and logging.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[must_use]
pub struct PeerId(pub(crate) [u8; PEER_ID_LEN]);

impl PeerId {
    pub const fn new(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a random peer id for a node that has not been given one.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; PEER_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = InvalidLength;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; PEER_ID_LEN] = bytes.try_into().map_err(|_| InvalidLength {
            expected: PEER_ID_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }
}

impl FromStr for PeerId {
    type Err = InvalidLength;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| InvalidLength {
            expected: PEER_ID_LEN,
            actual: s.len() / 2,
        })?;
        Self::try_from(bytes.as_slice())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_hex(&self.0, f)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId(")?;
        fmt_hex(&self.0[..4], f)?;
        write!(f, "..)")
    }
}

/// Caller-chosen identifier of one block transfer.
///
/// Unique per (peer, direction); the node rejects a second session with the
/// same key while the first is live.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl TransferId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for TransferId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({:016x})", self.0)
    }
}

/// Random value chosen once per process start.
///
/// A connected peer announcing a different boot id has restarted and lost
/// all of its session state.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BootId(pub u64);

impl BootId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for BootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BootId({:016x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_try_from_invalid() {
        let bytes = [3u8; 15];
        let err = PeerId::try_from(bytes.as_ref()).unwrap_err();
        assert_eq!(err.expected, 16);
        assert_eq!(err.actual, 15);
    }

    #[test]
    fn test_peer_id_parse_hex() {
        let id: PeerId = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        assert_eq!(id.as_bytes()[15], 0x0f);
        assert_eq!(id.to_string(), "000102030405060708090a0b0c0d0e0f");
    }

    #[test]
    fn test_peer_id_parse_rejects_garbage() {
        assert!("not-hex".parse::<PeerId>().is_err());
        assert!("0011".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_peer_id_debug_is_truncated() {
        let id = PeerId::new([0xab; 16]);
        assert_eq!(format!("{id:?}"), "PeerId(abababab..)");
    }

    #[test]
    fn test_transfer_id_display() {
        assert_eq!(TransferId::new(0x2a).to_string(), "000000000000002a");
    }

    #[test]
    fn test_random_peer_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }
}
