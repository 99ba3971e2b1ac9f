//! Link-level datagram format.
//!
//! Every UDP payload a node sends is one [`Datagram`]. Handshakes announce
//! the sender's identity and boot id and double as keepalives. Data
//! datagrams carry piggybacked acknowledgements for fragments received from
//! the peer and at most one fragment of a queued message.
//!
//! Layout: `version(1) || kind(1) || body`
//!
//! - Handshake: `node_id(16) || boot_id(8)`
//! - Data: `ack_count(1) || (message_id(4) start(4) end(4))* || has_fragment(1)
//!   || [message_id(4) total_len(4) offset(4) data_len(2) data]`

use crate::codec::Reader;
use crate::constants::{
    ACK_ENTRY_SIZE, DATA_DATAGRAM_MIN_SIZE, DATAGRAM_DATA, DATAGRAM_HANDSHAKE, DATAGRAM_VERSION,
    FRAGMENT_HEADER_SIZE, HANDSHAKE_SIZE, MAX_ACKS_PER_DATAGRAM,
};
use crate::error::CodecError;
use crate::types::{BootId, PEER_ID_LEN, PeerId};

/// Acknowledgement of bytes `[start, end)` of message `message_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRange {
    pub message_id: u32,
    pub start: u32,
    pub end: u32,
}

/// A contiguous slice of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub message_id: u32,
    pub total_len: u32,
    pub offset: u32,
    pub data: Vec<u8>,
}

impl Fragment {
    pub fn end(&self) -> u32 {
        self.offset + self.data.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Handshake {
        node_id: PeerId,
        boot_id: BootId,
    },
    Data {
        acks: Vec<AckRange>,
        fragment: Option<Fragment>,
    },
}

impl Datagram {
    pub fn encoded_len(&self) -> usize {
        match self {
            Datagram::Handshake { .. } => HANDSHAKE_SIZE,
            Datagram::Data { acks, fragment } => {
                DATA_DATAGRAM_MIN_SIZE
                    + acks.len() * ACK_ENTRY_SIZE
                    + fragment
                        .as_ref()
                        .map_or(0, |f| FRAGMENT_HEADER_SIZE - 1 + f.data.len())
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(DATAGRAM_VERSION);
        match self {
            Datagram::Handshake { node_id, boot_id } => {
                out.push(DATAGRAM_HANDSHAKE);
                out.extend_from_slice(node_id.as_ref());
                out.extend_from_slice(&boot_id.0.to_be_bytes());
            }
            Datagram::Data { acks, fragment } => {
                if acks.len() > MAX_ACKS_PER_DATAGRAM {
                    return Err(CodecError::TooLarge {
                        size: acks.len(),
                        limit: MAX_ACKS_PER_DATAGRAM,
                    });
                }
                out.push(DATAGRAM_DATA);
                out.push(acks.len() as u8);
                for ack in acks {
                    out.extend_from_slice(&ack.message_id.to_be_bytes());
                    out.extend_from_slice(&ack.start.to_be_bytes());
                    out.extend_from_slice(&ack.end.to_be_bytes());
                }
                match fragment {
                    None => out.push(0),
                    Some(f) => {
                        let data_len = u16::try_from(f.data.len()).map_err(|_| {
                            CodecError::TooLarge {
                                size: f.data.len(),
                                limit: u16::MAX as usize,
                            }
                        })?;
                        out.push(1);
                        out.extend_from_slice(&f.message_id.to_be_bytes());
                        out.extend_from_slice(&f.total_len.to_be_bytes());
                        out.extend_from_slice(&f.offset.to_be_bytes());
                        out.extend_from_slice(&data_len.to_be_bytes());
                        out.extend_from_slice(&f.data);
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        if version != DATAGRAM_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let datagram = match r.u8()? {
            DATAGRAM_HANDSHAKE => {
                let node_id = PeerId::try_from(r.take(PEER_ID_LEN)?)
                    .map_err(|e| CodecError::InvalidPayload(e.to_string()))?;
                let boot_id = BootId(r.u64()?);
                Datagram::Handshake { node_id, boot_id }
            }
            DATAGRAM_DATA => {
                let count = r.u8()? as usize;
                let mut acks = Vec::with_capacity(count);
                for _ in 0..count {
                    let ack = AckRange {
                        message_id: r.u32()?,
                        start: r.u32()?,
                        end: r.u32()?,
                    };
                    acks.push(ack);
                }
                let fragment = match r.u8()? {
                    0 => None,
                    1 => {
                        let message_id = r.u32()?;
                        let total_len = r.u32()?;
                        let offset = r.u32()?;
                        let len = r.u16()? as usize;
                        let data = r.take(len)?.to_vec();
                        if u64::from(offset) + len as u64 > u64::from(total_len) {
                            return Err(CodecError::InvalidPayload(format!(
                                "fragment [{offset}, {}) beyond message length {total_len}",
                                u64::from(offset) + len as u64
                            )));
                        }
                        Some(Fragment {
                            message_id,
                            total_len,
                            offset,
                            data,
                        })
                    }
                    other => {
                        return Err(CodecError::InvalidPayload(format!(
                            "bad fragment flag {other}"
                        )));
                    }
                };
                Datagram::Data { acks, fragment }
            }
            kind => return Err(CodecError::UnknownDatagramKind(kind)),
        };
        r.finish()?;
        Ok(datagram)
    }
}
