//! Block-transfer messages exchanged between a sender and a receiver.
//!
//! Wire layout: `type(1) || transfer_id(8) || body`, all integers
//! big-endian. Bodies:
//!
//! - `PacketTransmit`: `index(4) || bitmap_len(4) || bitmap || data_len(4) || data`
//! - `MissingPacketNotification`: `count(4) || index(4)*count`
//! - `AllSent`, `AllReceived`: empty
//! - `SendAborted`: `code(2) || text_len(2) || utf8 text`

use core::fmt;

use crate::abort::AbortCode;
use crate::bitmap::PacketBitmap;
use crate::codec::Reader;
use crate::constants::{
    MESSAGE_HEADER_SIZE, MSG_ALL_RECEIVED, MSG_ALL_SENT, MSG_MISSING_PACKETS,
    MSG_PACKET_TRANSMIT, MSG_SEND_ABORTED, PACKET_TRANSMIT_OVERHEAD,
};
use crate::error::CodecError;
use crate::types::TransferId;

/// Discriminant of a [`TransferMessage`], usable as a filter bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    PacketTransmit = MSG_PACKET_TRANSMIT,
    MissingPacketNotification = MSG_MISSING_PACKETS,
    AllSent = MSG_ALL_SENT,
    AllReceived = MSG_ALL_RECEIVED,
    SendAborted = MSG_SEND_ABORTED,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            MSG_PACKET_TRANSMIT => Ok(MessageKind::PacketTransmit),
            MSG_MISSING_PACKETS => Ok(MessageKind::MissingPacketNotification),
            MSG_ALL_SENT => Ok(MessageKind::AllSent),
            MSG_ALL_RECEIVED => Ok(MessageKind::AllReceived),
            MSG_SEND_ABORTED => Ok(MessageKind::SendAborted),
            _ => Err(CodecError::UnknownMessageType(v)),
        }
    }

    /// Single-bit mask for kind sets.
    pub const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub const fn name(self) -> &'static str {
        match self {
            MessageKind::PacketTransmit => "PacketTransmit",
            MessageKind::MissingPacketNotification => "MissingPacketNotification",
            MessageKind::AllSent => "AllSent",
            MessageKind::AllReceived => "AllReceived",
            MessageKind::SendAborted => "SendAborted",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scheduling class of an outgoing message.
///
/// Control traffic (loss reports, completion, aborts) is small and
/// latency-sensitive and always goes ahead of bulk packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Control,
    Bulk,
}

#[derive(Clone, PartialEq, Eq)]
pub enum TransferMessage {
    PacketTransmit {
        transfer_id: TransferId,
        packet_index: u32,
        /// Every packet the sender has put on the wire so far, this one
        /// included.
        sent: PacketBitmap,
        data: Vec<u8>,
    },
    MissingPacketNotification {
        transfer_id: TransferId,
        packets: Vec<u32>,
    },
    AllSent {
        transfer_id: TransferId,
    },
    AllReceived {
        transfer_id: TransferId,
    },
    SendAborted {
        transfer_id: TransferId,
        code: AbortCode,
        description: String,
    },
}

impl TransferMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            TransferMessage::PacketTransmit { .. } => MessageKind::PacketTransmit,
            TransferMessage::MissingPacketNotification { .. } => {
                MessageKind::MissingPacketNotification
            }
            TransferMessage::AllSent { .. } => MessageKind::AllSent,
            TransferMessage::AllReceived { .. } => MessageKind::AllReceived,
            TransferMessage::SendAborted { .. } => MessageKind::SendAborted,
        }
    }

    pub fn transfer_id(&self) -> TransferId {
        match self {
            TransferMessage::PacketTransmit { transfer_id, .. }
            | TransferMessage::MissingPacketNotification { transfer_id, .. }
            | TransferMessage::AllSent { transfer_id }
            | TransferMessage::AllReceived { transfer_id }
            | TransferMessage::SendAborted { transfer_id, .. } => *transfer_id,
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            TransferMessage::PacketTransmit { .. } => Priority::Bulk,
            _ => Priority::Control,
        }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_SIZE
            + match self {
                TransferMessage::PacketTransmit { sent, data, .. } => {
                    PACKET_TRANSMIT_OVERHEAD + sent.as_bytes().len() + data.len()
                }
                TransferMessage::MissingPacketNotification { packets, .. } => {
                    4 + 4 * packets.len()
                }
                TransferMessage::AllSent { .. } | TransferMessage::AllReceived { .. } => 0,
                TransferMessage::SendAborted { description, .. } => {
                    4 + truncate_utf8(description, u16::MAX as usize).len()
                }
            }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.kind() as u8);
        out.extend_from_slice(&self.transfer_id().get().to_be_bytes());

        match self {
            TransferMessage::PacketTransmit {
                packet_index,
                sent,
                data,
                ..
            } => {
                out.extend_from_slice(&packet_index.to_be_bytes());
                out.extend_from_slice(&sent.len().to_be_bytes());
                out.extend_from_slice(sent.as_bytes());
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
            }
            TransferMessage::MissingPacketNotification { packets, .. } => {
                out.extend_from_slice(&(packets.len() as u32).to_be_bytes());
                for p in packets {
                    out.extend_from_slice(&p.to_be_bytes());
                }
            }
            TransferMessage::AllSent { .. } | TransferMessage::AllReceived { .. } => {}
            TransferMessage::SendAborted {
                code, description, ..
            } => {
                let text = truncate_utf8(description, u16::MAX as usize);
                out.extend_from_slice(&code.to_u16().to_be_bytes());
                out.extend_from_slice(&(text.len() as u16).to_be_bytes());
                out.extend_from_slice(text.as_bytes());
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let kind = MessageKind::from_u8(r.u8()?)?;
        let transfer_id = TransferId::new(r.u64()?);

        let msg = match kind {
            MessageKind::PacketTransmit => {
                let packet_index = r.u32()?;
                let bits = r.u32()?;
                if packet_index >= bits {
                    return Err(CodecError::InvalidPayload(format!(
                        "packet index {packet_index} outside bitmap of {bits}"
                    )));
                }
                let sent = PacketBitmap::from_bytes(bits, r.take(PacketBitmap::byte_len(bits))?)?;
                let data_len = r.u32()? as usize;
                let data = r.take(data_len)?.to_vec();
                TransferMessage::PacketTransmit {
                    transfer_id,
                    packet_index,
                    sent,
                    data,
                }
            }
            MessageKind::MissingPacketNotification => {
                let count = r.u32()? as usize;
                let raw = r.take(count.saturating_mul(4))?;
                let packets = raw
                    .chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                TransferMessage::MissingPacketNotification {
                    transfer_id,
                    packets,
                }
            }
            MessageKind::AllSent => TransferMessage::AllSent { transfer_id },
            MessageKind::AllReceived => TransferMessage::AllReceived { transfer_id },
            MessageKind::SendAborted => {
                let code = AbortCode::from_u16(r.u16()?);
                let len = r.u16()? as usize;
                let description = String::from_utf8(r.take(len)?.to_vec()).map_err(|_| {
                    CodecError::InvalidPayload("abort description is not utf-8".into())
                })?;
                TransferMessage::SendAborted {
                    transfer_id,
                    code,
                    description,
                }
            }
        };
        r.finish()?;
        Ok(msg)
    }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

impl fmt::Debug for TransferMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMessage::PacketTransmit {
                transfer_id,
                packet_index,
                sent,
                data,
            } => f
                .debug_struct("PacketTransmit")
                .field("transfer_id", transfer_id)
                .field("packet_index", packet_index)
                .field("sent", sent)
                .field("data_len", &data.len())
                .finish(),
            TransferMessage::MissingPacketNotification {
                transfer_id,
                packets,
            } => f
                .debug_struct("MissingPacketNotification")
                .field("transfer_id", transfer_id)
                .field("packets", packets)
                .finish(),
            TransferMessage::AllSent { transfer_id } => {
                f.debug_struct("AllSent").field("transfer_id", transfer_id).finish()
            }
            TransferMessage::AllReceived { transfer_id } => f
                .debug_struct("AllReceived")
                .field("transfer_id", transfer_id)
                .finish(),
            TransferMessage::SendAborted {
                transfer_id,
                code,
                description,
            } => f
                .debug_struct("SendAborted")
                .field("transfer_id", transfer_id)
                .field("code", code)
                .field("description", description)
                .finish(),
        }
    }
}
