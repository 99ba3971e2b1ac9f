//! Everything a transfer session needs from its node.

use std::sync::Arc;

use tessera_core::abort::AbortCode;
use tessera_core::buffer::BlockBuffer;
use tessera_core::message::TransferMessage;
use tessera_core::types::{PeerId, TransferId};

use crate::config::TransferConfig;
use crate::error::SendError;
use crate::filter::FilterDispatcher;
use crate::receiver::{self, ReceiveHandle, ReceiveOptions};
use crate::sender::{self, SendHandle};
use crate::sink::MessageSink;

#[derive(Clone)]
pub struct TransferContext {
    pub dispatcher: FilterDispatcher,
    pub sink: Arc<dyn MessageSink>,
    pub config: TransferConfig,
}

impl TransferContext {
    pub fn new(dispatcher: FilterDispatcher, sink: Arc<dyn MessageSink>, config: TransferConfig) -> Self {
        Self {
            dispatcher,
            sink,
            config,
        }
    }

    /// Start transmitting `buffer` to `peer`. See [`sender`].
    pub fn start_send(&self, peer: PeerId, transfer_id: TransferId, buffer: BlockBuffer) -> SendHandle {
        sender::start(self.clone(), peer, transfer_id, buffer)
    }

    /// Start receiving a block of `len` bytes from `peer`. See [`receiver`].
    pub fn start_receive(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        len: usize,
        options: ReceiveOptions,
    ) -> Result<ReceiveHandle, crate::error::TransferError> {
        let buffer = BlockBuffer::new_empty(len, self.config.packet_size)?;
        Ok(receiver::start(self.clone(), peer, transfer_id, buffer, options))
    }

    /// Tell `peer` its block arrived. Only needed for receives started with
    /// `acknowledge_completion` disabled.
    pub fn acknowledge(&self, peer: PeerId, transfer_id: TransferId) -> Result<(), SendError> {
        self.sink
            .send(peer, TransferMessage::AllReceived { transfer_id }, None)
    }

    /// Tell `peer` its block was rejected after reception.
    pub fn reject(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        code: AbortCode,
        description: impl Into<String>,
    ) -> Result<(), SendError> {
        self.sink.send(
            peer,
            TransferMessage::SendAborted {
                transfer_id,
                code,
                description: description.into(),
            },
            None,
        )
    }
}
