//! Shared partially-received block buffer.
//!
//! A [`BlockBuffer`] holds one block in flight, addressed by fixed-size
//! packet index. The sending side wraps data it already has; the receiving
//! side allocates empty storage sized by the advertised length and fills it
//! as packets arrive. Handles are cheap to clone; a sender-side buffer may
//! feed several senders at once while it is still being filled upstream.
//!
//! Listeners registered with [`BlockBuffer::subscribe`] are told about each
//! newly arrived packet and about an abort. They are always invoked after
//! the internal lock has been released, so a listener may call back into
//! the buffer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::abort::{AbortCode, AbortReason};
use crate::bitmap::PacketBitmap;
use crate::error::BufferError;

/// Observer of buffer progress.
pub trait BufferListener: Send + Sync {
    /// Packet `index` has just been stored.
    fn packet_received(&self, index: u32);

    /// The buffer was aborted. Called at most once per subscription.
    fn aborted(&self, reason: &AbortReason);
}

/// Handle returned by [`BlockBuffer::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct BufferState {
    data: Vec<u8>,
    received: PacketBitmap,
    aborted: Option<AbortReason>,
    listeners: Vec<(ListenerId, Arc<dyn BufferListener>)>,
    next_listener: u64,
}

struct Shared {
    len: usize,
    packet_size: u32,
    packet_count: u32,
    state: Mutex<BufferState>,
}

#[derive(Clone)]
pub struct BlockBuffer {
    shared: Arc<Shared>,
}

fn packet_count_for(len: usize, packet_size: u32) -> Result<u32, BufferError> {
    if packet_size == 0 {
        return Err(BufferError::ZeroPacketSize);
    }
    u32::try_from(len.div_ceil(packet_size as usize))
        .map_err(|_| BufferError::TooManyPackets { len, packet_size })
}

impl BlockBuffer {
    /// Empty storage for a block of `len` bytes that will arrive in pieces.
    pub fn new_empty(len: usize, packet_size: u32) -> Result<Self, BufferError> {
        let packet_count = packet_count_for(len, packet_size)?;
        Ok(Self::build(
            vec![0; len],
            PacketBitmap::new(packet_count),
            packet_size,
            packet_count,
        ))
    }

    /// Wrap a block that is already entirely present.
    pub fn from_data(data: Vec<u8>, packet_size: u32) -> Result<Self, BufferError> {
        let packet_count = packet_count_for(data.len(), packet_size)?;
        let mut received = PacketBitmap::new(packet_count);
        for i in 0..packet_count {
            received.set(i);
        }
        Ok(Self::build(data, received, packet_size, packet_count))
    }

    fn build(data: Vec<u8>, received: PacketBitmap, packet_size: u32, packet_count: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                len: data.len(),
                packet_size,
                packet_count,
                state: Mutex::new(BufferState {
                    data,
                    received,
                    aborted: None,
                    listeners: Vec::new(),
                    next_listener: 0,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Total block length in bytes.
    pub fn len(&self) -> usize {
        self.shared.len
    }

    pub fn is_empty(&self) -> bool {
        self.shared.len == 0
    }

    pub fn packet_size(&self) -> u32 {
        self.shared.packet_size
    }

    pub fn packet_count(&self) -> u32 {
        self.shared.packet_count
    }

    /// Byte length of packet `index`; the last packet may be short.
    pub fn packet_len(&self, index: u32) -> Result<usize, BufferError> {
        self.check_index(index)?;
        let size = self.shared.packet_size as usize;
        let start = index as usize * size;
        Ok((self.shared.len - start).min(size))
    }

    fn check_index(&self, index: u32) -> Result<(), BufferError> {
        if index >= self.shared.packet_count {
            return Err(BufferError::IndexOutOfRange {
                index,
                count: self.shared.packet_count,
            });
        }
        Ok(())
    }

    /// Store packet `index`.
    ///
    /// Returns `Ok(true)` if the packet was new, `Ok(false)` if it had
    /// already been received (the bytes are ignored). Rejected once the
    /// buffer has been aborted.
    pub fn add_packet(&self, index: u32, bytes: &[u8]) -> Result<bool, BufferError> {
        let expected = self.packet_len(index)?;
        if bytes.len() != expected {
            return Err(BufferError::WrongPacketLength {
                index,
                expected,
                actual: bytes.len(),
            });
        }

        let listeners = {
            let mut state = self.lock();
            if let Some(reason) = &state.aborted {
                return Err(BufferError::Aborted(reason.clone()));
            }
            if state.received.get(index) {
                return Ok(false);
            }
            let start = index as usize * self.shared.packet_size as usize;
            state.data[start..start + expected].copy_from_slice(bytes);
            state.received.set(index);
            state
                .listeners
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect::<Vec<_>>()
        };

        for listener in listeners {
            listener.packet_received(index);
        }
        Ok(true)
    }

    pub fn is_received(&self, index: u32) -> bool {
        self.lock().received.get(index)
    }

    /// Snapshot of the received set.
    pub fn received_bitmap(&self) -> PacketBitmap {
        self.lock().received.clone()
    }

    pub fn received_count(&self) -> u32 {
        self.lock().received.count_ones()
    }

    /// True once every packet is present. A zero-length block is complete.
    pub fn is_complete(&self) -> bool {
        self.lock().received.is_full()
    }

    /// Copy of packet `index`, if it has been received.
    pub fn packet(&self, index: u32) -> Result<Vec<u8>, BufferError> {
        let len = self.packet_len(index)?;
        let state = self.lock();
        if !state.received.get(index) {
            return Err(BufferError::NotReceived(index));
        }
        let start = index as usize * self.shared.packet_size as usize;
        Ok(state.data[start..start + len].to_vec())
    }

    /// Copy of the whole block. Fails unless every packet is present.
    pub fn to_vec(&self) -> Result<Vec<u8>, BufferError> {
        let state = self.lock();
        if let Some(reason) = &state.aborted {
            return Err(BufferError::Aborted(reason.clone()));
        }
        if !state.received.is_full() {
            return Err(BufferError::Incomplete {
                received: state.received.count_ones(),
                count: self.shared.packet_count,
            });
        }
        Ok(state.data.clone())
    }

    /// Abort the buffer. Only the first call has any effect; returns whether
    /// this call was the one that aborted it.
    pub fn abort(&self, code: AbortCode, description: impl Into<String>) -> bool {
        let reason = AbortReason::new(code, description);
        let listeners = {
            let mut state = self.lock();
            if state.aborted.is_some() {
                return false;
            }
            state.aborted = Some(reason.clone());
            state
                .listeners
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect::<Vec<_>>()
        };

        tracing::debug!(
            len = self.shared.len,
            reason = %reason,
            listeners = listeners.len(),
            "block buffer aborted"
        );
        for listener in listeners {
            listener.aborted(&reason);
        }
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted.is_some()
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.lock().aborted.clone()
    }

    /// Register a listener. Subscribing to an already aborted buffer delivers
    /// the abort immediately.
    pub fn subscribe(&self, listener: Arc<dyn BufferListener>) -> ListenerId {
        let (id, aborted) = {
            let mut state = self.lock();
            let id = ListenerId(state.next_listener);
            state.next_listener += 1;
            state.listeners.push((id, Arc::clone(&listener)));
            (id, state.aborted.clone())
        };
        if let Some(reason) = aborted {
            listener.aborted(&reason);
        }
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.lock().listeners.retain(|(lid, _)| *lid != id);
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }
}

impl core::fmt::Debug for BlockBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("BlockBuffer")
            .field("len", &self.shared.len)
            .field("packet_size", &self.shared.packet_size)
            .field("received", &state.received)
            .field("aborted", &state.aborted)
            .finish()
    }
}
