//! Fixed-length bit-per-packet set.

use bitvec::prelude::*;

use crate::error::CodecError;

/// One bit per packet index, most significant bit first on the wire.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct PacketBitmap {
    bits: BitVec<u8, Msb0>,
}

impl PacketBitmap {
    /// All-clear bitmap for `len` packets.
    pub fn new(len: u32) -> Self {
        Self {
            bits: bitvec![u8, Msb0; 0; len as usize],
        }
    }

    /// Rebuild from the wire representation.
    pub fn from_bytes(len: u32, bytes: &[u8]) -> Result<Self, CodecError> {
        let needed = Self::byte_len(len);
        if bytes.len() != needed {
            return Err(CodecError::InvalidPayload(format!(
                "bitmap of {len} bits needs {needed} bytes, got {}",
                bytes.len()
            )));
        }
        let mut bits = BitVec::<u8, Msb0>::from_slice(bytes);
        bits.truncate(len as usize);
        bits.set_uninitialized(false);
        Ok(Self { bits })
    }

    /// Bytes needed to carry `len` bits.
    pub const fn byte_len(len: u32) -> usize {
        (len as usize).div_ceil(8)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }

    pub fn len(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn get(&self, index: u32) -> bool {
        self.bits.get(index as usize).is_some_and(|b| *b)
    }

    /// Set bit `index`, returning its previous value. Out of range is a no-op.
    pub fn set(&mut self, index: u32) -> bool {
        match self.bits.get_mut(index as usize) {
            Some(mut bit) => bit.replace(true),
            None => false,
        }
    }

    pub fn clear(&mut self, index: u32) {
        if let Some(mut bit) = self.bits.get_mut(index as usize) {
            *bit = false;
        }
    }

    pub fn count_ones(&self) -> u32 {
        self.bits.count_ones() as u32
    }

    pub fn is_full(&self) -> bool {
        self.bits.all()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter_ones().map(|i| i as u32)
    }

    pub fn iter_zeros(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter_zeros().map(|i| i as u32)
    }

    /// Indices set here but clear in `other`.
    ///
    /// With `self` being what a sender believes it delivered and `other` the
    /// local received set, this is the list of packets lost in transit.
    pub fn difference<'a>(&'a self, other: &'a PacketBitmap) -> impl Iterator<Item = u32> + 'a {
        self.iter_ones().filter(move |&i| !other.get(i))
    }
}

impl core::fmt::Debug for PacketBitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PacketBitmap({}/{})", self.count_ones(), self.len())
    }
}
