//! Piece bitfields as exchanged on the wire.

use bytes::Bytes;

use crate::torrent::{PieceIndex, TorrentError};

/// Fixed-length set of piece indices, most significant bit first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: u32,
}

impl Bitfield {
    /// Empty bitfield for `len` pieces.
    pub fn new(len: u32) -> Self {
        Self {
            bits: vec![0; (len as usize).div_ceil(8)],
            len,
        }
    }

    /// Bitfield with every piece set.
    pub fn full(len: u32) -> Self {
        let mut bitfield = Self::new(len);
        for index in 0..len {
            bitfield.set(PieceIndex::new(index));
        }
        bitfield
    }

    /// Parses a wire bitfield.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Wrong byte length or spare bits set
    pub fn from_wire(bytes: &[u8], len: u32) -> Result<Self, TorrentError> {
        let expected = (len as usize).div_ceil(8);
        if bytes.len() != expected {
            return Err(TorrentError::ProtocolError {
                message: format!("Bitfield of {} bytes, expected {expected}", bytes.len()),
            });
        }
        let spare = expected * 8 - len as usize;
        if spare > 0 && bytes[expected - 1] & ((1u8 << spare) - 1) != 0 {
            return Err(TorrentError::ProtocolError {
                message: "Bitfield has spare bits set".to_string(),
            });
        }
        Ok(Self {
            bits: bytes.to_vec(),
            len,
        })
    }

    /// Number of pieces covered.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the bitfield covers no pieces.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `index` is set. Out-of-range indices are never set.
    pub fn has(&self, index: PieceIndex) -> bool {
        let i = index.as_usize();
        i < self.len as usize && self.bits[i / 8] & (0x80 >> (i % 8)) != 0
    }

    /// Sets `index`; returns false when it was already set or out of range.
    pub fn set(&mut self, index: PieceIndex) -> bool {
        let i = index.as_usize();
        if i >= self.len as usize || self.has(index) {
            return false;
        }
        self.bits[i / 8] |= 0x80 >> (i % 8);
        true
    }

    /// Indices that are set, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.len)
            .map(PieceIndex::new)
            .filter(|index| self.has(*index))
    }

    /// Wire form.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }
}
