//! The compact piece availability vector exchanged with peers.

use bitvec::prelude::{BitVec, Msb0};

use crate::PieceIndex;

/// A fixed length bit vector with one bit per piece and a cached population
/// count.
///
/// The bit order matches the wire representation: most significant bit
/// first, that is, the highest bit of the first byte stands for piece 0
/// (e.g. `0b1100_0001` means having pieces 0, 1, and 7). The length is fixed
/// at construction; only the orchestrator mutates its own instance, peer
/// sessions mutate the remote peer's instance.
#[derive(Clone, Debug, PartialEq)]
pub struct Bitfield {
    bits: BitVec<Msb0, u8>,
    /// Kept in lockstep with the number of true bits so that availability
    /// checks don't rescan the vector.
    set_count: usize,
}

impl Bitfield {
    /// Creates an all-zero bitfield of the given length.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, piece_count),
            set_count: 0,
        }
    }

    /// Creates an all-one bitfield of the given length.
    pub fn new_all_set(piece_count: usize) -> Self {
        Self {
            bits: BitVec::repeat(true, piece_count),
            set_count: piece_count,
        }
    }

    /// Creates a bitfield from the raw bytes received in a BITFIELD message.
    ///
    /// The wire representation is padded to a byte boundary, so the raw data
    /// may be longer than the logical piece count; the spill is sliced off.
    /// Returns `None` if the data is too short for the piece count or if any
    /// spill bit is set (which would mean the peer counts pieces we don't
    /// know about).
    pub fn from_bytes(data: &[u8], piece_count: usize) -> Option<Self> {
        if data.len() * 8 < piece_count {
            return None;
        }
        let mut bits = BitVec::<Msb0, u8>::from_vec(data.to_vec());
        if bits[piece_count..].iter().any(|b| *b) {
            return None;
        }
        bits.resize(piece_count, false);
        let set_count = bits.count_ones();
        Some(Self { bits, set_count })
    }

    /// Returns the wire representation: the bits packed into bytes, padded
    /// with zeros to a byte boundary.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bits = self.bits.clone();
        // pad to byte boundary for the wire
        let padded = (self.bits.len() + 7) / 8 * 8;
        bits.resize(padded, false);
        bits.into_vec()
    }

    /// The number of pieces the bitfield covers.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// The cached population count.
    pub fn count(&self) -> usize {
        debug_assert_eq!(self.set_count, self.bits.count_ones());
        self.set_count
    }

    /// The number of pieces not present.
    pub fn missing_count(&self) -> usize {
        self.len() - self.count()
    }

    /// Returns whether every piece is present.
    pub fn is_all_set(&self) -> bool {
        self.set_count == self.bits.len()
    }

    pub fn has(&self, index: PieceIndex) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Sets the bit, returning whether it was previously unset.
    pub fn set(&mut self, index: PieceIndex) -> bool {
        if self.has(index) {
            return false;
        }
        self.bits.set(index, true);
        self.set_count += 1;
        true
    }

    /// Clears the bit, returning whether it was previously set.
    pub fn clear(&mut self, index: PieceIndex) -> bool {
        if !self.has(index) {
            return false;
        }
        self.bits.set(index, false);
        self.set_count -= 1;
        true
    }

    /// Iterates over the indices of set bits.
    pub fn iter_set(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .map(|(i, _)| i)
    }
}
