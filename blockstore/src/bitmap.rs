use std::borrow::{Borrow, BorrowMut};
use std::ops::Range;

use bitvec::prelude::*;

/// Bit `i` lives in byte `i / 8` at bit position `i % 8`.
pub type Bits = BitSlice<u8, Lsb0>;

/// A fixed-length run of bits. The storage is either owned (`BitVec`) or a
/// view over bytes someone else owns, which is how the block store lays its
/// free map directly over its own blocks.
///
/// Out of range indexes passed to `set`, `reset` or `test` panic, callers are
/// expected to check against `len()`.
pub struct BitVector<S> {
    len: usize,
    storage: S,
}

pub type OwnedBitVector = BitVector<BitVec<u8, Lsb0>>;
/// Read-only view over borrowed bytes.
pub type BitVectorView<'a> = BitVector<&'a Bits>;
/// Mutable view over borrowed bytes. Writes land in the borrowed buffer.
pub type BitVectorOverlay<'a> = BitVector<&'a mut Bits>;

/// Number of bytes needed to hold `num_bits`, `None` if that overflows.
fn byte_len(num_bits: usize) -> Option<usize> {
    num_bits.checked_add(7).map(|n| n / 8)
}

impl BitVector<BitVec<u8, Lsb0>> {
    /// Allocates a zeroed vector of `num_bits`. Returns `None` for an empty
    /// vector or if the memory could not be reserved.
    pub fn create(num_bits: usize) -> Option<Self> {
        if num_bits == 0 {
            return None;
        }
        let num_bytes = byte_len(num_bits)?;

        let mut bytes = Vec::new();
        bytes.try_reserve_exact(num_bytes).ok()?;
        bytes.resize(num_bytes, 0u8);

        let storage = BitVec::try_from_vec(bytes).ok()?;
        Some(Self {
            len: num_bits,
            storage,
        })
    }
}

impl<'a> BitVector<&'a mut Bits> {
    /// Interprets the leading `ceil(num_bits / 8)` bytes of `buf` as bits. Nothing
    /// is initialized, existing bytes are read as they are.
    pub fn overlay(num_bits: usize, buf: &'a mut [u8]) -> Option<Self> {
        let num_bytes = byte_len(num_bits)?;
        if num_bits == 0 || buf.len() < num_bytes {
            return None;
        }

        let storage = Bits::try_from_slice_mut(&mut buf[..num_bytes]).ok()?;
        Some(Self {
            len: num_bits,
            storage,
        })
    }
}

impl<'a> BitVector<&'a Bits> {
    pub fn view(num_bits: usize, buf: &'a [u8]) -> Option<Self> {
        let num_bytes = byte_len(num_bits)?;
        if num_bits == 0 || buf.len() < num_bytes {
            return None;
        }

        let storage = Bits::try_from_slice(&buf[..num_bytes]).ok()?;
        Some(Self {
            len: num_bits,
            storage,
        })
    }

    /// Iterates set bits for as long as the underlying buffer is borrowed, rather
    /// than for as long as this view lives.
    pub fn into_iter_ones(self) -> impl Iterator<Item = usize> + 'a {
        let len = self.len;
        let bits: &'a Bits = self.storage;
        bits[..len].iter_ones()
    }
}

impl<S: Borrow<Bits>> BitVector<S> {
    /// Wraps bits whose length is already known to be right. Used where the
    /// geometry is fixed at compile time and the checked constructors can't fail.
    pub(crate) fn from_bits(storage: S) -> Self {
        let len = storage.borrow().len();
        Self { len, storage }
    }

    fn bits(&self) -> &Bits {
        &self.storage.borrow()[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn test(&self, index: usize) -> bool {
        self.bits()[index]
    }

    /// Lowest index holding a zero bit, scanning upwards from 0.
    pub fn first_zero(&self) -> Option<usize> {
        self.bits().first_zero()
    }

    /// Lowest zero bit inside `range`, as an index into the whole vector.
    pub fn first_zero_in(&self, range: Range<usize>) -> Option<usize> {
        let start = range.start;
        self.bits()[range].first_zero().map(|i| i + start)
    }

    /// Population count.
    pub fn count_ones(&self) -> usize {
        self.bits().count_ones()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits().iter_ones()
    }
}

impl<S: BorrowMut<Bits>> BitVector<S> {
    fn bits_mut(&mut self) -> &mut Bits {
        let len = self.len;
        &mut self.storage.borrow_mut()[..len]
    }

    pub fn set(&mut self, index: usize) {
        self.bits_mut().set(index, true);
    }

    pub fn reset(&mut self, index: usize) {
        self.bits_mut().set(index, false);
    }
}
