//! Fixed-capacity bit vector with set algebra.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8`. Bits at or beyond the
//! capacity are always unset. Binary operators require both operands to have
//! the same capacity and return [`ReplicationError::CapacityMismatch`]
//! otherwise.

use crate::error::{ReplicationError, Result};
use ahash::AHashMap;
use std::fmt;
use std::hash::Hash;

/// Index types accepted by the map-driven constructors.
pub trait BitIndex: Copy {
    fn bit(self) -> usize;
}

impl BitIndex for usize {
    fn bit(self) -> usize {
        self
    }
}

impl BitIndex for u32 {
    fn bit(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMask {
    buffer: Vec<u8>,
    capacity: usize,
    entries: usize,
}

fn bytes_for(capacity: usize) -> usize {
    (capacity + 7) / 8
}

impl BitMask {
    pub fn create(capacity: usize) -> Self {
        Self {
            buffer: vec![0; bytes_for(capacity)],
            capacity,
            entries: 0,
        }
    }

    /// Builds a mask with bit `indexes[k]` set for every key `k` that `filter` maps to `true`.
    pub fn from_set<K, I>(
        indexes: &AHashMap<K, I>,
        filter: &AHashMap<K, bool>,
        capacity: usize,
    ) -> Self
    where
        K: Eq + Hash,
        I: BitIndex,
    {
        let mut mask = Self::create(capacity);
        for (key, index) in indexes.iter() {
            if filter.get(key).copied().unwrap_or(false) {
                mask.set(index.bit());
            }
        }
        mask
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of set bits.
    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Mask of the bits of byte `index` that lie inside the capacity.
    fn valid_bits(&self, index: usize) -> u8 {
        let first = index * 8;
        if first + 8 <= self.capacity {
            0xFF
        } else if first >= self.capacity {
            0
        } else {
            (1u8 << (self.capacity - first)) - 1
        }
    }

    pub fn read(&self, index: usize) -> u8 {
        self.buffer.get(index).copied().unwrap_or(0)
    }

    pub fn write(&mut self, index: usize, value: u8) {
        if index >= self.buffer.len() {
            return;
        }
        let value = value & self.valid_bits(index);
        let old = self.buffer[index];
        self.entries = self.entries - old.count_ones() as usize + value.count_ones() as usize;
        self.buffer[index] = value;
    }

    /// Sets bit `index`. Indexes at or beyond the capacity are ignored.
    pub fn set(&mut self, index: usize) {
        if index >= self.capacity {
            return;
        }
        let byte = self.read(index / 8);
        self.write(index / 8, byte | (1 << (index % 8)));
    }

    pub fn get(&self, index: usize) -> bool {
        if index >= self.capacity {
            return false;
        }
        self.read(index / 8) & (1 << (index % 8)) != 0
    }

    pub fn clear(&mut self, index: usize) {
        if index >= self.capacity {
            return;
        }
        let byte = self.read(index / 8);
        self.write(index / 8, byte & !(1 << (index % 8)));
    }

    fn check_capacity(&self, other: &BitMask) -> Result<()> {
        if self.capacity != other.capacity {
            return Err(ReplicationError::CapacityMismatch {
                left: self.capacity,
                right: other.capacity,
            });
        }
        Ok(())
    }

    fn combine(&self, other: &BitMask, op: impl Fn(u8, u8) -> u8) -> Result<BitMask> {
        self.check_capacity(other)?;
        let mut out = BitMask::create(self.capacity);
        for index in 0..self.buffer.len() {
            out.write(index, op(self.read(index), other.read(index)));
        }
        Ok(out)
    }

    pub fn band(&self, other: &BitMask) -> Result<BitMask> {
        self.combine(other, |a, b| a & b)
    }

    pub fn bor(&self, other: &BitMask) -> Result<BitMask> {
        self.combine(other, |a, b| a | b)
    }

    pub fn bxor(&self, other: &BitMask) -> Result<BitMask> {
        self.combine(other, |a, b| a ^ b)
    }

    pub fn bnot(&self) -> BitMask {
        let mut out = BitMask::create(self.capacity);
        for index in 0..self.buffer.len() {
            out.write(index, !self.read(index));
        }
        out
    }

    /// Grows the capacity. Existing bits keep their positions; shrinking is a no-op.
    pub fn expand(&mut self, capacity: usize) {
        if capacity <= self.capacity {
            return;
        }
        self.capacity = capacity;
        self.buffer.resize(bytes_for(capacity), 0);
    }

    /// Translates the mask between two index spaces keyed by the same stable keys.
    ///
    /// Every key set at `from[key]` ends up set at `to[key]`. Keys missing from
    /// `to` are dropped.
    pub fn remap<K, I, J>(
        &self,
        from: &AHashMap<K, I>,
        to: &AHashMap<K, J>,
        new_capacity: usize,
    ) -> BitMask
    where
        K: Eq + Hash,
        I: BitIndex,
        J: BitIndex,
    {
        let mut out = BitMask::create(new_capacity);
        for (key, old) in from.iter() {
            if !self.get(old.bit()) {
                continue;
            }
            if let Some(new) = to.get(key) {
                out.set(new.bit());
            }
        }
        out
    }

    /// Moves every bit `n` positions up; bits pushed past the capacity are lost.
    pub fn lshift(&self, n: usize) -> BitMask {
        let mut out = BitMask::create(self.capacity);
        for index in self.iter() {
            if let Some(shifted) = index.checked_add(n) {
                out.set(shifted);
            }
        }
        out
    }

    /// Moves every bit `n` positions down; bits pushed below zero are lost.
    pub fn rshift(&self, n: usize) -> BitMask {
        let mut out = BitMask::create(self.capacity);
        for index in self.iter().filter(|index| *index >= n) {
            out.set(index - n);
        }
        out
    }

    /// Set bit indexes in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.capacity).filter(move |index| self.get(*index))
    }
}

impl fmt::Display for BitMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for index in 0..self.capacity {
            f.write_str(if self.get(index) { "1" } else { "0" })?;
        }
        Ok(())
    }
}
