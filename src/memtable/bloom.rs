//! Bloom filter for reducing disk I/O on non-existent key lookups.
//!
//! Probes are generated by double hashing: the two 64-bit halves of one
//! 128-bit digest produce the full probe sequence `(h1 + i*h2) mod m`, so
//! each membership test hashes the key exactly once.

use super::bitset::BitSet;
use crate::error::Result;
use crate::hasher;

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

/// Bloom filter with `m` bits and `k` probes per key. False positives are
/// possible, false negatives are not. An `m == 0` filter contains nothing.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bits: BitSet,
    bit_count: u64,
    hash_count: u64,
}

impl BloomFilter {
    pub fn new(bit_count: u64, hash_count: u64) -> Self {
        Self {
            bits: BitSet::new(bit_count as usize),
            bit_count,
            hash_count,
        }
    }

    /// Optimal `(m, k)` for an expected key count and a target
    /// false-positive rate:
    ///
    /// - `m = ceil(-n * ln(p) / (ln 2)^2)`
    /// - `k = max(1, round((m/n) * ln 2))`
    ///
    /// An expected count of zero yields `(0, 0)`.
    pub fn optimal_params(expected_keys: u64, fp_rate: f64) -> (u64, u64) {
        if expected_keys == 0 {
            return (0, 0);
        }
        let ln2 = std::f64::consts::LN_2;
        let bit_count = -(expected_keys as f64) * fp_rate.ln() / (ln2 * ln2);
        let hash_count = (bit_count / expected_keys as f64) * ln2;
        (bit_count.ceil() as u64, hash_count.round().max(1.0) as u64)
    }

    pub fn insert(&mut self, key: &[u8]) {
        if self.bit_count == 0 {
            return;
        }
        let (low, high) = hasher::hash128(key);
        for i in 0..self.hash_count {
            self.bits
                .set(hasher::ith_hash(low, high, i, self.bit_count) as usize);
        }
    }

    /// Returns false as soon as any probe bit is zero; true means the key
    /// may be present.
    pub fn contains(&self, key: &[u8]) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (low, high) = hasher::hash128(key);
        for i in 0..self.hash_count {
            if !self.bits.test(hasher::ith_hash(low, high, i, self.bit_count) as usize) {
                return false;
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.bits.clear();
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u64 {
        self.hash_count
    }

    pub fn size_in_bytes(&self) -> usize {
        self.bits.size_in_bytes()
    }

    /// Emit the raw word buffer. `m` and `k` travel in the SSTable footer,
    /// not in the block.
    pub fn write_block<W: Write>(&self, w: &mut W) -> Result<()> {
        for word in self.bits.words() {
            w.write_u64::<LittleEndian>(*word)?;
        }
        Ok(())
    }
}
