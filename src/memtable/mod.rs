//! In-memory write table: a Bloom filter plus an arena-backed skip list.
//!
//! The memtable is the first stop for every write. Once it reaches its
//! entry limit the coordinator flushes it into a level-0 SSTable and clears
//! it in place; the filter written out alongside the data lets readers skip
//! files that cannot contain a key.

pub mod arena;
pub mod bitset;
pub mod bloom;
pub mod skiplist;

pub use arena::ByteArena;
pub use bitset::BitSet;
pub use bloom::BloomFilter;
pub use skiplist::SkipList;

use crate::error::Result;
use crate::range::{KeyRange, RangeAccumulator};
use crate::sstable::Footer;

use std::io::Write;

// Fixed seed: reloading a memtable from metadata rebuilds the same node
// layout for the same insertion order.
const LIST_RNG_SEED: u64 = 6;

pub struct Memtable {
    filter: BloomFilter,
    list: SkipList,
}

impl Memtable {
    pub fn new(
        filter_bits: u64,
        filter_hashes: u64,
        kv_count_limit: usize,
        arena_slice_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            filter: BloomFilter::new(filter_bits, filter_hashes),
            list: SkipList::new(kv_count_limit, arena_slice_size, LIST_RNG_SEED)?,
        })
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.filter.insert(key);
        self.list.insert(key, value)
    }

    /// Erased keys go through the filter too: the tombstone must be
    /// findable in the flushed SSTable.
    pub fn erase(&mut self, key: &[u8]) -> Result<()> {
        self.filter.insert(key);
        self.list.erase(key)
    }

    /// The skip list answers authoritatively, so the filter is not
    /// consulted on the in-memory path.
    pub fn find(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.list.find(key)
    }

    pub fn find_range(&self, range: &KeyRange) -> RangeAccumulator {
        self.list.find_range(range)
    }

    pub fn clear(&mut self) {
        self.filter.clear();
        self.list.clear();
    }

    pub fn kv_count(&self) -> usize {
        self.list.len()
    }

    pub fn arena_slice_size(&self) -> usize {
        self.list.arena_slice_size()
    }

    pub fn filter_bits(&self) -> u64 {
        self.filter.bit_count()
    }

    pub fn filter_hashes(&self) -> u64 {
        self.filter.hash_count()
    }

    /// Write the full SSTable frame: data block, filter block, index block,
    /// footer. Returns the record count, which is zero when every entry was
    /// a skipped tombstone; the caller must not keep the file in that case.
    pub fn flush_to_sstable<W: Write>(&self, w: &mut W, skip_tombstones: bool) -> Result<u64> {
        let (kv_written, data_bytes) = self.list.write_data_block(w, skip_tombstones)?;
        if kv_written == 0 {
            return Ok(0);
        }
        self.filter.write_block(w)?;
        self.list.write_index_block(w, skip_tombstones)?;

        let footer = Footer {
            filter_offset: data_bytes,
            filter_bits: self.filter.bit_count(),
            filter_hash_func_count: self.filter.hash_count(),
            index_offset: data_bytes + self.filter.size_in_bytes() as u64,
            kv_count: kv_written,
        };
        w.write_all(&footer.encode())?;
        Ok(kv_written)
    }

    /// Dump every record, tombstones included, without the SSTable frame.
    /// Used for engine metadata persistence.
    pub fn dump_kvs<W: Write>(&self, w: &mut W) -> Result<()> {
        self.list.write_data_block(w, false)?;
        Ok(())
    }
}
