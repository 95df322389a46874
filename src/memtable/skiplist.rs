//! Randomized skip list keyed by byte strings stored in the arena.
//!
//! Nodes live in a contiguous vector and point at each other by index; the
//! head sentinel sits at index 0 and `NIL` marks the end of a chain. Each
//! node records where its key starts in the arena and the key/value sizes,
//! so the list itself never owns payload bytes. A `value_size` of zero is
//! the tombstone encoding: erasing a key only clears the size without
//! touching the arena.

use super::arena::ByteArena;
use crate::error::{Error, Result};
use crate::range::{KeyRange, RangeAccumulator};
use crate::sstable::RECORD_HEADER_SIZE;

use byteorder::{LittleEndian, WriteBytesExt};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::cmp::Ordering;
use std::io::Write;

const MAX_LEVEL: usize = 32;
const NIL: u32 = u32::MAX;

struct Node {
    next: [u32; MAX_LEVEL],
    key_offset: usize,
    key_size: u32,
    value_size: u32,
    height: u8,
}

impl Node {
    fn new(height: u8) -> Self {
        Self {
            next: [NIL; MAX_LEVEL],
            key_offset: 0,
            key_size: 0,
            value_size: 0,
            height,
        }
    }

    fn value_offset(&self) -> usize {
        self.key_offset + self.key_size as usize
    }
}

pub struct SkipList {
    nodes: Vec<Node>,
    arena: ByteArena,
    rng: StdRng,
    level_limit: usize,
    kv_count: usize,
}

impl SkipList {
    pub fn new(kv_count_limit: usize, slice_size: usize, rng_seed: u64) -> Result<Self> {
        if kv_count_limit == 0 {
            return Err(Error::Config("skip list must have kv_count_limit > 0".to_string()));
        }
        let bit_width = (usize::BITS - kv_count_limit.leading_zeros()) as usize;
        let mut nodes = Vec::with_capacity(kv_count_limit + 1);
        nodes.push(Node::new(MAX_LEVEL as u8));
        Ok(Self {
            nodes,
            arena: ByteArena::new(slice_size)?,
            rng: StdRng::seed_from_u64(rng_seed),
            level_limit: MAX_LEVEL.min(bit_width + 3),
            kv_count: 0,
        })
    }

    /// Insert or update. An existing key is updated in place: an empty
    /// value only clears `value_size`, anything else appends fresh payload
    /// bytes and repoints the node.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut update = [0u32; MAX_LEVEL];
        let mut cur = 0u32;
        for level in (0..self.level_limit).rev() {
            loop {
                let next = self.nodes[cur as usize].next[level];
                if next == NIL {
                    break;
                }
                match self.compare_key(key, next) {
                    Ordering::Greater => cur = next,
                    Ordering::Less => break,
                    Ordering::Equal => {
                        if value.is_empty() {
                            self.nodes[next as usize].value_size = 0;
                        } else {
                            self.write_node(next, key, value)?;
                        }
                        return Ok(());
                    }
                }
            }
            update[level] = cur;
        }

        let new_index = self.nodes.len() as u32;
        let mut node = Node::new(self.random_height());
        let height = node.height as usize;
        for level in 0..height {
            node.next[level] = self.nodes[update[level] as usize].next[level];
        }
        self.nodes.push(node);
        for level in 0..height {
            self.nodes[update[level] as usize].next[level] = new_index;
        }
        self.write_node(new_index, key, value)?;
        self.kv_count += 1;
        Ok(())
    }

    /// Erase is an insert of the empty value: the key stays present as a
    /// tombstone so it can shadow older on-disk entries.
    pub fn erase(&mut self, key: &[u8]) -> Result<()> {
        self.insert(key, &[])
    }

    /// `None` if the key is absent, `Some(None)` if it is a tombstone, and
    /// `Some(Some(value))` otherwise.
    pub fn find(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        if self.kv_count == 0 {
            return None;
        }
        let mut cur = 0u32;
        for level in (0..self.level_limit).rev() {
            loop {
                let next = self.nodes[cur as usize].next[level];
                if next == NIL {
                    break;
                }
                match self.compare_key(key, next) {
                    Ordering::Greater => cur = next,
                    Ordering::Less => break,
                    Ordering::Equal => {
                        let node = &self.nodes[next as usize];
                        if node.value_size == 0 {
                            return Some(None);
                        }
                        let mut value = Vec::new();
                        self.arena
                            .copy_out(node.value_offset(), node.value_size as usize, &mut value);
                        return Some(Some(value));
                    }
                }
            }
        }
        None
    }

    /// Walk the level-0 chain over `range`, splitting entries into live
    /// values and tombstoned keys.
    pub fn find_range(&self, range: &KeyRange) -> RangeAccumulator {
        let mut acc = RangeAccumulator::default();
        let mut cur = self.first_in_range(range);
        while cur != NIL {
            let node = &self.nodes[cur as usize];
            let mut key = Vec::new();
            self.arena.copy_out(node.key_offset, node.key_size as usize, &mut key);
            if range.past_upper(&key) {
                break;
            }
            if node.value_size == 0 {
                acc.deleted.insert(key);
            } else {
                let mut value = Vec::new();
                self.arena
                    .copy_out(node.value_offset(), node.value_size as usize, &mut value);
                acc.accumulated.insert(key, value);
            }
            cur = node.next[0];
        }
        acc
    }

    pub fn clear(&mut self) {
        self.arena.clear();
        self.nodes.truncate(1);
        self.nodes[0].next = [NIL; MAX_LEVEL];
        self.kv_count = 0;
    }

    pub fn len(&self) -> usize {
        self.kv_count
    }

    pub fn is_empty(&self) -> bool {
        self.kv_count == 0
    }

    pub fn data_bytes(&self) -> usize {
        self.arena.total_bytes()
    }

    pub fn arena_slice_size(&self) -> usize {
        self.arena.slice_size()
    }

    /// Emit records in key order as `{key_size, value_size, key, value}`.
    /// Returns the record count and total bytes written, headers included.
    pub fn write_data_block<W: Write>(&self, w: &mut W, skip_deleted: bool) -> Result<(u64, u64)> {
        let mut kv_written = 0u64;
        let mut bytes_written = 0u64;
        let mut cur = self.nodes[0].next[0];
        while cur != NIL {
            let node = &self.nodes[cur as usize];
            if !(skip_deleted && node.value_size == 0) {
                w.write_u32::<LittleEndian>(node.key_size)?;
                w.write_u32::<LittleEndian>(node.value_size)?;
                self.arena.write_out(
                    w,
                    node.key_offset,
                    (node.key_size + node.value_size) as usize,
                )?;
                kv_written += 1;
                bytes_written += RECORD_HEADER_SIZE + (node.key_size + node.value_size) as u64;
            }
            cur = node.next[0];
        }
        Ok((kv_written, bytes_written))
    }

    /// Emit one data-region offset per record the data block emitted, in
    /// the same order and under the same `skip_deleted` policy.
    pub fn write_index_block<W: Write>(&self, w: &mut W, skip_deleted: bool) -> Result<()> {
        let mut offset = 0u64;
        let mut cur = self.nodes[0].next[0];
        while cur != NIL {
            let node = &self.nodes[cur as usize];
            if !(skip_deleted && node.value_size == 0) {
                w.write_u64::<LittleEndian>(offset)?;
                offset += RECORD_HEADER_SIZE + (node.key_size + node.value_size) as u64;
            }
            cur = node.next[0];
        }
        Ok(())
    }

    /// Compare a caller key against a stored node key: arena comparison
    /// over the common prefix, ties broken by length.
    fn compare_key(&self, key: &[u8], node_index: u32) -> Ordering {
        let node = &self.nodes[node_index as usize];
        let common = key.len().min(node.key_size as usize);
        match self.arena.compare(&key[..common], node.key_offset) {
            Ordering::Equal => key.len().cmp(&(node.key_size as usize)),
            ord => ord,
        }
    }

    /// First node inside the range's lower bound, strictly skipping an
    /// excluded exact match.
    fn first_in_range(&self, range: &KeyRange) -> u32 {
        let Some(lower) = range.lower.as_deref() else {
            return self.nodes[0].next[0];
        };
        let mut cur = 0u32;
        for level in (0..self.level_limit).rev() {
            loop {
                let next = self.nodes[cur as usize].next[level];
                if next != NIL && self.compare_key(lower, next) == Ordering::Greater {
                    cur = next;
                } else {
                    break;
                }
            }
        }
        let mut first = self.nodes[cur as usize].next[0];
        if !range.including_lower
            && first != NIL
            && self.compare_key(lower, first) == Ordering::Equal
        {
            first = self.nodes[first as usize].next[0];
        }
        first
    }

    fn write_node(&mut self, index: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let key_offset = self.arena.total_bytes();
        self.arena.append(key)?;
        self.arena.append(value)?;
        let node = &mut self.nodes[index as usize];
        node.key_offset = key_offset;
        node.key_size = key.len() as u32;
        node.value_size = value.len() as u32;
        Ok(())
    }

    /// Bernoulli(1/2) coin flips up to `level_limit - 1`, plus one.
    fn random_height(&mut self) -> u8 {
        let mut height = 1;
        while height < self.level_limit && self.rng.gen_bool(0.5) {
            height += 1;
        }
        height as u8
    }
}
