//! LSM tree coordinator.
//!
//! The tree owns the memtable, the descriptor cache and the per-level file
//! counts, all behind one engine-wide mutex: every public operation holds
//! the lock for its full duration, so flushes, compactions and descriptor
//! eviction never race with reads.
//!
//! # Write path
//!
//! `insert`/`erase` land in the memtable. When it reaches its entry limit
//! it is flushed to a new level-0 SSTable; once level 0 holds
//! `scaling_factor` files, every file in levels `[0, target)` is folded
//! into a single new file at the target level (see `compaction`).
//!
//! # Read path
//!
//! The memtable answers first and authoritatively; a tombstone there
//! shadows everything on disk. Otherwise levels are scanned newest to
//! oldest, newest file first within each level, probing each file's Bloom
//! filter before paying for a binary search. Range lookups merge every
//! source into one accumulator, newest first, so the freshest version of
//! each key wins.

pub mod compaction;
pub mod flush;
pub mod metadata;

use crate::config::TreeConfig;
use crate::error::Result;
use crate::hasher;
use crate::memtable::{BloomFilter, Memtable};
use crate::range::KeyRange;
use crate::sstable::ReaderManager;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// Embedded LSM-tree key-value store.
///
/// All operations are serialized by an internal lock. Dropping the tree
/// persists the engine metadata so a later [`LsmTree::open`] at the same
/// directory restores it; use [`LsmTree::close`] to observe persistence
/// errors instead of having them logged.
pub struct LsmTree {
    inner: Mutex<TreeInner>,
}

pub(crate) struct TreeInner {
    pub(crate) dir: PathBuf,
    pub(crate) scaling_factor: u64,
    pub(crate) memtable_kv_limit: usize,
    pub(crate) filter_fp_rate: f64,
    pub(crate) memtable: Memtable,
    pub(crate) readers: ReaderManager,
    /// File count per level; index 0 is the newest level.
    pub(crate) levels: Vec<u64>,
    saved: bool,
}

impl LsmTree {
    /// Create a fresh tree in the configured directory.
    pub fn create(config: TreeConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        let (filter_bits, filter_hashes) =
            BloomFilter::optimal_params(config.memtable_kv_limit as u64, config.filter_fp_rate);
        let memtable = Memtable::new(
            filter_bits,
            filter_hashes,
            config.memtable_kv_limit,
            config.arena_slice_size,
        )?;

        Ok(Self {
            inner: Mutex::new(TreeInner {
                dir: config.dir,
                scaling_factor: config.scaling_factor,
                memtable_kv_limit: config.memtable_kv_limit,
                filter_fp_rate: config.filter_fp_rate,
                memtable,
                readers: ReaderManager::new(config.fd_cache_size),
                levels: Vec::new(),
                saved: false,
            }),
        })
    }

    /// Reopen a tree persisted at the given directory, restoring its
    /// parameters, level layout and memtable from the metadata file.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(metadata::load(dir.into())?),
        })
    }

    /// Insert or update a key. Empty values are reserved as tombstones and
    /// rejected; use [`LsmTree::erase`] to delete.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return crate::errinput!("keys must not be empty");
        }
        if value.is_empty() {
            return crate::errinput!("empty values are reserved as tombstones, use erase");
        }
        let mut inner = self.inner.lock()?;
        inner.memtable.insert(key, value)?;
        inner.maybe_flush()
    }

    /// Delete a key by writing a tombstone over it.
    pub fn erase(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return crate::errinput!("keys must not be empty");
        }
        let mut inner = self.inner.lock()?;
        inner.memtable.erase(key)?;
        inner.maybe_flush()
    }

    /// Point lookup. Returns `None` for keys never written or masked by a
    /// tombstone in any source newer than their last value.
    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock()?;

        if let Some(entry) = inner.memtable.find(key) {
            return Ok(entry);
        }

        let (hash_low, hash_high) = hasher::hash128(key);
        let mut key_buf = Vec::new();
        for level in 0..inner.levels.len() {
            for number in (0..inner.levels[level]).rev() {
                let reader = inner.readers.create_reader(&inner.sstable_path(level, number))?;
                if !reader.probe(hash_low, hash_high)? {
                    continue;
                }
                if let Some(value) = reader.find(key, &mut key_buf)? {
                    // an empty on-disk value is a tombstone
                    return Ok(if value.is_empty() { None } else { Some(value) });
                }
            }
        }
        Ok(None)
    }

    /// Range lookup over every source, newest first. Returns the live
    /// entries inside the range, ordered by key.
    pub fn find_range(&self, range: &KeyRange) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let inner = self.inner.lock()?;

        let mut acc = inner.memtable.find_range(range);
        let mut key_buf = Vec::new();
        for level in 0..inner.levels.len() {
            for number in (0..inner.levels[level]).rev() {
                let reader = inner.readers.create_reader(&inner.sstable_path(level, number))?;
                reader.find_range(range, &mut acc, &mut key_buf)?;
            }
        }
        Ok(acc.accumulated)
    }

    /// Persist the engine metadata and consume the tree.
    pub fn close(self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        metadata::save(&inner)?;
        inner.saved = true;
        Ok(())
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.saved {
            return;
        }
        if let Err(err) = metadata::save(&inner) {
            tracing::error!(error = %err, "failed to persist engine metadata");
        }
        inner.saved = true;
    }
}

impl TreeInner {
    pub(crate) fn sstable_path(&self, level: usize, number: u64) -> PathBuf {
        self.dir.join(format!("{level}_{number}.sst"))
    }
}
