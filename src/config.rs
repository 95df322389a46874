use crate::error::{Error, Result};

use std::path::PathBuf;

/// Configuration for a fresh LSM tree. Reopened trees restore their
/// parameters from the engine metadata file instead.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Directory holding the SSTable files and the engine metadata file.
    pub dir: PathBuf,

    /// Maximum number of cached file descriptors kept open after their
    /// readers are released (default: 32).
    pub fd_cache_size: usize,

    /// Per-level scaling factor: a level is merged upward once it holds
    /// this many files (default: 4).
    pub scaling_factor: u64,

    /// Maximum number of entries in the memtable before it is flushed to a
    /// level-0 SSTable (default: 4096).
    pub memtable_kv_limit: usize,

    /// Size of each memtable arena slice in bytes (default: 64KiB).
    pub arena_slice_size: usize,

    /// Target Bloom filter false-positive rate (default: 1%).
    pub filter_fp_rate: f64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./siltdb"),
            fd_cache_size: 32,
            scaling_factor: 4,
            memtable_kv_limit: 4096,
            arena_slice_size: 64 * 1024,
            filter_fp_rate: 0.01,
        }
    }
}

impl TreeConfig {
    /// Create a new config with the given data directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the descriptor cache bound
    pub fn fd_cache_size(mut self, size: usize) -> Self {
        self.fd_cache_size = size;
        self
    }

    /// Set the per-level scaling factor
    pub fn scaling_factor(mut self, factor: u64) -> Self {
        self.scaling_factor = factor;
        self
    }

    /// Set the memtable entry limit
    pub fn memtable_kv_limit(mut self, limit: usize) -> Self {
        self.memtable_kv_limit = limit;
        self
    }

    /// Set the arena slice size
    pub fn arena_slice_size(mut self, size: usize) -> Self {
        self.arena_slice_size = size;
        self
    }

    /// Set the Bloom filter false-positive rate
    pub fn filter_fp_rate(mut self, rate: f64) -> Self {
        self.filter_fp_rate = rate;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.memtable_kv_limit == 0 {
            return Err(Error::Config("memtable_kv_limit must be nonzero".to_string()));
        }
        if self.arena_slice_size == 0 {
            return Err(Error::Config("arena_slice_size must be nonzero".to_string()));
        }
        if self.scaling_factor < 2 {
            return Err(Error::Config("scaling_factor must be at least 2".to_string()));
        }
        if !(self.filter_fp_rate > 0.0 && self.filter_fp_rate < 1.0) {
            return Err(Error::Config(
                "filter_fp_rate must be strictly between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }
}
