//! Memtable flush policy.
//!
//! A full memtable becomes the next level-0 SSTable. Tombstones are only
//! dropped when the flush creates the level: a just-created level is the
//! deepest, so no older source can still be shadowed by them. Filling
//! level 0 to the scaling factor triggers a cascading compaction.

use super::TreeInner;
use crate::error::{Error, Result};

use std::fs::{self, File};
use std::io::BufWriter;

impl TreeInner {
    /// Flush the memtable once it reaches its entry limit.
    pub(crate) fn maybe_flush(&mut self) -> Result<()> {
        if self.memtable.kv_count() < self.memtable_kv_limit {
            return Ok(());
        }
        self.flush_memtable()
    }

    fn flush_memtable(&mut self) -> Result<()> {
        let (number, delete_tombstones) = self.allocate_file_at_level(0);
        let path = self.sstable_path(0, number);

        let file = File::create(&path)
            .map_err(|e| Error::IO(format!("can't create sstable {}: {e}", path.display())))?;
        let mut writer = BufWriter::new(file);
        let kv_written = self.memtable.flush_to_sstable(&mut writer, delete_tombstones)?;
        let file = writer.into_inner().map_err(|e| Error::IO(e.to_string()))?;
        file.sync_all()?;
        drop(file);

        self.memtable.clear();

        if kv_written == 0 {
            // every entry was a dropped tombstone: leave no file behind and
            // give back the level this flush allocated
            fs::remove_file(&path)?;
            if delete_tombstones {
                self.levels.pop();
            }
            return Ok(());
        }

        self.levels[0] += 1;
        tracing::info!(number, records = kv_written, "flushed memtable to level 0");

        if self.levels[0] == self.scaling_factor {
            // promote into the shallowest level that can still take a file,
            // or open a new deepest level past them
            let mut target = 1;
            while target < self.levels.len() && self.levels[target] + 1 == self.scaling_factor {
                target += 1;
            }
            self.compact_up_to(target)?;
        }
        Ok(())
    }

    /// Number of the next file at `level`, allocating the level when it
    /// does not exist yet. The flag is true for a just-created level:
    /// flushing or merging into it may discard tombstones.
    pub(crate) fn allocate_file_at_level(&mut self, level: usize) -> (u64, bool) {
        if level == self.levels.len() {
            self.levels.push(0);
            (0, true)
        } else {
            (self.levels[level], false)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TreeConfig;
    use crate::range::KeyRange;
    use crate::tmpfs::TempDir;
    use crate::tree::LsmTree;

    fn test_config(dir: &TempDir) -> TreeConfig {
        TreeConfig::new(dir.path())
            .fd_cache_size(10)
            .scaling_factor(4)
            .memtable_kv_limit(100)
            .arena_slice_size(1000)
            .filter_fp_rate(0.1)
    }

    #[test]
    fn test_flush_triggers_at_limit() {
        let dir = TempDir::new().unwrap();
        let tree = LsmTree::create(test_config(&dir)).unwrap();

        for i in 0..101 {
            let key = format!("key_{i:03}");
            let value = format!("value_{i}");
            tree.insert(key.as_bytes(), value.as_bytes()).unwrap();
        }

        // the 100th insert produced a level-0 file, the 101st lives in the
        // memtable
        {
            let inner = tree.inner.lock().unwrap();
            assert_eq!(inner.levels, vec![1]);
            assert_eq!(inner.memtable.kv_count(), 1);
        }
        assert!(dir.path().join("0_0.sst").exists());

        for i in 0..101 {
            let key = format!("key_{i:03}");
            let expected = format!("value_{i}");
            assert_eq!(
                tree.find(key.as_bytes()).unwrap(),
                Some(expected.into_bytes()),
                "missing {key}"
            );
        }
    }

    #[test]
    fn test_each_flush_numbers_files_in_creation_order() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).memtable_kv_limit(2);
        let tree = LsmTree::create(config).unwrap();

        tree.insert(b"a", b"1").unwrap();
        tree.insert(b"b", b"2").unwrap();
        tree.insert(b"c", b"3").unwrap();
        tree.insert(b"d", b"4").unwrap();

        let inner = tree.inner.lock().unwrap();
        assert_eq!(inner.levels, vec![2]);
        drop(inner);
        assert!(dir.path().join("0_0.sst").exists());
        assert!(dir.path().join("0_1.sst").exists());
    }

    #[test]
    fn test_newer_file_shadows_older_within_level() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).memtable_kv_limit(2);
        let tree = LsmTree::create(config).unwrap();

        tree.insert(b"k", b"old").unwrap();
        tree.insert(b"x", b"1").unwrap(); // flush -> 0_0.sst
        tree.insert(b"k", b"new").unwrap();
        tree.insert(b"y", b"2").unwrap(); // flush -> 0_1.sst

        assert_eq!(tree.find(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_all_tombstone_first_flush_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).memtable_kv_limit(2);
        let tree = LsmTree::create(config).unwrap();

        // the first flush creates level 0, so these tombstones are
        // discarded and the flush writes no records at all
        tree.erase(b"ghost_a").unwrap();
        tree.erase(b"ghost_b").unwrap();

        let inner = tree.inner.lock().unwrap();
        assert!(inner.levels.is_empty());
        assert_eq!(inner.memtable.kv_count(), 0);
        drop(inner);
        assert!(!dir.path().join("0_0.sst").exists());

        assert_eq!(tree.find(b"ghost_a").unwrap(), None);
        assert_eq!(tree.find_range(&KeyRange::all()).unwrap().len(), 0);
    }

    #[test]
    fn test_tombstones_survive_flush_into_existing_level() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).memtable_kv_limit(2);
        let tree = LsmTree::create(config).unwrap();

        tree.insert(b"a", b"1").unwrap();
        tree.insert(b"b", b"2").unwrap(); // flush -> 0_0.sst
        tree.erase(b"a").unwrap();
        tree.erase(b"b").unwrap(); // flush -> 0_1.sst, tombstones kept

        let inner = tree.inner.lock().unwrap();
        assert_eq!(inner.levels, vec![2]);
        drop(inner);

        assert_eq!(tree.find(b"a").unwrap(), None);
        assert_eq!(tree.find(b"b").unwrap(), None);
    }
}
