//! Engine metadata persistence.
//!
//! Closing the tree writes a single metadata file: a fixed parameter
//! header, the per-level file counts, and every current memtable record
//! (tombstones included) in the plain `{key_size, value_size, key, value}`
//! framing. The file is written to a temporary name, fsynced and renamed
//! over the previous one. Reopening reads it back, replays the records
//! into a fresh memtable and rediscovers the SSTables implicitly from the
//! level counts and the `<level>_<number>.sst` naming scheme.

use super::TreeInner;
use crate::error::{Error, Result};
use crate::memtable::Memtable;
use crate::sstable::ReaderManager;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

pub(crate) const METADATA_FILE: &str = "tree.meta";
const TMP_METADATA_FILE: &str = "tree.meta.tmp";

pub(crate) const HEADER_SIZE: usize = 72;

/// Fixed parameter block at the head of the metadata file.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct MetadataHeader {
    pub scaling_factor: u64,
    pub memtable_kv_limit: u64,
    pub memtable_kv_count: u64,
    pub filter_fp_rate: f64,
    pub filter_bits: u64,
    pub filter_hash_func_count: u64,
    pub arena_slice_size: u64,
    pub fd_cache_size: u64,
    pub level_count: u64,
}

impl MetadataHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.scaling_factor);
        LittleEndian::write_u64(&mut buf[8..16], self.memtable_kv_limit);
        LittleEndian::write_u64(&mut buf[16..24], self.memtable_kv_count);
        LittleEndian::write_f64(&mut buf[24..32], self.filter_fp_rate);
        LittleEndian::write_u64(&mut buf[32..40], self.filter_bits);
        LittleEndian::write_u64(&mut buf[40..48], self.filter_hash_func_count);
        LittleEndian::write_u64(&mut buf[48..56], self.arena_slice_size);
        LittleEndian::write_u64(&mut buf[56..64], self.fd_cache_size);
        LittleEndian::write_u64(&mut buf[64..72], self.level_count);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let header = Self {
            scaling_factor: LittleEndian::read_u64(&buf[0..8]),
            memtable_kv_limit: LittleEndian::read_u64(&buf[8..16]),
            memtable_kv_count: LittleEndian::read_u64(&buf[16..24]),
            filter_fp_rate: LittleEndian::read_f64(&buf[24..32]),
            filter_bits: LittleEndian::read_u64(&buf[32..40]),
            filter_hash_func_count: LittleEndian::read_u64(&buf[40..48]),
            arena_slice_size: LittleEndian::read_u64(&buf[48..56]),
            fd_cache_size: LittleEndian::read_u64(&buf[56..64]),
            level_count: LittleEndian::read_u64(&buf[64..72]),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.memtable_kv_limit == 0 {
            return crate::errdata!("metadata header has a zero memtable_kv_limit");
        }
        if self.arena_slice_size == 0 {
            return crate::errdata!("metadata header has a zero arena_slice_size");
        }
        if !(self.filter_fp_rate > 0.0 && self.filter_fp_rate < 1.0) {
            return crate::errdata!(
                "metadata header has an out-of-range false-positive rate: {}",
                self.filter_fp_rate
            );
        }
        Ok(())
    }
}

/// Persist the engine state, atomically replacing the metadata file.
pub(crate) fn save(inner: &TreeInner) -> Result<()> {
    let tmp_path = inner.dir.join(TMP_METADATA_FILE);
    let file = File::create(&tmp_path)
        .map_err(|e| Error::IO(format!("can't create metadata {}: {e}", tmp_path.display())))?;
    let mut writer = BufWriter::new(file);

    let header = MetadataHeader {
        scaling_factor: inner.scaling_factor,
        memtable_kv_limit: inner.memtable_kv_limit as u64,
        memtable_kv_count: inner.memtable.kv_count() as u64,
        filter_fp_rate: inner.filter_fp_rate,
        filter_bits: inner.memtable.filter_bits(),
        filter_hash_func_count: inner.memtable.filter_hashes(),
        arena_slice_size: inner.memtable.arena_slice_size() as u64,
        fd_cache_size: inner.readers.cache_size() as u64,
        level_count: inner.levels.len() as u64,
    };
    writer.write_all(&header.encode())?;
    for count in &inner.levels {
        writer.write_u64::<LittleEndian>(*count)?;
    }
    inner.memtable.dump_kvs(&mut writer)?;

    let file = writer.into_inner().map_err(|e| Error::IO(e.to_string()))?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, inner.dir.join(METADATA_FILE))?;
    Ok(())
}

/// Restore the engine state persisted by [`save`].
pub(crate) fn load(dir: PathBuf) -> Result<TreeInner> {
    let path = dir.join(METADATA_FILE);
    let file = File::open(&path)
        .map_err(|e| Error::IO(format!("can't open metadata {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    let mut buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut buf)?;
    let header = MetadataHeader::decode(&buf)?;

    let mut levels = Vec::with_capacity(header.level_count as usize);
    for _ in 0..header.level_count {
        levels.push(reader.read_u64::<LittleEndian>()?);
    }

    let mut memtable = Memtable::new(
        header.filter_bits,
        header.filter_hash_func_count,
        header.memtable_kv_limit as usize,
        header.arena_slice_size as usize,
    )?;
    let mut key = Vec::new();
    let mut value = Vec::new();
    for _ in 0..header.memtable_kv_count {
        let key_size = reader.read_u32::<LittleEndian>()? as usize;
        let value_size = reader.read_u32::<LittleEndian>()? as usize;
        key.resize(key_size, 0);
        reader.read_exact(&mut key)?;
        value.resize(value_size, 0);
        reader.read_exact(&mut value)?;
        // an empty value re-enters as the tombstone it was
        memtable.insert(&key, &value)?;
    }

    tracing::info!(
        levels = header.level_count,
        entries = header.memtable_kv_count,
        "restored engine metadata"
    );

    Ok(TreeInner {
        dir,
        scaling_factor: header.scaling_factor,
        memtable_kv_limit: header.memtable_kv_limit as usize,
        filter_fp_rate: header.filter_fp_rate,
        memtable,
        readers: ReaderManager::new(header.fd_cache_size as usize),
        levels,
        saved: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeConfig;
    use crate::range::KeyRange;
    use crate::tmpfs::TempDir;
    use crate::tree::LsmTree;

    fn header() -> MetadataHeader {
        MetadataHeader {
            scaling_factor: 4,
            memtable_kv_limit: 100,
            memtable_kv_count: 42,
            filter_fp_rate: 0.1,
            filter_bits: 480,
            filter_hash_func_count: 3,
            arena_slice_size: 1000,
            fd_cache_size: 10,
            level_count: 3,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = header();
        let decoded = MetadataHeader::decode(&header.encode()).expect("failed to decode header");
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_zero_kv_limit() {
        let mut bad = header();
        bad.memtable_kv_limit = 0;
        assert!(matches!(
            MetadataHeader::decode(&bad.encode()),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_header_rejects_bad_fp_rate() {
        let mut bad = header();
        bad.filter_fp_rate = 1.5;
        assert!(matches!(
            MetadataHeader::decode(&bad.encode()),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_missing_metadata_is_fatal_on_open() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(LsmTree::open(dir.path()), Err(Error::IO(_))));
    }

    #[test]
    fn test_reopen_restores_parameters_and_memtable() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig::new(dir.path())
            .fd_cache_size(10)
            .scaling_factor(5)
            .memtable_kv_limit(100)
            .arena_slice_size(1000)
            .filter_fp_rate(0.1);
        let tree = LsmTree::create(config).unwrap();

        tree.insert(b"aa", b"1").unwrap();
        tree.insert(b"bb", b"2").unwrap();
        tree.erase(b"cc").unwrap();
        tree.close().unwrap();

        let tree = LsmTree::open(dir.path()).unwrap();
        {
            let inner = tree.inner.lock().unwrap();
            assert_eq!(inner.scaling_factor, 5);
            assert_eq!(inner.memtable_kv_limit, 100);
            assert_eq!(inner.filter_fp_rate, 0.1);
            assert_eq!(inner.readers.cache_size(), 10);
            assert_eq!(inner.memtable.arena_slice_size(), 1000);
            assert_eq!(inner.memtable.kv_count(), 3);
            assert!(inner.levels.is_empty());
        }
        assert_eq!(tree.find(b"aa").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.find(b"bb").unwrap(), Some(b"2".to_vec()));
        // the tombstone survived the round trip
        assert_eq!(tree.find(b"cc").unwrap(), None);
    }

    #[test]
    fn test_reopen_restores_levels_and_disk_data() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig::new(dir.path())
            .fd_cache_size(10)
            .scaling_factor(4)
            .memtable_kv_limit(10)
            .arena_slice_size(1000)
            .filter_fp_rate(0.1);
        let tree = LsmTree::create(config).unwrap();

        // 45 keys: four flushes (one cascade into level 1) plus five
        // entries left in the memtable
        for i in 0..45 {
            let key = format!("key_{i:02}");
            let value = format!("value_{i}");
            tree.insert(key.as_bytes(), value.as_bytes()).unwrap();
        }
        let levels_before = {
            let inner = tree.inner.lock().unwrap();
            inner.levels.clone()
        };
        drop(tree);

        let tree = LsmTree::open(dir.path()).unwrap();
        {
            let inner = tree.inner.lock().unwrap();
            assert_eq!(inner.levels, levels_before);
        }
        for i in 0..45 {
            let key = format!("key_{i:02}");
            let expected = format!("value_{i}");
            assert_eq!(
                tree.find(key.as_bytes()).unwrap(),
                Some(expected.into_bytes()),
                "missing {key}"
            );
        }
        assert_eq!(tree.find_range(&KeyRange::all()).unwrap().len(), 45);
    }

    #[test]
    fn test_save_replaces_previous_metadata() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig::new(dir.path()).memtable_kv_limit(100);
        let tree = LsmTree::create(config).unwrap();
        tree.insert(b"first", b"1").unwrap();
        tree.close().unwrap();

        let tree = LsmTree::open(dir.path()).unwrap();
        tree.insert(b"second", b"2").unwrap();
        tree.close().unwrap();

        let tree = LsmTree::open(dir.path()).unwrap();
        assert_eq!(tree.find(b"first").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.find(b"second").unwrap(), Some(b"2".to_vec()));
        assert!(!dir.path().join(TMP_METADATA_FILE).exists());
    }
}
