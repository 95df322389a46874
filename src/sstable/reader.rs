//! Read-only view of one on-disk SSTable.
//!
//! A reader borrows its descriptor from the [`ReaderManager`]'s cache and
//! returns the reference on drop. Every access is a positioned read; the
//! descriptor may be shared with any number of sibling readers.
//!
//! Point lookups binary-search the index region; range scans position by
//! binary search and then walk records sequentially; compaction consumes
//! the whole file through [`TableIterator`].

use super::readers::{self, Shared};
use super::{Footer, FOOTER_SIZE, RECORD_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::hasher;
use crate::range::{KeyRange, RangeAccumulator};

use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub struct SSTableReader {
    file: Arc<File>,
    footer: Footer,
    path: PathBuf,
    shared: Arc<Mutex<Shared>>,
}

impl SSTableReader {
    /// Construct over an already-opened descriptor, reading the footer
    /// from the file tail. Called by the manager only.
    pub(crate) fn open(
        file: Arc<File>,
        path: PathBuf,
        shared: Arc<Mutex<Shared>>,
    ) -> Result<Self> {
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::InvalidData(format!(
                "sstable {} too small for a footer: {file_size} bytes",
                path.display()
            )));
        }
        let mut buf = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut buf, file_size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode(&buf)?;
        Ok(Self {
            file,
            footer,
            path,
            shared,
        })
    }

    pub fn kv_count(&self) -> u64 {
        self.footer.kv_count
    }

    /// Test the i-th filter bit by reading the containing word.
    pub fn bloom_bit(&self, i: u64) -> Result<bool> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact_at(&mut buf, self.footer.filter_offset + (i / 64) * 8)?;
        let word = LittleEndian::read_u64(&buf);
        Ok(word & (1u64 << (i & 63)) != 0)
    }

    /// Bloom probe from the two base hashes; false on the first clear bit.
    pub fn probe(&self, hash_low: u64, hash_high: u64) -> Result<bool> {
        if self.footer.filter_bits == 0 {
            return Ok(false);
        }
        for i in 0..self.footer.filter_hash_func_count {
            let bit = hasher::ith_hash(hash_low, hash_high, i, self.footer.filter_bits);
            if !self.bloom_bit(bit)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Binary search for the key. `key_buf` is scratch space reused across
    /// calls to avoid per-probe allocations. An empty returned value is a
    /// tombstone and must be interpreted by the caller as "deleted here".
    pub fn find(&self, key: &[u8], key_buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
        let mut l = 0u64;
        let mut r = self.footer.kv_count + 1;
        while l + 1 != r {
            let m = (l + r) >> 1;
            let record_offset = self.index_entry(m - 1)?;
            let (value_offset, value_size) = self.read_key(record_offset, key_buf)?;
            match key.cmp(key_buf.as_slice()) {
                Ordering::Less => r = m,
                Ordering::Greater => l = m,
                Ordering::Equal => {
                    let mut value = vec![0; value_size as usize];
                    self.file.read_exact_at(&mut value, value_offset)?;
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    /// Merge this file's slice of `range` into the accumulator. Keys the
    /// accumulator has already resolved (accumulated or deleted by a newer
    /// source) are skipped, so callers must visit sources newest first.
    pub fn find_range(
        &self,
        range: &KeyRange,
        acc: &mut RangeAccumulator,
        key_buf: &mut Vec<u8>,
    ) -> Result<()> {
        let mut l = 0u64;
        if let Some(lower) = range.lower.as_deref() {
            let mut r = self.footer.kv_count + 1;
            while l + 1 < r {
                let m = (l + r) >> 1;
                let record_offset = self.index_entry(m - 1)?;
                self.read_key(record_offset, key_buf)?;
                match lower.cmp(key_buf.as_slice()) {
                    Ordering::Less => r = m,
                    Ordering::Greater => l = m,
                    Ordering::Equal => {
                        // an excluded exact match is strictly skipped
                        l = if range.including_lower { m - 1 } else { m };
                        break;
                    }
                }
            }
        }

        for i in l..self.footer.kv_count {
            let record_offset = self.index_entry(i)?;
            let (value_offset, value_size) = self.read_key(record_offset, key_buf)?;
            if range.past_upper(key_buf) {
                break;
            }
            if acc.seen(key_buf) {
                continue;
            }
            if value_size == 0 {
                acc.deleted.insert(key_buf.clone());
            } else {
                let mut value = vec![0; value_size as usize];
                self.file.read_exact_at(&mut value, value_offset)?;
                acc.accumulated.insert(key_buf.clone(), value);
            }
        }
        Ok(())
    }

    /// Forward iterator over all records, for compaction.
    pub fn iter(&self) -> Result<TableIterator<'_>> {
        TableIterator::new(self)
    }

    /// Offset of the i-th record within the data region.
    fn index_entry(&self, i: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact_at(&mut buf, self.footer.index_offset + i * 8)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    /// Read the record header at `record_offset` and its key into
    /// `key_buf`; returns the value's offset and size.
    fn read_key(&self, record_offset: u64, key_buf: &mut Vec<u8>) -> Result<(u64, u32)> {
        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        self.file.read_exact_at(&mut header, record_offset)?;
        let key_size = LittleEndian::read_u32(&header[0..4]);
        let value_size = LittleEndian::read_u32(&header[4..8]);

        key_buf.resize(key_size as usize, 0);
        self.file
            .read_exact_at(key_buf, record_offset + RECORD_HEADER_SIZE)?;
        Ok((
            record_offset + RECORD_HEADER_SIZE + key_size as u64,
            value_size,
        ))
    }
}

impl Drop for SSTableReader {
    fn drop(&mut self) {
        readers::release(&self.shared, &self.path);
    }
}

/// Streaming forward iterator over a reader's records.
///
/// The current key is held in an internal buffer; the value is only read
/// when asked for, since compaction discards shadowed duplicates unseen.
pub struct TableIterator<'a> {
    reader: &'a SSTableReader,
    key: Vec<u8>,
    value_offset: u64,
    value_size: u32,
    exhausted: bool,
}

impl<'a> TableIterator<'a> {
    fn new(reader: &'a SSTableReader) -> Result<Self> {
        let mut iter = Self {
            reader,
            key: Vec::new(),
            value_offset: 0,
            value_size: 0,
            exhausted: reader.footer.filter_offset == 0,
        };
        if !iter.exhausted {
            iter.load(0)?;
        }
        Ok(iter)
    }

    pub fn is_end(&self) -> bool {
        self.exhausted
    }

    /// The current key. Only valid while `!is_end()`.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    /// Read the current value into the caller's buffer.
    pub fn read_value(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.resize(self.value_size as usize, 0);
        self.reader.file.read_exact_at(buf, self.value_offset)?;
        Ok(())
    }

    /// Step to the next record; the iterator is exhausted once the current
    /// value ends where the data region does.
    pub fn advance(&mut self) -> Result<()> {
        let next_offset = self.value_offset + self.value_size as u64;
        if next_offset >= self.reader.footer.filter_offset {
            self.exhausted = true;
            return Ok(());
        }
        self.load(next_offset)
    }

    fn load(&mut self, record_offset: u64) -> Result<()> {
        let (value_offset, value_size) = self.reader.read_key(record_offset, &mut self.key)?;
        self.value_offset = value_offset;
        self.value_size = value_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::{BloomFilter, Memtable};
    use crate::sstable::ReaderManager;
    use crate::tmpfs::TempDir;

    fn build_sstable(
        dir: &TempDir,
        name: &str,
        entries: &[(&[u8], &[u8])],
        skip_tombstones: bool,
    ) -> PathBuf {
        let (bits, hashes) = BloomFilter::optimal_params(entries.len() as u64, 0.01);
        let mut table = Memtable::new(bits, hashes, entries.len().max(1), 1000).unwrap();
        for (key, value) in entries {
            table.insert(key, value).unwrap();
        }
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        let written = table.flush_to_sstable(&mut file, skip_tombstones).unwrap();
        assert!(written > 0);
        file.sync_all().unwrap();
        path
    }

    #[test]
    fn test_find_roundtrip() {
        let dir = TempDir::new().unwrap();
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
            .map(|i| {
                (
                    format!("key_{i:03}").into_bytes(),
                    format!("value_{i:03}").into_bytes(),
                )
            })
            .collect();
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let path = build_sstable(&dir, "0_0.sst", &borrowed, false);

        let manager = ReaderManager::new(4);
        let reader = manager.create_reader(&path).unwrap();
        assert_eq!(reader.kv_count(), 100);

        let mut key_buf = Vec::new();
        for (key, value) in &entries {
            let found = reader.find(key, &mut key_buf).unwrap();
            assert_eq!(found.as_deref(), Some(value.as_slice()));
        }
        assert_eq!(reader.find(b"key_100", &mut key_buf).unwrap(), None);
        assert_eq!(reader.find(b"aaa", &mut key_buf).unwrap(), None);
        assert_eq!(reader.find(b"zzz", &mut key_buf).unwrap(), None);
    }

    #[test]
    fn test_find_preserves_tombstones() {
        let dir = TempDir::new().unwrap();
        let (bits, hashes) = BloomFilter::optimal_params(2, 0.01);
        let mut table = Memtable::new(bits, hashes, 2, 1000).unwrap();
        table.insert(b"live", b"value").unwrap();
        table.erase(b"dead").unwrap();
        let path = dir.path().join("0_0.sst");
        let mut file = File::create(&path).unwrap();
        table.flush_to_sstable(&mut file, false).unwrap();
        file.sync_all().unwrap();

        let manager = ReaderManager::new(4);
        let reader = manager.create_reader(&path).unwrap();
        let mut key_buf = Vec::new();
        // the tombstone is a present record with an empty value
        assert_eq!(reader.find(b"dead", &mut key_buf).unwrap(), Some(vec![]));
        assert_eq!(
            reader.find(b"live", &mut key_buf).unwrap(),
            Some(b"value".to_vec())
        );
    }

    #[test]
    fn test_probe_finds_all_written_keys() {
        let dir = TempDir::new().unwrap();
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..50)
            .map(|i| (format!("k{i:02}").into_bytes(), vec![b'v'; 3]))
            .collect();
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let path = build_sstable(&dir, "0_0.sst", &borrowed, false);

        let manager = ReaderManager::new(4);
        let reader = manager.create_reader(&path).unwrap();
        for (key, _) in &entries {
            let (low, high) = hasher::hash128(key);
            assert!(reader.probe(low, high).unwrap());
        }
    }

    #[test]
    fn test_find_range_respects_bounds_and_accumulator() {
        let dir = TempDir::new().unwrap();
        let path = build_sstable(
            &dir,
            "0_0.sst",
            &[
                (b"a", b"1"),
                (b"b", b"2"),
                (b"c", b"3"),
                (b"d", b"4"),
                (b"e", b"5"),
            ],
            false,
        );

        let manager = ReaderManager::new(4);
        let reader = manager.create_reader(&path).unwrap();
        let mut key_buf = Vec::new();

        let mut acc = RangeAccumulator::default();
        let range = KeyRange::new(Some(b"b".to_vec()), Some(b"d".to_vec()), true, true);
        reader.find_range(&range, &mut acc, &mut key_buf).unwrap();
        assert_eq!(
            acc.accumulated.keys().cloned().collect::<Vec<_>>(),
            vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );

        // exclusive bounds drop the exact matches
        let mut acc = RangeAccumulator::default();
        let range = KeyRange::new(Some(b"b".to_vec()), Some(b"d".to_vec()), false, false);
        reader.find_range(&range, &mut acc, &mut key_buf).unwrap();
        assert_eq!(
            acc.accumulated.keys().cloned().collect::<Vec<_>>(),
            vec![b"c".to_vec()]
        );

        // keys already resolved by a newer source are not overwritten
        let mut acc = RangeAccumulator::default();
        acc.accumulated.insert(b"c".to_vec(), b"newer".to_vec());
        acc.deleted.insert(b"d".to_vec());
        reader
            .find_range(&KeyRange::all(), &mut acc, &mut key_buf)
            .unwrap();
        assert_eq!(acc.accumulated[&b"c".to_vec()], b"newer".to_vec());
        assert!(!acc.accumulated.contains_key(&b"d".to_vec()));
        assert_eq!(acc.accumulated.len(), 4);
    }

    #[test]
    fn test_find_range_tombstones_mask_older_sources() {
        let dir = TempDir::new().unwrap();
        let (bits, hashes) = BloomFilter::optimal_params(2, 0.01);
        let mut table = Memtable::new(bits, hashes, 2, 1000).unwrap();
        table.insert(b"keep", b"1").unwrap();
        table.erase(b"gone").unwrap();
        let path = dir.path().join("1_0.sst");
        let mut file = File::create(&path).unwrap();
        table.flush_to_sstable(&mut file, false).unwrap();
        file.sync_all().unwrap();

        let manager = ReaderManager::new(4);
        let reader = manager.create_reader(&path).unwrap();
        let mut acc = RangeAccumulator::default();
        let mut key_buf = Vec::new();
        reader
            .find_range(&KeyRange::all(), &mut acc, &mut key_buf)
            .unwrap();
        assert_eq!(acc.accumulated.len(), 1);
        assert!(acc.deleted.contains(&b"gone".to_vec()));
    }

    #[test]
    fn test_iterator_walks_every_record() {
        let dir = TempDir::new().unwrap();
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..20)
            .map(|i| {
                (
                    format!("key_{i:02}").into_bytes(),
                    format!("val_{i}").into_bytes(),
                )
            })
            .collect();
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let path = build_sstable(&dir, "0_0.sst", &borrowed, false);

        let manager = ReaderManager::new(4);
        let reader = manager.create_reader(&path).unwrap();
        let mut iter = reader.iter().unwrap();

        let mut seen = Vec::new();
        let mut value = Vec::new();
        while !iter.is_end() {
            iter.read_value(&mut value).unwrap();
            assert_eq!(value.len(), iter.value_size() as usize);
            seen.push((iter.key().to_vec(), value.clone()));
            iter.advance().unwrap();
        }
        assert_eq!(seen, entries);
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0_0.sst");
        std::fs::write(&path, b"short").unwrap();

        let manager = ReaderManager::new(4);
        assert!(matches!(
            manager.create_reader(&path),
            Err(Error::InvalidData(_))
        ));
        // the failed open left no dangling refcount
        assert_eq!(manager.refcount(&path), Some(0));
    }
}
