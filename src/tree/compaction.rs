//! Cascading merge compaction.
//!
//! A single compaction folds every file of levels `[0, target)` into one
//! new file at `target`. Sources are gathered newest level first, newest
//! file first within a level, so a lower source index always means fresher
//! data; a k-way merge over their iterators keeps exactly one record per
//! key, taken from the freshest source, and discards the duplicates from
//! all older ones. Tombstones are carried along unless the target level
//! was just created, since nothing deeper exists for them to shadow.
//!
//! The merged file's Bloom filter is sized from the summed source record
//! counts. Duplicates make that an upper bound and over-provision the
//! filter slightly, which is deliberate.

use super::TreeInner;
use crate::error::{Error, Result};
use crate::memtable::BloomFilter;
use crate::sstable::{Footer, RECORD_HEADER_SIZE};

use byteorder::{LittleEndian, WriteBytesExt};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};

/// Heap entry keyed on the current record of one source iterator. Ordered
/// for a min-heap: smallest key pops first, and among equal keys the
/// lowest (newest) source pops first.
struct MergeEntry {
    key: Vec<u8>,
    source: usize,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

impl TreeInner {
    /// Merge all files of levels `[0, target_level)` into a new file at
    /// `target_level`, then unlink the sources and zero their counts.
    pub(crate) fn compact_up_to(&mut self, target_level: usize) -> Result<()> {
        let (number, delete_tombstones) = self.allocate_file_at_level(target_level);
        let out_path = self.sstable_path(target_level, number);

        let mut readers = Vec::new();
        for level in 0..target_level {
            for file_number in (0..self.levels[level]).rev() {
                readers.push(
                    self.readers
                        .create_reader(&self.sstable_path(level, file_number))?,
                );
            }
        }
        debug_assert_eq!(
            readers.len() as u64,
            self.scaling_factor + (target_level as u64 - 1) * (self.scaling_factor - 1)
        );

        let total_kv_count: u64 = readers.iter().map(|reader| reader.kv_count()).sum();
        let (filter_bits, filter_hashes) =
            BloomFilter::optimal_params(total_kv_count, self.filter_fp_rate);
        let mut filter = BloomFilter::new(filter_bits, filter_hashes);

        let mut iters = readers
            .iter()
            .map(|reader| reader.iter())
            .collect::<Result<Vec<_>>>()?;
        let mut heap = BinaryHeap::new();
        for (source, iter) in iters.iter().enumerate() {
            if !iter.is_end() {
                heap.push(MergeEntry {
                    key: iter.key().to_vec(),
                    source,
                });
            }
        }

        let file = File::create(&out_path)
            .map_err(|e| Error::IO(format!("can't create sstable {}: {e}", out_path.display())))?;
        let mut writer = BufWriter::new(file);
        let mut index_offsets: Vec<u64> = Vec::new();
        let mut data_offset = 0u64;
        let mut kv_written = 0u64;
        let mut value_buf = Vec::new();

        while let Some(entry) = heap.pop() {
            // group every source currently positioned on the same key; the
            // first popped is the freshest and is the group's representative
            let mut consumed = vec![entry.source];
            while heap.peek().map_or(false, |top: &MergeEntry| top.key == entry.key) {
                if let Some(top) = heap.pop() {
                    consumed.push(top.source);
                }
            }

            let value_size = iters[entry.source].value_size();
            if !(delete_tombstones && value_size == 0) {
                iters[entry.source].read_value(&mut value_buf)?;
                writer.write_u32::<LittleEndian>(entry.key.len() as u32)?;
                writer.write_u32::<LittleEndian>(value_size)?;
                writer.write_all(&entry.key)?;
                writer.write_all(&value_buf)?;
                filter.insert(&entry.key);
                index_offsets.push(data_offset);
                data_offset += RECORD_HEADER_SIZE + entry.key.len() as u64 + value_size as u64;
                kv_written += 1;
            }

            for source in consumed {
                iters[source].advance()?;
                if !iters[source].is_end() {
                    heap.push(MergeEntry {
                        key: iters[source].key().to_vec(),
                        source,
                    });
                }
            }
        }

        if kv_written > 0 {
            filter.write_block(&mut writer)?;
            for offset in &index_offsets {
                writer.write_u64::<LittleEndian>(*offset)?;
            }
            let footer = Footer {
                filter_offset: data_offset,
                filter_bits: filter.bit_count(),
                filter_hash_func_count: filter.hash_count(),
                index_offset: data_offset + filter.size_in_bytes() as u64,
                kv_count: kv_written,
            };
            writer.write_all(&footer.encode())?;
            let file = writer.into_inner().map_err(|e| Error::IO(e.to_string()))?;
            file.sync_all()?;
            self.levels[target_level] += 1;
        } else {
            // every merged record was a discarded tombstone
            drop(writer);
            fs::remove_file(&out_path)?;
            if delete_tombstones {
                self.levels.pop();
            }
        }

        // the merge output is durable; retire the sources. All readers are
        // dropped first so no descriptor is closed mid-use.
        let source_count = readers.len();
        drop(iters);
        drop(readers);
        for level in 0..target_level {
            for file_number in 0..self.levels[level] {
                self.readers.unlink(&self.sstable_path(level, file_number))?;
            }
            self.levels[level] = 0;
        }

        tracing::info!(
            target_level,
            sources = source_count,
            records = kv_written,
            "compaction complete"
        );
        Ok(())
    }
}
