//! On-disk SSTable framing.
//!
//! An SSTable file holds four contiguous regions:
//!
//! ```text
//! +--------------------------+
//! | Data                     |  records: {key_size: u32, value_size: u32,
//! |                          |            key bytes, value bytes}
//! +--------------------------+
//! | Filter                   |  raw Bloom filter words (u64 each)
//! +--------------------------+
//! | Index                    |  one u64 data-region offset per record,
//! |                          |  key-ascending
//! +--------------------------+
//! | Footer (40 bytes)        |  locates the other regions
//! +--------------------------+
//! ```
//!
//! The data region starts at file offset zero, so index entries double as
//! absolute file offsets. Readers find the footer at `file_size - 40`.
//! All integers are little-endian.

pub mod reader;
pub mod readers;

pub use reader::{SSTableReader, TableIterator};
pub use readers::ReaderManager;

use crate::error::Result;

use byteorder::{ByteOrder, LittleEndian};

/// Bytes of the `{key_size, value_size}` pair leading every record.
pub const RECORD_HEADER_SIZE: u64 = 8;

pub const FOOTER_SIZE: usize = 40;

/// Fixed-size trailer of every SSTable file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Footer {
    /// Byte offset of the filter region; equal to the data region size.
    pub filter_offset: u64,
    pub filter_bits: u64,
    pub filter_hash_func_count: u64,
    pub index_offset: u64,
    pub kv_count: u64,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.filter_offset);
        LittleEndian::write_u64(&mut buf[8..16], self.filter_bits);
        LittleEndian::write_u64(&mut buf[16..24], self.filter_hash_func_count);
        LittleEndian::write_u64(&mut buf[24..32], self.index_offset);
        LittleEndian::write_u64(&mut buf[32..40], self.kv_count);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_SIZE {
            return crate::errdata!("sstable footer truncated: {} bytes", buf.len());
        }
        Ok(Self {
            filter_offset: LittleEndian::read_u64(&buf[0..8]),
            filter_bits: LittleEndian::read_u64(&buf[8..16]),
            filter_hash_func_count: LittleEndian::read_u64(&buf[16..24]),
            index_offset: LittleEndian::read_u64(&buf[24..32]),
            kv_count: LittleEndian::read_u64(&buf[32..40]),
        })
    }
}
