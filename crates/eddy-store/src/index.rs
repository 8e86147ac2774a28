//! Persisted index format.
//!
//! Every data file has a sibling index file made of fixed 40-byte records,
//! all fields big-endian:
//!
//! | field               | type |
//! |---------------------|------|
//! | offset              | i64  |
//! | length              | i32  |
//! | uncompressed_length | i32  |
//! | crc                 | i64  |
//! | block_id            | i64  |
//! | task_attempt_id     | i64  |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use eddy_types::{BlockId, ShuffleBlock};
use tracing::warn;

/// Size of one encoded index record.
pub const INDEX_ENTRY_LEN: usize = 40;

/// Location and identity of one block inside a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub length: u32,
    pub uncompressed_length: u32,
    pub crc: u64,
    pub block_id: BlockId,
    pub task_attempt_id: u64,
}

impl IndexEntry {
    /// Entry for `block` written at `offset`.
    pub fn for_block(block: &ShuffleBlock, offset: u64) -> Self {
        Self {
            offset,
            length: block.length(),
            uncompressed_length: block.uncompressed_length,
            crc: block.crc,
            block_id: block.block_id,
            task_attempt_id: block.task_attempt_id,
        }
    }

    /// First byte past this block, `None` for a corrupt entry whose span
    /// overflows.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length as u64)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.offset as i64);
        buf.put_i32(self.length as i32);
        buf.put_i32(self.uncompressed_length as i32);
        buf.put_i64(self.crc as i64);
        buf.put_i64(self.block_id.as_u64() as i64);
        buf.put_i64(self.task_attempt_id as i64);
    }

    /// Decode one record. The caller guarantees `INDEX_ENTRY_LEN` bytes remain.
    pub fn decode(buf: &mut impl Buf) -> Self {
        Self {
            offset: buf.get_i64() as u64,
            length: buf.get_i32() as u32,
            uncompressed_length: buf.get_i32() as u32,
            crc: buf.get_i64() as u64,
            block_id: BlockId::new(buf.get_i64() as u64),
            task_attempt_id: buf.get_i64() as u64,
        }
    }
}

pub fn encode_entries(entries: &[IndexEntry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(entries.len() * INDEX_ENTRY_LEN);
    for entry in entries {
        entry.encode(&mut buf);
    }
    buf.freeze()
}

/// Decode a whole index file.
///
/// A trailing partial record (an interrupted append) is ignored.
pub fn decode_entries(mut data: &[u8]) -> Vec<IndexEntry> {
    let trailing = data.len() % INDEX_ENTRY_LEN;
    if trailing != 0 {
        warn!(
            len = data.len(),
            trailing, "index has a partial trailing record, ignoring it"
        );
    }

    let mut entries = Vec::with_capacity(data.len() / INDEX_ENTRY_LEN);
    while data.remaining() >= INDEX_ENTRY_LEN {
        entries.push(IndexEntry::decode(&mut data));
    }
    entries
}

/// Contents of an index file plus the length of its data file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexFile {
    pub entries: Vec<IndexEntry>,
    pub data_len: u64,
}
