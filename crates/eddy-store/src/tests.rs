//! Shared fixtures for unit tests.

use bytes::Bytes;
use eddy_types::{BlockId, ShuffleBlock};

/// A block of shuffle 0, partition 0 with a correct checksum.
pub(crate) fn block(id: u64, data: &[u8]) -> ShuffleBlock {
    ShuffleBlock {
        shuffle_id: 0,
        partition_id: 0,
        block_id: BlockId::new(id),
        task_attempt_id: 1,
        data: Bytes::copy_from_slice(data),
        uncompressed_length: data.len() as u32,
        crc: ShuffleBlock::checksum(data),
        record_count: 1,
        replicas: Vec::new(),
    }
}
