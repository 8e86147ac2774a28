//! Error types for shuffle storage operations.

use eddy_types::BlockId;

/// Errors that can occur while writing or reading a storage tier.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested file does not exist in this tier.
    #[error("shuffle file not found: {0}")]
    NotFound(String),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The tier has reached its capacity limit.
    #[error("tier capacity exceeded: need {needed} bytes, only {available} available")]
    CapacityExceeded {
        /// Bytes needed for the operation.
        needed: u64,
        /// Bytes currently available.
        available: u64,
    },

    /// Block bytes do not match the checksum recorded in the index.
    #[error("block {block_id} is corrupt: expected crc {expected:#x}, actual {actual:#x}")]
    Corrupt {
        block_id: BlockId,
        expected: u64,
        actual: u64,
    },

    /// A read asked for bytes past the end of a data file.
    #[error("read of {length} bytes at {offset} from {file} exceeds data length {available}")]
    OutOfRange {
        file: String,
        offset: u64,
        length: u64,
        available: u64,
    },

    /// The remote object store failed.
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}
