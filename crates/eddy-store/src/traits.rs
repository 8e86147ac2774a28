//! Core trait and types for shuffle storage tiers.

use std::fmt;

use bytes::Bytes;
use eddy_types::{PartitionRange, ShuffleBlock, StorageTierKind};

use crate::error::StoreError;
use crate::index::{IndexEntry, IndexFile};

/// Capacity information for a storage tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCapacity {
    /// Total capacity in bytes.
    pub total_bytes: u64,
    /// Bytes currently used.
    pub used_bytes: u64,
    /// Bytes available for new data.
    pub available_bytes: u64,
}

/// Names one data/index file pair.
///
/// Files live under `{app}/{shuffle}/{start}-{end}/` and are named
/// `{stem}.data` and `{stem}.index`. Writers use `{prefix}_{attempt}` as the
/// stem; a tier may derive its own physical stems from it, which
/// [`ShuffleStorage::list_files`] then reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct ShuffleFileKey {
    pub app_id: String,
    pub shuffle_id: u32,
    pub range: PartitionRange,
    pub stem: String,
}

impl ShuffleFileKey {
    pub fn new(
        app_id: impl Into<String>,
        shuffle_id: u32,
        range: PartitionRange,
        stem: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            shuffle_id,
            range,
            stem: stem.into(),
        }
    }

    /// Stem used by a writer: `{prefix}_{attempt}`.
    pub fn writer_stem(prefix: &str, attempt: u32) -> String {
        format!("{prefix}_{attempt}")
    }

    pub fn with_stem(&self, stem: impl Into<String>) -> Self {
        Self {
            stem: stem.into(),
            ..self.clone()
        }
    }

    pub fn data_name(&self) -> String {
        format!("{}.data", self.stem)
    }

    pub fn index_name(&self) -> String {
        format!("{}.index", self.stem)
    }

    /// True if this file belongs to `(app, shuffle, range)`.
    pub fn is_in(&self, app_id: &str, shuffle_id: u32, range: PartitionRange) -> bool {
        self.app_id == app_id && self.shuffle_id == shuffle_id && self.range == range
    }
}

impl fmt::Display for ShuffleFileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.app_id, self.shuffle_id, self.range, self.stem
        )
    }
}

/// One storage tier of a shuffle server.
///
/// `write_batch` is the write contract: the blocks' bytes are appended to the
/// data file, then one index entry per block is appended to the index file.
/// It is all-or-nothing: on error no entry of the batch is visible to
/// readers. Index entries are only published after the data they point to.
#[async_trait::async_trait]
pub trait ShuffleStorage: Send + Sync {
    fn kind(&self) -> StorageTierKind;

    /// Durably store `blocks` in the file pair named by `file`.
    ///
    /// Returns the index entries written, in block order.
    async fn write_batch(
        &self,
        file: &ShuffleFileKey,
        blocks: &[ShuffleBlock],
    ) -> Result<Vec<IndexEntry>, StoreError>;

    /// File pairs of one partition range, sorted by stem.
    async fn list_files(
        &self,
        app_id: &str,
        shuffle_id: u32,
        range: PartitionRange,
    ) -> Result<Vec<ShuffleFileKey>, StoreError>;

    /// Read a whole index file and the current length of its data file.
    async fn read_index(&self, file: &ShuffleFileKey) -> Result<IndexFile, StoreError>;

    /// Read `length` bytes of the data file starting at `offset`.
    async fn read_data(
        &self,
        file: &ShuffleFileKey,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StoreError>;

    /// Report current capacity.
    async fn capacity(&self) -> Result<StorageCapacity, StoreError>;

    /// Delete everything stored for an application.
    async fn purge_app(&self, app_id: &str) -> Result<(), StoreError>;
}
