//! In-memory storage tier.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use eddy_types::{PartitionRange, ShuffleBlock, StorageTierKind};
use tracing::debug;

use crate::error::StoreError;
use crate::index::{IndexEntry, IndexFile};
use crate::traits::{ShuffleFileKey, ShuffleStorage, StorageCapacity};

#[derive(Default)]
struct MemoryFile {
    data: Vec<u8>,
    index: Vec<IndexEntry>,
}

/// Volatile tier backed by a `RwLock<HashMap>`, bounded by `max_bytes`.
///
/// A batch is appended under the write lock, so data and index become
/// visible together.
pub struct MemoryTier {
    files: RwLock<HashMap<ShuffleFileKey, MemoryFile>>,
    max_bytes: u64,
}

impl MemoryTier {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            max_bytes,
        }
    }

    fn used_bytes_unlocked(map: &HashMap<ShuffleFileKey, MemoryFile>) -> u64 {
        map.values().map(|f| f.data.len() as u64).sum()
    }
}

#[async_trait::async_trait]
impl ShuffleStorage for MemoryTier {
    fn kind(&self) -> StorageTierKind {
        StorageTierKind::Memory
    }

    async fn write_batch(
        &self,
        file: &ShuffleFileKey,
        blocks: &[ShuffleBlock],
    ) -> Result<Vec<IndexEntry>, StoreError> {
        let needed: u64 = blocks.iter().map(|b| b.length() as u64).sum();

        let mut map = self.files.write().expect("lock poisoned");
        let used = Self::used_bytes_unlocked(&map);
        if used + needed > self.max_bytes {
            return Err(StoreError::CapacityExceeded {
                needed,
                available: self.max_bytes.saturating_sub(used),
            });
        }

        let target = map.entry(file.clone()).or_default();
        let mut entries = Vec::with_capacity(blocks.len());
        for block in blocks {
            let entry = IndexEntry::for_block(block, target.data.len() as u64);
            target.data.extend_from_slice(&block.data);
            entries.push(entry);
        }
        target.index.extend_from_slice(&entries);

        debug!(%file, blocks = blocks.len(), bytes = needed, "stored batch in memory tier");
        Ok(entries)
    }

    async fn list_files(
        &self,
        app_id: &str,
        shuffle_id: u32,
        range: PartitionRange,
    ) -> Result<Vec<ShuffleFileKey>, StoreError> {
        let map = self.files.read().expect("lock poisoned");
        let mut keys: Vec<ShuffleFileKey> = map
            .keys()
            .filter(|k| k.is_in(app_id, shuffle_id, range))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn read_index(&self, file: &ShuffleFileKey) -> Result<IndexFile, StoreError> {
        let map = self.files.read().expect("lock poisoned");
        let stored = map
            .get(file)
            .ok_or_else(|| StoreError::NotFound(file.to_string()))?;
        Ok(IndexFile {
            entries: stored.index.clone(),
            data_len: stored.data.len() as u64,
        })
    }

    async fn read_data(
        &self,
        file: &ShuffleFileKey,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StoreError> {
        let map = self.files.read().expect("lock poisoned");
        let stored = map
            .get(file)
            .ok_or_else(|| StoreError::NotFound(file.to_string()))?;
        let available = stored.data.len() as u64;
        if offset + length > available {
            return Err(StoreError::OutOfRange {
                file: file.to_string(),
                offset,
                length,
                available,
            });
        }
        let start = offset as usize;
        Ok(Bytes::copy_from_slice(
            &stored.data[start..start + length as usize],
        ))
    }

    async fn capacity(&self) -> Result<StorageCapacity, StoreError> {
        let map = self.files.read().expect("lock poisoned");
        let used = Self::used_bytes_unlocked(&map);
        Ok(StorageCapacity {
            total_bytes: self.max_bytes,
            used_bytes: used,
            available_bytes: self.max_bytes.saturating_sub(used),
        })
    }

    async fn purge_app(&self, app_id: &str) -> Result<(), StoreError> {
        let mut map = self.files.write().expect("lock poisoned");
        map.retain(|k, _| k.app_id != app_id);
        debug!(app_id, "purged app from memory tier");
        Ok(())
    }
}
