//! Remote storage tier on top of an [`ObjectStore`].
//!
//! Objects cannot be appended to, so every batch becomes its own object pair
//! `{root}/{app}/{shuffle}/{start}-{end}/{stem}-{seq}.data|.index`. The data
//! object is uploaded first; the index object is what makes a batch visible.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use eddy_types::{PartitionRange, ShuffleBlock, StorageTierKind};
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::index::{self, IndexEntry, IndexFile};
use crate::traits::{ShuffleFileKey, ShuffleStorage, StorageCapacity};

pub struct RemoteTier {
    store: Arc<dyn ObjectStore>,
    root: Path,
    sequence: AtomicU64,
    used: AtomicU64,
}

impl RemoteTier {
    /// Store shuffle data below `root` in `store`.
    pub fn new(store: Arc<dyn ObjectStore>, root: impl Into<Path>) -> Self {
        Self {
            store,
            root: root.into(),
            sequence: AtomicU64::new(0),
            used: AtomicU64::new(0),
        }
    }

    fn range_dir(&self, app_id: &str, shuffle_id: u32, range: PartitionRange) -> Path {
        self.root
            .child(app_id)
            .child(shuffle_id.to_string())
            .child(range.to_string())
    }

    fn object(&self, file: &ShuffleFileKey, name: String) -> Path {
        self.range_dir(&file.app_id, file.shuffle_id, file.range)
            .child(name)
    }
}

fn not_found(file: &ShuffleFileKey, error: object_store::Error) -> StoreError {
    match error {
        object_store::Error::NotFound { .. } => StoreError::NotFound(file.to_string()),
        other => StoreError::ObjectStore(other),
    }
}

#[async_trait::async_trait]
impl ShuffleStorage for RemoteTier {
    fn kind(&self) -> StorageTierKind {
        StorageTierKind::Remote
    }

    async fn write_batch(
        &self,
        file: &ShuffleFileKey,
        blocks: &[ShuffleBlock],
    ) -> Result<Vec<IndexEntry>, StoreError> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let physical = file.with_stem(format!("{}-{seq:08}", file.stem));

        let mut payload = BytesMut::new();
        let mut entries = Vec::with_capacity(blocks.len());
        for block in blocks {
            entries.push(IndexEntry::for_block(block, payload.len() as u64));
            payload.extend_from_slice(&block.data);
        }
        let size = payload.len() as u64;

        let data_path = self.object(&physical, physical.data_name());
        self.store
            .put(&data_path, PutPayload::from(payload.freeze()))
            .await?;

        let index_path = self.object(&physical, physical.index_name());
        let encoded = index::encode_entries(&entries);
        if let Err(e) = self.store.put(&index_path, PutPayload::from(encoded)).await {
            if let Err(cleanup) = self.store.delete(&data_path).await {
                warn!(path = %data_path, error = %cleanup, "failed to delete orphaned data object");
            }
            return Err(e.into());
        }

        self.used.fetch_add(size, Ordering::Relaxed);
        debug!(file = %physical, blocks = blocks.len(), bytes = size, "stored batch in remote tier");
        Ok(entries)
    }

    async fn list_files(
        &self,
        app_id: &str,
        shuffle_id: u32,
        range: PartitionRange,
    ) -> Result<Vec<ShuffleFileKey>, StoreError> {
        let prefix = self.range_dir(app_id, shuffle_id, range);
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;

        let mut files: Vec<ShuffleFileKey> = objects
            .iter()
            .filter_map(|meta| meta.location.filename())
            .filter_map(|name| name.strip_suffix(".index"))
            .map(|stem| ShuffleFileKey::new(app_id, shuffle_id, range, stem))
            .collect();
        files.sort();
        Ok(files)
    }

    async fn read_index(&self, file: &ShuffleFileKey) -> Result<IndexFile, StoreError> {
        let index_path = self.object(file, file.index_name());
        let raw = self
            .store
            .get(&index_path)
            .await
            .map_err(|e| not_found(file, e))?
            .bytes()
            .await?;
        let data_len = match self.store.head(&self.object(file, file.data_name())).await {
            Ok(meta) => meta.size,
            Err(object_store::Error::NotFound { .. }) => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(IndexFile {
            entries: index::decode_entries(&raw),
            data_len,
        })
    }

    async fn read_data(
        &self,
        file: &ShuffleFileKey,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StoreError> {
        let data_path = self.object(file, file.data_name());
        let bytes = self
            .store
            .get_range(&data_path, offset..offset + length)
            .await
            .map_err(|e| not_found(file, e))?;
        if (bytes.len() as u64) < length {
            return Err(StoreError::OutOfRange {
                file: file.to_string(),
                offset,
                length,
                available: offset + bytes.len() as u64,
            });
        }
        Ok(bytes)
    }

    async fn capacity(&self) -> Result<StorageCapacity, StoreError> {
        let used = self.used.load(Ordering::Relaxed);
        Ok(StorageCapacity {
            total_bytes: u64::MAX,
            used_bytes: used,
            available_bytes: u64::MAX - used,
        })
    }

    async fn purge_app(&self, app_id: &str) -> Result<(), StoreError> {
        let prefix = self.root.child(app_id);
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        for meta in &objects {
            self.store.delete(&meta.location).await?;
        }
        debug!(app_id, objects = objects.len(), "purged app from remote tier");
        Ok(())
    }
}
