//! Local-disk storage tier.
//!
//! Files live at `{base_dir}/{app}/{shuffle}/{start}-{end}/{stem}.data` and
//! `{stem}.index`.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use eddy_types::{PartitionRange, ShuffleBlock, StorageTierKind};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::index::{self, IndexEntry, IndexFile};
use crate::traits::{ShuffleFileKey, ShuffleStorage, StorageCapacity};

/// Append-only file tier bounded by a byte quota.
///
/// A batch appends all block bytes to the data file and syncs, then appends
/// its index records with a single write and syncs. If either step fails
/// both files are truncated back to their previous lengths.
pub struct LocalFileTier {
    base_dir: PathBuf,
    max_bytes: u64,
    used: AtomicU64,
    app_usage: DashMap<String, u64>,
    /// One writer per data file at a time.
    file_locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
}

impl LocalFileTier {
    /// Create a tier rooted at `base_dir`, creating the directory if needed.
    pub fn new(base_dir: impl AsRef<Path>, max_bytes: u64) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            max_bytes,
            used: AtomicU64::new(0),
            app_usage: DashMap::new(),
            file_locks: DashMap::new(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn range_dir(&self, app_id: &str, shuffle_id: u32, range: PartitionRange) -> PathBuf {
        self.base_dir
            .join(app_id)
            .join(shuffle_id.to_string())
            .join(range.to_string())
    }

    fn data_path(&self, file: &ShuffleFileKey) -> PathBuf {
        self.range_dir(&file.app_id, file.shuffle_id, file.range)
            .join(file.data_name())
    }

    fn index_path(&self, file: &ShuffleFileKey) -> PathBuf {
        self.range_dir(&file.app_id, file.shuffle_id, file.range)
            .join(file.index_name())
    }

    fn reserve(&self, needed: u64) -> Result<(), StoreError> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used + needed <= self.max_bytes).then_some(used + needed)
            })
            .map(|_| ())
            .map_err(|used| StoreError::CapacityExceeded {
                needed,
                available: self.max_bytes.saturating_sub(used),
            })
    }

    async fn append_batch(
        &self,
        file: &ShuffleFileKey,
        blocks: &[ShuffleBlock],
    ) -> Result<Vec<IndexEntry>, StoreError> {
        let data_path = self.data_path(file);
        let index_path = self.index_path(file);
        if let Some(parent) = data_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let lock = self
            .file_locks
            .entry(data_path.clone())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let (mut data_file, data_base) = open_append(&data_path).await?;

        let mut payload = BytesMut::new();
        let mut entries = Vec::with_capacity(blocks.len());
        for block in blocks {
            entries.push(IndexEntry::for_block(
                block,
                data_base + payload.len() as u64,
            ));
            payload.extend_from_slice(&block.data);
        }

        if let Err(e) = write_synced(&mut data_file, &payload).await {
            truncate(&data_path, data_base).await;
            return Err(e.into());
        }

        let (mut index_file, index_base) = match open_append(&index_path).await {
            Ok(opened) => opened,
            Err(e) => {
                truncate(&data_path, data_base).await;
                return Err(e.into());
            }
        };

        if let Err(e) = write_synced(&mut index_file, &index::encode_entries(&entries)).await {
            truncate(&index_path, index_base).await;
            truncate(&data_path, data_base).await;
            return Err(e.into());
        }

        Ok(entries)
    }
}

async fn open_append(path: &Path) -> std::io::Result<(tokio::fs::File, u64)> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let len = file.metadata().await?.len();
    Ok((file, len))
}

async fn write_synced(file: &mut tokio::fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.sync_data().await
}

/// Roll a file back to `len` after a failed append.
async fn truncate(path: &Path, len: u64) {
    if let Err(e) = set_len(path, len).await {
        warn!(path = %path.display(), len, error = %e, "failed to roll back partial write");
    }
}

async fn set_len(path: &Path, len: u64) -> std::io::Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await
}

#[async_trait::async_trait]
impl ShuffleStorage for LocalFileTier {
    fn kind(&self) -> StorageTierKind {
        StorageTierKind::LocalFile
    }

    async fn write_batch(
        &self,
        file: &ShuffleFileKey,
        blocks: &[ShuffleBlock],
    ) -> Result<Vec<IndexEntry>, StoreError> {
        let needed: u64 = blocks.iter().map(|b| b.length() as u64).sum();
        self.reserve(needed)?;

        match self.append_batch(file, blocks).await {
            Ok(entries) => {
                *self.app_usage.entry(file.app_id.clone()).or_insert(0) += needed;
                debug!(%file, blocks = blocks.len(), bytes = needed, "stored batch in local file tier");
                Ok(entries)
            }
            Err(e) => {
                self.used.fetch_sub(needed, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    async fn list_files(
        &self,
        app_id: &str,
        shuffle_id: u32,
        range: PartitionRange,
    ) -> Result<Vec<ShuffleFileKey>, StoreError> {
        let dir = self.range_dir(app_id, shuffle_id, range);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".index")) else {
                continue;
            };
            files.push(ShuffleFileKey::new(app_id, shuffle_id, range, stem));
        }
        files.sort();
        Ok(files)
    }

    async fn read_index(&self, file: &ShuffleFileKey) -> Result<IndexFile, StoreError> {
        let raw = match tokio::fs::read(self.index_path(file)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(file.to_string()));
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        let data_len = match tokio::fs::metadata(self.data_path(file)).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(StoreError::Io(e)),
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
        let mut handle = match tokio::fs::File::open(self.data_path(file)).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(file.to_string()));
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        let available = handle.metadata().await?.len();
        if offset + length > available {
            return Err(StoreError::OutOfRange {
                file: file.to_string(),
                offset,
                length,
                available,
            });
        }

        handle.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length as usize];
        handle.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn capacity(&self) -> Result<StorageCapacity, StoreError> {
        let used = self.used.load(Ordering::Acquire);
        Ok(StorageCapacity {
            total_bytes: self.max_bytes,
            used_bytes: used,
            available_bytes: self.max_bytes.saturating_sub(used),
        })
    }

    async fn purge_app(&self, app_id: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_dir_all(self.base_dir.join(app_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }
        if let Some((_, bytes)) = self.app_usage.remove(app_id) {
            self.used.fetch_sub(bytes, Ordering::AcqRel);
        }
        let prefix = self.base_dir.join(app_id);
        self.file_locks.retain(|path, _| !path.starts_with(&prefix));
        debug!(app_id, "purged app from local file tier");
        Ok(())
    }
}
