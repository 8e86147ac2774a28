//! A [`ShuffleStorage`] wrapper that injects latency and failures.
//!
//! `FaultyTier` wraps any `Arc<dyn ShuffleStorage>`, sleeps for a random
//! duration before each write or read, and can be switched into a mode where
//! writes or reads fail. The RNG is seeded for reproducible runs.
//!
//! ```ignore
//! let tier = FaultyTier::new(inner)
//!     .write_latency(5, 20)
//!     .seed(42);
//! tier.fail_writes(true);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use eddy_types::{PartitionRange, ShuffleBlock, StorageTierKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::StoreError;
use crate::index::{IndexEntry, IndexFile};
use crate::traits::{ShuffleFileKey, ShuffleStorage, StorageCapacity};

pub struct FaultyTier {
    inner: Arc<dyn ShuffleStorage>,
    read_latency_ms: (u64, u64),
    write_latency_ms: (u64, u64),
    rng: Mutex<StdRng>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    write_attempts: AtomicU64,
}

impl FaultyTier {
    /// Wrap a tier as a pass-through.
    pub fn new(inner: Arc<dyn ShuffleStorage>) -> Self {
        Self {
            inner,
            read_latency_ms: (0, 0),
            write_latency_ms: (0, 0),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            write_attempts: AtomicU64::new(0),
        }
    }

    pub fn read_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.read_latency_ms = (min_ms, max_ms);
        self
    }

    pub fn write_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.write_latency_ms = (min_ms, max_ms);
        self
    }

    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of `write_batch` calls seen, failed ones included.
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    async fn delay(&self, range: (u64, u64)) {
        let (min, max) = range;
        if max == 0 {
            return;
        }
        let ms = if min == max {
            min
        } else {
            self.rng
                .lock()
                .expect("lock poisoned")
                .random_range(min..=max)
        };
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other(format!(
                "injected {what} failure"
            ))));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ShuffleStorage for FaultyTier {
    fn kind(&self) -> StorageTierKind {
        self.inner.kind()
    }

    async fn write_batch(
        &self,
        file: &ShuffleFileKey,
        blocks: &[ShuffleBlock],
    ) -> Result<Vec<IndexEntry>, StoreError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.delay(self.write_latency_ms).await;
        Self::check(&self.fail_writes, "write")?;
        self.inner.write_batch(file, blocks).await
    }

    async fn list_files(
        &self,
        app_id: &str,
        shuffle_id: u32,
        range: PartitionRange,
    ) -> Result<Vec<ShuffleFileKey>, StoreError> {
        Self::check(&self.fail_reads, "list")?;
        self.inner.list_files(app_id, shuffle_id, range).await
    }

    async fn read_index(&self, file: &ShuffleFileKey) -> Result<IndexFile, StoreError> {
        self.delay(self.read_latency_ms).await;
        Self::check(&self.fail_reads, "index read")?;
        self.inner.read_index(file).await
    }

    async fn read_data(
        &self,
        file: &ShuffleFileKey,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StoreError> {
        self.delay(self.read_latency_ms).await;
        Self::check(&self.fail_reads, "data read")?;
        self.inner.read_data(file, offset, length).await
    }

    async fn capacity(&self) -> Result<StorageCapacity, StoreError> {
        self.inner.capacity().await
    }

    async fn purge_app(&self, app_id: &str) -> Result<(), StoreError> {
        self.inner.purge_app(app_id).await
    }
}
