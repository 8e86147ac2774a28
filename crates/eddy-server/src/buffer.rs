//! Reception buffers and watermark-driven flushing.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use eddy_types::{PartitionKey, ShuffleBlock};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::flush::FlushManager;

/// Rounds a commit spends draining buffers that keep being refilled by
/// failed flushes before giving up.
const COMMIT_ROUNDS: usize = 3;

#[derive(Default)]
struct ReceiveBuffer {
    blocks: Vec<ShuffleBlock>,
    size: u64,
    /// Value of the flush clock when this buffer was last snapshotted.
    last_flush: u64,
}

#[derive(Default)]
struct BufferSlot {
    buffer: Mutex<ReceiveBuffer>,
    /// Held while a snapshot of this buffer is being written.
    flushing: tokio::sync::Mutex<()>,
}

/// Handle of one spawned flush.
pub struct FlushHandle {
    pub partition: PartitionKey,
    pub size: u64,
    pub handle: JoinHandle<Result<(), ServerError>>,
}

/// In-memory reception buffers of a shuffle server.
///
/// Bytes stay accounted in `used` until their flush lands in a tier, so
/// the capacity check covers data that is still being written.
pub struct ServerBlockStore {
    config: ServerConfig,
    slots: DashMap<PartitionKey, Arc<BufferSlot>>,
    used: AtomicU64,
    in_flush: AtomicU64,
    flush_clock: AtomicU64,
    flusher: FlushManager,
    flush_permits: Semaphore,
}

impl ServerBlockStore {
    pub fn new(config: ServerConfig, flusher: FlushManager) -> Arc<Self> {
        let permits = config.flush_pool_size.max(1);
        Arc::new(Self {
            config,
            slots: DashMap::new(),
            used: AtomicU64::new(0),
            in_flush: AtomicU64::new(0),
            flush_clock: AtomicU64::new(0),
            flusher,
            flush_permits: Semaphore::new(permits),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn flusher(&self) -> &FlushManager {
        &self.flusher
    }

    /// Bytes held by the buffers, including snapshots being flushed.
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes waiting in buffers that no flush has taken yet.
    pub fn buffered_bytes(&self) -> u64 {
        self.used_bytes()
            .saturating_sub(self.in_flush.load(Ordering::Acquire))
    }

    /// Accept blocks of one shuffle.
    ///
    /// The whole request is admitted or rejected with `NoBuffer`. Crossing
    /// the high watermark starts background flushes.
    pub fn receive(
        self: &Arc<Self>,
        app_id: &str,
        shuffle_id: u32,
        blocks: Vec<ShuffleBlock>,
    ) -> Result<(), ServerError> {
        let requested: u64 = blocks.iter().map(|b| b.length() as u64).sum();
        let capacity = self.config.buffer_capacity;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used + requested <= capacity).then_some(used + requested)
            })
            .map_err(|used| ServerError::NoBuffer {
                requested,
                available: capacity.saturating_sub(used),
            })?;

        let mut by_partition: BTreeMap<u32, Vec<ShuffleBlock>> = BTreeMap::new();
        for block in blocks {
            by_partition.entry(block.partition_id).or_default().push(block);
        }
        for (partition_id, blocks) in by_partition {
            let key = PartitionKey::new(app_id, shuffle_id, partition_id);
            let slot = self.slots.entry(key).or_default().clone();
            let mut buffer = slot.buffer.lock().expect("lock poisoned");
            buffer.size += blocks.iter().map(|b| b.length() as u64).sum::<u64>();
            buffer.blocks.extend(blocks);
        }

        self.flush_if_needed();
        Ok(())
    }

    /// Start flushes when buffered bytes exceed the high watermark.
    ///
    /// Buffers are taken least recently flushed first, larger first on ties,
    /// until the flushes cover the excess over the low watermark.
    pub fn flush_if_needed(self: &Arc<Self>) -> Vec<FlushHandle> {
        let buffered = self.buffered_bytes();
        if buffered <= self.config.high_watermark() {
            return Vec::new();
        }
        let target = buffered - self.config.low_watermark();
        let handles = self.flush_bytes(target);
        info!(
            buffered,
            target,
            flushes = handles.len(),
            "buffers above high watermark, flushing"
        );
        handles
    }

    /// Flush buffers in selection order until at least `target` bytes are
    /// on their way to storage.
    pub(crate) fn flush_bytes(self: &Arc<Self>, target: u64) -> Vec<FlushHandle> {
        let mut candidates: Vec<(PartitionKey, Arc<BufferSlot>, u64, u64)> = self
            .slots
            .iter()
            .filter_map(|entry| {
                let buffer = entry.value().buffer.lock().expect("lock poisoned");
                (buffer.size > 0).then(|| {
                    (
                        entry.key().clone(),
                        Arc::clone(entry.value()),
                        buffer.last_flush,
                        buffer.size,
                    )
                })
            })
            .collect();
        candidates.sort_by_key(|(_, _, last_flush, size)| (*last_flush, Reverse(*size)));

        let mut selected = 0;
        let mut handles = Vec::new();
        for (key, slot, _, _) in candidates {
            if selected >= target {
                break;
            }
            if let Some(handle) = self.spawn_flush(key, slot) {
                selected += handle.size;
                handles.push(handle);
            }
        }
        handles
    }

    /// Snapshot-and-swap a buffer and flush the snapshot on the flush pool.
    fn spawn_flush(self: &Arc<Self>, key: PartitionKey, slot: Arc<BufferSlot>) -> Option<FlushHandle> {
        let (blocks, size) = {
            let mut buffer = slot.buffer.lock().expect("lock poisoned");
            if buffer.blocks.is_empty() {
                return None;
            }
            buffer.last_flush = self.flush_clock.fetch_add(1, Ordering::AcqRel) + 1;
            (
                std::mem::take(&mut buffer.blocks),
                std::mem::take(&mut buffer.size),
            )
        };
        self.in_flush.fetch_add(size, Ordering::AcqRel);

        let store = Arc::clone(self);
        let partition = key.clone();
        let handle = tokio::spawn(async move { store.run_flush(key, slot, blocks, size).await });
        Some(FlushHandle {
            partition,
            size,
            handle,
        })
    }

    async fn run_flush(
        &self,
        key: PartitionKey,
        slot: Arc<BufferSlot>,
        blocks: Vec<ShuffleBlock>,
        size: u64,
    ) -> Result<(), ServerError> {
        let _permit = self.flush_permits.acquire().await.ok();
        let _flushing = slot.flushing.lock().await;

        let result = self.flusher.flush(&key, &blocks).await;
        self.in_flush.fetch_sub(size, Ordering::AcqRel);
        match result {
            Ok(_) => {
                self.used.fetch_sub(size, Ordering::AcqRel);
                Ok(())
            }
            Err(e) if !self.is_current(&key, &slot) => {
                debug!(partition = %key, error = %e, "flush failed for purged buffer, dropping blocks");
                self.used.fetch_sub(size, Ordering::AcqRel);
                Err(e)
            }
            Err(e) => {
                error!(partition = %key, size, error = %e, "flush failed, keeping blocks buffered");
                let mut buffer = slot.buffer.lock().expect("lock poisoned");
                let mut restored = blocks;
                restored.append(&mut buffer.blocks);
                buffer.blocks = restored;
                buffer.size += size;
                Err(e)
            }
        }
    }

    /// Whether `slot` is still the live buffer of `key`. A purge followed by
    /// new data for the same partition replaces the slot.
    fn is_current(&self, key: &PartitionKey, slot: &Arc<BufferSlot>) -> bool {
        self.slots
            .get(key)
            .is_some_and(|live| Arc::ptr_eq(live.value(), slot))
    }

    fn slots_of(&self, app_id: &str, shuffle_id: u32) -> Vec<(PartitionKey, Arc<BufferSlot>)> {
        self.slots
            .iter()
            .filter(|e| e.key().app_id == app_id && e.key().shuffle_id == shuffle_id)
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    /// Flush every buffer of a shuffle and wait until the data is in a tier.
    ///
    /// Also waits for flushes already in flight. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn commit_shuffle(self: &Arc<Self>, app_id: &str, shuffle_id: u32) -> Result<(), ServerError> {
        for round in 0..COMMIT_ROUNDS {
            let slots = self.slots_of(app_id, shuffle_id);
            let handles: Vec<FlushHandle> = slots
                .iter()
                .filter_map(|(key, slot)| self.spawn_flush(key.clone(), Arc::clone(slot)))
                .collect();
            debug!(round, flushes = handles.len(), "committing shuffle");

            let mut first_error = None;
            for flush in handles {
                let outcome = match flush.handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(ServerError::AllTiersFailed {
                        partition: flush.partition.to_string(),
                        reason: format!("flush task failed: {e}"),
                    }),
                };
                if let Err(e) = outcome {
                    first_error.get_or_insert(e);
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }

            for (_, slot) in &slots {
                drop(slot.flushing.lock().await);
            }

            let remaining: u64 = slots
                .iter()
                .map(|(_, slot)| slot.buffer.lock().expect("lock poisoned").size)
                .sum();
            if remaining == 0 {
                return Ok(());
            }
        }

        let remaining = self
            .slots_of(app_id, shuffle_id)
            .iter()
            .map(|(_, slot)| slot.buffer.lock().expect("lock poisoned").size)
            .sum();
        Err(ServerError::CommitIncomplete {
            app_id: app_id.to_string(),
            shuffle_id,
            remaining,
        })
    }

    /// Drop every buffer of an application.
    pub fn purge_app(&self, app_id: &str) {
        let keys: Vec<PartitionKey> = self
            .slots
            .iter()
            .filter(|e| e.key().app_id == app_id)
            .map(|e| e.key().clone())
            .collect();
        let mut released = 0;
        for key in keys {
            if let Some((_, slot)) = self.slots.remove(&key) {
                let mut buffer = slot.buffer.lock().expect("lock poisoned");
                released += std::mem::take(&mut buffer.size);
                buffer.blocks.clear();
            }
        }
        self.used.fetch_sub(released, Ordering::AcqRel);
        debug!(app_id, released, "purged app buffers");
    }

    /// Periodically re-check the watermark, e.g. after failed flushes.
    pub fn spawn_flush_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = store.config.flush_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                store.flush_if_needed();
            }
        })
    }
}
