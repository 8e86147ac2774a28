//! Accounted buffer memory.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ClientError;

/// Memory shared by every task of an executor.
#[derive(Debug)]
pub struct MemoryPool {
    capacity: u64,
    used: AtomicU64,
}

impl MemoryPool {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: AtomicU64::new(0),
        }
    }

    /// Take `bytes` if they fit; all or nothing.
    pub fn try_acquire(&self, bytes: u64) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&next| next <= self.capacity)
            })
            .is_ok()
    }

    pub fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used())
    }
}

/// The share of a [`MemoryPool`] one task holds.
///
/// Releases never return more than the task holds, so a block released
/// twice or a `release_all` after partial releases cannot drain memory
/// that belongs to other tasks.
#[derive(Debug)]
pub struct TaskMemory {
    task_id: String,
    pool: Arc<MemoryPool>,
    held: AtomicU64,
    retries: u32,
    interval: Duration,
}

impl TaskMemory {
    pub fn new(task_id: impl Into<String>, pool: Arc<MemoryPool>, retries: u32, interval: Duration) -> Self {
        Self {
            task_id: task_id.into(),
            pool,
            held: AtomicU64::new(0),
            retries,
            interval,
        }
    }

    /// Acquire `bytes`, waiting for other tasks to release memory.
    pub async fn acquire(&self, bytes: u64) -> Result<(), ClientError> {
        for attempt in 0..=self.retries {
            if self.pool.try_acquire(bytes) {
                self.held.fetch_add(bytes, Ordering::AcqRel);
                return Ok(());
            }
            if attempt < self.retries {
                debug!(task_id = %self.task_id, bytes, attempt, available = self.pool.available(), "memory pool exhausted, waiting");
                tokio::time::sleep(self.interval).await;
            }
        }
        warn!(task_id = %self.task_id, bytes, retries = self.retries, "giving up on memory acquisition");
        Err(ClientError::OutOfMemory {
            task_id: self.task_id.clone(),
            requested: bytes,
        })
    }

    /// Give back up to `bytes`. Returns what was actually released.
    pub fn release(&self, bytes: u64) -> u64 {
        let mut released = 0;
        let _ = self
            .held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                released = held.min(bytes);
                Some(held - released)
            });
        self.pool.release(released);
        released
    }

    /// Give back everything the task holds. Safe to call more than once.
    pub fn release_all(&self) -> u64 {
        let released = self.held.swap(0, Ordering::AcqRel);
        self.pool.release(released);
        if released > 0 {
            debug!(task_id = %self.task_id, released, "released task memory");
        }
        released
    }

    pub fn held(&self) -> u64 {
        self.held.load(Ordering::Acquire)
    }
}
