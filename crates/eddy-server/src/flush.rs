//! Writing flushed buffers into the storage tiers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use eddy_store::{ShuffleFileKey, ShuffleStorage, StoreError};
use eddy_types::{PartitionKey, PartitionRange, ShuffleBlock, StorageTierKind};
use tracing::{debug, warn};

use crate::error::ServerError;

/// Picks a tier for each flush and writes the blocks there.
///
/// Tiers are tried in their configured order. A flush above the cold
/// threshold skips every tier but the remote one. A tier that fails hands
/// the flush to the next one; after an I/O failure the writer attempt is
/// bumped so later flushes start fresh file pairs.
pub struct FlushManager {
    server_id: String,
    tiers: Vec<Arc<dyn ShuffleStorage>>,
    cold_flush_threshold: Option<u64>,
    partition_range_width: u32,
    attempt: AtomicU32,
}

impl FlushManager {
    pub fn new(
        server_id: impl Into<String>,
        tiers: Vec<Arc<dyn ShuffleStorage>>,
        cold_flush_threshold: Option<u64>,
        partition_range_width: u32,
    ) -> Result<Self, ServerError> {
        if tiers.is_empty() {
            return Err(ServerError::NoTiers);
        }
        Ok(Self {
            server_id: server_id.into(),
            tiers,
            cold_flush_threshold,
            partition_range_width,
            attempt: AtomicU32::new(0),
        })
    }

    pub fn tiers(&self) -> &[Arc<dyn ShuffleStorage>] {
        &self.tiers
    }

    fn is_cold(&self, size: u64) -> bool {
        let has_remote = self
            .tiers
            .iter()
            .any(|t| t.kind() == StorageTierKind::Remote);
        has_remote && self.cold_flush_threshold.is_some_and(|t| size > t)
    }

    /// Persist one buffer snapshot. Returns the tier that took it.
    #[tracing::instrument(skip(self, blocks), fields(partition = %key, blocks = blocks.len()))]
    pub async fn flush(
        &self,
        key: &PartitionKey,
        blocks: &[ShuffleBlock],
    ) -> Result<StorageTierKind, ServerError> {
        let size: u64 = blocks.iter().map(|b| b.length() as u64).sum();
        let cold = self.is_cold(size);
        let range = PartitionRange::containing(key.partition_id, self.partition_range_width);

        let mut last_error: Option<StoreError> = None;
        for tier in &self.tiers {
            if cold && tier.kind() != StorageTierKind::Remote {
                continue;
            }

            let stem = ShuffleFileKey::writer_stem(&self.server_id, self.attempt.load(Ordering::Acquire));
            let file = ShuffleFileKey::new(&key.app_id, key.shuffle_id, range, stem);
            match tier.write_batch(&file, blocks).await {
                Ok(_) => {
                    debug!(tier = %tier.kind(), %file, size, "flushed buffer");
                    return Ok(tier.kind());
                }
                Err(e) => {
                    warn!(tier = %tier.kind(), %file, size, error = %e, "tier rejected flush, trying next tier");
                    if !matches!(e, StoreError::CapacityExceeded { .. }) {
                        self.attempt.fetch_add(1, Ordering::AcqRel);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(ServerError::AllTiersFailed {
            partition: key.to_string(),
            reason: last_error.map_or_else(|| "no eligible tier".to_string(), |e| e.to_string()),
        })
    }
}
