//! Registry of block ids reported by write tasks.

use dashmap::{DashMap, DashSet};
use eddy_types::{BlockId, ExpectedBlockSet, PartitionKey};
use tracing::debug;

use crate::error::ServerError;

/// Per-partition bitmaps of the block ids write tasks reported.
///
/// A shuffle is known once a task reported to it or it was committed; a
/// known shuffle answers partitions nobody reported to with an empty set.
#[derive(Default)]
pub struct ShuffleResultRegistry {
    results: DashMap<PartitionKey, ExpectedBlockSet>,
    known: DashSet<(String, u32)>,
}

impl ShuffleResultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_shuffle(&self, app_id: &str, shuffle_id: u32) {
        self.known.insert((app_id.to_string(), shuffle_id));
    }

    pub fn is_known(&self, app_id: &str, shuffle_id: u32) -> bool {
        self.known.contains(&(app_id.to_string(), shuffle_id))
    }

    /// Merge a task's block ids into the partition bitmaps.
    pub fn report<'a>(
        &self,
        app_id: &str,
        shuffle_id: u32,
        partitions: impl IntoIterator<Item = (u32, &'a [BlockId])>,
    ) {
        self.register_shuffle(app_id, shuffle_id);
        for (partition_id, ids) in partitions {
            let key = PartitionKey::new(app_id, shuffle_id, partition_id);
            self.results
                .entry(key)
                .or_default()
                .extend(ids.iter().copied());
            debug!(app_id, shuffle_id, partition_id, blocks = ids.len(), "recorded shuffle result");
        }
    }

    pub fn get(&self, key: &PartitionKey) -> Result<ExpectedBlockSet, ServerError> {
        if let Some(set) = self.results.get(key) {
            return Ok(set.clone());
        }
        if self.is_known(&key.app_id, key.shuffle_id) {
            return Ok(ExpectedBlockSet::new());
        }
        Err(ServerError::UnknownShuffle {
            app_id: key.app_id.clone(),
            shuffle_id: key.shuffle_id,
        })
    }

    pub fn purge_app(&self, app_id: &str) {
        self.results.retain(|key, _| key.app_id != app_id);
        self.known.retain(|(app, _)| app != app_id);
    }
}
