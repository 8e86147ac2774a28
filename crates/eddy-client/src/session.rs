//! Per-shuffle bookkeeping of block sends.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use eddy_rpc::StatusCode;
use eddy_types::{BlockId, ServerInfo};
use tracing::debug;

/// Where a block stands in its send lifecycle.
///
/// `Pending -> Sent -> {Acked | Retry -> Sent | Failed}`; the terminal
/// states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockSendStatus {
    Pending,
    Sent,
    Retry,
    Acked,
    Failed,
}

impl BlockSendStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acked | Self::Failed)
    }
}

/// Failing servers per block, with the status each one answered.
#[derive(Debug, Default)]
pub struct FailedBlockSendTracker {
    failures: DashMap<BlockId, Vec<(ServerInfo, StatusCode)>>,
}

impl FailedBlockSendTracker {
    pub fn record(&self, block_id: BlockId, server: ServerInfo, status: StatusCode) {
        self.failures
            .entry(block_id)
            .or_default()
            .push((server, status));
    }

    pub fn failures_of(&self, block_id: BlockId) -> Vec<(ServerInfo, StatusCode)> {
        self.failures
            .get(&block_id)
            .map(|f| f.value().clone())
            .unwrap_or_default()
    }

    pub fn faulty_servers(&self) -> BTreeSet<ServerInfo> {
        self.failures
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .map(|(server, _)| server.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Send state of one task's blocks.
///
/// `pending`, `success` and `failed` are disjoint; a block leaves `pending`
/// exactly once.
#[derive(Debug, Default)]
pub struct TaskSendState {
    pending: DashSet<BlockId>,
    success: DashSet<BlockId>,
    failed: DashSet<BlockId>,
    statuses: DashMap<BlockId, BlockSendStatus>,
    tracker: FailedBlockSendTracker,
}

impl TaskSendState {
    pub fn mark_dispatched(&self, block_id: BlockId) {
        if self.success.contains(&block_id) || self.failed.contains(&block_id) {
            return;
        }
        self.pending.insert(block_id);
        self.statuses
            .entry(block_id)
            .or_insert(BlockSendStatus::Pending);
    }

    /// Move a non-terminal block to `Sent` or `Retry`.
    pub fn set_status(&self, block_id: BlockId, status: BlockSendStatus) {
        if let Some(mut current) = self.statuses.get_mut(&block_id) {
            if !current.is_terminal() {
                *current = status;
            }
        }
    }

    /// Settle a pending block as acknowledged. Returns `false` if it had
    /// already been settled.
    pub fn mark_success(&self, block_id: BlockId) -> bool {
        if self.pending.remove(&block_id).is_none() {
            return false;
        }
        self.success.insert(block_id);
        self.statuses.insert(block_id, BlockSendStatus::Acked);
        true
    }

    /// Settle a pending block as failed.
    pub fn mark_failed(&self, block_id: BlockId) -> bool {
        if self.pending.remove(&block_id).is_none() {
            return false;
        }
        self.failed.insert(block_id);
        self.statuses.insert(block_id, BlockSendStatus::Failed);
        true
    }

    pub fn status(&self, block_id: BlockId) -> Option<BlockSendStatus> {
        self.statuses.get(&block_id).map(|s| *s)
    }

    pub fn tracker(&self) -> &FailedBlockSendTracker {
        &self.tracker
    }

    pub fn pending_ids(&self) -> HashSet<BlockId> {
        self.pending.iter().map(|id| *id).collect()
    }

    pub fn success_ids(&self) -> HashSet<BlockId> {
        self.success.iter().map(|id| *id).collect()
    }

    pub fn failed_ids(&self) -> HashSet<BlockId> {
        self.failed.iter().map(|id| *id).collect()
    }

    pub fn is_success(&self, block_id: BlockId) -> bool {
        self.success.contains(&block_id)
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Send state of every task writing to one shuffle, created as tasks
/// register and torn down by [`clear_task_meta`](Self::clear_task_meta).
#[derive(Debug)]
pub struct ShuffleSession {
    app_id: String,
    shuffle_id: u32,
    tasks: DashMap<String, Arc<TaskSendState>>,
    failed_tasks: DashSet<String>,
}

impl ShuffleSession {
    pub fn new(app_id: impl Into<String>, shuffle_id: u32) -> Self {
        Self {
            app_id: app_id.into(),
            shuffle_id,
            tasks: DashMap::new(),
            failed_tasks: DashSet::new(),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn shuffle_id(&self) -> u32 {
        self.shuffle_id
    }

    /// State of a task, created on first use.
    pub fn task(&self, task_id: &str) -> Arc<TaskSendState> {
        if let Some(state) = self.tasks.get(task_id) {
            return Arc::clone(state.value());
        }
        Arc::clone(self.tasks.entry(task_id.to_string()).or_default().value())
    }

    pub fn get_task(&self, task_id: &str) -> Option<Arc<TaskSendState>> {
        self.tasks.get(task_id).map(|s| Arc::clone(s.value()))
    }

    /// Drop the send state of a task. Sends still in flight keep their own
    /// handle on it.
    pub fn clear_task_meta(&self, task_id: &str) {
        self.tasks.remove(task_id);
        self.failed_tasks.remove(task_id);
        debug!(task_id, shuffle_id = self.shuffle_id, "cleared task meta");
    }

    /// Later dispatches of a failed task are dropped.
    pub fn mark_task_failed(&self, task_id: &str) {
        self.failed_tasks.insert(task_id.to_string());
    }

    pub fn is_task_failed(&self, task_id: &str) -> bool {
        self.failed_tasks.contains(task_id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}
