//! Asynchronous delivery of blocks to their replica servers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use eddy_rpc::{SendShuffleDataRequest, ShuffleServerClient, StatusCode};
use eddy_types::{BlockId, ServerInfo, ShuffleBlock};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::buffer::{BlockBatch, build_batches};
use crate::config::DispatchOptions;
use crate::memory::TaskMemory;
use crate::session::{BlockSendStatus, ShuffleSession, TaskSendState};

/// Final state of every block of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub acked: Vec<BlockId>,
    pub failed: Vec<BlockId>,
    /// Servers that gave up on this batch, with their last status.
    pub server_failures: Vec<(ServerInfo, StatusCode)>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A batch on its way to the servers.
pub struct SendHandle {
    block_ids: Vec<BlockId>,
    /// Uncompressed length of each block, released if the send task dies.
    lengths: Vec<u64>,
    state: Arc<TaskSendState>,
    memory: Arc<TaskMemory>,
    handle: JoinHandle<BatchOutcome>,
}

impl SendHandle {
    pub fn block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop sending the batch. Its blocks settle as failed on [`wait`](Self::wait).
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait for the batch. A send task that panicked or was aborted fails
    /// every block it had not settled yet.
    pub async fn wait(self) -> BatchOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, blocks = self.block_ids.len(), "send task aborted");
                let mut outcome = BatchOutcome::default();
                for (id, length) in self.block_ids.into_iter().zip(self.lengths) {
                    if self.state.mark_failed(id) {
                        self.memory.release(length);
                        outcome.failed.push(id);
                    } else if self.state.is_success(id) {
                        outcome.acked.push(id);
                    } else {
                        outcome.failed.push(id);
                    }
                }
                outcome
            }
        }
    }
}

/// Exponential backoff between send attempts.
fn backoff(options: &DispatchOptions, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    options
        .retry_interval
        .saturating_mul(factor)
        .min(options.retry_interval_max)
}

/// Sends spilled blocks to every server of their replica sets.
///
/// Each batch runs as its own tokio task; at most `dispatch_pool_size`
/// batches are in flight. Results land in the task's [`TaskSendState`].
pub struct BlockDispatcher {
    client: Arc<dyn ShuffleServerClient>,
    session: Arc<ShuffleSession>,
    options: DispatchOptions,
    stage_attempt: u32,
    send_size_limit: u64,
    permits: Arc<Semaphore>,
}

impl BlockDispatcher {
    pub fn new(
        client: Arc<dyn ShuffleServerClient>,
        session: Arc<ShuffleSession>,
        options: DispatchOptions,
        stage_attempt: u32,
        send_size_limit: u64,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(options.dispatch_pool_size.max(1)));
        Self {
            client,
            session,
            options,
            stage_attempt,
            send_size_limit,
            permits,
        }
    }

    pub fn session(&self) -> &Arc<ShuffleSession> {
        &self.session
    }

    /// Queue blocks for delivery and return at once.
    ///
    /// Memory of each block is released to `memory` when the block settles.
    pub fn dispatch(
        &self,
        task_id: &str,
        blocks: Vec<ShuffleBlock>,
        memory: Arc<TaskMemory>,
    ) -> Vec<SendHandle> {
        if blocks.is_empty() {
            return Vec::new();
        }
        let state = self.session.task(task_id);
        for block in &blocks {
            state.mark_dispatched(block.block_id);
        }

        if self.session.is_task_failed(task_id) {
            warn!(task_id, blocks = blocks.len(), "task already failed, dropping blocks");
            for block in &blocks {
                if state.mark_failed(block.block_id) {
                    memory.release(block.uncompressed_length as u64);
                }
            }
            return Vec::new();
        }

        build_batches(blocks, self.send_size_limit)
            .into_iter()
            .map(|batch| {
                let block_ids = batch.blocks.iter().map(|b| b.block_id).collect();
                let lengths = batch
                    .blocks
                    .iter()
                    .map(|b| b.uncompressed_length as u64)
                    .collect();
                let send = BatchSend {
                    client: Arc::clone(&self.client),
                    state: Arc::clone(&state),
                    memory: Arc::clone(&memory),
                    options: self.options.clone(),
                    app_id: self.session.app_id().to_string(),
                    shuffle_id: self.session.shuffle_id(),
                    stage_attempt: self.stage_attempt,
                    task_id: task_id.to_string(),
                };
                let permits = Arc::clone(&self.permits);
                let handle = tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    send.run(batch).await
                });
                SendHandle {
                    block_ids,
                    lengths,
                    state: Arc::clone(&state),
                    memory: Arc::clone(&memory),
                    handle,
                }
            })
            .collect()
    }
}

struct BatchSend {
    client: Arc<dyn ShuffleServerClient>,
    state: Arc<TaskSendState>,
    memory: Arc<TaskMemory>,
    options: DispatchOptions,
    app_id: String,
    shuffle_id: u32,
    stage_attempt: u32,
    task_id: String,
}

impl BatchSend {
    async fn run(self, batch: BlockBatch) -> BatchOutcome {
        let mut per_server: BTreeMap<ServerInfo, Vec<ShuffleBlock>> = BTreeMap::new();
        for block in &batch.blocks {
            for server in &block.replicas {
                per_server
                    .entry(server.clone())
                    .or_default()
                    .push(block.clone());
            }
        }

        let this = &self;
        let sends = per_server.into_iter().map(|(server, blocks)| async move {
            let ids: Vec<BlockId> = blocks.iter().map(|b| b.block_id).collect();
            let result = this.send_with_retry(&server, blocks).await;
            (server, ids, result)
        });
        let results = futures::future::join_all(sends).await;

        let mut acks: HashMap<BlockId, usize> = HashMap::new();
        let mut failures: HashMap<BlockId, Vec<(ServerInfo, StatusCode)>> = HashMap::new();
        let mut outcome = BatchOutcome::default();
        for (server, ids, result) in results {
            match result {
                Ok(()) => {
                    for id in ids {
                        *acks.entry(id).or_default() += 1;
                    }
                }
                Err(status) => {
                    for id in ids {
                        failures
                            .entry(id)
                            .or_default()
                            .push((server.clone(), status));
                    }
                    outcome.server_failures.push((server, status));
                }
            }
        }

        for block in &batch.blocks {
            let id = block.block_id;
            let required = self.options.replica_write.min(block.replicas.len()).max(1);
            let acked = acks.get(&id).copied().unwrap_or(0);
            let settled = if acked >= required {
                outcome.acked.push(id);
                self.state.mark_success(id)
            } else {
                for (server, status) in failures.remove(&id).unwrap_or_default() {
                    self.state.tracker().record(id, server, status);
                }
                outcome.failed.push(id);
                self.state.mark_failed(id)
            };
            if settled {
                self.memory.release(block.uncompressed_length as u64);
            }
        }

        debug!(
            task_id = %self.task_id,
            acked = outcome.acked.len(),
            failed = outcome.failed.len(),
            "batch settled"
        );
        outcome
    }

    /// Send to one server, retrying with backoff. Returns the last failure
    /// status if every attempt failed.
    async fn send_with_retry(&self, server: &ServerInfo, blocks: Vec<ShuffleBlock>) -> Result<(), StatusCode> {
        let request = SendShuffleDataRequest {
            app_id: self.app_id.clone(),
            shuffle_id: self.shuffle_id,
            stage_attempt: self.stage_attempt,
            blocks,
        };
        let attempts = self.options.retry_max.max(1);
        let mut last = StatusCode::InternalError;

        for attempt in 0..attempts {
            self.set_status(&request.blocks, BlockSendStatus::Sent);
            let status = match self.client.send_shuffle_data(server, request.clone()).await {
                Ok(response) if response.status.is_success() => return Ok(()),
                Ok(response) => response.status,
                Err(e) => e.status(),
            };
            last = status;
            warn!(
                task_id = %self.task_id,
                %server,
                %status,
                attempt,
                blocks = request.blocks.len(),
                "send failed"
            );
            if attempt + 1 < attempts {
                self.set_status(&request.blocks, BlockSendStatus::Retry);
                tokio::time::sleep(backoff(&self.options, attempt)).await;
            }
        }
        Err(last)
    }

    fn set_status(&self, blocks: &[ShuffleBlock], status: BlockSendStatus) {
        for block in blocks {
            self.state.set_status(block.block_id, status);
        }
    }
}
