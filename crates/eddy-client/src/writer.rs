//! The write side of one task.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use eddy_types::{BlockId, ServerInfo, ShuffleBlock};
use tracing::{info, warn};

use crate::buffer::{WriteBufferManager, WriteMetrics};
use crate::commit::{CommitCoordinator, ServerBlockMap};
use crate::dispatch::{BlockDispatcher, SendHandle};
use crate::error::ClientError;

/// One key/value pair handed to a writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
}

impl Record {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Maps a record key to a partition.
pub trait Partitioner: Send + Sync {
    fn partition_count(&self) -> u32;

    fn partition(&self, key: &[u8]) -> u32;
}

/// CRC32 of the key modulo the partition count.
#[derive(Debug, Clone, Copy)]
pub struct HashPartitioner {
    partitions: u32,
}

impl HashPartitioner {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }
}

impl Partitioner for HashPartitioner {
    fn partition_count(&self) -> u32 {
        self.partitions
    }

    fn partition(&self, key: &[u8]) -> u32 {
        if self.partitions == 1 {
            return 0;
        }
        crc32fast::hash(key) % self.partitions
    }
}

/// Identity of the task a writer runs for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub task_id: String,
    pub task_attempt_id: u64,
    pub shuffle_id: u32,
    /// Write tasks in the stage, passed to the servers on commit.
    pub expected_task_count: u32,
}

/// What a successful task hands to the downstream reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapOutput {
    pub task_attempt_id: u64,
    pub partition_to_block_ids: BTreeMap<u32, BTreeSet<BlockId>>,
    pub metrics: WriteMetrics,
    pub write_time: Duration,
}

/// Buffers, dispatches and commits the records of one write task.
///
/// Call [`write`](Self::write) with every record, then
/// [`stop`](Self::stop) exactly once. `stop` frees the task's memory and
/// send state on every path, as does dropping the writer.
pub struct ShuffleWriter {
    context: TaskContext,
    manager: WriteBufferManager,
    dispatcher: Arc<BlockDispatcher>,
    coordinator: Arc<CommitCoordinator>,
    partitioner: Arc<dyn Partitioner>,
    block_ids: HashSet<BlockId>,
    server_blocks: ServerBlockMap,
    data_servers: BTreeSet<ServerInfo>,
    handles: Vec<SendHandle>,
    report_failed: BTreeSet<ServerInfo>,
    write_time: Duration,
}

impl ShuffleWriter {
    /// `data_servers` are the servers of the stage's assignment; all of them
    /// get the finish call.
    pub fn new(
        context: TaskContext,
        manager: WriteBufferManager,
        dispatcher: Arc<BlockDispatcher>,
        coordinator: Arc<CommitCoordinator>,
        partitioner: Arc<dyn Partitioner>,
        data_servers: BTreeSet<ServerInfo>,
    ) -> Self {
        Self {
            context,
            manager,
            dispatcher,
            coordinator,
            partitioner,
            block_ids: HashSet::new(),
            server_blocks: ServerBlockMap::new(),
            data_servers,
            handles: Vec::new(),
            report_failed: BTreeSet::new(),
            write_time: Duration::ZERO,
        }
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn metrics(&self) -> WriteMetrics {
        self.manager.metrics()
    }

    /// Block ids dispatched so far, per partition.
    pub fn partition_to_block_ids(&self) -> BTreeMap<u32, BTreeSet<BlockId>> {
        self.server_blocks.partition_to_block_ids()
    }

    /// Write every record, wait for delivery and commit the shuffle.
    ///
    /// On failure the task is marked failed, so later dispatches for it are
    /// dropped, and the error may be escalated to a stage retry.
    #[tracing::instrument(skip_all, fields(task_id = %self.context.task_id))]
    pub async fn write<I>(&mut self, records: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = Record>,
    {
        match self.write_impl(records).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.dispatcher
                    .session()
                    .mark_task_failed(&self.context.task_id);
                Err(self
                    .coordinator
                    .escalate(&self.context.task_id, self.context.shuffle_id, e, &BTreeSet::new())
                    .await)
            }
        }
    }

    async fn write_impl<I>(&mut self, records: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = Record>,
    {
        let task_id = self.context.task_id.clone();
        let mut written = 0u64;
        for record in records {
            written += 1;
            let partition = self.partitioner.partition(&record.key);
            let blocks = self
                .manager
                .add_record(partition, &record.key, &record.value)
                .await?;
            self.process_blocks(blocks);
        }

        let start = Instant::now();
        let blocks = self.manager.clear(1.0)?;
        self.process_blocks(blocks);

        let check_start = Instant::now();
        self.reap_finished_sends().await;
        self.coordinator
            .check_all_buffers_spilled(&task_id, self.manager.buffer_count())?;
        self.coordinator
            .check_record_count(&task_id, written, self.manager.record_count())?;
        self.coordinator
            .check_block_send_result(&task_id, self.block_ids.clone())
            .await?;
        self.coordinator.check_sent_block_count(
            &task_id,
            &self.block_ids,
            &self.server_blocks,
            self.manager.block_count(),
        )?;
        let check_time = check_start.elapsed();

        let commit_start = Instant::now();
        self.coordinator
            .send_commit(
                &self.data_servers,
                self.context.shuffle_id,
                self.context.expected_task_count,
            )
            .await?;
        let commit_time = commit_start.elapsed();

        // Handles of settled batches carry nothing the task state lacks.
        self.handles.clear();

        let metrics = self.manager.metrics();
        self.write_time += metrics.serialize_time + metrics.copy_time + metrics.acquire_time + start.elapsed();
        info!(
            task_id,
            shuffle_id = self.context.shuffle_id,
            records = written,
            blocks = self.block_ids.len(),
            write_ms = self.write_time.as_millis() as u64,
            check_ms = check_time.as_millis() as u64,
            commit_ms = commit_time.as_millis() as u64,
            spills = metrics.spill_count,
            bytes_spilled = metrics.bytes_spilled,
            "finished writing shuffle"
        );
        Ok(())
    }

    /// Collect batches whose send task already ended, so a task that died
    /// settles its blocks as failed instead of leaving them pending.
    async fn reap_finished_sends(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.handles)
            .into_iter()
            .partition(SendHandle::is_finished);
        self.handles = running;
        for handle in finished {
            handle.wait().await;
        }
    }

    fn process_blocks(&mut self, blocks: Vec<ShuffleBlock>) {
        if blocks.is_empty() {
            return;
        }
        for block in &blocks {
            self.block_ids.insert(block.block_id);
            self.server_blocks.record(block);
        }
        let handles = self.dispatcher.dispatch(
            &self.context.task_id,
            blocks,
            Arc::clone(self.manager.memory()),
        );
        self.handles.extend(handles);
    }

    /// Finish the task. On success the block ids are reported to every
    /// server and returned; the task's memory and send state are released
    /// whatever happens.
    #[tracing::instrument(skip(self), fields(task_id = %self.context.task_id))]
    pub async fn stop(&mut self, success: bool) -> Result<Option<MapOutput>, ClientError> {
        let result = if success {
            self.report().await
        } else {
            Ok(None)
        };
        self.cleanup();
        result
    }

    async fn report(&mut self) -> Result<Option<MapOutput>, ClientError> {
        let start = Instant::now();
        let mut report_failed = std::mem::take(&mut self.report_failed);
        let reported = self
            .coordinator
            .report_shuffle_result(
                &self.context.task_id,
                self.context.shuffle_id,
                self.context.task_attempt_id,
                &self.server_blocks,
                &mut report_failed,
            )
            .await;
        if let Err(e) = reported {
            let error = self
                .coordinator
                .escalate(&self.context.task_id, self.context.shuffle_id, e, &report_failed)
                .await;
            self.report_failed = report_failed;
            return Err(error);
        }
        self.write_time += start.elapsed();
        info!(
            task_id = %self.context.task_id,
            servers = self.server_blocks.servers().len(),
            report_ms = start.elapsed().as_millis() as u64,
            "reported shuffle result"
        );

        Ok(Some(MapOutput {
            task_attempt_id: self.context.task_attempt_id,
            partition_to_block_ids: self.server_blocks.partition_to_block_ids(),
            metrics: self.manager.metrics(),
            write_time: self.write_time,
        }))
    }

    fn cleanup(&mut self) {
        let released = self.manager.free_all_memory();
        self.dispatcher
            .session()
            .clear_task_meta(&self.context.task_id);
        if !self.handles.is_empty() {
            warn!(
                task_id = %self.context.task_id,
                in_flight = self.handles.len(),
                released,
                "stopping with sends in flight"
            );
            self.handles.clear();
        }
    }
}

impl Drop for ShuffleWriter {
    fn drop(&mut self) {
        self.manager.free_all_memory();
        self.dispatcher
            .session()
            .clear_task_meta(&self.context.task_id);
    }
}
