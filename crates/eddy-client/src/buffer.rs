//! Per-partition write buffers and spilling.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use eddy_types::{ReplicaAssignment, ShuffleBlock};
use tracing::debug;

use crate::codec::{BlockCodec, RecordSerializer};
use crate::config::BufferOptions;
use crate::error::ClientError;
use crate::memory::TaskMemory;

/// Serialized records of one partition, waiting to be spilled.
#[derive(Debug, Default)]
pub struct PartitionBuffer {
    data: BytesMut,
    /// End offset of every record, so spills cut between records.
    record_ends: Vec<usize>,
}

impl PartitionBuffer {
    fn append(&mut self, record: &[u8]) {
        self.data.extend_from_slice(record);
        self.record_ends.push(self.data.len());
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.record_ends.len()
    }

    /// Split into chunks of at most `max` bytes, each holding whole records.
    /// A record larger than `max` becomes a chunk of its own.
    fn into_chunks(self, max: u64) -> Vec<(Bytes, u32)> {
        let data = self.data.freeze();
        let mut chunks = Vec::new();
        let mut start = 0;
        let mut end = 0;
        let mut records = 0u32;
        for record_end in self.record_ends {
            if records > 0 && (record_end - start) as u64 > max {
                chunks.push((data.slice(start..end), records));
                start = end;
                records = 0;
            }
            end = record_end;
            records += 1;
        }
        if records > 0 {
            chunks.push((data.slice(start..end), records));
        }
        chunks
    }
}

/// Timing and volume counters of one task's buffering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteMetrics {
    pub spill_count: u64,
    pub bytes_spilled: u64,
    pub serialize_time: Duration,
    pub copy_time: Duration,
    pub acquire_time: Duration,
}

/// Blocks sent together in one request per server.
#[derive(Debug, Clone)]
pub struct BlockBatch {
    pub blocks: Vec<ShuffleBlock>,
    pub size: u64,
}

/// Coalesce blocks into batches of at most `send_size_limit` bytes,
/// keeping their order. A block above the limit travels alone.
pub fn build_batches(blocks: Vec<ShuffleBlock>, send_size_limit: u64) -> Vec<BlockBatch> {
    let mut batches = Vec::new();
    let mut current = BlockBatch {
        blocks: Vec::new(),
        size: 0,
    };
    for block in blocks {
        let length = block.length() as u64;
        if !current.blocks.is_empty() && current.size + length > send_size_limit {
            batches.push(std::mem::replace(
                &mut current,
                BlockBatch {
                    blocks: Vec::new(),
                    size: 0,
                },
            ));
        }
        current.size += length;
        current.blocks.push(block);
    }
    if !current.blocks.is_empty() {
        batches.push(current);
    }
    batches
}

/// Owns the partition buffers of one write task.
pub struct WriteBufferManager {
    shuffle_id: u32,
    task_attempt_id: u64,
    options: BufferOptions,
    assignment: Arc<ReplicaAssignment>,
    serializer: Arc<dyn RecordSerializer>,
    codec: Arc<dyn BlockCodec>,
    memory: Arc<TaskMemory>,
    buffers: BTreeMap<u32, PartitionBuffer>,
    sequences: HashMap<u32, u64>,
    scratch: BytesMut,
    record_count: u64,
    block_count: u64,
    metrics: WriteMetrics,
}

impl WriteBufferManager {
    pub fn new(
        shuffle_id: u32,
        task_attempt_id: u64,
        options: BufferOptions,
        assignment: Arc<ReplicaAssignment>,
        serializer: Arc<dyn RecordSerializer>,
        codec: Arc<dyn BlockCodec>,
        memory: Arc<TaskMemory>,
    ) -> Self {
        Self {
            shuffle_id,
            task_attempt_id,
            options,
            assignment,
            serializer,
            codec,
            memory,
            buffers: BTreeMap::new(),
            sequences: HashMap::new(),
            scratch: BytesMut::new(),
            record_count: 0,
            block_count: 0,
            metrics: WriteMetrics::default(),
        }
    }

    /// Buffer one record. Returns the blocks spilled because of it.
    pub async fn add_record(
        &mut self,
        partition_id: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<Vec<ShuffleBlock>, ClientError> {
        if self.assignment.replicas(partition_id).is_none() {
            return Err(ClientError::NoAssignment(partition_id));
        }

        let start = Instant::now();
        self.scratch.clear();
        self.serializer.serialize(key, value, &mut self.scratch);
        self.metrics.serialize_time += start.elapsed();

        let start = Instant::now();
        self.memory.acquire(self.scratch.len() as u64).await?;
        self.metrics.acquire_time += start.elapsed();

        let start = Instant::now();
        let buffer = self.buffers.entry(partition_id).or_default();
        buffer.append(&self.scratch);
        let buffer_len = buffer.len();
        self.metrics.copy_time += start.elapsed();
        self.record_count += 1;

        let mut blocks = Vec::new();
        if buffer_len > self.options.buffer_size {
            blocks.extend(self.spill(partition_id)?);
        }
        if self.buffered_bytes() > self.options.spill_size {
            blocks.extend(self.clear(self.options.spill_ratio)?);
        }
        Ok(blocks)
    }

    /// Spill the largest buffers until `ratio` of the buffered bytes are
    /// spilled. A ratio of 1.0 or more spills everything.
    pub fn clear(&mut self, ratio: f64) -> Result<Vec<ShuffleBlock>, ClientError> {
        let total = self.buffered_bytes();
        let target = if ratio >= 1.0 {
            total
        } else {
            (total as f64 * ratio.max(0.0)) as u64
        };

        let mut sizes: Vec<(u32, u64)> = self.buffers.iter().map(|(p, b)| (*p, b.len())).collect();
        sizes.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut spilled = 0;
        let mut blocks = Vec::new();
        for (partition_id, size) in sizes {
            if spilled >= target {
                break;
            }
            blocks.extend(self.spill(partition_id)?);
            spilled += size;
        }
        debug!(
            shuffle_id = self.shuffle_id,
            task_attempt_id = self.task_attempt_id,
            ratio,
            spilled,
            blocks = blocks.len(),
            "cleared buffers"
        );
        Ok(blocks)
    }

    /// Turn a partition buffer into blocks. Memory stays held until the
    /// dispatcher settles the blocks.
    fn spill(&mut self, partition_id: u32) -> Result<Vec<ShuffleBlock>, ClientError> {
        let Some(buffer) = self.buffers.remove(&partition_id) else {
            return Ok(Vec::new());
        };
        let replicas = self
            .assignment
            .replicas(partition_id)
            .map(<[_]>::to_vec)
            .ok_or(ClientError::NoAssignment(partition_id))?;

        let spilled = buffer.len();
        let mut blocks = Vec::new();
        for (raw, record_count) in buffer.into_chunks(self.options.max_block_size) {
            let sequence = self.sequences.entry(partition_id).or_insert(0);
            let block_id = self.options.block_id_layout.block_id(
                *sequence,
                partition_id,
                self.task_attempt_id,
            )?;
            *sequence += 1;

            let uncompressed_length = raw.len() as u32;
            let data = self.codec.encode(raw);
            blocks.push(ShuffleBlock {
                shuffle_id: self.shuffle_id,
                partition_id,
                block_id,
                task_attempt_id: self.task_attempt_id,
                crc: ShuffleBlock::checksum(&data),
                data,
                uncompressed_length,
                record_count,
                replicas: replicas.clone(),
            });
        }

        self.block_count += blocks.len() as u64;
        self.metrics.spill_count += 1;
        self.metrics.bytes_spilled += spilled;
        Ok(blocks)
    }

    /// Release all memory the task holds.
    pub fn free_all_memory(&self) -> u64 {
        self.memory.release_all()
    }

    pub fn memory(&self) -> &Arc<TaskMemory> {
        &self.memory
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffers.values().map(PartitionBuffer::len).sum()
    }

    /// Partition buffers not spilled yet.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn metrics(&self) -> WriteMetrics {
        self.metrics
    }

    pub fn send_size_limit(&self) -> u64 {
        self.options.send_size_limit
    }
}
