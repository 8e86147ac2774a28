//! Segment-based read-back of one partition across storage tiers.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashSet;
use eddy_types::{BlockId, ExpectedBlockSet, PartitionKey, PartitionRange, ShuffleBlock};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::segment::{DataSegment, split_segments};
use crate::traits::{ShuffleFileKey, ShuffleStorage};

/// Where one block sits inside a [`ShuffleDataResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSegment {
    pub block_id: BlockId,
    /// Offset relative to the start of the result's bytes.
    pub offset: u64,
    pub length: u32,
    pub uncompressed_length: u32,
    pub crc: u64,
    pub task_attempt_id: u64,
}

/// One read: a span of data file bytes plus the blocks it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleDataResult {
    pub data: Bytes,
    pub buffer_segments: Vec<BufferSegment>,
}

impl ShuffleDataResult {
    pub fn is_empty(&self) -> bool {
        self.buffer_segments.is_empty()
    }

    /// Bytes of one block of this result.
    pub fn block(&self, segment: &BufferSegment) -> Bytes {
        let start = segment.offset as usize;
        self.data.slice(start..start + segment.length as usize)
    }

    /// Check every block against its recorded CRC32.
    pub fn verify(&self) -> Result<(), StoreError> {
        for segment in &self.buffer_segments {
            let actual = ShuffleBlock::checksum(&self.block(segment));
            if actual != segment.crc {
                return Err(StoreError::Corrupt {
                    block_id: segment.block_id,
                    expected: segment.crc,
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Tunables of a [`SegmentReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentReadOptions {
    /// Upper bound on the bytes fetched by one read, unless a single block is larger.
    pub read_buffer_size: u64,
    /// Partitions per persisted file pair; must match the writing servers.
    pub partition_range_width: u32,
}

impl Default for SegmentReadOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 14 * 1024 * 1024,
            partition_range_width: 1,
        }
    }
}

/// Lazily reads the expected blocks of one partition.
///
/// Tiers are scanned in the order given. Within a tier every file pair of
/// the partition's range is read index first, split into segments, and
/// handed out one segment per call. Blocks outside the expected set or
/// already in the shared processed set are skipped. Once everything is
/// consumed the reader returns `None` forever.
pub struct SegmentReader {
    tiers: Vec<Arc<dyn ShuffleStorage>>,
    partition: PartitionKey,
    range: PartitionRange,
    read_buffer_size: u64,
    expected: Arc<ExpectedBlockSet>,
    processed: Arc<DashSet<BlockId>>,
    next_tier: usize,
    tier: Option<Arc<dyn ShuffleStorage>>,
    files: VecDeque<ShuffleFileKey>,
    segments: VecDeque<(ShuffleFileKey, DataSegment)>,
    exhausted: bool,
}

impl SegmentReader {
    pub fn new(
        tiers: Vec<Arc<dyn ShuffleStorage>>,
        partition: PartitionKey,
        options: SegmentReadOptions,
        expected: Arc<ExpectedBlockSet>,
        processed: Arc<DashSet<BlockId>>,
    ) -> Self {
        let range = PartitionRange::containing(partition.partition_id, options.partition_range_width);
        Self {
            tiers,
            partition,
            range,
            read_buffer_size: options.read_buffer_size,
            expected,
            processed,
            next_tier: 0,
            tier: None,
            files: VecDeque::new(),
            segments: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Next batch of unread expected blocks, or `None` when nothing is left.
    #[tracing::instrument(skip(self), fields(partition = %self.partition))]
    pub async fn read_shuffle_data(&mut self) -> Result<Option<ShuffleDataResult>, StoreError> {
        loop {
            if self.exhausted {
                return Ok(None);
            }
            if let Some((file, segment)) = self.segments.pop_front() {
                if let Some(result) = self.read_segment(&file, segment).await? {
                    return Ok(Some(result));
                }
                continue;
            }
            if let Some(file) = self.files.pop_front() {
                self.load_index(file).await;
                continue;
            }
            if !self.advance_tier().await {
                debug!("all tiers read");
                self.exhausted = true;
            }
        }
    }

    async fn advance_tier(&mut self) -> bool {
        while let Some(tier) = self.tiers.get(self.next_tier).cloned() {
            self.next_tier += 1;
            match tier
                .list_files(&self.partition.app_id, self.partition.shuffle_id, self.range)
                .await
            {
                Ok(files) => {
                    debug!(tier = %tier.kind(), files = files.len(), "scanning tier");
                    self.files = files.into();
                    self.tier = Some(tier);
                    return true;
                }
                Err(e) => {
                    warn!(tier = %tier.kind(), error = %e, "failed to list tier, skipping it");
                }
            }
        }
        false
    }

    async fn load_index(&mut self, file: ShuffleFileKey) {
        let Some(tier) = self.tier.clone() else {
            return;
        };
        let index = match tier.read_index(&file).await {
            Ok(index) => index,
            Err(e) => {
                warn!(%file, error = %e, "failed to read index, skipping file");
                return;
            }
        };

        let expected = &self.expected;
        let processed = &self.processed;
        let segments = split_segments(&index.entries, index.data_len, self.read_buffer_size, |e| {
            expected.contains(e.block_id) && !processed.contains(&e.block_id)
        });
        debug!(%file, entries = index.entries.len(), segments = segments.len(), "split index");
        self.segments
            .extend(segments.into_iter().map(|s| (file.clone(), s)));
    }

    async fn read_segment(
        &mut self,
        file: &ShuffleFileKey,
        segment: DataSegment,
    ) -> Result<Option<ShuffleDataResult>, StoreError> {
        let pending: Vec<_> = segment
            .blocks
            .iter()
            .filter(|e| !self.processed.contains(&e.block_id))
            .copied()
            .collect();
        if pending.is_empty() {
            return Ok(None);
        }
        let Some(tier) = self.tier.clone() else {
            return Ok(None);
        };

        let data = tier
            .read_data(file, segment.offset, segment.length)
            .await?;

        let buffer_segments = pending
            .iter()
            .map(|e| BufferSegment {
                block_id: e.block_id,
                offset: e.offset - segment.offset,
                length: e.length,
                uncompressed_length: e.uncompressed_length,
                crc: e.crc,
                task_attempt_id: e.task_attempt_id,
            })
            .collect();
        for entry in &pending {
            self.processed.insert(entry.block_id);
        }

        Ok(Some(ShuffleDataResult {
            data,
            buffer_segments,
        }))
    }
}
