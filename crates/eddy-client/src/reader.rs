//! Read-back of one partition from its replicas.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashSet;
use eddy_rpc::{GetShuffleResultRequest, RpcError, ShuffleServerClient};
use eddy_store::{SegmentReader, ShuffleStorage, StoreError};
use eddy_types::{BlockId, ExpectedBlockSet, PartitionKey, ServerInfo};
use tracing::{debug, warn};

use crate::codec::BlockCodec;
use crate::config::ReadOptions;
use crate::error::ClientError;

/// A replica server together with the storage tiers it flushes to.
#[derive(Clone)]
pub struct ReplicaSource {
    pub server: ServerInfo,
    /// Tiers in precedence order.
    pub tiers: Vec<Arc<dyn ShuffleStorage>>,
}

/// One decoded block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlock {
    pub block_id: BlockId,
    pub task_attempt_id: u64,
    pub data: Bytes,
}

/// Reads every expected block of a partition exactly once.
///
/// The expected set is the union of what the replicas report. Replicas are
/// read in order with a shared processed set, so a block found on the first
/// replica is skipped on the others and a replica that fails midway is
/// completed from the next one.
pub struct ShuffleReadClient {
    client: Arc<dyn ShuffleServerClient>,
    codec: Arc<dyn BlockCodec>,
    options: ReadOptions,
    partition: PartitionKey,
    replicas: Vec<ReplicaSource>,
}

impl ShuffleReadClient {
    pub fn new(
        client: Arc<dyn ShuffleServerClient>,
        codec: Arc<dyn BlockCodec>,
        options: ReadOptions,
        partition: PartitionKey,
        replicas: Vec<ReplicaSource>,
    ) -> Self {
        Self {
            client,
            codec,
            options,
            partition,
            replicas,
        }
    }

    /// Union of the block ids the replicas recorded for the partition.
    ///
    /// Replicas that fail are skipped; the call fails only if all do.
    pub async fn fetch_expected_blocks(&self) -> Result<ExpectedBlockSet, ClientError> {
        let mut expected = ExpectedBlockSet::new();
        let mut last_error: Option<RpcError> = None;
        let mut answered = 0;
        for replica in &self.replicas {
            let request = GetShuffleResultRequest {
                app_id: self.partition.app_id.clone(),
                shuffle_id: self.partition.shuffle_id,
                partition_id: self.partition.partition_id,
            };
            match self.client.get_shuffle_result(&replica.server, request).await {
                Ok(set) => {
                    expected.union_with(&set);
                    answered += 1;
                }
                Err(e) => {
                    warn!(server = %replica.server, partition = %self.partition, error = %e, "could not fetch shuffle result");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if answered == 0 => Err(e.into()),
            _ => Ok(expected),
        }
    }

    /// Read and decode every expected block.
    #[tracing::instrument(skip(self), fields(partition = %self.partition))]
    pub async fn read(&self) -> Result<Vec<ReadBlock>, ClientError> {
        let expected = Arc::new(self.fetch_expected_blocks().await?);
        let processed: Arc<DashSet<BlockId>> = Arc::new(DashSet::new());
        let mut blocks = Vec::new();

        for replica in &self.replicas {
            if processed.len() as u64 >= expected.len() {
                break;
            }
            let mut reader = SegmentReader::new(
                replica.tiers.clone(),
                self.partition.clone(),
                self.options.segment,
                Arc::clone(&expected),
                Arc::clone(&processed),
            );
            if let Err(e) = self.drain(&mut reader, &mut blocks).await {
                match e {
                    ClientError::Store(e) => {
                        warn!(server = %replica.server, error = %e, "replica read failed, trying next replica");
                    }
                    other => return Err(other),
                }
            }
        }

        let missing: Vec<BlockId> = expected
            .iter()
            .filter(|id| !processed.contains(id))
            .collect();
        if let Some(first) = missing.first() {
            return Err(ClientError::ReadIncomplete {
                partition_id: self.partition.partition_id,
                missing: missing.len() as u64,
                first: *first,
            });
        }
        debug!(blocks = blocks.len(), "partition read complete");
        Ok(blocks)
    }

    async fn drain(&self, reader: &mut SegmentReader, out: &mut Vec<ReadBlock>) -> Result<(), ClientError> {
        while let Some(result) = reader.read_shuffle_data().await? {
            if self.options.verify_checksums {
                result.verify().map_err(|e| match e {
                    StoreError::Corrupt { block_id, .. } => ClientError::ChecksumMismatch { block_id },
                    other => ClientError::Store(other),
                })?;
            }
            for segment in &result.buffer_segments {
                let data = self
                    .codec
                    .decode(result.block(segment), segment.uncompressed_length)?;
                out.push(ReadBlock {
                    block_id: segment.block_id,
                    task_attempt_id: segment.task_attempt_id,
                    data,
                });
            }
        }
        Ok(())
    }
}
