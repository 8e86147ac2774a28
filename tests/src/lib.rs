//! Shared test harness for Eddy integration tests.
//!
//! Provides [`IntegrationCluster`], N shuffle servers behind a
//! [`LocalShuffleClient`], and [`ShuffleJob`], which runs map tasks through
//! the full client pipeline: buffering → dispatch → commit → report →
//! read-back. Every storage tier is wrapped in a [`FaultyTier`] so tests can
//! break individual tiers.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eddy_client::{
    BlockDispatcher, BufferOptions, ClientError, CommitCoordinator, CommitOptions,
    DispatchOptions, HashPartitioner, IdentityCodec, LengthPrefixedSerializer, MapOutput,
    MemoryPool, ReadBlock, ReadOptions, Record, RecordSerializer, ReplicaSource,
    ShuffleReadClient, ShuffleSession, ShuffleWriter, TaskContext, TaskMemory,
    WriteBufferManager,
};
use eddy_placement::Ring;
use eddy_rpc::{ClusterAuthority, RpcError, WriteFailureReport};
use eddy_server::{LocalShuffleClient, ServerConfig, ShuffleServer};
use eddy_store::{FaultyTier, LocalFileTier, MemoryTier, RemoteTier, ShuffleStorage};
use eddy_types::{PartitionKey, ReplicaAssignment, ServerInfo, StorageTierKind};
use object_store::memory::InMemory;
use tempfile::TempDir;

pub const APP: &str = "app";

// =========================================================================
// Cluster
// =========================================================================

/// Per-server setup of an [`IntegrationCluster`].
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Tier list, hottest first, e.g. `"MEMORY_LOCALFILE"`.
    pub tiers: String,
    pub memory_tier_bytes: u64,
    pub local_tier_bytes: u64,
    pub server: ServerConfig,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            tiers: "MEMORY_LOCALFILE".to_string(),
            memory_tier_bytes: 64 * 1024 * 1024,
            local_tier_bytes: 1024 * 1024 * 1024,
            server: ServerConfig {
                buffer_capacity: 16 * 1024 * 1024,
                flush_interval: Duration::from_millis(20),
                ..ServerConfig::default()
            },
        }
    }
}

/// N in-process shuffle servers sharing one remote store.
pub struct IntegrationCluster {
    client: Arc<LocalShuffleClient>,
    servers: Vec<Arc<ShuffleServer>>,
    tiers: Vec<HashMap<StorageTierKind, Arc<FaultyTier>>>,
    ring: Ring,
    _dir: TempDir,
}

impl IntegrationCluster {
    pub async fn new(count: u16) -> Self {
        Self::with_options(count, ClusterOptions::default()).await
    }

    pub async fn with_options(count: u16, options: ClusterOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let kinds = StorageTierKind::parse_list(&options.tiers).unwrap();
        let remote = Arc::new(InMemory::new());
        let client = Arc::new(LocalShuffleClient::new());
        let mut ring = Ring::new(64);
        let mut servers = Vec::new();
        let mut tiers = Vec::new();

        for i in 0..count {
            let info = ServerInfo::new(format!("server-{i}"), "127.0.0.1", 21_000 + i);
            let mut by_kind = HashMap::new();
            let mut list: Vec<Arc<dyn ShuffleStorage>> = Vec::new();
            for kind in &kinds {
                let inner: Arc<dyn ShuffleStorage> = match kind {
                    StorageTierKind::Memory => Arc::new(MemoryTier::new(options.memory_tier_bytes)),
                    StorageTierKind::LocalFile => Arc::new(
                        LocalFileTier::new(dir.path().join(&info.id), options.local_tier_bytes)
                            .unwrap(),
                    ),
                    StorageTierKind::Remote => {
                        Arc::new(RemoteTier::new(remote.clone(), info.id.as_str()))
                    }
                };
                let tier = Arc::new(FaultyTier::new(inner));
                list.push(tier.clone());
                by_kind.insert(*kind, tier);
            }

            let server = ShuffleServer::new(info.clone(), options.server.clone(), list).unwrap();
            server.start_background_flush();
            client.add_server(server.clone()).await;
            ring.add_server(info);
            servers.push(server);
            tiers.push(by_kind);
        }

        Self {
            client,
            servers,
            tiers,
            ring,
            _dir: dir,
        }
    }

    pub fn client(&self) -> &Arc<LocalShuffleClient> {
        &self.client
    }

    pub fn server(&self, i: usize) -> &Arc<ShuffleServer> {
        &self.servers[i]
    }

    pub fn info(&self, i: usize) -> &ServerInfo {
        self.servers[i].info()
    }

    pub fn index_of(&self, info: &ServerInfo) -> usize {
        self.servers
            .iter()
            .position(|s| s.info() == info)
            .unwrap()
    }

    /// The fault-injecting wrapper of one tier of server `i`.
    pub fn tier(&self, i: usize, kind: StorageTierKind) -> &Arc<FaultyTier> {
        &self.tiers[i][&kind]
    }

    /// Bytes stored in one tier kind across all servers.
    pub async fn stored_bytes(&self, kind: StorageTierKind) -> u64 {
        let mut total = 0;
        for tiers in &self.tiers {
            if let Some(tier) = tiers.get(&kind) {
                total += tier.capacity().await.unwrap().used_bytes;
            }
        }
        total
    }

    /// Make server `i` unreachable for every call.
    pub async fn kill_server(&self, i: usize) {
        self.client.set_down(self.info(i), true).await;
    }

    pub async fn revive_server(&self, i: usize) {
        self.client.set_down(self.info(i), false).await;
    }

    pub fn assign(&self, shuffle_id: u32, partitions: u32, replicas: usize) -> ReplicaAssignment {
        self.ring.assign(shuffle_id, partitions, replicas)
    }

    /// Assignment over every server except `excluded`.
    pub fn assign_without(
        &self,
        excluded: &BTreeSet<ServerInfo>,
        shuffle_id: u32,
        partitions: u32,
        replicas: usize,
    ) -> ReplicaAssignment {
        self.ring
            .without(excluded)
            .assign(shuffle_id, partitions, replicas)
    }

    /// Read back one partition from the replicas of `assignment`.
    pub async fn read_partition(
        &self,
        shuffle_id: u32,
        partition: u32,
        assignment: &ReplicaAssignment,
        options: ReadOptions,
    ) -> Result<Vec<ReadBlock>, ClientError> {
        let replicas = assignment
            .replicas(partition)
            .unwrap_or_default()
            .iter()
            .map(|info| {
                let server = &self.servers[self.index_of(info)];
                ReplicaSource {
                    server: info.clone(),
                    tiers: server.tiers().to_vec(),
                }
            })
            .collect();
        ShuffleReadClient::new(
            self.client.clone(),
            Arc::new(IdentityCodec),
            options,
            PartitionKey::new(APP, shuffle_id, partition),
            replicas,
        )
        .read()
        .await
    }

    /// Every record of a shuffle, read partition by partition.
    pub async fn read_all(
        &self,
        shuffle_id: u32,
        assignment: &ReplicaAssignment,
    ) -> Result<Vec<(u32, Record)>, ClientError> {
        let mut records = Vec::new();
        for (partition, _) in assignment.partitions() {
            let blocks = self
                .read_partition(shuffle_id, partition, assignment, ReadOptions::default())
                .await?;
            for record in decode_records(&blocks) {
                records.push((partition, record));
            }
        }
        Ok(records)
    }
}

// =========================================================================
// Jobs
// =========================================================================

/// Client-side tunables of a [`ShuffleJob`], sized for tests.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub buffer: BufferOptions,
    pub dispatch: DispatchOptions,
    pub commit: CommitOptions,
    pub memory_capacity: u64,
    pub stage_attempt: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            buffer: BufferOptions {
                buffer_size: 4 * 1024,
                max_block_size: 4 * 1024,
                spill_size: 256 * 1024,
                send_size_limit: 64 * 1024,
                memory_acquire_retries: 50,
                memory_acquire_interval: Duration::from_millis(10),
                ..BufferOptions::default()
            },
            dispatch: DispatchOptions {
                retry_max: 3,
                retry_interval: Duration::from_millis(5),
                retry_interval_max: Duration::from_millis(20),
                ..DispatchOptions::default()
            },
            commit: CommitOptions {
                send_check_interval: Duration::from_millis(10),
                send_check_timeout: Duration::from_secs(10),
                ..CommitOptions::default()
            },
            memory_capacity: 64 * 1024 * 1024,
            stage_attempt: 0,
        }
    }
}

/// The write side of one shuffle stage: shared session, dispatcher and
/// commit coordinator, one writer per map task.
pub struct ShuffleJob {
    pub shuffle_id: u32,
    pub assignment: Arc<ReplicaAssignment>,
    pub session: Arc<ShuffleSession>,
    pub pool: Arc<MemoryPool>,
    options: JobOptions,
    dispatcher: Arc<BlockDispatcher>,
    coordinator: Arc<CommitCoordinator>,
    partitions: u32,
    map_count: u32,
}

impl ShuffleJob {
    pub fn new(
        cluster: &IntegrationCluster,
        shuffle_id: u32,
        assignment: ReplicaAssignment,
        map_count: u32,
        options: JobOptions,
        authority: Option<Arc<dyn ClusterAuthority>>,
    ) -> Self {
        let session = Arc::new(ShuffleSession::new(APP, shuffle_id));
        let dispatcher = Arc::new(BlockDispatcher::new(
            cluster.client().clone(),
            session.clone(),
            options.dispatch.clone(),
            options.stage_attempt,
            options.buffer.send_size_limit,
        ));
        let coordinator = Arc::new(CommitCoordinator::new(
            cluster.client().clone(),
            authority,
            session.clone(),
            options.commit.clone(),
            1,
            options.stage_attempt,
        ));
        Self {
            shuffle_id,
            partitions: assignment.partition_count() as u32,
            assignment: Arc::new(assignment),
            session,
            pool: Arc::new(MemoryPool::new(options.memory_capacity)),
            options,
            dispatcher,
            coordinator,
            map_count,
        }
    }

    /// Writer of map task `map`. Its attempt id folds in the stage attempt so
    /// a resubmitted stage writes fresh block ids.
    pub fn writer(&self, map: u32) -> ShuffleWriter {
        let task_id = format!("map-{map}");
        let task_attempt_id = ((self.options.stage_attempt as u64) << 16) | map as u64;
        let memory = Arc::new(TaskMemory::new(
            task_id.clone(),
            self.pool.clone(),
            self.options.buffer.memory_acquire_retries,
            self.options.buffer.memory_acquire_interval,
        ));
        let manager = WriteBufferManager::new(
            self.shuffle_id,
            task_attempt_id,
            self.options.buffer.clone(),
            self.assignment.clone(),
            Arc::new(LengthPrefixedSerializer),
            Arc::new(IdentityCodec),
            memory,
        );
        ShuffleWriter::new(
            TaskContext {
                task_id,
                task_attempt_id,
                shuffle_id: self.shuffle_id,
                expected_task_count: self.map_count,
            },
            manager,
            self.dispatcher.clone(),
            self.coordinator.clone(),
            Arc::new(HashPartitioner::new(self.partitions)),
            self.assignment.servers(),
        )
    }

    /// Run one map task to completion. A failed task is stopped unsuccessfully.
    pub async fn run_map(&self, map: u32, records: Vec<Record>) -> Result<MapOutput, ClientError> {
        let mut writer = self.writer(map);
        if let Err(e) = writer.write(records).await {
            writer.stop(false).await?;
            return Err(e);
        }
        let output = writer.stop(true).await?;
        Ok(output.unwrap())
    }
}

// =========================================================================
// Cluster authority
// =========================================================================

/// Records write failure reports and answers with a fixed decision.
pub struct RecordingAuthority {
    resubmit: bool,
    reports: Mutex<Vec<WriteFailureReport>>,
}

impl RecordingAuthority {
    pub fn new(resubmit: bool) -> Self {
        Self {
            resubmit,
            reports: Mutex::new(Vec::new()),
        }
    }

    pub fn reports(&self) -> Vec<WriteFailureReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterAuthority for RecordingAuthority {
    async fn report_write_failure(&self, report: WriteFailureReport) -> Result<bool, RpcError> {
        self.reports.lock().unwrap().push(report);
        Ok(self.resubmit)
    }
}

// =========================================================================
// Data
// =========================================================================

/// Deterministic records of one map task: keys `m{map}-{i}`, seeded values.
pub fn map_records(map: u32, count: usize, value_size: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            let seed = map.wrapping_mul(1_000_003).wrapping_add(i as u32);
            Record::new(format!("m{map}-{i}"), test_data_seeded(value_size, seed))
        })
        .collect()
}

/// Decode every record of the given blocks.
pub fn decode_records(blocks: &[ReadBlock]) -> Vec<Record> {
    let serializer = LengthPrefixedSerializer;
    blocks
        .iter()
        .flat_map(|block| serializer.deserialize(block.data.clone()).unwrap())
        .map(|(key, value)| Record { key, value })
        .collect()
}

/// Sorted `(key, value)` pairs, for multiset comparison.
pub fn sorted_pairs<'a>(records: impl IntoIterator<Item = &'a Record>) -> Vec<(Bytes, Bytes)> {
    let mut pairs: Vec<_> = records
        .into_iter()
        .map(|r| (r.key.clone(), r.value.clone()))
        .collect();
    pairs.sort();
    pairs
}

/// Generate test data with a specific seed.
pub fn test_data_seeded(size: usize, seed: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = seed;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}
