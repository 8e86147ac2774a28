//! End-of-task consistency checks, commit and result reporting.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eddy_rpc::{
    ClusterAuthority, FinishShuffleRequest, ReportShuffleResultRequest, ShuffleServerClient,
    WriteFailureReport,
};
use eddy_types::{BlockId, ServerInfo, ShuffleBlock};
use tracing::{error, info, warn};

use crate::config::CommitOptions;
use crate::error::ClientError;
use crate::session::ShuffleSession;

pub const COMMIT_BACKOFF_START: Duration = Duration::from_millis(200);
pub const COMMIT_BACKOFF_MAX: Duration = Duration::from_millis(5000);

/// Waits between commit polls: 200 ms doubling up to 5 s.
#[derive(Debug, Clone)]
pub struct CommitBackoff {
    next: Duration,
}

impl Default for CommitBackoff {
    fn default() -> Self {
        Self {
            next: COMMIT_BACKOFF_START,
        }
    }
}

impl Iterator for CommitBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = (current * 2).min(COMMIT_BACKOFF_MAX);
        Some(current)
    }
}

/// Block ids of a task per server and partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerBlockMap {
    servers: BTreeMap<ServerInfo, BTreeMap<u32, BTreeSet<BlockId>>>,
}

impl ServerBlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a block under every one of its replicas.
    pub fn record(&mut self, block: &ShuffleBlock) {
        for server in &block.replicas {
            self.servers
                .entry(server.clone())
                .or_default()
                .entry(block.partition_id)
                .or_default()
                .insert(block.block_id);
        }
    }

    pub fn servers(&self) -> BTreeSet<ServerInfo> {
        self.servers.keys().cloned().collect()
    }

    pub fn partitions_of(&self, server: &ServerInfo) -> Option<&BTreeMap<u32, BTreeSet<BlockId>>> {
        self.servers.get(server)
    }

    /// Distinct block ids over all servers; replicas count once.
    pub fn distinct_block_ids(&self) -> HashSet<BlockId> {
        self.servers
            .values()
            .flat_map(|partitions| partitions.values().flatten().copied())
            .collect()
    }

    /// Partition to block ids, merged over servers.
    pub fn partition_to_block_ids(&self) -> BTreeMap<u32, BTreeSet<BlockId>> {
        let mut merged: BTreeMap<u32, BTreeSet<BlockId>> = BTreeMap::new();
        for partitions in self.servers.values() {
            for (partition, ids) in partitions {
                merged.entry(*partition).or_default().extend(ids);
            }
        }
        merged
    }
}

fn server_list(servers: &BTreeSet<ServerInfo>) -> String {
    servers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Runs the end-of-task protocol of one shuffle's write tasks.
pub struct CommitCoordinator {
    client: Arc<dyn ShuffleServerClient>,
    authority: Option<Arc<dyn ClusterAuthority>>,
    session: Arc<ShuffleSession>,
    options: CommitOptions,
    stage_id: u32,
    stage_attempt: u32,
}

impl CommitCoordinator {
    pub fn new(
        client: Arc<dyn ShuffleServerClient>,
        authority: Option<Arc<dyn ClusterAuthority>>,
        session: Arc<ShuffleSession>,
        options: CommitOptions,
        stage_id: u32,
        stage_attempt: u32,
    ) -> Self {
        Self {
            client,
            authority,
            session,
            options,
            stage_id,
            stage_attempt,
        }
    }

    pub fn session(&self) -> &Arc<ShuffleSession> {
        &self.session
    }

    pub fn options(&self) -> &CommitOptions {
        &self.options
    }

    pub fn check_record_count(&self, task_id: &str, written: u64, buffered: u64) -> Result<(), ClientError> {
        if written != buffered {
            return Err(ClientError::RecordCountMismatch {
                task_id: task_id.to_string(),
                written,
                buffered,
            });
        }
        Ok(())
    }

    pub fn check_all_buffers_spilled(&self, task_id: &str, remaining: usize) -> Result<(), ClientError> {
        if remaining > 0 {
            return Err(ClientError::BuffersNotDrained {
                task_id: task_id.to_string(),
                remaining,
            });
        }
        Ok(())
    }

    /// The writer's ids, the per-server ids and the buffer manager's count
    /// must agree. Ids are deduplicated, so replicas count once.
    pub fn check_sent_block_count(
        &self,
        task_id: &str,
        dispatched: &HashSet<BlockId>,
        server_blocks: &ServerBlockMap,
        buffer_tracked: u64,
    ) -> Result<(), ClientError> {
        let expected = dispatched.len() as u64;
        let server_tracked = server_blocks.distinct_block_ids().len() as u64;
        if expected != server_tracked || expected != buffer_tracked {
            return Err(ClientError::BlockCountMismatch {
                task_id: task_id.to_string(),
                expected,
                server_tracked,
                buffer_tracked,
            });
        }
        Ok(())
    }

    /// Wait until every id in `ids` was acknowledged.
    ///
    /// Fails as soon as any block of the task failed, or once
    /// `send_check_timeout` passed with blocks still pending.
    #[tracing::instrument(skip(self, ids), fields(blocks = ids.len()))]
    pub async fn check_block_send_result(
        &self,
        task_id: &str,
        mut ids: HashSet<BlockId>,
    ) -> Result<(), ClientError> {
        let start = Instant::now();
        let state = self.session.task(task_id);
        loop {
            if state.has_failures() {
                let failed = state.failed_ids().len();
                let servers = server_list(&state.tracker().faulty_servers());
                error!(task_id, failed, %servers, "blocks could not be sent");
                return Err(ClientError::SendFailed {
                    task_id: task_id.to_string(),
                    failed,
                    servers,
                });
            }

            ids.retain(|id| !state.is_success(*id));
            if ids.is_empty() {
                return Ok(());
            }

            let elapsed = start.elapsed();
            if elapsed >= self.options.send_check_timeout {
                error!(task_id, pending = ids.len(), "timed out waiting for sends");
                return Err(ClientError::WaitTimeout {
                    task_id: task_id.to_string(),
                    pending: ids.len(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }

            info!(task_id, pending = ids.len(), "waiting for blocks to be sent");
            // The last poll lands on the deadline.
            let remaining = self.options.send_check_timeout - elapsed;
            tokio::time::sleep(self.options.send_check_interval.min(remaining)).await;
        }
    }

    /// Ask every server to make the shuffle readable.
    ///
    /// The fan-out runs as its own task; this polls it with [`CommitBackoff`].
    #[tracing::instrument(skip(self, servers), fields(servers = servers.len()))]
    pub async fn send_commit(
        &self,
        servers: &BTreeSet<ServerInfo>,
        shuffle_id: u32,
        expected_task_count: u32,
    ) -> Result<(), ClientError> {
        let client = Arc::clone(&self.client);
        let app_id = self.session.app_id().to_string();
        let targets: Vec<ServerInfo> = servers.iter().cloned().collect();
        let handle = tokio::spawn(async move {
            let finishes = targets.into_iter().map(|server| {
                let client = Arc::clone(&client);
                let request = FinishShuffleRequest {
                    app_id: app_id.clone(),
                    shuffle_id,
                    expected_task_count,
                };
                async move {
                    let ok = match client.finish_shuffle(&server, request).await {
                        Ok(ok) => ok,
                        Err(e) => {
                            warn!(%server, error = %e, "finish call failed");
                            false
                        }
                    };
                    (server, ok)
                }
            });
            futures::future::join_all(finishes)
                .await
                .into_iter()
                .filter(|(_, ok)| !ok)
                .map(|(server, _)| server)
                .collect::<BTreeSet<ServerInfo>>()
        });

        let start = Instant::now();
        let mut backoff = CommitBackoff::default();
        while !handle.is_finished() {
            info!(shuffle_id, waited_ms = start.elapsed().as_millis() as u64, "waiting for commit");
            let wait = backoff.next().unwrap_or(COMMIT_BACKOFF_MAX);
            tokio::time::sleep(wait).await;
        }

        let failed = match handle.await {
            Ok(failed) => failed,
            Err(e) => {
                error!(error = %e, "commit task aborted");
                servers.clone()
            }
        };
        if !failed.is_empty() {
            return Err(ClientError::CommitFailed {
                shuffle_id,
                servers: server_list(&failed),
            });
        }
        info!(shuffle_id, elapsed_ms = start.elapsed().as_millis() as u64, "shuffle committed");
        Ok(())
    }

    /// Send each server the block ids it holds for this task.
    ///
    /// With write-failure retry every server gets `report_retry_max`
    /// independent attempts; otherwise one. Servers that never took the
    /// report are returned in the error and added to `report_failed`.
    #[tracing::instrument(skip(self, server_blocks, report_failed))]
    pub async fn report_shuffle_result(
        &self,
        task_id: &str,
        shuffle_id: u32,
        task_attempt_id: u64,
        server_blocks: &ServerBlockMap,
        report_failed: &mut BTreeSet<ServerInfo>,
    ) -> Result<(), ClientError> {
        let attempts = if self.options.write_failure_retry {
            self.options.report_retry_max.max(1)
        } else {
            1
        };

        let reports = server_blocks.servers().into_iter().map(|server| {
            let partition_to_block_ids: HashMap<u32, Vec<BlockId>> = server_blocks
                .partitions_of(&server)
                .map(|partitions| {
                    partitions
                        .iter()
                        .map(|(p, ids)| (*p, ids.iter().copied().collect()))
                        .collect()
                })
                .unwrap_or_default();
            let request = ReportShuffleResultRequest {
                app_id: self.session.app_id().to_string(),
                shuffle_id,
                task_attempt_id,
                partition_to_block_ids,
            };
            async move {
                for attempt in 0..attempts {
                    match self.client.report_shuffle_result(&server, request.clone()).await {
                        Ok(()) => return (server, true),
                        Err(e) => warn!(%server, attempt, error = %e, "report failed"),
                    }
                }
                (server, false)
            }
        });

        let failed: BTreeSet<ServerInfo> = futures::future::join_all(reports)
            .await
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(server, _)| server)
            .collect();
        if failed.is_empty() {
            return Ok(());
        }
        report_failed.extend(failed.iter().cloned());
        Err(ClientError::ReportFailed {
            task_id: task_id.to_string(),
            servers: server_list(&failed),
        })
    }

    /// Turn a write failure into a stage retry if the cluster authority asks
    /// for one. Only send failures are escalated, and only with
    /// write-failure retry enabled.
    pub async fn escalate(
        &self,
        task_id: &str,
        shuffle_id: u32,
        error: ClientError,
        report_failed: &BTreeSet<ServerInfo>,
    ) -> ClientError {
        if !self.options.write_failure_retry || !error.is_send_failure() {
            return error;
        }
        let Some(authority) = &self.authority else {
            return error;
        };

        let mut faulty_servers = self
            .session
            .get_task(task_id)
            .map(|state| state.tracker().faulty_servers())
            .unwrap_or_default();
        faulty_servers.extend(report_failed.iter().cloned());

        let report = WriteFailureReport {
            app_id: self.session.app_id().to_string(),
            shuffle_id,
            stage_id: self.stage_id,
            stage_attempt: self.stage_attempt,
            task_id: task_id.to_string(),
            faulty_servers,
            reason: error.to_string(),
        };
        match authority.report_write_failure(report).await {
            Ok(true) => {
                warn!(task_id, shuffle_id, stage_attempt = self.stage_attempt, "write failures trigger stage retry");
                ClientError::StageRetry {
                    shuffle_id,
                    stage_attempt: self.stage_attempt,
                    reason: error.to_string(),
                }
            }
            Ok(false) => error,
            Err(e) => {
                warn!(task_id, error = %e, "could not report write failure");
                error
            }
        }
    }
}
