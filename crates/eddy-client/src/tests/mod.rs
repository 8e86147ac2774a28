//! Test fixtures: a scriptable mock transport and block builders.


use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use eddy_rpc::{
    FinishShuffleRequest, GetShuffleResultRequest, ReportShuffleResultRequest, RpcError,
    SendShuffleDataRequest, SendShuffleDataResponse, ShuffleServerClient, StatusCode,
};
use eddy_types::{BlockId, ExpectedBlockSet, ServerInfo, ShuffleBlock};

pub(crate) fn servers(n: u16) -> Vec<ServerInfo> {
    (1..=n)
        .map(|i| ServerInfo::new(format!("s{i}"), "localhost", 20000 + i))
        .collect()
}

pub(crate) fn block_for(id: u64, partition: u32, size: usize, replicas: &[ServerInfo]) -> ShuffleBlock {
    let data = Bytes::from(vec![id as u8; size]);
    ShuffleBlock {
        shuffle_id: 0,
        partition_id: partition,
        block_id: BlockId::new(id),
        task_attempt_id: 1,
        crc: ShuffleBlock::checksum(&data),
        uncompressed_length: size as u32,
        data,
        record_count: 1,
        replicas: replicas.to_vec(),
    }
}

/// How a mock server answers sends.
#[derive(Clone, Copy)]
enum SendBehavior {
    /// Fail with this status forever.
    Fail(StatusCode),
    /// Fail with this status for the next n attempts.
    FailTimes(StatusCode, u32),
    /// Accept, but only after a delay.
    Delay(Duration),
    /// Never answer.
    Hang,
}

/// Scriptable in-memory [`ShuffleServerClient`].
#[derive(Default)]
pub(crate) struct MockClient {
    received: Mutex<HashMap<ServerInfo, Vec<ShuffleBlock>>>,
    attempts: Mutex<HashMap<ServerInfo, u32>>,
    behavior: Mutex<HashMap<ServerInfo, SendBehavior>>,
    finish_fails: Mutex<HashSet<ServerInfo>>,
    finish_delay: Mutex<Option<Duration>>,
    finished: Mutex<Vec<ServerInfo>>,
    report_failures: Mutex<HashMap<ServerInfo, u32>>,
    reports: Mutex<Vec<(ServerInfo, ReportShuffleResultRequest)>>,
    results: Mutex<HashMap<(ServerInfo, u32), ExpectedBlockSet>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, server: &ServerInfo, status: StatusCode) {
        self.behavior
            .lock()
            .unwrap()
            .insert(server.clone(), SendBehavior::Fail(status));
    }

    pub fn fail_times(&self, server: &ServerInfo, status: StatusCode, times: u32) {
        self.behavior
            .lock()
            .unwrap()
            .insert(server.clone(), SendBehavior::FailTimes(status, times));
    }

    pub fn delay(&self, server: &ServerInfo, delay: Duration) {
        self.behavior
            .lock()
            .unwrap()
            .insert(server.clone(), SendBehavior::Delay(delay));
    }

    pub fn hang(&self, server: &ServerInfo) {
        self.behavior
            .lock()
            .unwrap()
            .insert(server.clone(), SendBehavior::Hang);
    }

    pub fn fail_finish(&self, server: &ServerInfo) {
        self.finish_fails.lock().unwrap().insert(server.clone());
    }

    pub fn delay_finish(&self, delay: Duration) {
        *self.finish_delay.lock().unwrap() = Some(delay);
    }

    /// Fail the next `times` reports to `server`.
    pub fn fail_reports(&self, server: &ServerInfo, times: u32) {
        self.report_failures
            .lock()
            .unwrap()
            .insert(server.clone(), times);
    }

    pub fn set_result(&self, server: &ServerInfo, partition: u32, ids: &[u64]) {
        self.results.lock().unwrap().insert(
            (server.clone(), partition),
            ids.iter().copied().map(BlockId::new).collect(),
        );
    }

    pub fn received(&self, server: &ServerInfo) -> Vec<ShuffleBlock> {
        self.received
            .lock()
            .unwrap()
            .get(server)
            .cloned()
            .unwrap_or_default()
    }

    pub fn attempts(&self, server: &ServerInfo) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(server)
            .copied()
            .unwrap_or(0)
    }

    pub fn finished(&self) -> Vec<ServerInfo> {
        self.finished.lock().unwrap().clone()
    }

    pub fn reports(&self) -> Vec<(ServerInfo, ReportShuffleResultRequest)> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ShuffleServerClient for MockClient {
    async fn send_shuffle_data(
        &self,
        server: &ServerInfo,
        request: SendShuffleDataRequest,
    ) -> Result<SendShuffleDataResponse, RpcError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(server.clone())
            .or_default() += 1;

        let behavior = {
            let mut behaviors = self.behavior.lock().unwrap();
            let current = behaviors.get(server).copied();
            if let Some(SendBehavior::FailTimes(status, times)) = current {
                if times <= 1 {
                    behaviors.remove(server);
                } else {
                    behaviors.insert(server.clone(), SendBehavior::FailTimes(status, times - 1));
                }
            }
            current
        };
        match behavior {
            Some(SendBehavior::Fail(StatusCode::Unreachable)) => {
                return Err(RpcError::Unreachable(server.clone()));
            }
            Some(SendBehavior::Fail(status)) | Some(SendBehavior::FailTimes(status, _)) => {
                return Ok(SendShuffleDataResponse::failure(status, "mock failure"));
            }
            Some(SendBehavior::Delay(delay)) => tokio::time::sleep(delay).await,
            Some(SendBehavior::Hang) => std::future::pending::<()>().await,
            None => {}
        }

        self.received
            .lock()
            .unwrap()
            .entry(server.clone())
            .or_default()
            .extend(request.blocks);
        Ok(SendShuffleDataResponse::success())
    }

    async fn finish_shuffle(
        &self,
        server: &ServerInfo,
        _request: FinishShuffleRequest,
    ) -> Result<bool, RpcError> {
        let delay = *self.finish_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.finished.lock().unwrap().push(server.clone());
        Ok(!self.finish_fails.lock().unwrap().contains(server))
    }

    async fn report_shuffle_result(
        &self,
        server: &ServerInfo,
        request: ReportShuffleResultRequest,
    ) -> Result<(), RpcError> {
        {
            let mut failures = self.report_failures.lock().unwrap();
            if let Some(left) = failures.get_mut(server) {
                if *left > 0 {
                    *left -= 1;
                    return Err(RpcError::Timeout(server.clone()));
                }
            }
        }
        self.reports.lock().unwrap().push((server.clone(), request));
        Ok(())
    }

    async fn get_shuffle_result(
        &self,
        server: &ServerInfo,
        request: GetShuffleResultRequest,
    ) -> Result<ExpectedBlockSet, RpcError> {
        self.results
            .lock()
            .unwrap()
            .get(&(server.clone(), request.partition_id))
            .cloned()
            .ok_or_else(|| RpcError::Server {
                server: server.clone(),
                status: StatusCode::NoRegister,
                message: "no results".into(),
            })
    }
}
