//! Transport contracts for Eddy.
//!
//! The wire format is not part of Eddy: clients talk to shuffle servers
//! through [`ShuffleServerClient`] and to the cluster coordinator through
//! [`ClusterAuthority`]. Both are object-safe async traits so a process can
//! plug in a real RPC stack, an in-process server, or a mock with failure
//! injection in tests.

mod error;
mod message;

use eddy_types::{ExpectedBlockSet, ServerInfo};

pub use error::RpcError;
pub use message::{
    FinishShuffleRequest, GetShuffleResultRequest, ReportShuffleResultRequest,
    SendShuffleDataRequest, SendShuffleDataResponse, StatusCode, WriteFailureReport,
};

/// Calls a client makes against a single shuffle server.
#[async_trait::async_trait]
pub trait ShuffleServerClient: Send + Sync {
    /// Push blocks to `server`. A non-success status is returned in the
    /// response, not as an error; errors mean the call itself failed.
    async fn send_shuffle_data(
        &self,
        server: &ServerInfo,
        request: SendShuffleDataRequest,
    ) -> Result<SendShuffleDataResponse, RpcError>;

    /// Flush and seal everything `server` holds for a shuffle.
    ///
    /// Idempotent. Returns `false` if the server could not make the data
    /// readable.
    async fn finish_shuffle(
        &self,
        server: &ServerInfo,
        request: FinishShuffleRequest,
    ) -> Result<bool, RpcError>;

    /// Record which block ids a task attempt produced per partition.
    async fn report_shuffle_result(
        &self,
        server: &ServerInfo,
        request: ReportShuffleResultRequest,
    ) -> Result<(), RpcError>;

    /// Block ids reported for one partition.
    async fn get_shuffle_result(
        &self,
        server: &ServerInfo,
        request: GetShuffleResultRequest,
    ) -> Result<ExpectedBlockSet, RpcError>;
}

/// The cluster-level coordinator that decides about stage resubmission.
#[async_trait::async_trait]
pub trait ClusterAuthority: Send + Sync {
    /// Report a write failure. Returns `true` when the whole stage should be
    /// resubmitted rather than failing the task.
    async fn report_write_failure(&self, report: WriteFailureReport) -> Result<bool, RpcError>;
}
