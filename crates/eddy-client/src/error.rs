//! Error types for the shuffle client.

use eddy_types::{BlockId, TypesError};

/// Errors raised on the write and read paths of a task.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The memory pool denied an acquisition after every retry.
    #[error("task {task_id} could not acquire {requested} bytes of buffer memory")]
    OutOfMemory { task_id: String, requested: u64 },

    /// Some blocks of the task failed on every replica.
    #[error("task {task_id}: {failed} blocks could not be sent, faulty servers: [{servers}]")]
    SendFailed {
        task_id: String,
        failed: usize,
        /// Comma separated list of the servers that failed a send.
        servers: String,
    },

    /// Blocks were still pending when the send check timed out.
    #[error("task {task_id}: {pending} blocks still unacknowledged after {waited_ms} ms")]
    WaitTimeout {
        task_id: String,
        pending: usize,
        waited_ms: u64,
    },

    /// Records written and records buffered disagree.
    #[error("task {task_id}: wrote {written} records but buffered {buffered}")]
    RecordCountMismatch {
        task_id: String,
        written: u64,
        buffered: u64,
    },

    /// Block counts disagree between the writer, the servers and the buffer manager.
    #[error(
        "task {task_id}: {expected} blocks dispatched, {server_tracked} tracked per server, {buffer_tracked} built"
    )]
    BlockCountMismatch {
        task_id: String,
        expected: u64,
        server_tracked: u64,
        buffer_tracked: u64,
    },

    /// Partition buffers still hold data after the final spill.
    #[error("task {task_id}: {remaining} partition buffers were never spilled")]
    BuffersNotDrained { task_id: String, remaining: usize },

    /// Not every server acknowledged the finish call.
    #[error("commit of shuffle {shuffle_id} failed on [{servers}]")]
    CommitFailed { shuffle_id: u32, servers: String },

    /// Block ids could not be reported to some servers.
    #[error("reporting results of task {task_id} failed on [{servers}]")]
    ReportFailed { task_id: String, servers: String },

    /// The cluster authority asked for the whole stage to be resubmitted.
    #[error("stage attempt {stage_attempt} of shuffle {shuffle_id} must be resubmitted: {reason}")]
    StageRetry {
        shuffle_id: u32,
        stage_attempt: u32,
        reason: String,
    },

    /// Expected blocks could not be found on any replica.
    #[error("partition {partition_id} is missing {missing} expected blocks (first: {first})")]
    ReadIncomplete {
        partition_id: u32,
        missing: u64,
        first: BlockId,
    },

    /// A block read back does not match its checksum.
    #[error("block {block_id} failed checksum verification")]
    ChecksumMismatch { block_id: BlockId },

    /// The partition has no replica servers assigned.
    #[error("partition {0} has no replica assignment")]
    NoAssignment(u32),

    /// Block or record bytes could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("rpc error: {0}")]
    Rpc(#[from] eddy_rpc::RpcError),

    #[error("store error: {0}")]
    Store(#[from] eddy_store::StoreError),

    #[error("block id layout: {0}")]
    Layout(#[from] TypesError),
}

impl ClientError {
    /// Failures worth escalating to the cluster authority: blocks or
    /// results that could not be delivered. Consistency check failures never
    /// escalate.
    pub fn is_send_failure(&self) -> bool {
        matches!(
            self,
            Self::SendFailed { .. } | Self::WaitTimeout { .. } | Self::ReportFailed { .. }
        )
    }
}
