//! Request and response types exchanged with shuffle servers.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use eddy_types::{BlockId, ServerInfo, ShuffleBlock};

/// Outcome of a server-side operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    /// The server has no reception buffer left; retry later or elsewhere.
    NoBuffer,
    /// The server does not know the application or shuffle.
    NoRegister,
    InternalError,
    Timeout,
    /// The call never reached the server.
    Unreachable,
}

impl StatusCode {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::NoBuffer => "NO_BUFFER",
            Self::NoRegister => "NO_REGISTER",
            Self::InternalError => "INTERNAL_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Unreachable => "UNREACHABLE",
        };
        f.write_str(name)
    }
}

/// Blocks of one shuffle pushed to one server.
#[derive(Debug, Clone)]
pub struct SendShuffleDataRequest {
    pub app_id: String,
    pub shuffle_id: u32,
    pub stage_attempt: u32,
    /// Blocks in dispatch order; they may span several partitions.
    pub blocks: Vec<ShuffleBlock>,
}

impl SendShuffleDataRequest {
    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| b.length() as u64).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendShuffleDataResponse {
    pub status: StatusCode,
    pub message: String,
}

impl SendShuffleDataResponse {
    pub fn success() -> Self {
        Self {
            status: StatusCode::Success,
            message: String::new(),
        }
    }

    pub fn failure(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Ask a server to make everything it received for a shuffle readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishShuffleRequest {
    pub app_id: String,
    pub shuffle_id: u32,
    /// Number of write tasks the stage runs.
    pub expected_task_count: u32,
}

/// Block ids a task wrote, keyed by partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportShuffleResultRequest {
    pub app_id: String,
    pub shuffle_id: u32,
    pub task_attempt_id: u64,
    pub partition_to_block_ids: HashMap<u32, Vec<BlockId>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetShuffleResultRequest {
    pub app_id: String,
    pub shuffle_id: u32,
    pub partition_id: u32,
}

/// Escalation sent to the cluster authority when a write task cannot finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailureReport {
    pub app_id: String,
    pub shuffle_id: u32,
    pub stage_id: u32,
    pub stage_attempt: u32,
    pub task_id: String,
    /// Servers that failed at least one send or report.
    pub faulty_servers: BTreeSet<ServerInfo>,
    pub reason: String,
}
