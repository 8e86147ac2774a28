//! Client tunables.

use std::time::Duration;

use eddy_store::SegmentReadOptions;
use eddy_types::BlockIdLayout;

/// Write-side buffering of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferOptions {
    /// Spill a partition buffer once it grows past this many bytes.
    pub buffer_size: u64,
    /// Upper bound on the payload of one block; cut at record boundaries.
    pub max_block_size: u64,
    /// Spill part of the buffers once they hold more than this many bytes.
    pub spill_size: u64,
    /// Share of the buffered bytes spilled when `spill_size` is exceeded.
    pub spill_ratio: f64,
    /// Upper bound on the blocks sent together in one request.
    pub send_size_limit: u64,
    pub memory_acquire_retries: u32,
    pub memory_acquire_interval: Duration,
    pub block_id_layout: BlockIdLayout,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            buffer_size: 3 * 1024 * 1024,
            max_block_size: 3 * 1024 * 1024,
            spill_size: 128 * 1024 * 1024,
            spill_ratio: 0.5,
            send_size_limit: 16 * 1024 * 1024,
            memory_acquire_retries: 1200,
            memory_acquire_interval: Duration::from_secs(1),
            block_id_layout: BlockIdLayout::DEFAULT,
        }
    }
}

/// Sending blocks to replica servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Batches in flight at once.
    pub dispatch_pool_size: usize,
    /// Attempts per (batch, server) send, the first one included.
    pub retry_max: u32,
    pub retry_interval: Duration,
    pub retry_interval_max: Duration,
    /// Acks a block needs, capped by its replica count.
    pub replica_write: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            dispatch_pool_size: 10,
            retry_max: 3,
            retry_interval: Duration::from_millis(100),
            retry_interval_max: Duration::from_secs(10),
            replica_write: 1,
        }
    }
}

/// Send checks, commit and result reporting at the end of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOptions {
    pub send_check_interval: Duration,
    pub send_check_timeout: Duration,
    /// Escalate write failures to the cluster authority.
    pub write_failure_retry: bool,
    /// Attempts per server when reporting block ids with `write_failure_retry`.
    pub report_retry_max: u32,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            send_check_interval: Duration::from_millis(500),
            send_check_timeout: Duration::from_secs(600),
            write_failure_retry: false,
            report_retry_max: 3,
        }
    }
}

/// Read-back of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    pub segment: SegmentReadOptions,
    /// Check every block's CRC32 before decoding it.
    pub verify_checksums: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            segment: SegmentReadOptions::default(),
            verify_checksums: true,
        }
    }
}
