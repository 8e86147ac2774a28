//! TOML configuration for `eddyd`.
//!
//! Every section is optional; missing keys fall back to the library
//! defaults. Durations are given in milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use eddy_client::{BufferOptions, CommitOptions, DispatchOptions, ReadOptions};
use eddy_server::ServerConfig;
use eddy_store::SegmentReadOptions;
use eddy_types::{BlockIdLayout, StorageTierKind};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EddyConfig {
    /// Write and read side of tasks.
    pub client: ClientSection,
    /// Reception buffers and flushing.
    pub server: ServerSection,
    /// Where flushed shuffle data lives.
    pub storage: StorageSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[client]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub buffer_size: u64,
    pub max_block_size: u64,
    pub spill_size: u64,
    pub spill_ratio: f64,
    pub send_size_limit: u64,
    /// Bytes all tasks of the process may buffer.
    pub memory_capacity: u64,
    pub memory_acquire_retries: u32,
    pub memory_acquire_interval_ms: u64,
    /// Bit widths of sequence, partition and task attempt in a block id.
    pub block_id_bits: [u8; 3],
    pub dispatch_pool_size: usize,
    pub retry_max: u32,
    pub retry_interval_ms: u64,
    pub retry_interval_max_ms: u64,
    pub replica: usize,
    pub replica_write: usize,
    pub send_check_interval_ms: u64,
    pub send_check_timeout_ms: u64,
    pub write_failure_retry: bool,
    pub report_retry_max: u32,
    pub read_buffer_size: u64,
    pub verify_checksums: bool,
}

impl Default for ClientSection {
    fn default() -> Self {
        let buffer = BufferOptions::default();
        let dispatch = DispatchOptions::default();
        let commit = CommitOptions::default();
        let read = ReadOptions::default();
        Self {
            buffer_size: buffer.buffer_size,
            max_block_size: buffer.max_block_size,
            spill_size: buffer.spill_size,
            spill_ratio: buffer.spill_ratio,
            send_size_limit: buffer.send_size_limit,
            memory_capacity: 512 * 1024 * 1024,
            memory_acquire_retries: buffer.memory_acquire_retries,
            memory_acquire_interval_ms: buffer.memory_acquire_interval.as_millis() as u64,
            block_id_bits: [18, 24, 21],
            dispatch_pool_size: dispatch.dispatch_pool_size,
            retry_max: dispatch.retry_max,
            retry_interval_ms: dispatch.retry_interval.as_millis() as u64,
            retry_interval_max_ms: dispatch.retry_interval_max.as_millis() as u64,
            replica: 1,
            replica_write: dispatch.replica_write,
            send_check_interval_ms: commit.send_check_interval.as_millis() as u64,
            send_check_timeout_ms: commit.send_check_timeout.as_millis() as u64,
            write_failure_retry: commit.write_failure_retry,
            report_retry_max: commit.report_retry_max,
            read_buffer_size: read.segment.read_buffer_size,
            verify_checksums: read.verify_checksums,
        }
    }
}

/// `[server]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub buffer_capacity: u64,
    pub high_watermark_ratio: f64,
    pub low_watermark_ratio: f64,
    pub flush_pool_size: usize,
    /// Flush size above which the remote tier is used directly. 0 disables.
    pub cold_flush_threshold: u64,
    pub partition_range_width: u32,
    pub flush_interval_ms: u64,
    /// Virtual nodes per server on the placement ring.
    pub vnodes_per_server: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            buffer_capacity: server.buffer_capacity,
            high_watermark_ratio: server.high_watermark_ratio,
            low_watermark_ratio: server.low_watermark_ratio,
            flush_pool_size: server.flush_pool_size,
            cold_flush_threshold: server.cold_flush_threshold.unwrap_or(0),
            partition_range_width: server.partition_range_width,
            flush_interval_ms: server.flush_interval.as_millis() as u64,
            vnodes_per_server: 128,
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Tier list, hottest first, e.g. `"MEMORY_LOCALFILE_REMOTE"`.
    pub tiers: String,
    /// Base directory of the local file tier; one subdirectory per server.
    pub local_dir: PathBuf,
    pub local_max_bytes: u64,
    pub memory_max_bytes: u64,
    /// Directory backing the remote tier. In memory when unset.
    pub remote_dir: Option<PathBuf>,
}

impl Default for StorageSection {
    fn default() -> Self {
        let local_dir = dirs::home_dir()
            .map(|h| h.join(".eddy"))
            .unwrap_or_else(|| PathBuf::from(".eddy"));
        Self {
            tiers: "MEMORY_LOCALFILE".to_string(),
            local_dir,
            local_max_bytes: 64 * 1024 * 1024 * 1024,
            memory_max_bytes: 256 * 1024 * 1024,
            remote_dir: None,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl EddyConfig {
    /// Load config from a TOML file, or use the defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read {}", p.display()))?;
                Self::from_toml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn buffer_options(&self) -> anyhow::Result<BufferOptions> {
        let [sequence, partition, task] = self.client.block_id_bits;
        let block_id_layout = BlockIdLayout::new(sequence, partition, task)
            .context("invalid client.block_id_bits")?;
        Ok(BufferOptions {
            buffer_size: self.client.buffer_size,
            max_block_size: self.client.max_block_size,
            spill_size: self.client.spill_size,
            spill_ratio: self.client.spill_ratio,
            send_size_limit: self.client.send_size_limit,
            memory_acquire_retries: self.client.memory_acquire_retries,
            memory_acquire_interval: Duration::from_millis(self.client.memory_acquire_interval_ms),
            block_id_layout,
        })
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            dispatch_pool_size: self.client.dispatch_pool_size,
            retry_max: self.client.retry_max,
            retry_interval: Duration::from_millis(self.client.retry_interval_ms),
            retry_interval_max: Duration::from_millis(self.client.retry_interval_max_ms),
            replica_write: self.client.replica_write,
        }
    }

    pub fn commit_options(&self) -> CommitOptions {
        CommitOptions {
            send_check_interval: Duration::from_millis(self.client.send_check_interval_ms),
            send_check_timeout: Duration::from_millis(self.client.send_check_timeout_ms),
            write_failure_retry: self.client.write_failure_retry,
            report_retry_max: self.client.report_retry_max,
        }
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            segment: SegmentReadOptions {
                read_buffer_size: self.client.read_buffer_size,
                partition_range_width: self.server.partition_range_width,
            },
            verify_checksums: self.client.verify_checksums,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            buffer_capacity: self.server.buffer_capacity,
            high_watermark_ratio: self.server.high_watermark_ratio,
            low_watermark_ratio: self.server.low_watermark_ratio,
            flush_pool_size: self.server.flush_pool_size,
            cold_flush_threshold: match self.server.cold_flush_threshold {
                0 => None,
                n => Some(n),
            },
            partition_range_width: self.server.partition_range_width,
            flush_interval: Duration::from_millis(self.server.flush_interval_ms),
        }
    }

    pub fn tier_kinds(&self) -> anyhow::Result<Vec<StorageTierKind>> {
        StorageTierKind::parse_list(&self.storage.tiers).context("invalid storage.tiers")
    }
}
