//! Shuffle server tunables.

use std::time::Duration;

/// Configuration of a [`ShuffleServer`](crate::ShuffleServer).
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Total bytes the reception buffers may hold, flushing included.
    pub buffer_capacity: u64,
    /// Start flushing when buffered bytes exceed this share of the capacity.
    pub high_watermark_ratio: f64,
    /// Flush until buffered bytes fall to this share of the capacity.
    pub low_watermark_ratio: f64,
    /// Concurrent flushes.
    pub flush_pool_size: usize,
    /// Flushes larger than this go straight to the remote tier when one is configured.
    pub cold_flush_threshold: Option<u64>,
    /// Partitions persisted together in one file pair.
    pub partition_range_width: u32,
    /// Period of the background watermark check.
    pub flush_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024 * 1024 * 1024, // 1 GB
            high_watermark_ratio: 0.75,
            low_watermark_ratio: 0.25,
            flush_pool_size: 8,
            cold_flush_threshold: Some(64 * 1024 * 1024),
            partition_range_width: 1,
            flush_interval: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    pub fn high_watermark(&self) -> u64 {
        (self.buffer_capacity as f64 * self.high_watermark_ratio) as u64
    }

    pub fn low_watermark(&self) -> u64 {
        (self.buffer_capacity as f64 * self.low_watermark_ratio) as u64
    }
}
