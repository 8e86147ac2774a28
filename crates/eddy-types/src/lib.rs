//! Shared types and identifiers for Eddy.
//!
//! This crate defines the core types used across the Eddy workspace:
//! identifiers ([`BlockId`], [`BlockIdLayout`], [`ServerInfo`]),
//! data structures ([`ShuffleBlock`], [`ReplicaAssignment`], [`PartitionRange`],
//! [`ExpectedBlockSet`]) and storage configuration ([`StorageTierKind`]).

pub mod block_id;
pub mod error;
pub mod expected;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use block_id::{BlockId, BlockIdLayout};
pub use error::TypesError;
pub use expected::ExpectedBlockSet;

// ---------------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------------

/// A shuffle server reachable by clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Stable server identifier, unique in the cluster.
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl ServerInfo {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// A unit of shuffle data produced by one write task for one partition.
///
/// Blocks are never mutated once built. A retransmission sends the same
/// block again, so the id, payload and checksum stay stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleBlock {
    pub shuffle_id: u32,
    pub partition_id: u32,
    pub block_id: BlockId,
    pub task_attempt_id: u64,
    /// Encoded payload as it travels over the wire and lands on disk.
    pub data: Bytes,
    /// Payload size before the codec ran.
    pub uncompressed_length: u32,
    /// CRC32 of `data`.
    pub crc: u64,
    /// Number of records serialized into this block.
    pub record_count: u32,
    /// Servers that must store this block, in preference order.
    pub replicas: Vec<ServerInfo>,
}

impl ShuffleBlock {
    /// Encoded payload length.
    pub fn length(&self) -> u32 {
        self.data.len() as u32
    }

    /// Compute the checksum stored alongside a payload.
    pub fn checksum(data: &[u8]) -> u64 {
        crc32fast::hash(data) as u64
    }
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

/// Partition to replica-server mapping, fixed for a stage attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaAssignment {
    partitions: BTreeMap<u32, Vec<ServerInfo>>,
}

impl ReplicaAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ordered replica list of a partition.
    pub fn assign(&mut self, partition_id: u32, servers: Vec<ServerInfo>) {
        self.partitions.insert(partition_id, servers);
    }

    pub fn replicas(&self, partition_id: u32) -> Option<&[ServerInfo]> {
        self.partitions.get(&partition_id).map(Vec::as_slice)
    }

    /// Every server that holds at least one partition.
    pub fn servers(&self) -> BTreeSet<ServerInfo> {
        self.partitions.values().flatten().cloned().collect()
    }

    pub fn partitions(&self) -> impl Iterator<Item = (u32, &[ServerInfo])> {
        self.partitions.iter().map(|(p, s)| (*p, s.as_slice()))
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

// ---------------------------------------------------------------------------
// Partition ranges
// ---------------------------------------------------------------------------

/// Half-open range of partitions persisted together in one file pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PartitionRange {
    pub start: u32,
    pub end: u32,
}

impl PartitionRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// The range of width `width` containing `partition_id`.
    pub fn containing(partition_id: u32, width: u32) -> Self {
        let width = width.max(1);
        let start = partition_id - partition_id % width;
        Self {
            start,
            end: start.saturating_add(width),
        }
    }

    pub fn contains(&self, partition_id: u32) -> bool {
        partition_id >= self.start && partition_id < self.end
    }
}

impl fmt::Display for PartitionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Identifies one partition of one shuffle of one application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct PartitionKey {
    pub app_id: String,
    pub shuffle_id: u32,
    pub partition_id: u32,
}

impl PartitionKey {
    pub fn new(app_id: impl Into<String>, shuffle_id: u32, partition_id: u32) -> Self {
        Self {
            app_id: app_id.into(),
            shuffle_id,
            partition_id,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.app_id, self.shuffle_id, self.partition_id)
    }
}

// ---------------------------------------------------------------------------
// Storage tiers
// ---------------------------------------------------------------------------

/// A class of storage a server can flush shuffle data into.
///
/// Declared hottest first; that is also the default fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum StorageTierKind {
    /// Server memory, volatile.
    Memory,
    /// Local disks of the server.
    LocalFile,
    /// Shared remote object storage.
    Remote,
}

impl StorageTierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "MEMORY",
            Self::LocalFile => "LOCALFILE",
            Self::Remote => "REMOTE",
        }
    }

    /// Parse an ordered tier combination such as `MEMORY_LOCALFILE_REMOTE`.
    ///
    /// `HDFS` is accepted as an alias of `REMOTE`.
    pub fn parse_list(input: &str) -> Result<Vec<Self>, TypesError> {
        let invalid = |reason: String| TypesError::InvalidTierList {
            input: input.to_string(),
            reason,
        };

        let mut tiers = Vec::new();
        for part in input.split('_').filter(|p| !p.is_empty()) {
            let tier: Self = part.parse().map_err(|_| invalid(format!("unknown tier {part}")))?;
            if tiers.contains(&tier) {
                return Err(invalid(format!("tier {part} listed twice")));
            }
            tiers.push(tier);
        }
        if tiers.is_empty() {
            return Err(invalid("no tiers given".to_string()));
        }
        Ok(tiers)
    }
}

impl FromStr for StorageTierKind {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MEMORY" => Ok(Self::Memory),
            "LOCALFILE" => Ok(Self::LocalFile),
            "REMOTE" | "HDFS" => Ok(Self::Remote),
            other => Err(TypesError::InvalidTierList {
                input: s.to_string(),
                reason: format!("unknown tier {other}"),
            }),
        }
    }
}

impl fmt::Display for StorageTierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
