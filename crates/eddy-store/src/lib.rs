//! Storage tiers and read-back for shuffle data.
//!
//! A shuffle server flushes received blocks into one of several tiers, all
//! behind the [`ShuffleStorage`] trait:
//!
//! - [`MemoryTier`]: volatile, bounded by a byte limit.
//! - [`LocalFileTier`]: append-only data/index file pairs on local disk.
//! - [`RemoteTier`]: immutable object pairs in any [`object_store`] backend.
//!
//! Every data file carries an index of fixed 40-byte records (see
//! [`index`]). Readers split an index into bounded [`segment`]s and consume
//! them through a [`SegmentReader`].

mod error;
mod faulty_tier;
mod file_tier;
pub mod index;
mod memory_tier;
mod reader;
mod remote_tier;
pub mod segment;
#[cfg(test)]
mod tests;
mod traits;

pub use error::StoreError;
pub use faulty_tier::FaultyTier;
pub use file_tier::LocalFileTier;
pub use index::{IndexEntry, IndexFile};
pub use memory_tier::MemoryTier;
pub use reader::{BufferSegment, SegmentReadOptions, SegmentReader, ShuffleDataResult};
pub use remote_tier::RemoteTier;
pub use traits::{ShuffleFileKey, ShuffleStorage, StorageCapacity};
