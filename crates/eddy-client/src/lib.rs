//! Client side of Eddy shuffles.
//!
//! A write task feeds records to a [`ShuffleWriter`]. The
//! [`WriteBufferManager`] serializes them into per-partition buffers drawn
//! from a shared [`MemoryPool`] and spills full buffers into blocks. The
//! [`BlockDispatcher`] pushes each block to every server of its replica set
//! in the background, tracking the outcome in the task's
//! [`TaskSendState`]. At the end of the task the [`CommitCoordinator`]
//! checks that nothing was lost, waits for every send, commits the shuffle
//! on the servers and reports the block ids.
//!
//! A read task uses a [`ShuffleReadClient`] to fetch the expected block ids
//! and read them back from the replicas' storage tiers.

pub mod buffer;
pub mod codec;
pub mod commit;
mod config;
pub mod dispatch;
mod error;
mod memory;
mod reader;
pub mod session;
#[cfg(test)]
mod tests;
mod writer;

pub use buffer::{BlockBatch, PartitionBuffer, WriteBufferManager, WriteMetrics, build_batches};
pub use codec::{BlockCodec, IdentityCodec, LengthPrefixedSerializer, RecordSerializer};
pub use commit::{CommitBackoff, CommitCoordinator, ServerBlockMap};
pub use config::{BufferOptions, CommitOptions, DispatchOptions, ReadOptions};
pub use dispatch::{BatchOutcome, BlockDispatcher, SendHandle};
pub use error::ClientError;
pub use memory::{MemoryPool, TaskMemory};
pub use reader::{ReadBlock, ReplicaSource, ShuffleReadClient};
pub use session::{BlockSendStatus, FailedBlockSendTracker, ShuffleSession, TaskSendState};
pub use writer::{HashPartitioner, MapOutput, Partitioner, Record, ShuffleWriter, TaskContext};
