//! Consistent hashing ring for partition-to-server assignment.
//!
//! Each shuffle server is mapped to several virtual nodes (vnodes) on a u64
//! ring at `blake3(server_id ++ vnode_index)`. A partition's replicas are the
//! first distinct servers found walking clockwise from the partition's
//! position. The resulting [`eddy_types::ReplicaAssignment`] stays fixed for a
//! stage attempt; a resubmitted stage can be reassigned away from faulty
//! servers with [`Ring::without`].

mod ring;

pub use ring::Ring;
