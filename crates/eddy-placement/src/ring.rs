//! Consistent hashing ring implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use eddy_types::{ReplicaAssignment, ServerInfo};
use tracing::debug;

/// Consistent hashing ring over shuffle servers.
#[derive(Debug, Clone)]
pub struct Ring {
    /// Virtual node positions: ring position -> server id.
    vnodes: BTreeMap<u64, String>,
    /// Servers by id, with their vnode weight.
    servers: HashMap<String, (ServerInfo, u16)>,
    vnodes_per_server: u16,
}

impl Ring {
    /// Create an empty ring giving each server `vnodes_per_server` positions.
    pub fn new(vnodes_per_server: u16) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            servers: HashMap::new(),
            vnodes_per_server,
        }
    }

    pub fn add_server(&mut self, server: ServerInfo) {
        self.add_server_with_weight(server, self.vnodes_per_server);
    }

    /// Add a server with an explicit vnode count, replacing any previous entry.
    pub fn add_server_with_weight(&mut self, server: ServerInfo, weight: u16) {
        self.remove_server(&server.id);

        for i in 0..weight {
            self.vnodes.insert(vnode_position(&server.id, i), server.id.clone());
        }
        debug!(server = %server, weight, "added server to ring");
        self.servers.insert(server.id.clone(), (server, weight));
    }

    pub fn remove_server(&mut self, server_id: &str) {
        if let Some((server, weight)) = self.servers.remove(server_id) {
            for i in 0..weight {
                self.vnodes.remove(&vnode_position(server_id, i));
            }
            debug!(server = %server, "removed server from ring");
        }
    }

    /// Replica servers of one partition, in preference order.
    ///
    /// Returns every server when fewer than `replicas` exist.
    pub fn owners(&self, shuffle_id: u32, partition_id: u32, replicas: usize) -> Vec<ServerInfo> {
        if self.vnodes.is_empty() {
            return Vec::new();
        }

        let pos = partition_position(shuffle_id, partition_id);
        let wanted = replicas.min(self.servers.len());
        let mut owners: Vec<ServerInfo> = Vec::with_capacity(wanted);

        let after = self.vnodes.range(pos..);
        let before = self.vnodes.range(..pos);
        for (_, server_id) in after.chain(before) {
            if owners.iter().any(|s| &s.id == server_id) {
                continue;
            }
            if let Some((server, _)) = self.servers.get(server_id) {
                owners.push(server.clone());
                if owners.len() == wanted {
                    break;
                }
            }
        }
        owners
    }

    /// Assign every partition of a shuffle to `replicas` servers.
    pub fn assign(&self, shuffle_id: u32, partition_count: u32, replicas: usize) -> ReplicaAssignment {
        let mut assignment = ReplicaAssignment::new();
        for partition_id in 0..partition_count {
            assignment.assign(partition_id, self.owners(shuffle_id, partition_id, replicas));
        }
        assignment
    }

    /// A copy of this ring without the given servers.
    pub fn without(&self, excluded: &BTreeSet<ServerInfo>) -> Ring {
        let mut ring = self.clone();
        for server in excluded {
            ring.remove_server(&server.id);
        }
        ring
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn vnode_count(&self) -> usize {
        self.vnodes.len()
    }
}

/// blake3(server_id ++ vnode_index) truncated to u64.
fn vnode_position(server_id: &str, vnode_index: u16) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(server_id.as_bytes());
    hasher.update(&vnode_index.to_le_bytes());
    truncate(hasher.finalize())
}

fn partition_position(shuffle_id: u32, partition_id: u32) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&shuffle_id.to_le_bytes());
    hasher.update(&partition_id.to_le_bytes());
    truncate(hasher.finalize())
}

fn truncate(hash: blake3::Hash) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}
