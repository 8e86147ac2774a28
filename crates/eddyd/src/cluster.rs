//! An in-process cluster of shuffle servers.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use eddy_client::ReplicaSource;
use eddy_placement::Ring;
use eddy_server::{LocalShuffleClient, ShuffleServer};
use eddy_store::{LocalFileTier, MemoryTier, RemoteTier, ShuffleStorage};
use eddy_types::{ReplicaAssignment, ServerInfo, StorageTierKind};
use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::EddyConfig;

pub struct LocalCluster {
    client: Arc<LocalShuffleClient>,
    servers: Vec<Arc<ShuffleServer>>,
    ring: Ring,
    flush_loops: Vec<JoinHandle<()>>,
}

impl LocalCluster {
    /// Start `count` servers. Local file tiers live under `local_root`, one
    /// directory per server.
    pub async fn start(config: &EddyConfig, count: u16, local_root: &Path) -> Result<Self> {
        let kinds = config.tier_kinds()?;
        let remote: Arc<dyn ObjectStore> = match &config.storage.remote_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                Arc::new(LocalFileSystem::new_with_prefix(dir)?)
            }
            None => Arc::new(InMemory::new()),
        };

        let client = Arc::new(LocalShuffleClient::new());
        let mut ring = Ring::new(config.server.vnodes_per_server);
        let mut servers = Vec::with_capacity(count as usize);
        let mut flush_loops = Vec::with_capacity(count as usize);
        for i in 0..count {
            let info = ServerInfo::new(format!("eddy-{i}"), "127.0.0.1", 19_990 + i);
            let mut tiers: Vec<Arc<dyn ShuffleStorage>> = Vec::with_capacity(kinds.len());
            for kind in &kinds {
                let tier: Arc<dyn ShuffleStorage> = match kind {
                    StorageTierKind::Memory => Arc::new(MemoryTier::new(config.storage.memory_max_bytes)),
                    StorageTierKind::LocalFile => Arc::new(LocalFileTier::new(
                        local_root.join(&info.id),
                        config.storage.local_max_bytes,
                    )?),
                    StorageTierKind::Remote => Arc::new(RemoteTier::new(Arc::clone(&remote), info.id.as_str())),
                };
                tiers.push(tier);
            }
            let server = ShuffleServer::new(info.clone(), config.server_config(), tiers)
                .with_context(|| format!("failed to start server {info}"))?;
            flush_loops.push(server.start_background_flush());
            client.add_server(Arc::clone(&server)).await;
            ring.add_server(info);
            servers.push(server);
        }
        info!(servers = count, tiers = %config.storage.tiers, "local cluster started");

        Ok(Self {
            client,
            servers,
            ring,
            flush_loops,
        })
    }

    pub fn client(&self) -> &Arc<LocalShuffleClient> {
        &self.client
    }

    pub fn servers(&self) -> &[Arc<ShuffleServer>] {
        &self.servers
    }

    pub fn assign(&self, shuffle_id: u32, partitions: u32, replicas: usize) -> ReplicaAssignment {
        self.ring.assign(shuffle_id, partitions, replicas)
    }

    /// Read sources for a partition's replicas, in assignment order.
    pub fn replica_sources(&self, replicas: &[ServerInfo]) -> Vec<ReplicaSource> {
        replicas
            .iter()
            .filter_map(|info| self.servers.iter().find(|s| s.info() == info))
            .map(|server| ReplicaSource {
                server: server.info().clone(),
                tiers: server.tiers().to_vec(),
            })
            .collect()
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for handle in &self.flush_loops {
            handle.abort();
        }
    }
}
