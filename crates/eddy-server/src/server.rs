//! Request handling for one shuffle server.

use std::sync::Arc;

use eddy_rpc::{
    FinishShuffleRequest, GetShuffleResultRequest, ReportShuffleResultRequest,
    SendShuffleDataRequest, SendShuffleDataResponse, StatusCode,
};
use eddy_store::ShuffleStorage;
use eddy_types::{ExpectedBlockSet, PartitionKey, ServerInfo};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::ServerBlockStore;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::flush::FlushManager;
use crate::result::ShuffleResultRegistry;

/// A shuffle server: reception buffers, tiered storage and result registry.
pub struct ShuffleServer {
    info: ServerInfo,
    store: Arc<ServerBlockStore>,
    results: ShuffleResultRegistry,
}

impl ShuffleServer {
    /// Build a server over `tiers`, listed hottest first.
    pub fn new(
        info: ServerInfo,
        config: ServerConfig,
        tiers: Vec<Arc<dyn ShuffleStorage>>,
    ) -> Result<Arc<Self>, ServerError> {
        let flusher = FlushManager::new(
            info.id.clone(),
            tiers,
            config.cold_flush_threshold,
            config.partition_range_width,
        )?;
        info!(server = %info, tiers = flusher.tiers().len(), "shuffle server started");
        Ok(Arc::new(Self {
            info,
            store: ServerBlockStore::new(config, flusher),
            results: ShuffleResultRegistry::new(),
        }))
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn store(&self) -> &Arc<ServerBlockStore> {
        &self.store
    }

    /// Storage tiers in precedence order, for readers.
    pub fn tiers(&self) -> &[Arc<dyn ShuffleStorage>] {
        self.store.flusher().tiers()
    }

    /// Start the periodic watermark check.
    pub fn start_background_flush(&self) -> JoinHandle<()> {
        self.store.spawn_flush_loop()
    }

    pub fn handle_send(&self, request: SendShuffleDataRequest) -> SendShuffleDataResponse {
        let blocks = request.blocks.len();
        match self
            .store
            .receive(&request.app_id, request.shuffle_id, request.blocks)
        {
            Ok(()) => {
                debug!(server = %self.info, app_id = %request.app_id, shuffle_id = request.shuffle_id, blocks, "received blocks");
                SendShuffleDataResponse::success()
            }
            Err(e) => {
                warn!(server = %self.info, app_id = %request.app_id, shuffle_id = request.shuffle_id, error = %e, "rejected blocks");
                SendShuffleDataResponse::failure(status_of(&e), e.to_string())
            }
        }
    }

    /// Flush everything of the shuffle into storage.
    pub async fn handle_finish(&self, request: FinishShuffleRequest) -> Result<(), ServerError> {
        self.results
            .register_shuffle(&request.app_id, request.shuffle_id);
        self.store
            .commit_shuffle(&request.app_id, request.shuffle_id)
            .await?;
        info!(
            server = %self.info,
            app_id = %request.app_id,
            shuffle_id = request.shuffle_id,
            expected_tasks = request.expected_task_count,
            "shuffle committed"
        );
        Ok(())
    }

    pub fn handle_report(&self, request: &ReportShuffleResultRequest) {
        self.results.report(
            &request.app_id,
            request.shuffle_id,
            request
                .partition_to_block_ids
                .iter()
                .map(|(partition, ids)| (*partition, ids.as_slice())),
        );
    }

    pub fn handle_get_result(
        &self,
        request: &GetShuffleResultRequest,
    ) -> Result<ExpectedBlockSet, ServerError> {
        self.results.get(&PartitionKey::new(
            &request.app_id,
            request.shuffle_id,
            request.partition_id,
        ))
    }

    /// Drop buffers, results and stored data of an application.
    pub async fn purge_app(&self, app_id: &str) -> Result<(), ServerError> {
        self.store.purge_app(app_id);
        self.results.purge_app(app_id);
        for tier in self.tiers() {
            tier.purge_app(app_id).await?;
        }
        info!(server = %self.info, app_id, "purged app");
        Ok(())
    }
}

/// Status code a client sees for a server-side failure.
pub fn status_of(error: &ServerError) -> StatusCode {
    match error {
        ServerError::NoBuffer { .. } => StatusCode::NoBuffer,
        ServerError::UnknownShuffle { .. } => StatusCode::NoRegister,
        _ => StatusCode::InternalError,
    }
}
