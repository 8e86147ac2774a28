//! In-process transport to shuffle servers.
//!
//! [`LocalShuffleClient`] routes [`ShuffleServerClient`] calls straight to
//! [`ShuffleServer`] instances living in the same process. Servers can be
//! marked down or made to answer every send with a given status, which is
//! how the client and integration tests exercise replica failures.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use eddy_rpc::{
    FinishShuffleRequest, GetShuffleResultRequest, ReportShuffleResultRequest, RpcError,
    SendShuffleDataRequest, SendShuffleDataResponse, ShuffleServerClient, StatusCode,
};
use eddy_types::{ExpectedBlockSet, ServerInfo};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::ServerError;
use crate::server::{ShuffleServer, status_of};

#[derive(Default)]
pub struct LocalShuffleClient {
    servers: RwLock<HashMap<ServerInfo, Arc<ShuffleServer>>>,
    /// Servers whose calls fail as unreachable.
    down: RwLock<HashSet<ServerInfo>>,
    /// Servers that answer sends with a fixed failure status.
    failing_sends: RwLock<HashMap<ServerInfo, StatusCode>>,
    send_latency: RwLock<Option<Duration>>,
    sends: AtomicU64,
}

impl LocalShuffleClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_server(&self, server: Arc<ShuffleServer>) {
        self.servers
            .write()
            .await
            .insert(server.info().clone(), server);
    }

    pub async fn server(&self, info: &ServerInfo) -> Option<Arc<ShuffleServer>> {
        self.servers.read().await.get(info).cloned()
    }

    /// Mark a server as down (`true`) or back up (`false`).
    pub async fn set_down(&self, info: &ServerInfo, down: bool) {
        let mut set = self.down.write().await;
        if down {
            set.insert(info.clone());
        } else {
            set.remove(info);
        }
    }

    /// Make every send to `info` answer `status`; `None` restores it.
    pub async fn fail_sends_with(&self, info: &ServerInfo, status: Option<StatusCode>) {
        let mut map = self.failing_sends.write().await;
        match status {
            Some(status) => map.insert(info.clone(), status),
            None => map.remove(info),
        };
    }

    /// Delay every send by `latency`.
    pub async fn set_send_latency(&self, latency: Option<Duration>) {
        *self.send_latency.write().await = latency;
    }

    /// Number of send calls seen, failed ones included.
    pub fn send_count(&self) -> u64 {
        self.sends.load(Ordering::Relaxed)
    }

    async fn reach(&self, info: &ServerInfo) -> Result<Arc<ShuffleServer>, RpcError> {
        if self.down.read().await.contains(info) {
            return Err(RpcError::Unreachable(info.clone()));
        }
        self.server(info)
            .await
            .ok_or_else(|| RpcError::Unreachable(info.clone()))
    }
}

fn rpc_error(server: &ServerInfo, error: ServerError) -> RpcError {
    RpcError::Server {
        server: server.clone(),
        status: status_of(&error),
        message: error.to_string(),
    }
}

#[async_trait::async_trait]
impl ShuffleServerClient for LocalShuffleClient {
    async fn send_shuffle_data(
        &self,
        server: &ServerInfo,
        request: SendShuffleDataRequest,
    ) -> Result<SendShuffleDataResponse, RpcError> {
        self.sends.fetch_add(1, Ordering::Relaxed);
        let latency = *self.send_latency.read().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let target = self.reach(server).await?;
        if let Some(status) = self.failing_sends.read().await.get(server) {
            debug!(%server, %status, "injected send failure");
            return Ok(SendShuffleDataResponse::failure(*status, "injected failure"));
        }
        Ok(target.handle_send(request))
    }

    async fn finish_shuffle(
        &self,
        server: &ServerInfo,
        request: FinishShuffleRequest,
    ) -> Result<bool, RpcError> {
        let target = self.reach(server).await?;
        match target.handle_finish(request).await {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!(%server, error = %e, "finish failed");
                Ok(false)
            }
        }
    }

    async fn report_shuffle_result(
        &self,
        server: &ServerInfo,
        request: ReportShuffleResultRequest,
    ) -> Result<(), RpcError> {
        let target = self.reach(server).await?;
        target.handle_report(&request);
        Ok(())
    }

    async fn get_shuffle_result(
        &self,
        server: &ServerInfo,
        request: GetShuffleResultRequest,
    ) -> Result<ExpectedBlockSet, RpcError> {
        let target = self.reach(server).await?;
        target
            .handle_get_result(&request)
            .map_err(|e| rpc_error(server, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::tests::block;
    use eddy_store::{MemoryTier, ShuffleStorage};

    async fn client_with_server() -> (LocalShuffleClient, ServerInfo) {
        let info = ServerInfo::new("s1", "localhost", 20001);
        let tier: Arc<dyn ShuffleStorage> = Arc::new(MemoryTier::new(1 << 20));
        let server = ShuffleServer::new(info.clone(), ServerConfig::default(), vec![tier]).unwrap();
        let client = LocalShuffleClient::new();
        client.add_server(server).await;
        (client, info)
    }

    fn request() -> SendShuffleDataRequest {
        SendShuffleDataRequest {
            app_id: "app".into(),
            shuffle_id: 0,
            stage_attempt: 0,
            blocks: vec![block(0, 1, 10)],
        }
    }

    #[tokio::test]
    async fn test_routes_to_server() {
        let (client, info) = client_with_server().await;
        let response = client.send_shuffle_data(&info, request()).await.unwrap();
        assert!(response.status.is_success());
        assert_eq!(client.server(&info).await.unwrap().store().used_bytes(), 10);
    }

    #[tokio::test]
    async fn test_down_server_is_unreachable() {
        let (client, info) = client_with_server().await;
        client.set_down(&info, true).await;
        let err = client.send_shuffle_data(&info, request()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::Unreachable);

        client.set_down(&info, false).await;
        assert!(client.send_shuffle_data(&info, request()).await.is_ok());
        assert_eq!(client.send_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_send_status() {
        let (client, info) = client_with_server().await;
        client
            .fail_sends_with(&info, Some(StatusCode::InternalError))
            .await;
        let response = client.send_shuffle_data(&info, request()).await.unwrap();
        assert_eq!(response.status, StatusCode::InternalError);
        assert_eq!(client.server(&info).await.unwrap().store().used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_unknown_shuffle_maps_to_no_register() {
        let (client, info) = client_with_server().await;
        let err = client
            .get_shuffle_result(
                &info,
                GetShuffleResultRequest {
                    app_id: "app".into(),
                    shuffle_id: 9,
                    partition_id: 0,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NoRegister);
    }
}
