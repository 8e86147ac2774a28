//! Error types for RPC calls.

use eddy_types::ServerInfo;

use crate::StatusCode;

/// Errors a transport can return for a single call.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The remote end could not be reached at all.
    #[error("server {0} is unreachable")]
    Unreachable(ServerInfo),

    /// The server processed the call and answered with a failure status.
    #[error("server {server} answered {status}: {message}")]
    Server {
        server: ServerInfo,
        status: StatusCode,
        message: String,
    },

    /// No answer arrived in time.
    #[error("call to {0} timed out")]
    Timeout(ServerInfo),
}

impl RpcError {
    /// The status code recorded for this failure in send trackers.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unreachable(_) => StatusCode::Unreachable,
            Self::Server { status, .. } => *status,
            Self::Timeout(_) => StatusCode::Timeout,
        }
    }
}
