#![forbid(unsafe_code)]

use xt_core::FailureKind;
use xt_search::SearchError;
use xt_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("launch of {run_name} failed: {reason}")]
    Launch { run_name: String, reason: String },
    #[error("unknown run: {ws}/{run_name}")]
    UnknownRun { ws: String, run_name: String },
    #[error("service error: invalid token")]
    Unauthorized,
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl ControllerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Config(_) | Self::Search(_) | Self::UnknownRun { .. } | Self::Unauthorized => {
                FailureKind::UserConfig
            }
            Self::Store(err) => err.kind(),
            Self::Launch { .. } => FailureKind::LaunchFailure,
            Self::Invariant(_) => FailureKind::InternalInvariant,
            Self::Io(_) | Self::Json(_) | Self::Rpc { .. } => FailureKind::StoreFatal,
        }
    }

    /// JSON-RPC error code used when this error answers a request.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::Unauthorized => -32001,
            Self::Config(_) | Self::UnknownRun { .. } | Self::Search(_) => -32602,
            Self::Rpc { code, .. } => *code,
            _ => -32000,
        }
    }
}
