#![forbid(unsafe_code)]

use xt_core::FailureKind;
use xt_core::packet::PacketNameError;
use xt_search::SearchError;
use xt_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PsmError {
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Packet(#[from] PacketNameError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("packet {packet} has no controller script {script}")]
    MissingScript { packet: String, script: String },
    #[error("launch failed: {0}")]
    Launch(String),
    #[error("psm not running after {waited_ms} ms")]
    NotRunning { waited_ms: u128 },
}

impl PsmError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Config(_) | Self::Search(_) | Self::Packet(_) | Self::MissingScript { .. } => {
                FailureKind::UserConfig
            }
            Self::Store(err) => err.kind(),
            Self::Launch(_) | Self::NotRunning { .. } => FailureKind::LaunchFailure,
            Self::Io(_) | Self::Json(_) => FailureKind::StoreFatal,
        }
    }
}
