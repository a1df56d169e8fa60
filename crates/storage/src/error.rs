#![forbid(unsafe_code)]

use rusqlite::ErrorCode;
use xt_core::FailureKind;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("unknown run: {ws}/{run_name}")]
    UnknownRun { ws: String, run_name: String },
    #[error("run already exists: {ws}/{run_name}")]
    RunExists { ws: String, run_name: String },
    #[error("blob not found: {container}/{path}")]
    BlobNotFound { container: String, path: String },
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("store temporarily unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sql(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            Self::Unavailable(_) => true,
            _ => false,
        }
    }

    pub fn kind(&self) -> FailureKind {
        if self.is_transient() {
            return FailureKind::StoreTransient;
        }
        match self {
            Self::Invariant(_) => FailureKind::InternalInvariant,
            Self::InvalidInput(_) => FailureKind::UserConfig,
            _ => FailureKind::StoreFatal,
        }
    }
}
