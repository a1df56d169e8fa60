#![forbid(unsafe_code)]

//! Durable state shared by the node controllers of a job: the metadata store
//! (jobs, runs, log events, counters, documents), the object store (code
//! snapshots, per-run artifacts), and the Run Index built on top of them.

mod archive;
mod error;
mod metadata;
mod object;
mod retry;
mod run_index;
mod sqlite;

pub use archive::{unzip_into, zip_dir};
pub use error::StoreError;
pub use metadata::{
    ActiveRunEntry, ElemCond, ElemMatch, FindAndModify, JobDoc, MetadataStore, RunEnd, RunRecord,
    COLLECTION_JOBS,
};
pub use object::{FsObjectStore, ObjectStore, blob_sha256};
pub use retry::RetryPolicy;
pub use run_index::{RunIndex, plan_active_runs};
pub use sqlite::SqliteStore;
