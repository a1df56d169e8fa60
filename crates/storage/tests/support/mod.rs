#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use xt_core::ids::job_id_from_seq;
use xt_core::status::{JobStatus, Schedule};
use xt_storage::{
    JobDoc, MetadataStore, RetryPolicy, RunIndex, SqliteStore, plan_active_runs,
};

pub(crate) const WS: &str = "tpx";

pub(crate) fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("xt_storage_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub(crate) fn open_store(dir: &PathBuf) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(dir).expect("open store"))
}

pub(crate) fn run_index(store: Arc<SqliteStore>) -> RunIndex {
    RunIndex::new(store, RetryPolicy::fast(25))
}

pub(crate) fn create_job(
    store: &SqliteStore,
    run_count: usize,
    node_count: usize,
    schedule: Schedule,
) -> String {
    let job_id = job_id_from_seq(store.next_job_id().expect("job id"));
    let job = JobDoc {
        job_id: job_id.clone(),
        ws: WS.to_string(),
        exper_name: "exp".to_string(),
        username: "tester".to_string(),
        schedule,
        run_count,
        node_count,
        primary_metric: Some("acc".to_string()),
        maximize_metric: true,
        search_type: None,
        hp_config: None,
        service_info_by_node: Default::default(),
        parent_by_node: Default::default(),
        running_nodes: 0,
        running_runs: 0,
        completed_runs: 0,
        error_runs: 0,
        job_status: JobStatus::Created,
        create_time: xt_core::time::now_rfc3339(),
        active_runs: plan_active_runs(run_count, node_count, schedule),
    };
    store.create_job(&job).expect("create job");
    job_id
}
