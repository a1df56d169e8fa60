#![forbid(unsafe_code)]
#![allow(dead_code)]

use serde_json::json;
use std::path::PathBuf;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use xt_controller::{ControllerConfig, NodeController};
use xt_core::context::{MultiRunContext, NodeRuns, RunContext};
use xt_core::ids::job_id_from_seq;
use xt_core::status::{JobStatus, RunStatus, Schedule, SearchStyle};
use xt_storage::{
    FsObjectStore, JobDoc, MetadataStore, ObjectStore, RetryPolicy, SqliteStore, StoreError,
    plan_active_runs,
};

pub(crate) const WS: &str = "tpx";
pub(crate) const SECRET: &str = "box-secret-1";

pub(crate) fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("xt_controller_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// A controller rooted in a temp dir with its scheduler loop on a thread.
pub(crate) struct Harness {
    pub(crate) dir: PathBuf,
    pub(crate) store: Arc<SqliteStore>,
    pub(crate) objects: Arc<FsObjectStore>,
    pub(crate) controller: Arc<NodeController>,
    scheduler: Option<JoinHandle<()>>,
}

impl Harness {
    pub(crate) fn new(test_name: &str) -> Self {
        Self::with_config(test_name, |_| {})
    }

    pub(crate) fn with_config(test_name: &str, tweak: impl FnOnce(&mut ControllerConfig)) -> Self {
        Self::build(test_name, tweak, |objects| objects as Arc<dyn ObjectStore>)
    }

    /// Like `new`, with the controller talking to the object store through
    /// `wrap`. The harness still reads blobs from the directory store.
    pub(crate) fn with_object_store(
        test_name: &str,
        wrap: impl FnOnce(Arc<FsObjectStore>) -> Arc<dyn ObjectStore>,
    ) -> Self {
        Self::build(test_name, |_| {}, wrap)
    }

    fn build(
        test_name: &str,
        tweak: impl FnOnce(&mut ControllerConfig),
        wrap: impl FnOnce(Arc<FsObjectStore>) -> Arc<dyn ObjectStore>,
    ) -> Self {
        let dir = temp_dir(test_name);
        let mut cfg = ControllerConfig::rooted(&dir.join("xt"));
        cfg.hold_open = true;
        cfg.tick_ms = 10;
        cfg.box_secret = SECRET.to_string();
        tweak(&mut cfg);

        let store = Arc::new(SqliteStore::open(&cfg.storage_dir).expect("open store"));
        let objects = Arc::new(FsObjectStore::open(&cfg.store_dir).expect("open objects"));
        let controller = NodeController::with_retry(
            cfg,
            store.clone() as Arc<dyn MetadataStore>,
            wrap(objects.clone()),
            RetryPolicy::fast(5),
        )
        .expect("controller");
        Self {
            dir,
            store,
            objects,
            controller,
            scheduler: None,
        }
    }

    pub(crate) fn start(&mut self) {
        let controller = self.controller.clone();
        self.scheduler = Some(std::thread::spawn(move || {
            let _ = controller.run_loop();
        }));
    }

    pub(crate) fn cwd(&self) -> PathBuf {
        self.controller.config().cwd.clone()
    }

    pub(crate) fn run_status(&self, run_name: &str) -> Option<RunStatus> {
        self.store
            .get_run(WS, run_name)
            .expect("get run")
            .map(|r| r.status)
    }

    pub(crate) fn wait_for_status(&self, run_name: &str, want: RunStatus) -> bool {
        wait_until(Duration::from_secs(20), || {
            self.run_status(run_name) == Some(want)
        })
    }

    pub(crate) fn wait_for_live_status(&self, run_name: &str, want: RunStatus) -> bool {
        wait_until(Duration::from_secs(20), || {
            self.controller
                .find_run(WS, run_name)
                .is_some_and(|r| r.status() == want)
        })
    }

    pub(crate) fn wait_idle(&self) -> bool {
        wait_until(Duration::from_secs(30), || self.controller.is_idle())
    }

    pub(crate) fn events(&self, run_name: &str) -> Vec<String> {
        self.store
            .run_events(WS, run_name)
            .expect("events")
            .into_iter()
            .map(|e| e.event)
            .collect()
    }

    pub(crate) fn create_job(&self, run_count: usize, schedule: Schedule) -> String {
        let job_id = job_id_from_seq(self.store.next_job_id().expect("job id"));
        let job = JobDoc {
            job_id: job_id.clone(),
            ws: WS.to_string(),
            exper_name: "exp".to_string(),
            username: "tester".to_string(),
            schedule,
            run_count,
            node_count: 1,
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
            active_runs: plan_active_runs(run_count, 1, schedule),
        };
        self.store.create_job(&job).expect("create job");
        job_id
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.controller.cancel_run(None, None);
        self.controller.shutdown();
        if let Some(handle) = self.scheduler.take() {
            let _ = handle.join();
        }
        self.controller.wait_for_wrapups(Duration::from_secs(10));
    }
}

pub(crate) fn run_context(run_name: &str, job_id: &str, cmd: &[&str]) -> RunContext {
    serde_json::from_value(json!({
        "ws": WS,
        "run_name": run_name,
        "job_id": job_id,
        "node_index": 0,
        "exper_name": "exp",
        "username": "tester",
        "cmd_parts": cmd,
    }))
    .expect("run context")
}

pub(crate) fn multi_run_context(
    search_style: SearchStyle,
    cmds: &[&str],
    runs: Vec<RunContext>,
) -> MultiRunContext {
    let mut mrc = MultiRunContext {
        search_style,
        cmds: cmds.iter().map(|c| c.to_string()).collect(),
        ..Default::default()
    };
    mrc.context_by_nodes
        .insert("node0".to_string(), NodeRuns { runs });
    mrc
}

pub(crate) fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    done()
}

/// Directory store whose first `failures` uploads report a transient outage.
pub(crate) struct FlakyUploads {
    inner: Arc<FsObjectStore>,
    failures: AtomicUsize,
    pub(crate) failed: AtomicUsize,
}

impl FlakyUploads {
    pub(crate) fn new(inner: Arc<FsObjectStore>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            failed: AtomicUsize::new(0),
        }
    }
}

impl ObjectStore for FlakyUploads {
    fn create_container(&self, container: &str) -> Result<(), StoreError> {
        self.inner.create_container(container)
    }
    fn list_containers(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_containers()
    }
    fn delete_container(&self, container: &str) -> Result<(), StoreError> {
        self.inner.delete_container(container)
    }
    fn create_blob(&self, container: &str, path: &str, data: &[u8]) -> Result<(), StoreError> {
        self.inner.create_blob(container, path, data)
    }
    fn append_blob(&self, container: &str, path: &str, data: &[u8]) -> Result<(), StoreError> {
        self.inner.append_blob(container, path, data)
    }
    fn blob_exists(&self, container: &str, path: &str) -> Result<bool, StoreError> {
        self.inner.blob_exists(container, path)
    }
    fn read_blob(&self, container: &str, path: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.read_blob(container, path)
    }
    fn download(&self, container: &str, path: &str, dest: &Path) -> Result<(), StoreError> {
        self.inner.download(container, path, dest)
    }
    fn upload(&self, container: &str, path: &str, src: &Path) -> Result<(), StoreError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable(format!("upload {path}")));
        }
        self.inner.upload(container, path, src)
    }
    fn delete_blob(&self, container: &str, path: &str) -> Result<(), StoreError> {
        self.inner.delete_blob(container, path)
    }
    fn copy_blob(&self, container: &str, src: &str, dest: &str) -> Result<(), StoreError> {
        self.inner.copy_blob(container, src, dest)
    }
    fn snapshot_blob(&self, container: &str, path: &str) -> Result<String, StoreError> {
        self.inner.snapshot_blob(container, path)
    }
    fn list_blobs(
        &self,
        container: &str,
        prefix: &str,
        delimiter: Option<char>,
    ) -> Result<Vec<String>, StoreError> {
        self.inner.list_blobs(container, prefix, delimiter)
    }
    fn blob_digest(&self, container: &str, path: &str) -> Result<String, StoreError> {
        self.inner.blob_digest(container, path)
    }
}
