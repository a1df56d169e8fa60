#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use xt_core::ids::NodeId;
use xt_core::packet::PacketName;
use xt_psm::{LaunchRequest, Launcher, ProcessProbe, PsmConfig, PsmError, PsmQueue};
use xt_storage::zip_dir;

pub(crate) const WS: &str = "tpx";

pub(crate) fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("xt_psm_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub(crate) fn config(dir: &Path) -> PsmConfig {
    let mut cfg = PsmConfig::rooted(&dir.join("xt"));
    cfg.poll_ms = 10;
    cfg
}

pub(crate) fn packet_name(run_name: &str, ticks: i64) -> PacketName {
    PacketName {
        team: "xt".to_string(),
        job_id: "job1".to_string(),
        run_name: run_name.to_string(),
        node_id: NodeId::from_index(0),
        ticks,
    }
}

/// Zip a tree holding the controller script (when given) and enqueue it.
pub(crate) fn queue_packet(
    queue: &PsmQueue,
    cfg: &PsmConfig,
    name: &PacketName,
    script: Option<&str>,
) -> PathBuf {
    let staging = queue
        .dir()
        .parent()
        .expect("queue parent")
        .join(format!("staging_{}", name.stem()));
    std::fs::create_dir_all(&staging).expect("staging");
    std::fs::write(staging.join("train.py"), "print('hi')\n").expect("code");
    if let Some(body) = script {
        std::fs::write(staging.join(&cfg.controller_script), body).expect("script");
    }
    let zip = staging.with_extension("zip.src");
    zip_dir(&staging, &zip, &[]).expect("zip");
    queue.enqueue(&zip, name).expect("enqueue")
}

/// Sees no processes; the daemon then relies on its launcher alone.
#[derive(Clone, Debug, Default)]
pub(crate) struct NoProcesses;

impl ProcessProbe for NoProcesses {
    fn find(&mut self, _needle: &str) -> Vec<u32> {
        Vec::new()
    }
}

/// Records launches; `live` stands in for controllers still running.
#[derive(Clone, Default)]
pub(crate) struct FakeLauncher {
    pub launched: Arc<Mutex<Vec<LaunchRequest>>>,
    pub live: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn finish_all(&self) {
        self.live.store(0, Ordering::SeqCst);
    }

    pub fn launched_runs(&self) -> Vec<String> {
        self.launched
            .lock()
            .expect("lock")
            .iter()
            .map(|r| r.args[1].clone())
            .collect()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&mut self, request: &LaunchRequest) -> Result<u32, PsmError> {
        self.launched.lock().expect("lock").push(request.clone());
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(4242)
    }

    fn running(&mut self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

pub(crate) fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    pred()
}
