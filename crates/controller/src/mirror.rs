#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use xt_storage::{ObjectStore, RetryPolicy};

/// Periodically uploads files matching a glob under a run's rundir to
/// `runs/<run>/mirrored/`, with a final sync on stop.
pub(crate) struct MirrorWorker {
    stop: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct MirrorTarget {
    pub(crate) objects: Arc<dyn ObjectStore>,
    pub(crate) retry: RetryPolicy,
    pub(crate) ws: String,
    pub(crate) run_name: String,
    pub(crate) rundir: PathBuf,
    pub(crate) pattern: String,
}

impl MirrorWorker {
    pub(crate) fn start(target: MirrorTarget, interval: Duration) -> Self {
        let (stop, rx) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            let mut seen = HashMap::new();
            loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        sync_once(&target, &mut seen);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        sync_once(&target, &mut seen);
                        break;
                    }
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub(crate) fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Upload matches whose size or mtime changed since the last pass.
fn sync_once(target: &MirrorTarget, seen: &mut HashMap<PathBuf, (u64, SystemTime)>) -> usize {
    let mut uploaded = 0;
    for path in matching_files(&target.rundir, &target.pattern) {
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        let stamp = (meta.len(), meta.modified().unwrap_or(SystemTime::UNIX_EPOCH));
        if seen.get(&path) == Some(&stamp) {
            continue;
        }
        let Some(rel) = relative_blob_path(&target.rundir, &path) else {
            continue;
        };
        let blob = format!("runs/{}/mirrored/{rel}", target.run_name);
        let uploaded_one = target
            .retry
            .run("mirror_upload", || target.objects.upload(&target.ws, &blob, &path));
        match uploaded_one {
            Ok(()) => {
                seen.insert(path, stamp);
                uploaded += 1;
            }
            Err(err) => {
                tracing::warn!(run_name = %target.run_name, blob = %blob, error = %err, "mirror upload failed");
            }
        }
    }
    if uploaded > 0 {
        tracing::debug!(run_name = %target.run_name, uploaded, "mirrored files");
    }
    uploaded
}

/// Files under `root` matching `pattern` (relative to `root`).
pub(crate) fn matching_files(root: &Path, pattern: &str) -> Vec<PathBuf> {
    let full = root.join(pattern);
    let Ok(paths) = glob::glob(&full.to_string_lossy()) else {
        tracing::warn!(pattern, "invalid file pattern");
        return Vec::new();
    };
    paths.flatten().filter(|p| p.is_file()).collect()
}

pub(crate) fn relative_blob_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xt_storage::FsObjectStore;

    #[test]
    fn final_sync_uploads_changed_files_once() {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("xt_mirror_{}_{nonce}", std::process::id()));
        let rundir = dir.join("rundir0");
        std::fs::create_dir_all(rundir.join("output")).expect("mkdir");
        std::fs::write(rundir.join("output/log.txt"), b"step 1").expect("write");
        std::fs::write(rundir.join("skip.bin"), b"x").expect("write");
        let objects: Arc<dyn ObjectStore> =
            Arc::new(FsObjectStore::open(dir.join("store")).expect("store"));

        let target = MirrorTarget {
            objects: objects.clone(),
            retry: RetryPolicy::none(),
            ws: "ws".into(),
            run_name: "run1".into(),
            rundir,
            pattern: "output/*".into(),
        };
        let mut seen = HashMap::new();
        assert_eq!(sync_once(&target, &mut seen), 1);
        assert_eq!(sync_once(&target, &mut seen), 0);

        let worker = MirrorWorker::start(target, Duration::from_secs(3600));
        worker.stop();
        assert_eq!(
            objects
                .read_blob("ws", "runs/run1/mirrored/output/log.txt")
                .expect("blob"),
            b"step 1"
        );
        assert!(
            !objects
                .blob_exists("ws", "runs/run1/mirrored/skip.bin")
                .expect("exists")
        );
    }
}
