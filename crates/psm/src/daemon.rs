#![forbid(unsafe_code)]

use crate::config::PsmConfig;
use crate::error::PsmError;
use crate::process::{LaunchRequest, Launcher, ProcessProbe, kill_process_tree};
use crate::queue::{PsmQueue, QueueEntry};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use xt_core::context::{FN_CURRENT_ENTRY, FN_CURRENT_RUNNING_ENTRY};
use xt_core::packet::PacketName;
use xt_storage::unzip_into;

/// Pid of the wrapper launched for the current entry; removed once it exits.
pub const FN_CURRENT_PID: &str = "_current_running_pid_.txt";

const REJECTED_SUFFIX: &str = "rejected";

#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    /// Nothing queued.
    Idle { running: usize },
    /// Packets are waiting on a controller that is still running.
    Busy { running: usize },
    Launched(PacketName),
    /// The packet was dropped from the queue.
    Failed { packet: String, reason: String },
}

/// Drains the box queue one controller at a time, oldest ticks first.
pub struct PsmDaemon<P, L> {
    cfg: PsmConfig,
    queue: PsmQueue,
    probe: P,
    launcher: L,
    stop: Arc<AtomicBool>,
}

impl<P: ProcessProbe, L: Launcher> PsmDaemon<P, L> {
    pub fn new(cfg: PsmConfig, probe: P, launcher: L) -> Result<Self, PsmError> {
        let queue = PsmQueue::open(cfg.queue_dir())?;
        std::fs::create_dir_all(cfg.logs_dir())?;
        Ok(Self {
            cfg,
            queue,
            probe,
            launcher,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &PsmConfig {
        &self.cfg
    }

    pub fn queue(&self) -> &PsmQueue {
        &self.queue
    }

    pub fn launcher_mut(&mut self) -> &mut L {
        &mut self.launcher
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Controllers and wrapper scripts alive on this box.
    pub fn running(&mut self) -> usize {
        let needles = [
            self.cfg.controller_bin.as_str(),
            self.cfg.controller_script.as_str(),
        ];
        self.probe.count_running(&needles) + self.launcher.running()
    }

    pub fn run(&mut self) {
        let poll = Duration::from_millis(self.cfg.poll_ms);
        tracing::info!(queue = %self.queue.dir().display(), once = self.cfg.once, "psm started");
        while !self.stop.load(Ordering::SeqCst) {
            match self.step() {
                StepOutcome::Launched(_) => continue,
                StepOutcome::Idle { running: 0 } if self.cfg.once => break,
                _ => std::thread::sleep(poll),
            }
        }
        tracing::info!("psm stopped");
    }

    /// One scan of the queue: launch the oldest packet if the box is free.
    pub fn step(&mut self) -> StepOutcome {
        self.reject_invalid();
        let next = match self.queue.next_entry() {
            Ok(next) => next,
            Err(err) => {
                tracing::warn!(error = %err, "queue scan failed");
                return StepOutcome::Failed {
                    packet: String::new(),
                    reason: err.to_string(),
                };
            }
        };
        let running = self.running();
        if running == 0 {
            let _ = std::fs::remove_file(self.cfg.cwd().join(FN_CURRENT_PID));
        }
        let Some(entry) = next else {
            return StepOutcome::Idle { running };
        };
        if running > 0 {
            return StepOutcome::Busy { running };
        }
        match self.launch_entry(&entry) {
            Ok(_) => StepOutcome::Launched(entry.name),
            Err(err) => {
                tracing::error!(packet = %entry.file_name, error = %err, kind = ?err.kind(), "packet failed");
                let _ = std::fs::remove_file(&entry.path);
                StepOutcome::Failed {
                    packet: entry.file_name,
                    reason: err.to_string(),
                }
            }
        }
    }

    fn launch_entry(&mut self, entry: &QueueEntry) -> Result<u32, PsmError> {
        let cwd = self.cfg.cwd();
        clean_dir(&cwd)?;
        let current = cwd.join(FN_CURRENT_ENTRY);
        std::fs::copy(&entry.path, &current)?;
        std::fs::remove_file(&entry.path)?;
        unzip_into(&current, &cwd)?;
        std::fs::write(cwd.join(FN_CURRENT_RUNNING_ENTRY), &entry.file_name)?;

        let script = cwd.join(&self.cfg.controller_script);
        if !script.is_file() {
            return Err(PsmError::MissingScript {
                packet: entry.file_name.clone(),
                script: self.cfg.controller_script.clone(),
            });
        }
        let request = LaunchRequest {
            script,
            cwd: cwd.clone(),
            args: vec![entry.name.node_id.to_string(), entry.name.run_name.clone()],
            log_path: self.cfg.logs_dir().join(format!("{}.log", entry.name.stem())),
        };
        let pid = self.launcher.launch(&request)?;
        std::fs::write(cwd.join(FN_CURRENT_PID), pid.to_string())?;
        tracing::info!(
            packet = %entry.file_name,
            job_id = %entry.name.job_id,
            node_id = %entry.name.node_id,
            run_name = %entry.name.run_name,
            pid,
            "controller launched"
        );
        Ok(pid)
    }

    fn reject_invalid(&self) {
        let invalid = match self.queue.invalid_entries() {
            Ok(invalid) => invalid,
            Err(err) => {
                tracing::warn!(error = %err, "queue scan failed");
                return;
            }
        };
        for path in invalid {
            let mut rejected = path.clone().into_os_string();
            rejected.push(format!(".{REJECTED_SUFFIX}"));
            tracing::warn!(packet = %path.display(), "unparsable packet name; set aside");
            if let Err(err) = std::fs::rename(&path, &rejected) {
                tracing::warn!(packet = %path.display(), error = %err, "could not set packet aside");
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

fn clean_dir(dir: &Path) -> Result<(), PsmError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

fn read_trimmed(path: &Path) -> Result<Option<String>, PsmError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text.trim().to_string()).filter(|s| !s.is_empty())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// The packet currently (or last) handed to a controller.
pub fn current_entry(cfg: &PsmConfig) -> Result<Option<String>, PsmError> {
    read_trimmed(&cfg.cwd().join(FN_CURRENT_RUNNING_ENTRY))
}

/// Kill the controller started for the current entry. Returns the packet
/// name when a live controller was signalled.
pub fn cancel_running(cfg: &PsmConfig) -> Result<Option<String>, PsmError> {
    let Some(packet) = current_entry(cfg)? else {
        return Ok(None);
    };
    let pid_path = cfg.cwd().join(FN_CURRENT_PID);
    let Some(pid) = read_trimmed(&pid_path)?.and_then(|raw| raw.parse::<u32>().ok()) else {
        return Ok(None);
    };
    kill_process_tree(pid);
    let _ = std::fs::remove_file(&pid_path);
    tracing::info!(packet = %packet, pid, "running controller cancelled");
    Ok(Some(packet))
}
