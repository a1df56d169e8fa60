#![forbid(unsafe_code)]

use crate::error::PsmError;
use crate::process::{ProcessProbe, kill_process_tree};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq)]
pub struct PsmInstall {
    /// The binary the client ships.
    pub local_binary: PathBuf,
    /// Where the box runs it from.
    pub box_binary: PathBuf,
    pub xt_dir: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    AlreadyRunning,
    Started,
    /// The box binary differed; it was replaced and the daemon restarted.
    Restarted,
}

fn file_sha256(path: &Path) -> Result<Option<String>, PsmError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(Some(format!("{:x}", hasher.finalize())))
}

/// Make sure the box runs the same PSM binary as the client, and that one
/// is running. Blocks until the probe sees a live daemon.
pub fn ensure_psm_running(
    install: &PsmInstall,
    probe: &mut dyn ProcessProbe,
    timeout: Duration,
) -> Result<EnsureOutcome, PsmError> {
    let needle = install.box_binary.to_string_lossy().into_owned();
    let local = file_sha256(&install.local_binary)?.ok_or_else(|| {
        PsmError::Config(format!("{} does not exist", install.local_binary.display()))
    })?;
    let same = file_sha256(&install.box_binary)?.as_deref() == Some(local.as_str());
    let running = probe.find(&needle);

    if same && !running.is_empty() {
        return Ok(EnsureOutcome::AlreadyRunning);
    }
    let outcome = if running.is_empty() {
        EnsureOutcome::Started
    } else {
        EnsureOutcome::Restarted
    };
    for pid in &running {
        tracing::info!(pid, "stopping outdated psm");
        kill_process_tree(*pid);
    }
    if !same {
        install_binary(&install.local_binary, &install.box_binary)?;
    }
    start_psm(install)?;

    let started = Instant::now();
    loop {
        if probe.find(&needle).iter().any(|pid| !running.contains(pid)) {
            tracing::info!(outcome = ?outcome, binary = %needle, "psm running");
            return Ok(outcome);
        }
        if started.elapsed() >= timeout {
            return Err(PsmError::NotRunning {
                waited_ms: started.elapsed().as_millis(),
            });
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Copy through a temp name so a running daemon never sees a partial file.
fn install_binary(src: &Path, dest: &Path) -> Result<(), PsmError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = dest.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = dest.with_file_name(tmp_name);
    std::fs::copy(src, &tmp)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o755))?;
    }
    std::fs::rename(&tmp, dest)?;
    Ok(())
}

fn start_psm(install: &PsmInstall) -> Result<(), PsmError> {
    let logs = install.xt_dir.join("psm_logs");
    std::fs::create_dir_all(&logs)?;
    let log = File::options()
        .create(true)
        .append(true)
        .open(logs.join("psm.log"))?;
    let mut cmd = Command::new(&install.box_binary);
    cmd.arg("--xt-dir")
        .arg(&install.xt_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let child = cmd
        .spawn()
        .map_err(|e| PsmError::Launch(format!("{}: {e}", install.box_binary.display())))?;
    tracing::info!(pid = child.id(), binary = %install.box_binary.display(), "psm started");
    Ok(())
}
