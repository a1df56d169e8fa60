#![forbid(unsafe_code)]

//! Process probing and launching for the daemon loop.

use crate::error::PsmError;
use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

/// Finds live processes by command line.
pub trait ProcessProbe: Send {
    /// Pids whose command line contains `needle`, excluding this process.
    fn find(&mut self, needle: &str) -> Vec<u32>;

    fn count_running(&mut self, needles: &[&str]) -> usize {
        let mut pids = needles
            .iter()
            .flat_map(|needle| self.find(needle))
            .collect::<Vec<_>>();
        pids.sort_unstable();
        pids.dedup();
        pids.len()
    }
}

/// Scans `/proc/*/cmdline`. Elsewhere it sees nothing and the daemon relies
/// on the children its launcher tracks.
#[derive(Clone, Debug, Default)]
pub struct ProcScanProbe;

impl ProcessProbe for ProcScanProbe {
    fn find(&mut self, needle: &str) -> Vec<u32> {
        if needle.is_empty() {
            return Vec::new();
        }
        let own = std::process::id();
        proc_cmdlines()
            .into_iter()
            .filter(|(pid, cmdline)| *pid != own && cmdline.contains(needle))
            .map(|(pid, _)| pid)
            .collect()
    }
}

#[cfg(target_os = "linux")]
fn proc_cmdlines() -> Vec<(u32, String)> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
            let raw = std::fs::read(entry.path().join("cmdline")).ok()?;
            if raw.is_empty() {
                return None;
            }
            let cmdline = raw
                .split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(String::from_utf8_lossy)
                .collect::<Vec<_>>()
                .join(" ");
            Some((pid, cmdline))
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn proc_cmdlines() -> Vec<(u32, String)> {
    Vec::new()
}

#[derive(Clone, Debug, PartialEq)]
pub struct LaunchRequest {
    pub script: PathBuf,
    pub cwd: PathBuf,
    pub args: Vec<String>,
    pub log_path: PathBuf,
}

/// Starts the controller wrapper for a packet.
pub trait Launcher: Send {
    /// Returns the pid of the started process.
    fn launch(&mut self, request: &LaunchRequest) -> Result<u32, PsmError>;

    /// Launched processes that have not exited yet.
    fn running(&mut self) -> usize;
}

/// Runs wrapper scripts through the platform shell and reaps them.
#[derive(Debug, Default)]
pub struct ShellLauncher {
    children: Vec<Child>,
}

impl ShellLauncher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Launcher for ShellLauncher {
    fn launch(&mut self, request: &LaunchRequest) -> Result<u32, PsmError> {
        if let Some(parent) = request.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = File::create(&request.log_path)?;
        let mut cmd = script_command(&request.script);
        cmd.args(&request.args)
            .current_dir(&request.cwd)
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
            .map_err(|e| PsmError::Launch(format!("{}: {e}", request.script.display())))?;
        let pid = child.id();
        self.children.push(child);
        Ok(pid)
    }

    fn running(&mut self) -> usize {
        self.children
            .retain_mut(|child| matches!(child.try_wait(), Ok(None)));
        self.children.len()
    }
}

#[cfg(windows)]
fn script_command(script: &std::path::Path) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(script);
    cmd
}

#[cfg(not(windows))]
fn script_command(script: &std::path::Path) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("--login").arg(script);
    cmd
}

/// Kill `pid` and everything in its process group.
pub fn kill_process_tree(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill, killpg};
        use nix::unistd::Pid;
        let Ok(raw) = i32::try_from(pid) else {
            return;
        };
        if killpg(Pid::from_raw(raw), Signal::SIGKILL).is_err() {
            let _ = kill(Pid::from_raw(raw), Signal::SIGKILL);
        }
    }
    #[cfg(windows)]
    {
        let _ = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn probe_finds_children_by_command_line() {
        let marker = format!("xt-probe-marker-{}", std::process::id());
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(format!("sleep 5; true # {marker}"))
            .spawn()
            .expect("spawn");
        let mut probe = ProcScanProbe;
        let pids = probe.find(&marker);
        assert_eq!(pids, vec![child.id()]);
        assert_eq!(probe.count_running(&[marker.as_str(), "sleep 5; true"]), 1);
        child.kill().expect("kill");
        let _ = child.wait();
        assert!(probe.find(&marker).is_empty());
    }
}
