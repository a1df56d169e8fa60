#![forbid(unsafe_code)]

use crate::error::PsmError;
use std::path::{Path, PathBuf};

pub const DEFAULT_POLL_MS: u64 = 1000;
pub const DEFAULT_CONTROLLER_BIN: &str = "xt-controller";

#[cfg(windows)]
pub const DEFAULT_CONTROLLER_SCRIPT: &str = "__xt_controller__.bat";
#[cfg(not(windows))]
pub const DEFAULT_CONTROLLER_SCRIPT: &str = "__xt_controller__.sh";

#[derive(Clone, Debug, PartialEq)]
pub struct PsmConfig {
    pub xt_dir: PathBuf,
    pub poll_ms: u64,
    /// Wrapper script inside each packet that starts the controller.
    pub controller_script: String,
    /// Process name counted as a running controller.
    pub controller_bin: String,
    /// Exit once the queue is empty and nothing is running.
    pub once: bool,
}

impl PsmConfig {
    pub fn rooted(xt_dir: &Path) -> Self {
        Self {
            xt_dir: xt_dir.to_path_buf(),
            poll_ms: DEFAULT_POLL_MS,
            controller_script: DEFAULT_CONTROLLER_SCRIPT.to_string(),
            controller_bin: DEFAULT_CONTROLLER_BIN.to_string(),
            once: false,
        }
    }

    pub fn from_args(args: &[String]) -> Result<Self, PsmError> {
        let xt_dir = value(args, "--xt-dir", "XT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_xt_dir);
        let mut cfg = Self::rooted(&xt_dir);
        if let Some(raw) = value(args, "--poll-ms", "XT_PSM_POLL_MS") {
            cfg.poll_ms = raw
                .parse::<u64>()
                .map_err(|_| PsmError::Config(format!("--poll-ms expects a number, got {raw:?}")))?
                .max(1);
        }
        if let Some(script) = value(args, "--controller-script", "XT_PSM_CONTROLLER_SCRIPT") {
            if script.contains(['/', '\\']) {
                return Err(PsmError::Config(format!(
                    "--controller-script must be a file name, got {script:?}"
                )));
            }
            cfg.controller_script = script;
        }
        if let Some(bin) = value(args, "--controller-bin", "XT_PSM_CONTROLLER_BIN") {
            cfg.controller_bin = bin;
        }
        cfg.once = args.iter().any(|a| a == "--once");
        Ok(cfg)
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.xt_dir.join("psm_queue")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.xt_dir.join("psm_logs")
    }

    pub fn cwd(&self) -> PathBuf {
        self.xt_dir.join("cwd")
    }
}

pub fn default_xt_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".xt")
}

fn value(args: &[String], flag: &str, env: &str) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg.as_str() == flag
            && let Some(value) = iter.next()
        {
            return Some(value.clone());
        }
    }
    env_var(env)
}

pub(crate) fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn layout_hangs_off_the_xt_dir() {
        let cfg = PsmConfig::from_args(&args(&["--xt-dir", "/box/.xt", "--poll-ms", "20", "--once"]))
            .expect("config");
        assert_eq!(cfg.queue_dir(), PathBuf::from("/box/.xt/psm_queue"));
        assert_eq!(cfg.logs_dir(), PathBuf::from("/box/.xt/psm_logs"));
        assert_eq!(cfg.cwd(), PathBuf::from("/box/.xt/cwd"));
        assert_eq!(cfg.poll_ms, 20);
        assert!(cfg.once);
    }

    #[test]
    fn script_must_be_a_bare_name() {
        let err = PsmConfig::from_args(&args(&["--controller-script", "../evil.sh"]))
            .expect_err("path rejected");
        assert!(matches!(err, PsmError::Config(_)));
        assert!(PsmConfig::from_args(&args(&["--poll-ms", "soon"])).is_err());
    }
}
