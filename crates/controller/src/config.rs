#![forbid(unsafe_code)]

use crate::error::ControllerError;
use base64::Engine as _;
use std::path::{Path, PathBuf};
use xt_core::ids::NodeId;

pub const DEFAULT_PORT: u16 = 18861;
pub const DEFAULT_TICK_MS: u64 = 1000;

#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    pub node_id: NodeId,
    /// Restricts the multi-run context to one job when set.
    pub job_id: Option<String>,
    pub workspace: Option<String>,
    /// Maximum simultaneous user processes; -1 means unlimited.
    pub concurrent: i64,
    pub hold_open: bool,
    pub is_aml: bool,
    pub port: u16,
    pub box_secret: String,
    /// Metadata database directory.
    pub storage_dir: PathBuf,
    /// Object store root.
    pub store_dir: PathBuf,
    /// Rundirs, consoles and the all-runs files live here.
    pub work_dir: PathBuf,
    /// Unzipped job packet.
    pub cwd: PathBuf,
    pub tick_ms: u64,
    pub report_rollup: bool,
    /// Upper bound on rundir slots; 0 grows on demand.
    pub max_rundirs: usize,
    /// base64 PEM handed to children as `XT_SERVER_CERT`.
    pub server_cert: Option<String>,
}

impl ControllerConfig {
    /// Defaults rooted at an `.xt` style directory.
    pub fn rooted(xt_dir: &Path) -> Self {
        Self {
            node_id: NodeId::from_index(0),
            job_id: None,
            workspace: None,
            concurrent: 1,
            hold_open: false,
            is_aml: false,
            port: DEFAULT_PORT,
            box_secret: String::new(),
            storage_dir: xt_dir.join("metadata"),
            store_dir: xt_dir.join("store"),
            work_dir: xt_dir.join("work"),
            cwd: xt_dir.join("cwd"),
            tick_ms: DEFAULT_TICK_MS,
            report_rollup: false,
            max_rundirs: 0,
            server_cert: None,
        }
    }

    /// Flags win over `XT_*` environment variables, which win over defaults.
    pub fn from_args(args: &[String]) -> Result<Self, ControllerError> {
        let xt_dir = value(args, "--xt-dir", "XT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_xt_dir);
        let mut cfg = Self::rooted(&xt_dir);

        if let Some(raw) = value(args, "--node-id", "XT_NODE_ID") {
            cfg.node_id = NodeId::parse(&raw)
                .map_err(|e| ControllerError::Config(format!("--node-id {raw}: {e}")))?;
        }
        cfg.job_id = value(args, "--job-id", "XT_JOB_ID");
        cfg.workspace = value(args, "--workspace", "XT_WORKSPACE_NAME");
        if let Some(raw) = value(args, "--concurrent", "XT_CONCURRENT") {
            cfg.concurrent = parse_number(&raw, "--concurrent")?;
            if cfg.concurrent < -1 || cfg.concurrent == 0 {
                return Err(ControllerError::Config(format!(
                    "--concurrent must be -1 or positive, got {raw}"
                )));
            }
        }
        cfg.hold_open = flag_present(args, "--hold-open") || parse_bool_env("XT_HOLD_OPEN");
        cfg.is_aml = flag_present(args, "--aml") || parse_bool_env("XT_IS_AML");
        cfg.report_rollup =
            flag_present(args, "--report-rollup") || parse_bool_env("XT_REPORT_ROLLUP");
        if let Some(raw) = value(args, "--port", "XT_CONTROLLER_PORT") {
            cfg.port = parse_number(&raw, "--port")?;
        }
        if let Some(secret) = value(args, "--box-secret", "XT_BOX_SECRET") {
            cfg.box_secret = secret;
        }
        if let Some(dir) = value(args, "--storage-dir", "XT_STORAGE_DIR") {
            cfg.storage_dir = PathBuf::from(dir);
        }
        if let Some(dir) = value(args, "--store-dir", "XT_STORE_DIR") {
            cfg.store_dir = PathBuf::from(dir);
        }
        if let Some(dir) = value(args, "--work-dir", "XT_WORK_DIR") {
            cfg.work_dir = PathBuf::from(dir);
        }
        if let Some(dir) = value(args, "--cwd", "XT_CWD") {
            cfg.cwd = PathBuf::from(dir);
        }
        if let Some(raw) = value(args, "--tick-ms", "XT_TICK_MS") {
            cfg.tick_ms = parse_number::<u64>(&raw, "--tick-ms")?.max(1);
        }
        if let Some(raw) = value(args, "--max-rundirs", "XT_MAX_RUNDIRS") {
            cfg.max_rundirs = parse_number(&raw, "--max-rundirs")?;
        }
        if let Some(path) = value(args, "--server-cert", "XT_SERVER_CERT_FILE") {
            let pem = std::fs::read(&path)
                .map_err(|e| ControllerError::Config(format!("--server-cert {path}: {e}")))?;
            cfg.server_cert = Some(base64::engine::general_purpose::STANDARD.encode(pem));
        }
        Ok(cfg)
    }

    pub fn concurrency_limit(&self) -> Option<usize> {
        usize::try_from(self.concurrent).ok()
    }
}

fn default_xt_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".xt")
}

fn parse_number<T: std::str::FromStr>(raw: &str, flag: &str) -> Result<T, ControllerError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ControllerError::Config(format!("{flag} expects a number, got {raw:?}")))
}

fn value(args: &[String], flag: &str, env: &str) -> Option<String> {
    flag_value(args, flag).or_else(|| env_var(env))
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    let mut args = args.iter();
    while let Some(arg) = args.next() {
        if arg.as_str() == flag
            && let Some(value) = args.next()
        {
            return Some(value.clone());
        }
    }
    None
}

fn flag_present(args: &[String], flag: &str) -> bool {
    args.iter().any(|arg| arg.as_str() == flag)
}

/// Trimmed environment value; empty counts as unset.
pub(crate) fn env_var(key: &str) -> Option<String> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn parse_bool_env(key: &str) -> bool {
    let Some(value) = env_var(key) else {
        return false;
    };
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
