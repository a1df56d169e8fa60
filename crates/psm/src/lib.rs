#![forbid(unsafe_code)]

//! Pool State Manager: the per-box queue of job packets, the daemon that
//! starts one node controller at a time, and the client submit path.

pub mod config;
mod daemon;
mod error;
pub mod logging;
mod process;
mod queue;
mod restart;
mod submit;

pub use config::PsmConfig;
pub use daemon::{FN_CURRENT_PID, PsmDaemon, StepOutcome, cancel_running, current_entry};
pub use error::PsmError;
pub use process::{
    LaunchRequest, Launcher, ProcScanProbe, ProcessProbe, ShellLauncher, kill_process_tree,
};
pub use queue::{PsmQueue, QueueEntry};
pub use restart::{EnsureOutcome, PsmInstall, ensure_psm_running};
pub use submit::{DEFAULT_TEAM, SubmitRequest, SubmittedJob, controller_script, submit_job, submit_job_with};
