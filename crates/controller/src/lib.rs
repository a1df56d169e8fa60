#![forbid(unsafe_code)]

//! Node controller: runs the experiment runs assigned to one compute node,
//! with bounded parallelism, restart tolerance, console capture and
//! lifecycle reporting to the metadata store.

pub mod config;
mod controller;
mod error;
pub mod logging;
mod mirror;
mod reader;
pub mod rpc;
mod run;
mod rundir;
mod scheduler;
mod spawn;
mod wrapup;

pub use config::ControllerConfig;
pub use controller::{AttachInfo, CancelOutcome, NodeController};
pub use error::ControllerError;
pub use reader::{CONSOLE_EVENT_PREFIX, parse_console_event};
pub use rpc::{CONSOLE_NOTIFICATION, RpcClient, RpcServer};
pub use run::{ConsoleCallback, RECENT_LINES, Run, RunSummary};
