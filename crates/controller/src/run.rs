#![forbid(unsafe_code)]

use crate::mirror::MirrorWorker;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;
use xt_core::context::RunContext;
use xt_core::status::RunStatus;
use xt_storage::ActiveRunEntry;

/// Lines of recent console output kept per run for `attach`.
pub const RECENT_LINES: usize = 200;

/// Receives console lines; returning `false` unregisters the callback.
pub type ConsoleCallback = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A run known to this controller. Its mutable state sits behind its own
/// lock; never take that lock while holding the queue or registry lock.
pub struct Run {
    pub(crate) ws: String,
    pub(crate) run_name: String,
    pub(crate) context: RunContext,
    pub(crate) state: Mutex<RunState>,
}

pub(crate) struct RunState {
    pub(crate) status: RunStatus,
    pub(crate) process: Option<Child>,
    pub(crate) pid: Option<u32>,
    pub(crate) exit_code: Option<i32>,
    pub(crate) killing: bool,
    pub(crate) killed_for_restart: bool,
    pub(crate) is_wrapped_up: bool,
    pub(crate) wrapup_done: bool,
    pub(crate) prep_pending: bool,
    pub(crate) restarts: u32,
    pub(crate) entry: Option<ActiveRunEntry>,
    pub(crate) rundir: Option<PathBuf>,
    pub(crate) console_path: Option<PathBuf>,
    pub(crate) callbacks: Vec<(String, ConsoleCallback)>,
    pub(crate) recent: VecDeque<String>,
    pub(crate) mirror: Option<MirrorWorker>,
    pub(crate) queued_ms: i64,
    pub(crate) start_ms: Option<i64>,
    pub(crate) end_ms: Option<i64>,
}

impl Run {
    pub(crate) fn new(context: RunContext, entry: Option<ActiveRunEntry>, restarts: u32) -> Arc<Self> {
        let prep_pending = context.is_parent && context.parent_script.is_some();
        Arc::new(Self {
            ws: context.ws.clone(),
            run_name: context.run_name.clone(),
            state: Mutex::new(RunState {
                status: RunStatus::Queued,
                process: None,
                pid: None,
                exit_code: None,
                killing: false,
                killed_for_restart: false,
                is_wrapped_up: false,
                wrapup_done: false,
                prep_pending,
                restarts,
                entry,
                rundir: None,
                console_path: None,
                callbacks: Vec::new(),
                recent: VecDeque::with_capacity(RECENT_LINES),
                mirror: None,
                queued_ms: xt_core::time::now_ms(),
                start_ms: None,
                end_ms: None,
            }),
            context,
        })
    }

    pub fn ws(&self) -> &str {
        &self.ws
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn is_parent(&self) -> bool {
        self.context.is_parent
    }

    pub fn status(&self) -> RunStatus {
        self.state.lock().status
    }

    pub(crate) fn key(&self) -> (String, String) {
        (self.ws.clone(), self.run_name.clone())
    }

    /// Child processes count against `concurrent`; parents never do.
    pub(crate) fn is_active_child(&self) -> bool {
        !self.is_parent()
            && matches!(
                self.state.lock().status,
                RunStatus::Spawning | RunStatus::Running | RunStatus::Dying
            )
    }

    /// Record one console line and fan it out to attached callbacks.
    /// Returns the run's `killing` flag.
    pub(crate) fn push_line(&self, line: &str) -> bool {
        let (callbacks, killing) = {
            let mut state = self.state.lock();
            if state.recent.len() == RECENT_LINES {
                state.recent.pop_front();
            }
            state.recent.push_back(line.to_string());
            (state.callbacks.clone(), state.killing)
        };
        let dead = callbacks
            .iter()
            .filter(|(_, cb)| !cb(line))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        if !dead.is_empty() {
            self.state
                .lock()
                .callbacks
                .retain(|(id, _)| !dead.contains(id));
        }
        killing
    }

    pub(crate) fn summary(&self) -> RunSummary {
        let state = self.state.lock();
        RunSummary {
            ws: self.ws.clone(),
            run_name: self.run_name.clone(),
            job_id: self.context.job_id.clone(),
            node_index: self.context.node_index,
            run_index: state.entry.as_ref().map(|e| e.run_index).or(self.context.run_index),
            parent_run: self.context.parent_run_name.clone(),
            is_parent: self.context.is_parent,
            status: state.status,
            exit_code: state.exit_code,
            restarts: state.restarts,
            queued_ms: state.queued_ms,
            start_ms: state.start_ms,
            end_ms: state.end_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunSummary {
    pub ws: String,
    pub run_name: String,
    pub job_id: String,
    pub node_index: usize,
    pub run_index: Option<usize>,
    pub parent_run: Option<String>,
    pub is_parent: bool,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub restarts: u32,
    pub queued_ms: i64,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

/// Terminal status for a run leaving the controller.
pub(crate) fn terminal_status(killing: bool, exit_code: Option<i32>) -> RunStatus {
    if killing {
        RunStatus::Cancelled
    } else if exit_code.is_some_and(|code| code != 0) {
        RunStatus::Error
    } else {
        RunStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(name: &str) -> RunContext {
        RunContext {
            ws: "ws".into(),
            run_name: name.into(),
            job_id: "job1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn ring_keeps_the_latest_lines() {
        let run = Run::new(ctx("run1"), None, 0);
        for i in 0..(RECENT_LINES + 5) {
            run.push_line(&format!("line {i}"));
        }
        let state = run.state.lock();
        assert_eq!(state.recent.len(), RECENT_LINES);
        assert_eq!(state.recent.front().map(String::as_str), Some("line 5"));
    }

    #[test]
    fn failing_callbacks_are_dropped() {
        let run = Run::new(ctx("run1"), None, 0);
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        run.state.lock().callbacks.push((
            "ok".into(),
            Arc::new(move |line: &str| {
                sink.lock().push(line.to_string());
                true
            }),
        ));
        run.state
            .lock()
            .callbacks
            .push(("gone".into(), Arc::new(|_: &str| false)));
        run.push_line("a");
        run.push_line("b");
        assert_eq!(*seen.lock(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(run.state.lock().callbacks.len(), 1);
    }

    #[test]
    fn terminal_status_precedence() {
        assert_eq!(terminal_status(true, Some(0)), RunStatus::Cancelled);
        assert_eq!(terminal_status(false, Some(3)), RunStatus::Error);
        assert_eq!(terminal_status(false, Some(-2)), RunStatus::Error);
        assert_eq!(terminal_status(false, Some(0)), RunStatus::Completed);
        assert_eq!(terminal_status(false, None), RunStatus::Completed);
    }
}
