#![forbid(unsafe_code)]

use crate::controller::NodeController;
use crate::mirror::{matching_files, relative_blob_path};
use crate::run::{Run, terminal_status};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use xt_core::events::{EV_CANCELLED, EV_CAPTURE_AFTER, EV_ENDED, LogEvent};
use xt_core::ids::child_run_name;
use xt_core::rollup::{MetricsRollupOptions, rollup_hparams, rollup_metrics};
use xt_core::status::RunStatus;
use xt_storage::{RunEnd, StoreError};

/// Snapshot of the run state taken when wrapup claims the run.
struct Claimed {
    status: RunStatus,
    exit_code: Option<i32>,
    for_restart: bool,
    spawned: bool,
    restarts: u32,
    entry: Option<xt_storage::ActiveRunEntry>,
    rundir: Option<PathBuf>,
    console_path: Option<PathBuf>,
    mirror: Option<crate::mirror::MirrorWorker>,
}

impl NodeController {
    /// Finish a run exactly once: roll up, capture output, record the end in
    /// the store, and release its resources. Later calls are no-ops.
    pub(crate) fn wrapup(&self, run: &Arc<Run>, exit_code: Option<i32>) {
        let Some(mut claimed) = claim(run, exit_code) else {
            return;
        };
        if let Some(mirror) = claimed.mirror.take() {
            mirror.stop();
        }

        if claimed.for_restart {
            if claimed.spawned && !run.context.job_id.is_empty() {
                self.restart_counted.lock().insert(run.key());
            }
            self.release(run, claimed.rundir.as_deref());
            tracing::info!(run_name = %run.run_name, "run stopped for controller restart");
            return;
        }

        let ctx = &run.context;
        let events = self
            .retried("run_events", || self.store.run_events(&run.ws, &run.run_name))
            .unwrap_or_else(|err| {
                tracing::warn!(run_name = %run.run_name, error = %err, "could not read run events");
                Vec::new()
            });
        let hparams = rollup_hparams(&events);
        let metrics = rollup_metrics(
            &events,
            &MetricsRollupOptions {
                primary_metric: ctx.primary_metric.as_deref(),
                maximize: ctx.maximize_metric,
                report_rollup: ctx.report_rollup || self.cfg.report_rollup,
            },
        )
        .unwrap_or_default();

        if let Some(rundir) = &claimed.rundir
            && ctx.after_upload
            && !ctx.after_files_list.is_empty()
        {
            self.capture_after_files(run, &workdir_of(rundir, &ctx.working_dir));
        }
        if let Some(console) = claimed.console_path.as_deref().filter(|p| p.is_file()) {
            let blob = format!("runs/{}/output/console.txt", run.run_name);
            if let Err(err) =
                self.retried("console_upload", || self.objects.upload(&run.ws, &blob, console))
            {
                tracing::warn!(run_name = %run.run_name, error = %err, "console upload failed");
            }
        }

        if claimed.status == RunStatus::Cancelled {
            self.log_event(run, LogEvent::from_value(EV_CANCELLED, json!({})));
        }
        self.log_event(
            run,
            LogEvent::from_value(
                EV_ENDED,
                json!({ "status": claimed.status.as_str(), "exit_code": claimed.exit_code }),
            ),
        );

        let end_ms = xt_core::time::now_ms();
        if claimed.spawned
            && let Err(err) =
                self.retried("run_exit", || self.store.run_exit(&run.ws, &run.run_name))
        {
            tracing::warn!(run_name = %run.run_name, error = %err, "run_exit failed");
        }
        let end = RunEnd {
            status: claimed.status,
            exit_code: claimed.exit_code,
            restarts: claimed.restarts,
            end_ms,
            hparams: hparams.clone(),
            metrics: metrics.clone(),
        };
        let end_id = match self.retried("update_run_at_end", || {
            self.store.update_run_at_end(&run.ws, &run.run_name, &end)
        }) {
            Ok(end_id) => Some(end_id),
            Err(err) => {
                tracing::error!(run_name = %run.run_name, error = %err, "failed to record run end");
                None
            }
        };
        self.append_allruns(run, &claimed, end_id, &hparams, &metrics);

        if let Some(entry) = &claimed.entry {
            match self.run_index.mark_completed(&ctx.job_id, entry) {
                Ok(()) => {}
                Err(StoreError::Invariant(msg)) => {
                    tracing::error!(run_name = %run.run_name, msg = %msg, "run index invariant violated");
                    self.set_fatal(crate::error::ControllerError::Invariant(msg));
                }
                Err(err) => {
                    tracing::error!(run_name = %run.run_name, error = %err, "mark_completed failed");
                }
            }
        }

        if claimed.status == RunStatus::Completed {
            self.queue_repeat(run);
        }

        if !ctx.job_id.is_empty() {
            if claimed.spawned
                && let Err(err) = self.retried("job_run_exit", || {
                    self.store
                        .job_run_exit(&ctx.job_id, claimed.exit_code.unwrap_or(0))
                })
            {
                tracing::warn!(job_id = %ctx.job_id, error = %err, "job_run_exit failed");
            }
            if self.node_done_with_job(&ctx.job_id, run)
                && self.nodes_started.lock().remove(&ctx.job_id)
            {
                match self.retried("job_node_exit", || self.store.job_node_exit(&ctx.job_id)) {
                    Ok(job_status) => {
                        tracing::info!(job_id = %ctx.job_id, job_status = %job_status.as_str(), "node finished job");
                    }
                    Err(err) => {
                        tracing::warn!(job_id = %ctx.job_id, error = %err, "job_node_exit failed");
                    }
                }
            }
        }

        self.release(run, claimed.rundir.as_deref());
        tracing::info!(
            ws = %run.ws,
            run_name = %run.run_name,
            status = claimed.status.as_str(),
            exit_code = claimed.exit_code,
            end_id,
            "run wrapped up"
        );
    }

    fn release(&self, run: &Run, rundir: Option<&Path>) {
        if let Some(rundir) = rundir {
            self.rundirs.lock().release(rundir);
        }
        let mut state = run.state.lock();
        state.end_ms = Some(xt_core::time::now_ms());
        state.wrapup_done = true;
    }

    fn capture_after_files(&self, run: &Run, workdir: &Path) {
        let ctx = &run.context;
        let started = Instant::now();
        let omit = ctx
            .after_omit_list
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect::<Vec<_>>();
        let files = ctx
            .after_files_list
            .iter()
            .flat_map(|pattern| matching_files(workdir, pattern))
            .collect::<BTreeSet<_>>();

        let mut count = 0usize;
        for path in files {
            let Some(rel) = relative_blob_path(workdir, &path) else {
                continue;
            };
            if omit.iter().any(|p| p.matches(&rel)) {
                continue;
            }
            let blob = format!("runs/{}/after/{rel}", run.run_name);
            match self.retried("after_upload", || self.objects.upload(&run.ws, &blob, &path)) {
                Ok(()) => count += 1,
                Err(err) => {
                    tracing::warn!(run_name = %run.run_name, blob = %blob, error = %err, "after-file upload failed");
                }
            }
        }
        let elapsed_s = started.elapsed().as_secs_f64();
        self.log_event(
            run,
            LogEvent::from_value(
                EV_CAPTURE_AFTER,
                json!({ "elapsed_s": elapsed_s, "file_count": count }),
            ),
        );
    }

    fn append_allruns(
        &self,
        run: &Run,
        claimed: &Claimed,
        end_id: Option<i64>,
        hparams: &JsonMap<String, JsonValue>,
        metrics: &JsonMap<String, JsonValue>,
    ) {
        let ctx = &run.context;
        if ctx.job_id.is_empty() {
            return;
        }
        let row = json!({
            "ws": run.ws,
            "run_name": run.run_name,
            "job_id": ctx.job_id,
            "node_id": self.cfg.node_id.to_string(),
            "run_index": ctx.run_index,
            "is_parent": ctx.is_parent,
            "status": claimed.status.as_str(),
            "exit_code": claimed.exit_code,
            "restarts": claimed.restarts,
            "end_id": end_id,
            "end_time": xt_core::time::now_rfc3339(),
            "hparams": hparams,
            "metrics": metrics,
        });
        let mut line = row.to_string();
        line.push('\n');
        let blob = format!("jobs/{}/allruns/{}.jsonl", ctx.job_id, self.cfg.node_id);
        if let Err(err) = self.retried("allruns_append", || {
            self.objects.append_blob(&run.ws, &blob, line.as_bytes())
        }) {
            tracing::warn!(run_name = %run.run_name, error = %err, "allruns append failed");
        }
    }

    /// Queue the next repetition of a completed run under a fresh child name.
    fn queue_repeat(&self, run: &Run) {
        let ctx = &run.context;
        if ctx.is_parent {
            return;
        }
        let remaining = ctx
            .repeats_remaining
            .or(ctx.repeat.map(|r| r.saturating_sub(1)))
            .unwrap_or(0);
        if remaining == 0 {
            return;
        }
        let base = ctx
            .parent_run_name
            .clone()
            .unwrap_or_else(|| run.run_name.clone());
        let seq = match self.retried("next_child_id", || self.store.next_child_id(&run.ws, &base)) {
            Ok(seq) => seq,
            Err(err) => {
                tracing::warn!(run_name = %run.run_name, error = %err, "could not name repeat run");
                return;
            }
        };
        let mut next = ctx.clone();
        next.run_name = child_run_name(&base, seq);
        next.parent_run_name = Some(base);
        next.repeats_remaining = Some(remaining - 1);
        next.restart = false;
        let name = next.run_name.clone();
        match self.enqueue(next, None, 0) {
            Ok(_) => tracing::info!(run_name = %name, remaining = remaining - 1, "repeat queued"),
            Err(err) => tracing::warn!(run_name = %name, error = %err, "repeat not queued"),
        }
    }
}

fn claim(run: &Run, exit_code: Option<i32>) -> Option<Claimed> {
    let mut state = run.state.lock();
    if state.is_wrapped_up {
        return None;
    }
    state.is_wrapped_up = true;
    if exit_code.is_some() {
        state.exit_code = exit_code;
    }
    let status = terminal_status(state.killing, state.exit_code);
    state.status = status;
    state.pid.take();
    Some(Claimed {
        status,
        exit_code: state.exit_code,
        for_restart: state.killed_for_restart,
        spawned: state.start_ms.is_some() && !run.context.is_parent,
        restarts: state.restarts,
        entry: state.entry.clone(),
        rundir: state.rundir.take(),
        console_path: state.console_path.clone(),
        mirror: state.mirror.take(),
    })
}

pub(crate) fn workdir_of(rundir: &Path, working_dir: &str) -> PathBuf {
    match working_dir.trim() {
        "" | "." => rundir.to_path_buf(),
        dir => rundir.join(dir),
    }
}
