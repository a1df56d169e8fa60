#![forbid(unsafe_code)]

use crate::controller::NodeController;
use crate::error::ControllerError;
use crate::run::Run;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::io::Write as _;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use xt_core::FailureKind;
use xt_core::context::RunContext;
use xt_core::events::{EV_CHILD_CREATED, EV_CMD, EV_CREATED, EV_HPARAMS, LogEvent};
use xt_core::failure::LAUNCH_FAILURE_EXIT_CODE;
use xt_core::status::{ActiveRunStatus, RunStatus, SearchStyle};
use xt_search::{
    HistoryCache, HistoryRecord, RunArgs, SearchKind, SearchRequest, SearchSpace,
    insert_hparam_args, runset_yaml, split_cmd,
};
use xt_storage::{ActiveRunEntry, RunRecord};

/// Command line and generated runset for one child run.
struct ChildCommand {
    cmd_parts: Vec<String>,
    args: Option<RunArgs>,
    sweep_text: Option<String>,
}

impl NodeController {
    /// Run the scheduler until shutdown or a fatal error.
    pub fn run_loop(self: &Arc<Self>) -> Result<(), ControllerError> {
        let tick = Duration::from_millis(self.cfg.tick_ms);
        tracing::info!(node_id = %self.cfg.node_id, tick_ms = self.cfg.tick_ms, "scheduler started");
        while !self.is_shutting_down() {
            self.tick()?;
            std::thread::sleep(tick);
        }
        tracing::info!("scheduler stopped");
        Ok(())
    }

    /// One scheduler pass: start at most one queue entry if a slot is free,
    /// then fire the idle hook when nothing is left.
    pub fn tick(self: &Arc<Self>) -> Result<(), ControllerError> {
        if let Some(err) = self.take_fatal() {
            return Err(err);
        }
        let running = self.running_children();
        let limit = self.get_concurrent();
        if limit < 0 || (running as i64) < limit {
            let next = self.queue.lock().pop_front();
            if let Some(run) = next {
                if run.is_parent() {
                    self.process_parent(&run)?;
                } else {
                    self.spawn_run(&run);
                }
            }
        }
        if let Some(err) = self.take_fatal() {
            return Err(err);
        }
        if self.is_idle() {
            self.on_idle();
        }
        Ok(())
    }

    pub fn running_children(&self) -> usize {
        let runs = self.registry.lock().values().cloned().collect::<Vec<_>>();
        runs.iter().filter(|r| r.is_active_child()).count()
    }

    /// Nothing queued, no restart pending, and every known run fully
    /// wrapped up.
    pub fn is_idle(&self) -> bool {
        if self.is_restarting() || !self.queue.lock().is_empty() {
            return false;
        }
        let runs = self.registry.lock().values().cloned().collect::<Vec<_>>();
        runs.iter().all(|r| r.state.lock().wrapup_done)
    }

    fn on_idle(&self) {
        if self.cfg.hold_open || self.is_shutting_down() || self.is_restarting() {
            return;
        }
        tracing::info!("all runs finished; exiting");
        self.shutdown();
    }

    fn requeue(&self, parent: &Arc<Run>) {
        let cancelled = {
            let state = parent.state.lock();
            state.killing || state.is_wrapped_up
        };
        if !cancelled {
            self.queue.lock().push_back(parent.clone());
        }
    }

    fn process_parent(self: &Arc<Self>, parent: &Arc<Run>) -> Result<(), ControllerError> {
        let (prep_pending, first_pass) = {
            let mut state = parent.state.lock();
            if state.killing || state.is_wrapped_up {
                return Ok(());
            }
            let first_pass = state.status == RunStatus::Queued;
            if first_pass {
                state.status = RunStatus::Spawning;
                state.start_ms = Some(xt_core::time::now_ms());
            }
            (state.prep_pending, first_pass)
        };
        if first_pass {
            let mut set = JsonMap::new();
            set.insert("status".to_string(), json!(RunStatus::Spawning.as_str()));
            self.update_run_fields(parent, set);
            self.note_node_started(&parent.context.job_id);
        }

        if prep_pending {
            let code = self.run_parent_prep(parent)?;
            if code != 0 {
                tracing::warn!(run_name = %parent.run_name, exit_code = code, "parent prep script failed");
                self.wrapup(parent, Some(code));
                return Ok(());
            }
            parent.state.lock().prep_pending = false;
            self.requeue(parent);
            return Ok(());
        }

        let job_id = parent.context.job_id.clone();
        match self.run_index.next_child_run(&job_id, &self.cfg.node_id)? {
            Some(entry) => {
                self.start_child(parent, entry)?;
                self.requeue(parent);
            }
            None => {
                tracing::info!(run_name = %parent.run_name, job_id, "no more child runs; parent completed");
                self.wrapup(parent, None);
            }
        }
        Ok(())
    }

    fn start_child(
        self: &Arc<Self>,
        parent: &Arc<Run>,
        entry: ActiveRunEntry,
    ) -> Result<(), ControllerError> {
        let run_name = entry.run_name.clone().ok_or_else(|| {
            ControllerError::Invariant(format!(
                "claimed entry {} has no run name",
                entry.run_index
            ))
        })?;
        let ws = parent.ws.clone();
        let restart = entry.status == ActiveRunStatus::Restarted;
        let existing = self.retried("get_run", || self.store.get_run(&ws, &run_name))?;
        let restarts = match (&existing, restart) {
            (Some(record), true) => record.restarts + 1,
            _ => 0,
        };

        let previous = if restart && existing.is_some() {
            self.previous_command(&ws, &run_name)
        } else {
            None
        };
        let command = match previous {
            Some(cmd) => Ok(cmd),
            None => self.child_command(parent, entry.run_index),
        };

        let mut ctx = parent.context.clone();
        ctx.run_name = run_name.clone();
        ctx.run_index = Some(entry.run_index);
        ctx.parent_run_name = Some(parent.run_name.clone());
        ctx.is_parent = false;
        ctx.parent_script = None;
        ctx.restart = restart;
        ctx.repeat = None;
        ctx.repeats_remaining = None;
        ctx.generated_sweep_text = None;

        let outcome: Result<Option<JsonMap<String, JsonValue>>, ControllerError> = match command {
            Ok(cmd) => {
                ctx.cmd_parts = cmd.cmd_parts;
                ctx.generated_sweep_text = cmd.sweep_text;
                if let Some(args) = &cmd.args {
                    tracing::debug!(run_name = %run_name, args = %args.fingerprint(), "sampled hyperparameters");
                }
                Ok(cmd.args.map(|a| a.to_json_map()))
            }
            Err(err) if err.kind() == FailureKind::UserConfig => Err(err),
            Err(err) => return Err(err),
        };

        match &existing {
            None => self.create_child_record(parent, &ctx)?,
            Some(_) => {
                let mut set = JsonMap::new();
                set.insert("status".to_string(), json!(RunStatus::Queued.as_str()));
                set.insert("restarts".to_string(), json!(restarts));
                set.insert("node_id".to_string(), json!(self.cfg.node_id.to_string()));
                self.retried("update_run", || self.store.update_run(&ws, &run_name, &set))?;
            }
        }

        let child = self.register(ctx, Some(entry), restarts)?;
        match outcome {
            Ok(hparams) => {
                if existing.is_none() {
                    self.log_event(&child, LogEvent::from_value(EV_CMD, json!({ "cmd": child.context.cmd_parts })));
                    if let Some(hparams) = hparams {
                        self.log_event(&child, LogEvent::new(EV_HPARAMS, hparams));
                    }
                }
                self.spawn_run(&child);
            }
            Err(err) => {
                tracing::warn!(run_name = %run_name, error = %err, "search provider failed; child aborted");
                self.log_event(
                    &child,
                    LogEvent::from_value(EV_CMD, json!({ "error": err.to_string() })),
                );
                self.wrapup(&child, Some(LAUNCH_FAILURE_EXIT_CODE));
            }
        }
        Ok(())
    }

    fn create_child_record(&self, parent: &Run, ctx: &RunContext) -> Result<(), ControllerError> {
        let mut record = RunRecord::new(&ctx.ws, &ctx.run_name);
        record.job_id = Some(ctx.job_id.clone());
        record.node_id = Some(self.cfg.node_id.to_string());
        record.run_index = ctx.run_index;
        record.parent_run = Some(parent.run_name.clone());
        record.exper_name = ctx.exper_name.clone();
        record.username = ctx.username.clone();
        record.search_type = ctx.search_type.clone();
        record.status = RunStatus::Queued;
        self.retried("create_run", || self.store.create_run(&record))?;
        self.log_event_for(&ctx.ws, &ctx.run_name, LogEvent::from_value(EV_CREATED, json!({})));
        self.log_event(
            parent,
            LogEvent::from_value(
                EV_CHILD_CREATED,
                json!({ "child_name": ctx.run_name, "run_index": ctx.run_index }),
            ),
        );
        Ok(())
    }

    /// A restarted child reuses the command recorded on its first start.
    fn previous_command(&self, ws: &str, run_name: &str) -> Option<ChildCommand> {
        let events = self.store.run_events(ws, run_name).ok()?;
        let cmd_event = events.iter().rev().find(|e| e.is(EV_CMD))?;
        let cmd_parts = cmd_event
            .data
            .get("cmd")?
            .as_array()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()?;
        Some(ChildCommand {
            cmd_parts,
            args: None,
            sweep_text: None,
        })
    }

    fn child_command(
        &self,
        parent: &Run,
        run_index: usize,
    ) -> Result<ChildCommand, ControllerError> {
        let ctx = &parent.context;
        let base = self
            .context
            .lock()
            .cmd_for_run_index(run_index)
            .map(split_cmd)
            .unwrap_or_else(|| ctx.cmd_parts.clone());

        let (Some(search_type), Some(hp_config)) = (&ctx.search_type, &ctx.hp_config) else {
            return Ok(plain(base));
        };
        if ctx.search_style != SearchStyle::Dynamic {
            return Ok(plain(base));
        }

        let path = self.cfg.cwd.join(hp_config);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            ControllerError::Config(format!("hp config {}: {e}", path.display()))
        })?;
        let space = SearchSpace::from_yaml_str(&text)?;
        let provider = SearchKind::from_name(search_type)?.provider();

        let history = if provider.needs_history() {
            self.refresh_history(parent)?
        } else {
            Vec::new()
        };
        let request = SearchRequest {
            space: &space,
            run_index,
            history: &history,
            primary_metric: ctx.primary_metric.as_deref(),
            maximize: ctx.maximize_metric,
        };
        let args = provider.next_args(&request, &mut rand::rng())?;
        let prefix = ctx.option_prefix.as_deref().unwrap_or("--");
        Ok(ChildCommand {
            cmd_parts: insert_hparam_args(&base, prefix, &args),
            sweep_text: Some(runset_yaml(&args)?),
            args: Some(args),
        })
    }

    fn refresh_history(&self, parent: &Run) -> Result<Vec<HistoryRecord>, ControllerError> {
        let ctx = &parent.context;
        let mut caches = self.history.lock();
        let cache = caches
            .entry(parent.run_name.clone())
            .or_insert_with(HistoryCache::new);
        let records = cache.refresh(|min_end_id| {
            self.store
                .completed_runs(&ctx.ws, &ctx.job_id, min_end_id)
                .map(|runs| {
                    runs.into_iter()
                        .filter(|r| !r.is_parent)
                        .map(|r| HistoryRecord {
                            run_name: r.run_name,
                            end_id: r.end_id.unwrap_or_default(),
                            hparams: r.hparams,
                            metrics: r.metrics,
                        })
                        .collect()
                })
        })?;
        Ok(records.to_vec())
    }

    /// Run the parent's prep script in the packet directory, appending its
    /// output to the parent's console file. Returns the exit code.
    fn run_parent_prep(&self, parent: &Run) -> Result<i32, ControllerError> {
        let Some(script) = parent.context.parent_script.as_deref() else {
            return Ok(0);
        };
        let prep_dir = self.cfg.work_dir.join("prep");
        std::fs::create_dir_all(&prep_dir)?;
        let script_path = prep_dir.join(format!(
            "{}.{}",
            parent.run_name,
            crate::spawn::SCRIPT_EXT
        ));
        std::fs::write(
            &script_path,
            crate::spawn::normalize_line_endings(script, cfg!(windows)),
        )?;

        let console_path = self.console_path(&parent.ws, &parent.run_name);
        if let Some(dir) = console_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        tracing::info!(run_name = %parent.run_name, "running parent prep script");
        let output = crate::spawn::shell_command(&script_path)
            .current_dir(&self.cfg.cwd)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ControllerError::Launch {
                run_name: parent.run_name.clone(),
                reason: e.to_string(),
            })?;
        let mut console = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&console_path)?;
        console.write_all(&output.stdout)?;
        console.write_all(&output.stderr)?;
        parent.state.lock().console_path = Some(console_path);
        Ok(output.status.code().unwrap_or(-1))
    }

    /// Called by wrapup: true when no other run of `job_id` on this node is
    /// still alive, so the node can report its exit from the job.
    pub(crate) fn node_done_with_job(&self, job_id: &str, except: &Arc<Run>) -> bool {
        if self.queue.lock().iter().any(|r| r.context.job_id == job_id) {
            return false;
        }
        let runs = self.registry.lock().values().cloned().collect::<Vec<_>>();
        runs.iter()
            .filter(|r| !Arc::ptr_eq(r, except) && r.context.job_id == job_id)
            .all(|r| {
                let state = r.state.lock();
                state.is_wrapped_up || state.status.is_terminal()
            })
    }
}

fn plain(cmd_parts: Vec<String>) -> ChildCommand {
    ChildCommand {
        cmd_parts,
        args: None,
        sweep_text: None,
    }
}
