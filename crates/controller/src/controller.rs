#![forbid(unsafe_code)]

//! The node controller: one object owning the run queue, the run registry,
//! the rundir pool and the per-run workers. RPC handlers and the scheduler
//! loop share it through an `Arc`.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::run::{ConsoleCallback, Run, RunSummary};
use crate::rundir::RundirPool;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use xt_core::context::{FN_MULTI_RUN_CONTEXT, MultiRunContext, RunContext};
use xt_core::events::{EV_CREATED, EV_QUEUED, LogEvent};
use xt_core::status::{RunStatus, SearchStyle, Stage};
use xt_search::HistoryCache;
use xt_storage::{MetadataStore, ObjectStore, RetryPolicy, RunIndex, RunRecord, StoreError};

pub struct NodeController {
    pub(crate) cfg: ControllerConfig,
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) objects: Arc<dyn ObjectStore>,
    pub(crate) run_index: RunIndex,
    pub(crate) queue: Mutex<VecDeque<Arc<Run>>>,
    pub(crate) registry: Mutex<BTreeMap<(String, String), Arc<Run>>>,
    pub(crate) rundirs: Mutex<RundirPool>,
    pub(crate) context: Mutex<MultiRunContext>,
    /// Jobs for which this node has reported `job_node_start`.
    pub(crate) nodes_started: Mutex<HashSet<String>>,
    /// Completed-run history per search parent.
    pub(crate) history: Mutex<HashMap<String, HistoryCache>>,
    /// Contexts of runs killed for restart, re-queued on reinitialisation.
    pub(crate) restart_victims: Mutex<Vec<RunContext>>,
    /// Runs killed for restart after `job_run_start`; their relaunch is not
    /// counted again.
    pub(crate) restart_counted: Mutex<HashSet<(String, String)>>,
    pub(crate) retry: RetryPolicy,
    concurrent: AtomicI64,
    shutdown: AtomicBool,
    /// Set from `restart_controller` until reinitialisation has re-queued.
    restarting: AtomicBool,
    fatal: Mutex<Option<ControllerError>>,
}

/// Result of one cancel request for one run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CancelOutcome {
    pub ws: String,
    pub run_name: String,
    pub status_before: RunStatus,
    pub cancelled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttachInfo {
    pub status: RunStatus,
    pub recent: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CancelMode {
    User,
    ForRestart,
}

impl NodeController {
    pub fn new(
        cfg: ControllerConfig,
        store: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Result<Arc<Self>, ControllerError> {
        Self::with_retry(cfg, store, objects, RetryPolicy::default())
    }

    pub fn with_retry(
        cfg: ControllerConfig,
        store: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        retry: RetryPolicy,
    ) -> Result<Arc<Self>, ControllerError> {
        std::fs::create_dir_all(&cfg.work_dir)?;
        std::fs::create_dir_all(&cfg.cwd)?;
        let rundirs = RundirPool::new(cfg.work_dir.join("rundirs"), cfg.max_rundirs);
        Ok(Arc::new(Self {
            run_index: RunIndex::new(store.clone(), retry.clone()),
            retry,
            concurrent: AtomicI64::new(cfg.concurrent),
            cfg,
            store,
            objects,
            queue: Mutex::new(VecDeque::new()),
            registry: Mutex::new(BTreeMap::new()),
            rundirs: Mutex::new(rundirs),
            context: Mutex::new(MultiRunContext::default()),
            nodes_started: Mutex::new(HashSet::new()),
            history: Mutex::new(HashMap::new()),
            restart_victims: Mutex::new(Vec::new()),
            restart_counted: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
            restarting: AtomicBool::new(false),
            fatal: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Load `__multi_run_context__.json` from the packet directory, if present.
    pub fn load_context_file(&self) -> Result<usize, ControllerError> {
        let path = self.cfg.cwd.join(FN_MULTI_RUN_CONTEXT);
        if !path.is_file() {
            tracing::info!(path = %path.display(), "no multi-run context; waiting for queued runs");
            return Ok(0);
        }
        let mrc: MultiRunContext = serde_json::from_slice(&std::fs::read(&path)?)?;
        self.load_context(mrc)
    }

    /// Adopt a multi-run context and queue this node's runs. Jobs scheduled
    /// through the Run Index get a restart sweep first.
    pub fn load_context(&self, mrc: MultiRunContext) -> Result<usize, ControllerError> {
        *self.context.lock() = mrc;
        self.queue_from_context(false)
    }

    fn queue_from_context(&self, restart: bool) -> Result<usize, ControllerError> {
        let node = self.cfg.node_id.clone();
        let runs = {
            let mrc = self.context.lock();
            mrc.runs_for_node(&node)
                .iter()
                .filter(|ctx| self.cfg.job_id.as_ref().is_none_or(|j| *j == ctx.job_id))
                .cloned()
                .collect::<Vec<_>>()
        };

        let swept = runs
            .iter()
            .filter(|ctx| ctx.search_style != SearchStyle::Single)
            .map(|ctx| ctx.job_id.clone())
            .collect::<BTreeSet<_>>();
        for job_id in &swept {
            self.run_index.restart_session(job_id, &node)?;
        }

        let mut queued = 0;
        for mut ctx in runs {
            if let Some(existing) = self.store.get_run(&ctx.ws, &ctx.run_name)?
                && existing.status.is_terminal()
            {
                tracing::info!(ws = %ctx.ws, run_name = %ctx.run_name, "run already finished; skipping");
                continue;
            }
            if ctx.is_parent {
                self.run_index
                    .set_node_parent(&ctx.job_id, &node, &ctx.run_name)?;
            }
            ctx.restart = restart || ctx.restart;
            self.enqueue(ctx, None, 0)?;
            queued += 1;
        }
        tracing::info!(node_id = %node, queued, restart, "context loaded");
        Ok(queued)
    }

    /// Queue a run received interactively. The context's `cmd_parts` are
    /// replaced when `cmd_parts` is non-empty.
    pub fn queue_job(
        &self,
        mut context: RunContext,
        cmd_parts: Vec<String>,
    ) -> Result<String, ControllerError> {
        if context.ws.trim().is_empty() || context.run_name.trim().is_empty() {
            return Err(ControllerError::Config(
                "queue_job needs ws and run_name".to_string(),
            ));
        }
        if !cmd_parts.is_empty() {
            context.cmd_parts = cmd_parts;
        }
        if context.cmd_parts.is_empty() && context.run_script.is_none() && !context.is_parent {
            return Err(ControllerError::Config(format!(
                "{} has no command",
                context.run_name
            )));
        }
        let run_name = context.run_name.clone();
        self.enqueue(context, None, 0)?;
        Ok(run_name)
    }

    /// Register a run, make sure its record exists, and append it to the queue.
    pub(crate) fn enqueue(
        &self,
        context: RunContext,
        entry: Option<xt_storage::ActiveRunEntry>,
        restarts: u32,
    ) -> Result<Arc<Run>, ControllerError> {
        self.ensure_record(&context, RunStatus::Queued)?;
        let run = self.register(context, entry, restarts)?;
        self.log_event(&run, LogEvent::from_value(EV_QUEUED, json!({})));
        self.queue.lock().push_back(run.clone());
        tracing::info!(ws = %run.ws, run_name = %run.run_name, parent = run.is_parent(), "run queued");
        Ok(run)
    }

    pub(crate) fn register(
        &self,
        context: RunContext,
        entry: Option<xt_storage::ActiveRunEntry>,
        restarts: u32,
    ) -> Result<Arc<Run>, ControllerError> {
        let run = Run::new(context, entry, restarts);
        let mut registry = self.registry.lock();
        if let Some(existing) = registry.get(&run.key())
            && !existing.state.lock().wrapup_done
        {
            return Err(ControllerError::Config(format!(
                "{}/{} is already active on this node",
                run.ws, run.run_name
            )));
        }
        registry.insert(run.key(), run.clone());
        Ok(run)
    }

    /// Create the run record when the client has not already done so.
    pub(crate) fn ensure_record(
        &self,
        ctx: &RunContext,
        status: RunStatus,
    ) -> Result<(), ControllerError> {
        if self
            .retried("get_run", || self.store.get_run(&ctx.ws, &ctx.run_name))?
            .is_some()
        {
            return Ok(());
        }
        let mut record = RunRecord::new(&ctx.ws, &ctx.run_name);
        record.job_id = Some(ctx.job_id.clone()).filter(|j| !j.is_empty());
        record.node_id = Some(ctx.node_id().to_string());
        record.run_index = ctx.run_index;
        record.parent_run = ctx.parent_run_name.clone();
        record.is_parent = ctx.is_parent;
        record.exper_name = ctx.exper_name.clone();
        record.username = ctx.username.clone();
        record.search_type = ctx.search_type.clone();
        record.status = status;
        match self.retried("create_run", || self.store.create_run(&record)) {
            Ok(()) | Err(StoreError::RunExists { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        self.log_event_for(&ctx.ws, &ctx.run_name, LogEvent::from_value(EV_CREATED, json!({})));
        Ok(())
    }

    /// Append a log event; failures are logged, never fatal to the run.
    pub(crate) fn log_event(&self, run: &Run, event: LogEvent) {
        self.log_event_for(&run.ws, &run.run_name, event);
    }

    pub(crate) fn log_event_for(&self, ws: &str, run_name: &str, event: LogEvent) {
        if let Err(err) =
            self.retried("add_run_event", || self.store.add_run_event(ws, run_name, &event))
        {
            tracing::warn!(ws, run_name, event = %event.event, error = %err, "failed to record log event");
        }
    }

    pub(crate) fn update_run_fields(&self, run: &Run, fields: JsonMap<String, JsonValue>) {
        if let Err(err) = self.retried("update_run", || {
            self.store.update_run(&run.ws, &run.run_name, &fields)
        }) {
            tracing::warn!(ws = %run.ws, run_name = %run.run_name, error = %err, "failed to update run");
        }
    }

    pub fn find_run(&self, ws: &str, run_name: &str) -> Option<Arc<Run>> {
        self.registry
            .lock()
            .get(&(ws.to_string(), run_name.to_string()))
            .cloned()
    }

    fn require_run(&self, ws: &str, run_name: &str) -> Result<Arc<Run>, ControllerError> {
        self.find_run(ws, run_name)
            .ok_or_else(|| ControllerError::UnknownRun {
                ws: ws.to_string(),
                run_name: run_name.to_string(),
            })
    }

    fn all_runs(&self) -> Vec<Arc<Run>> {
        self.registry.lock().values().cloned().collect()
    }

    pub fn attach(
        &self,
        ws: &str,
        run_name: &str,
        callback_id: &str,
        callback: ConsoleCallback,
    ) -> Result<AttachInfo, ControllerError> {
        let run = self.require_run(ws, run_name)?;
        let mut state = run.state.lock();
        state.callbacks.retain(|(id, _)| id != callback_id);
        state.callbacks.push((callback_id.to_string(), callback));
        Ok(AttachInfo {
            status: state.status,
            recent: state.recent.iter().cloned().collect(),
        })
    }

    pub fn detach(&self, ws: &str, run_name: &str, callback_id: &str) -> bool {
        let Some(run) = self.find_run(ws, run_name) else {
            return false;
        };
        let mut state = run.state.lock();
        let before = state.callbacks.len();
        state.callbacks.retain(|(id, _)| id != callback_id);
        before != state.callbacks.len()
    }

    /// Drop a callback from every run (used when a connection closes).
    pub fn detach_everywhere(&self, callback_id: &str) {
        for run in self.all_runs() {
            run.state.lock().callbacks.retain(|(id, _)| id != callback_id);
        }
    }

    pub fn get_status_of_runs(&self, ws: &str, run_names: &[String]) -> BTreeMap<String, String> {
        run_names
            .iter()
            .map(|name| {
                let status = self
                    .find_run(ws, name)
                    .map(|r| r.status().as_str().to_string())
                    .or_else(|| {
                        self.store
                            .get_run(ws, name)
                            .ok()
                            .flatten()
                            .map(|r| r.status.as_str().to_string())
                    })
                    .unwrap_or_else(|| "unknown".to_string());
                (name.clone(), status)
            })
            .collect()
    }

    pub fn get_runs(
        &self,
        stage: Option<Stage>,
        ws: Option<&str>,
        run_name: Option<&str>,
    ) -> Vec<RunSummary> {
        self.all_runs()
            .iter()
            .filter(|r| ws.is_none_or(|w| r.ws == w))
            .filter(|r| run_name.is_none_or(|n| r.run_name == n))
            .map(|r| r.summary())
            .filter(|s| stage.is_none_or(|st| s.status.stage() == st))
            .collect()
    }

    /// Cancel the named runs, or every run when `run_names` is `None`.
    pub fn cancel_run(&self, ws: Option<&str>, run_names: Option<&[String]>) -> Vec<CancelOutcome> {
        let targets = self
            .all_runs()
            .into_iter()
            .filter(|r| ws.is_none_or(|w| r.ws == w))
            .filter(|r| run_names.is_none_or(|names| names.iter().any(|n| *n == r.run_name)))
            .collect::<Vec<_>>();
        self.cancel_many(&targets, CancelMode::User)
    }

    pub fn cancel_runs_by_property(&self, name: &str, value: &str) -> Vec<CancelOutcome> {
        let targets = self
            .all_runs()
            .into_iter()
            .filter(|r| r.context.property(name).as_deref() == Some(value))
            .collect::<Vec<_>>();
        self.cancel_many(&targets, CancelMode::User)
    }

    /// Fan the cancel out so one slow kill does not hold up the rest.
    pub(crate) fn cancel_many(&self, targets: &[Arc<Run>], mode: CancelMode) -> Vec<CancelOutcome> {
        std::thread::scope(|scope| {
            let handles = targets
                .iter()
                .map(|run| scope.spawn(move || self.cancel_one(run, mode)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .filter_map(|h| h.join().ok())
                .collect()
        })
    }

    fn cancel_one(&self, run: &Arc<Run>, mode: CancelMode) -> CancelOutcome {
        let was_queued = {
            let mut queue = self.queue.lock();
            let before = queue.len();
            queue.retain(|r| !Arc::ptr_eq(r, run));
            before != queue.len()
        };

        let (status_before, needs_wrapup) = {
            let mut state = run.state.lock();
            let status_before = state.status;
            if status_before.is_terminal() || state.is_wrapped_up {
                return CancelOutcome {
                    ws: run.ws.clone(),
                    run_name: run.run_name.clone(),
                    status_before,
                    cancelled: false,
                };
            }
            state.killing = true;
            if mode == CancelMode::ForRestart {
                state.killed_for_restart = true;
            }
            match state.pid {
                Some(pid) => {
                    state.status = RunStatus::Dying;
                    crate::spawn::kill_process_tree(pid, state.process.as_mut());
                    (status_before, false)
                }
                None => (status_before, true),
            }
        };

        if mode == CancelMode::ForRestart && run.context.parent_run_name.is_none() {
            self.restart_victims.lock().push(run.context.clone());
        }
        if needs_wrapup {
            self.wrapup(run, None);
        }
        tracing::info!(
            ws = %run.ws,
            run_name = %run.run_name,
            was_queued,
            for_restart = mode == CancelMode::ForRestart,
            "run cancelled"
        );
        CancelOutcome {
            ws: run.ws.clone(),
            run_name: run.run_name.clone(),
            status_before,
            cancelled: true,
        }
    }

    /// Kill everything for restart, then rebuild state after `delay`.
    /// Returns the number of runs killed.
    pub fn restart_controller(self: &Arc<Self>, delay: Duration) -> usize {
        self.restarting.store(true, Ordering::SeqCst);
        let targets = self.all_runs();
        let killed = self
            .cancel_many(&targets, CancelMode::ForRestart)
            .iter()
            .filter(|o| o.cancelled)
            .count();
        tracing::warn!(killed, delay_ms = delay.as_millis() as u64, "controller restart requested");
        let this = Arc::clone(self);
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            let result = this.reinitialize();
            this.restarting.store(false, Ordering::SeqCst);
            if let Err(err) = result {
                tracing::error!(error = %err, "controller reinitialisation failed");
                this.set_fatal(err);
            }
        });
        killed
    }

    fn reinitialize(&self) -> Result<usize, ControllerError> {
        self.wait_for_wrapups(Duration::from_secs(30));
        self.queue.lock().clear();
        self.registry.lock().clear();
        self.history.lock().clear();
        let victims = std::mem::take(&mut *self.restart_victims.lock());

        let mut queued = self.queue_from_context(true)?;
        let known = self
            .all_runs()
            .iter()
            .map(|r| r.key())
            .collect::<HashSet<_>>();
        for mut ctx in victims {
            if known.contains(&(ctx.ws.clone(), ctx.run_name.clone())) {
                continue;
            }
            ctx.restart = true;
            self.enqueue(ctx, None, 0)?;
            queued += 1;
        }
        tracing::info!(queued, "controller reinitialised");
        Ok(queued)
    }

    /// Block until every registered run has finished wrapup, or `timeout`.
    pub fn wait_for_wrapups(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self
                .all_runs()
                .iter()
                .filter(|r| {
                    let state = r.state.lock();
                    state.is_wrapped_up && !state.wrapup_done
                        || state.pid.is_some() && !state.wrapup_done
                })
                .count();
            if pending == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(pending, "timed out waiting for run wrapups");
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            tracing::info!("controller shutdown requested");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    /// Run a store operation under the controller's retry policy.
    pub(crate) fn retried<T>(
        &self,
        what: &str,
        op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.retry.run(what, op)
    }

    pub fn set_concurrent(&self, value: i64) -> Result<(), ControllerError> {
        if value < -1 || value == 0 {
            return Err(ControllerError::Config(format!(
                "concurrent must be -1 or positive, got {value}"
            )));
        }
        self.concurrent.store(value, Ordering::SeqCst);
        tracing::info!(concurrent = value, "concurrency changed");
        Ok(())
    }

    pub fn get_concurrent(&self) -> i64 {
        self.concurrent.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fatal(&self, err: ControllerError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    pub(crate) fn take_fatal(&self) -> Option<ControllerError> {
        self.fatal.lock().take()
    }

    pub(crate) fn console_path(&self, ws: &str, run_name: &str) -> PathBuf {
        self.cfg
            .work_dir
            .join("console")
            .join(ws)
            .join(format!("{run_name}.log"))
    }
}
