#![forbid(unsafe_code)]

use crate::controller::NodeController;
use crate::error::ControllerError;
use crate::mirror::{MirrorTarget, MirrorWorker};
use crate::run::Run;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use xt_core::context::{
    ENV_BOX_SECRET, ENV_CONTROLLER, ENV_EXPERIMENT_NAME, ENV_MONGO_CONN_STR, ENV_NODE_ID,
    ENV_OUTPUT_DIR, ENV_OUTPUT_MNT, ENV_RESUME_NAME, ENV_RUN_NAME, ENV_SERVER_CERT,
    ENV_STORE_CODE_PATH, ENV_STORE_CREDS, ENV_TARGET_FILE, ENV_WORKSPACE_NAME, FN_CURRENT_ENTRY,
    FN_CURRENT_RUNNING_ENTRY, FN_GENERATED_CONFIG, FN_MULTI_RUN_CONTEXT, FN_RUN_CONTEXT,
    RunContext,
};
use xt_core::events::{EV_RESTARTED, EV_STARTED, LogEvent};
use xt_core::failure::LAUNCH_FAILURE_EXIT_CODE;
use xt_core::status::RunStatus;

#[cfg(windows)]
pub(crate) const SCRIPT_EXT: &str = "bat";
#[cfg(not(windows))]
pub(crate) const SCRIPT_EXT: &str = "sh";

/// Inline `run_script` text is written here (inside the working dir).
pub(crate) const FN_USER_SCRIPT: &str = "__xt_user_script__";

/// Files of the packet directory that never belong in a rundir.
const CWD_SKIP: [&str; 3] = [FN_MULTI_RUN_CONTEXT, FN_CURRENT_ENTRY, FN_CURRENT_RUNNING_ENTRY];

pub(crate) fn normalize_line_endings(text: &str, windows: bool) -> String {
    let unix = text.replace("\r\n", "\n");
    if windows {
        unix.replace('\n', "\r\n")
    } else {
        unix
    }
}

pub(crate) fn shell_command(script: &Path) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(script);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg(script);
        cmd
    }
}

/// Kill a child and everything it started. Children are launched as
/// process-group leaders, so on unix the whole group is signalled.
pub(crate) fn kill_process_tree(pid: u32, child: Option<&mut Child>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let _ = child;
        if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::debug!(pid, error = %err, "killpg failed; process already gone");
        }
    }
    #[cfg(not(unix))]
    {
        let status = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if !status.is_ok_and(|s| s.success())
            && let Some(child) = child
        {
            let _ = child.kill();
        }
    }
}

fn quote_part(part: &str, windows: bool) -> String {
    let needs_quotes = part.is_empty() || part.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'');
    if !needs_quotes {
        return part.to_string();
    }
    if windows {
        format!("\"{}\"", part.replace('"', "\"\""))
    } else {
        format!("'{}'", part.replace('\'', "'\\''"))
    }
}

fn expand_tokens(text: &str, ctx: &RunContext) -> String {
    [
        ("$xt_run_name", ctx.run_name.as_str()),
        ("$xt_job_id", ctx.job_id.as_str()),
        ("$xt_workspace", ctx.ws.as_str()),
        ("$xt_experiment", ctx.exper_name.as_str()),
    ]
    .iter()
    .fold(text.replace("$xt_node_id", &ctx.node_id().to_string()), |acc, (token, value)| {
        acc.replace(token, value)
    })
}

/// The wrapper script the controller launches for one run.
pub(crate) fn build_run_script(ctx: &RunContext, windows: bool) -> String {
    let mut lines = Vec::new();
    if windows {
        lines.push("@echo off".to_string());
    } else {
        lines.push("#!/bin/sh".to_string());
    }
    if let Some(login) = ctx.docker_login_cmd.as_deref().filter(|c| !c.trim().is_empty()) {
        lines.push(login.to_string());
    }
    if let Some(activate) = ctx.activate_cmd.as_deref().filter(|c| !c.trim().is_empty()) {
        lines.push(activate.to_string());
    }

    let args = ctx
        .cmd_parts
        .iter()
        .map(|p| quote_part(p, windows))
        .collect::<Vec<_>>();
    let user_line = if ctx.run_script.is_some() {
        let script = format!("{FN_USER_SCRIPT}.{SCRIPT_EXT}");
        let invoke = if windows {
            format!("call {script}")
        } else {
            format!("sh ./{script}")
        };
        std::iter::once(invoke).chain(args).collect::<Vec<_>>().join(" ")
    } else {
        args.join(" ")
    };
    lines.push(user_line);

    let mut text = lines.join("\n");
    text.push('\n');
    normalize_line_endings(&expand_tokens(&text, ctx), windows)
}

/// Rewrite a controller-side output path into the run's working dir.
fn rewrite_output_path(value: Option<String>, cwd: &Path, workdir: &Path) -> String {
    let fallback = workdir.join("output");
    let Some(value) = value else {
        return fallback.to_string_lossy().to_string();
    };
    match Path::new(&value).strip_prefix(cwd) {
        Ok(rel) => workdir.join(rel).to_string_lossy().to_string(),
        Err(_) => value,
    }
}

pub(crate) struct ChildEnv<'a> {
    pub(crate) ctx: &'a RunContext,
    pub(crate) node_id: String,
    pub(crate) box_secret: &'a str,
    pub(crate) server_cert: Option<&'a str>,
    pub(crate) cwd: &'a Path,
    pub(crate) workdir: &'a Path,
}

pub(crate) fn append_child_env(cmd: &mut Command, env: &ChildEnv<'_>) {
    let ctx = env.ctx;
    let resume = if ctx.restart { ctx.run_name.as_str() } else { "" };
    cmd.env(ENV_NODE_ID, &env.node_id)
        .env(ENV_WORKSPACE_NAME, &ctx.ws)
        .env(ENV_EXPERIMENT_NAME, &ctx.exper_name)
        .env(ENV_RUN_NAME, &ctx.run_name)
        .env(ENV_RESUME_NAME, resume)
        .env(ENV_TARGET_FILE, &ctx.target_file)
        .env(ENV_STORE_CODE_PATH, &ctx.store_code_path)
        .env(ENV_STORE_CREDS, &ctx.store_creds)
        .env(ENV_MONGO_CONN_STR, &ctx.mongo_conn_str)
        .env(ENV_CONTROLLER, "1")
        .env(ENV_BOX_SECRET, env.box_secret)
        .env(
            ENV_OUTPUT_DIR,
            rewrite_output_path(crate::config::env_var(ENV_OUTPUT_DIR), env.cwd, env.workdir),
        )
        .env(
            ENV_OUTPUT_MNT,
            rewrite_output_path(crate::config::env_var(ENV_OUTPUT_MNT), env.cwd, env.workdir),
        );
    if let Some(cert) = env.server_cert {
        cmd.env(ENV_SERVER_CERT, cert);
    }
}

fn copy_tree(src: &Path, dest: &Path, skip: &[&str]) -> std::io::Result<usize> {
    let mut copied = 0;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if skip.iter().any(|s| name == *s) {
            continue;
        }
        let target = dest.join(&name);
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&target)?;
            copied += copy_tree(&entry.path(), &target, &[])?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn launch_error(run: &Run, reason: impl std::fmt::Display) -> ControllerError {
    ControllerError::Launch {
        run_name: run.run_name.clone(),
        reason: reason.to_string(),
    }
}

impl NodeController {
    /// Launch a queued run. Failures before the process starts end the run
    /// with the launch-failure exit code.
    pub(crate) fn spawn_run(self: &Arc<Self>, run: &Arc<Run>) {
        if let Err(err) = self.launch(run) {
            tracing::error!(ws = %run.ws, run_name = %run.run_name, error = %err, "launch failed");
            self.wrapup(run, Some(LAUNCH_FAILURE_EXIT_CODE));
        }
    }

    fn launch(self: &Arc<Self>, run: &Arc<Run>) -> Result<(), ControllerError> {
        {
            let mut state = run.state.lock();
            if state.killing || state.is_wrapped_up {
                return Ok(());
            }
            state.status = RunStatus::Spawning;
        }
        let ctx = &run.context;

        let rundir = self.rundirs.lock().allocate()?;
        run.state.lock().rundir = Some(rundir.clone());
        self.populate_rundir(run, &rundir)?;

        let workdir = crate::wrapup::workdir_of(&rundir, &ctx.working_dir);
        std::fs::create_dir_all(&workdir)?;
        if let Some(text) = &ctx.generated_sweep_text {
            let name = match ctx.fn_generated_config.as_str() {
                "" => FN_GENERATED_CONFIG,
                name => name,
            };
            std::fs::write(workdir.join(name), text)?;
        }
        std::fs::write(
            workdir.join(FN_RUN_CONTEXT),
            serde_json::to_vec_pretty(ctx)?,
        )?;
        if let Some(script) = &ctx.run_script {
            std::fs::write(
                workdir.join(format!("{FN_USER_SCRIPT}.{SCRIPT_EXT}")),
                normalize_line_endings(script, cfg!(windows)),
            )?;
        }

        let script_path = self
            .cfg
            .work_dir
            .join("scripts")
            .join(&run.ws)
            .join(format!("{}.{SCRIPT_EXT}", run.run_name));
        if let Some(parent) = script_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&script_path, build_run_script(ctx, cfg!(windows)))?;

        let console_path = self.console_path(&run.ws, &run.run_name);
        if let Some(parent) = console_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let console = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&console_path)?;
        run.state.lock().console_path = Some(console_path);

        let (pipe_reader, pipe_writer) = std::io::pipe()?;
        let mut cmd = shell_command(&script_path);
        cmd.current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(pipe_writer.try_clone()?)
            .stderr(pipe_writer);
        append_child_env(
            &mut cmd,
            &ChildEnv {
                ctx,
                node_id: self.cfg.node_id.to_string(),
                box_secret: &self.cfg.box_secret,
                server_cert: self.cfg.server_cert.as_deref(),
                cwd: &self.cfg.cwd,
                workdir: &workdir,
            },
        );
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let child = cmd.spawn().map_err(|e| launch_error(run, e))?;
        // The command keeps write ends of the pipe; the reader only sees EOF
        // once they are gone.
        drop(cmd);
        let pid = child.id();

        let restarts = {
            let mut state = run.state.lock();
            state.process = Some(child);
            state.pid = Some(pid);
            if state.is_wrapped_up {
                kill_process_tree(pid, state.process.as_mut());
                if let Some(mut child) = state.process.take() {
                    let _ = child.wait();
                }
                tracing::info!(run_name = %run.run_name, "run cancelled during launch");
                return Ok(());
            }
            state.status = RunStatus::Running;
            state.start_ms = Some(xt_core::time::now_ms());
            state.restarts
        };
        tracing::info!(ws = %run.ws, run_name = %run.run_name, pid, restarts, "run started");

        self.record_start(run, restarts);

        if let Some(pattern) = ctx.mirror_files.as_deref().filter(|p| !p.trim().is_empty()) {
            let worker = MirrorWorker::start(
                MirrorTarget {
                    objects: self.objects.clone(),
                    retry: self.retry.clone(),
                    ws: run.ws.clone(),
                    run_name: run.run_name.clone(),
                    rundir: rundir.clone(),
                    pattern: pattern.to_string(),
                },
                Duration::from_secs(ctx.mirror_interval_s.max(1)),
            );
            run.state.lock().mirror = Some(worker);
        }

        let this = Arc::clone(self);
        let reader_run = Arc::clone(run);
        std::thread::Builder::new()
            .name(format!("xt-reader-{}", run.run_name))
            .spawn(move || this.read_console(&reader_run, pipe_reader, console))
            .map_err(|e| launch_error(run, e))?;
        Ok(())
    }

    fn populate_rundir(&self, run: &Run, rundir: &Path) -> Result<(), ControllerError> {
        let ctx = &run.context;
        match ctx.code_snapshot.as_deref() {
            Some(blob) if !self.cfg.is_aml => {
                let local = self.snapshot_cache_path(blob);
                if !local.is_file() {
                    if let Some(parent) = local.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    self.retried("download", || {
                        self.objects.download(&run.ws, blob, &local)
                    })?;
                }
                xt_storage::unzip_into(&local, rundir)?;
                tracing::debug!(run_name = %run.run_name, blob, "code snapshot unpacked");
            }
            _ => {
                let copied = copy_tree(&self.cfg.cwd, rundir, &CWD_SKIP)?;
                tracing::debug!(run_name = %run.run_name, copied, "working dir copied");
            }
        }
        Ok(())
    }

    fn snapshot_cache_path(&self, blob: &str) -> PathBuf {
        let name = blob.rsplit('/').next().unwrap_or(blob);
        self.cfg.work_dir.join("snapshots").join(name)
    }

    /// Store-side accounting for a started process. Failures are logged; the
    /// process is already running.
    fn record_start(&self, run: &Run, restarts: u32) {
        let ctx = &run.context;
        let mut set = serde_json::Map::new();
        set.insert("status".to_string(), json!(RunStatus::Running.as_str()));
        set.insert("node_id".to_string(), json!(self.cfg.node_id.to_string()));
        self.update_run_fields(run, set);
        if let Err(err) =
            self.retried("run_start", || self.store.run_start(&run.ws, &run.run_name))
        {
            tracing::warn!(run_name = %run.run_name, error = %err, "run_start failed");
        }
        let event = if ctx.restart || restarts > 0 {
            EV_RESTARTED
        } else {
            EV_STARTED
        };
        self.log_event(run, LogEvent::from_value(event, json!({ "restarts": restarts })));

        if ctx.job_id.is_empty() {
            return;
        }
        if self.restart_counted.lock().remove(&run.key()) {
            tracing::debug!(run_name = %run.run_name, "relaunch after restart; run already counted");
        } else if let Err(err) =
            self.retried("job_run_start", || self.store.job_run_start(&ctx.job_id))
        {
            tracing::warn!(job_id = %ctx.job_id, error = %err, "job_run_start failed");
        }
        self.note_node_started(&ctx.job_id);
    }

    /// Report this node's first activity on a job, once per job.
    pub(crate) fn note_node_started(&self, job_id: &str) {
        if job_id.is_empty() || !self.nodes_started.lock().insert(job_id.to_string()) {
            return;
        }
        if let Err(err) = self.retried("job_node_start", || self.store.job_node_start(job_id)) {
            tracing::warn!(job_id, error = %err, "job_node_start failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunContext {
        RunContext {
            ws: "ws1".into(),
            run_name: "run4".into(),
            job_id: "job2".into(),
            node_index: 1,
            cmd_parts: vec!["python".into(), "train.py".into(), "--name=a b".into()],
            ..Default::default()
        }
    }

    #[test]
    fn script_quotes_args_and_expands_tokens() {
        let mut ctx = ctx();
        ctx.activate_cmd = Some("echo activate $xt_run_name".into());
        ctx.cmd_parts.push("--out=/runs/$xt_job_id/$xt_node_id".into());
        let script = build_run_script(&ctx, false);
        let lines = script.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "#!/bin/sh");
        assert_eq!(lines[1], "echo activate run4");
        assert_eq!(lines[2], "python train.py '--name=a b' --out=/runs/job2/node1");
    }

    #[test]
    fn inline_script_is_invoked_with_args() {
        let mut ctx = ctx();
        ctx.run_script = Some("echo hi\n".into());
        ctx.cmd_parts = vec!["--lr=0.1".into()];
        ctx.docker_login_cmd = Some("docker login x".into());
        let script = build_run_script(&ctx, false);
        assert!(script.contains("docker login x\n"));
        assert!(script.ends_with("sh ./__xt_user_script__.sh --lr=0.1\n"));
    }

    #[test]
    fn windows_scripts_use_crlf() {
        let script = build_run_script(&ctx(), true);
        assert!(script.starts_with("@echo off\r\n"));
        assert!(script.contains("\"--name=a b\""));
        assert!(!script.replace("\r\n", "").contains('\n'));
    }

    #[test]
    fn output_paths_follow_the_working_dir() {
        let cwd = Path::new("/box/cwd");
        let workdir = Path::new("/box/work/rundirs/rundir0");
        assert_eq!(
            rewrite_output_path(Some("/box/cwd/output".into()), cwd, workdir),
            "/box/work/rundirs/rundir0/output"
        );
        assert_eq!(
            rewrite_output_path(Some("/mnt/out".into()), cwd, workdir),
            "/mnt/out"
        );
        assert_eq!(
            rewrite_output_path(None, cwd, workdir),
            "/box/work/rundirs/rundir0/output"
        );
    }
}
