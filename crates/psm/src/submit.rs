#![forbid(unsafe_code)]

//! Client side of job submission: plan the job, upload the code snapshot,
//! and drop one packet per node into the target box queues.

use crate::config::DEFAULT_CONTROLLER_SCRIPT;
use crate::error::PsmError;
use crate::queue::PsmQueue;
use rand::Rng;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use xt_core::context::{FN_MULTI_RUN_CONTEXT, MultiRunContext, NodeRuns, RunContext};
use xt_core::events::{EV_CREATED, LogEvent};
use xt_core::ids::{NodeId, job_id_from_seq, run_name_from_seq};
use xt_core::packet::PacketName;
use xt_core::status::{JobStatus, RunStatus, Schedule, SearchStyle};
use xt_search::{GenerateMode, SearchSpace, generate_runsets, insert_hparam_args, split_cmd};
use xt_storage::{
    JobDoc, MetadataStore, ObjectStore, RunRecord, blob_sha256, plan_active_runs, unzip_into,
    zip_dir,
};

pub const DEFAULT_TEAM: &str = "xt";

#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub team: String,
    pub ws: String,
    pub exper_name: String,
    pub username: String,
    pub code_dir: PathBuf,
    pub cmds: Vec<String>,
    pub search_style: SearchStyle,
    pub search_type: Option<String>,
    /// Relative to `code_dir`.
    pub hp_config: Option<String>,
    /// Planned runs; 0 means one per command (or one grid cycle).
    pub total_runs: usize,
    pub node_count: usize,
    pub primary_metric: Option<String>,
    pub maximize_metric: bool,
    pub concurrent: i64,
    /// One PSM queue directory per box; nodes are dealt round-robin.
    pub box_queues: Vec<PathBuf>,
    /// Controller invocation written into the packet's wrapper script.
    pub controller_cmd: Vec<String>,
    pub controller_script: String,
    /// Extra per-run fields (after files, activate command, ...).
    pub template: RunContext,
}

impl SubmitRequest {
    pub fn new(ws: impl Into<String>, code_dir: impl Into<PathBuf>, cmds: Vec<String>) -> Self {
        let template: RunContext =
            serde_json::from_value(json!({ "ws": "", "run_name": "", "job_id": "" }))
                .unwrap_or_default();
        Self {
            team: DEFAULT_TEAM.to_string(),
            ws: ws.into(),
            exper_name: String::new(),
            username: String::new(),
            code_dir: code_dir.into(),
            cmds,
            search_style: SearchStyle::Single,
            search_type: None,
            hp_config: None,
            total_runs: 0,
            node_count: 1,
            primary_metric: None,
            maximize_metric: false,
            concurrent: 1,
            box_queues: Vec::new(),
            controller_cmd: vec![crate::config::DEFAULT_CONTROLLER_BIN.to_string()],
            controller_script: DEFAULT_CONTROLLER_SCRIPT.to_string(),
            template,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubmittedJob {
    pub job_id: String,
    /// Object-store path of the code snapshot, under the workspace container.
    pub code_snapshot: String,
    pub box_secret: String,
    /// Top-level run per node, in node order.
    pub run_names: Vec<String>,
    pub cmds: Vec<String>,
    pub packets: Vec<PathBuf>,
}

pub fn submit_job(
    store: &dyn MetadataStore,
    objects: &dyn ObjectStore,
    req: &SubmitRequest,
) -> Result<SubmittedJob, PsmError> {
    submit_job_with(store, objects, req, &mut rand::rng())
}

pub fn submit_job_with<R: Rng + ?Sized>(
    store: &dyn MetadataStore,
    objects: &dyn ObjectStore,
    req: &SubmitRequest,
    rng: &mut R,
) -> Result<SubmittedJob, PsmError> {
    validate(req)?;
    let cmds = expand_commands(req, rng)?;
    let run_count = match req.search_style {
        SearchStyle::Single => req.node_count,
        _ if req.total_runs > 0 && !expanded_up_front(req) => req.total_runs,
        _ => cmds.len(),
    };
    let schedule = match req.search_style {
        SearchStyle::Dynamic => Schedule::Dynamic,
        _ => Schedule::Static,
    };

    let job_id = job_id_from_seq(store.next_job_id()?);
    let staging = staging_dir(&job_id)?;
    let outcome = (|| -> Result<SubmittedJob, PsmError> {
        let code_snapshot = upload_snapshot(objects, req, &staging)?;
        let box_secret = uuid::Uuid::new_v4().simple().to_string();

        let job = JobDoc {
            job_id: job_id.clone(),
            ws: req.ws.clone(),
            exper_name: req.exper_name.clone(),
            username: req.username.clone(),
            schedule,
            run_count,
            node_count: req.node_count,
            primary_metric: req.primary_metric.clone(),
            maximize_metric: req.maximize_metric,
            search_type: req.search_type.clone(),
            hp_config: req.hp_config.clone(),
            service_info_by_node: service_info(req),
            parent_by_node: BTreeMap::new(),
            running_nodes: 0,
            running_runs: 0,
            completed_runs: 0,
            error_runs: 0,
            job_status: JobStatus::Created,
            create_time: xt_core::time::now_rfc3339(),
            active_runs: match req.search_style {
                SearchStyle::Single => Vec::new(),
                _ => plan_active_runs(run_count, req.node_count, schedule),
            },
        };
        store.create_job(&job)?;

        let mut mrc = MultiRunContext {
            search_style: req.search_style,
            cmds: cmds.clone(),
            context_by_nodes: BTreeMap::new(),
        };
        let mut run_names = Vec::with_capacity(req.node_count);
        for index in 0..req.node_count {
            let run_name = run_name_from_seq(store.next_run_id(&req.ws)?);
            let ctx = node_context(req, &job_id, &run_name, index, run_count, &cmds, &code_snapshot);
            create_run_record(store, &ctx)?;
            mrc.context_by_nodes
                .insert(NodeId::from_index(index).to_string(), NodeRuns { runs: vec![ctx] });
            run_names.push(run_name);
        }

        let packet = build_packet(req, &job_id, &box_secret, &mrc, &staging)?;
        let ticks = xt_core::time::now_ticks();
        let mut packets = Vec::with_capacity(req.node_count);
        for (index, run_name) in run_names.iter().enumerate() {
            let queue = PsmQueue::open(&req.box_queues[index % req.box_queues.len()])?;
            let name = PacketName {
                team: req.team.clone(),
                job_id: job_id.clone(),
                run_name: run_name.clone(),
                node_id: NodeId::from_index(index),
                ticks,
            };
            packets.push(queue.enqueue(&packet, &name)?);
        }
        tracing::info!(
            job_id = %job_id,
            ws = %req.ws,
            nodes = req.node_count,
            runs = run_count,
            style = %req.search_style.as_str(),
            "job submitted"
        );
        Ok(SubmittedJob {
            job_id: job_id.clone(),
            code_snapshot,
            box_secret,
            run_names,
            cmds,
            packets,
        })
    })();
    let _ = std::fs::remove_dir_all(&staging);
    outcome
}

fn validate(req: &SubmitRequest) -> Result<(), PsmError> {
    if req.ws.trim().is_empty() {
        return Err(PsmError::Config("workspace is required".to_string()));
    }
    if req.cmds.iter().all(|c| c.trim().is_empty()) {
        return Err(PsmError::Config("at least one command is required".to_string()));
    }
    if req.node_count == 0 {
        return Err(PsmError::Config("node_count must be positive".to_string()));
    }
    if req.box_queues.is_empty() {
        return Err(PsmError::Config("no target box queues".to_string()));
    }
    if req.controller_cmd.is_empty() {
        return Err(PsmError::Config("controller command is empty".to_string()));
    }
    if !req.code_dir.is_dir() {
        return Err(PsmError::Config(format!(
            "code dir {} does not exist",
            req.code_dir.display()
        )));
    }
    if req.search_style != SearchStyle::Single && req.search_type.is_some() != req.hp_config.is_some()
    {
        return Err(PsmError::Config(
            "search_type and hp_config must be given together".to_string(),
        ));
    }
    Ok(())
}

fn expanded_up_front(req: &SubmitRequest) -> bool {
    req.search_style == SearchStyle::Static && req.search_type.is_some() && req.hp_config.is_some()
}

/// Static searches are expanded here; dynamic ones are sampled per child by
/// the controller.
fn expand_commands<R: Rng + ?Sized>(
    req: &SubmitRequest,
    rng: &mut R,
) -> Result<Vec<String>, PsmError> {
    let cmds = req
        .cmds
        .iter()
        .filter(|c| !c.trim().is_empty())
        .cloned()
        .collect::<Vec<_>>();
    let (true, Some(search_type), Some(hp_config)) =
        (expanded_up_front(req), &req.search_type, &req.hp_config)
    else {
        return Ok(cmds);
    };
    let path = req.code_dir.join(hp_config);
    let text = std::fs::read_to_string(&path)
        .map_err(|e| PsmError::Config(format!("hp config {}: {e}", path.display())))?;
    let space = SearchSpace::from_yaml_str(&text)?;
    let mode = GenerateMode::from_search_type(search_type)?;
    let count = (req.total_runs > 0).then_some(req.total_runs);
    let runsets = generate_runsets(&space, mode, count, rng)?;
    let prefix = req.template.option_prefix.as_deref().unwrap_or("--");
    Ok(runsets
        .iter()
        .enumerate()
        .map(|(i, args)| {
            let base = split_cmd(&cmds[i % cmds.len()]);
            join_cmd(&insert_hparam_args(&base, prefix, args))
        })
        .collect())
}

fn join_cmd(parts: &[String]) -> String {
    parts
        .iter()
        .map(|part| {
            if part.is_empty() {
                "''".to_string()
            } else if !part.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
                part.clone()
            } else if part.contains('\'') {
                format!("\"{part}\"")
            } else {
                format!("'{part}'")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn staging_dir(job_id: &str) -> Result<PathBuf, PsmError> {
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "xt_submit_{job_id}_{}_{nonce}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Zip the code tree and store it content-addressed; identical trees share
/// one blob.
fn upload_snapshot(
    objects: &dyn ObjectStore,
    req: &SubmitRequest,
    staging: &Path,
) -> Result<String, PsmError> {
    let zip_path = staging.join("code.zip");
    let skip = [FN_MULTI_RUN_CONTEXT, req.controller_script.as_str()];
    let files = zip_dir(&req.code_dir, &zip_path, &skip)?;
    let data = std::fs::read(&zip_path)?;
    let blob = format!("snapshots/{}.zip", blob_sha256(&data));
    objects.create_container(&req.ws)?;
    if objects.blob_exists(&req.ws, &blob)? {
        tracing::debug!(blob = %blob, "code snapshot already stored");
    } else {
        objects.create_blob(&req.ws, &blob, &data)?;
        tracing::info!(blob = %blob, files, bytes = data.len(), "code snapshot uploaded");
    }
    Ok(blob)
}

fn service_info(req: &SubmitRequest) -> BTreeMap<String, JsonValue> {
    (0..req.node_count)
        .map(|index| {
            let queue = &req.box_queues[index % req.box_queues.len()];
            (
                NodeId::from_index(index).to_string(),
                json!({ "psm_queue": queue.display().to_string() }),
            )
        })
        .collect()
}

fn node_context(
    req: &SubmitRequest,
    job_id: &str,
    run_name: &str,
    index: usize,
    run_count: usize,
    cmds: &[String],
    code_snapshot: &str,
) -> RunContext {
    let mut ctx = req.template.clone();
    ctx.ws = req.ws.clone();
    ctx.run_name = run_name.to_string();
    ctx.job_id = job_id.to_string();
    ctx.node_index = index;
    ctx.exper_name = req.exper_name.clone();
    ctx.username = req.username.clone();
    ctx.code_snapshot = Some(code_snapshot.to_string());
    ctx.primary_metric = req.primary_metric.clone();
    ctx.maximize_metric = req.maximize_metric;
    ctx.search_style = req.search_style;
    ctx.total_run_count = run_count;
    match req.search_style {
        SearchStyle::Single => {
            ctx.cmd_parts = split_cmd(&cmds[index % cmds.len()]);
            ctx.is_parent = false;
            ctx.run_index = None;
        }
        SearchStyle::Static | SearchStyle::Dynamic => {
            ctx.cmd_parts = split_cmd(&cmds[0]);
            ctx.is_parent = true;
            ctx.search_type = req.search_type.clone();
            ctx.hp_config = req.hp_config.clone();
        }
    }
    ctx
}

fn create_run_record(store: &dyn MetadataStore, ctx: &RunContext) -> Result<(), PsmError> {
    let mut record = RunRecord::new(&ctx.ws, &ctx.run_name);
    record.job_id = Some(ctx.job_id.clone());
    record.node_id = Some(ctx.node_id().to_string());
    record.is_parent = ctx.is_parent;
    record.exper_name = ctx.exper_name.clone();
    record.username = ctx.username.clone();
    record.search_type = ctx.search_type.clone();
    record.status = RunStatus::Created;
    store.create_run(&record)?;
    store.add_run_event(
        &ctx.ws,
        &ctx.run_name,
        &LogEvent::from_value(EV_CREATED, json!({ "job_id": ctx.job_id })),
    )?;
    Ok(())
}

fn build_packet(
    req: &SubmitRequest,
    job_id: &str,
    box_secret: &str,
    mrc: &MultiRunContext,
    staging: &Path,
) -> Result<PathBuf, PsmError> {
    let tree = staging.join("packet");
    unzip_into(&staging.join("code.zip"), &tree)?;
    std::fs::write(
        tree.join(FN_MULTI_RUN_CONTEXT),
        serde_json::to_vec_pretty(mrc)?,
    )?;
    let windows = req.controller_script.ends_with(".bat");
    std::fs::write(
        tree.join(&req.controller_script),
        controller_script(req, job_id, box_secret, windows),
    )?;
    let packet = staging.join("packet.zip");
    zip_dir(&tree, &packet, &[])?;
    Ok(packet)
}

/// Wrapper the PSM runs as `<script> <node_id> <run_name>` from the
/// unpacked packet directory.
pub fn controller_script(req: &SubmitRequest, job_id: &str, box_secret: &str, windows: bool) -> String {
    let program = join_cmd(&req.controller_cmd);
    if windows {
        format!(
            "@echo off\r\ncd /d \"%~dp0\"\r\n{program} --node-id %1 --job-id {job_id} --workspace {ws} \
             --concurrent {concurrent} --box-secret {box_secret} --cwd \"%CD%\"\r\n",
            ws = req.ws,
            concurrent = req.concurrent,
        )
    } else {
        format!(
            "#!/bin/sh\ncd \"$(dirname \"$0\")\" || exit 1\n\
             exec {program} --node-id \"$1\" --job-id {job_id} --workspace {ws} \
             --concurrent {concurrent} --box-secret {box_secret} --cwd \"$PWD\"\n",
            ws = req.ws,
            concurrent = req.concurrent,
        )
    }
}
