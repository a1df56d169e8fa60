#![forbid(unsafe_code)]

//! Context documents passed from the submitting client to the node controller,
//! and from the controller to each training process.

use crate::status::SearchStyle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const FN_MULTI_RUN_CONTEXT: &str = "__multi_run_context__.json";
pub const FN_RUN_CONTEXT: &str = "__xt_run_context__.json";
pub const FN_CURRENT_ENTRY: &str = "__current_entry__.zip";
pub const FN_CURRENT_RUNNING_ENTRY: &str = "_current_running_entry_.txt";
pub const FN_GENERATED_CONFIG: &str = "hp-runset.yaml";

pub const ENV_NODE_ID: &str = "XT_NODE_ID";
pub const ENV_WORKSPACE_NAME: &str = "XT_WORKSPACE_NAME";
pub const ENV_EXPERIMENT_NAME: &str = "XT_EXPERIMENT_NAME";
pub const ENV_RUN_NAME: &str = "XT_RUN_NAME";
pub const ENV_RESUME_NAME: &str = "XT_RESUME_NAME";
pub const ENV_TARGET_FILE: &str = "XT_TARGET_FILE";
pub const ENV_STORE_CREDS: &str = "XT_STORE_CREDS";
pub const ENV_MONGO_CONN_STR: &str = "XT_MONGO_CONN_STR";
pub const ENV_STORE_CODE_PATH: &str = "XT_STORE_CODE_PATH";
pub const ENV_OUTPUT_DIR: &str = "XT_OUTPUT_DIR";
pub const ENV_OUTPUT_MNT: &str = "XT_OUTPUT_MNT";
pub const ENV_CONTROLLER: &str = "XT_CONTROLLER";
pub const ENV_BOX_SECRET: &str = "XT_BOX_SECRET";
pub const ENV_SERVER_CERT: &str = "XT_SERVER_CERT";

fn default_working_dir() -> String {
    ".".to_string()
}

fn default_option_prefix() -> Option<String> {
    Some("--".to_string())
}

fn default_generated_config() -> String {
    FN_GENERATED_CONFIG.to_string()
}

fn default_true() -> bool {
    true
}

fn default_mirror_interval_s() -> u64 {
    30
}

/// Everything a controller needs to launch one run, and everything the
/// training process may introspect via `__xt_run_context__.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub ws: String,
    pub run_name: String,
    pub job_id: String,
    #[serde(default)]
    pub node_index: usize,
    #[serde(default)]
    pub exper_name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub cmd_parts: Vec<String>,
    /// Inline script text; when present it is invoked with the run's args.
    #[serde(default)]
    pub run_script: Option<String>,
    #[serde(default)]
    pub target_file: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// base64-encoded JSON.
    #[serde(default)]
    pub store_creds: String,
    /// base64-encoded connection string.
    #[serde(default)]
    pub mongo_conn_str: String,
    #[serde(default)]
    pub store_code_path: String,
    /// Object-store path of the zipped code snapshot (`snapshots/<sha256>.zip`).
    #[serde(default)]
    pub code_snapshot: Option<String>,
    #[serde(default)]
    pub primary_metric: Option<String>,
    #[serde(default)]
    pub maximize_metric: bool,
    #[serde(default)]
    pub report_rollup: bool,
    #[serde(default)]
    pub search_type: Option<String>,
    #[serde(default)]
    pub search_style: SearchStyle,
    #[serde(default)]
    pub hp_config: Option<String>,
    #[serde(default = "default_option_prefix")]
    pub option_prefix: Option<String>,
    #[serde(default)]
    pub after_files_list: Vec<String>,
    #[serde(default)]
    pub after_omit_list: Vec<String>,
    #[serde(default)]
    pub activate_cmd: Option<String>,
    #[serde(default)]
    pub docker_login_cmd: Option<String>,
    #[serde(default = "default_true")]
    pub log: bool,
    #[serde(default = "default_true")]
    pub after_upload: bool,
    #[serde(default)]
    pub repeat: Option<u32>,
    #[serde(default)]
    pub repeats_remaining: Option<u32>,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub is_parent: bool,
    /// Shell script run once before a parent starts spawning children.
    #[serde(default)]
    pub parent_script: Option<String>,
    #[serde(default)]
    pub total_run_count: usize,
    #[serde(default = "default_generated_config")]
    pub fn_generated_config: String,
    #[serde(default)]
    pub generated_sweep_text: Option<String>,
    #[serde(default)]
    pub run_index: Option<usize>,
    #[serde(default)]
    pub parent_run_name: Option<String>,
    #[serde(default)]
    pub mirror_files: Option<String>,
    #[serde(default = "default_mirror_interval_s")]
    pub mirror_interval_s: u64,
}

impl RunContext {
    pub fn node_id(&self) -> crate::ids::NodeId {
        crate::ids::NodeId::from_index(self.node_index)
    }

    /// Property lookup used by `cancel_runs_by_property`.
    pub fn property(&self, name: &str) -> Option<String> {
        let value = serde_json::to_value(self).ok()?;
        match value.get(name)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRuns {
    #[serde(default)]
    pub runs: Vec<RunContext>,
}

/// `__multi_run_context__.json` inside every job packet.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiRunContext {
    #[serde(default)]
    pub search_style: SearchStyle,
    #[serde(default)]
    pub cmds: Vec<String>,
    #[serde(default)]
    pub context_by_nodes: BTreeMap<String, NodeRuns>,
}

impl MultiRunContext {
    pub fn runs_for_node(&self, node_id: &crate::ids::NodeId) -> &[RunContext] {
        self.context_by_nodes
            .get(&node_id.to_string())
            .map(|n| n.runs.as_slice())
            .unwrap_or(&[])
    }

    /// Command for a child run; commands cycle when there are fewer than runs.
    pub fn cmd_for_run_index(&self, run_index: usize) -> Option<&str> {
        if self.cmds.is_empty() {
            return None;
        }
        Some(self.cmds[run_index % self.cmds.len()].as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_context_defaults_fill_optional_fields() {
        let ctx: RunContext = serde_json::from_value(json!({
            "ws": "ws1",
            "run_name": "run3",
            "job_id": "job1"
        }))
        .expect("context");
        assert_eq!(ctx.working_dir, ".");
        assert_eq!(ctx.option_prefix.as_deref(), Some("--"));
        assert_eq!(ctx.fn_generated_config, FN_GENERATED_CONFIG);
        assert!(ctx.after_upload);
        assert!(!ctx.report_rollup);
        assert_eq!(ctx.search_style, SearchStyle::Single);
    }

    #[test]
    fn commands_cycle_by_run_index() {
        let mrc = MultiRunContext {
            cmds: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        assert_eq!(mrc.cmd_for_run_index(0), Some("a"));
        assert_eq!(mrc.cmd_for_run_index(3), Some("b"));
        assert_eq!(MultiRunContext::default().cmd_for_run_index(0), None);
    }

    #[test]
    fn property_lookup_renders_scalars() {
        let ctx = RunContext {
            username: "alice".into(),
            node_index: 2,
            ..Default::default()
        };
        assert_eq!(ctx.property("username").as_deref(), Some("alice"));
        assert_eq!(ctx.property("node_index").as_deref(), Some("2"));
        assert_eq!(ctx.property("nope"), None);
    }
}
