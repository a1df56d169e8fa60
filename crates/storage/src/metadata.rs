#![forbid(unsafe_code)]

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;
use xt_core::events::LogEvent;
use xt_core::ids::NodeId;
use xt_core::status::{ActiveRunStatus, JobStatus, RunStatus, Schedule};

pub const COLLECTION_JOBS: &str = "jobs";

/// One planned run of a job, as stored in the job document's `active_runs`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveRunEntry {
    pub run_index: usize,
    #[serde(default)]
    pub run_name: Option<String>,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    pub status: ActiveRunStatus,
    #[serde(default)]
    pub guid: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobDoc {
    pub job_id: String,
    pub ws: String,
    #[serde(default)]
    pub exper_name: String,
    #[serde(default)]
    pub username: String,
    pub schedule: Schedule,
    pub run_count: usize,
    pub node_count: usize,
    #[serde(default)]
    pub primary_metric: Option<String>,
    #[serde(default)]
    pub maximize_metric: bool,
    #[serde(default)]
    pub search_type: Option<String>,
    #[serde(default)]
    pub hp_config: Option<String>,
    #[serde(default)]
    pub service_info_by_node: BTreeMap<String, JsonValue>,
    /// Search parent run per node; children are named `<parent>.<n>`.
    #[serde(default)]
    pub parent_by_node: BTreeMap<String, String>,
    #[serde(default)]
    pub running_nodes: i64,
    #[serde(default)]
    pub running_runs: i64,
    #[serde(default)]
    pub completed_runs: i64,
    #[serde(default)]
    pub error_runs: i64,
    #[serde(default)]
    pub job_status: JobStatus,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub active_runs: Vec<ActiveRunEntry>,
}

impl JobDoc {
    pub fn entry(&self, run_index: usize) -> Option<&ActiveRunEntry> {
        self.active_runs.iter().find(|e| e.run_index == run_index)
    }

    pub fn entry_by_guid(&self, guid: &str) -> Option<&ActiveRunEntry> {
        self.active_runs
            .iter()
            .find(|e| e.guid.as_deref() == Some(guid))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub ws: String,
    pub run_name: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub run_index: Option<usize>,
    #[serde(default)]
    pub parent_run: Option<String>,
    #[serde(default)]
    pub is_parent: bool,
    #[serde(default)]
    pub exper_name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub search_type: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub restarts: u32,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub create_ms: i64,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub start_ms: Option<i64>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub end_ms: Option<i64>,
    #[serde(default)]
    pub queue_duration_s: Option<f64>,
    #[serde(default)]
    pub run_duration_s: Option<f64>,
    #[serde(default)]
    pub hparams: JsonMap<String, JsonValue>,
    #[serde(default)]
    pub metrics: JsonMap<String, JsonValue>,
    #[serde(default)]
    pub end_id: Option<i64>,
    /// Metric names in the order they were first reported.
    #[serde(default)]
    pub metric_names: Vec<String>,
}

impl RunRecord {
    pub fn new(ws: impl Into<String>, run_name: impl Into<String>) -> Self {
        let create_ms = xt_core::time::now_ms();
        Self {
            ws: ws.into(),
            run_name: run_name.into(),
            job_id: None,
            node_id: None,
            run_index: None,
            parent_run: None,
            is_parent: false,
            exper_name: String::new(),
            username: String::new(),
            search_type: None,
            status: RunStatus::Created,
            exit_code: None,
            restarts: 0,
            create_time: xt_core::time::ts_ms_to_rfc3339(create_ms),
            create_ms,
            start_time: None,
            start_ms: None,
            end_time: None,
            end_ms: None,
            queue_duration_s: None,
            run_duration_s: None,
            hparams: JsonMap::new(),
            metrics: JsonMap::new(),
            end_id: None,
            metric_names: Vec::new(),
        }
    }
}

/// Terminal values written by `update_run_at_end`.
#[derive(Clone, Debug, PartialEq)]
pub struct RunEnd {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub restarts: u32,
    pub end_ms: i64,
    pub hparams: JsonMap<String, JsonValue>,
    pub metrics: JsonMap<String, JsonValue>,
}

/// Condition on one field of an array element.
#[derive(Clone, Debug, PartialEq)]
pub enum ElemCond {
    Eq(JsonValue),
    In(Vec<JsonValue>),
}

impl ElemCond {
    pub fn matches(&self, value: Option<&JsonValue>) -> bool {
        let value = value.unwrap_or(&JsonValue::Null);
        match self {
            Self::Eq(want) => value == want,
            Self::In(options) => options.iter().any(|o| o == value),
        }
    }
}

/// Positional match on an array field of a document: the first element
/// satisfying every condition is the one the update touches.
#[derive(Clone, Debug, PartialEq)]
pub struct ElemMatch {
    pub array: String,
    pub conds: Vec<(String, ElemCond)>,
}

impl ElemMatch {
    pub fn new(array: impl Into<String>) -> Self {
        Self {
            array: array.into(),
            conds: Vec::new(),
        }
    }

    pub fn with(mut self, field: impl Into<String>, cond: ElemCond) -> Self {
        self.conds.push((field.into(), cond));
        self
    }

    pub fn matches(&self, element: &JsonValue) -> bool {
        self.conds
            .iter()
            .all(|(field, cond)| cond.matches(element.get(field)))
    }
}

/// Atomic read-modify-write of one document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FindAndModify {
    pub collection: String,
    pub key: String,
    pub elem_match: Option<ElemMatch>,
    /// Fields set on the matched array element.
    pub set_elem: JsonMap<String, JsonValue>,
    /// Fields set on the document itself; keys may be dotted paths.
    pub set_doc: JsonMap<String, JsonValue>,
    pub return_new: bool,
    pub upsert: bool,
}

/// Contract the controllers share with the metadata database.
///
/// Every method is a single atomic unit against the store. Callers that need
/// retry wrap calls in a [`crate::RetryPolicy`].
pub trait MetadataStore: Send + Sync {
    fn next_job_id(&self) -> Result<i64, StoreError>;
    fn next_run_id(&self, ws: &str) -> Result<i64, StoreError>;
    fn next_child_id(&self, ws: &str, parent: &str) -> Result<i64, StoreError>;
    fn next_end_id(&self, ws: &str) -> Result<i64, StoreError>;

    fn find_and_modify(&self, request: &FindAndModify) -> Result<Option<JsonValue>, StoreError>;
    fn get_document(&self, collection: &str, key: &str) -> Result<Option<JsonValue>, StoreError>;

    fn create_job(&self, job: &JobDoc) -> Result<(), StoreError>;
    fn get_job(&self, job_id: &str) -> Result<Option<JobDoc>, StoreError>;
    fn update_job(&self, job_id: &str, set_doc: &JsonMap<String, JsonValue>)
    -> Result<(), StoreError>;
    fn job_run_start(&self, job_id: &str) -> Result<(), StoreError>;
    fn job_run_exit(&self, job_id: &str, exit_code: i32) -> Result<(), StoreError>;
    fn job_node_start(&self, job_id: &str) -> Result<(), StoreError>;
    /// Returns the job status after the decrement.
    fn job_node_exit(&self, job_id: &str) -> Result<JobStatus, StoreError>;

    fn create_run(&self, run: &RunRecord) -> Result<(), StoreError>;
    fn get_run(&self, ws: &str, run_name: &str) -> Result<Option<RunRecord>, StoreError>;
    fn update_run(
        &self,
        ws: &str,
        run_name: &str,
        set_doc: &JsonMap<String, JsonValue>,
    ) -> Result<(), StoreError>;
    fn add_run_event(&self, ws: &str, run_name: &str, event: &LogEvent)
    -> Result<(), StoreError>;
    fn run_events(&self, ws: &str, run_name: &str) -> Result<Vec<LogEvent>, StoreError>;
    /// Writes the terminal fields and returns the newly allocated `end_id`.
    fn update_run_at_end(&self, ws: &str, run_name: &str, end: &RunEnd)
    -> Result<i64, StoreError>;
    fn run_start(&self, ws: &str, run_name: &str) -> Result<(), StoreError>;
    fn run_exit(&self, ws: &str, run_name: &str) -> Result<(), StoreError>;
    /// Completed runs of a job with `end_id > min_end_id`, ordered by `end_id`.
    fn completed_runs(
        &self,
        ws: &str,
        job_id: &str,
        min_end_id: i64,
    ) -> Result<Vec<RunRecord>, StoreError>;
}
