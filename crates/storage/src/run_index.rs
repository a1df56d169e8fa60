#![forbid(unsafe_code)]

//! Atomic per-job allocation of planned runs to nodes.
//!
//! Every claim is one `find_and_modify` on the job document that matches the
//! first qualifying element of `active_runs`. The update cannot report which
//! element it touched, so each claim stamps a fresh `guid` into the element
//! and the caller locates the entry by that guid in the returned document.

use crate::error::StoreError;
use crate::metadata::{
    ActiveRunEntry, COLLECTION_JOBS, ElemCond, ElemMatch, FindAndModify, JobDoc, MetadataStore,
};
use crate::retry::RetryPolicy;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::sync::Arc;
use xt_core::ids::{NodeId, child_run_name, run_name_from_seq};
use xt_core::status::{ActiveRunStatus, Schedule};

const ACTIVE_RUNS: &str = "active_runs";

/// Initial `active_runs` for a job: round-robin node ids for a static
/// schedule, unassigned entries for a dynamic one.
pub fn plan_active_runs(
    run_count: usize,
    node_count: usize,
    schedule: Schedule,
) -> Vec<ActiveRunEntry> {
    (0..run_count)
        .map(|run_index| ActiveRunEntry {
            run_index,
            run_name: None,
            node_id: match schedule {
                Schedule::Static => Some(NodeId::from_index(run_index % node_count.max(1))),
                Schedule::Dynamic => None,
            },
            status: ActiveRunStatus::Unstarted,
            guid: None,
        })
        .collect()
}

#[derive(Clone)]
pub struct RunIndex {
    store: Arc<dyn MetadataStore>,
    retry: RetryPolicy,
}

impl RunIndex {
    pub fn new(store: Arc<dyn MetadataStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    fn job(&self, job_id: &str) -> Result<JobDoc, StoreError> {
        self.retry
            .run("get_job", || self.store.get_job(job_id))?
            .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))
    }

    fn claim(
        &self,
        job_id: &str,
        elem_match: ElemMatch,
        set_elem: JsonMap<String, JsonValue>,
    ) -> Result<Option<JobDoc>, StoreError> {
        let request = FindAndModify {
            collection: COLLECTION_JOBS.to_string(),
            key: job_id.to_string(),
            elem_match: Some(elem_match),
            set_elem,
            set_doc: JsonMap::new(),
            return_new: true,
            upsert: false,
        };
        let doc = self
            .retry
            .run("find_and_modify", || self.store.find_and_modify(&request))?;
        doc.map(|d| serde_json::from_value(d).map_err(StoreError::from))
            .transpose()
    }

    /// Move this node's in-flight entries to `waiting_for_restart`.
    ///
    /// Each update touches one element, so this loops until nothing matches.
    /// Returns the number of entries moved.
    pub fn restart_session(&self, job_id: &str, node_id: &NodeId) -> Result<usize, StoreError> {
        let mut moved = 0;
        loop {
            let elem_match = ElemMatch::new(ACTIVE_RUNS)
                .with("node_id", ElemCond::Eq(json!(node_id.to_string())))
                .with(
                    "status",
                    ElemCond::In(vec![
                        json!(ActiveRunStatus::Started.as_str()),
                        json!(ActiveRunStatus::Restarted.as_str()),
                    ]),
                );
            let mut set = JsonMap::new();
            set.insert(
                "status".to_string(),
                json!(ActiveRunStatus::WaitingForRestart.as_str()),
            );
            if self.claim(job_id, elem_match, set)?.is_none() {
                break;
            }
            moved += 1;
        }
        tracing::info!(job_id, node_id = %node_id, moved, "restart sweep finished");
        Ok(moved)
    }

    /// Hand the node its next entry: a restart candidate first, otherwise a
    /// fresh unstarted entry. `None` means the node has no more work.
    pub fn next_child_run(
        &self,
        job_id: &str,
        node_id: &NodeId,
    ) -> Result<Option<ActiveRunEntry>, StoreError> {
        let job = self.job(job_id)?;
        let node = json!(node_id.to_string());
        let pinned = job.schedule == Schedule::Static;

        // restart candidates
        let guid = new_guid();
        let mut elem_match = ElemMatch::new(ACTIVE_RUNS).with(
            "status",
            ElemCond::Eq(json!(ActiveRunStatus::WaitingForRestart.as_str())),
        );
        if pinned {
            elem_match = elem_match.with("node_id", ElemCond::Eq(node.clone()));
        }
        let mut set = JsonMap::new();
        set.insert("status".to_string(), json!(ActiveRunStatus::Restarted.as_str()));
        set.insert("guid".to_string(), json!(guid));
        if !pinned {
            set.insert("node_id".to_string(), node.clone());
        }
        if let Some(doc) = self.claim(job_id, elem_match, set)? {
            let entry = located(&doc, &guid)?;
            tracing::info!(job_id, node_id = %node_id, run_index = entry.run_index, "restarted entry claimed");
            return Ok(Some(entry));
        }

        // fresh entries
        let run_name = self.allocate_run_name(&job, node_id)?;
        let guid = new_guid();
        let mut elem_match = ElemMatch::new(ACTIVE_RUNS).with(
            "status",
            ElemCond::Eq(json!(ActiveRunStatus::Unstarted.as_str())),
        );
        if pinned {
            elem_match = elem_match.with("node_id", ElemCond::Eq(node.clone()));
        }
        let mut set = JsonMap::new();
        set.insert("status".to_string(), json!(ActiveRunStatus::Started.as_str()));
        set.insert("guid".to_string(), json!(guid));
        set.insert("run_name".to_string(), json!(run_name));
        if !pinned {
            set.insert("node_id".to_string(), node);
        }
        match self.claim(job_id, elem_match, set)? {
            Some(doc) => {
                let entry = located(&doc, &guid)?;
                tracing::info!(job_id, node_id = %node_id, run_index = entry.run_index, run_name = %run_name, "entry claimed");
                Ok(Some(entry))
            }
            None => {
                tracing::debug!(job_id, node_id = %node_id, "no remaining entries");
                Ok(None)
            }
        }
    }

    fn allocate_run_name(&self, job: &JobDoc, node_id: &NodeId) -> Result<String, StoreError> {
        match job.parent_by_node.get(&node_id.to_string()) {
            Some(parent) => {
                let seq = self
                    .retry
                    .run("next_child_id", || self.store.next_child_id(&job.ws, parent))?;
                Ok(child_run_name(parent, seq))
            }
            None => {
                let seq = self
                    .retry
                    .run("next_run_id", || self.store.next_run_id(&job.ws))?;
                Ok(run_name_from_seq(seq))
            }
        }
    }

    /// Record that the entry's run finished. Completing an entry twice, or one
    /// that is not in flight, is an invariant violation.
    pub fn mark_completed(&self, job_id: &str, entry: &ActiveRunEntry) -> Result<(), StoreError> {
        let job = self.job(job_id)?;
        let current = job.entry(entry.run_index).ok_or_else(|| {
            StoreError::Invariant(format!(
                "{job_id} has no active-run entry {}",
                entry.run_index
            ))
        })?;
        if !current.status.can_transition_to(ActiveRunStatus::Completed) {
            return Err(StoreError::Invariant(format!(
                "{job_id} entry {} cannot complete from {}",
                entry.run_index,
                current.status.as_str()
            )));
        }

        let elem_match = ElemMatch::new(ACTIVE_RUNS)
            .with("run_index", ElemCond::Eq(json!(entry.run_index)))
            .with(
                "status",
                ElemCond::In(vec![
                    json!(ActiveRunStatus::Started.as_str()),
                    json!(ActiveRunStatus::Restarted.as_str()),
                ]),
            );
        let mut set = JsonMap::new();
        set.insert("status".to_string(), json!(ActiveRunStatus::Completed.as_str()));
        if self.claim(job_id, elem_match, set)?.is_none() {
            return Err(StoreError::Invariant(format!(
                "{job_id} entry {} changed state while completing",
                entry.run_index
            )));
        }
        tracing::debug!(job_id, run_index = entry.run_index, "entry completed");
        Ok(())
    }

    /// Register the search parent run whose children this node allocates.
    pub fn set_node_parent(
        &self,
        job_id: &str,
        node_id: &NodeId,
        parent_run: &str,
    ) -> Result<(), StoreError> {
        let mut set = JsonMap::new();
        set.insert(format!("parent_by_node.{node_id}"), json!(parent_run));
        self.retry
            .run("update_job", || self.store.update_job(job_id, &set))
    }
}

fn new_guid() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn located(doc: &JobDoc, guid: &str) -> Result<ActiveRunEntry, StoreError> {
    doc.entry_by_guid(guid).cloned().ok_or_else(|| {
        StoreError::Invariant(format!(
            "{}: updated active-run entry not found by guid",
            doc.job_id
        ))
    })
}
