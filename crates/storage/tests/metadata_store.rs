#![forbid(unsafe_code)]

mod support;
use support::*;

use serde_json::{Map as JsonMap, json};
use xt_core::events::{EV_HPARAMS, EV_METRICS, LogEvent};
use xt_core::status::{JobStatus, RunStatus, Schedule};
use xt_storage::{
    ElemCond, ElemMatch, FindAndModify, MetadataStore, RunEnd, RunRecord, StoreError,
};

fn record(run_name: &str, job_id: &str) -> RunRecord {
    let mut run = RunRecord::new(WS, run_name);
    run.job_id = Some(job_id.to_string());
    run.node_id = Some("node0".to_string());
    run
}

fn end(status: RunStatus, exit_code: i32) -> RunEnd {
    RunEnd {
        status,
        exit_code: Some(exit_code),
        restarts: 0,
        end_ms: xt_core::time::now_ms(),
        hparams: JsonMap::new(),
        metrics: JsonMap::new(),
    }
}

#[test]
fn counters_are_monotonic_per_scope() {
    let dir = temp_dir("counters_are_monotonic_per_scope");
    let store = open_store(&dir);
    assert_eq!(store.next_run_id(WS).expect("run"), 1);
    assert_eq!(store.next_run_id(WS).expect("run"), 2);
    assert_eq!(store.next_run_id("other").expect("run"), 1);
    assert_eq!(store.next_child_id(WS, "run2").expect("child"), 1);
    assert_eq!(store.next_child_id(WS, "run3").expect("child"), 1);
    assert_eq!(store.next_child_id(WS, "run2").expect("child"), 2);
}

#[test]
fn end_ids_strictly_increase_across_runs() {
    let dir = temp_dir("end_ids_strictly_increase_across_runs");
    let store = open_store(&dir);
    let job_id = create_job(&store, 3, 1, Schedule::Static);
    let mut last = 0;
    for i in 1..=3 {
        let name = format!("run{i}");
        store.create_run(&record(&name, &job_id)).expect("create");
        let end_id = store
            .update_run_at_end(WS, &name, &end(RunStatus::Completed, 0))
            .expect("end");
        assert!(end_id > last);
        last = end_id;
    }
    let history = store.completed_runs(WS, &job_id, 1).expect("history");
    let ids = history.iter().filter_map(|r| r.end_id).collect::<Vec<_>>();
    assert_eq!(ids, vec![2, 3]);
}

#[test]
fn running_nodes_reaching_zero_completes_the_job() {
    let dir = temp_dir("running_nodes_reaching_zero_completes_the_job");
    let store = open_store(&dir);
    let job_id = create_job(&store, 2, 2, Schedule::Static);

    store.job_node_start(&job_id).expect("n0");
    store.job_node_start(&job_id).expect("n1");
    let job = store.get_job(&job_id).expect("get").expect("job");
    assert_eq!(job.running_nodes, 2);
    assert_eq!(job.job_status, JobStatus::Running);

    assert_eq!(store.job_node_exit(&job_id).expect("exit"), JobStatus::Running);
    assert_eq!(store.job_node_exit(&job_id).expect("exit"), JobStatus::Completed);
    assert_eq!(store.job_node_exit(&job_id).expect("exit"), JobStatus::Completed);
    let job = store.get_job(&job_id).expect("get").expect("job");
    assert_eq!(job.running_nodes, 0);
}

#[test]
fn job_run_counters_track_errors() {
    let dir = temp_dir("job_run_counters_track_errors");
    let store = open_store(&dir);
    let job_id = create_job(&store, 2, 1, Schedule::Static);
    store.job_run_start(&job_id).expect("start");
    store.job_run_start(&job_id).expect("start");
    store.job_run_exit(&job_id, 0).expect("exit");
    store.job_run_exit(&job_id, 3).expect("exit");
    let job = store.get_job(&job_id).expect("get").expect("job");
    assert_eq!(job.running_runs, 0);
    assert_eq!(job.completed_runs, 2);
    assert_eq!(job.error_runs, 1);
}

#[test]
fn run_lifecycle_and_events() {
    let dir = temp_dir("run_lifecycle_and_events");
    let store = open_store(&dir);
    let job_id = create_job(&store, 1, 1, Schedule::Static);
    store.create_run(&record("run1", &job_id)).expect("create");
    assert!(matches!(
        store.create_run(&record("run1", &job_id)),
        Err(StoreError::RunExists { .. })
    ));

    store.run_start(WS, "run1").expect("start");
    store
        .add_run_event(WS, "run1", &LogEvent::from_value(EV_HPARAMS, json!({ "lr": 0.1 })))
        .expect("hparams");
    store
        .add_run_event(WS, "run1", &LogEvent::from_value(EV_METRICS, json!({ "loss": 1.0, "acc": 0.5 })))
        .expect("metrics");
    store
        .add_run_event(WS, "run1", &LogEvent::from_value(EV_METRICS, json!({ "acc": 0.7, "f1": 0.2 })))
        .expect("metrics");

    let events = store.run_events(WS, "run1").expect("events");
    let kinds = events.iter().map(|e| e.event.as_str()).collect::<Vec<_>>();
    assert_eq!(kinds, [EV_HPARAMS, EV_METRICS, EV_METRICS]);

    let run = store.get_run(WS, "run1").expect("get").expect("run");
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.start_time.is_some());
    assert_eq!(run.metric_names.len(), 3);
    assert_eq!(run.metric_names.last().map(String::as_str), Some("f1"));

    let mut set = JsonMap::new();
    set.insert("exper_name".to_string(), json!("exp9"));
    set.insert("hparams.opt".to_string(), json!("adam"));
    store.update_run(WS, "run1", &set).expect("update");
    let run = store.get_run(WS, "run1").expect("get").expect("run");
    assert_eq!(run.exper_name, "exp9");
    assert_eq!(run.hparams.get("opt"), Some(&json!("adam")));

    assert!(matches!(
        store.update_run(WS, "missing", &set),
        Err(StoreError::UnknownRun { .. })
    ));
}

#[test]
fn find_and_modify_touches_first_matching_element_only() {
    let dir = temp_dir("find_and_modify_touches_first_matching_element_only");
    let store = open_store(&dir);
    let upsert = FindAndModify {
        collection: "things".to_string(),
        key: "k".to_string(),
        set_doc: [(
            "items".to_string(),
            json!([{ "n": 1, "s": "a" }, { "n": 2, "s": "a" }, { "n": 3, "s": "b" }]),
        )]
        .into_iter()
        .collect(),
        return_new: true,
        upsert: true,
        ..Default::default()
    };
    store.find_and_modify(&upsert).expect("upsert").expect("doc");

    let touch = FindAndModify {
        collection: "things".to_string(),
        key: "k".to_string(),
        elem_match: Some(ElemMatch::new("items").with("s", ElemCond::Eq(json!("a")))),
        set_elem: [("s".to_string(), json!("z"))].into_iter().collect(),
        return_new: false,
        ..Default::default()
    };
    let old = store.find_and_modify(&touch).expect("modify").expect("doc");
    assert_eq!(old["items"][0]["s"], json!("a"));

    let doc = store.get_document("things", "k").expect("get").expect("doc");
    assert_eq!(doc["items"][0]["s"], json!("z"));
    assert_eq!(doc["items"][1]["s"], json!("a"));

    store.find_and_modify(&touch).expect("modify").expect("second");
    assert!(store.find_and_modify(&touch).expect("modify").is_none());

    let absent = FindAndModify {
        key: "nope".to_string(),
        ..touch
    };
    assert!(store.find_and_modify(&absent).expect("absent").is_none());
}
