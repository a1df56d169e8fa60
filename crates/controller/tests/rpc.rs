#![forbid(unsafe_code)]
#![cfg(unix)]

mod support;

use serde_json::json;
use std::time::{Duration, Instant};
use support::*;
use xt_controller::{ControllerError, RpcClient, RpcServer};
use xt_core::status::RunStatus;

fn serve(h: &Harness) -> RpcServer {
    RpcServer::start(h.controller.clone(), "127.0.0.1:0").expect("rpc server")
}

#[test]
fn wrong_token_is_a_service_error() {
    let h = Harness::new("rpc_token");
    let server = serve(&h);
    let mut client = RpcClient::connect(server.local_addr(), "not-the-secret").expect("connect");
    let err = client
        .call("get_concurrent", json!({}))
        .expect_err("token must be checked");
    match err {
        ControllerError::Rpc { code, message } => {
            assert_eq!(code, -32001);
            assert!(message.contains("invalid token"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    server.stop();
}

#[test]
fn concurrency_is_adjustable_live() {
    let h = Harness::new("rpc_concurrency");
    let server = serve(&h);
    let mut client = RpcClient::connect(server.local_addr(), SECRET).expect("connect");

    let got = client.call("get_concurrent", json!({})).expect("get");
    assert_eq!(got["concurrent"], 1);
    client
        .call("set_concurrent", json!({ "value": 4 }))
        .expect("set");
    assert_eq!(h.controller.get_concurrent(), 4);
    client
        .call("set_concurrent", json!({ "value": -1 }))
        .expect("unlimited");

    let err = client
        .call("set_concurrent", json!({ "value": 0 }))
        .expect_err("zero is rejected");
    assert!(matches!(err, ControllerError::Rpc { code: -32602, .. }));

    let err = client.call("no_such_method", json!({})).expect_err("unknown");
    assert!(matches!(err, ControllerError::Rpc { code: -32601, .. }));
    server.stop();
}

#[test]
fn queued_run_streams_console_lines_to_attached_clients() {
    let mut h = Harness::new("rpc_attach");
    let server = serve(&h);
    let mut client = RpcClient::connect(server.local_addr(), SECRET).expect("connect");

    let context = run_context("run30", "", &["sh", "-c", "echo first line; echo second line"]);
    let queued = client
        .call("queue_job", json!({ "context": context, "cmd_parts": [] }))
        .expect("queue_job");
    assert_eq!(queued["run_name"], "run30");

    let attached = client
        .call("attach", json!({ "ws": WS, "run_name": "run30" }))
        .expect("attach");
    assert_eq!(attached["status"], "queued");
    let callback_id = attached["callback_id"].as_str().expect("callback id").to_string();

    h.start();
    let mut lines = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(20);
    while lines.len() < 2 && Instant::now() < deadline {
        if let Some(note) = client
            .next_notification(Duration::from_millis(200))
            .expect("notification")
        {
            assert_eq!(note["run_name"], "run30");
            lines.push(note["line"].as_str().unwrap_or_default().to_string());
        }
    }
    assert_eq!(lines, vec!["first line".to_string(), "second line".to_string()]);

    assert!(h.wait_for_status("run30", RunStatus::Completed));
    let statuses = client
        .call(
            "get_status_of_runs",
            json!({ "ws": WS, "run_names": ["run30", "run404"] }),
        )
        .expect("statuses");
    assert_eq!(statuses["run30"], "completed");
    assert_eq!(statuses["run404"], "unknown");

    let runs = client
        .call("get_runs", json!({ "stage": "completed", "ws": WS }))
        .expect("runs");
    assert_eq!(runs.as_array().map(Vec::len), Some(1));

    let detached = client
        .call(
            "detach",
            json!({ "ws": WS, "run_name": "run30", "callback_id": callback_id }),
        )
        .expect("detach");
    assert_eq!(detached["detached"], true);
    server.stop();
}

#[test]
fn cancel_all_and_shutdown_over_rpc() {
    let mut h = Harness::new("rpc_cancel");
    let server = serve(&h);
    let mut client = RpcClient::connect(server.local_addr(), SECRET).expect("connect");
    for name in ["run31", "run32"] {
        let context = run_context(name, "", &["sh", "-c", "sleep 30"]);
        client
            .call("queue_job", json!({ "context": context }))
            .expect("queue_job");
    }
    h.start();
    assert!(h.wait_for_live_status("run31", RunStatus::Running));

    let outcomes = client
        .call("cancel_run", json!({ "run_names": "all" }))
        .expect("cancel");
    assert_eq!(outcomes.as_array().map(Vec::len), Some(2));
    assert!(h.wait_for_status("run31", RunStatus::Cancelled));
    assert!(h.wait_for_status("run32", RunStatus::Cancelled));

    client.call("shutdown", json!({})).expect("shutdown");
    assert!(wait_until(Duration::from_secs(5), || h.controller.is_shutting_down()));
    server.stop();
}

#[test]
fn cancel_run_needs_names_or_all() {
    let mut h = Harness::new("rpc_cancel_params");
    let server = serve(&h);
    let mut client = RpcClient::connect(server.local_addr(), SECRET).expect("connect");
    let context = run_context("run33", "", &["sh", "-c", "sleep 30"]);
    client
        .call("queue_job", json!({ "context": context }))
        .expect("queue_job");
    h.start();
    assert!(h.wait_for_live_status("run33", RunStatus::Running));

    for params in [json!({}), json!({ "run_names": null }), json!({ "run_names": "run33" })] {
        let err = client
            .call("cancel_run", params.clone())
            .expect_err("ambiguous cancel is rejected");
        assert!(
            matches!(err, ControllerError::Rpc { code: -32602, .. }),
            "{params}: {err}"
        );
    }
    assert_eq!(
        h.controller.find_run(WS, "run33").map(|r| r.status()),
        Some(RunStatus::Running)
    );

    let outcomes = client
        .call("cancel_run", json!({ "run_names": ["run33"] }))
        .expect("cancel by name");
    assert_eq!(outcomes.as_array().map(Vec::len), Some(1));
    assert!(h.wait_for_status("run33", RunStatus::Cancelled));
    server.stop();
}
