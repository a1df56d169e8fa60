#![forbid(unsafe_code)]

use super::framing::{TransportMode, parse_request, write_frame};
use super::server::SharedWriter;
use super::{CONSOLE_NOTIFICATION, json_rpc_error, json_rpc_notification, json_rpc_response};
use crate::controller::NodeController;
use crate::error::ControllerError;
use serde_json::{Map as JsonMap, Value, json};
use std::sync::Arc;
use std::time::Duration;
use xt_core::context::RunContext;
use xt_core::status::Stage;

/// Per-connection dispatcher. Remembers the console callbacks it registered
/// so they can be dropped when the peer goes away.
pub(crate) struct Session {
    controller: Arc<NodeController>,
    writer: SharedWriter,
    mode: TransportMode,
    callbacks: Vec<String>,
}

impl Session {
    pub(crate) fn new(controller: Arc<NodeController>, writer: SharedWriter, mode: TransportMode) -> Self {
        Self {
            controller,
            writer,
            mode,
            callbacks: Vec::new(),
        }
    }

    /// Returns the response to write, or `None` for notifications.
    pub(crate) fn handle_frame(&mut self, body: &[u8]) -> Option<Value> {
        let request = match parse_request(body) {
            Ok(request) => request,
            Err(err) => return Some(err),
        };
        let id = request.id.filter(|id| !id.is_null());
        let params = match request.params {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => JsonMap::new(),
            Some(_) => {
                return id.map(|id| json_rpc_error(Some(id), -32602, "params must be an object"));
            }
        };
        let result = self.dispatch(&request.method, &params);
        if let Err(err) = &result {
            tracing::debug!(method = %request.method, error = %err, "rpc call failed");
        }
        let id = id?;
        Some(match result {
            Ok(value) => json_rpc_response(Some(id), value),
            Err(err) => json_rpc_error(Some(id), err.rpc_code(), &err.to_string()),
        })
    }

    pub(crate) fn close(&mut self) {
        for id in self.callbacks.drain(..) {
            self.controller.detach_everywhere(&id);
        }
    }

    fn dispatch(&mut self, method: &str, params: &JsonMap<String, Value>) -> Result<Value, ControllerError> {
        let token = params.get("token").and_then(Value::as_str).unwrap_or_default();
        if token != self.controller.config().box_secret {
            return Err(ControllerError::Unauthorized);
        }
        let controller = &self.controller;
        match method {
            "queue_job" => {
                let context: RunContext = serde_json::from_value(
                    params
                        .get("context")
                        .cloned()
                        .ok_or_else(|| missing("context"))?,
                )
                .map_err(|e| ControllerError::Config(format!("bad context: {e}")))?;
                let cmd_parts = string_list(params, "cmd_parts")?.unwrap_or_default();
                let run_name = controller.queue_job(context, cmd_parts)?;
                Ok(json!({ "run_name": run_name }))
            }
            "attach" => self.attach(params),
            "detach" => {
                let ws = required_str(params, "ws")?;
                let run_name = required_str(params, "run_name")?;
                let callback_id = required_str(params, "callback_id")?;
                let detached = controller.detach(ws, run_name, callback_id);
                self.callbacks.retain(|id| id != callback_id);
                Ok(json!({ "detached": detached }))
            }
            "get_status_of_runs" => {
                let ws = required_str(params, "ws")?;
                let run_names = string_list(params, "run_names")?.unwrap_or_default();
                Ok(json!(controller.get_status_of_runs(ws, &run_names)))
            }
            "get_runs" => {
                let stage = optional_str(params, "stage")
                    .map(|s| {
                        serde_json::from_value::<Stage>(json!(s))
                            .map_err(|_| ControllerError::Config(format!("unknown stage: {s}")))
                    })
                    .transpose()?;
                let runs = controller.get_runs(
                    stage,
                    optional_str(params, "ws"),
                    optional_str(params, "run_name"),
                );
                Ok(json!(runs))
            }
            "cancel_run" => {
                let names = match params.get("run_names") {
                    Some(Value::String(s)) if s == "all" => None,
                    Some(Value::String(s)) => {
                        return Err(ControllerError::Config(format!(
                            "run_names must be a list or \"all\", got {s:?}"
                        )));
                    }
                    None | Some(Value::Null) => return Err(missing("run_names")),
                    Some(_) => string_list(params, "run_names")?,
                };
                let outcomes = controller.cancel_run(optional_str(params, "ws"), names.as_deref());
                Ok(json!(outcomes))
            }
            "cancel_runs_by_property" => {
                let name = required_str(params, "name")?;
                let value = match params.get("value") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) if !other.is_null() => other.to_string(),
                    _ => return Err(missing("value")),
                };
                Ok(json!(controller.cancel_runs_by_property(name, &value)))
            }
            "restart_controller" => {
                let delay_s = params.get("delay_s").and_then(Value::as_f64).unwrap_or(0.0);
                if !delay_s.is_finite() || delay_s < 0.0 {
                    return Err(ControllerError::Config(format!("bad delay_s: {delay_s}")));
                }
                let killed = controller.restart_controller(Duration::from_secs_f64(delay_s));
                Ok(json!({ "killed": killed }))
            }
            "shutdown" => {
                controller.shutdown();
                Ok(json!({ "ok": true }))
            }
            "set_concurrent" => {
                let value = params
                    .get("value")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| missing("value"))?;
                controller.set_concurrent(value)?;
                Ok(json!({ "concurrent": value }))
            }
            "get_concurrent" => Ok(json!({ "concurrent": controller.get_concurrent() })),
            other => Err(ControllerError::Rpc {
                code: -32601,
                message: format!("method not found: {other}"),
            }),
        }
    }

    fn attach(&mut self, params: &JsonMap<String, Value>) -> Result<Value, ControllerError> {
        let ws = required_str(params, "ws")?.to_string();
        let run_name = required_str(params, "run_name")?.to_string();
        let callback_id = uuid::Uuid::new_v4().to_string();

        let writer = Arc::clone(&self.writer);
        let mode = self.mode;
        let note_ws = ws.clone();
        let note_run = run_name.clone();
        let note_id = callback_id.clone();
        let callback = Arc::new(move |line: &str| {
            let note = json_rpc_notification(
                CONSOLE_NOTIFICATION,
                json!({ "ws": note_ws, "run_name": note_run, "callback_id": note_id, "line": line }),
            );
            write_frame(&mut *writer.lock(), mode, &note).is_ok()
        });
        let info = self.controller.attach(&ws, &run_name, &callback_id, callback)?;
        self.callbacks.push(callback_id.clone());
        Ok(json!({
            "callback_id": callback_id,
            "status": info.status,
            "recent": info.recent,
        }))
    }
}

fn missing(name: &str) -> ControllerError {
    ControllerError::Config(format!("missing param: {name}"))
}

fn required_str<'a>(params: &'a JsonMap<String, Value>, name: &str) -> Result<&'a str, ControllerError> {
    optional_str(params, name).ok_or_else(|| missing(name))
}

fn optional_str<'a>(params: &'a JsonMap<String, Value>, name: &str) -> Option<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn string_list(params: &JsonMap<String, Value>, name: &str) -> Result<Option<Vec<String>>, ControllerError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ControllerError::Config(format!("{name} must be a list of strings")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(ControllerError::Config(format!("{name} must be a list of strings"))),
    }
}
