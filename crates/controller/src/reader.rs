#![forbid(unsafe_code)]

use crate::controller::NodeController;
use crate::run::Run;
use serde_json::Value as JsonValue;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::Arc;
use xt_core::events::{EV_EARLY_STOPPING, EV_HPARAMS, EV_METRICS, LogEvent};

/// Prefix of console lines the training process uses to report events.
pub const CONSOLE_EVENT_PREFIX: &str = "xt:";

/// `xt:metrics {"loss": 0.3}` and friends. Only `hparams`, `metrics` and
/// `early_stopping` with an object payload are accepted.
pub fn parse_console_event(line: &str) -> Option<LogEvent> {
    let rest = line.trim_start().strip_prefix(CONSOLE_EVENT_PREFIX)?;
    let (name, payload) = rest.split_once(char::is_whitespace)?;
    if ![EV_HPARAMS, EV_METRICS, EV_EARLY_STOPPING].contains(&name) {
        return None;
    }
    match serde_json::from_str::<JsonValue>(payload.trim()).ok()? {
        JsonValue::Object(map) => Some(LogEvent::new(name, map)),
        _ => None,
    }
}

impl NodeController {
    /// Tail a child's merged stdout/stderr until EOF (or until the run is
    /// being killed), then reap the process and wrap the run up.
    pub(crate) fn read_console(&self, run: &Arc<Run>, pipe: impl Read, mut console: File) {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        let mut lines = 0usize;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::warn!(run_name = %run.run_name, error = %err, "console read failed");
                    break;
                }
            }
            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches(['\r', '\n']);
            lines += 1;
            if let Err(err) = writeln!(console, "{line}") {
                tracing::debug!(run_name = %run.run_name, error = %err, "console write failed");
            }
            if run.context.log
                && let Some(event) = parse_console_event(line)
            {
                self.log_event(run, event);
            }
            if run.push_line(line) {
                break;
            }
        }
        if let Err(err) = console.flush() {
            tracing::debug!(run_name = %run.run_name, error = %err, "console flush failed");
        }

        let child = run.state.lock().process.take();
        let exit_code = child
            .and_then(|mut child| child.wait().ok())
            .map(|status| status.code().unwrap_or(-1));
        tracing::info!(run_name = %run.run_name, lines, exit_code, "run process exited");
        self.wrapup(run, exit_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_event_lines() {
        let event = parse_console_event(r#"xt:metrics {"step": 3, "loss": 0.25}"#).expect("metrics");
        assert!(event.is(EV_METRICS));
        assert_eq!(event.data.get("step"), Some(&serde_json::json!(3)));

        assert!(parse_console_event(r#"  xt:hparams {"lr": 0.1}"#).is_some());
        assert!(parse_console_event("xt:metrics [1, 2]").is_none());
        assert!(parse_console_event(r#"xt:ended {"status": "x"}"#).is_none());
        assert!(parse_console_event("epoch 3 loss 0.2").is_none());
        assert!(parse_console_event("xt:metrics").is_none());
    }
}
