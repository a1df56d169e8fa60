#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub const EV_CREATED: &str = "created";
pub const EV_QUEUED: &str = "queued";
pub const EV_STARTED: &str = "started";
pub const EV_RESTARTED: &str = "restarted";
pub const EV_CMD: &str = "cmd";
pub const EV_HPARAMS: &str = "hparams";
pub const EV_METRICS: &str = "metrics";
pub const EV_STATUS_CHANGE: &str = "status-change";
pub const EV_ENDED: &str = "ended";
pub const EV_CANCELLED: &str = "cancelled";
pub const EV_CAPTURE_AFTER: &str = "capture_after";
pub const EV_CHILD_CREATED: &str = "child_created";
pub const EV_EARLY_STOPPING: &str = "early_stopping";

/// Append-only record in a run's event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub time: String,
    pub event: String,
    #[serde(default)]
    pub data: JsonMap<String, JsonValue>,
}

impl LogEvent {
    pub fn new(event: impl Into<String>, data: JsonMap<String, JsonValue>) -> Self {
        Self {
            time: crate::time::now_rfc3339(),
            event: event.into(),
            data,
        }
    }

    pub fn from_value(event: impl Into<String>, data: JsonValue) -> Self {
        let data = match data {
            JsonValue::Object(map) => map,
            JsonValue::Null => JsonMap::new(),
            other => {
                let mut map = JsonMap::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::new(event, data)
    }

    pub fn is(&self, event: &str) -> bool {
        self.event == event
    }
}
