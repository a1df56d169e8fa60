#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use xt_core::rollup::metric_as_f64;

/// One completed run as seen by adaptive search.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub run_name: String,
    pub end_id: i64,
    #[serde(default)]
    pub hparams: JsonMap<String, JsonValue>,
    #[serde(default)]
    pub metrics: JsonMap<String, JsonValue>,
}

impl HistoryRecord {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).and_then(metric_as_f64)
    }
}

/// Completed-run history, fetched incrementally by `end_id`.
#[derive(Clone, Debug, Default)]
pub struct HistoryCache {
    records: Vec<HistoryRecord>,
    max_end_id: i64,
}

impl HistoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_end_id(&self) -> i64 {
        self.max_end_id
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    /// Ask `fetch` for records newer than the cached maximum and append them.
    pub fn refresh<E>(
        &mut self,
        fetch: impl FnOnce(i64) -> Result<Vec<HistoryRecord>, E>,
    ) -> Result<&[HistoryRecord], E> {
        let fresh = fetch(self.max_end_id)?;
        for record in fresh {
            if record.end_id <= self.max_end_id {
                continue;
            }
            self.max_end_id = record.end_id;
            self.records.push(record);
        }
        Ok(&self.records)
    }
}
