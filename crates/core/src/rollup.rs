#![forbid(unsafe_code)]

//! Deterministic summaries of a run's log events.

use crate::events::{EV_HPARAMS, EV_METRICS, LogEvent};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Numeric view of a metric value; numeric strings are coerced, everything
/// else (including NaN) is ignored.
pub fn metric_as_f64(value: &JsonValue) -> Option<f64> {
    let v = match value {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if v.is_nan() { None } else { Some(v) }
}

/// Merge every `hparams` event, last writer wins.
pub fn rollup_hparams(events: &[LogEvent]) -> JsonMap<String, JsonValue> {
    let mut merged = JsonMap::new();
    for event in events.iter().filter(|e| e.is(EV_HPARAMS)) {
        for (k, v) in &event.data {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricsRollupOptions<'a> {
    pub primary_metric: Option<&'a str>,
    pub maximize: bool,
    pub report_rollup: bool,
}

/// Pick the representative `metrics` event of a run.
///
/// With `report_rollup`, the event holding the best primary-metric value wins
/// (first one on ties). Without it, or when no event carries a usable value,
/// the last `metrics` event is used.
pub fn rollup_metrics(
    events: &[LogEvent],
    opts: &MetricsRollupOptions<'_>,
) -> Option<JsonMap<String, JsonValue>> {
    let metrics = events
        .iter()
        .filter(|e| e.is(EV_METRICS))
        .collect::<Vec<_>>();
    let last = metrics.last().map(|e| e.data.clone());

    if !opts.report_rollup {
        return last;
    }
    let Some(primary) = opts.primary_metric else {
        return last;
    };

    let mut best: Option<(f64, &LogEvent)> = None;
    for event in metrics.iter().copied() {
        let Some(value) = event.data.get(primary).and_then(metric_as_f64) else {
            continue;
        };
        let better = match best {
            None => true,
            Some((current, _)) if opts.maximize => value > current,
            Some((current, _)) => value < current,
        };
        if better {
            best = Some((value, event));
        }
    }

    best.map(|(_, e)| e.data.clone()).or(last)
}
