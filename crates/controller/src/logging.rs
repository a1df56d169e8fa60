#![forbid(unsafe_code)]

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

const FILTER_ENV: &str = "XT_LOG";
const JSONL_ENV: &str = "XT_LOG_JSONL";

/// Install the process-wide subscriber. Later calls are no-ops.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter = EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    // try_init: a test harness may already own the global subscriber.
    if crate::config::parse_bool_env(JSONL_ENV) {
        let _ = builder.json().with_ansi(false).try_init();
    } else {
        let _ = builder.compact().try_init();
    }
}
