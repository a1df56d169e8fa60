#![forbid(unsafe_code)]

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_env("XT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        let jsonl = crate::config::env_var("XT_LOG_JSONL")
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"));
        if jsonl {
            let _ = builder.json().with_ansi(false).try_init();
        } else {
            let _ = builder.compact().try_init();
        }
    });
}
