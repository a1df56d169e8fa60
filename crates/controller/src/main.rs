#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;
use xt_controller::{ControllerConfig, NodeController, RpcServer};
use xt_core::FailureKind;
use xt_storage::{FsObjectStore, MetadataStore, ObjectStore, SqliteStore};

fn usage() -> &'static str {
    "xt-controller: run the experiment runs assigned to this node\n\n\
USAGE:\n\
  xt-controller [--xt-dir DIR] [--node-id nodeN] [--job-id JOB] [--workspace WS]\n\
                [--concurrent N] [--hold-open] [--aml] [--report-rollup]\n\
                [--port PORT] [--box-secret SECRET] [--server-cert PEM]\n\
                [--storage-dir DIR] [--store-dir DIR] [--work-dir DIR] [--cwd DIR]\n\
                [--tick-ms MS] [--max-rundirs N]\n\n\
NOTES:\n\
  - Every flag can also be set with its XT_* environment variable.\n\
  - Runs are read from __multi_run_context__.json in --cwd; more can be\n\
    queued over RPC (queue_job).\n\
  - Logging: XT_LOG=<filter> (default info), XT_LOG_JSONL=1 for JSON lines.\n"
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", usage());
        return Ok(());
    }
    if args.iter().any(|a| a == "-V" || a == "--version") {
        println!("xt-controller {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let cfg = ControllerConfig::from_args(&args).unwrap_or_else(|e| {
        eprintln!("{e}");
        std::process::exit(2);
    });
    xt_controller::logging::init();

    let store: Arc<dyn MetadataStore> = Arc::new(SqliteStore::open(&cfg.storage_dir)?);
    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::open(&cfg.store_dir)?);
    let port = cfg.port;
    let controller = NodeController::new(cfg, store, objects)?;
    controller.load_context_file()?;
    let server = RpcServer::start(Arc::clone(&controller), ("0.0.0.0", port))?;

    let outcome = controller.run_loop();
    server.stop();
    if let Err(err) = outcome {
        tracing::error!(error = %err, kind = ?err.kind(), "controller stopped on error");
        controller.cancel_run(None, None);
        controller.wait_for_wrapups(Duration::from_secs(30));
        if err.kind() == FailureKind::InternalInvariant {
            std::thread::sleep(Duration::from_secs(10));
        }
        std::process::exit(1);
    }
    controller.wait_for_wrapups(Duration::from_secs(30));
    tracing::info!("controller exited");
    Ok(())
}
