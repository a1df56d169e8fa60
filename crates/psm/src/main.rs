#![forbid(unsafe_code)]

use xt_psm::{PsmConfig, PsmDaemon, PsmQueue, ProcScanProbe, ShellLauncher};

fn usage() -> &'static str {
    "xt-psm: per-box queue that runs one node controller at a time\n\n\
USAGE:\n\
  xt-psm [--xt-dir DIR] [--poll-ms MS] [--controller-script NAME]\n\
         [--controller-bin NAME] [--once]\n\
  xt-psm --list [--xt-dir DIR]\n\
  xt-psm --cancel PACKET [--xt-dir DIR]\n\
  xt-psm --cancel-running [--xt-dir DIR]\n\n\
NOTES:\n\
  - Packets are read from <xt-dir>/psm_queue, oldest ticks first.\n\
  - Controller output goes to <xt-dir>/psm_logs/<packet>.log.\n\
  - Logging: XT_LOG=<filter> (default info), XT_LOG_JSONL=1 for JSON lines.\n"
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", usage());
        return Ok(());
    }
    if args.iter().any(|a| a == "-V" || a == "--version") {
        println!("xt-psm {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let cfg = PsmConfig::from_args(&args).unwrap_or_else(|e| {
        eprintln!("{e}");
        std::process::exit(2);
    });
    xt_psm::logging::init();

    if args.iter().any(|a| a == "--list") {
        let queue = PsmQueue::open(cfg.queue_dir())?;
        for entry in queue.list()? {
            println!("{}", serde_json::to_string(&entry)?);
        }
        return Ok(());
    }
    if let Some(packet) = flag_value(&args, "--cancel") {
        let queue = PsmQueue::open(cfg.queue_dir())?;
        if !queue.cancel_queued(packet)? {
            eprintln!("not queued: {packet}");
            std::process::exit(1);
        }
        return Ok(());
    }
    if args.iter().any(|a| a == "--cancel-running") {
        match xt_psm::cancel_running(&cfg)? {
            Some(packet) => println!("{packet}"),
            None => eprintln!("no controller running"),
        }
        return Ok(());
    }

    let mut daemon = PsmDaemon::new(cfg, ProcScanProbe, ShellLauncher::new())?;
    daemon.run();
    Ok(())
}
