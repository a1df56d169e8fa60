#![forbid(unsafe_code)]

mod support;

use support::*;
use xt_core::context::{FN_CURRENT_ENTRY, FN_CURRENT_RUNNING_ENTRY};
use xt_psm::{PsmDaemon, StepOutcome};

#[test]
fn packets_launch_one_at_a_time_in_tick_order() {
    let dir = temp_dir("daemon_order");
    let cfg = config(&dir);
    let launcher = FakeLauncher::default();
    let mut daemon = PsmDaemon::new(cfg.clone(), NoProcesses, launcher.clone()).expect("daemon");
    for (run, ticks) in [("run1", 1000), ("run2", 1005), ("run3", 1001)] {
        queue_packet(daemon.queue(), &cfg, &packet_name(run, ticks), Some("echo hi\n"));
    }

    assert!(matches!(daemon.step(), StepOutcome::Launched(name) if name.ticks == 1000));
    assert_eq!(daemon.step(), StepOutcome::Busy { running: 1 });
    assert_eq!(daemon.queue().list().expect("list").len(), 2);

    launcher.finish_all();
    assert!(matches!(daemon.step(), StepOutcome::Launched(name) if name.ticks == 1001));
    launcher.finish_all();
    assert!(matches!(daemon.step(), StepOutcome::Launched(name) if name.ticks == 1005));
    launcher.finish_all();
    assert_eq!(daemon.step(), StepOutcome::Idle { running: 0 });

    assert_eq!(launcher.launched_runs(), vec!["run1", "run3", "run2"]);
    let last = launcher.launched.lock().expect("lock").last().cloned().expect("launch");
    assert_eq!(last.args, vec!["node0".to_string(), "run2".to_string()]);
    assert_eq!(last.cwd, cfg.cwd());
    assert_eq!(last.script, cfg.cwd().join(&cfg.controller_script));
    assert_eq!(last.log_path, cfg.logs_dir().join("xt.job1.run2.node0.1005.log"));

    let marker = std::fs::read_to_string(cfg.cwd().join(FN_CURRENT_RUNNING_ENTRY)).expect("marker");
    assert_eq!(marker, "xt.job1.run2.node0.1005.zip");
    assert!(cfg.cwd().join(FN_CURRENT_ENTRY).is_file());
    assert!(cfg.cwd().join("train.py").is_file());
}

#[test]
fn bad_packets_are_dropped_and_the_queue_moves_on() {
    let dir = temp_dir("daemon_corrupt");
    let cfg = config(&dir);
    let launcher = FakeLauncher::default();
    let mut daemon = PsmDaemon::new(cfg.clone(), NoProcesses, launcher.clone()).expect("daemon");
    let queue = daemon.queue().clone();

    std::fs::write(queue.dir().join("garbage.zip"), b"junk").expect("junk");
    queue
        .enqueue_bytes(b"not a zip archive", &packet_name("run1", 100))
        .expect("corrupt");
    queue_packet(&queue, &cfg, &packet_name("run2", 101), None);
    queue_packet(&queue, &cfg, &packet_name("run3", 102), Some("echo ok\n"));

    let StepOutcome::Failed { packet, .. } = daemon.step() else {
        panic!("corrupt archive should fail");
    };
    assert_eq!(packet, "xt.job1.run1.node0.100.zip");
    assert!(queue.dir().join("garbage.zip.rejected").is_file());

    let StepOutcome::Failed { packet, reason } = daemon.step() else {
        panic!("missing script should fail");
    };
    assert_eq!(packet, "xt.job1.run2.node0.101.zip");
    assert!(reason.contains("controller script"), "{reason}");

    assert!(matches!(daemon.step(), StepOutcome::Launched(name) if name.run_name == "run3"));
    assert!(queue.list().expect("list").is_empty());
    assert_eq!(launcher.launched_runs(), vec!["run3"]);
}

#[cfg(unix)]
mod shell {
    use super::support::*;
    use std::time::Duration;
    use xt_psm::{FN_CURRENT_PID, PsmDaemon, ShellLauncher, cancel_running};

    #[test]
    fn once_mode_runs_the_wrapper_and_captures_its_output() {
        let dir = temp_dir("daemon_shell");
        let mut cfg = config(&dir);
        cfg.once = true;
        let mut daemon = PsmDaemon::new(cfg.clone(), NoProcesses, ShellLauncher::new()).expect("daemon");
        queue_packet(
            daemon.queue(),
            &cfg,
            &packet_name("run5", 50),
            Some("echo \"node=$1 run=$2\"\necho done > finished.txt\n"),
        );

        daemon.run();

        let log = std::fs::read_to_string(cfg.logs_dir().join("xt.job1.run5.node0.50.log"))
            .expect("log");
        assert!(log.contains("node=node0 run=run5"), "{log}");
        assert!(cfg.cwd().join("finished.txt").is_file());
        assert!(!cfg.cwd().join(FN_CURRENT_PID).exists());
    }

    #[test]
    fn cancel_running_kills_the_current_controller() {
        let dir = temp_dir("daemon_cancel");
        let cfg = config(&dir);
        let mut daemon = PsmDaemon::new(cfg.clone(), NoProcesses, ShellLauncher::new()).expect("daemon");
        queue_packet(daemon.queue(), &cfg, &packet_name("run6", 60), Some("sleep 30\n"));

        assert!(matches!(daemon.step(), xt_psm::StepOutcome::Launched(_)));
        assert_eq!(daemon.running(), 1);

        let cancelled = cancel_running(&cfg).expect("cancel");
        assert_eq!(cancelled.as_deref(), Some("xt.job1.run6.node0.60.zip"));
        assert!(wait_until(Duration::from_secs(10), || daemon.running() == 0));
        assert_eq!(cancel_running(&cfg).expect("again"), None);
    }
}
