#![forbid(unsafe_code)]
#![cfg(target_os = "linux")]

mod support;

use std::time::Duration;
use support::*;
use xt_psm::{EnsureOutcome, ProcScanProbe, ProcessProbe, PsmInstall, ensure_psm_running, kill_process_tree};

/// Stays alive without forking, keeping its own path on the command line.
const FAKE_PSM: &str = "#!/bin/sh\nexec tail -f /dev/null \"$0\"\n";

#[test]
fn box_binary_is_replaced_only_when_it_differs() {
    let dir = temp_dir("restart");
    let install = PsmInstall {
        local_binary: dir.join("client").join("xt-psm"),
        box_binary: dir.join("box").join("xt-psm"),
        xt_dir: dir.join("box").join(".xt"),
    };
    std::fs::create_dir_all(dir.join("client")).expect("client dir");
    std::fs::write(&install.local_binary, FAKE_PSM).expect("local binary");
    let mut probe = ProcScanProbe;
    let needle = install.box_binary.to_string_lossy().into_owned();
    let timeout = Duration::from_secs(10);

    let first = ensure_psm_running(&install, &mut probe, timeout).expect("start");
    assert_eq!(first, EnsureOutcome::Started);
    let original = probe.find(&needle);
    assert_eq!(original.len(), 1);

    let second = ensure_psm_running(&install, &mut probe, timeout).expect("same binary");
    assert_eq!(second, EnsureOutcome::AlreadyRunning);
    assert_eq!(probe.find(&needle), original);

    let updated = format!("{FAKE_PSM}# v2\n");
    std::fs::write(&install.local_binary, &updated).expect("new local binary");
    let third = ensure_psm_running(&install, &mut probe, timeout).expect("restart");
    assert_eq!(third, EnsureOutcome::Restarted);
    assert_eq!(std::fs::read_to_string(&install.box_binary).expect("box"), updated);
    assert!(wait_until(timeout, || {
        let now = probe.find(&needle);
        now.len() == 1 && now != original
    }));

    for pid in probe.find(&needle) {
        kill_process_tree(pid);
    }
}

#[test]
fn missing_local_binary_is_a_config_error() {
    let dir = temp_dir("restart_missing");
    let install = PsmInstall {
        local_binary: dir.join("nope"),
        box_binary: dir.join("box").join("xt-psm"),
        xt_dir: dir.join(".xt"),
    };
    let err = ensure_psm_running(&install, &mut ProcScanProbe, Duration::from_secs(1))
        .expect_err("missing binary");
    assert!(matches!(err, xt_psm::PsmError::Config(_)));
}
