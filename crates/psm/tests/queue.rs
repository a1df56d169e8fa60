#![forbid(unsafe_code)]

mod support;

use support::*;
use xt_psm::PsmQueue;

#[test]
fn enqueue_publishes_by_rename_and_lists_oldest_first() {
    let dir = temp_dir("queue_order");
    let cfg = config(&dir);
    let queue = PsmQueue::open(cfg.queue_dir()).expect("queue");

    for (run, ticks) in [("run1", 1000), ("run2", 1005), ("run3", 1001)] {
        queue_packet(&queue, &cfg, &packet_name(run, ticks), None);
    }
    std::fs::write(queue.dir().join("xt.job1.run9.node0.999.tmp"), b"partial").expect("tmp");

    let listed = queue.list().expect("list");
    let ticks = listed.iter().map(|e| e.ticks).collect::<Vec<_>>();
    assert_eq!(ticks, vec![1000, 1001, 1005]);
    assert_eq!(listed[1].name.run_name, "run3");
    assert_eq!(
        queue.next_entry().expect("next").map(|e| e.file_name),
        Some("xt.job1.run1.node0.1000.zip".to_string())
    );

    let leftovers = std::fs::read_dir(queue.dir())
        .expect("read")
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".tmp"))
        .collect::<Vec<_>>();
    assert_eq!(leftovers, vec!["xt.job1.run9.node0.999.tmp".to_string()]);
}

#[test]
fn cancel_queued_removes_only_named_packets() {
    let dir = temp_dir("queue_cancel");
    let cfg = config(&dir);
    let queue = PsmQueue::open(cfg.queue_dir()).expect("queue");
    queue_packet(&queue, &cfg, &packet_name("run1", 10), None);
    queue_packet(&queue, &cfg, &packet_name("run2", 11), None);

    assert!(queue.cancel_queued("xt.job1.run1.node0.10.zip").expect("cancel"));
    assert!(!queue.cancel_queued("xt.job1.run1.node0.10.zip").expect("again"));
    assert!(queue.cancel_queued("../psm_logs/x.zip").is_err());

    let names = queue
        .list()
        .expect("list")
        .into_iter()
        .map(|e| e.name.run_name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["run2".to_string()]);
}

#[test]
fn malformed_names_are_reported_not_listed() {
    let dir = temp_dir("queue_invalid");
    let cfg = config(&dir);
    let queue = PsmQueue::open(cfg.queue_dir()).expect("queue");
    std::fs::write(queue.dir().join("garbage.zip"), b"junk").expect("junk");
    queue_packet(&queue, &cfg, &packet_name("run4", 7), None);

    assert_eq!(queue.list().expect("list").len(), 1);
    let invalid = queue.invalid_entries().expect("invalid");
    assert_eq!(invalid, vec![queue.dir().join("garbage.zip")]);
}
