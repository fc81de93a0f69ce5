#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Duration};

use combiner::state::EntryStatus;
use common::{Workspace, is_process_alive, wait_until};
use predicates::str::contains;

#[test]
fn start_and_stop_with_wait() {
    let ws = Workspace::new();
    let id = ws.add_entry("Sleeper", "sleep 401", &[]);
    let _daemon = ws.spawn_daemon(&[]);

    ws.cmd()
        .args(["start", &id, "--wait"])
        .assert()
        .success()
        .stdout(contains("running"));
    let pid = ws
        .wait_for_status(&id, EntryStatus::Running)
        .os_pid
        .expect("running entry has a pid");

    ws.cmd()
        .args(["stop", &id, "--wait"])
        .assert()
        .success()
        .stdout(contains("stopped"));
    assert!(wait_until(Duration::from_secs(5), || !is_process_alive(pid)));
    assert!(ws.log_text(&id).contains("Stopped"));
}

#[test]
fn restart_replaces_the_process() {
    let ws = Workspace::new();
    let id = ws.add_entry("Sleeper", "sleep 402", &[]);
    let _daemon = ws.spawn_daemon(&[]);

    ws.cmd().args(["start", &id, "--wait"]).assert().success();
    let first = ws.wait_for_status(&id, EntryStatus::Running).os_pid.unwrap();

    ws.cmd().args(["restart", &id]).assert().success();
    assert!(wait_until(Duration::from_secs(15), || {
        ws.snapshot()
            .and_then(|snapshot| snapshot.entry(&id).cloned())
            .is_some_and(|entry| {
                entry.status == EntryStatus::Running && entry.os_pid != Some(first)
            })
    }));
    assert!(wait_until(Duration::from_secs(5), || !is_process_alive(first)));
}

#[test]
fn entries_added_while_running_are_reloaded() {
    let ws = Workspace::new();
    let _daemon = ws.spawn_daemon(&[]);

    let id = ws.add_entry("Late", "sleep 403", &[]);
    assert!(wait_until(Duration::from_secs(10), || {
        ws.snapshot()
            .is_some_and(|snapshot| snapshot.entry(&id).is_some())
    }));

    ws.cmd().args(["start", &id]).assert().success();
    ws.wait_for_status(&id, EntryStatus::Running);
}

#[test]
fn start_enabled_and_stop_all() {
    let ws = Workspace::new();
    let first = ws.add_entry("One", "sleep 404", &["--enabled"]);
    let second = ws.add_entry("Two", "sleep 405", &["--enabled"]);
    let manual = ws.add_entry("Manual", "sleep 406", &[]);
    let _daemon = ws.spawn_daemon(&[]);

    ws.cmd().arg("start-enabled").assert().success();
    ws.wait_for_status(&first, EntryStatus::Running);
    ws.wait_for_status(&second, EntryStatus::Running);
    assert_eq!(
        ws.snapshot().unwrap().entry(&manual).unwrap().status,
        EntryStatus::Stopped
    );

    ws.cmd().arg("stop-all").assert().success();
    ws.wait_for_status(&first, EntryStatus::Stopped);
    ws.wait_for_status(&second, EntryStatus::Stopped);
}

#[test]
fn remove_is_refused_while_running() {
    let ws = Workspace::new();
    let id = ws.add_entry("Busy", "sleep 407", &[]);
    let _daemon = ws.spawn_daemon(&[]);

    ws.cmd().args(["start", &id, "--wait"]).assert().success();
    ws.cmd()
        .args(["remove", &id])
        .assert()
        .failure()
        .stderr(contains("StillActive"));

    ws.cmd().args(["stop", &id, "--wait"]).assert().success();
    ws.cmd().args(["remove", &id]).assert().success();
}

#[test]
fn logs_capture_output_and_clear_log_empties_them() {
    let ws = Workspace::new();
    let id = ws.add_entry(
        "Chatty",
        "sh -c 'echo hello from entry; sleep 30'",
        &[],
    );
    let _daemon = ws.spawn_daemon(&[]);

    ws.cmd().args(["start", &id]).assert().success();
    assert!(wait_until(Duration::from_secs(10), || {
        ws.log_text(&id).contains("hello from entry")
    }));
    ws.cmd()
        .args(["logs", &id, "--lines", "50"])
        .assert()
        .success()
        .stdout(contains("hello from entry"));

    ws.cmd().args(["clear-log", &id]).assert().success();
    assert!(!ws.log_text(&id).contains("hello from entry"));
}

#[test]
fn stale_commands_are_discarded_at_startup() {
    let ws = Workspace::new();
    let id = ws.add_entry("Sleeper", "sleep 408", &[]);
    fs::create_dir_all(ws.commands_dir()).unwrap();
    let stale = ws.commands_dir().join("cmd-stale.json");
    fs::write(
        &stale,
        format!(
            r#"{{"id":"stale","action":"start","target":"{id}","issued_at":"2000-01-01T00:00:00Z"}}"#
        ),
    )
    .unwrap();

    let _daemon = ws.spawn_daemon(&[]);
    assert!(wait_until(Duration::from_secs(5), || !stale.exists()));
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(
        ws.snapshot().unwrap().entry(&id).unwrap().status,
        EntryStatus::Stopped
    );
}
