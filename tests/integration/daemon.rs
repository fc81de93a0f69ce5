#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    process::{Command as StdCommand, Stdio},
    time::Duration,
};

use combiner::state::EntryStatus;
use common::{Workspace, is_process_alive, wait_until};
use predicates::str::contains;

#[test]
fn daemon_publishes_state_and_cleans_up_on_sigterm() {
    let ws = Workspace::new();
    let mut daemon = ws.spawn_daemon(&[]);

    let recorded: u32 = fs::read_to_string(ws.pid_path())
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(recorded, daemon.pid());

    ws.cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(contains(format!("Daemon running (PID {recorded})")));

    let status = daemon.terminate().expect("daemon did not exit");
    assert!(status.success());
    assert!(!ws.pid_path().exists());
}

#[test]
fn second_daemon_exits_cleanly() {
    let ws = Workspace::new();
    let _daemon = ws.spawn_daemon(&[]);

    ws.cmd()
        .args(["--daemon", "--no-network-wait"])
        .timeout(Duration::from_secs(10))
        .assert()
        .success()
        .stderr(contains("already running"));
}

#[test]
fn autostart_runs_enabled_entries_and_shutdown_stops_them() {
    let ws = Workspace::new();
    let enabled = ws.add_entry("Enabled", "sleep 301", &["--enabled"]);
    let disabled = ws.add_entry("Disabled", "sleep 302", &[]);

    let mut daemon = ws.spawn_daemon(&["--autostart"]);
    let running = ws.wait_for_status(&enabled, EntryStatus::Running);
    let pid = running.os_pid.expect("running entry has a pid");
    assert!(is_process_alive(pid));

    let snapshot = ws.snapshot().unwrap();
    assert_eq!(
        snapshot.entry(&disabled).unwrap().status,
        EntryStatus::Stopped
    );

    daemon.terminate().expect("daemon did not exit");
    assert!(wait_until(Duration::from_secs(5), || !is_process_alive(pid)));
    assert!(ws.log_text(&enabled).contains("Started"));
}

#[test]
fn crashed_entry_is_restarted() {
    let ws = Workspace::new();
    let id = ws.add_entry("Flaky", "sh -c 'echo tick; exit 3'", &[]);
    let _daemon = ws.spawn_daemon(&[]);

    ws.cmd().args(["start", &id]).assert().success();
    let restarted = wait_until(Duration::from_secs(15), || {
        ws.log_text(&id).matches("tick").count() >= 2
    });
    assert!(restarted, "log was: {}", ws.log_text(&id));
    assert!(ws.log_text(&id).contains("Crashed"));
}

#[test]
fn entry_without_autorestart_stays_crashed() {
    let ws = Workspace::new();
    let id = ws.add_entry("Once", "sh -c 'exit 4'", &["--no-autorestart"]);
    let _daemon = ws.spawn_daemon(&[]);

    ws.cmd().args(["start", &id]).assert().success();
    let crashed = ws.wait_for_status(&id, EntryStatus::Crashed);
    assert!(crashed.os_pid.is_none());
}

#[test]
fn running_external_process_is_adopted_and_stopped() {
    let ws = Workspace::new();
    let workdir = ws.root().join("adoptee");
    fs::create_dir_all(&workdir).unwrap();

    let mut external = StdCommand::new("sleep")
        .arg("313")
        .current_dir(&workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let external_pid = external.id();

    let id = ws.add_entry(
        "Adoptee",
        "sleep 313",
        &["--cwd", workdir.to_str().unwrap()],
    );
    let _daemon = ws.spawn_daemon(&[]);

    ws.cmd().args(["start", &id]).assert().success();
    let adopted = ws.wait_for_status(&id, EntryStatus::Running);
    assert_eq!(adopted.os_pid, Some(external_pid));
    assert!(ws.log_text(&id).contains("Adopted"));

    ws.cmd().args(["stop", &id]).assert().success();
    ws.wait_for_status(&id, EntryStatus::Stopped);
    assert!(wait_until(Duration::from_secs(5), || {
        matches!(external.try_wait(), Ok(Some(_)))
    }));
}

#[test]
fn unrelated_process_in_entry_directory_is_left_alone() {
    let ws = Workspace::new();
    let workdir = ws.root().join("shared");
    fs::create_dir_all(&workdir).unwrap();

    let mut bystander = StdCommand::new("sleep")
        .arg("611")
        .current_dir(&workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let bystander_pid = bystander.id();

    let id = ws.add_entry(
        "Neighbour",
        "sleep 977",
        &["--cwd", workdir.to_str().unwrap()],
    );
    let _daemon = ws.spawn_daemon(&[]);

    ws.cmd().args(["start", &id]).assert().success();
    let running = ws.wait_for_status(&id, EntryStatus::Running);
    assert_ne!(running.os_pid, Some(bystander_pid));
    assert!(!ws.log_text(&id).contains("Adopted"));

    ws.cmd().args(["stop", &id]).assert().success();
    ws.wait_for_status(&id, EntryStatus::Stopped);
    std::thread::sleep(Duration::from_millis(300));
    assert!(matches!(bystander.try_wait(), Ok(None)));

    let _ = bystander.kill();
    let _ = bystander.wait();
}
