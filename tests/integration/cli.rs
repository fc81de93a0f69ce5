#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::Workspace;
use predicates::{boolean::PredicateBooleanExt, str::contains};

#[test]
fn help_lists_observer_commands() {
    let ws = Workspace::new();
    ws.cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("start-enabled").and(contains("clear-log")));
}

#[test]
fn rejects_unknown_log_level() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["--log-level", "loud", "status"])
        .assert()
        .failure()
        .stderr(contains("invalid log level"));
}

#[test]
fn add_registers_entry_with_environment_snapshot() {
    let ws = Workspace::new();
    let id = ws.add_entry("Worker", "sleep 30", &["--enabled"]);
    assert_eq!(id.len(), 32, "expected a simple uuid, got {id:?}");

    let raw = fs::read_to_string(ws.data_dir().join("config.json")).unwrap();
    let document: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let entries = document["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["id"], id.as_str());
    assert_eq!(entries[0]["name"], "Worker");
    assert_eq!(entries[0]["enabled"], true);
    assert_eq!(entries[0]["autorestart"], true);
    assert!(document["env_snapshot"].get("PATH").is_some());
}

#[test]
fn status_without_daemon_reports_stopped_entries() {
    let ws = Workspace::new();
    let id = ws.add_entry("Worker", "sleep 30", &[]);

    ws.cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(
            contains("Daemon not running")
                .and(contains(id.as_str()))
                .and(contains("stopped")),
        );

    let output = ws.cmd().args(["status", "--json"]).output().unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["fresh"], false);
    assert!(report["daemon_pid"].is_null());
    assert_eq!(report["entries"][0]["status"], "stopped");
}

#[test]
fn remove_drops_entry() {
    let ws = Workspace::new();
    let id = ws.add_entry("Worker", "sleep 30", &[]);

    ws.cmd().args(["remove", &id]).assert().success();
    ws.cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(contains("No entries registered"));
}

#[test]
fn remove_unknown_entry_fails() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["remove", "missing"])
        .assert()
        .failure()
        .stderr(contains("missing"));
}

#[test]
fn start_unknown_entry_fails() {
    let ws = Workspace::new();
    ws.cmd().args(["start", "missing"]).assert().failure();
}

#[test]
fn start_without_daemon_is_skipped() {
    let ws = Workspace::new();
    let id = ws.add_entry("Worker", "sleep 30", &[]);

    ws.cmd()
        .args(["start", &id])
        .assert()
        .success()
        .stderr(contains("No running combiner daemon"));

    let queued = fs::read_dir(ws.commands_dir())
        .map(|dir| dir.count())
        .unwrap_or(0);
    assert_eq!(queued, 0);
}

#[test]
fn stale_pid_file_is_removed_by_observers() {
    let ws = Workspace::new();
    fs::create_dir_all(ws.data_dir()).unwrap();
    fs::write(ws.pid_path(), "999999999").unwrap();

    ws.cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(contains("Daemon not running"));
    assert!(!ws.pid_path().exists());
}

#[test]
fn logs_for_entry_without_output_prints_nothing() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["logs", "nothing-here"])
        .assert()
        .success()
        .stdout("");
}
