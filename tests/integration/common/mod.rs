#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Child, Command as StdCommand, Stdio},
    thread,
    time::{Duration, Instant},
};

use assert_cmd::Command;
use combiner::state::{EntrySnapshot, EntryStatus, StateSnapshot, read_snapshot};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tempfile::TempDir;

pub const BIN: &str = env!("CARGO_BIN_EXE_combiner");

/// A private data directory for one test.
pub struct Workspace {
    temp: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            temp: tempfile::tempdir().expect("failed to create tempdir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.temp.path().join("data")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir().join("state.json")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.data_dir().join("daemon.pid")
    }

    pub fn commands_dir(&self) -> PathBuf {
        self.data_dir().join("commands")
    }

    /// Observer invocation bound to this data directory.
    pub fn cmd(&self) -> Command {
        let mut cmd = Command::new(BIN);
        cmd.arg("--data-dir").arg(self.data_dir());
        cmd
    }

    /// Registers an entry through the CLI and returns its id.
    pub fn add_entry(&self, name: &str, command: &str, extra: &[&str]) -> String {
        let output = self
            .cmd()
            .args(["add", "--name", name, "--cmd", command])
            .args(extra)
            .output()
            .expect("failed to run add");
        assert!(
            output.status.success(),
            "add failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Starts a foreground daemon for this data directory.
    pub fn spawn_daemon(&self, extra: &[&str]) -> DaemonHandle {
        let child = StdCommand::new(BIN)
            .arg("--data-dir")
            .arg(self.data_dir())
            .args(["--daemon", "--no-network-wait", "--log-level", "debug"])
            .args(extra)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn daemon");
        let handle = DaemonHandle { child };
        wait_for_path(&self.pid_path());
        self.wait_for_fresh_state();
        handle
    }

    pub fn snapshot(&self) -> Option<StateSnapshot> {
        read_snapshot(&self.state_path())
    }

    pub fn wait_for_fresh_state(&self) -> StateSnapshot {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(snapshot) = self.snapshot()
                && snapshot.is_fresh(Duration::from_secs(5))
            {
                return snapshot;
            }
            if Instant::now() >= deadline {
                panic!("Timed out waiting for a fresh state snapshot");
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    /// Polls the published snapshot until `id` reaches `status`.
    pub fn wait_for_status(&self, id: &str, status: EntryStatus) -> EntrySnapshot {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            if let Some(entry) = self
                .snapshot()
                .and_then(|snapshot| snapshot.entry(id).cloned())
                && entry.status == status
            {
                return entry;
            }
            if Instant::now() >= deadline {
                panic!(
                    "Timed out waiting for '{id}' to become {status}; last snapshot: {:?}",
                    self.snapshot()
                );
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    pub fn log_text(&self, id: &str) -> String {
        fs::read_to_string(self.data_dir().join("logs").join(format!("{id}.log")))
            .unwrap_or_default()
    }
}

/// Foreground daemon that is asked to shut down when dropped.
pub struct DaemonHandle {
    child: Child,
}

impl DaemonHandle {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Sends SIGTERM and waits for the daemon to exit.
    pub fn terminate(&mut self) -> Option<std::process::ExitStatus> {
        let _ = signal::kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM);
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                let _ = self.child.kill();
                let _ = self.child.wait();
                return None;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.terminate();
        }
    }
}

pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for {:?} to exist", path);
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    condition()
}

pub fn is_process_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => !is_zombie(pid),
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn is_zombie(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next().map(|s| s == "Z"))
        })
        .unwrap_or(false)
}
