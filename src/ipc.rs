//! File-based IPC between observers and the resident daemon.
//!
//! Observers drop one JSON file per command into the mailbox directory and the daemon
//! drains it on a short poll. The daemon advertises itself through a PID file guarded by
//! an advisory lock.
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    constants::{COMMAND_FILE_EXT, COMMAND_FILE_PREFIX, COMMAND_TEMP_EXT},
    error::{ControlError, PidFileError},
    finder::is_pid_alive,
};

/// Action requested by an observer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandAction {
    Start,
    Stop,
    Restart,
    StartEnabled,
    StopAll,
    Reload,
}

impl CommandAction {
    /// Whether the action names a single entry.
    pub fn needs_target(self) -> bool {
        matches!(
            self,
            CommandAction::Start | CommandAction::Stop | CommandAction::Restart
        )
    }
}

/// One-shot command payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub action: CommandAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
}

impl Command {
    /// New command stamped with a fresh id and the current time.
    pub fn new(action: CommandAction, target: Option<String>) -> Result<Self, ControlError> {
        if action.needs_target() && target.as_deref().is_none_or(str::is_empty) {
            return Err(ControlError::MissingTarget(action.to_string()));
        }
        Ok(Self {
            id: Uuid::new_v4().simple().to_string(),
            action,
            target,
            issued_at: Some(Utc::now()),
        })
    }

    /// Issued before `started_at - slack`. Commands without a timestamp are never stale.
    pub fn is_stale(&self, started_at: DateTime<Utc>, slack: Duration) -> bool {
        let Some(issued_at) = self.issued_at else {
            return false;
        };
        let slack = ChronoDuration::from_std(slack).unwrap_or_else(|_| ChronoDuration::zero());
        issued_at < started_at - slack
    }
}

/// A parsed command still sitting in the mailbox.
#[derive(Debug)]
pub struct PendingCommand {
    pub path: PathBuf,
    pub command: Command,
}

/// The mailbox directory.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    dir: PathBuf,
}

impl CommandChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the command to a temp file and renames it into the mailbox.
    pub fn send(&self, command: &Command) -> Result<PathBuf, ControlError> {
        fs::create_dir_all(&self.dir)?;
        let stem = format!("{COMMAND_FILE_PREFIX}{}", command.id);
        let tmp = self.dir.join(format!("{stem}.{COMMAND_TEMP_EXT}"));
        let path = self.dir.join(format!("{stem}.{COMMAND_FILE_EXT}"));

        let payload = serde_json::to_vec(command)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        debug!("Queued '{}' command {}", command.action, command.id);
        Ok(path)
    }

    /// Committed command files, oldest name first.
    fn command_files(&self) -> Result<Vec<PathBuf>, ControlError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                let name_ok = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(COMMAND_FILE_PREFIX));
                let ext_ok = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == COMMAND_FILE_EXT);
                name_ok && ext_ok
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Parses every committed command in issue order.
    ///
    /// Malformed and stale files are deleted here and never returned. The caller deletes
    /// each returned command with [`CommandChannel::complete`] once it has been attempted.
    pub fn drain(
        &self,
        started_at: DateTime<Utc>,
        slack: Duration,
    ) -> Result<Vec<PendingCommand>, ControlError> {
        let mut pending = Vec::new();
        for path in self.command_files()? {
            let parsed = fs::read(&path)
                .map_err(ControlError::from)
                .and_then(|bytes| serde_json::from_slice::<Command>(&bytes).map_err(Into::into));

            match parsed {
                Ok(command) if command.is_stale(started_at, slack) => {
                    debug!(
                        "Dropping stale '{}' command {} issued at {:?}",
                        command.action, command.id, command.issued_at
                    );
                    discard(&path);
                }
                Ok(command) => pending.push(PendingCommand { path, command }),
                Err(err) => {
                    warn!("Discarding malformed command file {}: {err}", path.display());
                    discard(&path);
                }
            }
        }

        pending.sort_by(|a, b| {
            a.command
                .issued_at
                .cmp(&b.command.issued_at)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(pending)
    }

    /// Deletes a command after its action was attempted.
    pub fn complete(&self, pending: &PendingCommand) {
        discard(&pending.path);
    }

    /// Deletes every stale or malformed command present right now.
    pub fn sweep_stale(
        &self,
        started_at: DateTime<Utc>,
        slack: Duration,
    ) -> Result<usize, ControlError> {
        let before = self.command_files()?.len();
        let kept = self.drain(started_at, slack)?.len();
        Ok(before.saturating_sub(kept))
    }
}

fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!("Failed to delete command file {}: {err}", path.display());
    }
}

/// Single-instance guard: PID file plus an exclusive lock held for the daemon's lifetime.
#[derive(Debug)]
pub struct DaemonPidFile {
    pid_path: PathBuf,
    _lock: File,
}

impl DaemonPidFile {
    /// Claims the data directory for this process.
    ///
    /// Refused while another process holds the lock. Once the lock is won, whatever PID
    /// file is present is stale and gets overwritten.
    pub fn acquire(pid_path: &Path, lock_path: &Path) -> Result<Self, PidFileError> {
        if let Some(parent) = pid_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            return match read_daemon_pid(pid_path) {
                Some(pid) => Err(PidFileError::AlreadyRunning(pid)),
                None => Err(PidFileError::Locked),
            };
        }

        // Any live daemon for this directory would still hold the lock.
        let own = std::process::id();
        if let Some(pid) = read_pid_raw(pid_path)
            && pid != own
        {
            debug!("Replacing stale PID file naming process {pid}");
        }

        let tmp = pid_path.with_extension("pid.tmp");
        fs::write(&tmp, own.to_string())?;
        fs::rename(&tmp, pid_path)?;

        Ok(Self {
            pid_path: pid_path.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.pid_path
    }

    /// Removes the PID file if it still names this process.
    pub fn release(&self) {
        if read_pid_raw(&self.pid_path) == Some(std::process::id()) {
            let _ = fs::remove_file(&self.pid_path);
        }
    }
}

impl Drop for DaemonPidFile {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid_raw(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// The live daemon's pid. Unparsable or stale PID files are deleted.
pub fn read_daemon_pid(path: &Path) -> Option<u32> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return None,
    };

    match content.trim().parse::<u32>() {
        Ok(pid) if is_pid_alive(pid) => Some(pid),
        Ok(pid) => {
            debug!("Removing stale PID file for dead process {pid}");
            let _ = fs::remove_file(path);
            None
        }
        Err(_) => {
            debug!("Removing unparsable PID file {}", path.display());
            let _ = fs::remove_file(path);
            None
        }
    }
}

pub fn is_daemon_running(path: &Path) -> bool {
    read_daemon_pid(path).is_some()
}
