//! Entry status and the published state snapshot.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::debug;

use crate::error::ControlError;

/// Lifecycle status of a supervised entry.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Stopped,
    Starting,
    /// Enabled but deferred until the network is ready.
    Waiting,
    Running,
    Stopping,
    Crashed,
}

impl EntryStatus {
    /// Statuses during which the entry has, or is about to have, a live process.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            EntryStatus::Running
                | EntryStatus::Starting
                | EntryStatus::Stopping
                | EntryStatus::Waiting
        )
    }
}

/// One entry as seen in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub status: EntryStatus,
    /// Owned child pid or adopted pid, whichever is current.
    #[serde(default)]
    pub os_pid: Option<u32>,
}

/// Full supervisor state, replaced wholesale on every publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<EntrySnapshot>,
}

impl StateSnapshot {
    pub fn new(entries: Vec<EntrySnapshot>) -> Self {
        Self {
            updated_at: Utc::now(),
            entries,
        }
    }

    /// `now - updated_at <= threshold`. Timestamps from the future count as fresh.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match (now - self.updated_at).to_std() {
            Ok(age) => age <= threshold,
            Err(_) => true,
        }
    }

    pub fn is_fresh(&self, threshold: Duration) -> bool {
        self.is_fresh_at(Utc::now(), threshold)
    }

    pub fn entry(&self, id: &str) -> Option<&EntrySnapshot> {
        self.entries.iter().find(|entry| entry.id == id)
    }
}

/// Writes snapshots by atomic replace.
#[derive(Debug, Clone)]
pub struct StatePublisher {
    path: PathBuf,
}

impl StatePublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the snapshot to a sibling temp file and renames it into place.
    pub fn publish(&self, snapshot: &StateSnapshot) -> Result<(), ControlError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Published state for {} entries", snapshot.entries.len());
        Ok(())
    }
}

/// Reads the snapshot, treating a missing or unreadable file as absent.
pub fn read_snapshot(path: &Path) -> Option<StateSnapshot> {
    let content = fs::read(path).ok()?;
    match serde_json::from_slice(&content) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            debug!("Ignoring unreadable state file {}: {err}", path.display());
            None
        }
    }
}
