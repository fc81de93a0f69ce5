//! Observer side of the file channel: sending commands, reading state, and the
//! optimistic pending-action overlay.
//!
//! After issuing a command an observer shows the expected transitional status at once and
//! ignores snapshot statuses that would flicker back (the daemon has not polled the
//! command yet) until either the snapshot shows the expected outcome or the grace window
//! runs out. The snapshot stays the source of truth once it catches up.
use std::{
    collections::{BTreeMap, HashMap},
    thread,
    time::{Duration, Instant},
};
use tracing::debug;

use crate::{
    constants::{PENDING_STATUS_GRACE, STATE_FRESHNESS_THRESHOLD, STATE_PUBLISH_INTERVAL},
    error::ControlError,
    ipc::{Command, CommandAction, CommandChannel, read_daemon_pid},
    logs::LogStore,
    runtime::RuntimePaths,
    state::{EntryStatus, StateSnapshot, read_snapshot},
};

/// What an observer is waiting to see for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Start,
    Stop,
    /// Waiting for the old process to leave `running`.
    Restart,
    /// The restart passed through a transitional status; waiting for `running`.
    RestartWait,
}

#[derive(Debug, Clone, Copy)]
struct PendingRecord {
    kind: PendingKind,
    since: Instant,
    /// Process shown when the action was issued.
    previous_pid: Option<u32>,
}

/// Per-entry pending-action records with expiry.
#[derive(Debug)]
pub struct PendingActions {
    grace: Duration,
    records: HashMap<String, PendingRecord>,
}

impl Default for PendingActions {
    fn default() -> Self {
        Self::new(PENDING_STATUS_GRACE)
    }
}

impl PendingActions {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            records: HashMap::new(),
        }
    }

    /// Records an action. Only single-entry actions are tracked.
    pub fn record(
        &mut self,
        id: &str,
        action: CommandAction,
        previous_pid: Option<u32>,
        now: Instant,
    ) {
        let kind = match action {
            CommandAction::Start => PendingKind::Start,
            CommandAction::Stop => PendingKind::Stop,
            CommandAction::Restart => PendingKind::Restart,
            _ => return,
        };
        self.records.insert(
            id.to_string(),
            PendingRecord {
                kind,
                since: now,
                previous_pid,
            },
        );
    }

    pub fn pending(&self, id: &str) -> Option<PendingKind> {
        self.records.get(id).map(|record| record.kind)
    }

    /// Whether a snapshot status for `id` should be ignored right now.
    ///
    /// Reaching the expected status, or the grace window expiring, clears the record. The
    /// window is measured from the original command, including after a restart moves on
    /// to [`PendingKind::RestartWait`].
    pub fn should_ignore(
        &mut self,
        id: &str,
        incoming: EntryStatus,
        os_pid: Option<u32>,
        now: Instant,
    ) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if now.saturating_duration_since(record.since) > self.grace {
            self.records.remove(id);
            return false;
        }

        use EntryStatus::*;
        match (record.kind, incoming) {
            (PendingKind::Start, Stopped | Crashed | Stopping) => true,
            (PendingKind::Start, Running) => {
                self.records.remove(id);
                false
            }
            (PendingKind::Start, _) => false,

            (PendingKind::Stop, Running | Starting | Stopping | Waiting) => true,
            (PendingKind::Stop, Stopped | Crashed) => {
                self.records.remove(id);
                false
            }

            (PendingKind::Restart, Running) => {
                let replaced = os_pid.is_some()
                    && record.previous_pid.is_some()
                    && os_pid != record.previous_pid;
                if replaced {
                    self.records.remove(id);
                }
                !replaced
            }
            (PendingKind::Restart, _) => {
                record.kind = PendingKind::RestartWait;
                false
            }

            (PendingKind::RestartWait, Running) => {
                self.records.remove(id);
                false
            }
            (PendingKind::RestartWait, _) => false,
        }
    }
}

/// Status shown immediately after sending `action`.
pub fn optimistic_status(action: CommandAction) -> Option<EntryStatus> {
    match action {
        CommandAction::Start => Some(EntryStatus::Starting),
        CommandAction::Stop | CommandAction::Restart => Some(EntryStatus::Stopping),
        _ => None,
    }
}

/// Whether `status` is the outcome an observer waits for after `action`.
pub fn is_settled(action: CommandAction, status: EntryStatus) -> bool {
    match action {
        CommandAction::Start | CommandAction::Restart => status == EntryStatus::Running,
        CommandAction::Stop => matches!(status, EntryStatus::Stopped | EntryStatus::Crashed),
        _ => true,
    }
}

/// Locally displayed statuses: snapshot values filtered through [`PendingActions`].
#[derive(Debug, Default)]
pub struct ObservedState {
    statuses: BTreeMap<String, EntryStatus>,
    pids: HashMap<String, u32>,
    pending: PendingActions,
}

impl ObservedState {
    pub fn new(grace: Duration) -> Self {
        Self {
            statuses: BTreeMap::new(),
            pids: HashMap::new(),
            pending: PendingActions::new(grace),
        }
    }

    pub fn status(&self, id: &str) -> Option<EntryStatus> {
        self.statuses.get(id).copied()
    }

    /// Applies the optimistic status for a just-sent command.
    pub fn note_command(&mut self, id: &str, action: CommandAction, now: Instant) {
        if let Some(status) = optimistic_status(action) {
            self.statuses.insert(id.to_string(), status);
            let previous_pid = self.pids.get(id).copied();
            self.pending.record(id, action, previous_pid, now);
        }
    }

    /// Merges a snapshot and returns the ids whose displayed status changed.
    pub fn apply_snapshot(&mut self, snapshot: &StateSnapshot, now: Instant) -> Vec<String> {
        let mut changed = Vec::new();
        for entry in &snapshot.entries {
            match entry.os_pid {
                Some(pid) => self.pids.insert(entry.id.clone(), pid),
                None => self.pids.remove(&entry.id),
            };
            if self
                .pending
                .should_ignore(&entry.id, entry.status, entry.os_pid, now)
            {
                debug!("Holding optimistic status for '{}' over {}", entry.id, entry.status);
                continue;
            }
            if self.statuses.insert(entry.id.clone(), entry.status) != Some(entry.status) {
                changed.push(entry.id.clone());
            }
        }
        changed
    }
}

/// Client handle for one data directory.
#[derive(Debug, Clone)]
pub struct Observer {
    paths: RuntimePaths,
    channel: CommandChannel,
}

impl Observer {
    pub fn new(paths: RuntimePaths) -> Self {
        Self {
            channel: CommandChannel::new(paths.commands_dir()),
            paths,
        }
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    pub fn daemon_pid(&self) -> Option<u32> {
        read_daemon_pid(&self.paths.pid_path())
    }

    pub fn is_daemon_running(&self) -> bool {
        self.daemon_pid().is_some()
    }

    /// Queues a command for the daemon.
    pub fn send_command(
        &self,
        action: CommandAction,
        target: Option<&str>,
    ) -> Result<Command, ControlError> {
        let command = Command::new(action, target.map(str::to_string))?;
        self.channel.send(&command)?;
        Ok(command)
    }

    pub fn snapshot(&self) -> Option<StateSnapshot> {
        read_snapshot(&self.paths.state_path())
    }

    /// A snapshot exists and was published within the freshness threshold.
    pub fn is_state_fresh(&self) -> bool {
        self.snapshot()
            .is_some_and(|snapshot| snapshot.is_fresh(STATE_FRESHNESS_THRESHOLD))
    }

    /// Status from a fresh snapshot; `stopped` when there is none.
    pub fn last_known_status(&self, id: &str) -> EntryStatus {
        self.snapshot()
            .filter(|snapshot| snapshot.is_fresh(STATE_FRESHNESS_THRESHOLD))
            .and_then(|snapshot| snapshot.entry(id).map(|entry| entry.status))
            .unwrap_or_default()
    }

    pub fn logs(&self) -> LogStore {
        LogStore::new(self.paths.logs_dir())
    }

    /// Sends `action` for `id` and polls snapshots until it settles or `timeout` passes.
    ///
    /// Returns the last displayed status.
    pub fn send_and_wait(
        &self,
        action: CommandAction,
        id: &str,
        timeout: Duration,
    ) -> Result<EntryStatus, ControlError> {
        let mut observed = ObservedState::default();
        if let Some(snapshot) = self.snapshot() {
            observed.apply_snapshot(&snapshot, Instant::now());
        }
        self.send_command(action, Some(id))?;
        let started = Instant::now();
        observed.note_command(id, action, started);

        loop {
            if let Some(snapshot) = self.snapshot() {
                observed.apply_snapshot(&snapshot, Instant::now());
            }
            let status = observed.status(id).unwrap_or_default();
            if is_settled(action, status) || started.elapsed() >= timeout {
                return Ok(status);
            }
            thread::sleep(STATE_PUBLISH_INTERVAL / 4);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EntrySnapshot;
    use tempfile::tempdir;

    fn snapshot_with(id: &str, status: EntryStatus) -> StateSnapshot {
        snapshot_with_pid(id, status, None)
    }

    fn snapshot_with_pid(id: &str, status: EntryStatus, os_pid: Option<u32>) -> StateSnapshot {
        StateSnapshot::new(vec![EntrySnapshot {
            id: id.to_string(),
            name: id.to_string(),
            status,
            os_pid,
        }])
    }

    #[test]
    fn start_ignores_stale_stopped_until_running() {
        let mut pending = PendingActions::new(Duration::from_secs(3));
        let now = Instant::now();
        pending.record("a", CommandAction::Start, None, now);

        assert!(pending.should_ignore("a", EntryStatus::Stopped, None, now));
        assert!(pending.should_ignore("a", EntryStatus::Crashed, None, now));
        assert!(!pending.should_ignore("a", EntryStatus::Starting, None, now));
        assert!(!pending.should_ignore("a", EntryStatus::Running, None, now));
        assert_eq!(pending.pending("a"), None);
        assert!(!pending.should_ignore("a", EntryStatus::Stopped, None, now));
    }

    #[test]
    fn stop_ignores_running_until_terminal() {
        let mut pending = PendingActions::new(Duration::from_secs(3));
        let now = Instant::now();
        pending.record("a", CommandAction::Stop, None, now);

        assert!(pending.should_ignore("a", EntryStatus::Running, None, now));
        assert!(pending.should_ignore("a", EntryStatus::Waiting, None, now));
        assert!(!pending.should_ignore("a", EntryStatus::Crashed, None, now));
        assert_eq!(pending.pending("a"), None);
    }

    #[test]
    fn restart_waits_for_transition_then_running() {
        let mut pending = PendingActions::new(Duration::from_secs(3));
        let now = Instant::now();
        pending.record("a", CommandAction::Restart, None, now);

        assert!(pending.should_ignore("a", EntryStatus::Running, None, now));
        assert!(!pending.should_ignore("a", EntryStatus::Stopping, None, now));
        assert_eq!(pending.pending("a"), Some(PendingKind::RestartWait));
        assert!(!pending.should_ignore("a", EntryStatus::Starting, None, now));
        assert!(!pending.should_ignore("a", EntryStatus::Running, None, now));
        assert_eq!(pending.pending("a"), None);
    }

    #[test]
    fn restart_grace_runs_from_the_original_command() {
        let mut pending = PendingActions::new(Duration::from_secs(3));
        let issued = Instant::now();
        pending.record("a", CommandAction::Restart, Some(10), issued);

        let later = issued + Duration::from_secs(2);
        assert!(!pending.should_ignore("a", EntryStatus::Stopping, None, later));
        assert_eq!(pending.pending("a"), Some(PendingKind::RestartWait));

        let expired = issued + Duration::from_millis(3500);
        assert!(!pending.should_ignore("a", EntryStatus::Stopped, None, expired));
        assert_eq!(pending.pending("a"), None);
    }

    #[test]
    fn restart_settles_on_a_new_pid_without_a_visible_transition() {
        let mut pending = PendingActions::new(Duration::from_secs(3));
        let now = Instant::now();
        pending.record("a", CommandAction::Restart, Some(10), now);

        assert!(pending.should_ignore("a", EntryStatus::Running, Some(10), now));
        assert!(!pending.should_ignore("a", EntryStatus::Running, Some(11), now));
        assert_eq!(pending.pending("a"), None);
    }

    #[test]
    fn observed_restart_tracks_the_previous_pid() {
        let mut observed = ObservedState::new(Duration::from_secs(3));
        let now = Instant::now();
        observed.apply_snapshot(&snapshot_with_pid("a", EntryStatus::Running, Some(10)), now);

        observed.note_command("a", CommandAction::Restart, now);
        assert_eq!(observed.status("a"), Some(EntryStatus::Stopping));

        observed.apply_snapshot(&snapshot_with_pid("a", EntryStatus::Running, Some(10)), now);
        assert_eq!(observed.status("a"), Some(EntryStatus::Stopping));

        observed.apply_snapshot(&snapshot_with_pid("a", EntryStatus::Running, Some(11)), now);
        assert_eq!(observed.status("a"), Some(EntryStatus::Running));
    }

    #[test]
    fn records_expire_after_grace() {
        let mut pending = PendingActions::new(Duration::from_secs(3));
        let now = Instant::now();
        pending.record("a", CommandAction::Start, None, now);

        assert!(!pending.should_ignore("a", EntryStatus::Stopped, None, now + Duration::from_secs(4)));
        assert_eq!(pending.pending("a"), None);
    }

    #[test]
    fn bulk_actions_are_not_tracked() {
        let mut pending = PendingActions::default();
        pending.record("a", CommandAction::StopAll, None, Instant::now());
        assert_eq!(pending.pending("a"), None);
    }

    #[test]
    fn observed_state_holds_optimistic_status() {
        let mut observed = ObservedState::new(Duration::from_secs(3));
        let now = Instant::now();
        observed.apply_snapshot(&snapshot_with("a", EntryStatus::Stopped), now);

        observed.note_command("a", CommandAction::Start, now);
        assert_eq!(observed.status("a"), Some(EntryStatus::Starting));

        let changed = observed.apply_snapshot(&snapshot_with("a", EntryStatus::Stopped), now);
        assert!(changed.is_empty());
        assert_eq!(observed.status("a"), Some(EntryStatus::Starting));

        let changed = observed.apply_snapshot(&snapshot_with("a", EntryStatus::Running), now);
        assert_eq!(changed, vec!["a".to_string()]);
        assert_eq!(observed.status("a"), Some(EntryStatus::Running));
    }

    #[test]
    fn observer_reads_fresh_state_and_queues_commands() {
        let dir = tempdir().unwrap();
        let paths = RuntimePaths::new(dir.path());
        let observer = Observer::new(paths.clone());
        assert!(!observer.is_state_fresh());
        assert_eq!(observer.last_known_status("a"), EntryStatus::Stopped);

        crate::state::StatePublisher::new(paths.state_path())
            .publish(&snapshot_with("a", EntryStatus::Running))
            .unwrap();
        assert!(observer.is_state_fresh());
        assert_eq!(observer.last_known_status("a"), EntryStatus::Running);

        let command = observer
            .send_command(CommandAction::Stop, Some("a"))
            .unwrap();
        let queued = paths.commands_dir().join(format!("cmd-{}.json", command.id));
        assert!(queued.exists());
        assert!(observer.daemon_pid().is_none());
    }
}
