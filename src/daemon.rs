//! The process supervisor: entry runtime state and lifecycle transitions.
//!
//! All entry mutation happens on the thread that owns the [`Daemon`]. Child output is
//! pumped by background threads into a channel drained by [`Daemon::run_once`]; exits are
//! detected by polling owned children, and timers (autorestart backoff, network retry)
//! are cancelled by re-checking entry flags when they fire.
use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    os::unix::process::ExitStatusExt,
    process::ExitStatus,
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread,
    time::{Duration, Instant},
};

use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::{
    config::{EntryConfig, Registry, capture_env_snapshot},
    constants::{
        AUTORESTART_BACKOFF, CHILD_MARKER_VAR, NETWORK_RETRY_INTERVAL, STOP_GRACE_PERIOD,
        STOP_POLL_INTERVAL,
    },
    error::ProcessManagerError,
    finder::{LivenessCache, ProcessFinder},
    launch::resolve_program,
    logs::LogStore,
    network::NetworkProbe,
    process::{ChildOutput, OwnedChild},
    state::{EntrySnapshot, EntryStatus, StateSnapshot},
};

/// Which OS process, if any, currently is the entry. Ownership is exclusive.
#[derive(Debug, Default)]
pub enum Ownership {
    #[default]
    None,
    /// Spawned by this daemon.
    Owned(OwnedChild),
    /// Found already running and recognised as the entry.
    Adopted(u32),
}

impl Ownership {
    pub fn pid(&self) -> Option<u32> {
        match self {
            Ownership::None => None,
            Ownership::Owned(child) => Some(child.pid()),
            Ownership::Adopted(pid) => Some(*pid),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Ownership::None)
    }
}

/// Runtime-only state of one entry. Never persisted.
#[derive(Debug, Default)]
pub struct EntryRuntime {
    pub status: EntryStatus,
    pub ownership: Ownership,
    /// Stop was requested; suppresses autorestart.
    pub stopping: bool,
    pub restart_pending: bool,
    pub waiting_network: bool,
    generation: u64,
}

/// A supervised entry.
#[derive(Debug)]
pub struct Entry {
    pub config: EntryConfig,
    pub runtime: EntryRuntime,
}

impl Entry {
    /// Wraps configuration with fresh runtime state (`stopped`).
    pub fn new(config: EntryConfig) -> Self {
        Self {
            config,
            runtime: EntryRuntime::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn status(&self) -> EntryStatus {
        self.runtime.status
    }

    pub fn owned_pid(&self) -> Option<u32> {
        match &self.runtime.ownership {
            Ownership::Owned(child) => Some(child.pid()),
            _ => None,
        }
    }

    pub fn adopted_pid(&self) -> Option<u32> {
        match &self.runtime.ownership {
            Ownership::Adopted(pid) => Some(*pid),
            _ => None,
        }
    }

    pub fn os_pid(&self) -> Option<u32> {
        self.runtime.ownership.pid()
    }

    fn shares_identity_with(&self, other: &EntryConfig) -> bool {
        let same_cmd = !self.config.cmd.trim().is_empty()
            && self.config.cmd.trim() == other.cmd.trim();
        let same_cwd = !self.config.cwd.trim().is_empty()
            && self.config.cwd.trim() == other.cwd.trim();
        same_cmd || same_cwd
    }
}

/// Tunable delays. Defaults come from `constants`.
#[derive(Debug, Clone, Copy)]
pub struct DaemonTiming {
    pub stop_grace: Duration,
    pub autorestart_backoff: Duration,
    pub network_retry: Duration,
}

impl Default for DaemonTiming {
    fn default() -> Self {
        Self {
            stop_grace: STOP_GRACE_PERIOD,
            autorestart_backoff: AUTORESTART_BACKOFF,
            network_retry: NETWORK_RETRY_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Timer {
    Autorestart(String),
    NetworkRetry,
}

#[derive(Debug)]
struct Scheduled {
    due: Instant,
    timer: Timer,
}

/// Authoritative owner of every entry's runtime state.
pub struct Daemon {
    entries: Vec<Entry>,
    logs: LogStore,
    finder: ProcessFinder,
    liveness: LivenessCache,
    network: Box<dyn NetworkProbe>,
    env_snapshot: BTreeMap<String, String>,
    timing: DaemonTiming,
    output_tx: Sender<ChildOutput>,
    output_rx: Receiver<ChildOutput>,
    confirmations: VecDeque<(String, u64)>,
    timers: Vec<Scheduled>,
    dirty: bool,
}

impl Daemon {
    pub fn new(
        configs: Vec<EntryConfig>,
        logs: LogStore,
        finder: ProcessFinder,
        network: Box<dyn NetworkProbe>,
    ) -> Self {
        let (output_tx, output_rx) = mpsc::channel();
        Self {
            entries: configs.into_iter().map(Entry::new).collect(),
            logs,
            finder,
            liveness: LivenessCache::default(),
            network,
            env_snapshot: BTreeMap::new(),
            timing: DaemonTiming::default(),
            output_tx,
            output_rx,
            confirmations: VecDeque::new(),
            timers: Vec::new(),
            dirty: true,
        }
    }

    pub fn with_timing(mut self, timing: DaemonTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Environment handed to children. Empty means inherit the daemon's own.
    pub fn set_env_snapshot(&mut self, snapshot: BTreeMap<String, String>) {
        self.env_snapshot = snapshot;
    }

    pub fn set_network_probe(&mut self, probe: Box<dyn NetworkProbe>) {
        self.network = probe;
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn entry(&self, id: &str) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.config.id == id)
    }

    fn entry_mut(&mut self, id: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|entry| entry.config.id == id)
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    /// Returns and clears the "state changed since last publish" flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn set_status(&mut self, id: &str, status: EntryStatus) {
        if let Some(entry) = self.entry_mut(id)
            && entry.runtime.status != status
        {
            debug!("Entry '{id}': {} -> {status}", entry.runtime.status);
            entry.runtime.status = status;
            self.dirty = true;
        }
    }

    /// Full snapshot of every entry.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(
            self.entries
                .iter()
                .map(|entry| EntrySnapshot {
                    id: entry.config.id.clone(),
                    name: entry.config.name.clone(),
                    status: entry.runtime.status,
                    os_pid: entry.os_pid(),
                })
                .collect(),
        )
    }

    fn child_env(&self) -> BTreeMap<String, String> {
        let mut env = if self.env_snapshot.is_empty() {
            capture_env_snapshot()
        } else {
            self.env_snapshot.clone()
        };
        env.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
        env.insert(CHILD_MARKER_VAR.to_string(), "1".to_string());
        env
    }

    /// Pids of every process currently tracked by any entry.
    fn tracked_pids(&self) -> HashSet<u32> {
        self.entries.iter().filter_map(Entry::os_pid).collect()
    }

    fn has_conflict(&self, id: &str) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        self.entries.iter().any(|other| {
            other.config.id != id
                && other.runtime.status == EntryStatus::Running
                && other.shares_identity_with(&entry.config)
        })
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        let finder = &self.finder;
        self.liveness
            .check_with(pid, Instant::now(), |pid| finder.is_alive(pid))
    }

    /// Starts an entry: adopts a matching live process or spawns a new one.
    ///
    /// A no-op when the entry already has a process, is being stopped, or has no command.
    pub fn start_entry(&mut self, id: &str) {
        let Some(entry) = self.entry(id) else {
            warn!("Start requested for unknown entry '{id}'");
            return;
        };
        if entry.runtime.stopping {
            debug!("Entry '{id}' is stopping; ignoring start");
            return;
        }
        if !entry.runtime.ownership.is_none()
            || matches!(entry.runtime.status, EntryStatus::Running | EntryStatus::Starting)
        {
            debug!("Entry '{id}' already has a process; ignoring start");
            return;
        }
        if entry.config.cmd.trim().is_empty() {
            warn!("Entry '{id}' has no command; ignoring start");
            self.logs.append_line(id, "Cannot start: command is empty");
            return;
        }

        let config = entry.config.clone();
        if let Some(entry) = self.entry_mut(id) {
            entry.runtime.waiting_network = false;
        }

        if self.has_conflict(id) {
            debug!("Entry '{id}' shares its command or directory with a running entry; skipping process search");
        } else {
            let exclude = self.tracked_pids();
            let found = self.finder.find(&config.cmd, &config.cwd, &exclude);

            let mut adopted = None;
            for pid in &found.alive {
                if self.is_alive(*pid) {
                    adopted = Some(*pid);
                    break;
                }
            }
            if let Some(pid) = adopted {
                self.adopt(id, pid);
                return;
            }

            for pid in found.leftovers {
                info!("Killing leftover process tree {pid} for entry '{id}'");
                if let Err(err) = self.finder.kill_tree(pid) {
                    warn!("Failed to clean up leftover {pid} for entry '{id}': {err}");
                }
                self.liveness.invalidate(pid);
            }
        }

        self.spawn(&config);
    }

    fn adopt(&mut self, id: &str, pid: u32) {
        if let Some(entry) = self.entry_mut(id) {
            entry.runtime.ownership = Ownership::Adopted(pid);
        }
        self.set_status(id, EntryStatus::Running);
        info!("Entry '{id}' adopted running process {pid}");
        self.logs
            .append_line(id, &format!("Adopted running process (PID {pid})"));
    }

    fn spawn(&mut self, config: &EntryConfig) {
        let id = config.id.as_str();

        if config.clear_log_on_start
            && let Err(err) = self.logs.clear(id)
        {
            warn!("Failed to clear log for entry '{id}': {err}");
        }

        let env = self.child_env();
        let spec = match resolve_program(&config.cmd, &config.args, &config.cwd, &env) {
            Ok(spec) => spec,
            Err(err) => {
                let err = ProcessManagerError::from(err);
                self.fail_spawn(id, &err.to_string());
                return;
            }
        };

        self.set_status(id, EntryStatus::Starting);
        self.logs.append_line(
            id,
            &format!("Starting: {} {}", spec.program, spec.args.join(" ")),
        );

        match OwnedChild::spawn(id, &spec, &config.cwd, &env, self.output_tx.clone()) {
            Ok(child) => {
                let pid = child.pid();
                let generation = match self.entry_mut(id) {
                    Some(entry) => {
                        entry.runtime.generation += 1;
                        entry.runtime.ownership = Ownership::Owned(child);
                        entry.runtime.generation
                    }
                    None => return,
                };
                self.dirty = true;
                self.confirmations.push_back((id.to_string(), generation));
                info!("Entry '{id}' spawned with PID {pid}");
            }
            Err(err) => {
                let err = ProcessManagerError::EntryStartError {
                    entry: id.to_string(),
                    source: err,
                };
                self.fail_spawn(id, &err.to_string());
            }
        }
    }

    fn fail_spawn(&mut self, id: &str, reason: &str) {
        warn!("Entry '{id}' failed to start: {reason}");
        self.logs
            .append_line(id, &format!("Failed to start: {reason}"));
        self.set_status(id, EntryStatus::Stopped);
    }

    /// Explicit stop. Always ends in `stopped`.
    pub fn stop_entry(&mut self, id: &str) {
        let Some(entry) = self.entry_mut(id) else {
            warn!("Stop requested for unknown entry '{id}'");
            return;
        };
        entry.runtime.restart_pending = false;
        self.stop_inner(id);
    }

    fn stop_inner(&mut self, id: &str) {
        let Some(entry) = self.entry_mut(id) else {
            return;
        };
        entry.runtime.waiting_network = false;

        match std::mem::take(&mut entry.runtime.ownership) {
            Ownership::Owned(mut child) => {
                entry.runtime.stopping = true;
                self.set_status(id, EntryStatus::Stopping);
                let pid = child.pid();
                info!("Stopping entry '{id}' (PID {pid})");

                let exit = match child.terminate(self.timing.stop_grace, &mut self.finder) {
                    Ok(exit) => exit,
                    Err(err) => {
                        let err = ProcessManagerError::EntryStopError {
                            entry: id.to_string(),
                            source: err,
                        };
                        warn!("{err}");
                        None
                    }
                };
                self.liveness.invalidate(pid);
                self.handle_exit(id, exit);
            }
            Ownership::Adopted(pid) => {
                entry.runtime.stopping = true;
                self.set_status(id, EntryStatus::Stopping);
                info!("Stopping adopted process {pid} of entry '{id}'");
                self.terminate_external(pid);
                self.finish_external_stop(id, Some(pid));
            }
            Ownership::None => {
                let config = entry.config.clone();
                if !self.has_conflict(id) {
                    let exclude = self.tracked_pids();
                    let found = self.finder.find(&config.cmd, &config.cwd, &exclude);
                    for pid in found.alive.into_iter().chain(found.leftovers) {
                        info!("Killing stray process tree {pid} for entry '{id}'");
                        if let Err(err) = self.finder.kill_tree(pid) {
                            warn!("Failed to kill {pid} for entry '{id}': {err}");
                        }
                        self.liveness.invalidate(pid);
                    }
                }
                self.finish_external_stop(id, None);
            }
        }
    }

    /// SIGTERM, bounded wait, then a tree kill. For processes this daemon cannot reap.
    fn terminate_external(&mut self, pid: u32) {
        if let Err(err) = self.finder.signal(pid, Signal::SIGTERM) {
            debug!("SIGTERM to {pid} failed: {err}");
        }
        let deadline = Instant::now() + self.timing.stop_grace;
        while Instant::now() < deadline && self.finder.is_alive(pid) {
            thread::sleep(STOP_POLL_INTERVAL);
        }
        if self.finder.is_alive(pid) {
            warn!("Process {pid} ignored SIGTERM; killing its tree");
        }
        if let Err(err) = self.finder.kill_tree(pid) {
            warn!("Failed to kill process tree {pid}: {err}");
        }
        self.liveness.invalidate(pid);
    }

    fn finish_external_stop(&mut self, id: &str, pid: Option<u32>) {
        if let Some(entry) = self.entry_mut(id) {
            entry.runtime.ownership = Ownership::None;
            entry.runtime.stopping = false;
        }
        let was_idle = self
            .entry(id)
            .is_some_and(|entry| entry.runtime.status == EntryStatus::Stopped);
        self.set_status(id, EntryStatus::Stopped);
        if let Some(pid) = pid {
            self.logs
                .append_line(id, &format!("Stopped (PID {pid})"));
        } else if !was_idle {
            self.logs.append_line(id, "Stopped");
        }
        self.after_stopped(id);
    }

    /// Restart: a running owned process is stopped and started again right after it exits.
    pub fn restart_entry(&mut self, id: &str) {
        let Some(entry) = self.entry_mut(id) else {
            warn!("Restart requested for unknown entry '{id}'");
            return;
        };
        if matches!(entry.runtime.ownership, Ownership::Owned(_)) {
            entry.runtime.restart_pending = true;
            self.stop_inner(id);
        } else {
            entry.runtime.restart_pending = false;
            self.stop_inner(id);
            self.start_entry(id);
        }
    }

    pub fn start_enabled(&mut self) {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.config.enabled)
            .map(|entry| entry.config.id.clone())
            .collect();
        for id in ids {
            self.start_entry(&id);
        }
    }

    /// Stops every entry that has a process or is not already stopped.
    pub fn stop_all(&mut self) {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| {
                !entry.runtime.ownership.is_none()
                    || entry.runtime.status != EntryStatus::Stopped
            })
            .map(|entry| entry.config.id.clone())
            .collect();
        for id in ids {
            self.stop_entry(&id);
        }
    }

    /// Applies a freshly loaded configuration list.
    ///
    /// Removed entries are stopped and dropped, existing ones get their configuration
    /// replaced in place, and new ones are appended as `stopped`.
    pub fn apply_configs(&mut self, configs: Vec<EntryConfig>) {
        let wanted: HashSet<&str> = configs.iter().map(|config| config.id.as_str()).collect();
        let removed: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !wanted.contains(entry.config.id.as_str()))
            .map(|entry| entry.config.id.clone())
            .collect();
        for id in &removed {
            info!("Entry '{id}' removed from configuration; stopping");
            if self.entry(id).is_some_and(|entry| !entry.runtime.ownership.is_none()) {
                self.stop_entry(id);
            }
        }
        self.entries
            .retain(|entry| !removed.contains(&entry.config.id));

        for config in configs {
            match self.entry_mut(&config.id) {
                Some(entry) => entry.config.apply(&config),
                None => {
                    info!("Entry '{}' added", config.id);
                    self.entries.push(Entry::new(config));
                }
            }
        }
        self.dirty = true;
    }

    /// Re-reads the registry from disk and applies it.
    pub fn reload(&mut self, registry_path: &std::path::Path) -> Result<(), ProcessManagerError> {
        let registry = Registry::load(registry_path)?;
        self.env_snapshot = registry.env_snapshot().clone();
        self.apply_configs(registry.into_entries());
        info!("Configuration reloaded ({} entries)", self.entries.len());
        Ok(())
    }

    /// Starts enabled entries once the network is ready, deferring them as `waiting` otherwise.
    pub fn autostart(&mut self) {
        if self.network.is_ready() {
            for entry in &mut self.entries {
                entry.runtime.waiting_network = false;
            }
            self.start_enabled();
            return;
        }

        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| {
                entry.config.enabled
                    && entry.runtime.ownership.is_none()
                    && matches!(
                        entry.runtime.status,
                        EntryStatus::Stopped | EntryStatus::Crashed | EntryStatus::Waiting
                    )
            })
            .map(|entry| entry.config.id.clone())
            .collect();
        if ids.is_empty() {
            return;
        }

        info!(
            "Network not ready; deferring {} enabled entries for {:?}",
            ids.len(),
            self.timing.network_retry
        );
        for id in &ids {
            if let Some(entry) = self.entry_mut(id) {
                entry.runtime.waiting_network = true;
            }
            self.set_status(id, EntryStatus::Waiting);
        }
        self.schedule(self.timing.network_retry, Timer::NetworkRetry);
    }

    fn retry_network_wait(&mut self) {
        let waiting: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.runtime.waiting_network)
            .map(|entry| entry.config.id.clone())
            .collect();
        if waiting.is_empty() {
            return;
        }

        if !self.network.is_ready() {
            debug!("Network still not ready; {} entries waiting", waiting.len());
            self.schedule(self.timing.network_retry, Timer::NetworkRetry);
            return;
        }

        info!("Network ready; starting {} waiting entries", waiting.len());
        for id in waiting {
            if let Some(entry) = self.entry_mut(&id) {
                entry.runtime.waiting_network = false;
            }
            self.set_status(&id, EntryStatus::Stopped);
            self.start_entry(&id);
        }
    }

    /// Arms `timer`, moving its deadline if it is already pending.
    fn schedule(&mut self, delay: Duration, timer: Timer) {
        let due = Instant::now() + delay;
        match self.timers.iter_mut().find(|scheduled| scheduled.timer == timer) {
            Some(scheduled) => scheduled.due = due,
            None => self.timers.push(Scheduled { due, timer }),
        }
    }

    /// Records the exit of an owned child and applies restart policy.
    fn handle_exit(&mut self, id: &str, exit: Option<ExitStatus>) {
        let Some(entry) = self.entry_mut(id) else {
            return;
        };
        entry.runtime.ownership = Ownership::None;
        let requested = std::mem::take(&mut entry.runtime.stopping);
        let autorestart = entry.config.autorestart;

        let clean = exit.is_some_and(|status| status.success());
        let status = if requested || clean {
            EntryStatus::Stopped
        } else {
            EntryStatus::Crashed
        };
        self.set_status(id, status);

        let description = describe_exit(exit);
        if status == EntryStatus::Crashed {
            warn!("Entry '{id}' crashed: {description}");
            self.logs.append_line(id, &format!("Crashed: {description}"));
        } else {
            info!("Entry '{id}' stopped: {description}");
            self.logs.append_line(id, &format!("Stopped: {description}"));
        }

        if status == EntryStatus::Crashed && autorestart && !self.restart_is_pending(id) {
            debug!(
                "Entry '{id}' will restart in {:?}",
                self.timing.autorestart_backoff
            );
            self.schedule(
                self.timing.autorestart_backoff,
                Timer::Autorestart(id.to_string()),
            );
        }
        self.after_stopped(id);
    }

    fn restart_is_pending(&self, id: &str) -> bool {
        self.entry(id)
            .is_some_and(|entry| entry.runtime.restart_pending)
    }

    fn after_stopped(&mut self, id: &str) {
        let Some(entry) = self.entry_mut(id) else {
            return;
        };
        if std::mem::take(&mut entry.runtime.restart_pending) {
            info!("Restarting entry '{id}'");
            self.start_entry(id);
        }
    }

    /// Promotes confirmed spawns from `starting` to `running`.
    fn confirm_starts(&mut self) {
        while let Some((id, generation)) = self.confirmations.pop_front() {
            let confirmed = self.entry(&id).is_some_and(|entry| {
                entry.runtime.generation == generation
                    && entry.runtime.status == EntryStatus::Starting
                    && matches!(entry.runtime.ownership, Ownership::Owned(_))
            });
            if confirmed {
                self.set_status(&id, EntryStatus::Running);
                self.logs.append_line(&id, "Started");
            }
        }
    }

    fn drain_output(&mut self, first: Option<ChildOutput>) {
        let mut next = first;
        while let Some(output) = next {
            if let Err(err) = self.logs.append(&output.id, &output.text) {
                warn!("Failed to write output of entry '{}': {err}", output.id);
            }
            next = self.output_rx.try_recv().ok();
        }
    }

    fn reap_children(&mut self) {
        let mut exited = Vec::new();
        for entry in &mut self.entries {
            if let Ownership::Owned(child) = &mut entry.runtime.ownership {
                match child.try_wait() {
                    Ok(Some(status)) => exited.push((entry.config.id.clone(), Some(status))),
                    Ok(None) => {}
                    Err(err) => {
                        warn!("Lost track of entry '{}': {err}", entry.config.id);
                        exited.push((entry.config.id.clone(), None));
                    }
                }
            }
        }
        for (id, status) in exited {
            self.handle_exit(&id, status);
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.timers)
            .into_iter()
            .partition(|scheduled| scheduled.due <= now);
        self.timers = pending;

        for scheduled in due {
            match scheduled.timer {
                Timer::Autorestart(id) => {
                    let eligible = self.entry(&id).is_some_and(|entry| {
                        entry.runtime.status == EntryStatus::Crashed
                            && entry.config.autorestart
                            && !entry.runtime.stopping
                            && entry.runtime.ownership.is_none()
                    });
                    if eligible {
                        info!("Autorestarting entry '{id}'");
                        self.start_entry(&id);
                    }
                }
                Timer::NetworkRetry => self.retry_network_wait(),
            }
        }
    }

    fn next_timer_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers
            .iter()
            .map(|scheduled| scheduled.due.saturating_duration_since(now))
            .min()
    }

    /// One loop iteration: confirms starts, pumps output, reaps exits and fires timers.
    ///
    /// Blocks for at most `max_wait` (less when a timer falls due sooner).
    pub fn run_once(&mut self, max_wait: Duration) {
        self.confirm_starts();

        let wait = self
            .next_timer_in()
            .map_or(max_wait, |next| next.min(max_wait));
        let wait = if self.confirmations.is_empty() {
            wait
        } else {
            Duration::ZERO
        };
        match self.output_rx.recv_timeout(wait) {
            Ok(output) => self.drain_output(Some(output)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }

        self.reap_children();
        self.fire_due_timers();
    }

    /// Periodic checks: adopted processes that vanished are marked `stopped`.
    pub fn housekeeping(&mut self) {
        let now = Instant::now();
        self.liveness.prune(now);

        let adopted: Vec<(String, u32)> = self
            .entries
            .iter()
            .filter_map(|entry| entry.adopted_pid().map(|pid| (entry.config.id.clone(), pid)))
            .collect();
        for (id, pid) in adopted {
            if !self.is_alive(pid) {
                info!("Adopted process {pid} of entry '{id}' is gone");
                if let Some(entry) = self.entry_mut(&id) {
                    entry.runtime.ownership = Ownership::None;
                }
                self.set_status(&id, EntryStatus::Stopped);
                self.logs
                    .append_line(&id, &format!("Process exited (PID {pid})"));
            }
        }
    }

    /// Stops everything and drains any output still in flight.
    pub fn shutdown(&mut self) {
        self.timers.clear();
        self.stop_all();
        self.drain_output(self.output_rx.try_recv().ok());
    }
}

fn describe_exit(exit: Option<ExitStatus>) -> String {
    match exit {
        None => "exit status unknown".to_string(),
        Some(status) => match (status.code(), status.signal()) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => Signal::try_from(signal)
                .map(|sig| format!("killed by {sig}"))
                .unwrap_or_else(|_| format!("killed by signal {signal}")),
            (None, None) => "terminated".to_string(),
        },
    }
}
