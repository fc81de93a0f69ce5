//! External process discovery, tree termination and liveness checks.
//!
//! Matching is a best-effort substring heuristic behind the [`ProcessMatcher`] trait so a
//! stricter matcher can be swapped in without touching the supervisor.
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid as NixPid,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::Path,
    time::{Duration, Instant},
};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

use crate::{
    constants::{LIVENESS_CACHE_CAPACITY, LIVENESS_CACHE_EVICT, LIVENESS_CACHE_TTL},
    error::FinderError,
};

/// Minimal view of one OS process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    /// Space-joined argv.
    pub cmdline: String,
    /// Exited but not yet reaped, or otherwise dead.
    pub defunct: bool,
}

/// OS process-table collaborator.
pub trait ProcessTable: Send {
    /// Every visible process. Failures yield an empty list.
    fn snapshot(&mut self) -> Vec<ProcessInfo>;

    /// Sends a signal to one pid. A vanished pid is not an error.
    fn signal(&mut self, pid: u32, signal: Signal) -> Result<(), FinderError>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// A pid `kill(2)` addresses as one process. Zero and values past `i32::MAX` would
/// address a process group instead.
fn single_pid(pid: u32) -> Option<NixPid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(NixPid::from_raw)
}

/// Probes a pid with signal 0. `EPERM` means the process exists under another user.
pub fn is_pid_alive(pid: u32) -> bool {
    let Some(target) = single_pid(pid) else {
        return false;
    };
    match signal::kill(target, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// [`ProcessTable`] backed by `sysinfo` and `nix` signals.
pub struct SysinfoProcessTable {
    system: System,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn snapshot(&mut self) -> Vec<ProcessInfo> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        self.system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                parent: process.parent().map(|parent| parent.as_u32()),
                cmdline: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" "),
                defunct: matches!(
                    process.status(),
                    ProcessStatus::Zombie | ProcessStatus::Dead
                ),
            })
            .collect()
    }

    fn signal(&mut self, pid: u32, sig: Signal) -> Result<(), FinderError> {
        let Some(target) = single_pid(pid) else {
            return Ok(());
        };
        match signal::kill(target, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(FinderError::Signal { pid, source }),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        if !is_pid_alive(pid) {
            return false;
        }
        self.system
            .process(Pid::from_u32(pid))
            .map(|process| !matches!(process.status(), ProcessStatus::Zombie))
            .unwrap_or(true)
    }
}

/// Decides whether a process belongs to an entry.
pub trait ProcessMatcher: Send {
    fn matches(&self, process: &ProcessInfo, cmd: &str, cwd: &str) -> bool;
}

/// Command line contains the command, its base name or the working directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubstringMatcher;

impl ProcessMatcher for SubstringMatcher {
    fn matches(&self, process: &ProcessInfo, cmd: &str, cwd: &str) -> bool {
        let cmd = cmd.trim();
        if !cmd.is_empty() {
            if process.cmdline.contains(cmd) {
                return true;
            }
            if let Some(base) = Path::new(cmd).file_name().and_then(|name| name.to_str())
                && !base.is_empty()
                && process.cmdline.contains(base)
            {
                return true;
            }
        }

        // A bare "/" would match nearly every command line.
        let cwd = cwd.trim().trim_end_matches('/');
        !cwd.is_empty() && process.cmdline.contains(cwd)
    }
}

/// Outcome of a pre-launch search.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FindResult {
    /// Live matching processes, candidates for adoption.
    pub alive: Vec<u32>,
    /// Defunct matching processes whose trees should be cleaned up.
    pub leftovers: Vec<u32>,
}

impl FindResult {
    pub fn is_empty(&self) -> bool {
        self.alive.is_empty() && self.leftovers.is_empty()
    }
}

/// Process-table queries on behalf of the supervisor.
pub struct ProcessFinder {
    table: Box<dyn ProcessTable>,
    matcher: Box<dyn ProcessMatcher>,
}

impl ProcessFinder {
    pub fn new(table: Box<dyn ProcessTable>, matcher: Box<dyn ProcessMatcher>) -> Self {
        Self { table, matcher }
    }

    /// Finder over the live OS process table with substring matching.
    pub fn system() -> Self {
        Self::new(
            Box::new(SysinfoProcessTable::new()),
            Box::new(SubstringMatcher),
        )
    }

    /// Matching processes outside `exclude`, this process and their descendants.
    pub fn find(&mut self, cmd: &str, cwd: &str, exclude: &HashSet<u32>) -> FindResult {
        let processes = self.table.snapshot();
        let own_pid = std::process::id();

        let mut roots: Vec<u32> = exclude.iter().copied().collect();
        roots.push(own_pid);
        let excluded = descendants_of(&processes, &roots);

        let mut result = FindResult::default();
        for process in &processes {
            if excluded.contains(&process.pid) || !self.matcher.matches(process, cmd, cwd) {
                continue;
            }
            if process.defunct {
                result.leftovers.push(process.pid);
            } else {
                result.alive.push(process.pid);
            }
        }
        result.alive.sort_unstable();
        result.leftovers.sort_unstable();
        debug!(
            "Finder matched {} live and {} defunct processes for '{cmd}'",
            result.alive.len(),
            result.leftovers.len()
        );
        result
    }

    /// Force-kills `pid` and every descendant, deepest first.
    pub fn kill_tree(&mut self, pid: u32) -> Result<(), FinderError> {
        let processes = self.table.snapshot();
        let mut tree: Vec<u32> = descendants_of(&processes, &[pid]).into_iter().collect();
        tree.retain(|candidate| *candidate != pid);
        tree.sort_by_key(|candidate| std::cmp::Reverse(depth(&processes, *candidate, pid)));

        let mut first_error = None;
        for child in tree {
            if let Err(err) = self.table.signal(child, Signal::SIGKILL) {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.table.signal(pid, Signal::SIGKILL) {
            first_error.get_or_insert(err);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Sends one signal to one process.
    pub fn signal(&mut self, pid: u32, sig: Signal) -> Result<(), FinderError> {
        self.table.signal(pid, sig)
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.table.is_alive(pid)
    }
}

/// `roots` plus every process whose ancestry reaches one of them.
fn descendants_of(processes: &[ProcessInfo], roots: &[u32]) -> HashSet<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for process in processes {
        if let Some(parent) = process.parent {
            children.entry(parent).or_default().push(process.pid);
        }
    }

    let mut seen: HashSet<u32> = roots.iter().copied().collect();
    let mut queue: VecDeque<u32> = roots.iter().copied().collect();
    while let Some(pid) = queue.pop_front() {
        for child in children.get(&pid).into_iter().flatten() {
            if seen.insert(*child) {
                queue.push_back(*child);
            }
        }
    }
    seen
}

fn depth(processes: &[ProcessInfo], pid: u32, root: u32) -> usize {
    let parents: HashMap<u32, u32> = processes
        .iter()
        .filter_map(|process| process.parent.map(|parent| (process.pid, parent)))
        .collect();
    let mut depth = 0;
    let mut current = pid;
    while current != root {
        match parents.get(&current) {
            Some(parent) if depth < processes.len() => {
                current = *parent;
                depth += 1;
            }
            _ => break,
        }
    }
    depth
}

/// Short-lived memo of pid liveness answers, bounded in size.
#[derive(Debug)]
pub struct LivenessCache {
    ttl: Duration,
    capacity: usize,
    evict: usize,
    records: HashMap<u32, (bool, Instant)>,
}

impl Default for LivenessCache {
    fn default() -> Self {
        Self::new(LIVENESS_CACHE_TTL, LIVENESS_CACHE_CAPACITY, LIVENESS_CACHE_EVICT)
    }
}

impl LivenessCache {
    pub fn new(ttl: Duration, capacity: usize, evict: usize) -> Self {
        Self {
            ttl,
            capacity,
            evict: evict.max(1),
            records: HashMap::new(),
        }
    }

    /// Cached answer for `pid`, calling `probe` when missing or expired.
    pub fn check_with(
        &mut self,
        pid: u32,
        now: Instant,
        probe: impl FnOnce(u32) -> bool,
    ) -> bool {
        if let Some((alive, at)) = self.records.get(&pid)
            && now.saturating_duration_since(*at) < self.ttl
        {
            return *alive;
        }

        let alive = probe(pid);
        self.records.insert(pid, (alive, now));
        if self.records.len() > self.capacity {
            self.evict_oldest();
        }
        alive
    }

    pub fn is_alive(&mut self, pid: u32) -> bool {
        self.check_with(pid, Instant::now(), is_pid_alive)
    }

    pub fn invalidate(&mut self, pid: u32) {
        self.records.remove(&pid);
    }

    /// Drops expired records.
    pub fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.records
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < ttl);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn evict_oldest(&mut self) {
        let mut by_age: Vec<(u32, Instant)> = self
            .records
            .iter()
            .map(|(pid, (_, at))| (*pid, *at))
            .collect();
        by_age.sort_by_key(|(pid, at)| (*at, *pid));
        for (pid, _) in by_age.into_iter().take(self.evict) {
            self.records.remove(&pid);
        }
    }
}
