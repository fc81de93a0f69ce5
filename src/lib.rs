//! Combiner supervises a registry of user-defined programs on Unix-like systems. A
//! resident daemon owns the processes, adopts instances that were already running, and
//! restarts crashed entries, while short-lived observers talk to it through command files
//! and read back an atomically published state snapshot.

/// CLI interface.
pub mod cli;

/// Entry registry persistence.
pub mod config;

/// Paths, intervals and limits.
pub mod constants;

/// Per-entry state machine and process ownership.
pub mod daemon;

/// Error handling.
pub mod error;

/// Discovery of external processes matching an entry.
pub mod finder;

/// File command channel and daemon PID file.
pub mod ipc;

/// Turning an entry's command into an executable invocation.
pub mod launch;

/// Per-entry log files.
pub mod logs;

/// Network readiness probing.
pub mod network;

/// Observer helpers and the pending-action overlay.
pub mod observer;

/// Owned child processes.
pub mod process;

/// Data directory layout.
pub mod runtime;

/// Published state snapshot.
pub mod state;

/// Supervisor runtime that powers daemonised deployments.
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_utils;
