//! Constants and configuration values for the combiner daemon.
//!
//! This module centralizes the timing intervals, file names and size limits used
//! by the supervisor loop, the observers and the log store.

use std::time::Duration;

// ============================================================================
// File System Layout
// ============================================================================

/// Directory under `$HOME` used when no `--data-dir` override is given.
pub const DEFAULT_DATA_SUBDIR: &str = ".local/share/combiner";

/// Entry registry document.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Published state snapshot.
pub const STATE_FILE_NAME: &str = "state.json";

/// Text file holding the active daemon's process id.
pub const PID_FILE_NAME: &str = "daemon.pid";

/// Advisory lock held by the active daemon for its whole lifetime.
pub const LOCK_FILE_NAME: &str = "daemon.lock";

/// Operational log of the daemon itself.
pub const APP_LOG_FILE_NAME: &str = "app.log";

/// Mailbox directory for one-shot command files.
pub const COMMANDS_DIR_NAME: &str = "commands";

/// Directory holding one log file per entry.
pub const LOGS_DIR_NAME: &str = "logs";

/// Prefix shared by every command file name.
pub const COMMAND_FILE_PREFIX: &str = "cmd-";

/// Extension of a committed command file.
pub const COMMAND_FILE_EXT: &str = "json";

/// Extension of a command file that is still being written.
pub const COMMAND_TEMP_EXT: &str = "tmp";

// ============================================================================
// Supervisor Loop Timing
// ============================================================================

/// How often the command mailbox is drained.
pub const COMMAND_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How often a full state snapshot is published even without changes.
pub const STATE_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// Housekeeping tick: adopted-process liveness and cache pruning.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound for a single blocking wait on the loop's event channel.
pub const LOOP_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Delay before the first network readiness check after daemon start.
pub const AUTOSTART_INITIAL_DELAY: Duration = Duration::from_millis(300);

// ============================================================================
// Process Management Timing
// ============================================================================

/// Grace window between SIGTERM and a forced kill of the whole process tree.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_millis(1500);

/// Polling interval while waiting inside the grace window.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bound on waiting for a force-killed child to be reaped.
pub const FORCE_KILL_REAP_WAIT: Duration = Duration::from_millis(500);

/// Backoff before an autorestart-enabled crashed entry is started again.
pub const AUTORESTART_BACKOFF: Duration = Duration::from_secs(2);

/// Interval between network readiness re-checks while entries are waiting.
pub const NETWORK_RETRY_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// Inter-process Consistency
// ============================================================================

/// Commands issued more than this long before the daemon started are stale.
pub const STALE_COMMAND_SLACK: Duration = Duration::from_secs(2);

/// A snapshot older than this is treated as a leftover from a dead daemon.
pub const STATE_FRESHNESS_THRESHOLD: Duration = Duration::from_secs(5);

/// Observer-side window during which snapshot overwrites of a pending entry are ignored.
pub const PENDING_STATUS_GRACE: Duration = Duration::from_secs(3);

/// Liveness answers are reused for this long.
pub const LIVENESS_CACHE_TTL: Duration = Duration::from_secs(2);

/// Liveness cache size that triggers eviction.
pub const LIVENESS_CACHE_CAPACITY: usize = 256;

/// Number of oldest liveness records dropped once the cap is exceeded.
pub const LIVENESS_CACHE_EVICT: usize = 64;

// ============================================================================
// Log Store Limits
// ============================================================================

/// Size at which an entry log is rotated.
pub const LOG_ROTATE_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// Total number of log generations kept, the live file included.
pub const LOG_ROTATE_COUNT: usize = 3;

/// Trailing window read when tailing a log.
pub const LOG_TAIL_WINDOW_BYTES: u64 = 256 * 1024;

/// Default number of lines returned by a tail.
pub const LOG_MAX_LINES: usize = 300;

/// Read buffer used by the child output pumps.
pub const LOG_BUFFER_SIZE: usize = 8192;

// ============================================================================
// Child Environment
// ============================================================================

/// Marker variable set for every supervised child.
pub const CHILD_MARKER_VAR: &str = "COMBINER";

/// Variables consulted (in order) for an explicit Python interpreter.
pub const PYTHON_OVERRIDE_VARS: [&str; 2] = ["COMBINER_PYTHON", "PYTHON_EXE"];
