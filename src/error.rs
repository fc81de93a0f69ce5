//! Error handling for combiner.
use thiserror::Error;

/// Defines all possible errors that can occur in the process manager.
#[derive(Debug, Error)]
pub enum ProcessManagerError {
    /// Error loading or saving the entry registry.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Error building a launch invocation.
    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    /// Error spawning an entry's process.
    #[error("Failed to start entry '{entry}': {source}")]
    EntryStartError {
        /// The entry id that failed to start.
        entry: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error stopping an entry's process.
    #[error("Failed to stop entry '{entry}': {source}")]
    EntryStopError {
        /// The entry id that failed to stop.
        entry: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Error type for entry registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Error reading or writing the registry document.
    #[error("Failed to access registry file: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing or writing the JSON registry document.
    #[error("Invalid registry JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Error parsing or writing a YAML registry document.
    #[error("Invalid registry YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The entry cannot be removed while its process is live.
    #[error("Entry '{id}' is still active; stop it before removing")]
    StillActive {
        /// Id of the entry.
        id: String,
    },

    /// No entry with this id exists.
    #[error("Entry '{0}' not found")]
    NotFound(String),

    /// An entry with this id already exists.
    #[error("Entry '{0}' already exists")]
    Duplicate(String),
}

/// Error type for PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading or writing the PID file.
    #[error("Failed to access PID file: {0}")]
    Io(#[from] std::io::Error),

    /// A different live daemon already owns the data directory.
    #[error("Another daemon is already running with pid {0}")]
    AlreadyRunning(u32),

    /// The advisory lock is held by another process.
    #[error("Daemon lock is held by another process")]
    Locked,
}

/// Errors raised by the command mailbox helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Error reading or writing a command file.
    #[error("command channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Error serialising a command.
    #[error("failed to serialise command: {0}")]
    Serde(#[from] serde_json::Error),

    /// The command needs a target entry id.
    #[error("action '{0}' requires a target entry")]
    MissingTarget(String),
}

/// Error type for log store operations.
#[derive(Debug, Error)]
pub enum LogStoreError {
    /// Error reading, writing or rotating an entry log.
    #[error("Failed to access entry log: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for external process discovery and termination.
#[derive(Debug, Error)]
pub enum FinderError {
    /// Error signalling a process.
    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        /// The process that could not be signalled.
        pid: u32,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },
}

/// Error type for launch resolution.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The command string is empty after trimming.
    #[error("entry command is empty")]
    EmptyCommand,

    /// The command string could not be tokenised.
    #[error("could not parse command line: {0}")]
    Unparsable(String),

    /// No interpreter could be located for a script.
    #[error("no interpreter found for '{0}'")]
    InterpreterNotFound(String),
}
