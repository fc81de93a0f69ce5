//! Command-line interface for Combiner.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::constants::LOG_MAX_LINES;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for Combiner.
#[derive(Parser, Debug)]
#[command(name = "combiner", version, author)]
#[command(
    about = "Supervises user-defined programs and keeps them running",
    long_about = None
)]
pub struct Cli {
    /// Run the supervisor loop instead of an observer command.
    #[arg(long, global = true)]
    pub daemon: bool,

    /// Detach from the terminal before running the supervisor (requires `--daemon`).
    #[arg(long, requires = "daemon")]
    pub detach: bool,

    /// Start enabled entries once the network is ready.
    #[arg(long, requires = "daemon")]
    pub autostart: bool,

    /// Skip the network readiness check before autostart.
    #[arg(long = "no-network-wait", requires = "daemon")]
    pub no_network_wait: bool,

    /// Override the data directory (defaults to `~/.local/share/combiner`).
    #[arg(long, value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The observer command to execute.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Observer commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask the daemon to start an entry.
    Start {
        /// Entry id.
        id: String,

        /// Block until the entry is running or the timeout passes.
        #[arg(long)]
        wait: bool,
    },

    /// Ask the daemon to stop an entry.
    Stop {
        /// Entry id.
        id: String,

        /// Block until the entry has stopped or the timeout passes.
        #[arg(long)]
        wait: bool,
    },

    /// Ask the daemon to restart an entry.
    Restart {
        /// Entry id.
        id: String,

        /// Block until the entry is running again or the timeout passes.
        #[arg(long)]
        wait: bool,
    },

    /// Start every enabled entry.
    StartEnabled,

    /// Stop every entry.
    StopAll,

    /// Make the daemon re-read the registry.
    Reload,

    /// Show entry statuses from the last published snapshot.
    Status {
        /// Emit the raw snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the tail of an entry's log.
    Logs {
        /// Entry id.
        id: String,

        /// Number of lines to show.
        #[arg(short, long, default_value_t = LOG_MAX_LINES)]
        lines: usize,
    },

    /// Truncate an entry's log.
    ClearLog {
        /// Entry id.
        id: String,
    },

    /// Register a new entry.
    Add {
        /// Display name.
        #[arg(long)]
        name: String,

        /// Command line or script path.
        #[arg(long)]
        cmd: String,

        /// Working directory.
        #[arg(long, default_value = "")]
        cwd: String,

        /// Extra arguments, split like a shell would.
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        args: String,

        /// Include the entry in start-enabled and autostart.
        #[arg(long)]
        enabled: bool,

        /// Leave the entry crashed instead of restarting it.
        #[arg(long = "no-autorestart")]
        no_autorestart: bool,

        /// Truncate the log every time the entry starts.
        #[arg(long = "clear-log-on-start")]
        clear_log_on_start: bool,
    },

    /// Remove an entry from the registry.
    Remove {
        /// Entry id.
        id: String,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
