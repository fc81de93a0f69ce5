//! Runtime paths under the data directory.
use std::{
    env, fs, io,
    path::{Path, PathBuf},
    sync::{OnceLock, RwLock},
};

use crate::constants::{
    APP_LOG_FILE_NAME, COMMANDS_DIR_NAME, CONFIG_FILE_NAME, DEFAULT_DATA_SUBDIR,
    LOCK_FILE_NAME, LOGS_DIR_NAME, PID_FILE_NAME, STATE_FILE_NAME,
};

/// Every file the daemon and its observers share, rooted at one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    data_dir: PathBuf,
}

impl RuntimePaths {
    /// Roots the layout at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// `$HOME/.local/share/combiner`, or `/` based when `HOME` is unset.
    pub fn from_home() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::new(home.join(DEFAULT_DATA_SUBDIR))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE_NAME)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE_NAME)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join(PID_FILE_NAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE_NAME)
    }

    pub fn app_log_path(&self) -> PathBuf {
        self.data_dir.join(APP_LOG_FILE_NAME)
    }

    pub fn commands_dir(&self) -> PathBuf {
        self.data_dir.join(COMMANDS_DIR_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join(LOGS_DIR_NAME)
    }

    /// Creates the data, command and log directories.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(self.commands_dir())?;
        fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self::from_home()
    }
}

static CONTEXT: OnceLock<RwLock<RuntimePaths>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimePaths> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimePaths::from_home()))
}

/// Sets the process-wide data directory. `None` falls back to the home layout.
pub fn init(data_dir: Option<PathBuf>) {
    let paths = data_dir
        .map(RuntimePaths::new)
        .unwrap_or_else(RuntimePaths::from_home);
    let mut guard = context_lock()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = paths;
}

/// Process-wide paths set by [`init`].
pub fn paths() -> RuntimePaths {
    context_lock()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}
