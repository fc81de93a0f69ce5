//! Per-entry log files with size-based rotation.
//!
//! Each entry writes to `<logs-dir>/<safe-id>.log`. Rotated generations are kept as
//! `<safe-id>.log.1`, `<safe-id>.log.2`, ... with `.1` the most recent.
use chrono::Local;
use regex::Regex;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::OnceLock,
};
use tracing::warn;

use crate::{
    constants::{LOG_ROTATE_COUNT, LOG_ROTATE_MAX_BYTES, LOG_TAIL_WINDOW_BYTES},
    error::LogStoreError,
};

fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").unwrap())
}

/// Removes ANSI escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").into_owned()
}

/// Prefixes `message` with a local timestamp and terminates it with a newline.
pub fn format_line(message: &str) -> String {
    format!("[{}] {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), message)
}

/// Maps an entry id to a string safe to use as a file name.
pub fn safe_file_stem(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "entry".to_string()
    } else {
        stem
    }
}

/// Append-only log storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct LogStore {
    dir: PathBuf,
    max_bytes: u64,
    keep: usize,
}

impl LogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_limits(dir, LOG_ROTATE_MAX_BYTES, LOG_ROTATE_COUNT)
    }

    /// `keep` counts the live file, so `keep = 3` retains two backups.
    pub fn with_limits(dir: impl Into<PathBuf>, max_bytes: u64, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            max_bytes: max_bytes.max(1),
            keep: keep.max(1),
        }
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.log", safe_file_stem(id)))
    }

    fn backup_path(&self, id: &str, generation: usize) -> PathBuf {
        let mut path = self.path_for(id).into_os_string();
        path.push(format!(".{generation}"));
        PathBuf::from(path)
    }

    /// Appends `text` with ANSI sequences removed, rotating first if it would not fit.
    pub fn append(&self, id: &str, text: &str) -> Result<(), LogStoreError> {
        let cleaned = strip_ansi(text);
        let mut data = cleaned.as_bytes();
        if data.is_empty() {
            return Ok(());
        }

        if data.len() as u64 > self.max_bytes {
            data = &data[data.len() - self.max_bytes as usize..];
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(id);
        let current = file_len(&path);
        if current > 0 && current + data.len() as u64 > self.max_bytes {
            self.rotate(id)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(data)?;
        Ok(())
    }

    /// Appends a timestamped line, logging instead of failing.
    pub fn append_line(&self, id: &str, message: &str) {
        if let Err(err) = self.append(id, &format_line(message)) {
            warn!("Failed to write log line for entry '{id}': {err}");
        }
    }

    /// Drops the oldest backup, shifts the rest and closes out the live file.
    fn rotate(&self, id: &str) -> io::Result<()> {
        let path = self.path_for(id);
        if self.keep <= 1 {
            return File::create(&path).map(|_| ());
        }

        let oldest = self.backup_path(id, self.keep - 1);
        remove_if_exists(&oldest)?;
        for generation in (1..self.keep - 1).rev() {
            let from = self.backup_path(id, generation);
            if from.exists() {
                fs::rename(&from, self.backup_path(id, generation + 1))?;
            }
        }
        if path.exists() {
            fs::rename(&path, self.backup_path(id, 1))?;
        }
        Ok(())
    }

    /// Last `max_lines` lines from a bounded trailing window of the live file.
    pub fn tail(&self, id: &str, max_lines: usize) -> Result<Vec<String>, LogStoreError> {
        let path = self.path_for(id);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let size = file.metadata()?.len();
        let start = size.saturating_sub(LOG_TAIL_WINDOW_BYTES);
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::with_capacity((size - start) as usize);
        file.read_to_end(&mut buf)?;

        let text = String::from_utf8_lossy(&buf);
        let lines: Vec<&str> = text.lines().collect();
        let skip = lines.len().saturating_sub(max_lines);
        Ok(lines[skip..].iter().map(|line| line.to_string()).collect())
    }

    /// Bytes written since `offset`, plus the offset to pass next time.
    ///
    /// An offset past the end means the file was rotated or cleared; reading restarts at 0.
    pub fn read_from_offset(
        &self,
        id: &str,
        offset: u64,
    ) -> Result<(String, u64), LogStoreError> {
        let path = self.path_for(id);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((String::new(), 0)),
            Err(err) => return Err(err.into()),
        };

        let size = file.metadata()?.len();
        let start = if offset > size { 0 } else { offset };
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::with_capacity((size - start) as usize);
        file.read_to_end(&mut buf)?;

        let next = start + buf.len() as u64;
        Ok((String::from_utf8_lossy(&buf).into_owned(), next))
    }

    /// Truncates the live file and deletes every backup.
    pub fn clear(&self, id: &str) -> Result<(), LogStoreError> {
        let path = self.path_for(id);
        if path.exists() {
            File::create(&path)?;
        }
        for generation in 1..self.keep.max(LOG_ROTATE_COUNT) {
            remove_if_exists(&self.backup_path(id, generation))?;
        }
        Ok(())
    }

    /// Deletes the live file and every backup.
    pub fn remove(&self, id: &str) -> Result<(), LogStoreError> {
        self.clear(id)?;
        remove_if_exists(&self.path_for(id))?;
        Ok(())
    }
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
