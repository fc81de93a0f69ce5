//! Entry registry: the durable list of supervised entries.
//!
//! The registry document is JSON by default (`config.json`) and YAML when the path ends
//! in `.yaml`/`.yml`. Keys the core does not understand (theme, language, autostart
//! preferences written by other tools) are carried through a load/save cycle untouched.
//! Malformed entry fields fall back to per-field defaults and never fail the load.
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
};
use tracing::warn;
use uuid::Uuid;

use crate::{error::RegistryError, state::EntryStatus};

/// Display name used when an entry has none.
pub const DEFAULT_ENTRY_NAME: &str = "Entry";

/// Static configuration of one supervised entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryConfig {
    /// Opaque identifier, unique and never reused.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Launch command string.
    pub cmd: String,
    /// Working directory, empty for the daemon's own.
    #[serde(default)]
    pub cwd: String,
    /// Extra launch arguments, shell-word split at launch.
    #[serde(default)]
    pub args: String,
    /// Start this entry when the supervisor autostarts.
    #[serde(default)]
    pub enabled: bool,
    /// Restart after an abnormal exit.
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,
    /// Truncate the entry log before each fresh spawn.
    #[serde(default)]
    pub clear_log_on_start: bool,
}

fn default_autorestart() -> bool {
    true
}

/// Returns a fresh entry identifier.
pub fn new_entry_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl EntryConfig {
    /// Creates an entry with a fresh id and default flags.
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            id: new_entry_id(),
            name: name.into(),
            cmd: cmd.into(),
            cwd: String::new(),
            args: String::new(),
            enabled: false,
            autorestart: true,
            clear_log_on_start: false,
        }
    }

    /// Builds an entry from an untrusted document node, falling back per field.
    pub fn from_value(value: &Value) -> Self {
        let empty = Map::new();
        let object = value.as_object().unwrap_or(&empty);

        let text = |key: &str| -> Option<String> {
            match object.get(key) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            }
        };
        let flag = |key: &str, default: bool| -> bool {
            match object.get(key) {
                Some(Value::Bool(b)) => *b,
                Some(Value::Number(n)) => n.as_i64().map(|n| n != 0).unwrap_or(default),
                Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" | "on" => true,
                    "false" | "0" | "no" | "off" => false,
                    _ => default,
                },
                _ => default,
            }
        };

        let id = text("id")
            .or_else(|| text("pid"))
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_entry_id);
        let name = text("name")
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ENTRY_NAME.to_string());

        Self {
            id,
            name,
            cmd: text("cmd").unwrap_or_default(),
            cwd: text("cwd").unwrap_or_default(),
            args: text("args").unwrap_or_default(),
            enabled: flag("enabled", false),
            autorestart: flag("autorestart", true),
            clear_log_on_start: flag("clear_log_on_start", false),
        }
    }

    /// Copies the configuration fields of `other`, keeping this entry's id.
    pub fn apply(&mut self, other: &EntryConfig) {
        self.name = other.name.clone();
        self.cmd = other.cmd.clone();
        self.cwd = other.cwd.clone();
        self.args = other.args.clone();
        self.enabled = other.enabled;
        self.autorestart = other.autorestart;
        self.clear_log_on_start = other.clear_log_on_start;
    }
}

/// On-disk shape of the registry document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigDocument {
    #[serde(default, deserialize_with = "lenient_list")]
    entries: Vec<Value>,
    #[serde(default, deserialize_with = "lenient_env")]
    env_snapshot: BTreeMap<String, String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items,
        _ => Vec::new(),
    })
}

fn lenient_env<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let Value::Object(map) = Value::deserialize(deserializer)? else {
        return Ok(BTreeMap::new());
    };
    Ok(map
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::String(s) => Some((key, s)),
            _ => None,
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                DocumentFormat::Yaml
            }
            _ => DocumentFormat::Json,
        }
    }
}

/// The loaded registry plus the untouched remainder of its document.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    entries: Vec<EntryConfig>,
    env_snapshot: BTreeMap<String, String>,
    extra: Map<String, Value>,
}

impl Registry {
    /// An empty registry that will be saved to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
            env_snapshot: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    /// Loads the registry. A missing or blank file yields an empty registry.
    ///
    /// Runtime state is never stored, so every loaded entry starts out `stopped` once the
    /// supervisor wraps it.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::empty(path));
        }

        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(Self::empty(path));
        }

        let document: ConfigDocument = match DocumentFormat::for_path(&path) {
            DocumentFormat::Json => serde_json::from_str(&content)?,
            DocumentFormat::Yaml => serde_yaml::from_str(&content)?,
        };

        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(document.entries.len());
        for raw in &document.entries {
            let mut entry = EntryConfig::from_value(raw);
            if !seen.insert(entry.id.clone()) {
                warn!("Duplicate entry id '{}' in registry; assigning a new id", entry.id);
                entry.id = new_entry_id();
                seen.insert(entry.id.clone());
            }
            entries.push(entry);
        }

        Ok(Self {
            path,
            entries,
            env_snapshot: document.env_snapshot,
            extra: document.extra,
        })
    }

    /// Persists configuration fields only, via temp file and rename.
    pub fn save(&self) -> Result<(), RegistryError> {
        let document = ConfigDocument {
            entries: self
                .entries
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()?,
            env_snapshot: self.env_snapshot.clone(),
            extra: self.extra.clone(),
        };

        let payload = match DocumentFormat::for_path(&self.path) {
            DocumentFormat::Json => serde_json::to_string_pretty(&document)?,
            DocumentFormat::Yaml => serde_yaml::to_string(&document)?,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[EntryConfig] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<EntryConfig> {
        self.entries
    }

    pub fn get(&self, id: &str) -> Option<&EntryConfig> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Appends a new entry.
    pub fn add(&mut self, entry: EntryConfig) -> Result<(), RegistryError> {
        if self.get(&entry.id).is_some() {
            return Err(RegistryError::Duplicate(entry.id));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Replaces the configuration of the entry with the same id.
    pub fn update(&mut self, entry: &EntryConfig) -> Result<(), RegistryError> {
        let existing = self
            .entries
            .iter_mut()
            .find(|candidate| candidate.id == entry.id)
            .ok_or_else(|| RegistryError::NotFound(entry.id.clone()))?;
        existing.apply(entry);
        Ok(())
    }

    /// Drops an entry, refusing while its last-known status is active.
    pub fn remove(
        &mut self,
        id: &str,
        last_status: EntryStatus,
    ) -> Result<EntryConfig, RegistryError> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if last_status.is_active() {
            return Err(RegistryError::StillActive { id: id.to_string() });
        }
        Ok(self.entries.remove(index))
    }

    pub fn env_snapshot(&self) -> &BTreeMap<String, String> {
        &self.env_snapshot
    }

    /// Stores `snapshot` and reports whether it differed from the stored one.
    ///
    /// The caller saves only when this returns `true`.
    pub fn maybe_update_env_snapshot(&mut self, snapshot: BTreeMap<String, String>) -> bool {
        if self.env_snapshot == snapshot {
            return false;
        }
        self.env_snapshot = snapshot;
        true
    }
}

/// Captures the current process environment for later child launches.
pub fn capture_env_snapshot() -> BTreeMap<String, String> {
    env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}
