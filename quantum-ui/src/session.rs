//! Session snapshot and the string-keyed store it is persisted in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UiError};
use crate::terminal::TerminalState;

/// Open documents, the active one and terminal state, captured on shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSnapshot {
    pub open_files: Vec<String>,
    pub active_file: Option<String>,
    pub terminal_state: TerminalState,
}

impl SessionSnapshot {
    /// Read the snapshot under `key`. Absent or undecodable entries give `None`.
    pub fn load(store: &dyn SessionStore, key: &str) -> Result<Option<Self>> {
        let Some(raw) = store.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                log::warn!("Discarding unreadable session snapshot '{}': {}", key, e);
                Ok(None)
            }
        }
    }

    pub fn save(&self, store: &dyn SessionStore, key: &str) -> Result<()> {
        let raw = serde_json::to_string(self).map_err(|e| UiError::Session(e.to_string()))?;
        store.set(key, raw)
    }
}

pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: String) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }
}

/// A JSON object of string values on disk, rewritten whole on every `set`.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// `<data dir>/quantum/storage.json`.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("quantum")
            .join("storage.json")
    }

    /// A missing file starts empty; a malformed one is logged and ignored.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("Ignoring malformed store at {}: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        JsonFileStore {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let failed = |e: &dyn std::fmt::Display| {
            UiError::Session(format!("failed to write {}: {}", self.path.display(), e))
        };
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| failed(&e))?;
        }
        let json = serde_json::to_string_pretty(entries).map_err(|e| failed(&e))?;
        std::fs::write(&self.path, json).map_err(|e| failed(&e))
    }
}

impl SessionStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        let snapshot = {
            let mut entries = self.entries.lock();
            entries.insert(key.to_string(), value);
            entries.clone()
        };
        self.flush(&snapshot)
    }
}
