use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use quantum_core::host::HostConfig;
use serde::{Deserialize, Serialize};

/// Application settings, persisted to `<config dir>/quantum/settings.json`.
///
/// `#[serde(default)]` fills fields missing from an older file with their
/// defaults, so new fields can be added without breaking existing configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // ── Workspace ────────────────────────────────────────────────────────
    /// Empty means the process working directory.
    pub workspace_root: String,
    pub show_hidden: bool,
    pub confine_to_workspace: bool,

    // ── Terminal ─────────────────────────────────────────────────────────
    pub terminal_cols: u16,
    pub terminal_rows: u16,

    // ── Session ──────────────────────────────────────────────────────────
    pub restore_session: bool,
    pub session_key: String,

    // ── Status bar ───────────────────────────────────────────────────────
    pub status_message_secs: u64,

    // ── Keybindings ──────────────────────────────────────────────────────
    /// Command id → display string such as `Ctrl+Shift+P`.
    pub keybinding_overrides: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            // Workspace
            workspace_root: String::new(),
            show_hidden: false,
            confine_to_workspace: true,

            // Terminal
            terminal_cols: 80,
            terminal_rows: 24,

            // Session
            restore_session: true,
            session_key: String::from("session"),

            // Status bar
            status_message_secs: 3,

            // Keybindings
            keybinding_overrides: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn workspace_root(&self) -> PathBuf {
        if self.workspace_root.is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(&self.workspace_root)
        }
    }

    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            root: self.workspace_root(),
            show_hidden: self.show_hidden,
            confine_to_workspace: self.confine_to_workspace,
        }
    }

    pub fn status_message_duration(&self) -> Duration {
        Duration::from_secs(self.status_message_secs)
    }
}

fn settings_path() -> PathBuf {
    let config = dirs::config_dir().unwrap_or_else(std::env::temp_dir);
    config.join("quantum").join("settings.json")
}

pub fn load() -> Settings {
    load_from(&settings_path())
}

/// Missing or malformed files yield the defaults.
pub fn load_from(path: &Path) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            log::warn!("Ignoring malformed settings at {}: {}", path.display(), e);
            Settings::default()
        }),
        Err(_) => Settings::default(),
    }
}

pub fn save(settings: &Settings) {
    let path = settings_path();
    if let Err(e) = save_to(settings, &path) {
        log::error!("Failed to save settings to {}: {}", path.display(), e);
    }
}

pub fn save_to(settings: &Settings, path: &Path) -> Result<(), String> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(|e| e.to_string())?;
    std::fs::write(path, json).map_err(|e| e.to_string())
}
