//! Render-independent status bar model.
//!
//! Holds the branch indicator, sync counts, cursor position, the active file's
//! info and a queue of transient messages. Everything is fed from the bus.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use quantum_core::git::GitChangeRecord;
use quantum_core::util::language_from_path;

use crate::event_bus::EventBus;
use crate::events::{names, AppEvent, MessageLevel};
use crate::git::count_unpushed;

pub const DEFAULT_MESSAGE_DURATION: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub language: String,
    /// e.g. `Spaces: 4`.
    pub indentation: String,
    pub encoding: &'static str,
    pub line_ending: &'static str,
}

impl FileInfo {
    pub fn for_path(path: &str) -> Self {
        let extension = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        let width = match extension.as_str() {
            "py" | "yaml" | "yml" => 4,
            _ => 2,
        };
        FileInfo {
            language: language_from_path(path),
            indentation: format!("Spaces: {}", width),
            encoding: "UTF-8",
            line_ending: if cfg!(windows) { "CRLF" } else { "LF" },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub text: String,
    pub level: MessageLevel,
    pub expires_at: Instant,
}

struct StatusState {
    branch: String,
    unpushed: usize,
    unpulled: usize,
    line: u32,
    column: u32,
    file: Option<FileInfo>,
    messages: Vec<StatusMessage>,
}

pub struct StatusBar {
    bus: EventBus,
    message_duration: Duration,
    state: Mutex<StatusState>,
}

impl StatusBar {
    pub fn new(bus: EventBus, message_duration: Duration) -> Self {
        StatusBar {
            bus,
            message_duration,
            state: Mutex::new(StatusState {
                branch: "main".to_string(),
                unpushed: 0,
                unpulled: 0,
                line: 1,
                column: 1,
                file: None,
                messages: Vec::new(),
            }),
        }
    }

    pub fn attach(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let update = Arc::new(move |event: &AppEvent| {
            let Some(bar) = weak.upgrade() else {
                return;
            };
            match event {
                AppEvent::GitStatusChanged { branch, changes } => {
                    bar.update_git_info(branch, changes)
                }
                AppEvent::CursorChanged { line, column, .. } => {
                    bar.update_cursor_position(*line, *column)
                }
                AppEvent::ActiveFileChanged { path } => bar.update_file_info(path.as_deref()),
                AppEvent::GitError { operation, message } => bar.show_message(
                    format!("Git {} failed: {}", operation, message),
                    MessageLevel::Error,
                ),
                AppEvent::ExplorerError { message, .. } => {
                    bar.show_message(message.clone(), MessageLevel::Error)
                }
                AppEvent::StatusMessage { text, level } => bar.show_message(text.clone(), *level),
                _ => {}
            }
        });
        for name in [
            names::GIT_STATUS_CHANGED,
            names::EDITOR_CURSOR_CHANGED,
            names::EDITOR_ACTIVE_FILE_CHANGED,
            names::GIT_ERROR,
            names::EXPLORER_ERROR,
            names::STATUS_MESSAGE,
        ] {
            let update = update.clone();
            self.bus.on(name, move |event| (*update)(event));
        }
    }

    pub fn update_git_info(&self, branch: &str, changes: &[GitChangeRecord]) {
        let mut state = self.state.lock();
        state.branch = branch.to_string();
        state.unpushed = count_unpushed(changes);
        state.unpulled = 0;
    }

    pub fn update_cursor_position(&self, line: u32, column: u32) {
        let mut state = self.state.lock();
        state.line = line;
        state.column = column;
    }

    /// `None` hides the file section.
    pub fn update_file_info(&self, path: Option<&str>) {
        self.state.lock().file = path.map(FileInfo::for_path);
    }

    pub fn show_message(&self, text: impl Into<String>, level: MessageLevel) {
        let message = StatusMessage {
            text: text.into(),
            level,
            expires_at: Instant::now() + self.message_duration,
        };
        log::debug!("Status: {}", message.text);
        self.state.lock().messages.push(message);
    }

    /// Messages still showing at `now`. Expired ones are dropped.
    pub fn messages_at(&self, now: Instant) -> Vec<StatusMessage> {
        let mut state = self.state.lock();
        state.messages.retain(|m| m.expires_at > now);
        state.messages.clone()
    }

    pub fn messages(&self) -> Vec<StatusMessage> {
        self.messages_at(Instant::now())
    }

    pub fn branch(&self) -> String {
        self.state.lock().branch.clone()
    }

    /// `(unpushed, unpulled)`.
    pub fn sync_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.unpushed, state.unpulled)
    }

    pub fn sync_label(&self) -> String {
        let (up, down) = self.sync_counts();
        format!("↑{} ↓{}", up, down)
    }

    pub fn cursor_label(&self) -> String {
        let state = self.state.lock();
        format!("Ln {}, Col {}", state.line, state.column)
    }

    pub fn file_info(&self) -> Option<FileInfo> {
        self.state.lock().file.clone()
    }

    /// Branch indicator clicked.
    pub fn show_branches(&self) {
        self.bus.emit(&AppEvent::GitShowBranches);
    }

    /// Sync counts clicked.
    pub fn show_sync(&self) {
        self.bus.emit(&AppEvent::GitShowSync);
    }
}
