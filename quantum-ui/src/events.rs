//! The closed set of events carried by the [`EventBus`](crate::event_bus::EventBus).

use quantum_core::git::GitChangeRecord;
use quantum_core::search::SearchMatch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names, for subscribing.
pub mod names {
    pub const FILE_OPEN: &str = "file.open";
    pub const FILE_SAVE: &str = "file.save";
    pub const EDITOR_FILE_OPENED: &str = "editor.fileOpened";
    pub const EDITOR_FILE_CLOSED: &str = "editor.fileClosed";
    pub const EDITOR_FILE_SAVED: &str = "editor.fileSaved";
    pub const EDITOR_ACTIVE_FILE_CHANGED: &str = "editor.activeFileChanged";
    pub const EDITOR_CONTENT_CHANGED: &str = "editor.contentChanged";
    pub const EDITOR_CURSOR_CHANGED: &str = "editor.cursorChanged";
    pub const EXPLORER_LOADED: &str = "explorer.loaded";
    pub const EXPLORER_ERROR: &str = "explorer.error";
    pub const GIT_STATUS_CHANGED: &str = "git.statusChanged";
    pub const GIT_ERROR: &str = "git.error";
    pub const GIT_STAGE: &str = "git.stage";
    pub const GIT_UNSTAGE: &str = "git.unstage";
    pub const GIT_REVERT: &str = "git.revert";
    pub const GIT_REFRESH: &str = "git.refresh";
    pub const GIT_SHOW_COMMIT: &str = "git.showCommit";
    pub const GIT_SHOW_BRANCHES: &str = "git.showBranches";
    pub const GIT_SHOW_SYNC: &str = "git.showSync";
    pub const SEARCH_RESULTS: &str = "search.results";
    pub const SEARCH_PROGRESS: &str = "search.progress";
    pub const SEARCH_REPLACED: &str = "search.replaced";
    pub const SEARCH_RESULT_SELECTED: &str = "search.resultSelected";
    pub const VIEW_SHOW_SEARCH: &str = "view.showSearch";
    pub const TERMINAL_EXITED: &str = "terminal.exited";
    pub const COMMAND_INVOKED: &str = "command.invoked";
    pub const STATUS_MESSAGE: &str = "status.message";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload")]
pub enum AppEvent {
    /// Request to open a file in the editor.
    #[serde(rename = "file.open")]
    FileOpen { path: String, content: String },
    #[serde(rename = "file.save")]
    FileSave,

    #[serde(rename = "editor.fileOpened")]
    FileOpened { path: String },
    #[serde(rename = "editor.fileClosed")]
    FileClosed { path: String },
    #[serde(rename = "editor.fileSaved")]
    FileSaved { path: String },
    #[serde(rename = "editor.activeFileChanged")]
    ActiveFileChanged { path: Option<String> },
    #[serde(rename = "editor.contentChanged")]
    ContentChanged { path: String },
    #[serde(rename = "editor.cursorChanged")]
    CursorChanged {
        path: String,
        line: u32,
        column: u32,
    },

    #[serde(rename = "explorer.loaded")]
    ExplorerLoaded { path: String },
    #[serde(rename = "explorer.error")]
    ExplorerError { kind: String, message: String },

    #[serde(rename = "git.statusChanged")]
    GitStatusChanged {
        branch: String,
        changes: Vec<GitChangeRecord>,
    },
    #[serde(rename = "git.error")]
    GitError { operation: String, message: String },
    #[serde(rename = "git.stage")]
    GitStage { path: String },
    #[serde(rename = "git.unstage")]
    GitUnstage { path: String },
    #[serde(rename = "git.revert")]
    GitRevert { path: String },
    #[serde(rename = "git.refresh")]
    GitRefresh,
    #[serde(rename = "git.showCommit")]
    GitShowCommit,
    #[serde(rename = "git.showBranches")]
    GitShowBranches,
    #[serde(rename = "git.showSync")]
    GitShowSync,

    #[serde(rename = "search.results")]
    SearchResults {
        pattern: String,
        matches: Vec<SearchMatch>,
    },
    #[serde(rename = "search.progress", rename_all = "camelCase")]
    SearchProgress { files_searched: usize, matches: usize },
    #[serde(rename = "search.replaced")]
    SearchReplaced { pattern: String, files: usize },
    #[serde(rename = "search.resultSelected")]
    SearchResultSelected { file: String, line: u32, column: u32 },
    #[serde(rename = "view.showSearch")]
    ShowSearch,

    #[serde(rename = "terminal.exited")]
    TerminalExited { id: String },
    #[serde(rename = "command.invoked")]
    CommandInvoked { id: String },
    #[serde(rename = "status.message")]
    StatusMessage {
        text: String,
        #[serde(default)]
        level: MessageLevel,
    },
}

impl AppEvent {
    pub fn name(&self) -> &'static str {
        use names::*;
        match self {
            AppEvent::FileOpen { .. } => FILE_OPEN,
            AppEvent::FileSave => FILE_SAVE,
            AppEvent::FileOpened { .. } => EDITOR_FILE_OPENED,
            AppEvent::FileClosed { .. } => EDITOR_FILE_CLOSED,
            AppEvent::FileSaved { .. } => EDITOR_FILE_SAVED,
            AppEvent::ActiveFileChanged { .. } => EDITOR_ACTIVE_FILE_CHANGED,
            AppEvent::ContentChanged { .. } => EDITOR_CONTENT_CHANGED,
            AppEvent::CursorChanged { .. } => EDITOR_CURSOR_CHANGED,
            AppEvent::ExplorerLoaded { .. } => EXPLORER_LOADED,
            AppEvent::ExplorerError { .. } => EXPLORER_ERROR,
            AppEvent::GitStatusChanged { .. } => GIT_STATUS_CHANGED,
            AppEvent::GitError { .. } => GIT_ERROR,
            AppEvent::GitStage { .. } => GIT_STAGE,
            AppEvent::GitUnstage { .. } => GIT_UNSTAGE,
            AppEvent::GitRevert { .. } => GIT_REVERT,
            AppEvent::GitRefresh => GIT_REFRESH,
            AppEvent::GitShowCommit => GIT_SHOW_COMMIT,
            AppEvent::GitShowBranches => GIT_SHOW_BRANCHES,
            AppEvent::GitShowSync => GIT_SHOW_SYNC,
            AppEvent::SearchResults { .. } => SEARCH_RESULTS,
            AppEvent::SearchProgress { .. } => SEARCH_PROGRESS,
            AppEvent::SearchReplaced { .. } => SEARCH_REPLACED,
            AppEvent::SearchResultSelected { .. } => SEARCH_RESULT_SELECTED,
            AppEvent::ShowSearch => VIEW_SHOW_SEARCH,
            AppEvent::TerminalExited { .. } => TERMINAL_EXITED,
            AppEvent::CommandInvoked { .. } => COMMAND_INVOKED,
            AppEvent::StatusMessage { .. } => STATUS_MESSAGE,
        }
    }

    /// Decode a host `app-event` envelope. Fails if the name or payload shape is unknown.
    pub fn from_envelope(name: &str, payload: Value) -> Result<Self, serde_json::Error> {
        let envelope = if payload.is_null() {
            serde_json::json!({ "name": name })
        } else {
            serde_json::json!({ "name": name, "payload": payload })
        };
        serde_json::from_value(envelope)
    }

    pub fn status(text: impl Into<String>, level: MessageLevel) -> Self {
        AppEvent::StatusMessage {
            text: text.into(),
            level,
        }
    }
}
