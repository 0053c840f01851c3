//! Find-in-files front end: runs host searches and keeps the last result set.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use quantum_core::channel::{ops, PrivilegedChannel, Push, ReplaceArgs, SearchArgs};
use quantum_core::search::{SearchFlags, SearchMatch, SearchProgress};
use serde_json::Value;

use crate::error::Result;
use crate::event_bus::EventBus;
use crate::events::{AppEvent, MessageLevel};

#[derive(Default)]
struct SearchState {
    pattern: String,
    flags: SearchFlags,
    results: Vec<SearchMatch>,
    progress: SearchProgress,
    /// Bumped by every search; only the newest one may store results.
    generation: u64,
}

pub struct SearchPanel {
    bus: EventBus,
    channel: Arc<PrivilegedChannel>,
    state: Mutex<SearchState>,
}

impl SearchPanel {
    pub fn new(bus: EventBus, channel: Arc<PrivilegedChannel>) -> Self {
        SearchPanel {
            bus,
            channel,
            state: Mutex::new(SearchState::default()),
        }
    }

    /// Re-emit host progress pushes as `search.progress` events.
    pub fn attach(self: &Arc<Self>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.channel.receive(ops::SEARCH_PROGRESS, move |push| {
            let (Some(panel), Push::SearchProgress(progress)) = (weak.upgrade(), push) else {
                return;
            };
            panel.state.lock().progress = *progress;
            panel.bus.emit(&AppEvent::SearchProgress {
                files_searched: progress.files_searched,
                matches: progress.matches,
            });
        })?;
        Ok(())
    }

    /// Search the workspace. An empty pattern clears the results without asking the host.
    pub async fn search(&self, pattern: &str, flags: SearchFlags) -> Result<Vec<SearchMatch>> {
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.pattern = pattern.to_string();
            state.flags = flags;
            state.progress = SearchProgress::default();
            if pattern.is_empty() {
                state.results.clear();
                return Ok(Vec::new());
            }
            state.generation
        };

        let args = SearchArgs {
            pattern: pattern.to_string(),
            flags,
        };
        let response = self.channel.invoke_as(ops::SEARCH_IN_FILES, &args).await;
        let matches: Vec<SearchMatch> = match response {
            Ok(matches) => matches,
            Err(e) => {
                log::error!("Search failed: {}", e);
                self.bus
                    .emit(&AppEvent::status(format!("Search failed: {}", e), MessageLevel::Error));
                return Err(e.into());
            }
        };

        {
            let mut state = self.state.lock();
            if state.generation != generation {
                log::debug!("Discarding stale results for '{}'", pattern);
                return Ok(matches);
            }
            state.results = matches.clone();
        }
        self.bus.emit(&AppEvent::SearchResults {
            pattern: pattern.to_string(),
            matches: matches.clone(),
        });
        Ok(matches)
    }

    /// Replace every match and re-run the search. Returns the number of files changed.
    pub async fn replace_all(
        &self,
        pattern: &str,
        flags: SearchFlags,
        replacement: &str,
    ) -> Result<usize> {
        if pattern.is_empty() {
            return Ok(0);
        }
        let args = ReplaceArgs {
            pattern: pattern.to_string(),
            flags,
            replacement: replacement.to_string(),
        };
        let files: usize = match self.channel.invoke_as(ops::SEARCH_REPLACE_ALL, &args).await {
            Ok(files) => files,
            Err(e) => {
                log::error!("Replace all failed: {}", e);
                self.bus.emit(&AppEvent::status(
                    format!("Replace failed: {}", e),
                    MessageLevel::Error,
                ));
                return Err(e.into());
            }
        };
        self.bus.emit(&AppEvent::SearchReplaced {
            pattern: pattern.to_string(),
            files,
        });
        self.bus.emit(&AppEvent::status(
            format!("Replaced in {} files", files),
            MessageLevel::Success,
        ));
        self.search(pattern, flags).await?;
        Ok(files)
    }

    /// Ask the host to stop the running search at the next file.
    pub fn cancel(&self) -> Result<()> {
        self.channel.send(ops::SEARCH_CANCEL, Value::Null)?;
        Ok(())
    }

    pub fn open_result(&self, result: &SearchMatch) {
        self.bus.emit(&AppEvent::SearchResultSelected {
            file: result.file.clone(),
            line: result.line,
            column: result.column,
        });
    }

    pub fn results(&self) -> Vec<SearchMatch> {
        self.state.lock().results.clone()
    }

    /// Results grouped by file, in result order.
    pub fn grouped_results(&self) -> Vec<(String, Vec<SearchMatch>)> {
        let mut groups: Vec<(String, Vec<SearchMatch>)> = Vec::new();
        for m in self.results() {
            match groups.last_mut() {
                Some((file, matches)) if *file == m.file => matches.push(m),
                _ => groups.push((m.file.clone(), vec![m])),
            }
        }
        groups
    }

    pub fn progress(&self) -> SearchProgress {
        self.state.lock().progress
    }

    pub fn last_query(&self) -> (String, SearchFlags) {
        let state = self.state.lock();
        (state.pattern.clone(), state.flags)
    }
}
