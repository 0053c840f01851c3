use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, UiError};
use crate::event_bus::{panic_message, EventBus};
use crate::events::AppEvent;

pub const DEFAULT_CATEGORY: &str = "General";

pub type CommandHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub struct Command {
    pub id: String,
    pub title: String,
    pub category: String,
    /// Display form, e.g. `Ctrl+Shift+F`.
    pub keybinding: Option<String>,
    handler: CommandHandler,
}

impl Command {
    pub fn new<F>(id: impl Into<String>, title: impl Into<String>, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Command {
            id: id.into(),
            title: title.into(),
            category: DEFAULT_CATEGORY.to_string(),
            keybinding: None,
            handler: Arc::new(handler),
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn keybinding(mut self, keybinding: impl Into<String>) -> Self {
        self.keybinding = Some(keybinding.into());
        self
    }

    /// Text the palette filters on.
    pub fn label(&self) -> String {
        format!("{} {}", self.category, self.title)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("category", &self.category)
            .field("keybinding", &self.keybinding)
            .finish_non_exhaustive()
    }
}

/// Dictionary of commands keyed by id.
pub struct CommandRegistry {
    bus: EventBus,
    commands: Mutex<HashMap<String, Command>>,
}

impl CommandRegistry {
    pub fn new(bus: EventBus) -> Self {
        CommandRegistry {
            bus,
            commands: Mutex::new(HashMap::new()),
        }
    }

    /// Add a command, replacing any existing command with the same id.
    pub fn register(&self, mut command: Command) -> Result<()> {
        if command.id.trim().is_empty() {
            return Err(UiError::InvalidCommand("missing id".to_string()));
        }
        if command.title.trim().is_empty() {
            return Err(UiError::InvalidCommand(format!(
                "command '{}' has no title",
                command.id
            )));
        }
        if command.category.trim().is_empty() {
            command.category = DEFAULT_CATEGORY.to_string();
        }
        if let Some(previous) = self.commands.lock().insert(command.id.clone(), command) {
            log::debug!("Command '{}' re-registered", previous.id);
        }
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.commands.lock().remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Command> {
        self.commands.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    /// Commands whose `category title` contains `query` (case-insensitive),
    /// ordered by category then title.
    pub fn filter(&self, query: &str) -> Vec<Command> {
        let needle = query.trim().to_lowercase();
        let mut matches: Vec<Command> = self
            .commands
            .lock()
            .values()
            .filter(|c| needle.is_empty() || c.label().to_lowercase().contains(&needle))
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            a.category
                .cmp(&b.category)
                .then_with(|| a.title.cmp(&b.title))
                .then_with(|| a.id.cmp(&b.id))
        });
        matches
    }

    /// Run a command's handler. Unknown ids are ignored; a panicking handler is logged.
    /// Returns `true` if the handler ran to completion.
    pub fn invoke(&self, id: &str) -> bool {
        let Some(handler) = self.commands.lock().get(id).map(|c| Arc::clone(&c.handler)) else {
            log::debug!("No command registered for '{}'", id);
            return false;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| handler())) {
            Ok(()) => {
                self.bus.emit(&AppEvent::CommandInvoked { id: id.to_string() });
                true
            }
            Err(payload) => {
                log::error!(
                    "Command '{}' panicked: {}",
                    id,
                    panic_message(payload.as_ref())
                );
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaletteKey {
    Up,
    Down,
    Enter,
    Escape,
}

#[derive(Default)]
struct PaletteState {
    visible: bool,
    query: String,
    selected: usize,
    items: Vec<Command>,
}

/// Visibility and selection state for the command palette.
pub struct CommandPalette {
    registry: Arc<CommandRegistry>,
    state: Mutex<PaletteState>,
}

impl CommandPalette {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        CommandPalette {
            registry,
            state: Mutex::new(PaletteState::default()),
        }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn show(&self) {
        let mut state = self.state.lock();
        state.visible = true;
        state.query.clear();
        state.selected = 0;
        state.items = self.registry.filter("");
    }

    pub fn hide(&self) {
        let mut state = self.state.lock();
        state.visible = false;
        state.query.clear();
        state.items.clear();
        state.selected = 0;
    }

    pub fn is_visible(&self) -> bool {
        self.state.lock().visible
    }

    pub fn set_query(&self, query: &str) {
        let mut state = self.state.lock();
        if !state.visible {
            return;
        }
        state.query = query.to_string();
        state.items = self.registry.filter(query);
        state.selected = 0;
    }

    pub fn query(&self) -> String {
        self.state.lock().query.clone()
    }

    pub fn items(&self) -> Vec<Command> {
        self.state.lock().items.clone()
    }

    pub fn selected_index(&self) -> Option<usize> {
        let state = self.state.lock();
        (!state.items.is_empty()).then_some(state.selected)
    }

    pub fn select_next(&self) {
        let mut state = self.state.lock();
        let len = state.items.len();
        if len > 0 {
            state.selected = (state.selected + 1) % len;
        }
    }

    pub fn select_previous(&self) {
        let mut state = self.state.lock();
        let len = state.items.len();
        if len > 0 {
            state.selected = (state.selected + len - 1) % len;
        }
    }

    /// Hide the palette and run the selected command. No-op on an empty list.
    pub fn invoke_selected(&self) -> Option<String> {
        let id = {
            let state = self.state.lock();
            if !state.visible {
                return None;
            }
            state.items.get(state.selected)?.id.clone()
        };
        self.hide();
        self.registry.invoke(&id);
        Some(id)
    }

    /// Keyboard handling while visible. Returns `true` if the key was consumed.
    pub fn handle_key(&self, key: PaletteKey) -> bool {
        if !self.is_visible() {
            return false;
        }
        match key {
            PaletteKey::Up => self.select_previous(),
            PaletteKey::Down => self.select_next(),
            PaletteKey::Enter => {
                self.invoke_selected();
            }
            PaletteKey::Escape => self.hide(),
        }
        true
    }

    pub fn click_outside(&self) {
        self.hide();
    }
}
