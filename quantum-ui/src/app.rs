//! The workbench shell: owns every manager, wires them to the bus and the
//! privileged channel, and maps commands and key chords onto them.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Weak};

use quantum_core::channel::{ops, PathArgs, PrivilegedChannel, Push};
use quantum_core::host::LocalHost;

use crate::commands::{Command, CommandPalette, CommandRegistry};
use crate::editor::{EditorManager, SurfaceFactory};
use crate::error::Result;
use crate::event_bus::{panic_message, EventBus};
use crate::events::{names, AppEvent, MessageLevel};
use crate::explorer::FileExplorer;
use crate::git::GitStateManager;
use crate::keybindings::{KeyChord, Keymap};
use crate::search::SearchPanel;
use crate::session::{SessionSnapshot, SessionStore};
use crate::settings::Settings;
use crate::status_bar::StatusBar;
use crate::terminal::{TerminalManager, TerminalSurface};

/// Run `fut` on the current runtime, logging its error instead of propagating it.
pub fn spawn_logged<F>(what: &'static str, fut: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = fut.await {
                    log::error!("{} failed: {}", what, e);
                }
            });
        }
        Err(_) => log::warn!("No async runtime; dropping {}", what),
    }
}

/// Route panics from any thread into the log.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());
        log::error!(
            "Uncaught panic at {}: {}",
            location,
            panic_message(info.payload())
        );
    }));
}

/// Text input and pick lists, supplied by the front end.
pub trait Prompter: Send + Sync {
    fn input(&self, title: &str, initial: &str) -> Option<String>;
    fn choose(&self, title: &str, options: &[String]) -> Option<String>;
}

/// Everything the shell needs from the rendering side.
pub struct Frontend {
    pub editors: Arc<dyn SurfaceFactory>,
    pub terminal: Arc<dyn TerminalSurface>,
    pub prompter: Arc<dyn Prompter>,
    pub store: Arc<dyn SessionStore>,
}

/// id, title, category.
const COMMANDS: &[(&str, &str, &str)] = &[
    ("file.new", "New File", "File"),
    ("file.save", "Save File", "File"),
    ("file.close", "Close File", "File"),
    ("view.toggleTerminal", "Toggle Terminal", "View"),
    ("view.showSearch", "Find in Files", "View"),
    ("git.commit", "Commit", "Git"),
    ("git.push", "Push", "Git"),
    ("git.pull", "Pull", "Git"),
    ("git.sync", "Sync", "Git"),
    ("git.checkout", "Checkout Branch", "Git"),
    ("git.refresh", "Refresh Status", "Git"),
    ("edit.format", "Format Document", "Edit"),
    ("palette.show", "Show Command Palette", "Command Palette"),
    ("palette.help", "Show Help", "Help"),
];

pub struct Shell {
    pub settings: Settings,
    pub bus: EventBus,
    pub channel: Arc<PrivilegedChannel>,
    pub commands: Arc<CommandRegistry>,
    pub palette: Arc<CommandPalette>,
    pub editor: Arc<EditorManager>,
    pub explorer: Arc<FileExplorer>,
    pub terminal: Arc<TerminalManager>,
    pub search: Arc<SearchPanel>,
    pub git: Arc<GitStateManager>,
    pub status: Arc<StatusBar>,
    root: String,
    keymap: Keymap,
    terminal_surface: Arc<dyn TerminalSurface>,
    prompter: Arc<dyn Prompter>,
    store: Arc<dyn SessionStore>,
}

impl Shell {
    /// Start an in-process host for `settings` and build the shell on top of it.
    /// Must be called from within a tokio runtime.
    pub fn launch(settings: Settings, frontend: Frontend) -> Result<Arc<Shell>> {
        let (host, mut pushes) = LocalHost::new(settings.host_config());
        if let Err(e) = host.watch_workspace() {
            log::warn!("File watching disabled: {}", e);
        }
        let channel = Arc::new(PrivilegedChannel::new(Arc::new(host)));

        let weak: Weak<PrivilegedChannel> = Arc::downgrade(&channel);
        spawn_logged("push pump", async move {
            while let Some(push) = pushes.recv().await {
                let Some(channel) = weak.upgrade() else {
                    break;
                };
                channel.deliver(&push);
            }
            Ok(())
        });

        Shell::new(settings, channel, frontend)
    }

    pub fn new(
        settings: Settings,
        channel: Arc<PrivilegedChannel>,
        frontend: Frontend,
    ) -> Result<Arc<Shell>> {
        let bus = EventBus::new();
        let root = settings.workspace_root().to_string_lossy().to_string();
        let commands = Arc::new(CommandRegistry::new(bus.clone()));

        let shell = Arc::new(Shell {
            palette: Arc::new(CommandPalette::new(commands.clone())),
            commands,
            editor: Arc::new(EditorManager::new(
                bus.clone(),
                channel.clone(),
                frontend.editors,
            )),
            explorer: Arc::new(FileExplorer::new(bus.clone(), channel.clone())),
            terminal: Arc::new(TerminalManager::new(bus.clone(), channel.clone())),
            search: Arc::new(SearchPanel::new(bus.clone(), channel.clone())),
            git: Arc::new(GitStateManager::new(
                bus.clone(),
                channel.clone(),
                root.clone(),
            )),
            status: Arc::new(StatusBar::new(
                bus.clone(),
                settings.status_message_duration(),
            )),
            keymap: Keymap::resolve(&settings.keybinding_overrides),
            root,
            terminal_surface: frontend.terminal,
            prompter: frontend.prompter,
            store: frontend.store,
            settings,
            channel,
            bus,
        });

        shell.editor.attach();
        shell.explorer.attach()?;
        shell.terminal.attach()?;
        shell.search.attach()?;
        shell.git.attach()?;
        shell.status.attach();
        shell.attach()?;
        shell.register_commands()?;
        Ok(shell)
    }

    fn attach(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        self.channel.receive(ops::APP_EVENT, move |push| {
            let (Some(shell), Push::AppEvent { name, payload }) = (weak.upgrade(), push) else {
                return;
            };
            match AppEvent::from_envelope(name, payload.clone()) {
                Ok(event) => {
                    shell.bus.emit(&event);
                }
                Err(e) => log::warn!("Dropping malformed app-event '{}': {}", name, e),
            }
        })?;

        let weak = Arc::downgrade(self);
        let route = Arc::new(move |event: &AppEvent| {
            let Some(shell) = weak.upgrade() else {
                return;
            };
            match event.clone() {
                AppEvent::FileSave => shell.run_command("file.save"),
                AppEvent::GitShowCommit => {
                    spawn_logged("commit", async move { shell.commit_interactive().await });
                }
                AppEvent::GitShowBranches => {
                    spawn_logged("switch branch", async move { shell.switch_branch().await });
                }
                AppEvent::GitShowSync => {
                    spawn_logged("sync", async move { shell.sync().await });
                }
                AppEvent::SearchResultSelected { file, line, column } => {
                    spawn_logged("open search result", async move {
                        shell.open_search_result(&file, line, column).await
                    });
                }
                _ => {}
            }
        });
        for name in [
            names::FILE_SAVE,
            names::GIT_SHOW_COMMIT,
            names::GIT_SHOW_BRANCHES,
            names::GIT_SHOW_SYNC,
            names::SEARCH_RESULT_SELECTED,
        ] {
            let route = route.clone();
            self.bus.on(name, move |event| (*route)(event));
        }
        Ok(())
    }

    fn register_commands(self: &Arc<Self>) -> Result<()> {
        for &(id, title, category) in COMMANDS {
            let weak = Arc::downgrade(self);
            let mut command = Command::new(id, title, move || {
                if let Some(shell) = weak.upgrade() {
                    shell.run_command(id);
                }
            })
            .category(category);
            if let Some(keys) = self.keymap.display_for(id) {
                command = command.keybinding(keys);
            }
            self.commands.register(command)?;
        }
        Ok(())
    }

    fn run_command(self: &Arc<Self>, id: &str) {
        let shell = self.clone();
        match id {
            "file.new" => spawn_logged("new file", async move { shell.new_file().await }),
            "file.save" => spawn_logged("save", async move {
                shell.editor.save_current_file().await.map(|_| ())
            }),
            "file.close" => {
                if let Some(path) = self.editor.get_active_file() {
                    if let Err(e) = self.editor.close_file(&path) {
                        log::warn!("{}", e);
                    }
                }
            }
            "view.toggleTerminal" => spawn_logged("toggle terminal", async move {
                shell.terminal.toggle().await.map(|_| ())
            }),
            "view.showSearch" => {
                self.bus.emit(&AppEvent::ShowSearch);
            }
            "git.commit" => {
                self.bus.emit(&AppEvent::GitShowCommit);
            }
            "git.push" => spawn_logged("push", async move { shell.git.push().await }),
            "git.pull" => spawn_logged("pull", async move { shell.git.pull().await }),
            "git.sync" => {
                self.bus.emit(&AppEvent::GitShowSync);
            }
            "git.checkout" => {
                self.bus.emit(&AppEvent::GitShowBranches);
            }
            "git.refresh" => {
                self.bus.emit(&AppEvent::GitRefresh);
            }
            "edit.format" => {
                self.editor.format_active();
            }
            "palette.show" => self.palette.show(),
            "palette.help" => self.show_help(),
            other => log::warn!("Unhandled command '{}'", other),
        }
    }

    /// Dispatch a global key chord. Returns `true` if a command was bound to it.
    pub fn handle_key(&self, chord: &KeyChord) -> bool {
        match self.keymap.command_for(chord) {
            Some(id) => {
                let id = id.to_string();
                self.commands.invoke(&id);
                true
            }
            None => false,
        }
    }

    pub fn keymap(&self) -> &Keymap {
        &self.keymap
    }

    /// One line per command, palette order.
    pub fn help_lines(&self) -> Vec<String> {
        self.commands
            .filter("")
            .iter()
            .map(|c| match &c.keybinding {
                Some(keys) => format!("{}: {} ({})", c.category, c.title, keys),
                None => format!("{}: {}", c.category, c.title),
            })
            .collect()
    }

    fn show_help(&self) {
        let lines = self.help_lines();
        for line in &lines {
            log::info!("{}", line);
        }
        self.bus.emit(&AppEvent::status(
            format!("{} commands available. Press Ctrl+P to search them.", lines.len()),
            MessageLevel::Info,
        ));
    }

    fn resolve(&self, path: &str) -> String {
        if Path::new(path).is_absolute() {
            path.to_string()
        } else {
            Path::new(&self.root).join(path).to_string_lossy().to_string()
        }
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let content = self
            .channel
            .invoke_as(
                ops::FS_READ_FILE,
                &PathArgs {
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(content)
    }

    async fn new_file(&self) -> Result<()> {
        let Some(name) = self.prompter.input("New file name", "untitled.txt") else {
            return Ok(());
        };
        if name.trim().is_empty() {
            return Ok(());
        }
        self.explorer.create_file(None, &name).await?;
        Ok(())
    }

    /// Ask for a message and commit the staged changes.
    pub async fn commit_interactive(&self) -> Result<()> {
        let Some(message) = self.prompter.input("Commit message", "") else {
            return Ok(());
        };
        let message = message.trim();
        if message.is_empty() {
            return Ok(());
        }
        let hash = self.git.commit(message).await?;
        let short: String = hash.chars().take(7).collect();
        self.bus.emit(&AppEvent::status(
            format!("Committed {}", short),
            MessageLevel::Success,
        ));
        Ok(())
    }

    /// Offer the local branches and check out the one picked.
    pub async fn switch_branch(&self) -> Result<()> {
        let branches = self.git.branches().await?;
        let names: Vec<String> = branches.iter().map(|b| b.name.clone()).collect();
        let Some(choice) = self.prompter.choose("Switch Branch", &names) else {
            return Ok(());
        };
        if branches.iter().any(|b| b.name == choice && b.is_current) {
            return Ok(());
        }
        self.git.checkout(&choice).await
    }

    /// Pull, then push.
    pub async fn sync(&self) -> Result<()> {
        let result = async {
            self.git.pull().await?;
            self.git.push().await
        }
        .await;
        let (text, level) = match &result {
            Ok(()) => ("Successfully synced with remote", MessageLevel::Success),
            Err(_) => ("Failed to sync with remote", MessageLevel::Error),
        };
        self.bus.emit(&AppEvent::status(text, level));
        result
    }

    /// Open a search hit (root-relative) and place the cursor on it.
    pub async fn open_search_result(&self, file: &str, line: u32, column: u32) -> Result<()> {
        let path = self.resolve(file);
        let content = self.read_file(&path).await?;
        self.editor.open_file(&path, &content);
        self.editor.reveal(&path, line, column)
    }

    /// Bring up Git, the explorer and the terminal, then replay the last session.
    pub async fn initialize(&self) -> Result<()> {
        if let Err(e) = self.git.initialize().await {
            log::warn!("Git unavailable: {}", e);
        }
        if let Err(e) = self.explorer.load_directory(&self.root).await {
            log::warn!("Workspace listing failed: {}", e);
        }
        if let Err(e) = self
            .terminal
            .initialize(self.terminal_surface.clone())
            .await
        {
            log::error!("Failed to start terminal: {}", e);
        }
        if self.settings.restore_session {
            self.restore_session().await?;
        }
        log::info!("Workbench ready at {}", self.root);
        Ok(())
    }

    /// Reopen the recorded files in order, reactivate the recorded one and
    /// restore the terminal. Files that fail to load are skipped.
    pub async fn restore_session(&self) -> Result<()> {
        let Some(snapshot) =
            SessionSnapshot::load(self.store.as_ref(), &self.settings.session_key)?
        else {
            return Ok(());
        };
        for path in snapshot.open_files.iter().filter(|p| !p.trim().is_empty()) {
            match self.read_file(path).await {
                Ok(content) => self.editor.open_file(path, &content),
                Err(e) => log::error!("Failed to restore {}: {}", path, e),
            }
        }
        if let Some(active) = &snapshot.active_file {
            if self.editor.get_open_files().contains(active) {
                self.editor.set_active_file(active)?;
            }
        }
        self.terminal.restore_state(snapshot.terminal_state);
        Ok(())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            open_files: self.editor.get_open_files(),
            active_file: self.editor.get_active_file(),
            terminal_state: self.terminal.get_state(),
        }
    }

    pub fn save_session(&self) -> Result<()> {
        self.snapshot()
            .save(self.store.as_ref(), &self.settings.session_key)
    }

    /// Persist the session and release the terminal and editor surfaces.
    pub async fn shutdown(&self) {
        if let Err(e) = self.save_session() {
            log::error!("Failed to save session: {}", e);
        }
        self.terminal.dispose().await;
        self.editor.dispose();
    }
}
