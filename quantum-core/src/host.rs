//! In-process implementation of [`Host`] backed by the local filesystem,
//! a PTY manager, the content searcher and the Git service.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::channel::{
    ops, BranchArgs, CommitArgs, Host, HostFuture, LogArgs, NameArgs, PathArgs, Push, RenameArgs,
    ReplaceArgs, SearchArgs, TerminalCreateArgs, TerminalIdArgs, TerminalResizeArgs,
    TerminalWriteArgs, WriteFileArgs,
};
use crate::git::GitService;
use crate::pty::{PtyEventSender, PtyManager, PtyMessage};
use crate::{filesystem, search, util};

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Workspace root. Also the Git work tree and the cwd of new terminals.
    pub root: PathBuf,
    pub show_hidden: bool,
    /// Reject `fs.*` paths that resolve outside `root`.
    pub confine_to_workspace: bool,
}

impl HostConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        HostConfig {
            root: root.into(),
            show_hidden: false,
            confine_to_workspace: true,
        }
    }
}

/// Forwards PTY reader output onto the push stream.
struct PushSender(UnboundedSender<Push>);

impl PtyEventSender for PushSender {
    fn send(&self, id: &str, msg: PtyMessage) {
        let push = match msg {
            PtyMessage::Output { data } => Push::TerminalData {
                id: id.to_string(),
                data,
            },
            PtyMessage::Exited => Push::AppEvent {
                name: "terminal.exited".to_string(),
                payload: serde_json::json!({ "id": id }),
            },
        };
        // Receiver gone means the UI shut down.
        let _ = self.0.send(push);
    }
}

pub struct LocalHost {
    config: HostConfig,
    git: GitService,
    pty: Arc<PtyManager>,
    pushes: UnboundedSender<Push>,
    /// Cancellation flags of the searches and replacements in flight.
    searches: Mutex<Vec<Arc<AtomicBool>>>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

struct ActiveSearch<'a> {
    searches: &'a Mutex<Vec<Arc<AtomicBool>>>,
    flag: Arc<AtomicBool>,
}

impl Drop for ActiveSearch<'_> {
    fn drop(&mut self) {
        self.searches
            .lock()
            .retain(|flag| !Arc::ptr_eq(flag, &self.flag));
    }
}

fn decode<T: DeserializeOwned>(op: &str, args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("Invalid arguments for {}: {}", op, e))
}

fn encode<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("Failed to encode result: {}", e))
}

/// Run blocking work off the async runtime and encode its result.
async fn blocking<T, F>(f: F) -> Result<Value, String>
where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Result<T, String> + Send + 'static,
{
    let value = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| format!("Host task failed: {}", e))??;
    encode(value)
}

impl LocalHost {
    /// Create the host and the stream of pushes it will produce.
    pub fn new(config: HostConfig) -> (Self, UnboundedReceiver<Push>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = LocalHost {
            git: GitService::new(config.root.clone()),
            config,
            pty: Arc::new(PtyManager::new()),
            pushes: tx,
            searches: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        };
        (host, rx)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Register a fresh cancellation flag, unregistered when the guard drops.
    fn begin_search(&self) -> ActiveSearch<'_> {
        let flag = Arc::new(AtomicBool::new(false));
        self.searches.lock().push(Arc::clone(&flag));
        ActiveSearch {
            searches: &self.searches,
            flag,
        }
    }

    fn root_str(&self) -> String {
        self.config.root.to_string_lossy().to_string()
    }

    /// Resolve a filesystem argument, enforcing workspace confinement when enabled.
    fn fs_path(&self, path: &str) -> Result<String, String> {
        let joined = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.config.root.join(path)
        };
        let joined = joined.to_string_lossy().to_string();
        if !self.config.confine_to_workspace {
            return Ok(joined);
        }
        util::resolve_within_root(&joined, &self.root_str())
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Watch the workspace recursively, pushing `fs.watch` and `git.fileChanged`.
    /// Anything under `.git` is ignored.
    pub fn watch_workspace(&self) -> Result<(), String> {
        use notify::{RecursiveMode, Watcher};

        let pushes = self.pushes.clone();
        let root = self.config.root.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("Filesystem watcher error: {}", e);
                        return;
                    }
                };
                if !matches!(
                    event.kind,
                    notify::EventKind::Create(_)
                        | notify::EventKind::Remove(_)
                        | notify::EventKind::Modify(_)
                ) {
                    return;
                }
                for path in event.paths {
                    if is_git_internal(&path) {
                        continue;
                    }
                    let relative = path
                        .strip_prefix(&root)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .to_string();
                    let _ = pushes.send(Push::FsWatch {
                        path: path.to_string_lossy().to_string(),
                    });
                    let _ = pushes.send(Push::GitFileChanged { path: relative });
                }
            })
            .map_err(|e| format!("Failed to create filesystem watcher: {}", e))?;

        watcher
            .watch(&self.config.root, RecursiveMode::Recursive)
            .map_err(|e| format!("Failed to watch {}: {}", self.config.root.display(), e))?;
        *self.watcher.lock() = Some(watcher);
        log::info!("Watching {}", self.config.root.display());
        Ok(())
    }

    async fn dispatch(&self, op: &str, args: Value) -> Result<Value, String> {
        match op {
            ops::FS_READDIR => {
                let path = self.fs_path(&decode::<PathArgs>(op, args)?.path)?;
                let show_hidden = self.config.show_hidden;
                blocking(move || filesystem::list_directory(&path, show_hidden)).await
            }
            ops::FS_READ_FILE => {
                let path = self.fs_path(&decode::<PathArgs>(op, args)?.path)?;
                blocking(move || filesystem::read_file(&path)).await
            }
            ops::FS_WRITE_FILE => {
                let WriteFileArgs { path, content } = decode(op, args)?;
                let path = self.fs_path(&path)?;
                blocking(move || filesystem::write_file(&path, &content)).await
            }
            ops::FS_CREATE_FILE => {
                let path = self.fs_path(&decode::<PathArgs>(op, args)?.path)?;
                blocking(move || filesystem::create_file(&path)).await
            }
            ops::FS_CREATE_DIRECTORY => {
                let path = self.fs_path(&decode::<PathArgs>(op, args)?.path)?;
                blocking(move || filesystem::create_directory(&path)).await
            }
            ops::FS_DELETE => {
                let path = self.fs_path(&decode::<PathArgs>(op, args)?.path)?;
                if Path::new(&path) == self.config.root.as_path() {
                    return Err("Refusing to delete the workspace root".to_string());
                }
                blocking(move || filesystem::delete_path(&path)).await
            }
            ops::FS_RENAME => {
                let RenameArgs { old_path, new_path } = decode(op, args)?;
                let old_path = self.fs_path(&old_path)?;
                let new_path = self.fs_path(&new_path)?;
                blocking(move || filesystem::rename_path(&old_path, &new_path)).await
            }

            ops::TERMINAL_CREATE => {
                let TerminalCreateArgs { cols, rows } = decode(op, args)?;
                let pty = Arc::clone(&self.pty);
                let sender: Arc<dyn PtyEventSender> = Arc::new(PushSender(self.pushes.clone()));
                let cwd = self.config.root.clone();
                blocking(move || pty.create_session(sender, Some(&cwd), cols, rows)).await
            }
            ops::TERMINAL_WRITE => {
                let TerminalWriteArgs { id, data } = decode(op, args)?;
                self.pty.write_to(&id, data.as_bytes())?;
                Ok(Value::Null)
            }
            ops::TERMINAL_RESIZE => {
                let TerminalResizeArgs { id, cols, rows } = decode(op, args)?;
                self.pty.resize(&id, cols, rows)?;
                Ok(Value::Null)
            }
            ops::TERMINAL_DESTROY => {
                let TerminalIdArgs { id } = decode(op, args)?;
                let pty = Arc::clone(&self.pty);
                blocking(move || pty.close_session(&id)).await
            }

            ops::SEARCH_IN_FILES => {
                let SearchArgs { pattern, flags } = decode(op, args)?;
                let root = self.root_str();
                let active = self.begin_search();
                let cancel = Arc::clone(&active.flag);
                let pushes = self.pushes.clone();
                blocking(move || {
                    search::search_in_files(&root, &pattern, flags, Some(&cancel), |progress| {
                        let _ = pushes.send(Push::SearchProgress(progress));
                    })
                })
                .await
            }
            ops::SEARCH_REPLACE_ALL => {
                let ReplaceArgs {
                    pattern,
                    flags,
                    replacement,
                } = decode(op, args)?;
                let root = self.root_str();
                let active = self.begin_search();
                let cancel = Arc::clone(&active.flag);
                blocking(move || {
                    search::replace_all(&root, &pattern, flags, &replacement, Some(&cancel))
                })
                .await
            }

            ops::GIT_IS_REPO => {
                let git = self.git.clone();
                blocking(move || Ok(git.is_repo())).await
            }
            _ => self.dispatch_git(op, args).await,
        }
    }

    async fn dispatch_git(&self, op: &str, args: Value) -> Result<Value, String> {
        let git = self.git.clone();
        match op {
            ops::GIT_CURRENT_BRANCH => blocking(move || git.current_branch()).await,
            ops::GIT_STATUS => blocking(move || git.status()).await,
            ops::GIT_STAGE => {
                let PathArgs { path } = decode(op, args)?;
                blocking(move || git.stage(&path)).await
            }
            ops::GIT_UNSTAGE => {
                let PathArgs { path } = decode(op, args)?;
                blocking(move || git.unstage(&path)).await
            }
            ops::GIT_COMMIT => {
                let CommitArgs { message } = decode(op, args)?;
                blocking(move || git.commit(&message)).await
            }
            ops::GIT_PUSH => blocking(move || git.push()).await,
            ops::GIT_PULL => blocking(move || git.pull()).await,
            ops::GIT_CHECKOUT => {
                let BranchArgs { branch } = decode(op, args)?;
                blocking(move || git.checkout(&branch)).await
            }
            ops::GIT_CREATE_BRANCH => {
                let NameArgs { name } = decode(op, args)?;
                blocking(move || git.create_branch(&name)).await
            }
            ops::GIT_BRANCHES => blocking(move || git.list_branches()).await,
            ops::GIT_LOG => {
                let LogArgs { limit } = if args.is_null() {
                    LogArgs::default()
                } else {
                    decode(op, args)?
                };
                blocking(move || git.log(limit)).await
            }
            ops::GIT_DIFF => {
                let PathArgs { path } = decode(op, args)?;
                blocking(move || git.diff(&path)).await
            }
            ops::GIT_STASH => blocking(move || git.stash()).await,
            ops::GIT_STASH_POP => blocking(move || git.stash_pop()).await,
            ops::GIT_REMOTES => blocking(move || git.list_remotes()).await,
            ops::GIT_REVERT => {
                let PathArgs { path } = decode(op, args)?;
                blocking(move || git.revert(&path)).await
            }
            _ => Err(format!("Unsupported operation: {}", op)),
        }
    }
}

fn is_git_internal(path: &Path) -> bool {
    path.components()
        .any(|c| matches!(c, Component::Normal(name) if name == ".git"))
}

impl Host for LocalHost {
    fn invoke<'a>(&'a self, op: &'a str, args: Value) -> HostFuture<'a> {
        Box::pin(async move {
            let result = self.dispatch(op, args).await;
            if let Err(e) = &result {
                log::error!("{} failed: {}", op, e);
            }
            result
        })
    }

    fn send(&self, op: &str, payload: Value) {
        match op {
            ops::TERMINAL_INPUT => match decode::<TerminalWriteArgs>(op, payload) {
                Ok(TerminalWriteArgs { id, data }) => {
                    if let Err(e) = self.pty.write_to(&id, data.as_bytes()) {
                        log::warn!("terminal.input dropped: {}", e);
                    }
                }
                Err(e) => log::warn!("{}", e),
            },
            ops::SEARCH_CANCEL => {
                for flag in self.searches.lock().iter() {
                    flag.store(true, Ordering::Relaxed);
                }
            }
            ops::GIT_REFRESH => {
                let _ = self.pushes.send(Push::AppEvent {
                    name: "git.refresh".to_string(),
                    payload: Value::Null,
                });
            }
            ops::EDITOR_SAVE | ops::EDITOR_CLOSE => {
                log::debug!("{}: {}", op, payload);
            }
            _ => log::warn!("Unhandled send '{}'", op),
        }
    }
}
