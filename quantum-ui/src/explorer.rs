//! Workspace file tree with lazy expansion and Git decorations.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use quantum_core::channel::{ops, PathArgs, PrivilegedChannel, Push, RenameArgs, WriteFileArgs};
use quantum_core::filesystem::FileTreeNode;
use quantum_core::git::GitChangeRecord;

use crate::app::spawn_logged;
use crate::error::{Result, UiError};
use crate::event_bus::EventBus;
use crate::events::{names, AppEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub entry: FileTreeNode,
    /// `None` until expanded. Collapsing drops the children again.
    pub children: Option<Vec<TreeNode>>,
    pub decoration: Option<GitChangeRecord>,
}

impl TreeNode {
    pub fn kind(&self) -> NodeKind {
        if self.entry.is_directory {
            NodeKind::Directory
        } else {
            NodeKind::File
        }
    }

    pub fn is_expanded(&self) -> bool {
        self.children.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    NewFile,
    NewFolder,
    Refresh,
    Copy,
    Cut,
    Paste,
    Stage,
    Unstage,
    Revert,
    Delete,
    Rename,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuItem {
    Action {
        action: MenuAction,
        label: &'static str,
        shortcut: Option<&'static str>,
    },
    Separator,
}

fn item(action: MenuAction, label: &'static str, shortcut: Option<&'static str>) -> MenuItem {
    MenuItem::Action {
        action,
        label,
        shortcut,
    }
}

/// Context menu for a node, or for the empty tree area when `target` is `None`.
pub fn context_menu_actions(target: Option<(NodeKind, Option<&GitChangeRecord>)>) -> Vec<MenuItem> {
    let Some((kind, decoration)) = target else {
        return vec![
            item(MenuAction::NewFile, "New File", Some("Ctrl+N")),
            item(MenuAction::NewFolder, "New Folder", None),
            MenuItem::Separator,
            item(MenuAction::Refresh, "Refresh Explorer", None),
        ];
    };

    let mut items = Vec::new();
    if kind == NodeKind::Directory {
        items.push(item(MenuAction::NewFile, "New File", None));
        items.push(item(MenuAction::NewFolder, "New Folder", None));
        items.push(MenuItem::Separator);
    }
    items.push(item(MenuAction::Copy, "Copy", Some("Ctrl+C")));
    items.push(item(MenuAction::Cut, "Cut", Some("Ctrl+X")));
    items.push(item(MenuAction::Paste, "Paste", Some("Ctrl+V")));
    items.push(MenuItem::Separator);
    if let Some(record) = decoration {
        if record.staged {
            items.push(item(MenuAction::Unstage, "Unstage Changes", None));
        } else {
            items.push(item(MenuAction::Stage, "Stage Changes", None));
        }
        items.push(item(MenuAction::Revert, "Revert Changes", None));
        items.push(MenuItem::Separator);
    }
    items.push(item(MenuAction::Delete, "Delete", Some("Del")));
    items.push(item(MenuAction::Rename, "Rename", Some("F2")));
    items
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Clipboard {
    path: String,
    cut: bool,
}

#[derive(Default)]
struct ExplorerState {
    root: Option<String>,
    nodes: Vec<TreeNode>,
    /// Keyed by repository-relative path.
    decorations: HashMap<String, GitChangeRecord>,
    clipboard: Option<Clipboard>,
    /// Empty until the first `git.statusChanged`.
    branch: String,
}

impl ExplorerState {
    fn decoration_for(&self, path: &str) -> Option<GitChangeRecord> {
        self.decorations
            .get(&relative_key(self.root.as_deref(), path))
            .cloned()
    }

    fn to_nodes(&self, mut entries: Vec<FileTreeNode>) -> Vec<TreeNode> {
        entries.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.cmp(&b.name))
        });
        entries
            .into_iter()
            .map(|entry| TreeNode {
                decoration: self.decoration_for(&entry.path),
                entry,
                children: None,
            })
            .collect()
    }
}

fn relative_key(root: Option<&str>, path: &str) -> String {
    root.and_then(|root| Path::new(path).strip_prefix(root).ok())
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        .unwrap_or_else(|| path.to_string())
}

fn find<'a>(nodes: &'a [TreeNode], path: &str) -> Option<&'a TreeNode> {
    for node in nodes {
        if node.entry.path == path {
            return Some(node);
        }
        if let Some(found) = node.children.as_deref().and_then(|c| find(c, path)) {
            return Some(found);
        }
    }
    None
}

fn find_mut<'a>(nodes: &'a mut [TreeNode], path: &str) -> Option<&'a mut TreeNode> {
    for node in nodes.iter_mut() {
        if node.entry.path == path {
            return Some(node);
        }
        if let Some(children) = node.children.as_mut() {
            if let Some(found) = find_mut(children, path) {
                return Some(found);
            }
        }
    }
    None
}

fn collapse_recursive(nodes: &mut [TreeNode]) {
    for node in nodes {
        node.children = None;
    }
}

fn parent_of(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn join(dir: &str, name: &str) -> String {
    Path::new(dir).join(name).to_string_lossy().to_string()
}

pub struct FileExplorer {
    bus: EventBus,
    channel: Arc<PrivilegedChannel>,
    state: Mutex<ExplorerState>,
}

impl FileExplorer {
    pub fn new(bus: EventBus, channel: Arc<PrivilegedChannel>) -> Self {
        FileExplorer {
            bus,
            channel,
            state: Mutex::new(ExplorerState::default()),
        }
    }

    /// Follow `git.statusChanged` and refresh on `fs.watch` pushes.
    pub fn attach(self: &Arc<Self>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.bus.on(names::GIT_STATUS_CHANGED, move |event| {
            if let (Some(explorer), AppEvent::GitStatusChanged { branch, changes }) =
                (weak.upgrade(), event)
            {
                explorer.update_git_status(changes);
                explorer.set_branch(branch);
            }
        });

        let weak = Arc::downgrade(self);
        self.channel.receive(ops::FS_WATCH, move |push| {
            let (Some(explorer), Push::FsWatch { path }) = (weak.upgrade(), push) else {
                return;
            };
            let dir = parent_of(path);
            spawn_logged("explorer refresh", async move {
                explorer.refresh_directory(&dir).await
            });
        })?;
        Ok(())
    }

    pub fn root(&self) -> Option<String> {
        self.state.lock().root.clone()
    }

    /// Snapshot of the rendered tree.
    pub fn nodes(&self) -> Vec<TreeNode> {
        self.state.lock().nodes.clone()
    }

    pub fn node(&self, path: &str) -> Option<TreeNode> {
        find(&self.state.lock().nodes, path).cloned()
    }

    pub fn branch_label(&self) -> String {
        self.state.lock().branch.clone()
    }

    pub fn set_branch(&self, branch: &str) {
        self.state.lock().branch = branch.to_string();
    }

    fn report(&self, kind: &str, err: UiError) -> UiError {
        log::error!("Explorer {} failed: {}", kind, err);
        self.bus.emit(&AppEvent::ExplorerError {
            kind: kind.to_string(),
            message: err.to_string(),
        });
        err
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileTreeNode>> {
        let entries = self
            .channel
            .invoke_as(
                ops::FS_READDIR,
                &PathArgs {
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(entries)
    }

    /// Replace the whole tree with a fresh listing of `path`.
    pub async fn load_directory(&self, path: &str) -> Result<()> {
        let entries = match self.read_dir(path).await {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("Failed to load directory {}: {}", path, e);
                self.bus.emit(&AppEvent::ExplorerError {
                    kind: "load".to_string(),
                    message: format!("Failed to load directory: {}", e),
                });
                return Err(e);
            }
        };
        {
            let mut state = self.state.lock();
            state.root = Some(path.to_string());
            let nodes = state.to_nodes(entries);
            state.nodes = nodes;
        }
        self.bus.emit(&AppEvent::ExplorerLoaded {
            path: path.to_string(),
        });
        Ok(())
    }

    /// Fetch and insert children of a collapsed directory. Expanded nodes are left alone.
    pub async fn expand_directory(&self, path: &str) -> Result<()> {
        match self.node(path) {
            Some(node) if node.kind() == NodeKind::Directory && !node.is_expanded() => {}
            _ => return Ok(()),
        }
        let entries = self.read_dir(path).await.inspect_err(|e| {
            log::error!("Failed to expand directory {}: {}", path, e);
        })?;
        let mut state = self.state.lock();
        let children = state.to_nodes(entries);
        if let Some(node) = find_mut(&mut state.nodes, path) {
            if node.children.is_none() {
                node.children = Some(children);
            }
        }
        Ok(())
    }

    pub fn collapse_directory(&self, path: &str) -> bool {
        match find_mut(&mut self.state.lock().nodes, path) {
            Some(node) => node.children.take().is_some(),
            None => false,
        }
    }

    pub fn collapse_all(&self) {
        collapse_recursive(&mut self.state.lock().nodes);
    }

    pub async fn toggle_directory(&self, path: &str) -> Result<()> {
        if self.node(path).is_some_and(|n| n.is_expanded()) {
            self.collapse_directory(path);
            Ok(())
        } else {
            self.expand_directory(path).await
        }
    }

    /// Click on a node: directories toggle, files open.
    pub async fn activate(&self, path: &str) -> Result<()> {
        match self.node(path).map(|n| n.kind()) {
            Some(NodeKind::Directory) => self.toggle_directory(path).await,
            _ => self.open_file(path).await,
        }
    }

    /// Replace the decoration map and re-derive every rendered node's decoration.
    pub fn update_git_status(&self, changes: &[GitChangeRecord]) {
        let mut state = self.state.lock();
        state.decorations = changes
            .iter()
            .map(|change| (change.path.clone(), change.clone()))
            .collect();
        let ExplorerState {
            root,
            nodes,
            decorations,
            ..
        } = &mut *state;
        redecorate(nodes, root.as_deref(), decorations);
    }

    pub fn decoration(&self, path: &str) -> Option<GitChangeRecord> {
        self.state.lock().decoration_for(path)
    }

    pub async fn open_file(&self, path: &str) -> Result<()> {
        let args = PathArgs {
            path: path.to_string(),
        };
        match self.channel.invoke_as::<_, String>(ops::FS_READ_FILE, &args).await {
            Ok(content) => {
                self.bus.emit(&AppEvent::FileOpen {
                    path: path.to_string(),
                    content,
                });
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to open file {}: {}", path, e);
                self.bus.emit(&AppEvent::ExplorerError {
                    kind: "open".to_string(),
                    message: format!("Failed to open file: {}", e),
                });
                Err(e.into())
            }
        }
    }

    fn parent_or_root(&self, parent: Option<&str>) -> String {
        parent
            .map(str::to_string)
            .or_else(|| self.root())
            .unwrap_or_default()
    }

    /// Create an empty file and open it. Returns the new path.
    pub async fn create_file(&self, parent: Option<&str>, name: &str) -> Result<String> {
        let parent = self.parent_or_root(parent);
        let path = join(&parent, name.trim());
        self.channel
            .invoke_as::<_, ()>(ops::FS_CREATE_FILE, &PathArgs { path: path.clone() })
            .await
            .map_err(|e| self.report("create", e.into()))?;
        self.refresh_directory(&parent).await?;
        self.bus.emit(&AppEvent::FileOpen {
            path: path.clone(),
            content: String::new(),
        });
        Ok(path)
    }

    pub async fn create_folder(&self, parent: Option<&str>, name: &str) -> Result<String> {
        let parent = self.parent_or_root(parent);
        let path = join(&parent, name.trim());
        self.channel
            .invoke_as::<_, ()>(ops::FS_CREATE_DIRECTORY, &PathArgs { path: path.clone() })
            .await
            .map_err(|e| self.report("create", e.into()))?;
        self.refresh_directory(&parent).await?;
        Ok(path)
    }

    /// Rename within the same directory. Returns the new path.
    pub async fn rename(&self, path: &str, new_name: &str) -> Result<String> {
        let dir = parent_of(path);
        let new_path = join(&dir, new_name.trim());
        self.move_path(path, &new_path).await?;
        self.refresh_directory(&dir).await?;
        Ok(new_path)
    }

    async fn move_path(&self, old_path: &str, new_path: &str) -> Result<()> {
        let args = RenameArgs {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
        };
        self.channel
            .invoke_as::<_, ()>(ops::FS_RENAME, &args)
            .await
            .map_err(|e| self.report("rename", e.into()))
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.channel
            .invoke_as::<_, ()>(
                ops::FS_DELETE,
                &PathArgs {
                    path: path.to_string(),
                },
            )
            .await
            .map_err(|e| self.report("delete", e.into()))?;
        self.refresh_directory(&parent_of(path)).await
    }

    pub fn copy(&self, path: &str) {
        self.state.lock().clipboard = Some(Clipboard {
            path: path.to_string(),
            cut: false,
        });
    }

    pub fn cut(&self, path: &str) {
        self.state.lock().clipboard = Some(Clipboard {
            path: path.to_string(),
            cut: true,
        });
    }

    /// Clipboard path and whether it was cut.
    pub fn clipboard(&self) -> Option<(String, bool)> {
        self.state
            .lock()
            .clipboard
            .as_ref()
            .map(|c| (c.path.clone(), c.cut))
    }

    /// Paste the clipboard into `target` (a directory, or a file's directory).
    /// Returns the created path, or `None` with an empty clipboard.
    pub async fn paste(&self, target: &str) -> Result<Option<String>> {
        let (clipboard, source_kind, target_kind) = {
            let state = self.state.lock();
            let Some(clipboard) = state.clipboard.clone() else {
                return Ok(None);
            };
            let source_kind = find(&state.nodes, &clipboard.path).map(TreeNode::kind);
            let target_kind = find(&state.nodes, target).map(TreeNode::kind);
            (clipboard, source_kind, target_kind)
        };
        let dir = match target_kind {
            Some(NodeKind::File) => parent_of(target),
            _ => target.to_string(),
        };
        let name = Path::new(&clipboard.path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let destination = join(&dir, &name);

        if clipboard.cut {
            self.move_path(&clipboard.path, &destination).await?;
            self.state.lock().clipboard = None;
            self.refresh_directory(&parent_of(&clipboard.path)).await?;
        } else {
            if source_kind == Some(NodeKind::Directory) {
                let err = UiError::Unsupported("copying directories".to_string());
                return Err(self.report("paste", err));
            }
            self.copy_file(&clipboard.path, &destination)
                .await
                .map_err(|e| self.report("paste", e))?;
        }
        self.refresh_directory(&dir).await?;
        Ok(Some(destination))
    }

    async fn copy_file(&self, source: &str, destination: &str) -> Result<()> {
        let content: String = self
            .channel
            .invoke_as(
                ops::FS_READ_FILE,
                &PathArgs {
                    path: source.to_string(),
                },
            )
            .await?;
        self.channel
            .invoke_as::<_, ()>(
                ops::FS_CREATE_FILE,
                &PathArgs {
                    path: destination.to_string(),
                },
            )
            .await?;
        self.channel
            .invoke_as::<_, ()>(
                ops::FS_WRITE_FILE,
                &WriteFileArgs {
                    path: destination.to_string(),
                    content,
                },
            )
            .await?;
        Ok(())
    }

    /// Reload the root listing, or re-fetch an expanded directory's children.
    pub async fn refresh_directory(&self, dir: &str) -> Result<()> {
        let (root, expanded) = {
            let state = self.state.lock();
            let expanded = find(&state.nodes, dir).is_some_and(TreeNode::is_expanded);
            (state.root.clone(), expanded)
        };
        if root.as_deref() == Some(dir) {
            return self.load_directory(dir).await;
        }
        if !expanded {
            return Ok(());
        }
        let entries = self.read_dir(dir).await?;
        let mut state = self.state.lock();
        let children = state.to_nodes(entries);
        if let Some(node) = find_mut(&mut state.nodes, dir) {
            node.children = Some(children);
        }
        Ok(())
    }

    /// Context menu for `path`, or for the empty area.
    pub fn context_menu(&self, path: Option<&str>) -> Vec<MenuItem> {
        let state = self.state.lock();
        match path.and_then(|p| find(&state.nodes, p)) {
            Some(node) => context_menu_actions(Some((node.kind(), node.decoration.as_ref()))),
            None => context_menu_actions(None),
        }
    }

    /// Emit the Git event for a stage/unstage/revert menu choice.
    pub fn emit_git_action(&self, action: MenuAction, path: &str) -> bool {
        let path = relative_key(self.root().as_deref(), path);
        let event = match action {
            MenuAction::Stage => AppEvent::GitStage { path },
            MenuAction::Unstage => AppEvent::GitUnstage { path },
            MenuAction::Revert => AppEvent::GitRevert { path },
            _ => return false,
        };
        self.bus.emit(&event);
        true
    }
}

fn redecorate(
    nodes: &mut [TreeNode],
    root: Option<&str>,
    decorations: &HashMap<String, GitChangeRecord>,
) {
    for node in nodes {
        node.decoration = decorations
            .get(&relative_key(root, &node.entry.path))
            .cloned();
        if let Some(children) = node.children.as_mut() {
            redecorate(children, root, decorations);
        }
    }
}
