//! The UI's single cache of repository status.
//!
//! Every mutation goes through the host, then triggers an authoritative
//! [`refresh_status`](GitStateManager::refresh_status). A failed mutation emits
//! `git.error` and leaves the cache untouched.

use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use quantum_core::channel::{
    ops, BranchArgs, CommitArgs, LogArgs, NameArgs, PathArgs, PrivilegedChannel, Push,
};
use quantum_core::git::{
    BranchInfo, ChangeStatus, ChangeType, CommitRecord, GitChangeRecord, GitStatus, RemoteInfo,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::app::spawn_logged;
use crate::error::{Result, UiError};
use crate::event_bus::EventBus;
use crate::events::{names, AppEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepoState {
    Unknown,
    Repository,
    /// Not a repository. Stays this way for the session.
    Inert,
}

struct GitCache {
    repo: RepoState,
    branch: String,
    /// In host order.
    changes: Vec<GitChangeRecord>,
    /// Refresh tickets handed out, and the newest one whose reply was applied.
    requested: u64,
    applied: u64,
}

pub struct GitStateManager {
    bus: EventBus,
    channel: Arc<PrivilegedChannel>,
    root: String,
    cache: Mutex<GitCache>,
    /// Held from a cache write until its `git.statusChanged` is emitted, so
    /// listeners see snapshots in write order. Reentrant for handlers on the
    /// emitting thread.
    publish: ReentrantMutex<()>,
}

impl GitStateManager {
    /// `root` is the workspace root, used to relativize editor paths.
    pub fn new(bus: EventBus, channel: Arc<PrivilegedChannel>, root: impl Into<String>) -> Self {
        GitStateManager {
            bus,
            channel,
            root: root.into(),
            cache: Mutex::new(GitCache {
                repo: RepoState::Unknown,
                branch: String::new(),
                changes: Vec::new(),
                requested: 0,
                applied: 0,
            }),
            publish: ReentrantMutex::new(()),
        }
    }

    /// Wire explorer/editor requests and host change pushes into this manager.
    pub fn attach(self: &Arc<Self>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let forward = move |event: &AppEvent| {
            let Some(git) = weak.upgrade() else {
                return;
            };
            match event.clone() {
                AppEvent::GitStage { path } => {
                    spawn_logged("git stage", async move { git.stage(&path).await });
                }
                AppEvent::GitUnstage { path } => {
                    spawn_logged("git unstage", async move { git.unstage(&path).await });
                }
                AppEvent::GitRevert { path } => {
                    spawn_logged("git revert", async move { git.revert(&path).await });
                }
                AppEvent::GitRefresh => {
                    spawn_logged("git refresh", async move { git.refresh_status().await });
                }
                AppEvent::ContentChanged { path } => git.mark_changed(&path),
                _ => {}
            }
        };
        let forward = Arc::new(forward);
        for name in [
            names::GIT_STAGE,
            names::GIT_UNSTAGE,
            names::GIT_REVERT,
            names::GIT_REFRESH,
            names::EDITOR_CONTENT_CHANGED,
        ] {
            let forward = forward.clone();
            self.bus.on(name, move |event| (*forward)(event));
        }

        let weak = Arc::downgrade(self);
        self.channel.receive(ops::GIT_FILE_CHANGED, move |push| {
            if let (Some(git), Push::GitFileChanged { path }) = (weak.upgrade(), push) {
                git.mark_changed(path);
            }
        })?;
        Ok(())
    }

    fn emit_error(&self, operation: &str, err: &UiError) {
        log::error!("git {} failed: {}", operation, err);
        self.bus.emit(&AppEvent::GitError {
            operation: operation.to_string(),
            message: err.to_string(),
        });
    }

    fn ensure_repo(&self) -> Result<()> {
        if self.cache.lock().repo == RepoState::Inert {
            Err(UiError::NotARepository)
        } else {
            Ok(())
        }
    }

    async fn call<A, T>(&self, operation: &str, op: &str, args: &A) -> Result<T>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.ensure_repo()?;
        match self.channel.invoke_as(op, args).await {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = UiError::from(e);
                self.emit_error(operation, &err);
                Err(err)
            }
        }
    }

    /// Invoke a mutation, then refresh. A failed invoke skips the refresh.
    async fn mutate<A, T>(&self, operation: &str, op: &str, args: &A) -> Result<T>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let value = self.call(operation, op, args).await?;
        if let Err(e) = self.refresh_status().await {
            log::warn!("Refresh after git {} failed: {}", operation, e);
        }
        Ok(value)
    }

    /// Check the workspace. Returns `false` and goes inert when it is not a repository.
    pub async fn initialize(&self) -> Result<bool> {
        let is_repo: bool = self.call("init", ops::GIT_IS_REPO, &Value::Null).await?;
        if !is_repo {
            log::info!("{} is not a git repository; git integration disabled", self.root);
            self.cache.lock().repo = RepoState::Inert;
            return Ok(false);
        }
        self.cache.lock().repo = RepoState::Repository;
        let branch: String = self
            .call("init", ops::GIT_CURRENT_BRANCH, &Value::Null)
            .await?;
        self.cache.lock().branch = branch;
        self.refresh_status().await?;
        Ok(true)
    }

    pub fn is_inert(&self) -> bool {
        self.cache.lock().repo == RepoState::Inert
    }

    /// Fetch full status and replace the cache wholesale. No-op when inert.
    ///
    /// A reply older than one already applied is dropped.
    pub async fn refresh_status(&self) -> Result<()> {
        let ticket = {
            let mut cache = self.cache.lock();
            if cache.repo == RepoState::Inert {
                return Ok(());
            }
            cache.requested += 1;
            cache.requested
        };
        let status: GitStatus = self.call("status", ops::GIT_STATUS, &Value::Null).await?;
        let _publish = self.publish.lock();
        {
            let mut cache = self.cache.lock();
            if ticket < cache.applied {
                log::debug!("Dropping stale git status reply #{}", ticket);
                return Ok(());
            }
            cache.applied = ticket;
            cache.branch = status.branch.clone();
            cache.changes = status.files.clone();
        }
        self.bus.emit(&AppEvent::GitStatusChanged {
            branch: status.branch,
            changes: status.files,
        });
        Ok(())
    }

    /// Record a provisional modification for instant feedback. The next refresh replaces it.
    pub fn mark_changed(&self, path: &str) {
        let path = Path::new(path)
            .strip_prefix(&self.root)
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| path.to_string());
        let _publish = self.publish.lock();
        let (branch, changes) = {
            let mut cache = self.cache.lock();
            if cache.repo == RepoState::Inert || cache.changes.iter().any(|c| c.path == path) {
                return;
            }
            cache.changes.push(GitChangeRecord {
                path,
                status: ChangeStatus::Modified,
                staged: false,
                kind: ChangeType::Working,
            });
            (cache.branch.clone(), cache.changes.clone())
        };
        self.bus.emit(&AppEvent::GitStatusChanged { branch, changes });
    }

    pub async fn stage(&self, path: &str) -> Result<()> {
        let args = PathArgs {
            path: path.to_string(),
        };
        self.mutate("stage", ops::GIT_STAGE, &args).await
    }

    pub async fn unstage(&self, path: &str) -> Result<()> {
        let args = PathArgs {
            path: path.to_string(),
        };
        self.mutate("unstage", ops::GIT_UNSTAGE, &args).await
    }

    /// Returns the new commit id.
    pub async fn commit(&self, message: &str) -> Result<String> {
        let args = CommitArgs {
            message: message.to_string(),
        };
        self.mutate("commit", ops::GIT_COMMIT, &args).await
    }

    pub async fn push(&self) -> Result<()> {
        self.mutate("push", ops::GIT_PUSH, &Value::Null).await
    }

    pub async fn pull(&self) -> Result<()> {
        self.mutate("pull", ops::GIT_PULL, &Value::Null).await
    }

    /// Switch branches. The cached branch name changes before the refresh confirms it.
    pub async fn checkout(&self, branch: &str) -> Result<()> {
        let args = BranchArgs {
            branch: branch.to_string(),
        };
        self.call::<_, ()>("checkout", ops::GIT_CHECKOUT, &args).await?;
        self.cache.lock().branch = branch.to_string();
        if let Err(e) = self.refresh_status().await {
            log::warn!("Refresh after git checkout failed: {}", e);
        }
        Ok(())
    }

    pub async fn create_branch(&self, name: &str) -> Result<()> {
        let args = NameArgs {
            name: name.to_string(),
        };
        self.mutate("createBranch", ops::GIT_CREATE_BRANCH, &args).await
    }

    pub async fn stash(&self) -> Result<()> {
        self.mutate("stash", ops::GIT_STASH, &Value::Null).await
    }

    pub async fn stash_pop(&self) -> Result<()> {
        self.mutate("stashPop", ops::GIT_STASH_POP, &Value::Null).await
    }

    /// Discard working-tree changes to `path`.
    pub async fn revert(&self, path: &str) -> Result<()> {
        let args = PathArgs {
            path: path.to_string(),
        };
        self.mutate("revert", ops::GIT_REVERT, &args).await
    }

    pub async fn branches(&self) -> Result<Vec<BranchInfo>> {
        self.call("branches", ops::GIT_BRANCHES, &Value::Null).await
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<CommitRecord>> {
        self.call("log", ops::GIT_LOG, &LogArgs { limit }).await
    }

    pub async fn diff(&self, path: &str) -> Result<String> {
        let args = PathArgs {
            path: path.to_string(),
        };
        self.call("diff", ops::GIT_DIFF, &args).await
    }

    pub async fn remotes(&self) -> Result<Vec<RemoteInfo>> {
        self.call("remotes", ops::GIT_REMOTES, &Value::Null).await
    }

    pub fn branch(&self) -> String {
        self.cache.lock().branch.clone()
    }

    pub fn changes(&self) -> Vec<GitChangeRecord> {
        self.cache.lock().changes.clone()
    }

    pub fn change(&self, path: &str) -> Option<GitChangeRecord> {
        self.cache
            .lock()
            .changes
            .iter()
            .find(|c| c.path == path)
            .cloned()
    }

    /// Added and modified records.
    pub fn unpushed_count(&self) -> usize {
        count_unpushed(&self.cache.lock().changes)
    }

    /// The host has no ahead/behind primitive, so incoming changes are never counted.
    pub fn unpulled_count(&self) -> usize {
        0
    }
}

/// Records counted as outgoing: added and modified entries.
pub fn count_unpushed(changes: &[GitChangeRecord]) -> usize {
    changes
        .iter()
        .filter(|c| matches!(c.status, ChangeStatus::Added | ChangeStatus::Modified))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedHost;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn status(branch: &str, files: Value) -> Value {
        json!({ "branch": branch, "files": files })
    }

    fn manager(host: &Arc<ScriptedHost>) -> (EventBus, Arc<GitStateManager>) {
        let bus = EventBus::new();
        let git = Arc::new(GitStateManager::new(bus.clone(), host.channel(), "/w"));
        (bus, git)
    }

    fn collect_status(bus: &EventBus) -> Arc<Mutex<Vec<Vec<GitChangeRecord>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on(names::GIT_STATUS_CHANGED, move |event| {
            if let AppEvent::GitStatusChanged { changes, .. } = event {
                sink.lock().push(changes.clone());
            }
        });
        seen
    }

    #[tokio::test]
    async fn stage_then_refresh_reports_the_file_staged() {
        let staged = Arc::new(AtomicBool::new(false));
        let flag = staged.clone();
        let host = ScriptedHost::new(move |op, _| match op {
            ops::GIT_IS_REPO => Ok(json!(true)),
            ops::GIT_CURRENT_BRANCH => Ok(json!("main")),
            ops::GIT_STATUS => {
                let x = if flag.load(Ordering::SeqCst) { "M" } else { " " };
                let record = GitChangeRecord::from_codes("a.txt", x.chars().next().unwrap(), 'M');
                Ok(status("main", json!([record])))
            }
            ops::GIT_STAGE => {
                flag.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            }
            _ => Ok(Value::Null),
        });
        let (bus, git) = manager(&host);
        let seen = collect_status(&bus);

        assert!(git.initialize().await.unwrap());
        let record = git.change("a.txt").unwrap();
        assert_eq!((record.status, record.staged), (ChangeStatus::Modified, false));
        assert_eq!(
            serde_json::to_value(&seen.lock()[0]).unwrap(),
            json!([{"path": "a.txt", "status": "modified", "staged": false, "type": "working"}])
        );

        git.stage("a.txt").await.unwrap();
        let record = git.change("a.txt").unwrap();
        assert_eq!((record.status, record.staged), (ChangeStatus::Modified, true));
        assert_eq!(host.invoked(ops::GIT_STAGE), vec![json!({"path": "a.txt"})]);
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_refreshes_keep_the_last_response() {
        let host = ScriptedHost::ok();
        let (_, git) = manager(&host);
        let first = host.defer(ops::GIT_STATUS);
        let second = host.defer(ops::GIT_STATUS);

        let a = tokio::spawn({
            let git = git.clone();
            async move { git.refresh_status().await }
        });
        let b = tokio::spawn({
            let git = git.clone();
            async move { git.refresh_status().await }
        });
        while host.invoked(ops::GIT_STATUS).len() < 2 {
            tokio::task::yield_now().await;
        }

        let stale = GitChangeRecord::from_codes("old.txt", ' ', 'M');
        first.send(Ok(status("main", json!([stale])))).unwrap();
        while git.change("old.txt").is_none() {
            tokio::task::yield_now().await;
        }

        let fresh = GitChangeRecord::from_codes("new.txt", '?', '?');
        second.send(Ok(status("main", json!([fresh.clone()])))).unwrap();
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(git.changes(), vec![fresh]);
    }

    #[tokio::test]
    async fn a_reply_older_than_the_applied_one_is_dropped() {
        let host = ScriptedHost::ok();
        let (bus, git) = manager(&host);
        let seen = collect_status(&bus);
        let first = host.defer(ops::GIT_STATUS);
        let second = host.defer(ops::GIT_STATUS);

        let a = tokio::spawn({
            let git = git.clone();
            async move { git.refresh_status().await }
        });
        let b = tokio::spawn({
            let git = git.clone();
            async move { git.refresh_status().await }
        });
        while host.invoked(ops::GIT_STATUS).len() < 2 {
            tokio::task::yield_now().await;
        }

        let fresh = GitChangeRecord::from_codes("new.txt", '?', '?');
        second.send(Ok(status("main", json!([fresh.clone()])))).unwrap();
        b.await.unwrap().unwrap();

        let stale = GitChangeRecord::from_codes("old.txt", ' ', 'M');
        first.send(Ok(status("main", json!([stale])))).unwrap();
        a.await.unwrap().unwrap();

        assert_eq!(git.changes(), vec![fresh.clone()]);
        assert_eq!(*seen.lock(), vec![vec![fresh]]);
    }

    #[tokio::test]
    async fn failed_mutations_emit_errors_and_skip_refresh() {
        let host = ScriptedHost::new(|op, _| match op {
            ops::GIT_COMMIT => Err("Nothing to commit".into()),
            ops::GIT_STATUS => Ok(status("main", json!([]))),
            _ => Ok(Value::Null),
        });
        let (bus, git) = manager(&host);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        bus.on(names::GIT_ERROR, move |event| {
            if let AppEvent::GitError { operation, message } = event {
                sink.lock().push((operation.clone(), message.clone()));
            }
        });

        let err = git.commit("msg").await.unwrap_err();
        assert!(err.to_string().contains("Nothing to commit"));
        assert!(host.invoked(ops::GIT_STATUS).is_empty());
        assert_eq!(errors.lock()[0].0, "commit");
        assert!(errors.lock()[0].1.contains("git.commit"));
    }

    #[tokio::test]
    async fn successful_mutations_refresh_once() {
        let host = ScriptedHost::new(|op, _| match op {
            ops::GIT_STATUS => Ok(status("main", json!([]))),
            ops::GIT_COMMIT => Ok(json!("abc123")),
            _ => Ok(Value::Null),
        });
        let (_, git) = manager(&host);
        assert_eq!(git.commit("first").await.unwrap(), "abc123");
        git.push().await.unwrap();
        git.pull().await.unwrap();
        git.create_branch("topic").await.unwrap();
        git.stash().await.unwrap();
        git.stash_pop().await.unwrap();
        git.revert("a.txt").await.unwrap();
        git.unstage("a.txt").await.unwrap();
        assert_eq!(host.invoked(ops::GIT_STATUS).len(), 8);
        assert_eq!(host.invoked(ops::GIT_CREATE_BRANCH), vec![json!({"name": "topic"})]);
    }

    #[tokio::test]
    async fn checkout_updates_the_branch_before_refresh() {
        let host = ScriptedHost::new(|op, _| match op {
            ops::GIT_STATUS => Err("index locked".into()),
            _ => Ok(Value::Null),
        });
        let (_, git) = manager(&host);
        git.checkout("feature").await.unwrap();
        assert_eq!(git.branch(), "feature");
        assert_eq!(host.invoked(ops::GIT_CHECKOUT), vec![json!({"branch": "feature"})]);
    }

    #[tokio::test]
    async fn non_repositories_stay_inert() {
        let host = ScriptedHost::new(|op, _| match op {
            ops::GIT_IS_REPO => Ok(json!(false)),
            _ => Ok(Value::Null),
        });
        let (_, git) = manager(&host);
        assert!(!git.initialize().await.unwrap());
        assert!(git.is_inert());

        git.refresh_status().await.unwrap();
        assert_eq!(git.stage("a.txt").await, Err(UiError::NotARepository));
        git.mark_changed("/w/a.txt");
        assert_eq!(host.invokes().len(), 1);
        assert!(git.changes().is_empty());
    }

    #[tokio::test]
    async fn overlay_is_replaced_by_the_next_refresh() {
        let host = ScriptedHost::new(|op, _| match op {
            ops::GIT_STATUS => Ok(status("main", json!([]))),
            _ => Ok(Value::Null),
        });
        let (bus, git) = manager(&host);
        git.attach().unwrap();
        let seen = collect_status(&bus);

        bus.emit(&AppEvent::ContentChanged {
            path: "/w/src/lib.rs".into(),
        });
        let provisional = git.change("src/lib.rs").unwrap();
        assert_eq!(provisional.status, ChangeStatus::Modified);
        assert!(!provisional.staged);
        assert_eq!(git.unpushed_count(), 1);

        git.refresh_status().await.unwrap();
        assert!(git.changes().is_empty());
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(git.unpulled_count(), 0);
    }

    #[tokio::test]
    async fn reads_decode_host_shapes() {
        let host = ScriptedHost::new(|op, _| match op {
            ops::GIT_BRANCHES => Ok(json!([{"name": "main", "isCurrent": true}])),
            ops::GIT_LOG => Ok(json!([{
                "hash": "abc", "author": "Ann", "email": "ann@example.com",
                "timestamp": 0, "date": "1970-01-01 00:00:00",
                "subject": "init", "body": ""
            }])),
            ops::GIT_DIFF => Ok(json!("@@ -1 +1 @@")),
            ops::GIT_REMOTES => Ok(json!([{"name": "origin", "url": "git@example.com:x.git"}])),
            _ => Ok(Value::Null),
        });
        let (_, git) = manager(&host);
        assert!(git.branches().await.unwrap()[0].is_current);
        assert_eq!(git.history(5).await.unwrap()[0].subject, "init");
        assert_eq!(host.invoked(ops::GIT_LOG), vec![json!({"limit": 5})]);
        assert!(git.diff("a.txt").await.unwrap().starts_with("@@"));
        assert_eq!(git.remotes().await.unwrap()[0].name, "origin");
    }

    #[tokio::test]
    async fn bus_requests_are_forwarded() {
        let host = ScriptedHost::new(|op, _| match op {
            ops::GIT_STATUS => Ok(status("main", json!([]))),
            _ => Ok(Value::Null),
        });
        let (bus, git) = manager(&host);
        git.attach().unwrap();
        bus.emit(&AppEvent::GitStage {
            path: "a.txt".into(),
        });
        for _ in 0..20 {
            if !host.invoked(ops::GIT_STATUS).is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(host.invoked(ops::GIT_STAGE), vec![json!({"path": "a.txt"})]);
        assert_eq!(host.invoked(ops::GIT_STATUS).len(), 1);
    }
}
