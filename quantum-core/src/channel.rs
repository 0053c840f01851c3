//! The privileged boundary between the UI and the host.
//!
//! Every filesystem, terminal, search and Git operation crosses through
//! [`PrivilegedChannel`], which gates three independent allow-lists:
//! request/response invokes, fire-and-forget sends, and host pushes.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::search::{SearchFlags, SearchProgress};
use crate::util::panic_message;

/// Operation and notification names.
pub mod ops {
    pub const FS_READDIR: &str = "fs.readdir";
    pub const FS_READ_FILE: &str = "fs.readFile";
    pub const FS_WRITE_FILE: &str = "fs.writeFile";
    pub const FS_CREATE_FILE: &str = "fs.createFile";
    pub const FS_CREATE_DIRECTORY: &str = "fs.createDirectory";
    pub const FS_DELETE: &str = "fs.delete";
    pub const FS_RENAME: &str = "fs.rename";

    pub const TERMINAL_CREATE: &str = "terminal.create";
    pub const TERMINAL_WRITE: &str = "terminal.write";
    pub const TERMINAL_RESIZE: &str = "terminal.resize";
    pub const TERMINAL_DESTROY: &str = "terminal.destroy";

    pub const SEARCH_IN_FILES: &str = "search.inFiles";
    pub const SEARCH_REPLACE_ALL: &str = "search.replaceAll";

    pub const GIT_IS_REPO: &str = "git.isRepo";
    pub const GIT_CURRENT_BRANCH: &str = "git.getCurrentBranch";
    pub const GIT_STATUS: &str = "git.status";
    pub const GIT_STAGE: &str = "git.stage";
    pub const GIT_UNSTAGE: &str = "git.unstage";
    pub const GIT_COMMIT: &str = "git.commit";
    pub const GIT_PUSH: &str = "git.push";
    pub const GIT_PULL: &str = "git.pull";
    pub const GIT_CHECKOUT: &str = "git.checkout";
    pub const GIT_CREATE_BRANCH: &str = "git.createBranch";
    pub const GIT_BRANCHES: &str = "git.getBranches";
    pub const GIT_LOG: &str = "git.log";
    pub const GIT_DIFF: &str = "git.diff";
    pub const GIT_STASH: &str = "git.stash";
    pub const GIT_STASH_POP: &str = "git.stashPop";
    pub const GIT_REMOTES: &str = "git.getRemotes";
    pub const GIT_REVERT: &str = "git.revert";

    pub const TERMINAL_INPUT: &str = "terminal.input";
    pub const EDITOR_SAVE: &str = "editor.save";
    pub const EDITOR_CLOSE: &str = "editor.close";
    pub const SEARCH_CANCEL: &str = "search.cancel";
    pub const GIT_REFRESH: &str = "git.refresh";

    pub const TERMINAL_DATA: &str = "terminal.data";
    pub const FS_WATCH: &str = "fs.watch";
    pub const SEARCH_PROGRESS: &str = "search.progress";
    pub const GIT_FILE_CHANGED: &str = "git.fileChanged";
    pub const APP_EVENT: &str = "app-event";
}

pub const INVOKE_CHANNELS: &[&str] = &[
    ops::FS_READDIR,
    ops::FS_READ_FILE,
    ops::FS_WRITE_FILE,
    ops::FS_CREATE_FILE,
    ops::FS_CREATE_DIRECTORY,
    ops::FS_DELETE,
    ops::FS_RENAME,
    ops::TERMINAL_CREATE,
    ops::TERMINAL_WRITE,
    ops::TERMINAL_RESIZE,
    ops::TERMINAL_DESTROY,
    ops::SEARCH_IN_FILES,
    ops::SEARCH_REPLACE_ALL,
    ops::GIT_IS_REPO,
    ops::GIT_CURRENT_BRANCH,
    ops::GIT_STATUS,
    ops::GIT_STAGE,
    ops::GIT_UNSTAGE,
    ops::GIT_COMMIT,
    ops::GIT_PUSH,
    ops::GIT_PULL,
    ops::GIT_CHECKOUT,
    ops::GIT_CREATE_BRANCH,
    ops::GIT_BRANCHES,
    ops::GIT_LOG,
    ops::GIT_DIFF,
    ops::GIT_STASH,
    ops::GIT_STASH_POP,
    ops::GIT_REMOTES,
    ops::GIT_REVERT,
];

pub const SEND_CHANNELS: &[&str] = &[
    ops::TERMINAL_INPUT,
    ops::EDITOR_SAVE,
    ops::EDITOR_CLOSE,
    ops::SEARCH_CANCEL,
    ops::GIT_REFRESH,
];

pub const RECEIVE_CHANNELS: &[&str] = &[
    ops::TERMINAL_DATA,
    ops::FS_WATCH,
    ops::SEARCH_PROGRESS,
    ops::GIT_FILE_CHANGED,
    ops::APP_EVENT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Invoke,
    Send,
    Receive,
}

impl ChannelKind {
    pub fn allow_list(self) -> &'static [&'static str] {
        match self {
            ChannelKind::Invoke => INVOKE_CHANNELS,
            ChannelKind::Send => SEND_CHANNELS,
            ChannelKind::Receive => RECEIVE_CHANNELS,
        }
    }

    pub fn allows(self, name: &str) -> bool {
        self.allow_list().contains(&name)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelKind::Invoke => "invoke",
            ChannelKind::Send => "send",
            ChannelKind::Receive => "receive",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("{kind} channel '{name}' is not allowed")]
    NotAllowed { kind: ChannelKind, name: String },
    #[error("{op} failed: {cause}")]
    Host { op: String, cause: String },
    #[error("{op}: malformed payload: {cause}")]
    Payload { op: String, cause: String },
}

impl ChannelError {
    pub fn op(&self) -> &str {
        match self {
            ChannelError::NotAllowed { name, .. } => name,
            ChannelError::Host { op, .. } | ChannelError::Payload { op, .. } => op,
        }
    }
}

// ---------------------------------------------------------------------------
// Argument shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathArgs {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameArgs {
    pub old_path: String,
    pub new_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalCreateArgs {
    pub cols: u16,
    pub rows: u16,
}

/// Payload of both `terminal.write` (invoke) and `terminal.input` (send).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalWriteArgs {
    pub id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalResizeArgs {
    pub id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalIdArgs {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchArgs {
    pub pattern: String,
    #[serde(default)]
    pub flags: SearchFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceArgs {
    pub pattern: String,
    #[serde(default)]
    pub flags: SearchFlags,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitArgs {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchArgs {
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameArgs {
    pub name: String,
}

fn default_log_limit() -> usize {
    50
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogArgs {
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

impl Default for LogArgs {
    fn default() -> Self {
        LogArgs {
            limit: default_log_limit(),
        }
    }
}

// ---------------------------------------------------------------------------
// Host pushes
// ---------------------------------------------------------------------------

/// A host-initiated notification, tagged by its receive channel name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "payload")]
pub enum Push {
    #[serde(rename = "terminal.data")]
    TerminalData { id: String, data: Vec<u8> },
    #[serde(rename = "fs.watch")]
    FsWatch { path: String },
    #[serde(rename = "search.progress")]
    SearchProgress(SearchProgress),
    #[serde(rename = "git.fileChanged")]
    GitFileChanged { path: String },
    /// Generic envelope re-emitted onto the UI event bus.
    #[serde(rename = "app-event")]
    AppEvent {
        name: String,
        #[serde(default)]
        payload: Value,
    },
}

impl Push {
    pub fn channel(&self) -> &'static str {
        match self {
            Push::TerminalData { .. } => ops::TERMINAL_DATA,
            Push::FsWatch { .. } => ops::FS_WATCH,
            Push::SearchProgress(_) => ops::SEARCH_PROGRESS,
            Push::GitFileChanged { .. } => ops::GIT_FILE_CHANGED,
            Push::AppEvent { .. } => ops::APP_EVENT,
        }
    }
}

// ---------------------------------------------------------------------------
// Host and channel
// ---------------------------------------------------------------------------

pub type HostFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, String>> + Send + 'a>>;

/// The side of the boundary that actually performs privileged work.
pub trait Host: Send + Sync {
    fn invoke<'a>(&'a self, op: &'a str, args: Value) -> HostFuture<'a>;
    fn send(&self, op: &str, payload: Value);
}

pub type ListenerId = u64;
type PushHandler = Arc<dyn Fn(&Push) + Send + Sync>;

struct PushListener {
    id: ListenerId,
    channel: String,
    handler: PushHandler,
}

/// Allow-list gate in front of a [`Host`].
pub struct PrivilegedChannel {
    host: Arc<dyn Host>,
    listeners: Mutex<Vec<PushListener>>,
    next_id: AtomicU64,
}

impl PrivilegedChannel {
    pub fn new(host: Arc<dyn Host>) -> Self {
        PrivilegedChannel {
            host,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn check(kind: ChannelKind, name: &str) -> Result<(), ChannelError> {
        if kind.allows(name) {
            Ok(())
        } else {
            log::warn!("Rejected {} on non-allow-listed channel '{}'", kind, name);
            Err(ChannelError::NotAllowed {
                kind,
                name: name.to_string(),
            })
        }
    }

    /// Request/response call. Unlisted names fail before the host sees them.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, ChannelError> {
        Self::check(ChannelKind::Invoke, name)?;
        log::debug!("invoke {}", name);
        self.host
            .invoke(name, args)
            .await
            .map_err(|cause| ChannelError::Host {
                op: name.to_string(),
                cause,
            })
    }

    /// Typed wrapper over [`invoke`](Self::invoke).
    pub async fn invoke_as<A, T>(&self, name: &str, args: &A) -> Result<T, ChannelError>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        Self::check(ChannelKind::Invoke, name)?;
        let args = serde_json::to_value(args).map_err(|e| ChannelError::Payload {
            op: name.to_string(),
            cause: e.to_string(),
        })?;
        let value = self.invoke(name, args).await?;
        serde_json::from_value(value).map_err(|e| ChannelError::Payload {
            op: name.to_string(),
            cause: e.to_string(),
        })
    }

    /// Fire-and-forget call.
    pub fn send(&self, name: &str, payload: Value) -> Result<(), ChannelError> {
        Self::check(ChannelKind::Send, name)?;
        log::debug!("send {}", name);
        self.host.send(name, payload);
        Ok(())
    }

    /// Subscribe to a push channel.
    pub fn receive<F>(&self, name: &str, handler: F) -> Result<ListenerId, ChannelError>
    where
        F: Fn(&Push) + Send + Sync + 'static,
    {
        Self::check(ChannelKind::Receive, name)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push(PushListener {
            id,
            channel: name.to_string(),
            handler: Arc::new(handler),
        });
        Ok(id)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Dispatch a push to its listeners in subscription order. A panicking
    /// listener is logged and the rest still run.
    pub fn deliver(&self, push: &Push) {
        let channel = push.channel();
        let handlers: Vec<PushHandler> = self
            .listeners
            .lock()
            .iter()
            .filter(|l| l.channel == channel)
            .map(|l| Arc::clone(&l.handler))
            .collect();
        for handler in handlers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(push))) {
                log::error!(
                    "Listener on '{}' panicked: {}",
                    channel,
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    /// Validate and dispatch an untyped push, as received from the host's wire.
    pub fn deliver_raw(&self, channel: &str, payload: Value) -> Result<(), ChannelError> {
        Self::check(ChannelKind::Receive, channel)?;
        let push: Push = serde_json::from_value(serde_json::json!({
            "channel": channel,
            "payload": payload,
        }))
        .map_err(|e| ChannelError::Payload {
            op: channel.to_string(),
            cause: e.to_string(),
        })?;
        self.deliver(&push);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingHost {
        invokes: Mutex<Vec<String>>,
        sends: Mutex<Vec<String>>,
    }

    impl Host for CountingHost {
        fn invoke<'a>(&'a self, op: &'a str, args: Value) -> HostFuture<'a> {
            Box::pin(async move {
                self.invokes.lock().push(op.to_string());
                match op {
                    ops::FS_READ_FILE => Ok(Value::String(format!("contents of {}", args["path"]))),
                    ops::GIT_IS_REPO => Ok(Value::Bool(true)),
                    _ => Err("disk on fire".to_string()),
                }
            })
        }

        fn send(&self, op: &str, _payload: Value) {
            self.sends.lock().push(op.to_string());
        }
    }

    fn channel() -> (Arc<CountingHost>, PrivilegedChannel) {
        let host = Arc::new(CountingHost::default());
        let channel = PrivilegedChannel::new(host.clone());
        (host, channel)
    }

    #[test]
    fn allow_lists_are_disjoint() {
        for name in INVOKE_CHANNELS {
            assert!(!SEND_CHANNELS.contains(name));
            assert!(!RECEIVE_CHANNELS.contains(name));
        }
        for name in SEND_CHANNELS {
            assert!(!RECEIVE_CHANNELS.contains(name));
        }
    }

    #[tokio::test]
    async fn unlisted_invoke_never_reaches_host() {
        let (host, channel) = channel();
        let err = channel
            .invoke("fs.deleteEverything", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ChannelError::NotAllowed {
                kind: ChannelKind::Invoke,
                name: "fs.deleteEverything".into()
            }
        );
        assert!(host.invokes.lock().is_empty());
    }

    #[tokio::test]
    async fn push_names_cannot_be_invoked_and_invoke_names_cannot_be_sent() {
        let (host, channel) = channel();
        assert!(matches!(
            channel.invoke(ops::TERMINAL_DATA, Value::Null).await,
            Err(ChannelError::NotAllowed { .. })
        ));
        assert!(matches!(
            channel.send(ops::FS_DELETE, Value::Null),
            Err(ChannelError::NotAllowed { kind: ChannelKind::Send, .. })
        ));
        assert!(matches!(
            channel.receive(ops::GIT_STATUS, |_| {}),
            Err(ChannelError::NotAllowed { kind: ChannelKind::Receive, .. })
        ));
        assert!(host.invokes.lock().is_empty());
        assert!(host.sends.lock().is_empty());
    }

    #[tokio::test]
    async fn host_failure_carries_operation_name() {
        let (_host, channel) = channel();
        let err = channel.invoke(ops::GIT_PUSH, Value::Null).await.unwrap_err();
        assert_eq!(err.op(), "git.push");
        assert_eq!(err.to_string(), "git.push failed: disk on fire");
    }

    #[tokio::test]
    async fn invoke_as_decodes_results() {
        let (_host, channel) = channel();
        let repo: bool = channel.invoke_as(ops::GIT_IS_REPO, &()).await.unwrap();
        assert!(repo);

        let err = channel
            .invoke_as::<_, Vec<String>>(ops::GIT_IS_REPO, &())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Payload { .. }));
    }

    #[test]
    fn sends_are_forwarded() {
        let (host, channel) = channel();
        channel.send(ops::SEARCH_CANCEL, Value::Null).unwrap();
        assert_eq!(*host.sends.lock(), vec!["search.cancel".to_string()]);
    }

    #[test]
    fn pushes_reach_only_their_channel_listeners() {
        let (_host, channel) = channel();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = channel
            .receive(ops::FS_WATCH, move |push| {
                assert!(matches!(push, Push::FsWatch { .. }));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        channel
            .deliver_raw(ops::FS_WATCH, serde_json::json!({"path": "/w/a.txt"}))
            .unwrap();
        channel.deliver(&Push::GitFileChanged {
            path: "a.txt".into(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(channel.remove_listener(id));
        channel.deliver(&Push::FsWatch { path: "/w".into() });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_panicking_listener_does_not_starve_the_rest() {
        let (_host, channel) = channel();
        let hits = Arc::new(AtomicUsize::new(0));
        channel
            .receive(ops::FS_WATCH, |_| panic!("listener bug"))
            .unwrap();
        let counter = hits.clone();
        channel
            .receive(ops::FS_WATCH, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        channel.deliver(&Push::FsWatch { path: "/w".into() });
        channel.deliver(&Push::FsWatch { path: "/w".into() });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn deliver_raw_rejects_unknown_and_malformed_pushes() {
        let (_host, channel) = channel();
        assert!(matches!(
            channel.deliver_raw("shell.exec", Value::Null),
            Err(ChannelError::NotAllowed { .. })
        ));
        assert!(matches!(
            channel.deliver_raw(ops::TERMINAL_DATA, serde_json::json!({"id": 3})),
            Err(ChannelError::Payload { .. })
        ));
    }

    #[test]
    fn push_wire_shape() {
        let push = Push::AppEvent {
            name: "git.refresh".into(),
            payload: Value::Null,
        };
        assert_eq!(
            serde_json::to_value(&push).unwrap(),
            serde_json::json!({"channel": "app-event", "payload": {"name": "git.refresh", "payload": null}})
        );
        let progress: Push = serde_json::from_value(serde_json::json!({
            "channel": "search.progress",
            "payload": {"filesSearched": 50, "matches": 2}
        }))
        .unwrap();
        assert_eq!(
            progress,
            Push::SearchProgress(SearchProgress {
                files_searched: 50,
                matches: 2
            })
        );
    }

    #[test]
    fn rename_args_use_camel_case() {
        let args: RenameArgs =
            serde_json::from_value(serde_json::json!({"oldPath": "a", "newPath": "b"})).unwrap();
        assert_eq!(args.old_path, "a");
        let log: LogArgs = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(log.limit, 50);
    }
}
