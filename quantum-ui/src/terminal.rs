use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use quantum_core::channel::{
    ops, PrivilegedChannel, Push, TerminalCreateArgs, TerminalIdArgs, TerminalResizeArgs,
    TerminalWriteArgs,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UiError};
use crate::event_bus::EventBus;
use crate::events::{names, AppEvent};

/// A rendered terminal emulator. Output is written to it verbatim.
pub trait TerminalSurface: Send + Sync {
    fn write(&self, data: &[u8]);
    /// Current grid size as `(cols, rows)`.
    fn size(&self) -> (u16, u16);
    /// Recompute the grid size from the container.
    fn fit(&self);
    fn focus(&self);
    fn set_visible(&self, visible: bool);
    fn clear(&self);
    fn dispose(&self);
}

/// Persisted terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminalState {
    pub history: Vec<String>,
    pub visible: bool,
}

impl Default for TerminalState {
    fn default() -> Self {
        TerminalState {
            history: Vec::new(),
            visible: true,
        }
    }
}

struct Session {
    id: String,
    surface: Arc<dyn TerminalSurface>,
}

/// Output kept per id while `terminal.create` is still in flight.
const EARLY_OUTPUT_LIMIT: usize = 64 * 1024;
const MAX_EARLY_TERMINALS: usize = 16;

struct Sessions {
    open: Vec<Session>,
    /// Output for ids not registered yet, flushed on registration.
    early: HashMap<String, Vec<u8>>,
    active: Option<String>,
    visible: bool,
    history: Vec<String>,
    /// Input typed since the last carriage return.
    line: String,
}

impl Sessions {
    fn surface(&self, id: &str) -> Option<Arc<dyn TerminalSurface>> {
        self.open
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.surface.clone())
    }

    fn active(&self) -> Option<(String, Arc<dyn TerminalSurface>)> {
        let id = self.active.as_deref()?;
        self.surface(id).map(|surface| (id.to_string(), surface))
    }

    fn buffer_early_output(&mut self, id: &str, data: &[u8]) {
        if !self.early.contains_key(id) && self.early.len() >= MAX_EARLY_TERMINALS {
            log::debug!("Dropping output for unknown terminal {}", id);
            return;
        }
        let buffer = self.early.entry(id.to_string()).or_default();
        buffer.extend_from_slice(data);
        if buffer.len() > EARLY_OUTPUT_LIMIT {
            let excess = buffer.len() - EARLY_OUTPUT_LIMIT;
            buffer.drain(..excess);
        }
    }

    fn record_input(&mut self, data: &str) {
        for ch in data.chars() {
            match ch {
                '\r' | '\n' => {
                    let line = self.line.trim().to_string();
                    if !line.is_empty() {
                        self.history.push(line);
                    }
                    self.line.clear();
                }
                '\x7f' | '\x08' => {
                    self.line.pop();
                }
                '\x03' | '\x15' => self.line.clear(),
                c if c.is_control() => {}
                c => self.line.push(c),
            }
        }
    }
}

pub struct TerminalManager {
    bus: EventBus,
    channel: Arc<PrivilegedChannel>,
    sessions: Mutex<Sessions>,
}

impl TerminalManager {
    pub fn new(bus: EventBus, channel: Arc<PrivilegedChannel>) -> Self {
        TerminalManager {
            bus,
            channel,
            sessions: Mutex::new(Sessions {
                open: Vec::new(),
                early: HashMap::new(),
                active: None,
                visible: true,
                history: Vec::new(),
                line: String::new(),
            }),
        }
    }

    /// Route `terminal.data` pushes by session id and drop exited sessions.
    pub fn attach(self: &Arc<Self>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.channel.receive(ops::TERMINAL_DATA, move |push| {
            if let (Some(terminal), Push::TerminalData { id, data }) = (weak.upgrade(), push) {
                terminal.write_output(id, data);
            }
        })?;

        let weak = Arc::downgrade(self);
        self.bus.on(names::TERMINAL_EXITED, move |event| {
            if let (Some(terminal), AppEvent::TerminalExited { id }) = (weak.upgrade(), event) {
                terminal.remove_session(id);
            }
        });
        Ok(())
    }

    fn write_output(&self, id: &str, data: &[u8]) {
        let surface = {
            let mut sessions = self.sessions.lock();
            let surface = sessions.surface(id);
            if surface.is_none() {
                sessions.buffer_early_output(id, data);
            }
            surface
        };
        if let Some(surface) = surface {
            surface.write(data);
        }
    }

    fn remove_session(&self, id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock();
            sessions.early.remove(id);
            let Some(idx) = sessions.open.iter().position(|s| s.id == id) else {
                return false;
            };
            let removed = sessions.open.remove(idx);
            if sessions.active.as_deref() == Some(id) {
                sessions.active = sessions.open.first().map(|s| s.id.clone());
            }
            removed
        };
        log::info!("Terminal {} closed", id);
        removed.surface.dispose();
        true
    }

    /// Open the first session. Later calls return the active id unchanged.
    pub async fn initialize(&self, surface: Arc<dyn TerminalSurface>) -> Result<String> {
        if let Some(id) = self.active_id() {
            return Ok(id);
        }
        self.open_session(surface).await
    }

    /// Spawn a shell for `surface`. It becomes active if nothing else is.
    pub async fn open_session(&self, surface: Arc<dyn TerminalSurface>) -> Result<String> {
        surface.fit();
        let (cols, rows) = surface.size();
        let id: String = self
            .channel
            .invoke_as(ops::TERMINAL_CREATE, &TerminalCreateArgs { cols, rows })
            .await
            .inspect_err(|e| log::error!("Failed to create terminal: {}", e))?;

        // Flushed under the lock so later pushes land after the buffered bytes.
        let mut sessions = self.sessions.lock();
        surface.set_visible(sessions.visible);
        if let Some(early) = sessions.early.remove(&id) {
            surface.write(&early);
        }
        sessions.open.push(Session {
            id: id.clone(),
            surface,
        });
        if sessions.active.is_none() {
            sessions.active = Some(id.clone());
        }
        Ok(id)
    }

    pub fn set_active(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock();
        if sessions.surface(id).is_none() {
            return Err(UiError::NoSession);
        }
        sessions.active = Some(id.to_string());
        Ok(())
    }

    pub fn active_id(&self) -> Option<String> {
        self.sessions.lock().active.clone()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .lock()
            .open
            .iter()
            .map(|s| s.id.clone())
            .collect()
    }

    fn active(&self) -> Result<(String, Arc<dyn TerminalSurface>)> {
        self.sessions.lock().active().ok_or(UiError::NoSession)
    }

    /// Forward typed input to the active session.
    pub async fn handle_input(&self, data: &str) -> Result<()> {
        let id = {
            let mut sessions = self.sessions.lock();
            let id = sessions.active.clone().ok_or(UiError::NoSession)?;
            sessions.record_input(data);
            id
        };
        self.write_to(&id, data).await
    }

    pub async fn write_to(&self, id: &str, data: &str) -> Result<()> {
        let args = TerminalWriteArgs {
            id: id.to_string(),
            data: data.to_string(),
        };
        self.channel
            .invoke_as::<_, ()>(ops::TERMINAL_WRITE, &args)
            .await?;
        Ok(())
    }

    /// Paste without waiting for the host.
    pub fn paste(&self, text: &str) -> Result<()> {
        let (id, _) = self.active()?;
        let payload = serde_json::to_value(TerminalWriteArgs {
            id,
            data: text.to_string(),
        })
        .map_err(|e| UiError::Session(e.to_string()))?;
        self.channel.send(ops::TERMINAL_INPUT, payload)?;
        Ok(())
    }

    /// Tell the host the active surface's current size.
    pub async fn resize(&self) -> Result<()> {
        let (id, surface) = self.active()?;
        let (cols, rows) = surface.size();
        self.channel
            .invoke_as::<_, ()>(ops::TERMINAL_RESIZE, &TerminalResizeArgs { id, cols, rows })
            .await?;
        Ok(())
    }

    /// Re-fit the active surface to its container, then resize the pty.
    pub async fn fit(&self) -> Result<()> {
        let (_, surface) = self.active()?;
        surface.fit();
        self.resize().await
    }

    /// Flip visibility. Becoming visible re-fits before taking focus.
    pub async fn toggle(&self) -> Result<bool> {
        let (visible, active) = {
            let mut sessions = self.sessions.lock();
            sessions.visible = !sessions.visible;
            (sessions.visible, sessions.active())
        };
        let Some((_, surface)) = active else {
            return Ok(visible);
        };
        surface.set_visible(visible);
        if visible {
            surface.fit();
            if let Err(e) = self.resize().await {
                log::warn!("Terminal resize after toggle failed: {}", e);
            }
            surface.focus();
        }
        Ok(visible)
    }

    pub fn is_visible(&self) -> bool {
        self.sessions.lock().visible
    }

    pub fn clear(&self) {
        if let Ok((_, surface)) = self.active() {
            surface.clear();
            surface.write(b"\x1b[2J\x1b[H");
        }
    }

    pub fn history(&self) -> Vec<String> {
        self.sessions.lock().history.clone()
    }

    pub fn get_state(&self) -> TerminalState {
        let sessions = self.sessions.lock();
        TerminalState {
            history: sessions.history.clone(),
            visible: sessions.visible,
        }
    }

    pub fn restore_state(&self, state: TerminalState) {
        let surfaces: Vec<_> = {
            let mut sessions = self.sessions.lock();
            sessions.history = state.history;
            sessions.visible = state.visible;
            sessions.open.iter().map(|s| s.surface.clone()).collect()
        };
        for surface in surfaces {
            surface.set_visible(state.visible);
        }
    }

    /// Destroy one session. Local state is released even if the host fails.
    pub async fn close_session(&self, id: &str) -> Result<()> {
        let result = self
            .channel
            .invoke_as::<_, ()>(ops::TERMINAL_DESTROY, &TerminalIdArgs { id: id.to_string() })
            .await;
        if let Err(e) = &result {
            log::warn!("Failed to destroy terminal {}: {}", id, e);
        }
        self.remove_session(id);
        result.map_err(UiError::from)
    }

    /// Destroy every session, best-effort.
    pub async fn dispose(&self) {
        for id in self.session_ids() {
            let _ = self.close_session(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTerminalSurface, ScriptedHost};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pty_host() -> Arc<ScriptedHost> {
        let next = AtomicUsize::new(100);
        ScriptedHost::new(move |op, _| match op {
            ops::TERMINAL_CREATE => Ok(json!(next.fetch_add(1, Ordering::SeqCst).to_string())),
            _ => Ok(Value::Null),
        })
    }

    fn manager(host: &Arc<ScriptedHost>) -> (EventBus, Arc<TerminalManager>) {
        let bus = EventBus::new();
        let terminal = Arc::new(TerminalManager::new(bus.clone(), host.channel()));
        terminal.attach().unwrap();
        (bus, terminal)
    }

    #[tokio::test]
    async fn initialize_creates_exactly_one_session() {
        let host = pty_host();
        let (_, terminal) = manager(&host);
        let surface = FakeTerminalSurface::new(120, 40);

        let id = terminal.initialize(surface.clone()).await.unwrap();
        let again = terminal.initialize(FakeTerminalSurface::new(80, 24)).await.unwrap();

        assert_eq!(id, "100");
        assert_eq!(again, id);
        assert_eq!(
            host.invoked(ops::TERMINAL_CREATE),
            vec![json!({"cols": 120, "rows": 40})]
        );
        assert!(surface.visible.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn output_is_routed_by_session_id() {
        let host = pty_host();
        let (_, terminal) = manager(&host);
        let first = FakeTerminalSurface::new(80, 24);
        let second = FakeTerminalSurface::new(80, 24);
        terminal.initialize(first.clone()).await.unwrap();
        let second_id = terminal.open_session(second.clone()).await.unwrap();

        terminal.channel.deliver(&Push::TerminalData {
            id: second_id,
            data: b"hello\r\n".to_vec(),
        });
        terminal.channel.deliver(&Push::TerminalData {
            id: "999".into(),
            data: b"lost".to_vec(),
        });

        assert_eq!(first.output_text(), "");
        assert_eq!(second.output_text(), "hello\r\n");
        assert_eq!(terminal.active_id().as_deref(), Some("100"));
    }

    #[tokio::test]
    async fn output_arriving_before_create_returns_is_kept() {
        let host = pty_host();
        let (_, terminal) = manager(&host);
        let reply = host.defer(ops::TERMINAL_CREATE);
        let surface = FakeTerminalSurface::new(80, 24);
        let task = tokio::spawn({
            let terminal = terminal.clone();
            let surface = surface.clone();
            async move { terminal.initialize(surface).await }
        });
        while host.invoked(ops::TERMINAL_CREATE).is_empty() {
            tokio::task::yield_now().await;
        }

        terminal.channel.deliver(&Push::TerminalData {
            id: "100".into(),
            data: b"$ ".to_vec(),
        });
        reply.send(Ok(json!("100"))).unwrap();
        assert_eq!(task.await.unwrap().unwrap(), "100");

        terminal.channel.deliver(&Push::TerminalData {
            id: "100".into(),
            data: b"ls".to_vec(),
        });
        assert_eq!(surface.output_text(), "$ ls");
        assert!(terminal.sessions.lock().early.is_empty());
    }

    #[test]
    fn early_output_is_bounded_and_dropped_on_exit() {
        let host = pty_host();
        let (bus, terminal) = manager(&host);
        terminal.channel.deliver(&Push::TerminalData {
            id: "7".into(),
            data: vec![b'x'; EARLY_OUTPUT_LIMIT + 10],
        });
        assert_eq!(
            terminal.sessions.lock().early["7"].len(),
            EARLY_OUTPUT_LIMIT
        );

        bus.emit(&AppEvent::TerminalExited { id: "7".into() });
        assert!(terminal.sessions.lock().early.is_empty());
    }

    #[tokio::test]
    async fn input_targets_the_active_session_and_records_history() {
        let host = pty_host();
        let (_, terminal) = manager(&host);
        terminal.initialize(FakeTerminalSurface::new(80, 24)).await.unwrap();

        terminal.handle_input("ls -lx\x7fa").await.unwrap();
        terminal.handle_input("\r").await.unwrap();
        terminal.handle_input("\r").await.unwrap();

        assert_eq!(
            host.invoked(ops::TERMINAL_WRITE)[0],
            json!({"id": "100", "data": "ls -lx\x7fa"})
        );
        assert_eq!(terminal.history(), vec!["ls -la".to_string()]);
    }

    #[tokio::test]
    async fn input_without_a_session_fails() {
        let host = pty_host();
        let (_, terminal) = manager(&host);
        assert_eq!(terminal.handle_input("x").await, Err(UiError::NoSession));
        assert_eq!(terminal.paste("x"), Err(UiError::NoSession));
        assert!(host.invokes().is_empty());
    }

    #[tokio::test]
    async fn paste_uses_the_fire_and_forget_channel() {
        let host = pty_host();
        let (_, terminal) = manager(&host);
        terminal.initialize(FakeTerminalSurface::new(80, 24)).await.unwrap();
        terminal.paste("echo hi").unwrap();
        assert_eq!(
            host.sent(ops::TERMINAL_INPUT),
            vec![json!({"id": "100", "data": "echo hi"})]
        );
        assert!(host.invoked(ops::TERMINAL_WRITE).is_empty());
    }

    #[tokio::test]
    async fn showing_the_terminal_fits_then_resizes_then_focuses() {
        let host = pty_host();
        let (_, terminal) = manager(&host);
        let surface = FakeTerminalSurface::new(100, 30);
        terminal.initialize(surface.clone()).await.unwrap();
        surface.calls.lock().clear();

        assert!(!terminal.toggle().await.unwrap());
        assert!(!surface.visible.load(Ordering::SeqCst));
        assert!(surface.calls.lock().is_empty());

        assert!(terminal.toggle().await.unwrap());
        assert!(surface.visible.load(Ordering::SeqCst));
        assert_eq!(*surface.calls.lock(), vec!["fit", "focus"]);
        assert_eq!(
            host.invoked(ops::TERMINAL_RESIZE),
            vec![json!({"id": "100", "cols": 100, "rows": 30})]
        );
    }

    #[tokio::test]
    async fn dispose_releases_surfaces_even_when_destroy_fails() {
        let host = pty_host();
        let (_, terminal) = manager(&host);
        let surface = FakeTerminalSurface::new(80, 24);
        terminal.initialize(surface.clone()).await.unwrap();
        host.set_responder(|_, _| Err("Session not found: 100".into()));

        terminal.dispose().await;

        assert_eq!(host.invoked(ops::TERMINAL_DESTROY), vec![json!({"id": "100"})]);
        assert!(surface.disposed.load(Ordering::SeqCst));
        assert!(terminal.session_ids().is_empty());
        assert_eq!(terminal.active_id(), None);
    }

    #[tokio::test]
    async fn exited_sessions_are_dropped() {
        let host = pty_host();
        let (bus, terminal) = manager(&host);
        let surface = FakeTerminalSurface::new(80, 24);
        terminal.initialize(surface.clone()).await.unwrap();
        let other = terminal
            .open_session(FakeTerminalSurface::new(80, 24))
            .await
            .unwrap();

        bus.emit(&AppEvent::TerminalExited { id: "100".into() });

        assert_eq!(terminal.session_ids(), vec![other.clone()]);
        assert_eq!(terminal.active_id(), Some(other));
        assert!(surface.disposed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn state_round_trips_through_the_snapshot() {
        let host = pty_host();
        let (_, terminal) = manager(&host);
        let surface = FakeTerminalSurface::new(80, 24);
        terminal.initialize(surface.clone()).await.unwrap();

        terminal.restore_state(TerminalState {
            history: vec!["cargo test".into()],
            visible: false,
        });
        assert!(!surface.visible.load(Ordering::SeqCst));
        assert_eq!(
            terminal.get_state(),
            TerminalState {
                history: vec!["cargo test".into()],
                visible: false,
            }
        );
        assert_eq!(
            serde_json::to_value(terminal.get_state()).unwrap(),
            json!({"history": ["cargo test"], "visible": false})
        );
    }

    #[tokio::test]
    async fn clear_wipes_the_active_surface() {
        let host = pty_host();
        let (_, terminal) = manager(&host);
        let surface = FakeTerminalSurface::new(80, 24);
        terminal.initialize(surface.clone()).await.unwrap();
        surface.write(b"old output");
        terminal.clear();
        assert_eq!(surface.output_text(), "\x1b[2J\x1b[H");
    }
}
