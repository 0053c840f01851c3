//! Test doubles: a scripted host and fake rendering surfaces.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use quantum_core::channel::{Host, HostFuture, PrivilegedChannel};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::editor::{EditorSurface, SurfaceFactory};
use crate::terminal::TerminalSurface;

type Responder = Box<dyn Fn(&str, &Value) -> Result<Value, String> + Send + Sync>;
type Deferred = oneshot::Receiver<Result<Value, String>>;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Host that records every call and answers from a closure.
pub struct ScriptedHost {
    responder: Mutex<Responder>,
    invokes: Mutex<Vec<(String, Value)>>,
    sends: Mutex<Vec<(String, Value)>>,
    deferred: Mutex<HashMap<String, VecDeque<Deferred>>>,
}

impl ScriptedHost {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&str, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        init_logger();
        Arc::new(ScriptedHost {
            responder: Mutex::new(Box::new(responder)),
            invokes: Mutex::new(Vec::new()),
            sends: Mutex::new(Vec::new()),
            deferred: Mutex::new(HashMap::new()),
        })
    }

    /// Answers `null` to everything.
    pub fn ok() -> Arc<Self> {
        Self::new(|_, _| Ok(Value::Null))
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        *self.responder.lock() = Box::new(responder);
    }

    /// The next invoke of `op` waits for the returned sender instead of the responder.
    pub fn defer(&self, op: &str) -> oneshot::Sender<Result<Value, String>> {
        let (tx, rx) = oneshot::channel();
        self.deferred
            .lock()
            .entry(op.to_string())
            .or_default()
            .push_back(rx);
        tx
    }

    pub fn channel(self: &Arc<Self>) -> Arc<PrivilegedChannel> {
        Arc::new(PrivilegedChannel::new(self.clone()))
    }

    pub fn invokes(&self) -> Vec<(String, Value)> {
        self.invokes.lock().clone()
    }

    /// Arguments of every invoke of `op`, in call order.
    pub fn invoked(&self, op: &str) -> Vec<Value> {
        self.invokes
            .lock()
            .iter()
            .filter(|(name, _)| name == op)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn sent(&self, op: &str) -> Vec<Value> {
        self.sends
            .lock()
            .iter()
            .filter(|(name, _)| name == op)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl Host for ScriptedHost {
    fn invoke<'a>(&'a self, op: &'a str, args: Value) -> HostFuture<'a> {
        self.invokes.lock().push((op.to_string(), args.clone()));
        let deferred = self
            .deferred
            .lock()
            .get_mut(op)
            .and_then(|queue| queue.pop_front());
        match deferred {
            Some(rx) => Box::pin(async move {
                rx.await
                    .unwrap_or_else(|_| Err("deferred response dropped".to_string()))
            }),
            None => {
                let result = (self.responder.lock())(op, &args);
                Box::pin(async move { result })
            }
        }
    }

    fn send(&self, op: &str, payload: Value) {
        self.sends.lock().push((op.to_string(), payload));
    }
}

#[derive(Default)]
pub struct FakeEditorSurface {
    pub text: Mutex<String>,
    pub language: String,
    pub visible: AtomicBool,
    pub focused: AtomicBool,
    pub disposed: AtomicBool,
    pub formatted: AtomicBool,
    pub revealed: Mutex<Option<(u32, u32)>>,
}

impl EditorSurface for FakeEditorSurface {
    fn text(&self) -> String {
        self.text.lock().clone()
    }
    fn set_text(&self, text: &str) {
        *self.text.lock() = text.to_string();
    }
    fn show(&self) {
        self.visible.store(true, Ordering::SeqCst);
    }
    fn hide(&self) {
        self.visible.store(false, Ordering::SeqCst);
        self.focused.store(false, Ordering::SeqCst);
    }
    fn focus(&self) {
        self.focused.store(true, Ordering::SeqCst);
    }
    fn reveal(&self, line: u32, column: u32) {
        *self.revealed.lock() = Some((line, column));
    }
    fn format(&self) {
        self.formatted.store(true, Ordering::SeqCst);
    }
    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// Creates [`FakeEditorSurface`]s and keeps a handle to each.
#[derive(Default)]
pub struct FakeSurfaceFactory {
    pub created: Mutex<Vec<(String, Arc<FakeEditorSurface>)>>,
}

impl FakeSurfaceFactory {
    pub fn surface(&self, path: &str) -> Option<Arc<FakeEditorSurface>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(p, _)| p == path)
            .map(|(_, s)| s.clone())
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

impl SurfaceFactory for FakeSurfaceFactory {
    fn create(&self, path: &str, content: &str, language: &str) -> Arc<dyn EditorSurface> {
        let surface = Arc::new(FakeEditorSurface {
            text: Mutex::new(content.to_string()),
            language: language.to_string(),
            ..Default::default()
        });
        self.created.lock().push((path.to_string(), surface.clone()));
        surface
    }
}

pub struct FakeTerminalSurface {
    pub output: Mutex<Vec<u8>>,
    pub cols: AtomicU32,
    pub rows: AtomicU32,
    pub fits: AtomicU32,
    pub visible: AtomicBool,
    pub focused: AtomicBool,
    pub disposed: AtomicBool,
    /// Order of fit/focus calls, for sequencing assertions.
    pub calls: Mutex<Vec<&'static str>>,
}

impl FakeTerminalSurface {
    pub fn new(cols: u16, rows: u16) -> Arc<Self> {
        Arc::new(FakeTerminalSurface {
            output: Mutex::new(Vec::new()),
            cols: AtomicU32::new(cols as u32),
            rows: AtomicU32::new(rows as u32),
            fits: AtomicU32::new(0),
            visible: AtomicBool::new(false),
            focused: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output.lock()).to_string()
    }
}

impl TerminalSurface for FakeTerminalSurface {
    fn write(&self, data: &[u8]) {
        self.output.lock().extend_from_slice(data);
    }
    fn size(&self) -> (u16, u16) {
        (
            self.cols.load(Ordering::SeqCst) as u16,
            self.rows.load(Ordering::SeqCst) as u16,
        )
    }
    fn fit(&self) {
        self.fits.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push("fit");
    }
    fn focus(&self) {
        self.focused.store(true, Ordering::SeqCst);
        self.calls.lock().push("focus");
    }
    fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }
    fn clear(&self) {
        self.output.lock().clear();
    }
    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}
