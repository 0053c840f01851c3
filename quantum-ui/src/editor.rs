//! Open documents and the active-document state machine.
//!
//! Rendering is delegated to an [`EditorSurface`] per document; the manager owns
//! only the document table and talks to the host through the privileged channel.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use quantum_core::channel::{ops, PrivilegedChannel, WriteFileArgs};
use quantum_core::util::language_from_path;
use serde_json::json;

use crate::error::{Result, UiError};
use crate::event_bus::EventBus;
use crate::events::{names, AppEvent};

/// One rendered text buffer.
pub trait EditorSurface: Send + Sync {
    fn text(&self) -> String;
    fn set_text(&self, text: &str);
    fn show(&self);
    fn hide(&self);
    fn focus(&self);
    /// Scroll to and place the cursor at a 1-based line and 0-based column.
    fn reveal(&self, line: u32, column: u32);
    fn format(&self) {}
    fn dispose(&self);
}

pub trait SurfaceFactory: Send + Sync {
    fn create(&self, path: &str, content: &str, language: &str) -> Arc<dyn EditorSurface>;
}

struct Document {
    path: String,
    language: String,
    surface: Arc<dyn EditorSurface>,
    dirty: bool,
}

#[derive(Default)]
struct Documents {
    /// Insertion order.
    open: Vec<Document>,
    active: Option<String>,
}

impl Documents {
    fn find(&self, path: &str) -> Option<&Document> {
        self.open.iter().find(|d| d.path == path)
    }

    fn find_mut(&mut self, path: &str) -> Option<&mut Document> {
        self.open.iter_mut().find(|d| d.path == path)
    }
}

pub struct EditorManager {
    bus: EventBus,
    channel: Arc<PrivilegedChannel>,
    factory: Arc<dyn SurfaceFactory>,
    docs: Mutex<Documents>,
}

impl EditorManager {
    pub fn new(
        bus: EventBus,
        channel: Arc<PrivilegedChannel>,
        factory: Arc<dyn SurfaceFactory>,
    ) -> Self {
        EditorManager {
            bus,
            channel,
            factory,
            docs: Mutex::new(Documents::default()),
        }
    }

    /// Open documents on `file.open` events.
    pub fn attach(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.bus.on(names::FILE_OPEN, move |event| {
            if let (Some(editor), AppEvent::FileOpen { path, content }) = (weak.upgrade(), event) {
                editor.open_file(path, content);
            }
        });
    }

    /// Open `path` and make it active. An already-open path is only activated;
    /// its surface and content are left untouched.
    pub fn open_file(&self, path: &str, content: &str) {
        let already_open = self.docs.lock().find(path).is_some();
        if !already_open {
            let language = language_from_path(path);
            let surface = self.factory.create(path, content, &language);
            surface.hide();
            {
                let mut docs = self.docs.lock();
                if docs.find(path).is_some() {
                    drop(docs);
                    surface.dispose();
                    return self.activate_open(path);
                }
                docs.open.push(Document {
                    path: path.to_string(),
                    language,
                    surface,
                    dirty: false,
                });
            }
            log::debug!("Opened {}", path);
            self.bus.emit(&AppEvent::FileOpened {
                path: path.to_string(),
            });
        }
        self.activate_open(path);
    }

    fn activate_open(&self, path: &str) {
        if let Err(e) = self.set_active_file(path) {
            log::warn!("{}", e);
        }
    }

    /// Show `path`, hide the previously active document and emit `editor.activeFileChanged`.
    pub fn set_active_file(&self, path: &str) -> Result<()> {
        let (previous, next) = {
            let mut docs = self.docs.lock();
            let Some(next) = docs.find(path).map(|d| d.surface.clone()) else {
                return Err(UiError::NotOpen(path.to_string()));
            };
            let previous = docs
                .active
                .as_deref()
                .filter(|active| *active != path)
                .and_then(|active| docs.find(active))
                .map(|d| d.surface.clone());
            docs.active = Some(path.to_string());
            (previous, next)
        };
        // Surfaces may call back into the manager, so the lock is released first.
        if let Some(previous) = previous {
            previous.hide();
        }
        next.show();
        next.focus();
        self.bus.emit(&AppEvent::ActiveFileChanged {
            path: Some(path.to_string()),
        });
        Ok(())
    }

    /// Close `path`. If it was active the first remaining document takes over.
    pub fn close_file(&self, path: &str) -> Result<()> {
        let (closed, was_active, successor) = {
            let mut docs = self.docs.lock();
            let Some(idx) = docs.open.iter().position(|d| d.path == path) else {
                return Err(UiError::NotOpen(path.to_string()));
            };
            let closed = docs.open.remove(idx);
            let was_active = docs.active.as_deref() == Some(path);
            if was_active {
                docs.active = None;
            }
            (closed, was_active, docs.open.first().map(|d| d.path.clone()))
        };
        closed.surface.dispose();

        if let Err(e) = self.channel.send(ops::EDITOR_CLOSE, json!({ "path": path })) {
            log::warn!("{}", e);
        }
        self.bus.emit(&AppEvent::FileClosed {
            path: path.to_string(),
        });

        if was_active {
            match successor {
                Some(next) => self.set_active_file(&next)?,
                None => {
                    self.bus.emit(&AppEvent::ActiveFileChanged { path: None });
                }
            }
        }
        Ok(())
    }

    /// Write the active buffer through `fs.writeFile`. Returns the saved path,
    /// or `None` when nothing is active.
    pub async fn save_current_file(&self) -> Result<Option<String>> {
        let Some((path, surface)) = ({
            let docs = self.docs.lock();
            docs.active
                .as_deref()
                .and_then(|active| docs.find(active))
                .map(|d| (d.path.clone(), d.surface.clone()))
        }) else {
            return Ok(None);
        };

        let args = WriteFileArgs {
            path: path.clone(),
            content: surface.text(),
        };
        if let Err(e) = self
            .channel
            .invoke_as::<_, ()>(ops::FS_WRITE_FILE, &args)
            .await
        {
            log::error!("Failed to save {}: {}", path, e);
            return Err(e.into());
        }

        if let Some(doc) = self.docs.lock().find_mut(&path) {
            doc.dirty = false;
        }
        if let Err(e) = self.channel.send(ops::EDITOR_SAVE, json!({ "path": path })) {
            log::warn!("{}", e);
        }
        self.bus.emit(&AppEvent::FileSaved { path: path.clone() });
        Ok(Some(path))
    }

    /// Called by the surface owner whenever a buffer is edited.
    pub fn notify_content_changed(&self, path: &str) {
        match self.docs.lock().find_mut(path) {
            Some(doc) => doc.dirty = true,
            None => return,
        }
        self.bus.emit(&AppEvent::ContentChanged {
            path: path.to_string(),
        });
    }

    pub fn notify_cursor_moved(&self, path: &str, line: u32, column: u32) {
        self.bus.emit(&AppEvent::CursorChanged {
            path: path.to_string(),
            line,
            column,
        });
    }

    /// Replace the buffer text of an open document and mark it clean.
    pub fn reload(&self, path: &str, content: &str) -> Result<()> {
        let surface = self
            .docs
            .lock()
            .find(path)
            .map(|d| d.surface.clone())
            .ok_or_else(|| UiError::NotOpen(path.to_string()))?;
        surface.set_text(content);
        if let Some(doc) = self.docs.lock().find_mut(path) {
            doc.dirty = false;
        }
        Ok(())
    }

    pub fn reveal(&self, path: &str, line: u32, column: u32) -> Result<()> {
        self.set_active_file(path)?;
        if let Some(surface) = self.docs.lock().find(path).map(|d| d.surface.clone()) {
            surface.reveal(line, column);
        }
        Ok(())
    }

    /// Ask the active surface to format its buffer.
    pub fn format_active(&self) -> bool {
        let surface = {
            let docs = self.docs.lock();
            docs.active
                .as_deref()
                .and_then(|active| docs.find(active))
                .map(|d| d.surface.clone())
        };
        match surface {
            Some(surface) => {
                surface.format();
                true
            }
            None => false,
        }
    }

    pub fn get_open_files(&self) -> Vec<String> {
        self.docs.lock().open.iter().map(|d| d.path.clone()).collect()
    }

    pub fn get_active_file(&self) -> Option<String> {
        self.docs.lock().active.clone()
    }

    pub fn is_dirty(&self, path: &str) -> bool {
        self.docs.lock().find(path).is_some_and(|d| d.dirty)
    }

    pub fn language_of(&self, path: &str) -> Option<String> {
        self.docs.lock().find(path).map(|d| d.language.clone())
    }

    /// Release every surface and fall back to the empty state.
    pub fn dispose(&self) {
        let (closed, had_active) = {
            let mut docs = self.docs.lock();
            let had_active = docs.active.take().is_some();
            (std::mem::take(&mut docs.open), had_active)
        };
        for doc in &closed {
            doc.surface.dispose();
        }
        if had_active {
            self.bus.emit(&AppEvent::ActiveFileChanged { path: None });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSurfaceFactory, ScriptedHost};
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Calls back into the editor from every surface hook, like a real widget's
    /// change and focus signals do.
    struct ReentrantSurface {
        editor: Weak<EditorManager>,
        path: String,
        text: Mutex<String>,
        focused_active: Mutex<Vec<Option<String>>>,
    }

    impl EditorSurface for ReentrantSurface {
        fn text(&self) -> String {
            self.text.lock().clone()
        }
        fn set_text(&self, text: &str) {
            *self.text.lock() = text.to_string();
            if let Some(editor) = self.editor.upgrade() {
                editor.notify_content_changed(&self.path);
            }
        }
        fn show(&self) {}
        fn hide(&self) {
            if let Some(editor) = self.editor.upgrade() {
                editor.is_dirty(&self.path);
            }
        }
        fn focus(&self) {
            if let Some(editor) = self.editor.upgrade() {
                self.focused_active.lock().push(editor.get_active_file());
            }
        }
        fn reveal(&self, _line: u32, _column: u32) {}
        fn dispose(&self) {
            if let Some(editor) = self.editor.upgrade() {
                editor.get_open_files();
            }
        }
    }

    #[derive(Default)]
    struct ReentrantFactory {
        editor: Mutex<Weak<EditorManager>>,
        created: Mutex<Vec<Arc<ReentrantSurface>>>,
    }

    impl SurfaceFactory for ReentrantFactory {
        fn create(&self, path: &str, content: &str, _language: &str) -> Arc<dyn EditorSurface> {
            let surface = Arc::new(ReentrantSurface {
                editor: self.editor.lock().clone(),
                path: path.to_string(),
                text: Mutex::new(content.to_string()),
                focused_active: Mutex::new(Vec::new()),
            });
            self.created.lock().push(surface.clone());
            surface
        }
    }

    struct Fixture {
        host: Arc<ScriptedHost>,
        bus: EventBus,
        factory: Arc<FakeSurfaceFactory>,
        editor: Arc<EditorManager>,
        active_changes: Arc<Mutex<Vec<Option<String>>>>,
    }

    fn fixture() -> Fixture {
        let host = ScriptedHost::ok();
        let bus = EventBus::new();
        let factory = Arc::new(FakeSurfaceFactory::default());
        let editor = Arc::new(EditorManager::new(
            bus.clone(),
            host.channel(),
            factory.clone(),
        ));
        let active_changes = Arc::new(Mutex::new(Vec::new()));
        let sink = active_changes.clone();
        bus.on(names::EDITOR_ACTIVE_FILE_CHANGED, move |event| {
            if let AppEvent::ActiveFileChanged { path } = event {
                sink.lock().push(path.clone());
            }
        });
        Fixture {
            host,
            bus,
            factory,
            editor,
            active_changes,
        }
    }

    #[test]
    fn surfaces_may_call_back_into_the_editor() {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let host = ScriptedHost::ok();
            let bus = EventBus::new();
            let changed = Arc::new(Mutex::new(Vec::new()));
            let sink = changed.clone();
            bus.on(names::EDITOR_CONTENT_CHANGED, move |event| {
                if let AppEvent::ContentChanged { path } = event {
                    sink.lock().push(path.clone());
                }
            });
            let factory = Arc::new(ReentrantFactory::default());
            let editor = Arc::new(EditorManager::new(bus, host.channel(), factory.clone()));
            *factory.editor.lock() = Arc::downgrade(&editor);

            editor.open_file("/w/a.rs", "old");
            editor.open_file("/w/b.rs", "b");
            editor.set_active_file("/w/a.rs").unwrap();
            editor.reload("/w/a.rs", "new").unwrap();
            let a = factory.created.lock()[0].clone();
            let outcome = (
                a.text(),
                editor.is_dirty("/w/a.rs"),
                changed.lock().clone(),
                a.focused_active.lock().clone(),
            );
            editor.close_file("/w/a.rs").unwrap();
            let _ = tx.send((outcome, editor.get_active_file()));
        });

        let ((text, dirty, changed, focused), active) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("editor deadlocked on a surface callback");
        assert_eq!(text, "new");
        assert!(!dirty);
        assert_eq!(changed, vec!["/w/a.rs".to_string()]);
        assert_eq!(
            focused,
            vec![Some("/w/a.rs".to_string()), Some("/w/a.rs".to_string())]
        );
        assert_eq!(active.as_deref(), Some("/w/b.rs"));
    }

    #[test]
    fn closing_the_active_document_reactivates_a_remaining_one() {
        let f = fixture();
        f.editor.open_file("P", "p");
        f.editor.open_file("Q", "q");
        assert_eq!(f.editor.get_active_file().as_deref(), Some("Q"));

        f.editor.close_file("Q").unwrap();
        assert_eq!(f.editor.get_active_file().as_deref(), Some("P"));
        assert_eq!(f.editor.get_open_files(), vec!["P".to_string()]);
        assert!(f.factory.surface("Q").unwrap().disposed.load(Ordering::SeqCst));
        assert!(f.factory.surface("P").unwrap().visible.load(Ordering::SeqCst));
    }

    #[test]
    fn opening_twice_keeps_one_document_and_its_content() {
        let f = fixture();
        f.editor.open_file("P", "original");
        f.editor.open_file("Q", "q");
        f.editor.open_file("P", "stale copy");

        assert_eq!(f.editor.get_open_files().len(), 2);
        assert_eq!(f.factory.created_count(), 2);
        assert_eq!(f.editor.get_active_file().as_deref(), Some("P"));
        assert_eq!(f.factory.surface("P").unwrap().text(), "original");
        assert!(!f.factory.surface("Q").unwrap().visible.load(Ordering::SeqCst));
    }

    #[test]
    fn closing_the_last_document_clears_the_active_file() {
        let f = fixture();
        f.editor.open_file("P", "p");
        f.editor.close_file("P").unwrap();

        assert_eq!(f.editor.get_active_file(), None);
        assert_eq!(
            *f.active_changes.lock(),
            vec![Some("P".to_string()), None]
        );
    }

    #[test]
    fn one_activation_event_per_activation() {
        let f = fixture();
        f.editor.open_file("P", "p");
        f.editor.open_file("Q", "q");
        f.editor.set_active_file("P").unwrap();
        f.editor.close_file("Q").unwrap();

        assert_eq!(
            *f.active_changes.lock(),
            vec![
                Some("P".to_string()),
                Some("Q".to_string()),
                Some("P".to_string()),
            ]
        );
    }

    #[test]
    fn closing_an_unknown_path_is_reported() {
        let f = fixture();
        f.editor.open_file("P", "p");
        assert_eq!(
            f.editor.close_file("nope"),
            Err(UiError::NotOpen("nope".into()))
        );
        assert_eq!(f.editor.get_open_files(), vec!["P".to_string()]);
        assert!(f.editor.set_active_file("nope").is_err());
    }

    #[tokio::test]
    async fn save_writes_the_buffer_once() {
        let f = fixture();
        let saved = Arc::new(Mutex::new(Vec::new()));
        let sink = saved.clone();
        f.bus.on(names::EDITOR_FILE_SAVED, move |event| {
            if let AppEvent::FileSaved { path } = event {
                sink.lock().push(path.clone());
            }
        });

        f.editor.open_file("x.js", "let a=1;");
        let result = f.editor.save_current_file().await.unwrap();

        assert_eq!(result.as_deref(), Some("x.js"));
        assert_eq!(
            f.host.invoked(ops::FS_WRITE_FILE),
            vec![json!({"path": "x.js", "content": "let a=1;"})]
        );
        assert_eq!(*saved.lock(), vec!["x.js".to_string()]);
    }

    #[tokio::test]
    async fn save_without_an_active_document_does_nothing() {
        let f = fixture();
        assert_eq!(f.editor.save_current_file().await.unwrap(), None);
        assert!(f.host.invokes().is_empty());
    }

    #[tokio::test]
    async fn failed_save_keeps_the_document_dirty() {
        let f = fixture();
        f.host.set_responder(|_, _| Err("disk full".into()));
        f.editor.open_file("a.rs", "fn main() {}");
        f.editor.notify_content_changed("a.rs");

        let err = f.editor.save_current_file().await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(f.editor.is_dirty("a.rs"));
    }

    #[tokio::test]
    async fn successful_save_clears_dirty() {
        let f = fixture();
        f.editor.open_file("a.rs", "fn main() {}");
        f.editor.notify_content_changed("a.rs");
        assert!(f.editor.is_dirty("a.rs"));

        f.editor.save_current_file().await.unwrap();
        assert!(!f.editor.is_dirty("a.rs"));
        assert_eq!(f.host.sent(ops::EDITOR_SAVE), vec![json!({"path": "a.rs"})]);
    }

    #[test]
    fn file_open_events_open_documents() {
        let f = fixture();
        f.editor.attach();
        f.bus.emit(&AppEvent::FileOpen {
            path: "/w/main.rs".into(),
            content: "fn main() {}".into(),
        });
        assert_eq!(f.editor.get_active_file().as_deref(), Some("/w/main.rs"));
        assert_eq!(f.editor.language_of("/w/main.rs").as_deref(), Some("rust"));
    }

    #[test]
    fn reload_reveal_and_dispose() {
        let f = fixture();
        f.editor.open_file("a.txt", "old");
        f.editor.notify_content_changed("a.txt");
        f.editor.reload("a.txt", "new").unwrap();
        assert_eq!(f.factory.surface("a.txt").unwrap().text(), "new");
        assert!(!f.editor.is_dirty("a.txt"));

        f.editor.open_file("b.txt", "b");
        f.editor.reveal("a.txt", 3, 4).unwrap();
        assert_eq!(f.editor.get_active_file().as_deref(), Some("a.txt"));
        assert_eq!(*f.factory.surface("a.txt").unwrap().revealed.lock(), Some((3, 4)));

        assert!(f.editor.format_active());
        assert!(f.factory.surface("a.txt").unwrap().formatted.load(Ordering::SeqCst));

        f.editor.dispose();
        assert!(f.editor.get_open_files().is_empty());
        assert_eq!(f.editor.get_active_file(), None);
        assert!(f.factory.surface("b.txt").unwrap().disposed.load(Ordering::SeqCst));
        assert!(!f.editor.format_active());
    }
}
