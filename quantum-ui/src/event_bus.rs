use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
pub use quantum_core::util::panic_message;

use crate::events::AppEvent;

pub type Handler = Arc<dyn Fn(&AppEvent) + Send + Sync>;

struct Registration {
    id: u64,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    /// Event names in first-subscription order.
    by_name: Vec<(String, Vec<Registration>)>,
}

impl Listeners {
    fn entry(&mut self, name: &str) -> &mut Vec<Registration> {
        let idx = match self.by_name.iter().position(|(n, _)| n == name) {
            Some(idx) => idx,
            None => {
                self.by_name.push((name.to_string(), Vec::new()));
                self.by_name.len() - 1
            }
        };
        &mut self.by_name[idx].1
    }

    fn get(&self, name: &str) -> Option<&Vec<Registration>> {
        self.by_name
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, regs)| regs)
    }

    fn prune(&mut self) {
        self.by_name.retain(|(_, regs)| !regs.is_empty());
    }
}

/// Removes exactly one registration. Dropping it does not unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    listeners: Weak<Mutex<Listeners>>,
    name: String,
    id: u64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns `false` if the registration was already gone (fired, removed, or bus dropped).
    pub fn unsubscribe(&self) -> bool {
        match self.listeners.upgrade() {
            Some(listeners) => remove(&listeners, &self.name, self.id),
            None => false,
        }
    }
}

fn remove(listeners: &Mutex<Listeners>, name: &str, id: u64) -> bool {
    let mut listeners = listeners.lock();
    let removed = match listeners.by_name.iter_mut().find(|(n, _)| n == name) {
        Some((_, regs)) => {
            let before = regs.len();
            regs.retain(|r| r.id != id);
            regs.len() != before
        }
        None => false,
    };
    listeners.prune();
    removed
}

/// Synchronous publish/subscribe hub.
///
/// Handlers for one `emit` run on the calling thread: durable handlers first, then
/// once-handlers, each class in registration order. The listener set is snapshotted
/// before dispatch, so handlers may freely subscribe, unsubscribe or emit.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<Listeners>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, name: &str, once: bool, handler: Handler) -> Subscription {
        let mut listeners = self.listeners.lock();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entry(name).push(Registration { id, once, handler });
        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            name: name.to_string(),
            id,
        }
    }

    pub fn on<F>(&self, name: &str, handler: F) -> Subscription
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        self.register(name, false, Arc::new(handler))
    }

    /// Register a handler that is removed before its first (and only) invocation.
    pub fn once<F>(&self, name: &str, handler: F) -> Subscription
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        self.register(name, true, Arc::new(handler))
    }

    /// Remove one registration. Unknown names and ids are ignored.
    pub fn off(&self, name: &str, id: u64) -> bool {
        remove(&self.listeners, name, id)
    }

    /// Dispatch `event` to its listeners. Returns how many handlers ran.
    ///
    /// A panicking handler is logged and does not stop the others.
    pub fn emit(&self, event: &AppEvent) -> usize {
        let name = event.name();
        let (durable, once) = {
            let mut listeners = self.listeners.lock();
            let Some(regs) = listeners.by_name.iter_mut().find(|(n, _)| n == name) else {
                return 0;
            };
            let regs = &mut regs.1;
            let durable: Vec<Handler> = regs
                .iter()
                .filter(|r| !r.once)
                .map(|r| Arc::clone(&r.handler))
                .collect();
            let mut once = Vec::new();
            regs.retain(|r| {
                if r.once {
                    once.push(Arc::clone(&r.handler));
                    false
                } else {
                    true
                }
            });
            listeners.prune();
            (durable, once)
        };

        let mut ran = 0;
        for handler in durable.iter().chain(once.iter()) {
            ran += 1;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                log::error!(
                    "Handler for '{}' panicked: {}",
                    name,
                    panic_message(payload.as_ref())
                );
            }
        }
        ran
    }

    pub fn has_listeners(&self, name: &str) -> bool {
        self.listener_count(name) > 0
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.lock().get(name).map_or(0, Vec::len)
    }

    /// Remove every listener for `name`, or every listener at all.
    pub fn remove_all_listeners(&self, name: Option<&str>) {
        let mut listeners = self.listeners.lock();
        match name {
            Some(name) => listeners.by_name.retain(|(n, _)| n != name),
            None => listeners.by_name.clear(),
        }
    }

    pub fn event_names(&self) -> Vec<String> {
        self.listeners
            .lock()
            .by_name
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }
}
