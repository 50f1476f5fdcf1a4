//! View binder abstraction.
//!
//! A view binder owns named mutable locations (variables in some rendering
//! scope) and reports when they change. Scalar replicas bind to one
//! location through this trait and never see the host mechanism behind it.

use livesync_protocol::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Callback invoked with the new value of a watched location.
pub type ChangeListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Hook run once when the binder's scope is torn down.
pub type TeardownHook = Box<dyn FnOnce() + Send>;

/// Identifies a change listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Identifies a teardown hook registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TeardownId(pub u64);

/// Host-side access to bindable locations.
pub trait ViewBinder: Send + Sync {
    /// Calls `listener` whenever the value at `path` changes.
    fn register_change_listener(&self, path: &str, listener: ChangeListener) -> ListenerId;

    /// Removes a listener. Unknown ids are ignored.
    fn remove_change_listener(&self, id: ListenerId);

    /// Reads the value at `path`; `Null` if unset.
    fn read_location(&self, path: &str) -> Value;

    /// Replaces the value at `path`.
    fn write_location(&self, path: &str, value: Value);

    /// Runs `hook` when the scope owning the locations goes away.
    fn on_teardown(&self, hook: TeardownHook) -> TeardownId;

    /// Drops a hook that has not run yet. Unknown ids are ignored.
    fn cancel_teardown(&self, id: TeardownId);
}

#[derive(Default)]
struct BinderInner {
    locations: HashMap<String, Value>,
    listeners: Vec<(ListenerId, String, ChangeListener)>,
    next_listener: u64,
    teardown: Vec<(TeardownId, TeardownHook)>,
    next_hook: u64,
    torn_down: bool,
}

/// A [`ViewBinder`] over an in-memory map of locations.
///
/// Writes that change a value call that location's listeners
/// synchronously, after the internal lock is released. Writing an equal
/// value is not a change.
#[derive(Default)]
pub struct MemoryBinder {
    inner: Mutex<BinderInner>,
}

impl MemoryBinder {
    /// Creates an empty binder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of listeners registered on `path`.
    pub fn listener_count(&self, path: &str) -> usize {
        self.inner
            .lock()
            .listeners
            .iter()
            .filter(|(_, p, _)| p == path)
            .count()
    }

    /// Returns the number of teardown hooks waiting to run.
    pub fn teardown_hook_count(&self) -> usize {
        self.inner.lock().teardown.len()
    }

    /// Tears the scope down, running every teardown hook once.
    ///
    /// Hooks registered afterwards run immediately.
    pub fn teardown(&self) {
        let hooks = {
            let mut inner = self.inner.lock();
            inner.torn_down = true;
            std::mem::take(&mut inner.teardown)
        };
        debug!(hooks = hooks.len(), "view binder torn down");
        for (_, hook) in hooks {
            hook();
        }
    }
}

impl ViewBinder for MemoryBinder {
    fn register_change_listener(&self, path: &str, listener: ChangeListener) -> ListenerId {
        let mut inner = self.inner.lock();
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        inner.listeners.push((id, path.to_string(), listener));
        id
    }

    fn remove_change_listener(&self, id: ListenerId) {
        self.inner.lock().listeners.retain(|(lid, _, _)| *lid != id);
    }

    fn read_location(&self, path: &str) -> Value {
        self.inner
            .lock()
            .locations
            .get(path)
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn write_location(&self, path: &str, value: Value) {
        let listeners: Vec<ChangeListener> = {
            let mut inner = self.inner.lock();
            let previous = inner.locations.insert(path.to_string(), value.clone());
            if previous.as_ref() == Some(&value) {
                return;
            }
            inner
                .listeners
                .iter()
                .filter(|(_, p, _)| p == path)
                .map(|(_, _, listener)| Arc::clone(listener))
                .collect()
        };
        for listener in listeners {
            listener(&value);
        }
    }

    fn on_teardown(&self, hook: TeardownHook) -> TeardownId {
        let id = {
            let mut inner = self.inner.lock();
            let id = TeardownId(inner.next_hook);
            inner.next_hook += 1;
            if !inner.torn_down {
                inner.teardown.push((id, hook));
                return id;
            }
            id
        };
        hook();
        id
    }

    fn cancel_teardown(&self, id: TeardownId) {
        self.inner.lock().teardown.retain(|(hid, _)| *hid != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listeners_fire_on_change_only() {
        let binder = MemoryBinder::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        binder.register_change_listener(
            "profile",
            Arc::new(move |_: &Value| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        binder.write_location("profile", json!({"x": 1}));
        binder.write_location("profile", json!({"x": 1}));
        binder.write_location("other", json!(true));
        binder.write_location("profile", json!({"x": 2}));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(binder.read_location("profile"), json!({"x": 2}));
        assert_eq!(binder.read_location("missing"), Value::Null);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let binder = MemoryBinder::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let id = binder.register_change_listener(
            "v",
            Arc::new(move |_: &Value| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(binder.listener_count("v"), 1);

        binder.remove_change_listener(id);
        binder.write_location("v", json!(1));

        assert_eq!(binder.listener_count("v"), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn teardown_runs_hooks_once() {
        let binder = MemoryBinder::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        binder.on_teardown(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        binder.teardown();
        binder.teardown();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let late = Arc::clone(&calls);
        binder.on_teardown(Box::new(move || {
            late.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancelled_hook_never_runs() {
        let binder = MemoryBinder::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let id = binder.on_teardown(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        binder.on_teardown(Box::new(|| {}));
        assert_eq!(binder.teardown_hook_count(), 2);

        binder.cancel_teardown(id);
        binder.cancel_teardown(id);
        assert_eq!(binder.teardown_hook_count(), 1);

        binder.teardown();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
