//! Observer registrations for replica changes.

use livesync_protocol::RemoteError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A change applied to a replica, as seen by its watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// A record was inserted after `prev_id`.
    Added {
        /// Id of the new record.
        key: String,
        /// Id of the record it was placed after.
        prev_id: Option<String>,
    },
    /// A record was removed.
    Removed {
        /// Id of the removed record.
        key: String,
    },
    /// A record moved to just after `prev_id`.
    Moved {
        /// Id of the moved record.
        key: String,
        /// Id of the record it now follows.
        prev_id: Option<String>,
    },
    /// A record's content or priority changed.
    Updated {
        /// Id of the changed record.
        key: String,
    },
    /// The subscription failed; the replica is being destroyed.
    Error {
        /// Store-reported cause.
        cause: RemoteError,
    },
}

impl ChangeEvent {
    /// Returns the event name (`added`, `removed`, `moved`, `updated`, `error`).
    pub fn event(&self) -> &'static str {
        match self {
            ChangeEvent::Added { .. } => "added",
            ChangeEvent::Removed { .. } => "removed",
            ChangeEvent::Moved { .. } => "moved",
            ChangeEvent::Updated { .. } => "updated",
            ChangeEvent::Error { .. } => "error",
        }
    }

    /// Returns the affected record id.
    pub fn key(&self) -> Option<&str> {
        match self {
            ChangeEvent::Added { key, .. }
            | ChangeEvent::Removed { key }
            | ChangeEvent::Moved { key, .. }
            | ChangeEvent::Updated { key } => Some(key.as_str()),
            ChangeEvent::Error { .. } => None,
        }
    }

    /// Returns the preceding id for `Added` and `Moved` events.
    pub fn prev_id(&self) -> Option<&str> {
        match self {
            ChangeEvent::Added { prev_id, .. } | ChangeEvent::Moved { prev_id, .. } => {
                prev_id.as_deref()
            }
            _ => None,
        }
    }
}

type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
type Registry = Mutex<Vec<(u64, Callback)>>;

/// The set of watchers registered on one replica.
#[derive(Default)]
pub(crate) struct WatcherSet {
    next_id: AtomicU64,
    watchers: Arc<Registry>,
}

impl WatcherSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register<F>(&self, callback: F) -> WatchHandle
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().push((id, Arc::new(callback)));
        WatchHandle {
            id,
            registry: Arc::downgrade(&self.watchers),
        }
    }

    /// Calls every watcher with `event`. The registry lock is not held
    /// during callbacks, so watchers may read the replica or unwatch.
    pub(crate) fn notify(&self, event: &ChangeEvent) {
        let snapshot: Vec<Callback> = self
            .watchers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }

    pub(crate) fn clear(&self) {
        self.watchers.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.watchers.lock().len()
    }
}

/// Returned by `watch`; removes exactly its own registration.
///
/// Dropping the handle leaves the watcher registered.
#[derive(Debug, Clone)]
pub struct WatchHandle {
    id: u64,
    registry: Weak<Registry>,
}

impl WatchHandle {
    /// Removes the registration if it is still present.
    ///
    /// Returns true if a watcher was removed.
    pub fn unwatch(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut watchers = registry.lock();
        match watchers.iter().position(|(id, _)| *id == self.id) {
            Some(index) => {
                watchers.remove(index);
                true
            }
            None => false,
        }
    }
}
