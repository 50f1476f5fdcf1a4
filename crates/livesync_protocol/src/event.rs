//! Change notifications delivered by a remote store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The value of one location at the time an event was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Key of the location (child key, or the location's own key).
    pub key: String,
    /// Remote value. `Null` if nothing is stored.
    pub value: Value,
    /// Priority attached by the store.
    pub priority: Value,
}

impl Snapshot {
    /// Creates a new snapshot.
    pub fn new(key: impl Into<String>, value: Value, priority: Value) -> Self {
        Self {
            key: key.into(),
            value,
            priority,
        }
    }

    /// Returns true if the snapshot holds no value.
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }
}

/// Kinds of events a subscription may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A child was added.
    ChildAdded,
    /// A child was removed.
    ChildRemoved,
    /// A child changed position.
    ChildMoved,
    /// A child's content changed.
    ChildChanged,
    /// The whole location changed.
    Value,
}

impl EventKind {
    /// The four child event kinds used by ordered replicas.
    pub const CHILD: [EventKind; 4] = [
        EventKind::ChildAdded,
        EventKind::ChildRemoved,
        EventKind::ChildMoved,
        EventKind::ChildChanged,
    ];

    /// Returns the store's name for this event kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ChildAdded => "child_added",
            EventKind::ChildRemoved => "child_removed",
            EventKind::ChildMoved => "child_moved",
            EventKind::ChildChanged => "child_changed",
            EventKind::Value => "value",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Machine-readable code, e.g. `PERMISSION_DENIED`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl RemoteError {
    /// Creates a remote error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a permission denied error.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new("PERMISSION_DENIED", message)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// A tagged change notification from the remote store.
///
/// Events for one subscription arrive in causal order: every pre-existing
/// child as `ChildAdded`, then `Loaded`, then live changes. `Error` is
/// terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// A child was added after `prev_id` (`None` means first).
    ChildAdded {
        /// The new child.
        snapshot: Snapshot,
        /// Key of the preceding child.
        prev_id: Option<String>,
    },
    /// A child was removed.
    ChildRemoved {
        /// Key of the removed child.
        id: String,
    },
    /// A child moved to just after `prev_id`.
    ChildMoved {
        /// Key of the moved child.
        id: String,
        /// Key of the new preceding child.
        prev_id: Option<String>,
    },
    /// A child's content or priority changed.
    ChildChanged {
        /// The new child value.
        snapshot: Snapshot,
    },
    /// The whole location changed.
    Value {
        /// The new location value.
        snapshot: Snapshot,
    },
    /// The initial snapshot has been fully delivered.
    Loaded,
    /// The subscription was cancelled by the store.
    Error {
        /// Why the subscription ended.
        cause: RemoteError,
    },
}

impl RemoteEvent {
    /// Returns the kind of a change event, or `None` for `Loaded`/`Error`.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            RemoteEvent::ChildAdded { .. } => Some(EventKind::ChildAdded),
            RemoteEvent::ChildRemoved { .. } => Some(EventKind::ChildRemoved),
            RemoteEvent::ChildMoved { .. } => Some(EventKind::ChildMoved),
            RemoteEvent::ChildChanged { .. } => Some(EventKind::ChildChanged),
            RemoteEvent::Value { .. } => Some(EventKind::Value),
            RemoteEvent::Loaded | RemoteEvent::Error { .. } => None,
        }
    }

    /// Returns true if this event ends the subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteEvent::Error { .. })
    }
}
