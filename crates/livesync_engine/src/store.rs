//! Remote store abstraction.
//!
//! This trait abstracts the backing store a replica mirrors, allowing for
//! different implementations (a network client, the in-memory
//! [`MemoryStore`](crate::MemoryStore) for tests, etc.). A store handle is
//! scoped to one location; ordered replicas treat its children as records,
//! scalar replicas treat the location itself as the record.

use async_trait::async_trait;
use livesync_protocol::{EventKind, RemoteError, RemoteEvent, Snapshot, Value};
use std::sync::Arc;

/// Callback receiving change events for a subscription.
pub type EventCallback = Arc<dyn Fn(RemoteEvent) + Send + Sync>;

/// Callback receiving the terminal error for a subscription.
pub type ErrorCallback = Arc<dyn Fn(RemoteError) + Send + Sync>;

/// Computes the next content of a transaction from the current content.
/// Returning `None` aborts the transaction.
pub type TransactionUpdate = Box<dyn FnMut(&Value) -> Option<Value> + Send>;

/// Result of a remote write.
pub type StoreResult<T> = Result<T, RemoteError>;

/// Identifies one subscription on a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Where a write applies, relative to the store's location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    /// The location itself.
    Root,
    /// A direct child of the location.
    Child(String),
}

impl Location {
    /// Creates a child location.
    pub fn child(key: impl Into<String>) -> Self {
        Location::Child(key.into())
    }

    /// Returns the child key, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Location::Root => None,
            Location::Child(key) => Some(key.as_str()),
        }
    }
}

impl From<Option<&str>> for Location {
    fn from(key: Option<&str>) -> Self {
        key.map_or(Location::Root, Location::child)
    }
}

/// Acknowledgment of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    /// Key written; the store's own key for root writes.
    pub key: String,
}

impl WriteAck {
    /// Creates an acknowledgment for `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// A backing store that delivers ordered change events and accepts writes.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Returns the key of the location this handle points at.
    fn location_key(&self) -> String;

    /// Starts delivering events of the given kinds.
    ///
    /// Existing children are replayed as `ChildAdded` events (and the
    /// current value as a `Value` event) followed by `Loaded`, before any
    /// later change. `on_error` is called at most once and ends the
    /// subscription.
    fn subscribe(
        &self,
        kinds: &[EventKind],
        on_event: EventCallback,
        on_error: ErrorCallback,
    ) -> SubscriptionHandle;

    /// Stops a subscription. Unknown handles are ignored.
    fn unsubscribe(&self, handle: SubscriptionHandle);

    /// Writes a new child under a store-assigned key.
    async fn push(&self, content: Value) -> StoreResult<WriteAck>;

    /// Replaces the content at `at`.
    async fn set(&self, at: Location, content: Value) -> StoreResult<WriteAck>;

    /// Merges the top-level keys of `partial` into the content at `at`.
    /// Keys mapped to null are deleted.
    async fn update(&self, at: Location, partial: Value) -> StoreResult<WriteAck>;

    /// Deletes the content at `at`.
    async fn delete(&self, at: Location) -> StoreResult<WriteAck>;

    /// Atomically replaces the content at `at` with `update(current)`.
    ///
    /// `update` runs again if the content changes before the new value is
    /// committed. Resolves to the committed snapshot, or `None` when
    /// `update` aborts.
    async fn transaction(
        &self,
        at: Location,
        update: TransactionUpdate,
    ) -> StoreResult<Option<Snapshot>>;
}
