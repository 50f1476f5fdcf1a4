//! In-memory remote store.
//!
//! [`MemoryStore`] keeps one location's children sorted the way a real
//! backing store does (priority, then key) and emits the same event stream:
//! replay plus `Loaded` on subscribe, then `ChildAdded`, `ChildRemoved`,
//! `ChildChanged`, `ChildMoved` and `Value` events for every change, with
//! correct `prev_id`s. Writes and transactions settle immediately.
//! Failures can be injected for testing.

use crate::store::{
    ErrorCallback, EventCallback, Location, RemoteStore, StoreResult, SubscriptionHandle,
    TransactionUpdate, WriteAck,
};
use async_trait::async_trait;
use livesync_protocol::{
    compare_priority, EventKind, Map, RemoteError, RemoteEvent, Snapshot, StoredNode, Value,
    WIRE_PRIORITY,
};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tracing::trace;

/// Kind of write recorded by a [`MemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// `push`
    Push,
    /// `set`
    Set,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// A committed `transaction`
    Transaction,
}

const MAX_TRANSACTION_ATTEMPTS: usize = 25;

/// A write accepted by a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    /// Operation performed.
    pub op: WriteOp,
    /// Target of the write.
    pub at: Location,
    /// Content written (`Null` for deletes).
    pub content: Value,
}

struct Subscription {
    handle: SubscriptionHandle,
    kinds: HashSet<EventKind>,
    on_event: EventCallback,
    on_error: ErrorCallback,
}

impl Subscription {
    fn wants(&self, event: &RemoteEvent) -> bool {
        event.kind().map_or(true, |kind| self.kinds.contains(&kind))
    }
}

#[derive(Default)]
struct Inner {
    children: Vec<(String, StoredNode)>,
    root_scalar: Option<Value>,
    root_priority: Value,
    subscriptions: Vec<Subscription>,
    next_subscription: u64,
    next_push: u64,
    failures: VecDeque<RemoteError>,
    writes: Vec<WriteRecord>,
}

impl Inner {
    fn root_value(&self) -> Value {
        if let Some(value) = &self.root_scalar {
            return value.clone();
        }
        if self.children.is_empty() {
            return Value::Null;
        }
        let map: Map<String, Value> = self
            .children
            .iter()
            .map(|(key, node)| (key.clone(), node.value.clone()))
            .collect();
        Value::Object(map)
    }

    fn root_snapshot(&self, key: &str) -> Snapshot {
        Snapshot::new(key, self.root_value(), self.root_priority.clone())
    }

    fn value_at(&self, at: &Location) -> Value {
        match at {
            Location::Root => self.root_value(),
            Location::Child(key) => self
                .children
                .iter()
                .find(|(k, _)| k == key)
                .map_or(Value::Null, |(_, node)| node.value.clone()),
        }
    }

    fn snapshot_at(&self, at: &Location, store_key: &str) -> Snapshot {
        match at {
            Location::Root => self.root_snapshot(store_key),
            Location::Child(key) => self
                .children
                .iter()
                .find(|(k, _)| k == key)
                .map_or_else(
                    || Snapshot::new(key.clone(), Value::Null, Value::Null),
                    |(_, node)| node.to_snapshot(key.clone()),
                ),
        }
    }

    fn sort(&mut self) {
        self.children.sort_by(|(ka, a), (kb, b)| {
            compare_priority((&a.priority, ka.as_str()), (&b.priority, kb.as_str()))
        });
    }

    fn set_child(&mut self, key: &str, node: StoredNode) {
        self.root_scalar = None;
        let existing = self.children.iter().position(|(k, _)| k == key);
        match (existing, node.is_null()) {
            (Some(index), true) => {
                self.children.remove(index);
            }
            (Some(index), false) => self.children[index].1 = node,
            (None, false) => self.children.push((key.to_string(), node)),
            (None, true) => {}
        }
    }

    fn set_root(&mut self, content: Value) {
        let node = StoredNode::from_wire(content);
        self.root_priority = node.priority;
        self.children.clear();
        self.root_scalar = None;
        match node.value {
            Value::Object(map) => {
                for (key, value) in map {
                    self.set_child(&key, StoredNode::from_wire(value));
                }
            }
            Value::Null => {}
            other => self.root_scalar = Some(other),
        }
    }

    fn update_child(&mut self, key: &str, partial: Map<String, Value>) {
        let (mut value, mut priority) = match self.children.iter().find(|(k, _)| k == key) {
            Some((_, node)) => match &node.value {
                Value::Object(map) => (map.clone(), node.priority.clone()),
                _ => (Map::new(), node.priority.clone()),
            },
            None => (Map::new(), Value::Null),
        };
        for (field, v) in partial {
            if field == WIRE_PRIORITY {
                priority = v;
            } else if v.is_null() {
                value.remove(&field);
            } else {
                value.insert(field, v);
            }
        }
        let value = if value.is_empty() {
            Value::Null
        } else {
            Value::Object(value)
        };
        self.set_child(key, StoredNode::new(value, priority));
    }

    fn update_root(&mut self, partial: Map<String, Value>) {
        for (key, value) in partial {
            if key == WIRE_PRIORITY {
                self.root_priority = value;
            } else {
                self.set_child(&key, StoredNode::from_wire(value));
            }
        }
    }

    fn apply(&mut self, op: WriteOp, at: &Location, content: Value) {
        match (op, at) {
            (WriteOp::Push | WriteOp::Set | WriteOp::Transaction, Location::Child(key)) => {
                self.set_child(key, StoredNode::from_wire(content));
            }
            (WriteOp::Set | WriteOp::Transaction, Location::Root) => self.set_root(content),
            (WriteOp::Update, Location::Child(key)) => {
                self.update_child(key, into_map(content));
            }
            (WriteOp::Update, Location::Root) => self.update_root(into_map(content)),
            (WriteOp::Delete, Location::Child(key)) => {
                self.set_child(key, StoredNode::new(Value::Null, Value::Null));
            }
            (WriteOp::Delete, Location::Root) | (WriteOp::Push, Location::Root) => {
                self.set_root(Value::Null);
            }
        }
        self.sort();
    }

    /// Events turning `old` (and `old_root`) into the current state.
    fn diff(
        &self,
        old: &[(String, StoredNode)],
        old_root: &Snapshot,
        store_key: &str,
    ) -> Vec<RemoteEvent> {
        let mut events = Vec::new();
        let new = &self.children;

        for (key, _) in old {
            if !new.iter().any(|(k, _)| k == key) {
                events.push(RemoteEvent::ChildRemoved { id: key.clone() });
            }
        }

        for (index, (key, node)) in new.iter().enumerate() {
            let prev_id = prev_key(new, index);
            match old.iter().position(|(k, _)| k == key) {
                None => events.push(RemoteEvent::ChildAdded {
                    snapshot: node.to_snapshot(key.clone()),
                    prev_id,
                }),
                Some(old_index) => {
                    let old_node = &old[old_index].1;
                    if old_node != node {
                        events.push(RemoteEvent::ChildChanged {
                            snapshot: node.to_snapshot(key.clone()),
                        });
                    }
                    if old_node.priority != node.priority && prev_key(old, old_index) != prev_id {
                        events.push(RemoteEvent::ChildMoved {
                            id: key.clone(),
                            prev_id,
                        });
                    }
                }
            }
        }

        let root = self.root_snapshot(store_key);
        if root != *old_root {
            events.push(RemoteEvent::Value { snapshot: root });
        }
        events
    }

    /// Applies a write and returns the deliveries it causes.
    fn commit(
        &mut self,
        store_key: &str,
        op: WriteOp,
        at: &Location,
        content: Value,
    ) -> Vec<(EventCallback, RemoteEvent)> {
        let old_children = self.children.clone();
        let old_root = self.root_snapshot(store_key);
        self.apply(op, at, content);
        let events = self.diff(&old_children, &old_root, store_key);
        trace!(events = events.len(), "memory store committed {:?}", op);
        self.route(events)
    }

    fn route(&self, events: Vec<RemoteEvent>) -> Vec<(EventCallback, RemoteEvent)> {
        let mut deliveries = Vec::new();
        for event in events {
            for sub in &self.subscriptions {
                if sub.wants(&event) {
                    deliveries.push((sub.on_event.clone(), event.clone()));
                }
            }
        }
        deliveries
    }
}

fn prev_key(list: &[(String, StoredNode)], index: usize) -> Option<String> {
    index
        .checked_sub(1)
        .map(|prev| list[prev].0.clone())
}

fn deliver(deliveries: Vec<(EventCallback, RemoteEvent)>) {
    for (callback, event) in deliveries {
        callback(event);
    }
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// A [`RemoteStore`] held entirely in memory.
pub struct MemoryStore {
    key: String,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store for the location named `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Makes the next write fail with `error` without changing any data.
    pub fn fail_next_write(&self, error: RemoteError) {
        self.inner.lock().failures.push_back(error);
    }

    /// Cancels every subscription with `error`, as a store does when
    /// read access is revoked.
    pub fn cancel_subscriptions(&self, error: RemoteError) {
        let subscriptions = std::mem::take(&mut self.inner.lock().subscriptions);
        for sub in subscriptions {
            (sub.on_error)(error.clone());
        }
    }

    /// Changes data as another client would: events are emitted, but the
    /// change is not recorded in [`writes`](Self::writes).
    pub fn remote_set(&self, at: Location, content: Value) {
        self.commit(WriteOp::Set, at, content);
    }

    /// Deletes data as another client would.
    pub fn remote_delete(&self, at: Location) {
        self.commit(WriteOp::Delete, at, Value::Null);
    }

    /// Returns the writes accepted so far, oldest first.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.inner.lock().writes.clone()
    }

    /// Returns the number of writes accepted so far.
    pub fn write_count(&self) -> usize {
        self.inner.lock().writes.len()
    }

    /// Returns the number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    /// Returns a child node.
    pub fn child(&self, key: &str) -> Option<StoredNode> {
        self.inner
            .lock()
            .children
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, node)| node.clone())
    }

    /// Returns child keys in store order.
    pub fn child_keys(&self) -> Vec<String> {
        self.inner
            .lock()
            .children
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Returns the value of the location.
    pub fn root_value(&self) -> Value {
        self.inner.lock().root_value()
    }

    fn commit(&self, op: WriteOp, at: Location, content: Value) {
        let deliveries = self.inner.lock().commit(&self.key, op, &at, content);
        deliver(deliveries);
    }

    fn write(&self, op: WriteOp, at: Location, content: Value) -> StoreResult<WriteAck> {
        {
            let mut inner = self.inner.lock();
            if let Some(error) = inner.failures.pop_front() {
                return Err(error);
            }
            inner.writes.push(WriteRecord {
                op,
                at: at.clone(),
                content: content.clone(),
            });
        }
        let ack = WriteAck::new(at.key().unwrap_or(&self.key));
        self.commit(op, at, content);
        Ok(ack)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn location_key(&self) -> String {
        self.key.clone()
    }

    fn subscribe(
        &self,
        kinds: &[EventKind],
        on_event: EventCallback,
        on_error: ErrorCallback,
    ) -> SubscriptionHandle {
        let kinds: HashSet<EventKind> = kinds.iter().copied().collect();
        let (handle, replay) = {
            let mut inner = self.inner.lock();
            let handle = SubscriptionHandle(inner.next_subscription);
            inner.next_subscription += 1;

            let mut replay = Vec::new();
            if kinds.contains(&EventKind::ChildAdded) {
                for (index, (key, node)) in inner.children.iter().enumerate() {
                    replay.push(RemoteEvent::ChildAdded {
                        snapshot: node.to_snapshot(key.clone()),
                        prev_id: prev_key(&inner.children, index),
                    });
                }
            }
            if kinds.contains(&EventKind::Value) {
                replay.push(RemoteEvent::Value {
                    snapshot: inner.root_snapshot(&self.key),
                });
            }
            replay.push(RemoteEvent::Loaded);

            inner.subscriptions.push(Subscription {
                handle,
                kinds,
                on_event: on_event.clone(),
                on_error,
            });
            (handle, replay)
        };

        for event in replay {
            on_event(event);
        }
        handle
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.inner
            .lock()
            .subscriptions
            .retain(|sub| sub.handle != handle);
    }

    async fn push(&self, content: Value) -> StoreResult<WriteAck> {
        let key = {
            let mut inner = self.inner.lock();
            inner.next_push += 1;
            format!("-K{:018}", inner.next_push)
        };
        self.write(WriteOp::Push, Location::Child(key), content)
    }

    async fn set(&self, at: Location, content: Value) -> StoreResult<WriteAck> {
        self.write(WriteOp::Set, at, content)
    }

    async fn update(&self, at: Location, partial: Value) -> StoreResult<WriteAck> {
        self.write(WriteOp::Update, at, partial)
    }

    async fn delete(&self, at: Location) -> StoreResult<WriteAck> {
        self.write(WriteOp::Delete, at, Value::Null)
    }

    async fn transaction(
        &self,
        at: Location,
        mut update: TransactionUpdate,
    ) -> StoreResult<Option<Snapshot>> {
        if let Some(error) = self.inner.lock().failures.pop_front() {
            return Err(error);
        }

        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            let current = self.inner.lock().value_at(&at);
            let Some(next) = update(&current) else {
                trace!(?at, "memory store transaction aborted");
                return Ok(None);
            };

            let (snapshot, deliveries) = {
                let mut inner = self.inner.lock();
                if inner.value_at(&at) != current {
                    trace!(?at, attempt, "memory store transaction retrying");
                    continue;
                }
                inner.writes.push(WriteRecord {
                    op: WriteOp::Transaction,
                    at: at.clone(),
                    content: next.clone(),
                });
                let deliveries = inner.commit(&self.key, WriteOp::Transaction, &at, next);
                (inner.snapshot_at(&at, &self.key), deliveries)
            };
            deliver(deliveries);
            return Ok(Some(snapshot));
        }

        Err(RemoteError::new(
            "MAX_RETRIES",
            "transaction kept conflicting with concurrent writes",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn collect(
        store: &MemoryStore,
        kinds: &[EventKind],
    ) -> (SubscriptionHandle, Arc<Mutex<Vec<RemoteEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handle = store.subscribe(
            kinds,
            Arc::new(move |e: RemoteEvent| sink.lock().push(e)),
            Arc::new(|_: RemoteError| {}),
        );
        (handle, events)
    }

    #[tokio::test]
    async fn replays_children_in_priority_order_then_loaded() {
        let store = MemoryStore::new("items");
        store.set(Location::child("b"), json!({"n": 1, ".priority": 1})).await.unwrap();
        store.set(Location::child("a"), json!({"n": 2, ".priority": 2})).await.unwrap();

        let (_, events) = collect(&store, &EventKind::CHILD);
        let events = events.lock();

        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            RemoteEvent::ChildAdded {
                snapshot: Snapshot::new("b", json!({"n": 1}), json!(1)),
                prev_id: None,
            }
        );
        assert!(matches!(&events[1], RemoteEvent::ChildAdded { prev_id: Some(p), .. } if p == "b"));
        assert_eq!(events[2], RemoteEvent::Loaded);
    }

    #[tokio::test]
    async fn push_keys_sort_after_earlier_pushes() {
        let store = MemoryStore::new("items");
        let first = store.push(json!({"n": 1})).await.unwrap();
        let second = store.push(json!({"n": 2})).await.unwrap();

        assert!(first.key < second.key);
        assert_eq!(store.child_keys(), vec![first.key, second.key]);
    }

    #[tokio::test]
    async fn priority_change_emits_changed_then_moved() {
        let store = MemoryStore::new("items");
        store.set(Location::child("a"), json!({"n": 1, ".priority": 1})).await.unwrap();
        store.set(Location::child("b"), json!({"n": 1, ".priority": 2})).await.unwrap();
        let (_, events) = collect(&store, &EventKind::CHILD);
        events.lock().clear();

        store.set(Location::child("a"), json!({"n": 1, ".priority": 3})).await.unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(
            matches!(&events[0], RemoteEvent::ChildChanged { snapshot } if snapshot.key == "a")
        );
        assert_eq!(
            events[1],
            RemoteEvent::ChildMoved {
                id: "a".into(),
                prev_id: Some("b".into()),
            }
        );
    }

    #[tokio::test]
    async fn identical_write_emits_nothing() {
        let store = MemoryStore::new("items");
        store.set(Location::child("a"), json!({"n": 1})).await.unwrap();
        let (_, events) = collect(&store, &[EventKind::ChildChanged, EventKind::Value]);
        events.lock().clear();

        store.set(Location::child("a"), json!({"n": 1})).await.unwrap();
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn delete_emits_removed() {
        let store = MemoryStore::new("items");
        store.set(Location::child("a"), json!(1)).await.unwrap();
        let (_, events) = collect(&store, &EventKind::CHILD);
        events.lock().clear();

        store.delete(Location::child("a")).await.unwrap();
        assert_eq!(*events.lock(), vec![RemoteEvent::ChildRemoved { id: "a".into() }]);
        assert!(store.child("a").is_none());
    }

    #[tokio::test]
    async fn root_set_replaces_children_and_emits_value() {
        let store = MemoryStore::new("profile");
        let (_, events) = collect(&store, &[EventKind::Value]);
        assert_eq!(
            events.lock()[0],
            RemoteEvent::Value {
                snapshot: Snapshot::new("profile", Value::Null, Value::Null),
            }
        );
        events.lock().clear();

        store.set(Location::Root, json!({"x": 9, ".priority": 4})).await.unwrap();

        assert_eq!(
            *events.lock(),
            vec![RemoteEvent::Value {
                snapshot: Snapshot::new("profile", json!({"x": 9}), json!(4)),
            }]
        );
    }

    #[tokio::test]
    async fn primitive_root_value() {
        let store = MemoryStore::new("counter");
        store.set(Location::Root, json!({".value": 5})).await.unwrap();
        assert_eq!(store.root_value(), json!(5));

        store.update(Location::Root, json!({"a": 1})).await.unwrap();
        assert_eq!(store.root_value(), json!({"a": 1}));
    }

    #[tokio::test]
    async fn update_merges_and_deletes_nulls() {
        let store = MemoryStore::new("items");
        store.set(Location::child("a"), json!({"x": 1, "y": 2})).await.unwrap();

        store.update(Location::child("a"), json!({"y": null, "z": 3})).await.unwrap();
        assert_eq!(store.child("a").unwrap().value, json!({"x": 1, "z": 3}));
    }

    #[tokio::test]
    async fn injected_failure_leaves_data_untouched() {
        let store = MemoryStore::new("items");
        store.fail_next_write(RemoteError::permission_denied("read only"));

        let err = store.set(Location::child("a"), json!(1)).await.unwrap_err();
        assert_eq!(err.code, "PERMISSION_DENIED");
        assert!(store.child("a").is_none());
        assert_eq!(store.write_count(), 0);

        store.set(Location::child("a"), json!(1)).await.unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn unsubscribe_and_cancel() {
        let store = MemoryStore::new("items");
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let first = store.subscribe(
            &EventKind::CHILD,
            Arc::new(|_: RemoteEvent| {}),
            Arc::new(|_: RemoteError| {}),
        );
        store.subscribe(
            &EventKind::CHILD,
            Arc::new(|_: RemoteEvent| {}),
            Arc::new(move |e: RemoteError| sink.lock().push(e)),
        );
        assert_eq!(store.subscription_count(), 2);

        store.unsubscribe(first);
        assert_eq!(store.subscription_count(), 1);

        store.cancel_subscriptions(RemoteError::permission_denied("revoked"));
        assert_eq!(store.subscription_count(), 0);
        assert_eq!(errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn transaction_commits_from_current_value() {
        let store = MemoryStore::new("items");
        store.remote_set(Location::child("count"), json!(4));
        let (_, events) = collect(&store, &[EventKind::ChildChanged]);
        events.lock().clear();

        let snapshot = store
            .transaction(
                Location::child("count"),
                Box::new(|current: &Value| Some(json!(current.as_i64().unwrap_or(0) + 1))),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(snapshot, Snapshot::new("count", json!(5), Value::Null));
        assert_eq!(store.writes()[0].op, WriteOp::Transaction);
        assert_eq!(events.lock().len(), 1);
    }

    #[tokio::test]
    async fn aborted_transaction_writes_nothing() {
        let store = MemoryStore::new("items");
        store.remote_set(Location::child("a"), json!({"x": 1}));

        let result = store
            .transaction(Location::child("a"), Box::new(|_: &Value| None))
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(store.write_count(), 0);
        assert_eq!(store.child("a").unwrap().value, json!({"x": 1}));
    }

    #[tokio::test]
    async fn transaction_reruns_after_concurrent_change() {
        let store = Arc::new(MemoryStore::new("items"));
        store.remote_set(Location::child("n"), json!(1));
        let calls = Arc::new(Mutex::new(0));

        let other = Arc::clone(&store);
        let seen = Arc::clone(&calls);
        let snapshot = store
            .transaction(
                Location::child("n"),
                Box::new(move |current: &Value| {
                    let mut calls = seen.lock();
                    *calls += 1;
                    if *calls == 1 {
                        other.remote_set(Location::child("n"), json!(10));
                    }
                    Some(json!(current.as_i64().unwrap_or(0) + 1))
                }),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*calls.lock(), 2);
        assert_eq!(snapshot.value, json!(11));
    }

    #[tokio::test]
    async fn transaction_failure_skips_update() {
        let store = MemoryStore::new("items");
        store.fail_next_write(RemoteError::permission_denied("read only"));

        let err = store
            .transaction(
                Location::Root,
                Box::new(|_: &Value| -> Option<Value> { panic!("update must not run") }),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, "PERMISSION_DENIED");
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn remote_changes_are_not_recorded_as_writes() {
        let store = MemoryStore::new("items");
        store.remote_set(Location::child("a"), json!({"x": 1}));
        store.remote_delete(Location::child("a"));
        assert_eq!(store.write_count(), 0);
        assert!(store.child_keys().is_empty());
    }
}
