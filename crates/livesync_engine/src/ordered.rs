//! Ordered replica: a local list of records mirroring a remote collection.
//!
//! Position is materialized from the `prev_id` carried by added and moved
//! events, never re-derived from priorities. Every apply-method takes the
//! state lock for the whole mutation and notifies watchers after releasing
//! it, so watchers may read the replica.
//!
//! # Invariants
//!
//! - Record ids are unique within the list
//! - A record is present only if it was added and not since removed
//! - Once destroyed, the list stays empty and every write is rejected

use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, ReplicaResult};
use crate::lifecycle::{Lifecycle, ReplicaState};
use crate::session::{EventApplier, ReplicaSession};
use crate::store::{Location, RemoteStore};
use crate::watch::{ChangeEvent, WatchHandle};
use livesync_protocol::{
    to_wire, EventKind, Record, RemoteError, RemoteEvent, Snapshot, StoredNode, Value,
};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace};

/// Names a record of an [`OrderedReplica`] by position or by value.
///
/// A record argument resolves if a record with the same id is a member of
/// the replica; its own content is what gets written by `save`.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordRef {
    /// Position in the list.
    Index(usize),
    /// A record, possibly an edited copy of a member.
    Record(Record),
}

impl From<usize> for RecordRef {
    fn from(index: usize) -> Self {
        RecordRef::Index(index)
    }
}

impl From<Record> for RecordRef {
    fn from(record: Record) -> Self {
        RecordRef::Record(record)
    }
}

impl From<&Record> for RecordRef {
    fn from(record: &Record) -> Self {
        RecordRef::Record(record.clone())
    }
}

struct ListState {
    records: Vec<Record>,
    phase: ReplicaState,
}

/// A synchronized list of records.
pub struct OrderedReplica {
    store: Arc<dyn RemoteStore>,
    config: ReplicaConfig,
    state: RwLock<ListState>,
    lifecycle: Lifecycle,
}

impl OrderedReplica {
    /// Creates a replica that is not subscribed to `store`.
    ///
    /// Writes go to `store`; events only arrive through the apply-methods.
    pub fn detached(store: Arc<dyn RemoteStore>, config: ReplicaConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            state: RwLock::new(ListState {
                records: Vec::new(),
                phase: ReplicaState::Created,
            }),
            lifecycle: Lifecycle::new(),
        })
    }

    /// Creates a replica and subscribes it to the children of `store`.
    pub fn attach(store: Arc<dyn RemoteStore>, config: ReplicaConfig) -> ReplicaResult<Arc<Self>> {
        let replica = Self::detached(Arc::clone(&store), config);
        replica.state.write().phase = ReplicaState::Loading;

        let weak: Weak<OrderedReplica> = Arc::downgrade(&replica);
        let session = ReplicaSession::attach(store, weak, &EventKind::CHILD, &replica.config)?;
        replica.lifecycle.install_session(session, || replica.is_destroyed());
        Ok(replica)
    }

    // --------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------

    /// Appends a record under a store-assigned id.
    ///
    /// Resolves once the store acknowledges the write. The local insert
    /// happens separately, when the corresponding added event is applied.
    pub async fn add(&self, content: Value) -> ReplicaResult<Record> {
        self.ensure_live("add")?;
        let wire = to_wire(&content)?;
        let ack = self.store.push(wire.clone()).await?;
        let snapshot = StoredNode::from_wire(wire).to_snapshot(ack.key);
        Ok(self.config.record_factory.create_record(&snapshot))
    }

    /// Writes the content of a record back to the store.
    ///
    /// Fails with [`ReplicaError::InvalidReference`] if `target` is not a
    /// member of this replica.
    pub async fn save(&self, target: impl Into<RecordRef>) -> ReplicaResult<()> {
        self.ensure_live("save")?;
        let record = self.resolve(target.into())?;
        let wire = to_wire(&record.to_view())?;
        self.store.set(Location::child(record.id()), wire).await?;
        Ok(())
    }

    /// Deletes a record from the store.
    ///
    /// Fails like [`save`](Self::save) for unknown targets. The local
    /// record goes away when the removed event is applied.
    pub async fn remove(&self, target: impl Into<RecordRef>) -> ReplicaResult<()> {
        self.ensure_live("remove")?;
        let record = self.resolve(target.into())?;
        self.store.delete(Location::child(record.id())).await?;
        Ok(())
    }

    // --------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------

    /// Returns the id at `target`, if it resolves to a member.
    pub fn key_at(&self, target: impl Into<RecordRef>) -> Option<String> {
        self.resolve(target.into())
            .ok()
            .map(|record| record.id().to_string())
    }

    /// Returns the position of the record with `id`.
    ///
    /// This is a linear scan; replicas are expected to stay small.
    pub fn index_for(&self, id: &str) -> Option<usize> {
        position(&self.state.read().records, id)
    }

    /// Returns a copy of the record with `id`.
    pub fn get_record(&self, id: &str) -> Option<Record> {
        let state = self.state.read();
        position(&state.records, id).map(|i| state.records[i].clone())
    }

    /// Returns a copy of the record at `index`.
    pub fn get(&self, index: usize) -> Option<Record> {
        self.state.read().records.get(index).cloned()
    }

    /// Returns a copy of every record, in order.
    pub fn records(&self) -> Vec<Record> {
        self.state.read().records.clone()
    }

    /// Returns the ids of every record, in order.
    pub fn keys(&self) -> Vec<String> {
        self.state
            .read()
            .records
            .iter()
            .map(|record| record.id().to_string())
            .collect()
    }

    /// Runs `f` over the records without copying them.
    ///
    /// `f` must not call back into this replica's apply-methods.
    pub fn with_records<R>(&self, f: impl FnOnce(&[Record]) -> R) -> R {
        f(&self.state.read().records)
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    /// Returns true if the replica holds no records.
    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    /// Returns the lifecycle phase.
    pub fn state(&self) -> ReplicaState {
        self.state.read().phase
    }

    /// Returns true once the replica has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.state() == ReplicaState::Destroyed
    }

    /// Returns the store this replica writes to.
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Returns the session feeding this replica, if attached.
    pub fn session(&self) -> Option<ReplicaSession> {
        self.lifecycle.session()
    }

    // --------------------------------------------------------------------
    // Observation and lifecycle
    // --------------------------------------------------------------------

    /// Registers `callback` for every applied change.
    pub fn watch<F>(&self, callback: F) -> WatchHandle
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.lifecycle.watch(callback)
    }

    /// Returns the number of registered watchers.
    pub fn watcher_count(&self) -> usize {
        self.lifecycle.watcher_count()
    }

    /// Waits for the initial snapshot and returns the records.
    ///
    /// Fails with [`ReplicaError::Destroyed`] if the replica was destroyed
    /// first, or [`ReplicaError::RemoteFailure`] if the subscription failed.
    pub async fn loaded(&self) -> ReplicaResult<Vec<Record>> {
        self.lifecycle.loaded().wait().await?;
        Ok(self.records())
    }

    /// Waits for the initial snapshot and maps the records with `f`.
    pub async fn loaded_then<T>(&self, f: impl FnOnce(&[Record]) -> T) -> ReplicaResult<T> {
        self.lifecycle.loaded().wait().await?;
        Ok(self.with_records(f))
    }

    /// Delivers queued remote events now. Returns the number applied.
    pub fn flush(&self) -> usize {
        self.lifecycle.flush()
    }

    /// Stops event delivery and clears the records. Later calls do nothing.
    pub fn destroy(&self) {
        {
            let mut state = self.state.write();
            if state.phase == ReplicaState::Destroyed {
                return;
            }
            state.phase = ReplicaState::Destroyed;
            state.records.clear();
        }
        self.lifecycle.teardown();
        debug!(location = %self.store.location_key(), "ordered replica destroyed");
    }

    // --------------------------------------------------------------------
    // Apply-methods
    // --------------------------------------------------------------------

    /// Inserts a record after `prev_id`. Duplicate ids are ignored.
    pub fn apply_added(&self, snapshot: &Snapshot, prev_id: Option<&str>) {
        {
            let mut state = self.state.write();
            if state.phase == ReplicaState::Destroyed {
                return;
            }
            if position(&state.records, &snapshot.key).is_some() {
                trace!(key = %snapshot.key, "ignoring duplicate add");
                return;
            }
            let record = self.config.record_factory.create_record(snapshot);
            insert_after(&mut state.records, record, prev_id);
        }
        trace!(key = %snapshot.key, ?prev_id, "record added");
        self.lifecycle.notify(ChangeEvent::Added {
            key: snapshot.key.clone(),
            prev_id: prev_id.map(str::to_string),
        });
    }

    /// Removes the record with `id`, if present.
    pub fn apply_removed(&self, id: &str) {
        {
            let mut state = self.state.write();
            let Some(index) = position(&state.records, id) else {
                return;
            };
            state.records.remove(index);
        }
        trace!(key = %id, "record removed");
        self.lifecycle.notify(ChangeEvent::Removed { key: id.to_string() });
    }

    /// Moves the record with `id` to just after `prev_id`.
    pub fn apply_moved(&self, id: &str, prev_id: Option<&str>) {
        {
            let mut state = self.state.write();
            let Some(index) = position(&state.records, id) else {
                return;
            };
            let record = state.records.remove(index);
            insert_after(&mut state.records, record, prev_id);
        }
        trace!(key = %id, ?prev_id, "record moved");
        self.lifecycle.notify(ChangeEvent::Moved {
            key: id.to_string(),
            prev_id: prev_id.map(str::to_string),
        });
    }

    /// Merges new content into the record with `snapshot.key`.
    ///
    /// Updates for absent records are dropped. Watchers hear about the
    /// update only if the merge changed something.
    pub fn apply_updated(&self, snapshot: &Snapshot) {
        let changed = {
            let mut state = self.state.write();
            let Some(index) = position(&state.records, &snapshot.key) else {
                return;
            };
            self.config
                .content_merger
                .merge(&mut state.records[index], snapshot)
        };
        if changed {
            trace!(key = %snapshot.key, "record updated");
            self.lifecycle.notify(ChangeEvent::Updated {
                key: snapshot.key.clone(),
            });
        }
    }

    /// Marks the initial snapshot as complete.
    pub fn apply_loaded(&self) {
        {
            let mut state = self.state.write();
            if state.phase == ReplicaState::Destroyed {
                return;
            }
            state.phase = ReplicaState::Ready;
        }
        self.lifecycle.loaded().resolve();
        debug!(records = self.len(), "ordered replica loaded");
    }

    /// Broadcasts a terminal subscription error, then destroys the replica.
    pub fn apply_error(&self, cause: RemoteError) {
        if self.is_destroyed() {
            return;
        }
        error!(
            %cause,
            location = %self.store.location_key(),
            "ordered replica subscription failed"
        );
        self.lifecycle.fail(cause);
        self.destroy();
    }

    fn ensure_live(&self, operation: &'static str) -> ReplicaResult<()> {
        if self.is_destroyed() {
            return Err(ReplicaError::destroyed(operation));
        }
        Ok(())
    }

    fn resolve(&self, target: RecordRef) -> ReplicaResult<Record> {
        let state = self.state.read();
        match target {
            RecordRef::Index(index) => state.records.get(index).cloned().ok_or_else(|| {
                ReplicaError::invalid_reference(format!(
                    "index {index} is out of range for {} records",
                    state.records.len()
                ))
            }),
            RecordRef::Record(record) => {
                if record.id().is_empty() {
                    return Err(ReplicaError::invalid_reference("record has no id"));
                }
                if position(&state.records, record.id()).is_none() {
                    return Err(ReplicaError::invalid_reference(format!(
                        "record {} is not a member of this replica",
                        record.id()
                    )));
                }
                Ok(record)
            }
        }
    }
}

impl EventApplier for OrderedReplica {
    fn apply_event(&self, event: RemoteEvent) {
        match event {
            RemoteEvent::ChildAdded { snapshot, prev_id } => {
                self.apply_added(&snapshot, prev_id.as_deref())
            }
            RemoteEvent::ChildRemoved { id } => self.apply_removed(&id),
            RemoteEvent::ChildMoved { id, prev_id } => self.apply_moved(&id, prev_id.as_deref()),
            RemoteEvent::ChildChanged { snapshot } => self.apply_updated(&snapshot),
            RemoteEvent::Loaded => self.apply_loaded(),
            RemoteEvent::Error { cause } => self.apply_error(cause),
            RemoteEvent::Value { .. } => {}
        }
    }
}

impl Drop for OrderedReplica {
    fn drop(&mut self) {
        self.lifecycle.detach();
    }
}

impl std::fmt::Debug for OrderedReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("OrderedReplica")
            .field("location", &self.store.location_key())
            .field("phase", &state.phase)
            .field("records", &state.records.len())
            .field("loaded", &self.lifecycle.loaded().is_settled())
            .finish()
    }
}

fn position(records: &[Record], id: &str) -> Option<usize> {
    records.iter().position(|record| record.id() == id)
}

/// Inserts at the front for no `prev_id`, after `prev_id` when present, and
/// at the end when `prev_id` is unknown.
fn insert_after(records: &mut Vec<Record>, record: Record, prev_id: Option<&str>) {
    let index = match prev_id {
        None => 0,
        Some(prev) => position(records, prev).map_or(records.len(), |i| i + 1),
    };
    records.insert(index, record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use parking_lot::Mutex;
    use serde_json::json;

    fn replica() -> Arc<OrderedReplica> {
        OrderedReplica::detached(Arc::new(MemoryStore::new("items")), ReplicaConfig::new())
    }

    fn snap(key: &str, value: Value) -> Snapshot {
        Snapshot::new(key, value, Value::Null)
    }

    fn recorded(replica: &OrderedReplica) -> Arc<Mutex<Vec<ChangeEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        replica.watch(move |e| sink.lock().push(e.clone()));
        events
    }

    #[test]
    fn insert_after_rules() {
        let r = replica();
        r.apply_added(&snap("a", json!(1)), None);
        r.apply_added(&snap("b", json!(2)), Some("a"));
        r.apply_added(&snap("c", json!(3)), None);
        r.apply_added(&snap("d", json!(4)), Some("missing"));

        assert_eq!(r.keys(), vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn duplicate_add_is_silent() {
        let r = replica();
        r.apply_added(&snap("a", json!({"x": 1})), None);
        let events = recorded(&r);

        r.apply_added(&snap("a", json!({"x": 99})), None);

        assert_eq!(r.len(), 1);
        assert_eq!(r.get_record("a").unwrap().get("x"), Some(&json!(1)));
        assert!(events.lock().is_empty());
    }

    #[test]
    fn removing_absent_record_is_silent() {
        let r = replica();
        let events = recorded(&r);
        r.apply_removed("ghost");
        r.apply_moved("ghost", None);
        r.apply_updated(&snap("ghost", json!(1)));
        assert!(events.lock().is_empty());
        assert!(r.is_empty());
    }

    #[test]
    fn update_notifies_only_on_change() {
        let r = replica();
        r.apply_added(&Snapshot::new("a", json!({"x": 1}), json!(1)), None);
        let events = recorded(&r);

        r.apply_updated(&Snapshot::new("a", json!({"x": 1}), json!(1)));
        assert!(events.lock().is_empty());

        r.apply_updated(&Snapshot::new("a", json!({"x": 1}), json!(2)));
        r.apply_updated(&Snapshot::new("a", json!({"y": 1}), json!(2)));

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], ChangeEvent::Updated { key: "a".into() });
        let record = r.get_record("a").unwrap();
        assert_eq!(record.get("x"), None);
        assert_eq!(record.get("y"), Some(&json!(1)));
    }

    #[test]
    fn key_at_and_index_for() {
        let r = replica();
        r.apply_added(&snap("a", json!(1)), None);
        r.apply_added(&snap("b", json!(2)), Some("a"));

        assert_eq!(r.key_at(1usize), Some("b".to_string()));
        assert_eq!(r.key_at(2usize), None);
        assert_eq!(r.index_for("b"), Some(1));
        assert_eq!(r.index_for("z"), None);

        let foreign = Record::empty("z");
        assert_eq!(r.key_at(&foreign), None);
        let member = r.get_record("a").unwrap();
        assert_eq!(r.key_at(&member), Some("a".to_string()));
    }

    #[tokio::test]
    async fn save_out_of_range_is_invalid_reference() {
        let r = replica();
        r.apply_added(&snap("a", json!(1)), None);
        r.apply_added(&snap("b", json!(2)), Some("a"));

        let err = r.save(5usize).await.unwrap_err();
        assert!(matches!(err, ReplicaError::InvalidReference(_)));
        let err = r.remove(Record::empty("nope")).await.unwrap_err();
        assert!(matches!(err, ReplicaError::InvalidReference(_)));
    }

    #[tokio::test]
    async fn writes_after_destroy_are_rejected() {
        let r = replica();
        r.destroy();

        let err = r.add(json!({"x": 1})).await.unwrap_err();
        assert_eq!(err, ReplicaError::destroyed("add"));
        assert_eq!(r.save(0usize).await.unwrap_err(), ReplicaError::destroyed("save"));
        assert_eq!(r.remove(0usize).await.unwrap_err(), ReplicaError::destroyed("remove"));
    }

    #[tokio::test]
    async fn add_rejects_invalid_keys_before_writing() {
        let store = Arc::new(MemoryStore::new("items"));
        let r = OrderedReplica::detached(store.clone(), ReplicaConfig::new());

        let err = r.add(json!({"a.b": 1})).await.unwrap_err();
        assert!(matches!(err, ReplicaError::ValidationFailure(_)));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn error_notifies_then_destroys() {
        let r = replica();
        r.apply_added(&snap("a", json!(1)), None);
        let events = recorded(&r);

        r.apply_error(RemoteError::permission_denied("nope"));
        r.apply_error(RemoteError::permission_denied("again"));

        assert!(r.is_destroyed());
        assert!(r.is_empty());
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event(), "error");
    }

    #[test]
    fn destroy_is_idempotent() {
        let r = replica();
        r.apply_added(&snap("a", json!(1)), None);
        let events = recorded(&r);

        r.destroy();
        r.destroy();

        assert_eq!(r.state(), ReplicaState::Destroyed);
        assert_eq!(r.watcher_count(), 0);
        r.apply_added(&snap("b", json!(1)), None);
        assert!(r.is_empty());
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn loaded_rejects_when_destroyed_first() {
        let r = replica();
        r.destroy();
        assert!(r.loaded().await.unwrap_err().is_destroyed());
    }
}
