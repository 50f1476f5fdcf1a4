//! Scalar replica: one record mirroring a whole remote location, with an
//! optional two-way binding to a view location.

use crate::binder::{ChangeListener, ListenerId, TeardownId, ViewBinder};
use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, ReplicaResult};
use crate::lifecycle::{Lifecycle, ReplicaState};
use crate::session::{EventApplier, ReplicaSession};
use crate::store::{Location, RemoteStore};
use crate::watch::{ChangeEvent, WatchHandle};
use livesync_protocol::{to_wire, EventKind, Record, RemoteError, RemoteEvent, Snapshot, Value};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, error, trace, warn};

struct ScalarState {
    record: Record,
    phase: ReplicaState,
}

struct Binding {
    id: u64,
    binder: Arc<dyn ViewBinder>,
    path: String,
    listener: ListenerId,
    teardown: Option<TeardownId>,
}

/// A synchronized single record.
///
/// The record id is the key of the store's location.
pub struct ScalarReplica {
    store: Arc<dyn RemoteStore>,
    config: ReplicaConfig,
    state: RwLock<ScalarState>,
    binding: Mutex<Option<Binding>>,
    next_binding: AtomicU64,
    lifecycle: Lifecycle,
}

/// Removes the binding created by [`ScalarReplica::bind_to`].
///
/// Unbinding is idempotent and never affects a later binding.
#[derive(Debug, Clone)]
pub struct Unbind {
    replica: Weak<ScalarReplica>,
    binding_id: u64,
}

impl Unbind {
    /// Tears the binding down if it is still active.
    pub fn unbind(&self) {
        if let Some(replica) = self.replica.upgrade() {
            replica.release_binding(Some(self.binding_id));
        }
    }
}

impl ScalarReplica {
    /// Creates a replica that is not subscribed to `store`.
    pub fn detached(store: Arc<dyn RemoteStore>, config: ReplicaConfig) -> Arc<Self> {
        let record = Record::empty(store.location_key());
        Arc::new(Self {
            store,
            config,
            state: RwLock::new(ScalarState {
                record,
                phase: ReplicaState::Created,
            }),
            binding: Mutex::new(None),
            next_binding: AtomicU64::new(0),
            lifecycle: Lifecycle::new(),
        })
    }

    /// Creates a replica and subscribes it to the value of `store`.
    pub fn attach(store: Arc<dyn RemoteStore>, config: ReplicaConfig) -> ReplicaResult<Arc<Self>> {
        let replica = Self::detached(Arc::clone(&store), config);
        replica.state.write().phase = ReplicaState::Loading;

        let weak: Weak<ScalarReplica> = Arc::downgrade(&replica);
        let session = ReplicaSession::attach(store, weak, &[EventKind::Value], &replica.config)?;
        replica.lifecycle.install_session(session, || replica.is_destroyed());
        Ok(replica)
    }

    /// Returns the record id.
    pub fn id(&self) -> String {
        self.state.read().record.id().to_string()
    }

    /// Returns a copy of the record.
    pub fn record(&self) -> Record {
        self.state.read().record.clone()
    }

    /// Returns the record as one JSON object with `$id` and `$priority`.
    pub fn view(&self) -> Value {
        self.state.read().record.to_view()
    }

    /// Edits the local record without notifying anyone.
    ///
    /// Call [`save`](Self::save) to write the edit back.
    pub fn edit<R>(&self, f: impl FnOnce(&mut Record) -> R) -> ReplicaResult<R> {
        let mut state = self.state.write();
        if state.phase == ReplicaState::Destroyed {
            return Err(ReplicaError::destroyed("edit"));
        }
        Ok(f(&mut state.record))
    }

    /// Writes the current content to the store, replacing what is there.
    pub async fn save(&self) -> ReplicaResult<()> {
        let wire = {
            let state = self.state.read();
            if state.phase == ReplicaState::Destroyed {
                return Err(ReplicaError::destroyed("save"));
            }
            to_wire(&state.record.to_view())?
        };
        self.store.set(Location::Root, wire).await?;
        Ok(())
    }

    /// Returns the lifecycle phase.
    pub fn state(&self) -> ReplicaState {
        self.state.read().phase
    }

    /// Returns true once the replica has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.state() == ReplicaState::Destroyed
    }

    /// Returns true while a binding is active.
    pub fn is_bound(&self) -> bool {
        self.binding.lock().is_some()
    }

    /// Returns the store this replica writes to.
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Returns the session feeding this replica, if attached.
    pub fn session(&self) -> Option<ReplicaSession> {
        self.lifecycle.session()
    }

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

    /// Waits for the initial value and returns the record.
    pub async fn loaded(&self) -> ReplicaResult<Record> {
        self.lifecycle.loaded().wait().await?;
        Ok(self.record())
    }

    /// Waits for the initial value and maps the record with `f`.
    pub async fn loaded_then<T>(&self, f: impl FnOnce(&Record) -> T) -> ReplicaResult<T> {
        self.lifecycle.loaded().wait().await?;
        Ok(f(&self.state.read().record))
    }

    /// Delivers queued remote events now. Returns the number applied.
    pub fn flush(&self) -> usize {
        self.lifecycle.flush()
    }

    /// Binds the replica to `path` on `binder`.
    ///
    /// Waits for the initial value, writes the record view to the location,
    /// then writes the location back to the store whenever a local edit
    /// makes it differ from the replica. The binding ends on
    /// [`Unbind::unbind`], on binder teardown, or when the replica is
    /// destroyed. Must be called within a tokio runtime.
    pub async fn bind_to(
        self: &Arc<Self>,
        binder: Arc<dyn ViewBinder>,
        path: impl Into<String>,
    ) -> ReplicaResult<Unbind> {
        let path = path.into();
        self.lifecycle.loaded().wait().await?;
        let runtime = Handle::try_current().map_err(|e| ReplicaError::Runtime(e.to_string()))?;

        let binding_id = self.next_binding.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let on_change: ChangeListener = Arc::new(move |value: &Value| {
            if let Some(replica) = weak.upgrade() {
                replica.location_changed(binding_id, value, &runtime);
            }
        });

        {
            let mut slot = self.binding.lock();
            if self.is_destroyed() {
                return Err(ReplicaError::destroyed("bind_to"));
            }
            if slot.is_some() {
                return Err(ReplicaError::AlreadyBound);
            }
            let listener = binder.register_change_listener(&path, on_change);
            *slot = Some(Binding {
                id: binding_id,
                binder: Arc::clone(&binder),
                path: path.clone(),
                listener,
                teardown: None,
            });
        }

        binder.write_location(&path, self.view());

        let unbind = Unbind {
            replica: Arc::downgrade(self),
            binding_id,
        };
        let on_teardown = unbind.clone();
        let hook = binder.on_teardown(Box::new(move || on_teardown.unbind()));
        let stale = {
            let mut slot = self.binding.lock();
            match slot.as_mut() {
                Some(active) if active.id == binding_id => {
                    active.teardown = Some(hook);
                    false
                }
                _ => true,
            }
        };
        if stale {
            binder.cancel_teardown(hook);
        }

        debug!(%path, binding = binding_id, "scalar replica bound");
        Ok(unbind)
    }

    /// Stops event delivery and drops any binding. Later calls do nothing.
    pub fn destroy(&self) {
        {
            let mut state = self.state.write();
            if state.phase == ReplicaState::Destroyed {
                return;
            }
            state.phase = ReplicaState::Destroyed;
            let id = state.record.id().to_string();
            state.record = Record::empty(id);
        }
        self.release_binding(None);
        self.lifecycle.teardown();
        debug!(location = %self.store.location_key(), "scalar replica destroyed");
    }

    /// Replaces the record content with a new remote value.
    ///
    /// If anything changed, the bound location is refreshed and watchers
    /// are notified.
    pub fn apply_updated(&self, snapshot: &Snapshot) {
        let (id, view) = {
            let mut state = self.state.write();
            if state.phase == ReplicaState::Destroyed {
                return;
            }
            if !self.config.content_merger.merge(&mut state.record, snapshot) {
                return;
            }
            (state.record.id().to_string(), state.record.to_view())
        };
        trace!(key = %id, "scalar record updated");

        let target = self
            .binding
            .lock()
            .as_ref()
            .map(|b| (Arc::clone(&b.binder), b.path.clone()));
        if let Some((binder, path)) = target {
            binder.write_location(&path, view);
        }
        self.lifecycle.notify(ChangeEvent::Updated { key: id });
    }

    /// Marks the initial value as delivered.
    pub fn apply_loaded(&self) {
        {
            let mut state = self.state.write();
            if state.phase == ReplicaState::Destroyed {
                return;
            }
            state.phase = ReplicaState::Ready;
        }
        self.lifecycle.loaded().resolve();
        debug!(location = %self.store.location_key(), "scalar replica loaded");
    }

    /// Broadcasts a terminal subscription error, then destroys the replica.
    pub fn apply_error(&self, cause: RemoteError) {
        if self.is_destroyed() {
            return;
        }
        error!(
            %cause,
            location = %self.store.location_key(),
            "scalar replica subscription failed"
        );
        self.lifecycle.fail(cause);
        self.destroy();
    }

    /// Releases the active binding; only if it is `only` when given.
    fn release_binding(&self, only: Option<u64>) {
        let binding = {
            let mut slot = self.binding.lock();
            let matches = match (slot.as_ref(), only) {
                (Some(active), Some(id)) => active.id == id,
                _ => true,
            };
            if matches {
                slot.take()
            } else {
                None
            }
        };
        if let Some(binding) = binding {
            binding.binder.remove_change_listener(binding.listener);
            if let Some(hook) = binding.teardown {
                binding.binder.cancel_teardown(hook);
            }
            debug!(path = %binding.path, binding = binding.id, "scalar replica unbound");
        }
    }

    fn location_changed(&self, binding_id: u64, value: &Value, runtime: &Handle) {
        let active = self
            .binding
            .lock()
            .as_ref()
            .is_some_and(|b| b.id == binding_id);
        if !active {
            return;
        }

        let external = match to_wire(value) {
            Ok(external) => external,
            Err(e) => {
                warn!(error = %e, "bound location holds a value that cannot be written");
                return;
            }
        };
        let current = match to_wire(&self.view()) {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "replica content cannot be written");
                return;
            }
        };
        if external == current {
            return;
        }

        trace!(binding = binding_id, "writing bound location back to the store");
        let store = Arc::clone(&self.store);
        runtime.spawn(async move {
            if let Err(e) = store.set(Location::Root, external).await {
                warn!(error = %e, "bound write-back failed");
            }
        });
    }
}

impl EventApplier for ScalarReplica {
    fn apply_event(&self, event: RemoteEvent) {
        match event {
            RemoteEvent::Value { snapshot } => self.apply_updated(&snapshot),
            RemoteEvent::Loaded => self.apply_loaded(),
            RemoteEvent::Error { cause } => self.apply_error(cause),
            RemoteEvent::ChildAdded { .. }
            | RemoteEvent::ChildRemoved { .. }
            | RemoteEvent::ChildMoved { .. }
            | RemoteEvent::ChildChanged { .. } => {}
        }
    }
}

impl Drop for ScalarReplica {
    fn drop(&mut self) {
        self.release_binding(None);
        self.lifecycle.detach();
    }
}

impl std::fmt::Debug for ScalarReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalarReplica")
            .field("location", &self.store.location_key())
            .field("phase", &self.state())
            .field("bound", &self.is_bound())
            .field("loaded", &self.lifecycle.loaded().is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::MemoryBinder;
    use crate::memory_store::MemoryStore;
    use serde_json::json;

    fn replica(store: &Arc<MemoryStore>) -> Arc<ScalarReplica> {
        ScalarReplica::detached(store.clone(), ReplicaConfig::new())
    }

    #[test]
    fn id_is_location_key() {
        let store = Arc::new(MemoryStore::new("profile"));
        let r = replica(&store);
        assert_eq!(r.id(), "profile");
        assert_eq!(r.view(), json!({"$id": "profile", "$priority": null}));
    }

    #[test]
    fn update_notifies_only_on_change() {
        let store = Arc::new(MemoryStore::new("profile"));
        let r = replica(&store);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        r.watch(move |e| sink.lock().push(e.clone()));

        r.apply_updated(&Snapshot::new("profile", json!({"x": 1}), Value::Null));
        r.apply_updated(&Snapshot::new("profile", json!({"x": 1}), Value::Null));
        r.apply_updated(&Snapshot::new("profile", json!(7), Value::Null));

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ChangeEvent::Updated { key: "profile".into() });
        assert_eq!(r.record().scalar_value(), Some(&json!(7)));
    }

    #[tokio::test]
    async fn edit_then_save_writes_root() {
        let store = Arc::new(MemoryStore::new("profile"));
        let r = replica(&store);

        r.edit(|record| record.set("name", json!("ada"))).unwrap();
        r.save().await.unwrap();

        assert_eq!(store.root_value(), json!({"name": "ada"}));
        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].at, Location::Root);
    }

    #[tokio::test]
    async fn bind_fails_while_bound() {
        let store = Arc::new(MemoryStore::new("profile"));
        let r = replica(&store);
        r.apply_loaded();
        let binder = Arc::new(MemoryBinder::new());

        let unbind = r.bind_to(binder.clone(), "profile").await.unwrap();
        let err = r.bind_to(binder.clone(), "other").await.unwrap_err();
        assert_eq!(err, ReplicaError::AlreadyBound);

        unbind.unbind();
        unbind.unbind();
        assert!(!r.is_bound());
        assert_eq!(binder.listener_count("profile"), 0);

        let again = r.bind_to(binder.clone(), "other").await.unwrap();
        unbind.unbind();
        assert!(r.is_bound());
        again.unbind();
    }

    #[tokio::test]
    async fn destroy_releases_binding() {
        let store = Arc::new(MemoryStore::new("profile"));
        let r = replica(&store);
        r.apply_loaded();
        let binder = Arc::new(MemoryBinder::new());
        r.bind_to(binder.clone(), "profile").await.unwrap();

        r.destroy();
        r.destroy();

        assert!(!r.is_bound());
        assert_eq!(binder.listener_count("profile"), 0);
        assert!(r.edit(|_| ()).unwrap_err().is_destroyed());
        assert!(r.save().await.unwrap_err().is_destroyed());
    }

    #[tokio::test]
    async fn binder_teardown_unbinds() {
        let store = Arc::new(MemoryStore::new("profile"));
        let r = replica(&store);
        r.apply_loaded();
        let binder = Arc::new(MemoryBinder::new());
        r.bind_to(binder.clone(), "profile").await.unwrap();

        binder.teardown();
        assert!(!r.is_bound());
    }

    #[tokio::test]
    async fn bind_after_error_reports_remote_failure() {
        let store = Arc::new(MemoryStore::new("profile"));
        let r = replica(&store);
        r.apply_error(RemoteError::permission_denied("nope"));

        let err = r
            .bind_to(Arc::new(MemoryBinder::new()), "profile")
            .await
            .unwrap_err();
        assert!(err.is_remote());
    }
}
