//! Entry point tying a remote store location to its replicas.

use crate::config::ReplicaConfig;
use crate::error::ReplicaResult;
use crate::ordered::OrderedReplica;
use crate::scalar::ScalarReplica;
use crate::session::ReplicaSession;
use crate::store::{Location, RemoteStore, TransactionUpdate, WriteAck};
use livesync_protocol::{to_wire, Snapshot, Value, WireError};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

struct Slot<R> {
    replica: Arc<R>,
    session: Option<ReplicaSession>,
}

impl<R> Slot<R> {
    fn live(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_destroyed())
    }
}

/// Hands out replicas of one store location and writes to it directly.
///
/// Each replica kind is created once and handed out again while its
/// session is live. After the replica is destroyed, the next request
/// builds a fresh one.
pub struct ReplicaFactory {
    store: Arc<dyn RemoteStore>,
    config: ReplicaConfig,
    ordered: Mutex<Option<Slot<OrderedReplica>>>,
    scalar: Mutex<Option<Slot<ScalarReplica>>>,
}

impl ReplicaFactory {
    /// Creates a factory for `store` with the default configuration.
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self::with_config(store, ReplicaConfig::default())
    }

    /// Creates a factory for `store`.
    pub fn with_config(store: Arc<dyn RemoteStore>, config: ReplicaConfig) -> Self {
        Self {
            store,
            config,
            ordered: Mutex::new(None),
            scalar: Mutex::new(None),
        }
    }

    /// Returns the store location this factory serves.
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Returns the configuration replicas are built with.
    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Returns the ordered replica of the location's children.
    pub fn ordered(&self) -> ReplicaResult<Arc<OrderedReplica>> {
        let mut slot = self.ordered.lock();
        if let Some(existing) = slot.as_ref().filter(|s| s.live()) {
            return Ok(Arc::clone(&existing.replica));
        }
        let replica = OrderedReplica::attach(Arc::clone(&self.store), self.config.clone())?;
        debug!(location = %self.store.location_key(), "created ordered replica");
        *slot = Some(Slot {
            session: replica.session(),
            replica: Arc::clone(&replica),
        });
        Ok(replica)
    }

    /// Returns the scalar replica of the location itself.
    pub fn scalar(&self) -> ReplicaResult<Arc<ScalarReplica>> {
        let mut slot = self.scalar.lock();
        if let Some(existing) = slot.as_ref().filter(|s| s.live()) {
            return Ok(Arc::clone(&existing.replica));
        }
        let replica = ScalarReplica::attach(Arc::clone(&self.store), self.config.clone())?;
        debug!(location = %self.store.location_key(), "created scalar replica");
        *slot = Some(Slot {
            session: replica.session(),
            replica: Arc::clone(&replica),
        });
        Ok(replica)
    }

    /// Writes `content` as a new child under a store-assigned key.
    pub async fn push(&self, content: Value) -> ReplicaResult<WriteAck> {
        let wire = to_wire(&content)?;
        Ok(self.store.push(wire).await?)
    }

    /// Replaces the content of child `key`, or of the location itself.
    pub async fn set(&self, key: Option<&str>, content: Value) -> ReplicaResult<WriteAck> {
        let wire = to_wire(&content)?;
        Ok(self.store.set(Location::from(key), wire).await?)
    }

    /// Merges the top-level keys of `partial` into child `key`, or into the
    /// location itself. Keys mapped to null are deleted.
    pub async fn update(&self, key: Option<&str>, partial: Value) -> ReplicaResult<WriteAck> {
        let wire = to_wire(&partial)?;
        Ok(self.store.update(Location::from(key), wire).await?)
    }

    /// Deletes child `key`, or the whole location.
    pub async fn remove(&self, key: Option<&str>) -> ReplicaResult<WriteAck> {
        Ok(self.store.delete(Location::from(key)).await?)
    }

    /// Atomically rewrites child `key`, or the location itself, from its
    /// current content.
    ///
    /// `update` returns the new content, or `None` to abort, and may run
    /// more than once. Resolves to the committed snapshot, or `None` if the
    /// transaction was aborted. Content that cannot be written aborts the
    /// transaction with a validation failure.
    pub async fn transaction<F>(
        &self,
        key: Option<&str>,
        mut update: F,
    ) -> ReplicaResult<Option<Snapshot>>
    where
        F: FnMut(&Value) -> Option<Value> + Send + 'static,
    {
        let invalid: Arc<Mutex<Option<WireError>>> = Arc::default();
        let rejected = Arc::clone(&invalid);
        let checked: TransactionUpdate = Box::new(move |current: &Value| {
            let next = update(current)?;
            match to_wire(&next) {
                Ok(wire) => Some(wire),
                Err(e) => {
                    *rejected.lock() = Some(e);
                    None
                }
            }
        });

        let committed = self.store.transaction(Location::from(key), checked).await?;
        if let Some(e) = invalid.lock().take() {
            return Err(e.into());
        }
        Ok(committed)
    }
}

impl std::fmt::Debug for ReplicaFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaFactory")
            .field("location", &self.store.location_key())
            .finish()
    }
}
