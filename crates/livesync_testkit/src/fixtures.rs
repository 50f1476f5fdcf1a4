//! Test fixtures and replica helpers.
//!
//! Provides convenience functions for building stores and replicas whose
//! event delivery is driven by the test, and for observing what replicas
//! report to their watchers.

use livesync_engine::{
    ChangeEvent, CoalesceConfig, Location, MemoryStore, OrderedReplica, ReplicaConfig,
    ScalarReplica, DEFAULT_BATCH_DELAY,
};
use livesync_protocol::Value;
use parking_lot::Mutex;
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Installs a `tracing` subscriber honouring `RUST_LOG`, once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Returns a configuration whose events wait for an explicit flush.
pub fn manual_config() -> ReplicaConfig {
    ReplicaConfig::new().with_coalesce(CoalesceConfig::manual(DEFAULT_BATCH_DELAY))
}

/// Creates an empty in-memory store for the location `key`.
pub fn memory_store(key: &str) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(key))
}

/// Creates an in-memory store holding `children` as if written by
/// another client. Each entry is `(key, wire content)`.
pub fn seeded_store(key: &str, children: &[(&str, Value)]) -> Arc<MemoryStore> {
    let store = memory_store(key);
    for (child, content) in children {
        store.remote_set(Location::child(*child), content.clone());
    }
    store
}

/// Polls `condition` until it holds or about a second has passed.
///
/// Returns the final value of `condition`.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Records every change a replica reports to its watchers.
#[derive(Debug, Clone, Default)]
pub struct RecordingWatcher {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
}

impl RecordingWatcher {
    /// Creates a recorder watching `replica`.
    pub fn on_ordered(replica: &OrderedReplica) -> Self {
        let recorder = Self::default();
        let sink = Arc::clone(&recorder.events);
        replica.watch(move |event| sink.lock().push(event.clone()));
        recorder
    }

    /// Creates a recorder watching `replica`.
    pub fn on_scalar(replica: &ScalarReplica) -> Self {
        let recorder = Self::default();
        let sink = Arc::clone(&recorder.events);
        replica.watch(move |event| sink.lock().push(event.clone()));
        recorder
    }

    /// Returns the recorded events.
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }

    /// Returns the recorded event names (`added`, `moved`, ...).
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(ChangeEvent::event).collect()
    }

    /// Returns and forgets the recorded events.
    pub fn take(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Returns the number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
