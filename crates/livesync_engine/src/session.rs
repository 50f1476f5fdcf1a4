//! Replica session: one store subscription feeding one replica.
//!
//! The session subscribes to the store, pushes every inbound event
//! (including the terminal error) through its own [`Coalescer`], and on
//! flush hands each event to the live replica. Destroying the session
//! unsubscribes, closes the scheduler and forgets the replica, so events
//! still queued are dropped.

use crate::coalesce::Coalescer;
use crate::config::ReplicaConfig;
use crate::error::ReplicaResult;
use crate::store::{RemoteStore, SubscriptionHandle};
use livesync_protocol::{EventKind, RemoteError, RemoteEvent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Receives remote events once the scheduler flushes them.
pub trait EventApplier: Send + Sync {
    /// Applies one event to local state.
    fn apply_event(&self, event: RemoteEvent);
}

struct SessionInner {
    store: Arc<dyn RemoteStore>,
    coalescer: Coalescer,
    replica: Mutex<Option<Weak<dyn EventApplier>>>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    destroyed: AtomicBool,
}

/// Owns the subscription between a remote store and a replica.
///
/// Cheap to clone; clones refer to the same session.
#[derive(Clone)]
pub struct ReplicaSession {
    inner: Arc<SessionInner>,
}

impl ReplicaSession {
    /// Subscribes `store` for `kinds` and routes batched events to `replica`.
    ///
    /// With `auto_flush` enabled the scheduler's driver task is spawned on
    /// the current tokio runtime; that fails with
    /// [`ReplicaError::Runtime`](crate::ReplicaError::Runtime) outside one.
    pub fn attach(
        store: Arc<dyn RemoteStore>,
        replica: Weak<dyn EventApplier>,
        kinds: &[EventKind],
        config: &ReplicaConfig,
    ) -> ReplicaResult<Self> {
        let coalescer = Coalescer::new(config.coalesce.clone(), Arc::clone(&config.clock));
        if config.coalesce.auto_flush {
            coalescer.spawn_driver()?;
        }

        let inner = Arc::new(SessionInner {
            store: Arc::clone(&store),
            coalescer: coalescer.clone(),
            replica: Mutex::new(Some(replica)),
            subscription: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let deliver = coalescer.wrap(move |event: RemoteEvent| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let replica = inner.replica.lock().as_ref().and_then(Weak::upgrade);
            match replica {
                Some(replica) => replica.apply_event(event),
                None => trace!(kind = ?event.kind(), "dropping event for detached replica"),
            }
        });
        let deliver_error = deliver.clone();

        let handle = store.subscribe(
            kinds,
            Arc::new(move |event: RemoteEvent| deliver.call(event)),
            Arc::new(move |cause: RemoteError| deliver_error.call(RemoteEvent::Error { cause })),
        );
        *inner.subscription.lock() = Some(handle);

        debug!(location = %store.location_key(), ?kinds, "replica session attached");
        Ok(Self { inner })
    }

    /// Stops event delivery. Later calls do nothing.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.subscription.lock().take() {
            self.inner.store.unsubscribe(handle);
        }
        self.inner.coalescer.close();
        *self.inner.replica.lock() = None;
        debug!(location = %self.inner.store.location_key(), "replica session destroyed");
    }

    /// Returns true once [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Applies every queued event now. Returns the number applied.
    pub fn flush(&self) -> usize {
        self.inner.coalescer.flush()
    }

    /// Applies queued events if their batch is due.
    pub fn flush_due(&self) -> usize {
        self.inner.coalescer.flush_due()
    }

    /// Returns the number of events waiting for a flush.
    pub fn pending(&self) -> usize {
        self.inner.coalescer.pending()
    }

    /// Returns the store this session subscribes to.
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.inner.store
    }
}

impl std::fmt::Debug for ReplicaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSession")
            .field("location", &self.inner.store.location_key())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
