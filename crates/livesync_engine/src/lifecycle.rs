//! State shared by every replica kind: phase, watchers, the loaded signal
//! and the attached session.

use crate::error::ReplicaError;
use crate::loaded::LoadSignal;
use crate::session::ReplicaSession;
use crate::watch::{ChangeEvent, WatchHandle, WatcherSet};
use livesync_protocol::RemoteError;
use parking_lot::Mutex;

/// Lifecycle phase of a replica.
///
/// `Destroyed` is terminal and reachable from every other phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Built but not subscribed.
    Created,
    /// Subscribed, initial snapshot not yet complete.
    Loading,
    /// Initial snapshot applied.
    Ready,
    /// Torn down.
    Destroyed,
}

pub(crate) struct Lifecycle {
    watchers: WatcherSet,
    loaded: LoadSignal,
    session: Mutex<Option<ReplicaSession>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            watchers: WatcherSet::new(),
            loaded: LoadSignal::new(),
            session: Mutex::new(None),
        }
    }

    pub(crate) fn watch<F>(&self, callback: F) -> WatchHandle
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.watchers.register(callback)
    }

    pub(crate) fn notify(&self, event: ChangeEvent) {
        self.watchers.notify(&event);
    }

    pub(crate) fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    pub(crate) fn loaded(&self) -> &LoadSignal {
        &self.loaded
    }

    /// Stores `session`, destroying it at once if the replica died while
    /// the session was being attached.
    pub(crate) fn install_session(&self, session: ReplicaSession, destroyed: impl Fn() -> bool) {
        *self.session.lock() = Some(session);
        if destroyed() {
            self.detach();
        }
    }

    pub(crate) fn session(&self) -> Option<ReplicaSession> {
        self.session.lock().clone()
    }

    pub(crate) fn flush(&self) -> usize {
        self.session().map_or(0, |session| session.flush())
    }

    /// Stops event delivery from the session, if any.
    pub(crate) fn detach(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.destroy();
        }
    }

    /// Runs the teardown that follows marking a replica destroyed.
    pub(crate) fn teardown(&self) {
        self.detach();
        self.loaded.reject(ReplicaError::destroyed("loaded"));
        self.watchers.clear();
    }

    /// Broadcasts a terminal error and fails a pending load with it.
    pub(crate) fn fail(&self, cause: RemoteError) {
        self.loaded.reject(ReplicaError::RemoteFailure(cause.clone()));
        self.notify(ChangeEvent::Error { cause });
    }
}
