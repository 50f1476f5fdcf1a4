//! One-shot signal for the initial snapshot.

use crate::error::{ReplicaError, ReplicaResult};
use tokio::sync::watch;

#[derive(Debug, Clone)]
enum LoadState {
    Pending,
    Ready,
    Failed(ReplicaError),
}

/// Settles exactly once; later settle attempts are ignored.
#[derive(Debug)]
pub(crate) struct LoadSignal {
    tx: watch::Sender<LoadState>,
}

impl LoadSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(LoadState::Pending);
        Self { tx }
    }

    /// Marks the load as complete. Returns false if already settled.
    pub(crate) fn resolve(&self) -> bool {
        self.settle(LoadState::Ready)
    }

    /// Marks the load as failed. Returns false if already settled.
    pub(crate) fn reject(&self, error: ReplicaError) -> bool {
        self.settle(LoadState::Failed(error))
    }

    fn settle(&self, outcome: LoadState) -> bool {
        self.tx.send_if_modified(|state| {
            if matches!(state, LoadState::Pending) {
                *state = outcome;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn is_settled(&self) -> bool {
        !matches!(*self.tx.borrow(), LoadState::Pending)
    }

    /// Waits until the signal settles.
    pub(crate) async fn wait(&self) -> ReplicaResult<()> {
        let mut rx = self.tx.subscribe();
        let outcome = match rx.wait_for(|s| !matches!(s, LoadState::Pending)).await {
            Ok(state) => state.clone(),
            Err(_) => return Err(ReplicaError::destroyed("loaded")),
        };
        match outcome {
            LoadState::Failed(err) => Err(err),
            _ => Ok(()),
        }
    }
}
