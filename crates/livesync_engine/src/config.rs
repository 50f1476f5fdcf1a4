//! Configuration for replicas and their event scheduler.

use crate::clock::{Clock, SystemClock};
use crate::strategy::{ContentMerger, DefaultStrategy, RecordFactory};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default time to wait for more events before flushing a batch.
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(50);

/// Configuration for the coalescing scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalesceConfig {
    /// Time to wait after the latest event before flushing.
    pub wait: Duration,
    /// Upper bound on how long the first event of a batch may wait.
    pub max_wait: Duration,
    /// Whether a background task flushes batches when they come due.
    ///
    /// When false the owner calls `Coalescer::flush_due` itself.
    pub auto_flush: bool,
}

impl CoalesceConfig {
    /// Creates a configuration with the given wait and `max_wait = 10 x wait`.
    ///
    /// A zero wait gets a 100ms max wait.
    pub fn new(wait: Duration) -> Self {
        let max_wait = if wait.is_zero() {
            Duration::from_millis(100)
        } else {
            wait * 10
        };
        Self {
            wait,
            max_wait,
            auto_flush: true,
        }
    }

    /// Creates a configuration flushed by the caller instead of a background task.
    pub fn manual(wait: Duration) -> Self {
        Self::new(wait).with_auto_flush(false)
    }

    /// Sets the wait, keeping `max_wait` at ten times the new value.
    pub fn with_wait(self, wait: Duration) -> Self {
        Self {
            auto_flush: self.auto_flush,
            ..Self::new(wait)
        }
    }

    /// Sets the maximum wait.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Sets whether batches are flushed by a background task.
    pub fn with_auto_flush(mut self, auto_flush: bool) -> Self {
        self.auto_flush = auto_flush;
        self
    }

    pub(crate) fn wait_millis(&self) -> u64 {
        self.wait.as_millis() as u64
    }

    pub(crate) fn max_wait_millis(&self) -> u64 {
        self.max_wait.as_millis() as u64
    }
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_DELAY)
    }
}

/// Configuration used when a factory builds replicas.
///
/// The record factory and content merger decide how records are created
/// and how updates are merged into them. Swapping them changes replica
/// behaviour without touching the engine.
#[derive(Clone)]
pub struct ReplicaConfig {
    /// Scheduler configuration.
    pub coalesce: CoalesceConfig,
    /// Builds records from snapshots.
    pub record_factory: Arc<dyn RecordFactory>,
    /// Merges updates into existing records.
    pub content_merger: Arc<dyn ContentMerger>,
    /// Time source for the scheduler.
    pub clock: Arc<dyn Clock>,
}

impl ReplicaConfig {
    /// Creates a configuration with the default strategies and system clock.
    pub fn new() -> Self {
        let strategy = Arc::new(DefaultStrategy);
        Self {
            coalesce: CoalesceConfig::default(),
            record_factory: strategy.clone(),
            content_merger: strategy,
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Sets the scheduler configuration.
    pub fn with_coalesce(mut self, coalesce: CoalesceConfig) -> Self {
        self.coalesce = coalesce;
        self
    }

    /// Sets the record factory.
    pub fn with_record_factory(mut self, factory: Arc<dyn RecordFactory>) -> Self {
        self.record_factory = factory;
        self
    }

    /// Sets the content merger.
    pub fn with_content_merger(mut self, merger: Arc<dyn ContentMerger>) -> Self {
        self.content_merger = merger;
        self
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReplicaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaConfig")
            .field("coalesce", &self.coalesce)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
