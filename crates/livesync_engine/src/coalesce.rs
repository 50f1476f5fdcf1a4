//! Coalescing scheduler for remote events.
//!
//! Remote stores deliver bursts of events during the initial sync and single
//! events afterwards. The [`Coalescer`] queues wrapped handler calls and runs
//! them together once no new call has arrived for `wait`, or at the latest
//! once the first queued call has waited `max_wait`.
//!
//! # Guarantees
//!
//! - Calls run in FIFO enqueue order, each with its own arguments
//! - Nothing is dropped or reordered across batches
//! - The queue is swapped out before any handler runs, so handlers that
//!   enqueue more work start a new batch
//! - A panicking handler does not stop the rest of its batch
//!
//! Deadlines are computed from an injected [`Clock`]. With
//! `auto_flush` enabled a tokio task flushes batches as they come due;
//! otherwise the owner calls [`Coalescer::flush_due`].

use crate::clock::Clock;
use crate::config::CoalesceConfig;
use crate::error::{ReplicaError, ReplicaResult};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, trace};

type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Batch {
    queue: Vec<Job>,
    started_at: Option<u64>,
    deadline: Option<u64>,
    closed: bool,
}

struct Shared {
    config: CoalesceConfig,
    clock: Arc<dyn Clock>,
    batch: Mutex<Batch>,
    // Held while a batch runs so batches never interleave. The flag marks
    // a flush in progress on the owning thread.
    flush_gate: ReentrantMutex<Cell<bool>>,
    wake: Arc<Notify>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.wake.notify_one();
    }
}

/// Batches handler invocations. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct Coalescer {
    shared: Arc<Shared>,
}

impl Coalescer {
    /// Creates a scheduler. No background task is started.
    pub fn new(config: CoalesceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                clock,
                batch: Mutex::new(Batch::default()),
                flush_gate: ReentrantMutex::new(Cell::new(false)),
                wake: Arc::new(Notify::new()),
            }),
        }
    }

    /// Returns the scheduler configuration.
    pub fn config(&self) -> &CoalesceConfig {
        &self.shared.config
    }

    /// Wraps `handler` so that each call is queued instead of run.
    pub fn wrap<A, F>(&self, handler: F) -> Wrapped<A>
    where
        A: Send + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        Wrapped {
            coalescer: self.clone(),
            handler: Arc::new(handler),
        }
    }

    /// Queues a job using the current clock time.
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
        let now = self.shared.clock.now_millis();
        self.enqueue_at(Box::new(job), now);
    }

    fn enqueue_at(&self, job: Job, now: u64) {
        let config = &self.shared.config;
        {
            let mut batch = self.shared.batch.lock();
            if batch.closed {
                trace!("coalescer closed, dropping queued call");
                return;
            }
            batch.queue.push(job);
            match batch.started_at {
                Some(start) if now.saturating_sub(start) > config.max_wait_millis() => {
                    batch.deadline = Some(now);
                }
                Some(_) => {
                    batch.deadline = Some(now + config.wait_millis());
                }
                None => {
                    batch.started_at = Some(now);
                    batch.deadline = Some(now + config.wait_millis());
                }
            }
        }
        self.shared.wake.notify_one();
    }

    /// Returns the number of queued calls.
    pub fn pending(&self) -> usize {
        self.shared.batch.lock().queue.len()
    }

    /// Returns the time at which the current batch is due, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.shared.batch.lock().deadline
    }

    /// Flushes the current batch if it is due now. Returns the number of calls run.
    pub fn flush_due(&self) -> usize {
        let now = self.shared.clock.now_millis();
        self.flush_due_at(now)
    }

    /// Flushes the current batch if it is due at `now`.
    pub fn flush_due_at(&self, now: u64) -> usize {
        self.run_batch(|batch| batch.deadline.is_some_and(|d| d <= now))
    }

    /// Flushes the current batch immediately.
    pub fn flush(&self) -> usize {
        self.run_batch(|batch| !batch.queue.is_empty())
    }

    fn run_batch(&self, due: impl FnOnce(&Batch) -> bool) -> usize {
        let gate = self.shared.flush_gate.lock();
        if gate.get() {
            // Called from inside a handler; the new batch keeps its deadline.
            return 0;
        }

        let jobs = {
            let mut batch = self.shared.batch.lock();
            if !due(&*batch) {
                return 0;
            }
            batch.started_at = None;
            batch.deadline = None;
            std::mem::take(&mut batch.queue)
        };

        let count = jobs.len();
        trace!(count, "flushing coalesced batch");
        gate.set(true);
        for job in jobs {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("batched handler panicked; continuing with the rest of the batch");
            }
        }
        gate.set(false);
        count
    }

    /// Stops the scheduler. Queued calls are discarded and later calls ignored.
    pub fn close(&self) {
        {
            let mut batch = self.shared.batch.lock();
            batch.closed = true;
            batch.queue.clear();
            batch.started_at = None;
            batch.deadline = None;
        }
        self.shared.wake.notify_one();
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.batch.lock().closed
    }

    /// Spawns a task on the current tokio runtime that flushes batches when due.
    ///
    /// The task exits when the scheduler is closed or dropped.
    pub fn spawn_driver(&self) -> ReplicaResult<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ReplicaError::Runtime(e.to_string()))?;
        let weak = Arc::downgrade(&self.shared);
        let wake = Arc::clone(&self.shared.wake);
        Ok(runtime.spawn(drive(weak, wake)))
    }
}

async fn drive(weak: Weak<Shared>, wake: Arc<Notify>) {
    loop {
        let sleep_for = {
            let Some(shared) = weak.upgrade() else {
                break;
            };
            let coalescer = Coalescer { shared };
            if coalescer.is_closed() {
                break;
            }
            let now = coalescer.shared.clock.now_millis();
            match coalescer.next_deadline() {
                Some(deadline) if deadline <= now => {
                    coalescer.flush_due_at(now);
                    continue;
                }
                Some(deadline) => Some(Duration::from_millis(deadline - now)),
                None => None,
            }
        };

        match sleep_for {
            Some(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }
    }
    trace!("coalescer driver stopped");
}

/// A handler wrapped by a [`Coalescer`].
pub struct Wrapped<A> {
    coalescer: Coalescer,
    handler: Arc<dyn Fn(A) + Send + Sync>,
}

impl<A: Send + 'static> Wrapped<A> {
    /// Queues one invocation of the handler with `args`.
    pub fn call(&self, args: A) {
        let handler = Arc::clone(&self.handler);
        self.coalescer.enqueue(move || handler(args));
    }
}

impl<A> Clone for Wrapped<A> {
    fn clone(&self) -> Self {
        Self {
            coalescer: self.coalescer.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manual(wait_ms: u64) -> (Coalescer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let config = CoalesceConfig::manual(Duration::from_millis(wait_ms));
        (Coalescer::new(config, clock.clone()), clock)
    }

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |n| sink.lock().push(n))
    }

    #[test]
    fn rapid_calls_flush_once_in_order() {
        let (coalescer, clock) = manual(50);
        let (seen, handler) = recorder();
        let wrapped = coalescer.wrap(handler);

        for n in 0..5 {
            wrapped.call(n);
            clock.advance(10);
        }
        assert!(seen.lock().is_empty());
        assert_eq!(coalescer.flush_due(), 0);

        clock.advance(50);
        assert_eq!(coalescer.flush_due(), 5);
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(coalescer.pending(), 0);
        assert_eq!(coalescer.next_deadline(), None);
    }

    #[test]
    fn each_call_resets_the_timer() {
        let (coalescer, clock) = manual(50);
        let (seen, handler) = recorder();
        let wrapped = coalescer.wrap(handler);

        wrapped.call(1);
        assert_eq!(coalescer.next_deadline(), Some(50));

        clock.advance(40);
        wrapped.call(2);
        assert_eq!(coalescer.next_deadline(), Some(90));

        assert_eq!(coalescer.flush_due_at(60), 0);
        assert_eq!(coalescer.flush_due_at(90), 2);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn max_wait_bounds_latency() {
        let clock = Arc::new(ManualClock::new(0));
        let config = CoalesceConfig::manual(Duration::from_millis(50))
            .with_max_wait(Duration::from_millis(100));
        let coalescer = Coalescer::new(config, clock.clone());
        let (seen, handler) = recorder();
        let wrapped = coalescer.wrap(handler);

        // Calls every 40ms would postpone a plain debounce forever.
        for n in 0..3 {
            wrapped.call(n);
            clock.advance(40);
        }
        // now = 120, 120ms since the first call: the next call is due at once
        wrapped.call(3);
        assert_eq!(coalescer.next_deadline(), Some(120));
        assert_eq!(coalescer.flush_due(), 4);
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn handlers_that_enqueue_start_a_new_batch() {
        let (coalescer, clock) = manual(50);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner = coalescer.clone();
        let sink = Arc::clone(&seen);
        let wrapped = coalescer.wrap(move |n: u32| {
            sink.lock().push(n);
            if n == 0 {
                let sink = Arc::clone(&sink);
                inner.enqueue(move || sink.lock().push(100));
            }
        });

        wrapped.call(0);
        wrapped.call(1);
        clock.advance(50);

        assert_eq!(coalescer.flush_due(), 2);
        assert_eq!(*seen.lock(), vec![0, 1]);
        assert_eq!(coalescer.pending(), 1);

        clock.advance(50);
        assert_eq!(coalescer.flush_due(), 1);
        assert_eq!(*seen.lock(), vec![0, 1, 100]);
    }

    #[test]
    fn flush_from_inside_a_handler_is_ignored() {
        let (coalescer, _clock) = manual(50);
        let inner = coalescer.clone();
        let nested = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&nested);

        coalescer.enqueue(move || {
            inner.enqueue(|| {});
            *slot.lock() = Some(inner.flush());
        });

        assert_eq!(coalescer.flush(), 1);
        assert_eq!(*nested.lock(), Some(0));
        assert_eq!(coalescer.pending(), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_batch() {
        let (coalescer, _clock) = manual(50);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let wrapped = coalescer.wrap(move |n: u32| {
            if n == 1 {
                panic!("handler failure");
            }
            sink.lock().push(n);
        });

        wrapped.call(0);
        wrapped.call(1);
        wrapped.call(2);

        assert_eq!(coalescer.flush(), 3);
        assert_eq!(*seen.lock(), vec![0, 2]);
    }

    #[test]
    fn zero_argument_calls() {
        let (coalescer, _clock) = manual(50);
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let wrapped = coalescer.wrap(move |()| *sink.lock() += 1);

        wrapped.call(());
        wrapped.call(());
        coalescer.flush();

        assert_eq!(*count.lock(), 2);
    }

    #[test]
    fn closed_coalescer_discards_calls() {
        let (coalescer, _clock) = manual(50);
        let (seen, handler) = recorder();
        let wrapped = coalescer.wrap(handler);

        wrapped.call(1);
        coalescer.close();
        wrapped.call(2);

        assert!(coalescer.is_closed());
        assert_eq!(coalescer.pending(), 0);
        assert_eq!(coalescer.flush(), 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn driver_requires_a_runtime() {
        let (coalescer, _clock) = manual(50);
        assert!(matches!(
            coalescer.spawn_driver(),
            Err(ReplicaError::Runtime(_))
        ));
    }

    #[tokio::test]
    async fn driver_flushes_due_batches() {
        let clock = Arc::new(crate::clock::SystemClock::new());
        let coalescer = Coalescer::new(CoalesceConfig::new(Duration::from_millis(10)), clock);
        let driver = coalescer.spawn_driver().unwrap();
        let (seen, handler) = recorder();
        let wrapped = coalescer.wrap(handler);

        wrapped.call(1);
        wrapped.call(2);
        wrapped.call(3);

        for _ in 0..100 {
            if seen.lock().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*seen.lock(), vec![1, 2, 3]);

        coalescer.close();
        tokio::time::timeout(Duration::from_secs(1), driver)
            .await
            .unwrap()
            .unwrap();
    }
}
