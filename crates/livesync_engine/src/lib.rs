//! # livesync Engine
//!
//! Local replicas of remote data, kept in step with a store that pushes
//! change events.
//!
//! This crate provides:
//! - Coalescing scheduler that batches bursts of remote events
//! - Ordered replica (a list of records placed by `prev_id`)
//! - Scalar replica (one record) with an optional view binding
//! - Replica session owning one store subscription
//! - Factory reusing live replicas and writing through to the store
//! - `RemoteStore` and `ViewBinder` collaborator traits, with in-memory
//!   implementations
//!
//! ## Architecture
//!
//! Events flow store → session → coalescer → replica → watchers:
//! 1. The session subscribes to the store
//! 2. Each event is queued in the session's coalescer
//! 3. On flush, events are applied to the replica in delivery order
//! 4. The replica mutates its state and notifies watchers
//!
//! Writes (`add`, `save`, `remove`, binding write-backs) go straight to
//! the store. Local state changes only when the store echoes the write
//! back as an event.
//!
//! ## Key Invariants
//!
//! - The store is the single source of truth for content and order
//! - Events are applied in delivery order, never dropped or reordered
//! - Duplicate adds and removals of absent records are no-ops
//! - Identical updates never notify
//! - `destroy` is idempotent and terminal

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod binder;
mod clock;
mod coalesce;
mod config;
mod error;
mod factory;
mod lifecycle;
mod loaded;
mod memory_store;
mod ordered;
mod scalar;
mod session;
mod store;
mod strategy;
mod watch;

pub use binder::{
    ChangeListener, ListenerId, MemoryBinder, TeardownHook, TeardownId, ViewBinder,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coalesce::{Coalescer, Wrapped};
pub use config::{CoalesceConfig, ReplicaConfig, DEFAULT_BATCH_DELAY};
pub use error::{ReplicaError, ReplicaResult};
pub use factory::ReplicaFactory;
pub use lifecycle::ReplicaState;
pub use memory_store::{MemoryStore, WriteOp, WriteRecord};
pub use ordered::{OrderedReplica, RecordRef};
pub use scalar::{ScalarReplica, Unbind};
pub use session::{EventApplier, ReplicaSession};
pub use store::{
    ErrorCallback, EventCallback, Location, RemoteStore, StoreResult, SubscriptionHandle,
    TransactionUpdate, WriteAck,
};
pub use strategy::{ContentMerger, DefaultStrategy, RecordFactory};
pub use watch::{ChangeEvent, WatchHandle};
