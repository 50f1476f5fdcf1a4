//! # livesync Testkit
//!
//! Test utilities for livesync.
//!
//! This crate provides:
//! - Fixtures: manual-flush configurations, seeded stores, recording watchers
//! - Property-based generators using proptest (valid `prev_id` chains,
//!   random event streams)
//! - Tracing initialisation for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livesync_testkit::prelude::*;
//!
//! #[test]
//! fn watches_a_replica() {
//!     let store = memory_store("items");
//!     let replica = OrderedReplica::attach(store, manual_config()).unwrap();
//!     let watcher = RecordingWatcher::on_ordered(&replica);
//!     replica.flush();
//!     assert!(watcher.is_empty());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
