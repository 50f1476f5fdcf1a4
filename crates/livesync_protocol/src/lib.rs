//! # livesync Protocol
//!
//! Data types shared between a replica and its remote store.
//!
//! This crate provides:
//! - `Record` for a keyed value tracked by a replica
//! - `Snapshot` and `RemoteEvent` for change notifications from the store
//! - `RemoteError` for store-reported failures
//! - The wire codec used when writing records back (`to_wire`, `StoredNode`)
//! - Priority ordering used by stores that sort children
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event;
mod priority;
mod record;
mod wire;

pub use error::{WireError, WireResult};
pub use event::{EventKind, RemoteError, RemoteEvent, Snapshot};
pub use priority::compare_priority;
pub use record::{is_local_key, Record, ID_FIELD, PRIORITY_FIELD, VALUE_FIELD};
pub use wire::{to_wire, validate_key, StoredNode, WIRE_PRIORITY, WIRE_VALUE};

/// Re-export of the JSON value type used for record content.
pub use serde_json::{Map, Value};
