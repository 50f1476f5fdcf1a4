//! Property-based test generators using proptest.
//!
//! Provides strategies for generating remote event streams that keep the
//! ordering guarantees a real store gives.

use livesync_protocol::{Snapshot, Value};
use proptest::prelude::*;
use serde_json::json;

/// Strategy for generating valid record keys.
pub fn record_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,7}").expect("Invalid regex")
}

/// Strategy for generating priorities: null, numbers or strings.
pub fn priority_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        2 => Just(Value::Null),
        2 => (-100i64..100).prop_map(|n| json!(n)),
        1 => prop::string::string_regex("[a-z]{1,4}")
            .expect("Invalid regex")
            .prop_map(Value::String),
    ]
}

/// Strategy for generating record content: small objects or scalars.
pub fn content_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        3 => prop::collection::btree_map(
            prop::string::string_regex("[a-z]{1,6}").expect("Invalid regex"),
            prop_oneof![
                any::<i32>().prop_map(|n| json!(n)),
                any::<bool>().prop_map(Value::Bool),
                prop::string::string_regex("[a-z ]{0,8}")
                    .expect("Invalid regex")
                    .prop_map(Value::String),
            ],
            1..4,
        )
        .prop_map(|map| Value::Object(map.into_iter().collect())),
        1 => any::<i32>().prop_map(|n| json!(n)),
    ]
}

/// One added event: a snapshot and the id it is placed after.
#[derive(Debug, Clone)]
pub struct AddedEvent {
    /// Content of the new record.
    pub snapshot: Snapshot,
    /// Id of the record it follows.
    pub prev_id: Option<String>,
}

/// Added events arriving in arbitrary order whose `prev_id`s describe one
/// total order.
#[derive(Debug, Clone)]
pub struct AddedChain {
    /// The order the events describe.
    pub order: Vec<String>,
    /// Events in delivery order.
    pub events: Vec<AddedEvent>,
}

impl AddedChain {
    /// Builds the events that insert `order[i]` for each `i` in `insertion`.
    ///
    /// Each event names the closest already-inserted predecessor in `order`.
    pub fn build(order: Vec<String>, insertion: &[usize]) -> Self {
        let mut inserted = vec![false; order.len()];
        let mut events = Vec::with_capacity(insertion.len());
        for &i in insertion {
            let prev_id = (0..i).rev().find(|&j| inserted[j]).map(|j| order[j].clone());
            inserted[i] = true;
            events.push(AddedEvent {
                snapshot: Snapshot::new(order[i].clone(), json!({ "rank": i }), Value::Null),
                prev_id,
            });
        }
        Self { order, events }
    }
}

/// Strategy for generating an [`AddedChain`] of up to `max_len` records.
pub fn added_chain_strategy(max_len: usize) -> impl Strategy<Value = AddedChain> {
    prop::collection::btree_set(record_key_strategy(), 1..max_len.max(2))
        .prop_flat_map(|keys| {
            let keys: Vec<String> = keys.into_iter().collect();
            let positions: Vec<usize> = (0..keys.len()).collect();
            (Just(keys).prop_shuffle(), Just(positions).prop_shuffle())
        })
        .prop_map(|(order, insertion)| AddedChain::build(order, &insertion))
}

/// A change to an ordered collection, as a store would report it.
#[derive(Debug, Clone)]
pub enum ReplicaOp {
    /// Insert after `prev_id`.
    Add {
        /// Record content.
        snapshot: Snapshot,
        /// Id to insert after.
        prev_id: Option<String>,
    },
    /// Remove by id.
    Remove {
        /// Record id.
        id: String,
    },
    /// Move after `prev_id`.
    Move {
        /// Record id.
        id: String,
        /// Id to move after.
        prev_id: Option<String>,
    },
    /// Replace content.
    Update {
        /// New content.
        snapshot: Snapshot,
    },
}

fn small_key_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d", "e", "f"]).prop_map(str::to_string)
}

fn prev_strategy() -> impl Strategy<Value = Option<String>> {
    prop::option::of(small_key_strategy())
}

/// Strategy for generating one [`ReplicaOp`] over a small key pool, so
/// that duplicates, unknown ids and dangling `prev_id`s all occur.
pub fn replica_op_strategy() -> impl Strategy<Value = ReplicaOp> {
    prop_oneof![
        3 => (small_key_strategy(), content_strategy(), priority_strategy(), prev_strategy())
            .prop_map(|(key, value, priority, prev_id)| ReplicaOp::Add {
                snapshot: Snapshot::new(key, value, priority),
                prev_id,
            }),
        1 => small_key_strategy().prop_map(|id| ReplicaOp::Remove { id }),
        1 => (small_key_strategy(), prev_strategy())
            .prop_map(|(id, prev_id)| ReplicaOp::Move { id, prev_id }),
        2 => (small_key_strategy(), content_strategy(), priority_strategy())
            .prop_map(|(key, value, priority)| ReplicaOp::Update {
                snapshot: Snapshot::new(key, value, priority),
            }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn replica_op_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<ReplicaOp>> {
    prop::collection::vec(replica_op_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
