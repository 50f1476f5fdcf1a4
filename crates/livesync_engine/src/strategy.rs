//! Pluggable record construction and update merging.
//!
//! Replicas never build or merge records themselves; they go through these
//! two traits so applications can attach derived fields, defaults or
//! custom change detection.

use livesync_protocol::{Record, Snapshot};

/// Builds a new record from a snapshot delivered by the store.
pub trait RecordFactory: Send + Sync {
    /// Creates the local record for `snapshot`.
    fn create_record(&self, snapshot: &Snapshot) -> Record;
}

/// Merges an updated snapshot into an existing record.
pub trait ContentMerger: Send + Sync {
    /// Applies `snapshot` to `record`.
    ///
    /// Returns true if any observable field, value or priority changed.
    fn merge(&self, record: &mut Record, snapshot: &Snapshot) -> bool;
}

/// The stock strategy: records mirror the snapshot exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStrategy;

impl RecordFactory for DefaultStrategy {
    fn create_record(&self, snapshot: &Snapshot) -> Record {
        Record::from_snapshot(snapshot)
    }
}

impl ContentMerger for DefaultStrategy {
    fn merge(&self, record: &mut Record, snapshot: &Snapshot) -> bool {
        record.replace_content(snapshot.value.clone(), snapshot.priority.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn default_factory_mirrors_snapshot() {
        let snap = Snapshot::new("a", json!({"x": 1}), json!(1));
        let rec = DefaultStrategy.create_record(&snap);
        assert_eq!(rec.id(), "a");
        assert_eq!(rec.get("x"), Some(&json!(1)));
    }

    #[test]
    fn default_merger_reports_changes() {
        let snap = Snapshot::new("a", json!({"x": 1}), Value::Null);
        let mut rec = DefaultStrategy.create_record(&snap);

        let same = Snapshot::new("a", json!({"x": 1}), Value::Null);
        assert!(!DefaultStrategy.merge(&mut rec, &same));

        let different = Snapshot::new("a", json!({"x": 2}), Value::Null);
        assert!(DefaultStrategy.merge(&mut rec, &different));
        assert_eq!(rec.get("x"), Some(&json!(2)));
    }
}
