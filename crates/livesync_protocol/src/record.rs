//! Records tracked by a replica.

use crate::event::Snapshot;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field name under which a record's id is exposed in its view form.
pub const ID_FIELD: &str = "$id";
/// Field name under which a record's priority is exposed in its view form.
pub const PRIORITY_FIELD: &str = "$priority";
/// Reserved field that marks a record as wrapping a non-object value.
pub const VALUE_FIELD: &str = "$value";

/// Returns true for fields that live only in the local copy.
///
/// Keys starting with `$` or `_` are never written to the store and
/// survive remote updates.
pub fn is_local_key(key: &str) -> bool {
    key.starts_with('$') || key.starts_with('_')
}

/// A uniquely keyed value tracked by a replica.
///
/// The id and priority are held apart from the field set, so they never
/// take part in content comparisons. A remote value that is not an object
/// is normalized into a record with the single reserved field
/// [`VALUE_FIELD`]; a null value yields an empty record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: String,
    #[serde(default)]
    priority: Value,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl Record {
    /// Creates a record from an id, a field set and a priority.
    pub fn new(id: impl Into<String>, fields: Map<String, Value>, priority: Value) -> Self {
        Self {
            id: id.into(),
            priority,
            fields,
        }
    }

    /// Creates a record with no fields and a null priority.
    pub fn empty(id: impl Into<String>) -> Self {
        Self::new(id, Map::new(), Value::Null)
    }

    /// Builds a record from a snapshot delivered by the store.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self::new(
            snapshot.key.clone(),
            normalize(snapshot.value.clone()),
            snapshot.priority.clone(),
        )
    }

    /// Returns the record id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the record priority.
    pub fn priority(&self) -> &Value {
        &self.priority
    }

    /// Sets the record priority.
    pub fn set_priority(&mut self, priority: Value) {
        self.priority = priority;
    }

    /// Returns the field set.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Returns the field set for local modification.
    pub fn fields_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }

    /// Returns a single field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Sets a single field, returning the previous value.
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(name.into(), value)
    }

    /// Removes a single field.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Returns the wrapped value if this record wraps a non-object value.
    pub fn scalar_value(&self) -> Option<&Value> {
        self.fields.get(VALUE_FIELD)
    }

    /// Returns true if the record wraps a non-object value.
    pub fn is_scalar(&self) -> bool {
        self.fields.contains_key(VALUE_FIELD)
    }

    /// Returns true if both records hold the same fields and priority.
    ///
    /// Ids are not compared.
    pub fn content_eq(&self, other: &Record) -> bool {
        self.fields == other.fields && self.priority == other.priority
    }

    /// Replaces the field set and priority with a new remote value.
    ///
    /// Fields missing from `value` are deleted, fields present are set.
    /// Local fields (see [`is_local_key`]) other than [`VALUE_FIELD`] are
    /// kept unless `value` carries them. Returns true if any field, value
    /// or the priority changed.
    pub fn replace_content(&mut self, value: Value, priority: Value) -> bool {
        let mut fields = normalize(value);
        for (key, local) in &self.fields {
            if key != VALUE_FIELD && is_local_key(key) && !fields.contains_key(key) {
                fields.insert(key.clone(), local.clone());
            }
        }
        let changed = fields != self.fields || priority != self.priority;
        self.fields = fields;
        self.priority = priority;
        changed
    }

    /// Returns the record as a single JSON object, with the id and priority
    /// exposed under [`ID_FIELD`] and [`PRIORITY_FIELD`].
    pub fn to_view(&self) -> Value {
        let mut view = self.fields.clone();
        view.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        view.insert(PRIORITY_FIELD.to_string(), self.priority.clone());
        Value::Object(view)
    }
}

/// Turns a remote value into a field set. Null means no fields.
fn normalize(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert(VALUE_FIELD.to_string(), other);
            map
        }
    }
}
