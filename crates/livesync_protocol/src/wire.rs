//! Wire form of records written back to the store.
//!
//! Locally a record keeps reserved data under `$`-prefixed names and
//! scratch data under `_`-prefixed names; neither is sent. On the wire a
//! wrapped scalar travels as `.value` and the priority as `.priority`;
//! every other key must be free of the characters `. $ [ ] # /`.

use crate::error::{WireError, WireResult};
use crate::event::Snapshot;
use crate::record::{is_local_key, PRIORITY_FIELD, VALUE_FIELD};
use serde_json::{Map, Value};

/// Wire key for a wrapped scalar value.
pub const WIRE_VALUE: &str = ".value";
/// Wire key for a priority.
pub const WIRE_PRIORITY: &str = ".priority";

const RESERVED_CHARS: [char; 6] = ['.', '$', '[', ']', '#', '/'];

/// Validates a single key.
pub fn validate_key(key: &str) -> WireResult<()> {
    if key.is_empty() || key.contains(RESERVED_CHARS) {
        return Err(WireError::invalid_key(key));
    }
    Ok(())
}

/// Converts a record view (or any JSON value edited locally) to its wire form.
///
/// `$`- and `_`-prefixed keys are dropped, except that `$value` becomes
/// `.value` and `$priority` becomes `.priority` when there is content.
/// Top-level `.value` and `.priority` pass through as given. Nested keys
/// are validated as well.
pub fn to_wire(view: &Value) -> WireResult<Value> {
    let source = match view {
        Value::Object(map) => map,
        Value::Null => return Ok(Value::Object(Map::new())),
        other => {
            validate_value(WIRE_VALUE, other)?;
            let mut out = Map::new();
            out.insert(WIRE_VALUE.to_string(), other.clone());
            return Ok(Value::Object(out));
        }
    };

    let mut out = Map::new();
    if let Some(value) = source.get(VALUE_FIELD) {
        validate_value(WIRE_VALUE, value)?;
        out.insert(WIRE_VALUE.to_string(), value.clone());
    } else {
        for (key, value) in source {
            if is_local_key(key) {
                continue;
            }
            if key != WIRE_PRIORITY && key != WIRE_VALUE {
                validate_key(key)?;
            }
            validate_value(key, value)?;
            out.insert(key.clone(), value.clone());
        }
    }

    if let Some(priority) = source.get(PRIORITY_FIELD) {
        if !out.is_empty() {
            out.insert(WIRE_PRIORITY.to_string(), priority.clone());
        }
    }

    Ok(Value::Object(out))
}

fn validate_value(key: &str, value: &Value) -> WireResult<()> {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if k != WIRE_PRIORITY && k != WIRE_VALUE {
                    validate_key(k)?;
                }
                validate_value(k, v)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(|v| validate_value(key, v)),
        _ => Ok(()),
    }
}

/// A value as held by a store: content with the priority split off.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredNode {
    /// Stored content. Empty objects collapse to `Null`.
    pub value: Value,
    /// Priority of the node.
    pub priority: Value,
}

impl StoredNode {
    /// Creates a stored node.
    pub fn new(value: Value, priority: Value) -> Self {
        Self { value, priority }
    }

    /// Parses the wire form produced by [`to_wire`].
    ///
    /// Only the top level is unwrapped; children keep their own
    /// `.priority` entries for the caller to split.
    pub fn from_wire(content: Value) -> Self {
        match content {
            Value::Object(mut map) => {
                let priority = map.remove(WIRE_PRIORITY).unwrap_or(Value::Null);
                if let Some(value) = map.remove(WIRE_VALUE) {
                    return Self::new(value, priority);
                }
                if map.is_empty() {
                    Self::new(Value::Null, priority)
                } else {
                    Self::new(Value::Object(map), priority)
                }
            }
            other => Self::new(other, Value::Null),
        }
    }

    /// Returns true if nothing is stored.
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Builds the snapshot of this node under `key`.
    pub fn to_snapshot(&self, key: impl Into<String>) -> Snapshot {
        Snapshot::new(key, self.value.clone(), self.priority.clone())
    }
}
