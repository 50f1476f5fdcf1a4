//! Ordering of children by priority and key.
//!
//! Stores that keep children sorted order them by priority first
//! (null, then numbers, then strings), then by key. Keys that parse as
//! integers sort numerically before all other keys.

use serde_json::Value;
use std::cmp::Ordering;

fn rank(priority: &Value) -> u8 {
    match priority {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) | Value::Object(_) => 4,
    }
}

/// Compares two `(priority, key)` pairs in store order.
pub fn compare_priority(a: (&Value, &str), b: (&Value, &str)) -> Ordering {
    let (pa, ka) = a;
    let (pb, kb) = b;

    let by_priority = match (pa, pb) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(pa).cmp(&rank(pb)),
    };

    by_priority.then_with(|| compare_keys(ka, kb))
}

fn compare_keys(a: &str, b: &str) -> Ordering {
    match (as_index(a), as_index(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn as_index(key: &str) -> Option<i64> {
    let n: i64 = key.parse().ok()?;
    // "007" is a string key, not an index
    (n.to_string() == key).then_some(n)
}
