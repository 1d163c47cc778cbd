//! JSON merge patch (RFC 7386) as a pure diff/apply pair.
//!
//! `diff(from, to)` describes the minimal set of added, changed and removed
//! object keys; `apply(target, patch)` replays that description onto a third
//! value. Neither function mutates its inputs.
//!
//! Limitations of the format: arrays are replaced wholesale, and an object
//! member whose value is `null` cannot be expressed (null means "remove").

use serde_json::{Map, Value};

/// Patch turning `from` into `to`, or `None` when they are equal.
pub fn diff(from: &Value, to: &Value) -> Option<Value> {
    if from == to {
        return None;
    }
    match (from, to) {
        (Value::Object(before), Value::Object(after)) => {
            let mut patch = Map::new();
            for key in before.keys() {
                if !after.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, value) in after {
                match before.get(key) {
                    Some(old) => {
                        if let Some(nested) = diff_member(old, value) {
                            patch.insert(key.clone(), nested);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            Some(Value::Object(patch))
        }
        _ => Some(to.clone()),
    }
}

fn diff_member(old: &Value, new: &Value) -> Option<Value> {
    match (old, new) {
        (Value::Object(_), Value::Object(_)) => diff(old, new),
        _ if old == new => None,
        _ => Some(new.clone()),
    }
}

/// Apply `patch` to a copy of `target`.
pub fn apply(target: &Value, patch: &Value) -> Value {
    let Value::Object(members) = patch else {
        return patch.clone();
    };
    let mut result = match target {
        Value::Object(existing) => existing.clone(),
        _ => Map::new(),
    };
    for (key, value) in members {
        if value.is_null() {
            result.remove(key);
            continue;
        }
        let merged = match result.get(key) {
            Some(current) => apply(current, value),
            None => apply(&Value::Null, value),
        };
        result.insert(key.clone(), merged);
    }
    Value::Object(result)
}
