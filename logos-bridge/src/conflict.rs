//! Field-level conflict detection and resolution for state partitions.
//!
//! Everything here is a pure function of its arguments: identical inputs
//! always produce identical output, and nothing is retained between calls.
//!
//! Strategies by conflict type:
//!
//! | conflict | result |
//! |----------|--------|
//! | `ArrayConflict` | ordered union, structural duplicates removed |
//! | `ObjectConflict` | shallow merge, incoming field wins |
//! | `TypeMismatch` / `ValueConflict` | incoming value wins |

use serde::Serialize;
use serde_json::{Map, Value};

/// Flat key → value state partition.
pub type Partition = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    TypeMismatch,
    ArrayConflict,
    ObjectConflict,
    ValueConflict,
}

/// A key present on both sides with differing values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub key: String,
    pub current_value: Value,
    pub incoming_value: Value,
    pub conflict_type: ConflictType,
}

#[derive(PartialEq, Eq)]
enum JsonKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

fn kind_of(value: &Value) -> JsonKind {
    match value {
        Value::Null => JsonKind::Null,
        Value::Bool(_) => JsonKind::Bool,
        Value::Number(_) => JsonKind::Number,
        Value::String(_) => JsonKind::String,
        Value::Array(_) => JsonKind::Array,
        Value::Object(_) => JsonKind::Object,
    }
}

/// Classify every key shared by `current` and `incoming` whose values differ.
///
/// Records come out in key order. An empty result means the incoming partial
/// can be merged without resolution.
pub fn detect(current: &Partition, incoming: &Partition) -> Vec<ConflictRecord> {
    incoming
        .iter()
        .filter_map(|(key, incoming_value)| {
            let current_value = current.get(key)?;
            if current_value == incoming_value {
                return None;
            }
            let conflict_type = match (current_value, incoming_value) {
                _ if kind_of(current_value) != kind_of(incoming_value) => ConflictType::TypeMismatch,
                (Value::Array(_), Value::Array(_)) => ConflictType::ArrayConflict,
                (Value::Object(_), Value::Object(_)) => ConflictType::ObjectConflict,
                _ => ConflictType::ValueConflict,
            };
            Some(ConflictRecord {
                key: key.clone(),
                current_value: current_value.clone(),
                incoming_value: incoming_value.clone(),
                conflict_type,
            })
        })
        .collect()
}

/// Apply each conflict's strategy on top of a copy of `current`.
///
/// Only the conflicting keys are touched.
pub fn resolve(conflicts: &[ConflictRecord], current: &Partition) -> Partition {
    let mut resolved = current.clone();
    for conflict in conflicts {
        let value = match (conflict.conflict_type, &conflict.current_value, &conflict.incoming_value) {
            (ConflictType::ArrayConflict, Value::Array(ours), Value::Array(theirs)) => {
                Value::Array(union(ours, theirs))
            }
            (ConflictType::ObjectConflict, Value::Object(ours), Value::Object(theirs)) => {
                let mut merged = ours.clone();
                for (k, v) in theirs {
                    merged.insert(k.clone(), v.clone());
                }
                Value::Object(merged)
            }
            _ => conflict.incoming_value.clone(),
        };
        resolved.insert(conflict.key.clone(), value);
    }
    resolved
}

/// Detect, resolve, then carry over incoming keys that were not in conflict.
///
/// Returns the merged partition and the conflicts that were resolved.
pub fn merge(current: &Partition, incoming: &Partition) -> (Partition, Vec<ConflictRecord>) {
    let conflicts = detect(current, incoming);
    let mut merged = resolve(&conflicts, current);
    for (key, value) in incoming {
        if !conflicts.iter().any(|c| &c.key == key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    (merged, conflicts)
}

fn union(ours: &[Value], theirs: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(ours.len() + theirs.len());
    for item in ours.iter().chain(theirs) {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn partition(value: Value) -> Partition {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_detect_identical_is_empty() {
        let a = partition(json!({"n": 1, "s": "x", "arr": [1, 2], "obj": {"k": true}, "z": null}));
        assert!(detect(&a, &a).is_empty());
    }

    #[test]
    fn test_detect_classifies() {
        let current = partition(json!({
            "t": 1, "arr": ["x"], "obj": {"a": 1}, "v": "old", "same": 5, "only_current": 0
        }));
        let incoming = partition(json!({
            "t": "1", "arr": ["y"], "obj": {"a": 2}, "v": "new", "same": 5, "only_incoming": 0
        }));

        let conflicts = detect(&current, &incoming);
        let kinds: Vec<(&str, ConflictType)> = conflicts
            .iter()
            .map(|c| (c.key.as_str(), c.conflict_type))
            .collect();

        assert_eq!(
            kinds,
            vec![
                ("arr", ConflictType::ArrayConflict),
                ("obj", ConflictType::ObjectConflict),
                ("t", ConflictType::TypeMismatch),
                ("v", ConflictType::ValueConflict),
            ]
        );
    }

    #[test]
    fn test_array_and_object_are_type_mismatch() {
        let current = partition(json!({"k": [1]}));
        let incoming = partition(json!({"k": {"0": 1}}));
        let conflicts = detect(&current, &incoming);
        assert_eq!(conflicts[0].conflict_type, ConflictType::TypeMismatch);
        assert_eq!(resolve(&conflicts, &current)["k"], json!({"0": 1}));
    }

    #[test]
    fn test_array_union_dedups_structurally() {
        let current = partition(json!({"tags": ["x", {"id": 1}]}));
        let incoming = partition(json!({"tags": [{"id": 1}, "y", "x"]}));

        let resolved = resolve(&detect(&current, &incoming), &current);
        assert_eq!(resolved["tags"], json!(["x", {"id": 1}, "y"]));
    }

    #[test]
    fn test_object_merge_incoming_wins() {
        let current = partition(json!({"style": {"color": "red", "width": 2}}));
        let incoming = partition(json!({"style": {"color": "blue", "height": 3}}));

        let resolved = resolve(&detect(&current, &incoming), &current);
        assert_eq!(resolved["style"], json!({"color": "blue", "width": 2, "height": 3}));
    }

    #[test]
    fn test_resolve_is_pure() {
        let a = partition(json!({"tags": ["x"], "n": 1, "o": {"a": 1}}));
        let b = partition(json!({"tags": ["y"], "n": "one", "o": {"b": 2}}));

        let first = resolve(&detect(&a, &b), &a);
        let second = resolve(&detect(&a, &b), &a);
        assert_eq!(first, second);
        // inputs untouched
        assert_eq!(a["tags"], json!(["x"]));
    }

    #[test]
    fn test_merge_keeps_new_keys() {
        let current = partition(json!({"a": 1, "tags": ["x"]}));
        let incoming = partition(json!({"a": 2, "tags": ["y"], "fresh": true}));

        let (merged, conflicts) = merge(&current, &incoming);
        assert_eq!(conflicts.len(), 2);
        assert_eq!(merged, partition(json!({"a": 2, "tags": ["x", "y"], "fresh": true})));
    }
}
