//! Structural conflict detection between a local and remote document
//! snapshot (§4.3). A pure function of the two [`Value`] trees — no I/O,
//! no document identity, so it's trivially testable and reusable for
//! arbitrary sub-paths.

use sync_core::model::ConflictType;
use sync_core::Value;

/// One structural divergence found between `local` and `remote` at `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedConflict {
    pub path: String,
    pub conflict_type: ConflictType,
    pub local_value: Option<Value>,
    pub remote_value: Option<Value>,
}

fn tag_of(value: &Value) -> &'static str {
    match value {
        Value::Array(_) => "array",
        Value::Map(_) => "object",
        _ => "primitive",
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Detects every structural conflict between `local` and `remote`, recursing
/// into shared object keys. Arrays and primitives are compared as leaves.
#[must_use]
pub fn detect_conflicts(local: &Value, remote: &Value) -> Vec<DetectedConflict> {
    let mut out = Vec::new();
    detect_at_path("", Some(local), Some(remote), &mut out);
    out
}

fn detect_at_path(path: &str, local: Option<&Value>, remote: Option<&Value>, out: &mut Vec<DetectedConflict>) {
    match (local, remote) {
        (None, None) => {}
        (Some(_), None) | (None, Some(_)) => {
            out.push(DetectedConflict {
                path: path.to_string(),
                conflict_type: ConflictType::Existence,
                local_value: local.cloned(),
                remote_value: remote.cloned(),
            });
        }
        (Some(l), Some(r)) => {
            let l_null = matches!(l, Value::Null);
            let r_null = matches!(r, Value::Null);
            if l_null != r_null {
                out.push(DetectedConflict {
                    path: path.to_string(),
                    conflict_type: ConflictType::Deletion,
                    local_value: Some(l.clone()),
                    remote_value: Some(r.clone()),
                });
                return;
            }
            if tag_of(l) != tag_of(r) {
                out.push(DetectedConflict {
                    path: path.to_string(),
                    conflict_type: ConflictType::Structure,
                    local_value: Some(l.clone()),
                    remote_value: Some(r.clone()),
                });
                return;
            }
            match (l, r) {
                (Value::Map(lm), Value::Map(rm)) => {
                    let mut keys: Vec<&String> = lm.keys().chain(rm.keys()).collect();
                    keys.sort();
                    keys.dedup();
                    for key in keys {
                        detect_at_path(&join_path(path, key), lm.get(key), rm.get(key), out);
                    }
                }
                _ => {
                    if !l.structurally_equal(r) {
                        out.push(DetectedConflict {
                            path: path.to_string(),
                            conflict_type: ConflictType::Value,
                            local_value: Some(l.clone()),
                            remote_value: Some(r.clone()),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn obj(pairs: &[(&str, Value)]) -> Value {
        Value::Map(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect::<BTreeMap<_, _>>())
    }

    #[test]
    fn identical_snapshots_produce_no_conflicts() {
        let v = obj(&[("owner", Value::String("A".to_string()))]);
        assert!(detect_conflicts(&v, &v).is_empty());
    }

    #[test]
    fn differing_primitive_field_yields_value_conflict() {
        let local = obj(&[("owner", Value::String("A".to_string())), ("value", Value::Int(100))]);
        let remote = obj(&[("owner", Value::String("B".to_string())), ("value", Value::Int(100))]);

        let conflicts = detect_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].path, "owner");
        assert_eq!(conflicts[0].conflict_type, ConflictType::Value);
    }

    #[test]
    fn asymmetric_key_yields_existence_conflict() {
        let local = obj(&[("owner", Value::String("A".to_string()))]);
        let remote = obj(&[("owner", Value::String("A".to_string())), ("tag", Value::String("x".to_string()))]);

        let conflicts = detect_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].path, "tag");
        assert_eq!(conflicts[0].conflict_type, ConflictType::Existence);
    }

    #[test]
    fn null_vs_present_yields_deletion_conflict() {
        let local = obj(&[("owner", Value::Null)]);
        let remote = obj(&[("owner", Value::String("A".to_string()))]);

        let conflicts = detect_conflicts(&local, &remote);
        assert_eq!(conflicts[0].conflict_type, ConflictType::Deletion);
    }

    #[test]
    fn array_vs_object_yields_structure_conflict() {
        let local = obj(&[("field", Value::Array(vec![Value::Int(1)]))]);
        let remote = obj(&[("field", obj(&[("a", Value::Int(1))]))]);

        let conflicts = detect_conflicts(&local, &remote);
        assert_eq!(conflicts[0].conflict_type, ConflictType::Structure);
    }

    #[test]
    fn array_difference_is_a_single_leaf_conflict_not_recursed() {
        let local = obj(&[("tags", Value::Array(vec![Value::String("a".to_string())]))]);
        let remote = obj(&[("tags", Value::Array(vec![Value::String("a".to_string()), Value::String("b".to_string())]))]);

        let conflicts = detect_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].path, "tags");
    }

    #[test]
    fn structural_conflict_recurses_multiple_levels() {
        let local = obj(&[("address", obj(&[("city", Value::String("Oslo".to_string()))]))]);
        let remote = obj(&[("address", obj(&[("city", Value::String("Bergen".to_string()))]))]);

        let conflicts = detect_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].path, "address.city");
    }
}
