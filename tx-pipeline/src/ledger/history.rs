//! Per-record change log
//!
//! Each accepted update appends one entry holding the field-level diff between
//! the record before and after the mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::TransactionRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// JSON-pointer style path, e.g. `/params/nonce`
    pub path: String,
    pub before: Value,
    pub after: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub note: String,
    pub changes: Vec<FieldChange>,
}

/// Serialize a record without its history, for diffing
pub(crate) fn snapshot(record: &TransactionRecord) -> Value {
    let mut value = serde_json::to_value(record).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.remove("history");
    }
    value
}

/// Field-level differences between two snapshots
pub(crate) fn diff(before: &Value, after: &Value) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    diff_into("", before, after, &mut changes);
    changes
}

fn diff_into(path: &str, before: &Value, after: &Value, out: &mut Vec<FieldChange>) {
    match (before, after) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, old) in a {
                let child = format!("{}/{}", path, key);
                diff_into(&child, old, b.get(key).unwrap_or(&Value::Null), out);
            }
            for (key, new) in b {
                if !a.contains_key(key) {
                    out.push(FieldChange {
                        path: format!("{}/{}", path, key),
                        before: Value::Null,
                        after: new.clone(),
                    });
                }
            }
        }
        (a, b) if a != b => out.push(FieldChange {
            path: path.to_string(),
            before: a.clone(),
            after: b.clone(),
        }),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_change_reports_leaf_path() {
        let before = json!({"status": "approved", "params": {"nonce": null, "chain_id": 1}});
        let after = json!({"status": "approved", "params": {"nonce": 7, "chain_id": 1}});
        let changes = diff(&before, &after);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "/params/nonce");
        assert_eq!(changes[0].after, json!(7));
    }

    #[test]
    fn test_identical_values_produce_no_changes() {
        let value = json!({"status": "signed", "hash": null});
        assert!(diff(&value, &value).is_empty());
    }

    #[test]
    fn test_added_key_is_reported() {
        let before = json!({});
        let after = json!({"warning": {"message": "x"}});
        let changes = diff(&before, &after);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "/warning");
    }
}
