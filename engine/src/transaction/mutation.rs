//! Pending mutations and how they merge inside one transaction.

use crate::change::ChangeType;
use crate::collection::WeakCollection;
use crate::key::Key;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// One optimistic write recorded by a transaction.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub mutation_id: String,
    pub kind: ChangeType,
    pub key: Key,
    /// Collection-qualified key; mutations with equal global keys merge.
    pub global_key: String,
    /// Row before the write (`None` for inserts).
    pub original: Option<Value>,
    /// Row after the write. For deletes, the row being deleted.
    pub modified: Value,
    /// Top-level fields that changed.
    pub changes: Value,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub collection_id: String,
    pub(crate) collection: WeakCollection,
}

impl PendingMutation {
    pub fn is_insert(&self) -> bool {
        self.kind == ChangeType::Insert
    }

    pub fn is_delete(&self) -> bool {
        self.kind == ChangeType::Delete
    }
}

/// Merge `incoming` into `existing` (same global key).
///
/// Returns `None` when the two cancel out (insert followed by delete).
pub fn merge_pending(existing: &PendingMutation, incoming: PendingMutation) -> Option<PendingMutation> {
    use ChangeType::*;
    match (existing.kind, incoming.kind) {
        (Insert, Update) => Some(PendingMutation {
            kind: Insert,
            original: None,
            changes: union_changes(&existing.changes, &incoming.changes),
            mutation_id: existing.mutation_id.clone(),
            created_at: existing.created_at,
            ..incoming
        }),
        (Insert, Delete) => None,
        (Update, Delete) => Some(PendingMutation {
            original: existing.original.clone(),
            ..incoming
        }),
        (Update, Update) => Some(PendingMutation {
            original: existing.original.clone(),
            changes: union_changes(&existing.changes, &incoming.changes),
            mutation_id: existing.mutation_id.clone(),
            created_at: existing.created_at,
            ..incoming
        }),
        // Same-type pairs, and a re-insert or update after a delete, take
        // the incoming mutation.
        _ => Some(incoming),
    }
}

fn union_changes(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (k, v) in b {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, b) => b.clone(),
    }
}

/// Top-level fields of `modified` that differ from `original`. Removed fields
/// are reported as `null`.
pub fn diff_changes(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(before), Value::Object(after)) => {
            let mut changes = Map::new();
            for (k, v) in after {
                if before.get(k) != Some(v) {
                    changes.insert(k.clone(), v.clone());
                }
            }
            for k in before.keys() {
                if !after.contains_key(k) {
                    changes.insert(k.clone(), Value::Null);
                }
            }
            Value::Object(changes)
        }
        _ if original == modified => Value::Object(Map::new()),
        _ => modified.clone(),
    }
}

/// Whether a diff produced by [`diff_changes`] is empty.
pub fn is_unchanged(changes: &Value) -> bool {
    matches!(changes, Value::Object(map) if map.is_empty())
}
