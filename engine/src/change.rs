//! Change messages emitted by collections, subscriptions and live queries.

use crate::key::Key;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// A single row change.
///
/// For deletes, `value` carries the last visible value of the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMessage {
    #[serde(rename = "type")]
    pub kind: ChangeType,
    pub key: Key,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ChangeMessage {
    pub fn insert(key: Key, value: Value) -> Self {
        Self {
            kind: ChangeType::Insert,
            key,
            value,
            previous_value: None,
            metadata: None,
        }
    }

    pub fn update(key: Key, value: Value, previous_value: Value) -> Self {
        Self {
            kind: ChangeType::Update,
            key,
            value,
            previous_value: Some(previous_value),
            metadata: None,
        }
    }

    pub fn delete(key: Key, value: Value) -> Self {
        Self {
            kind: ChangeType::Delete,
            key,
            value,
            previous_value: None,
            metadata: None,
        }
    }

    pub fn is_insert(&self) -> bool {
        self.kind == ChangeType::Insert
    }

    pub fn is_delete(&self) -> bool {
        self.kind == ChangeType::Delete
    }
}

/// Events a collection publishes to its subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent {
    /// Ordinary row changes.
    Changes(Vec<ChangeMessage>),
    /// All synced data was discarded; the deletes and reloads follow as
    /// ordinary changes.
    Truncate,
}
