//! The contract between a collection and its sync backend.
//!
//! A backend receives a [`SyncContext`] when syncing starts and pushes data
//! through it in frames: `begin`, any number of `write`s, then `commit`.
//! `truncate` inside a frame discards everything synced so far. Backends that
//! support partial loading also answer [`SyncBackend::load_subset`].

use crate::change::ChangeType;
use crate::collection::{Collection, WeakCollection};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::query::ir::{Expr, OrderByClause};
use crate::task::Deferred;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A data source feeding one collection.
pub trait SyncBackend {
    /// Begin syncing. May write data synchronously through `ctx`, or keep the
    /// context and write later.
    fn start(&self, ctx: SyncContext) -> Result<()>;

    /// Whether [`SyncBackend::load_subset`] is implemented. Required for
    /// on-demand collections.
    fn supports_load_subset(&self) -> bool {
        false
    }

    /// Materialise the rows matching `options`.
    fn load_subset(&self, options: &LoadSubsetOptions) -> Result<SubsetLoad> {
        let _ = options;
        Ok(SubsetLoad::Complete)
    }

    /// The subscription that requested `options` no longer needs them.
    fn unload_subset(&self, options: &LoadSubsetOptions) {
        let _ = options;
    }

    /// Stop syncing and release resources.
    fn cleanup(&self) {}
}

/// Outcome of a subset request.
#[derive(Debug, Clone)]
pub enum SubsetLoad {
    /// The rows were written before returning.
    Complete,
    /// The rows arrive later; settles when they have been written.
    Pending(Deferred<()>),
}

impl SubsetLoad {
    pub fn is_complete(&self) -> bool {
        matches!(self, SubsetLoad::Complete)
    }
}

/// Remote cursor for paginated loads on an ordered column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadCursor {
    /// Rows strictly after the cursor.
    pub where_from: Expr,
    /// Rows equal to the cursor value.
    pub where_current: Expr,
}

/// What a subscription asks the backend to load. Expressions are relative to
/// the row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSubsetOptions {
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_: Option<Expr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderByClause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<LoadCursor>,
    #[serde(rename = "subscription", skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

/// A write pushed by the backend. `key` defaults to the collection's key of
/// `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncWrite {
    #[serde(rename = "type")]
    pub kind: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Key>,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl SyncWrite {
    pub fn insert(value: Value) -> Self {
        Self {
            kind: ChangeType::Insert,
            key: None,
            value,
            metadata: None,
        }
    }

    pub fn update(value: Value) -> Self {
        Self {
            kind: ChangeType::Update,
            key: None,
            value,
            metadata: None,
        }
    }

    pub fn delete(value: Value) -> Self {
        Self {
            kind: ChangeType::Delete,
            key: None,
            value,
            metadata: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Handle a backend uses to push data into its collection.
///
/// Cheap to clone; holds the collection weakly, so a backend outliving its
/// collection gets [`Error::CollectionCleanedUp`].
#[derive(Clone, Debug)]
pub struct SyncContext {
    collection_id: String,
    collection: WeakCollection,
}

impl SyncContext {
    pub(crate) fn new(collection: &Collection) -> Self {
        Self {
            collection_id: collection.id().to_string(),
            collection: collection.downgrade(),
        }
    }

    fn collection(&self) -> Result<Collection> {
        self.collection
            .upgrade()
            .ok_or_else(|| Error::CollectionCleanedUp(self.collection_id.clone()))
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    /// Open a new frame.
    pub fn begin(&self) -> Result<()> {
        self.collection()?.sync_begin();
        Ok(())
    }

    /// Append a write to the open frame.
    pub fn write(&self, write: SyncWrite) -> Result<()> {
        self.collection()?.sync_write(write)
    }

    /// Close the open frame and apply it.
    pub fn commit(&self) -> Result<()> {
        self.collection()?.sync_commit()
    }

    /// Mark the collection ready without committing anything.
    pub fn mark_ready(&self) -> Result<()> {
        self.collection()?.sync_mark_ready()
    }

    /// Discard all synced data; writes that follow in this frame reload it.
    pub fn truncate(&self) -> Result<()> {
        self.collection()?.sync_truncate()
    }

    /// Convenience for `begin`, `write` for each row, `commit`.
    pub fn write_batch(&self, writes: impl IntoIterator<Item = SyncWrite>) -> Result<()> {
        let collection = self.collection()?;
        collection.sync_begin();
        for write in writes {
            collection.sync_write(write)?;
        }
        collection.sync_commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn load_subset_options_serialize_camel_case() {
        let options = LoadSubsetOptions {
            where_: Some(Expr::func(
                "eq",
                vec![Expr::prop(vec!["done".into()]), Expr::value(json!(false))],
            )),
            limit: Some(10),
            subscription_id: Some("sub-1".into()),
            ..LoadSubsetOptions::default()
        };
        let json = serde_json::to_value(&options).unwrap();
        assert!(json.get("where").is_some());
        assert_eq!(json["limit"], json!(10));
        assert_eq!(json["subscription"], json!("sub-1"));
        assert!(json.get("orderBy").is_none());
        let parsed: LoadSubsetOptions = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, options);
    }

    #[test]
    fn sync_write_from_json() {
        let write: SyncWrite =
            serde_json::from_str(r#"{"type": "insert", "value": {"id": 1}}"#).unwrap();
        assert_eq!(write, SyncWrite::insert(json!({"id": 1})));
        assert_eq!(SyncWrite::delete(json!({})).with_key("a").key, Some(Key::from("a")));
    }

    #[test]
    fn context_without_collection() {
        let ctx = SyncContext {
            collection_id: "gone".into(),
            collection: WeakCollection::default(),
        };
        assert_eq!(ctx.begin(), Err(Error::CollectionCleanedUp("gone".into())));
    }
}
