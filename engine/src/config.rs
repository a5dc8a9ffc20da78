//! Collection and transaction configuration.
//!
//! Scalar options live in [`CollectionOptions`], which deserializes from the
//! camelCase JSON shape used by application config files. Behavioural hooks
//! (key extraction, comparators, sync backend, mutation handlers) are attached
//! with the builder methods on [`CollectionConfig`].

use crate::compare::{CompareOptions, EqualityMode};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::sync::SyncBackend;
use crate::transaction::Transaction;
use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

/// Default garbage collection delay: five minutes.
pub const DEFAULT_GC_TIME_MS: u64 = 300_000;

/// Extracts the key of a row.
pub type GetKey = Rc<dyn Fn(&Value) -> Result<Key>>;

/// Orders rows inside the synced store.
pub type RowComparator = Rc<dyn Fn(&Value, &Value) -> Ordering>;

/// Persists a transaction. Failing rolls the transaction back.
pub type MutationFn = Rc<dyn Fn(Transaction) -> LocalBoxFuture<'static, Result<()>>>;

/// When the collection loads data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// The backend pushes the full data set.
    #[default]
    Eager,
    /// Data is requested per query through `load_subset`.
    OnDemand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoIndex {
    #[default]
    Eager,
    Off,
}

/// How a synced `update` is applied to the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowUpdateMode {
    /// Shallow-merge the update's fields into the existing row.
    #[default]
    Partial,
    /// Replace the row.
    Full,
}

/// Serializable collection options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectionOptions {
    pub id: String,
    pub sync_mode: SyncMode,
    #[serde(rename = "gcTime")]
    pub gc_time_ms: u64,
    pub auto_index: AutoIndex,
    pub row_update_mode: RowUpdateMode,
    /// Equality used to detect synced echoes of completed optimistic writes.
    pub sync_equality: EqualityMode,
    /// Default options for indexes created on this collection.
    pub compare_options: CompareOptions,
    /// Start syncing as soon as the collection is created.
    pub start_sync: bool,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            id: String::new(),
            sync_mode: SyncMode::Eager,
            gc_time_ms: DEFAULT_GC_TIME_MS,
            auto_index: AutoIndex::Eager,
            row_update_mode: RowUpdateMode::Partial,
            sync_equality: EqualityMode::Deep,
            compare_options: CompareOptions::default(),
            start_sync: false,
        }
    }
}

impl CollectionOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Parse options from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidConfig("collection id must not be empty".into()));
        }
        Ok(())
    }
}

/// Full collection configuration.
#[derive(Clone)]
pub struct CollectionConfig {
    pub options: CollectionOptions,
    pub get_key: GetKey,
    pub compare: Option<RowComparator>,
    pub sync: Option<Rc<dyn SyncBackend>>,
    pub on_insert: Option<MutationFn>,
    pub on_update: Option<MutationFn>,
    pub on_delete: Option<MutationFn>,
}

impl CollectionConfig {
    /// Configuration with a custom key extractor.
    pub fn new(id: impl Into<String>, get_key: impl Fn(&Value) -> Result<Key> + 'static) -> Self {
        Self {
            options: CollectionOptions::new(id),
            get_key: Rc::new(get_key),
            compare: None,
            sync: None,
            on_insert: None,
            on_update: None,
            on_delete: None,
        }
    }

    /// Configuration keyed by a top-level field of each row.
    pub fn keyed_by(id: impl Into<String>, field: &str) -> Self {
        let field = field.to_string();
        Self::new(id, move |row| match row.get(&field) {
            Some(value) => Key::from_value(value),
            None => Err(Error::InvalidKey(format!("row has no '{field}' field"))),
        })
    }

    /// Replace the scalar options, keeping the id unless the new options set
    /// one.
    pub fn with_options(mut self, mut options: CollectionOptions) -> Self {
        if options.id.is_empty() {
            options.id = std::mem::take(&mut self.options.id);
        }
        self.options = options;
        self
    }

    pub fn with_sync(mut self, backend: impl SyncBackend + 'static) -> Self {
        self.sync = Some(Rc::new(backend));
        self
    }

    pub fn with_shared_sync(mut self, backend: Rc<dyn SyncBackend>) -> Self {
        self.sync = Some(backend);
        self
    }

    pub fn with_compare(
        mut self,
        compare: impl Fn(&Value, &Value) -> Ordering + 'static,
    ) -> Self {
        self.compare = Some(Rc::new(compare));
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.options.sync_mode = mode;
        self
    }

    pub fn gc_time_ms(mut self, ms: u64) -> Self {
        self.options.gc_time_ms = ms;
        self
    }

    pub fn auto_index(mut self, auto_index: AutoIndex) -> Self {
        self.options.auto_index = auto_index;
        self
    }

    pub fn row_update_mode(mut self, mode: RowUpdateMode) -> Self {
        self.options.row_update_mode = mode;
        self
    }

    pub fn sync_equality(mut self, mode: EqualityMode) -> Self {
        self.options.sync_equality = mode;
        self
    }

    pub fn start_sync(mut self, start: bool) -> Self {
        self.options.start_sync = start;
        self
    }

    pub fn on_insert<F>(mut self, handler: F) -> Self
    where
        F: Fn(Transaction) -> LocalBoxFuture<'static, Result<()>> + 'static,
    {
        self.on_insert = Some(Rc::new(handler));
        self
    }

    pub fn on_update<F>(mut self, handler: F) -> Self
    where
        F: Fn(Transaction) -> LocalBoxFuture<'static, Result<()>> + 'static,
    {
        self.on_update = Some(Rc::new(handler));
        self
    }

    pub fn on_delete<F>(mut self, handler: F) -> Self
    where
        F: Fn(Transaction) -> LocalBoxFuture<'static, Result<()>> + 'static,
    {
        self.on_delete = Some(Rc::new(handler));
        self
    }
}

impl fmt::Debug for CollectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionConfig")
            .field("options", &self.options)
            .field("compare", &self.compare.is_some())
            .field("sync", &self.sync.is_some())
            .field("on_insert", &self.on_insert.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .finish()
    }
}

/// Options for [`crate::Store::create_transaction`].
#[derive(Clone, Default)]
pub struct TransactionConfig {
    /// Defaults to a random UUID.
    pub id: Option<String>,
    /// Commit automatically after [`Transaction::mutate`].
    pub auto_commit: bool,
    pub mutation_fn: Option<MutationFn>,
    pub metadata: Option<Value>,
}

impl TransactionConfig {
    pub fn new<F>(mutation_fn: F) -> Self
    where
        F: Fn(Transaction) -> LocalBoxFuture<'static, Result<()>> + 'static,
    {
        Self {
            id: None,
            auto_commit: true,
            mutation_fn: Some(Rc::new(mutation_fn)),
            metadata: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn manual_commit(mut self) -> Self {
        self.auto_commit = false;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl fmt::Debug for TransactionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionConfig")
            .field("id", &self.id)
            .field("auto_commit", &self.auto_commit)
            .field("mutation_fn", &self.mutation_fn.is_some())
            .field("metadata", &self.metadata)
            .finish()
    }
}
