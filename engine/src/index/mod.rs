//! Secondary indexes over collection rows.
//!
//! Every index implements [`IndexRead`] (lookups and ordered scans) and
//! [`Index`] (incremental maintenance). [`BTreeIndex`] is the only physical
//! implementation; [`ReverseIndex`] is a borrowed view that serves
//! descending scans from an ascending index. Collections hold indexes through
//! [`IndexProxy`] handles, which also cover lazily resolved indexes.

pub mod auto;
pub mod btree;
pub mod lazy;
pub mod optimize;
pub mod reverse;

pub use btree::BTreeIndex;
pub use lazy::{IndexKind, IndexLoader, IndexProxy, IndexResolver, IndexSource};
pub use reverse::ReverseIndex;

use crate::change::{ChangeMessage, ChangeType};
use crate::compare::CompareOptions;
use crate::error::Result;
use crate::key::Key;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Identifier of an index within its collection.
pub type IndexId = u32;

/// Lookup operations an index may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexOperation {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl IndexOperation {
    pub fn from_func_name(name: &str) -> Option<Self> {
        match name {
            "eq" => Some(IndexOperation::Eq),
            "gt" => Some(IndexOperation::Gt),
            "gte" => Some(IndexOperation::Gte),
            "lt" => Some(IndexOperation::Lt),
            "lte" => Some(IndexOperation::Lte),
            "in" => Some(IndexOperation::In),
            _ => None,
        }
    }

    /// The operation with its operands swapped (`5 < x` is `x > 5`).
    pub fn flipped(self) -> Self {
        match self {
            IndexOperation::Gt => IndexOperation::Lt,
            IndexOperation::Gte => IndexOperation::Lte,
            IndexOperation::Lt => IndexOperation::Gt,
            IndexOperation::Lte => IndexOperation::Gte,
            other => other,
        }
    }
}

/// Bounds for [`IndexRead::range_query`]. Unset bounds are open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeQuery {
    pub from: Option<Value>,
    pub to: Option<Value>,
    pub from_inclusive: bool,
    pub to_inclusive: bool,
}

/// Usage statistics of an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub entry_count: usize,
    pub distinct_values: usize,
    pub lookup_count: u64,
    pub last_updated: DateTime<Utc>,
}

/// Key filter applied during bounded scans.
pub type KeyFilter<'a> = &'a dyn Fn(&Key) -> bool;

/// Read side of an index.
pub trait IndexRead {
    fn id(&self) -> IndexId;

    /// Path into the row that this index covers.
    fn field(&self) -> &[String];

    fn compare_options(&self) -> &CompareOptions;

    fn supports(&self, op: IndexOperation) -> bool;

    /// Keys whose indexed value satisfies `op value`.
    fn lookup(&self, op: IndexOperation, value: &Value) -> BTreeSet<Key>;

    /// Keys whose indexed value lies within the range, in index order.
    fn range_query(&self, query: &RangeQuery) -> Vec<Key>;

    /// Up to `n` keys in ascending order whose value is strictly after
    /// `from` (from the start when `None`) and that pass `filter`.
    ///
    /// Continuing from the last returned value only resumes exactly when
    /// indexed values are unique. Rows sharing that value are skipped; page
    /// through repeated values with an exact `(value, key)` cursor instead
    /// (`BTreeIndex::take_after`).
    fn take(&self, n: usize, from: Option<&Value>, filter: Option<KeyFilter<'_>>) -> Vec<Key>;

    /// Like [`IndexRead::take`] but walking in descending order, strictly
    /// before `from`.
    fn take_reversed(&self, n: usize, from: Option<&Value>, filter: Option<KeyFilter<'_>>)
        -> Vec<Key>;

    fn key_count(&self) -> usize;

    fn stats(&self) -> IndexStats;
}

/// Incrementally maintained index.
pub trait Index: IndexRead {
    /// Add a row. Failing to evaluate the indexed field is an error because
    /// the index would otherwise silently miss the row.
    fn add(&mut self, key: &Key, item: &Value) -> Result<()>;

    /// Remove a row. Evaluation failures are logged and skipped.
    fn remove(&mut self, key: &Key, item: &Value);

    fn update(&mut self, key: &Key, old_item: &Value, new_item: &Value) -> Result<()> {
        self.remove(key, old_item);
        self.add(key, new_item)
    }

    /// Rebuild from a full scan.
    fn build(&mut self, entries: &mut dyn Iterator<Item = (&Key, &Value)>) -> Result<()> {
        self.clear();
        for (key, item) in entries {
            self.add(key, item)?;
        }
        Ok(())
    }

    fn clear(&mut self);

    /// Apply a batch of collection changes.
    fn apply_changes(&mut self, changes: &[ChangeMessage]) -> Result<()> {
        for change in changes {
            match change.kind {
                ChangeType::Insert => self.add(&change.key, &change.value)?,
                ChangeType::Update => match &change.previous_value {
                    Some(previous) => self.update(&change.key, previous, &change.value)?,
                    None => self.add(&change.key, &change.value)?,
                },
                ChangeType::Delete => self.remove(&change.key, &change.value),
            }
        }
        Ok(())
    }
}

/// Indexes owned by one collection.
#[derive(Default)]
pub struct IndexSet {
    proxies: Vec<IndexProxy>,
    next_id: IndexId,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> IndexId {
        self.next_id += 1;
        self.next_id
    }

    pub fn insert(&mut self, proxy: IndexProxy) {
        self.proxies.push(proxy);
    }

    pub fn remove(&mut self, id: IndexId) -> bool {
        let before = self.proxies.len();
        self.proxies.retain(|p| p.id() != id);
        before != self.proxies.len()
    }

    pub fn proxies(&self) -> &[IndexProxy] {
        &self.proxies
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Ready index on `field` whose ordering can produce `options`.
    pub fn find_for_order(&self, field: &[String], options: &CompareOptions) -> Option<IndexProxy> {
        self.proxies
            .iter()
            .find(|p| p.is_ready() && p.matches_field(field) && p.matches_order(options))
            .cloned()
    }

    /// Ready index on `field` supporting `op`.
    pub fn find_for_lookup(&self, field: &[String], op: IndexOperation) -> Option<IndexProxy> {
        self.proxies
            .iter()
            .find(|p| p.is_ready() && p.matches_field(field) && p.supports(op).unwrap_or(false))
            .cloned()
    }

    /// Feed a batch of changes to every resolved index.
    pub fn update_indexes(&self, changes: &[ChangeMessage]) -> Result<()> {
        for proxy in &self.proxies {
            proxy.apply_changes(changes)?;
        }
        Ok(())
    }
}
