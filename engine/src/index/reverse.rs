//! Descending view over an ascending index.

use super::{IndexId, IndexOperation, IndexRead, IndexStats, KeyFilter, RangeQuery};
use crate::compare::CompareOptions;
use crate::key::Key;
use serde_json::Value;
use std::collections::BTreeSet;

/// Borrowed adapter that answers every query as if the wrapped index were
/// sorted the other way round. Comparison operators are mirrored and the two
/// take directions are swapped; nothing is copied.
pub struct ReverseIndex<'a> {
    inner: &'a dyn IndexRead,
}

impl<'a> ReverseIndex<'a> {
    pub fn new(inner: &'a dyn IndexRead) -> Self {
        Self { inner }
    }
}

impl IndexRead for ReverseIndex<'_> {
    fn id(&self) -> IndexId {
        self.inner.id()
    }

    fn field(&self) -> &[String] {
        self.inner.field()
    }

    fn compare_options(&self) -> &CompareOptions {
        self.inner.compare_options()
    }

    fn supports(&self, op: IndexOperation) -> bool {
        self.inner.supports(op.flipped())
    }

    fn lookup(&self, op: IndexOperation, value: &Value) -> BTreeSet<Key> {
        self.inner.lookup(op.flipped(), value)
    }

    fn range_query(&self, query: &RangeQuery) -> Vec<Key> {
        let mirrored = RangeQuery {
            from: query.to.clone(),
            to: query.from.clone(),
            from_inclusive: query.to_inclusive,
            to_inclusive: query.from_inclusive,
        };
        let mut keys = self.inner.range_query(&mirrored);
        keys.reverse();
        keys
    }

    fn take(&self, n: usize, from: Option<&Value>, filter: Option<KeyFilter<'_>>) -> Vec<Key> {
        self.inner.take_reversed(n, from, filter)
    }

    fn take_reversed(
        &self,
        n: usize,
        from: Option<&Value>,
        filter: Option<KeyFilter<'_>>,
    ) -> Vec<Key> {
        self.inner.take(n, from, filter)
    }

    fn key_count(&self) -> usize {
        self.inner.key_count()
    }

    fn stats(&self) -> IndexStats {
        self.inner.stats()
    }
}
