//! Ordered value index.
//!
//! Maps normalised field values to the set of row keys holding that value.
//! The ordered map doubles as the value→keyset map and as the sorted
//! structure range scans walk. Keys sharing a value are kept sorted so that
//! scans are deterministic.

use super::{Index, IndexId, IndexOperation, IndexRead, IndexStats, KeyFilter, RangeQuery};
use crate::compare::{normalize_value, CompareOptions, IndexKey};
use crate::error::{Error, Result};
use crate::key::{try_get_path, Key};
use chrono::Utc;
use serde_json::Value;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

pub struct BTreeIndex {
    id: IndexId,
    field: Vec<String>,
    compare_options: CompareOptions,
    entries: BTreeMap<IndexKey, BTreeSet<Key>>,
    key_count: usize,
    lookup_count: Cell<u64>,
    last_updated: chrono::DateTime<Utc>,
}

impl BTreeIndex {
    pub fn new(id: IndexId, field: Vec<String>, compare_options: CompareOptions) -> Self {
        Self {
            id,
            field,
            compare_options: compare_options.physical(),
            entries: BTreeMap::new(),
            key_count: 0,
            lookup_count: Cell::new(0),
            last_updated: Utc::now(),
        }
    }

    fn evaluate(&self, key: &Key, item: &Value) -> Result<IndexKey> {
        let value = try_get_path(item, &self.field).map_err(|e| Error::IndexEvaluation {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        Ok(normalize_value(
            value.unwrap_or(&Value::Null),
            &self.compare_options,
        ))
    }

    fn normalize(&self, value: &Value) -> IndexKey {
        normalize_value(value, &self.compare_options)
    }

    fn track_lookup(&self) {
        self.lookup_count.set(self.lookup_count.get() + 1);
    }

    fn collect_range(&self, lower: Bound<IndexKey>, upper: Bound<IndexKey>) -> Vec<Key> {
        self.entries
            .range((lower, upper))
            .filter(|(value, _)| !value.is_null())
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect()
    }

    /// Continue an ascending scan after an exact `(value, key)` cursor.
    ///
    /// Unlike [`IndexRead::take`], rows sharing the cursor's value but sorting
    /// after its key are included, so a page boundary inside a run of equal
    /// values loses nothing.
    pub fn take_after(
        &self,
        n: usize,
        cursor: Option<(&Value, &Key)>,
        filter: Option<KeyFilter<'_>>,
    ) -> Vec<Key> {
        self.track_lookup();
        let mut result = Vec::new();
        let lower = match cursor {
            Some((value, _)) => Bound::Included(self.normalize(value)),
            None => Bound::Unbounded,
        };
        let cursor_value = cursor.map(|(v, _)| self.normalize(v));
        'outer: for (value, keys) in self.entries.range((lower, Bound::Unbounded)) {
            for key in keys {
                if result.len() >= n {
                    break 'outer;
                }
                if let (Some(cv), Some((_, ck))) = (&cursor_value, cursor) {
                    if value == cv && key <= ck {
                        continue;
                    }
                }
                if filter.map_or(true, |f| f(key)) {
                    result.push(key.clone());
                }
            }
        }
        result
    }

    /// Distinct indexed values in ascending order.
    pub fn ordered_values(&self) -> Vec<Value> {
        self.entries.keys().map(|k| k.to_value()).collect()
    }
}

impl IndexRead for BTreeIndex {
    fn id(&self) -> IndexId {
        self.id
    }

    fn field(&self) -> &[String] {
        &self.field
    }

    fn compare_options(&self) -> &CompareOptions {
        &self.compare_options
    }

    fn supports(&self, _op: IndexOperation) -> bool {
        true
    }

    fn lookup(&self, op: IndexOperation, value: &Value) -> BTreeSet<Key> {
        self.track_lookup();
        match op {
            IndexOperation::Eq => self
                .entries
                .get(&self.normalize(value))
                .cloned()
                .unwrap_or_default(),
            IndexOperation::In => match value {
                Value::Array(items) => items
                    .iter()
                    .filter_map(|v| self.entries.get(&self.normalize(v)))
                    .flat_map(|keys| keys.iter().cloned())
                    .collect(),
                single => self
                    .entries
                    .get(&self.normalize(single))
                    .cloned()
                    .unwrap_or_default(),
            },
            IndexOperation::Gt => self
                .collect_range(Bound::Excluded(self.normalize(value)), Bound::Unbounded)
                .into_iter()
                .collect(),
            IndexOperation::Gte => self
                .collect_range(Bound::Included(self.normalize(value)), Bound::Unbounded)
                .into_iter()
                .collect(),
            IndexOperation::Lt => self
                .collect_range(Bound::Unbounded, Bound::Excluded(self.normalize(value)))
                .into_iter()
                .collect(),
            IndexOperation::Lte => self
                .collect_range(Bound::Unbounded, Bound::Included(self.normalize(value)))
                .into_iter()
                .collect(),
        }
    }

    fn range_query(&self, query: &RangeQuery) -> Vec<Key> {
        self.track_lookup();
        let lower = match &query.from {
            Some(v) if query.from_inclusive => Bound::Included(self.normalize(v)),
            Some(v) => Bound::Excluded(self.normalize(v)),
            None => Bound::Unbounded,
        };
        let upper = match &query.to {
            Some(v) if query.to_inclusive => Bound::Included(self.normalize(v)),
            Some(v) => Bound::Excluded(self.normalize(v)),
            None => Bound::Unbounded,
        };
        if let (Bound::Included(l) | Bound::Excluded(l), Bound::Included(u) | Bound::Excluded(u)) =
            (&lower, &upper)
        {
            if l > u {
                return Vec::new();
            }
        }
        self.collect_range(lower, upper)
    }

    fn take(&self, n: usize, from: Option<&Value>, filter: Option<KeyFilter<'_>>) -> Vec<Key> {
        self.track_lookup();
        let lower = match from {
            Some(v) => Bound::Excluded(self.normalize(v)),
            None => Bound::Unbounded,
        };
        let mut result = Vec::new();
        // Walk successive values, flattening each keyset, until the window
        // is full.
        'outer: for (_, keys) in self.entries.range((lower, Bound::Unbounded)) {
            for key in keys {
                if result.len() >= n {
                    break 'outer;
                }
                if filter.map_or(true, |f| f(key)) {
                    result.push(key.clone());
                }
            }
        }
        result
    }

    fn take_reversed(
        &self,
        n: usize,
        from: Option<&Value>,
        filter: Option<KeyFilter<'_>>,
    ) -> Vec<Key> {
        self.track_lookup();
        let upper = match from {
            Some(v) => Bound::Excluded(self.normalize(v)),
            None => Bound::Unbounded,
        };
        let mut result = Vec::new();
        'outer: for (_, keys) in self.entries.range((Bound::Unbounded, upper)).rev() {
            for key in keys.iter().rev() {
                if result.len() >= n {
                    break 'outer;
                }
                if filter.map_or(true, |f| f(key)) {
                    result.push(key.clone());
                }
            }
        }
        result
    }

    fn key_count(&self) -> usize {
        self.key_count
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            entry_count: self.key_count,
            distinct_values: self.entries.len(),
            lookup_count: self.lookup_count.get(),
            last_updated: self.last_updated,
        }
    }
}

impl Index for BTreeIndex {
    fn add(&mut self, key: &Key, item: &Value) -> Result<()> {
        let value = self.evaluate(key, item)?;
        if self.entries.entry(value).or_default().insert(key.clone()) {
            self.key_count += 1;
        }
        self.last_updated = Utc::now();
        Ok(())
    }

    fn remove(&mut self, key: &Key, item: &Value) {
        let value = match self.evaluate(key, item) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(index = self.id, key = %key, error = %e, "skipping index removal");
                return;
            }
        };
        if let Some(keys) = self.entries.get_mut(&value) {
            if keys.remove(key) {
                self.key_count -= 1;
            }
            if keys.is_empty() {
                self.entries.remove(&value);
            }
        }
        self.last_updated = Utc::now();
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.key_count = 0;
        self.last_updated = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index_with(rows: &[(&str, Value)]) -> BTreeIndex {
        let mut index = BTreeIndex::new(1, vec!["age".into()], CompareOptions::default());
        for (k, v) in rows {
            index.add(&Key::from(*k), v).unwrap();
        }
        index
    }

    fn keys(ks: &[&str]) -> Vec<Key> {
        ks.iter().map(|k| Key::from(*k)).collect()
    }

    #[test]
    fn lookups() {
        let index = index_with(&[
            ("a", json!({"age": 30})),
            ("b", json!({"age": 20})),
            ("c", json!({"age": 30})),
            ("d", json!({"age": null})),
            ("e", json!({})),
        ]);
        assert_eq!(index.key_count(), 5);
        assert_eq!(
            index.lookup(IndexOperation::Eq, &json!(30)),
            keys(&["a", "c"]).into_iter().collect()
        );
        assert_eq!(
            index.lookup(IndexOperation::Gt, &json!(20)),
            keys(&["a", "c"]).into_iter().collect()
        );
        assert_eq!(
            index.lookup(IndexOperation::Lte, &json!(30)).len(),
            3,
            "nulls never satisfy range comparisons"
        );
        assert_eq!(
            index.lookup(IndexOperation::In, &json!([20, 99])),
            keys(&["b"]).into_iter().collect()
        );
        assert_eq!(index.lookup(IndexOperation::Eq, &json!(null)).len(), 2);
    }

    #[test]
    fn take_walks_in_order_with_key_tiebreak() {
        let index = index_with(&[
            ("z", json!({"age": 1})),
            ("a", json!({"age": 1})),
            ("m", json!({"age": 2})),
            ("b", json!({"age": 3})),
        ]);
        assert_eq!(index.take(3, None, None), keys(&["a", "z", "m"]));
        assert_eq!(index.take(10, Some(&json!(1)), None), keys(&["m", "b"]));
        assert_eq!(index.take_reversed(2, None, None), keys(&["b", "m"]));
        assert_eq!(index.take_reversed(5, Some(&json!(2)), None), keys(&["z", "a"]));
        let skip_a = |k: &Key| k != &Key::from("a");
        assert_eq!(index.take(2, None, Some(&skip_a)), keys(&["z", "m"]));
    }

    #[test]
    fn take_after_cursor_includes_equal_siblings() {
        let index = index_with(&[
            ("a", json!({"age": 1})),
            ("b", json!({"age": 1})),
            ("c", json!({"age": 1})),
            ("d", json!({"age": 2})),
        ]);
        let first = index.take_after(2, None, None);
        assert_eq!(first, keys(&["a", "b"]));
        let rest = index.take_after(5, Some((&json!(1), &Key::from("b"))), None);
        assert_eq!(rest, keys(&["c", "d"]));
    }

    #[test]
    fn update_and_remove() {
        let mut index = index_with(&[("a", json!({"age": 1}))]);
        index
            .update(&Key::from("a"), &json!({"age": 1}), &json!({"age": 5}))
            .unwrap();
        assert!(index.lookup(IndexOperation::Eq, &json!(1)).is_empty());
        assert_eq!(index.lookup(IndexOperation::Eq, &json!(5)).len(), 1);
        index.remove(&Key::from("a"), &json!({"age": 5}));
        assert_eq!(index.key_count(), 0);
        assert_eq!(index.stats().distinct_values, 0);
    }

    #[test]
    fn add_fails_on_unreadable_field() {
        let mut index = BTreeIndex::new(1, vec!["age".into(), "years".into()], CompareOptions::default());
        let err = index.add(&Key::from("a"), &json!({"age": 5})).unwrap_err();
        assert!(matches!(err, Error::IndexEvaluation { .. }));
        // Removal with the same failure is skipped rather than raised.
        index.remove(&Key::from("a"), &json!({"age": 5}));
        assert_eq!(index.key_count(), 0);
    }

    #[test]
    fn range_query_bounds() {
        let index = index_with(&[
            ("a", json!({"age": 1})),
            ("b", json!({"age": 2})),
            ("c", json!({"age": 3})),
        ]);
        let q = RangeQuery {
            from: Some(json!(1)),
            to: Some(json!(3)),
            from_inclusive: false,
            to_inclusive: true,
        };
        assert_eq!(index.range_query(&q), keys(&["b", "c"]));
        let empty = RangeQuery {
            from: Some(json!(3)),
            to: Some(json!(1)),
            ..RangeQuery::default()
        };
        assert!(index.range_query(&empty).is_empty());
    }

    #[test]
    fn stats_count_lookups() {
        let index = index_with(&[("a", json!({"age": 1}))]);
        index.lookup(IndexOperation::Eq, &json!(1));
        index.take(1, None, None);
        assert_eq!(index.stats().lookup_count, 2);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashMap;

        proptest! {
            #[test]
            fn take_continues_from_last_value_when_values_are_unique(
                ages in prop::collection::hash_set(-50i64..50, 0..30),
                first in 0usize..10,
                rest in 0usize..30,
            ) {
                let mut index = BTreeIndex::new(1, vec!["age".into()], CompareOptions::default());
                let mut by_key: HashMap<Key, Value> = HashMap::new();
                // Keys run opposite to values so key order never helps.
                for (i, age) in ages.iter().enumerate() {
                    let key = Key::Int(-(i as i64));
                    index.add(&key, &json!({"age": age})).unwrap();
                    by_key.insert(key, json!(age));
                }

                let mut paged = index.take(first, None, None);
                let last = paged.last().and_then(|key| by_key.get(key)).cloned();
                let next = index.take(rest, last.as_ref(), None);
                if paged.len() == first {
                    paged.extend(next);
                    prop_assert_eq!(paged, index.take(first + rest, None, None));
                } else {
                    prop_assert_eq!(paged.len(), ages.len());
                }
            }

            #[test]
            fn paging_with_exact_cursor_matches_one_scan(
                ages in prop::collection::vec(prop::option::of(0i64..5), 0..30),
                first in 0usize..10,
                rest in 0usize..30,
            ) {
                let mut index = BTreeIndex::new(1, vec!["age".into()], CompareOptions::default());
                let rows: Vec<(Key, Value)> = ages
                    .iter()
                    .enumerate()
                    .map(|(i, age)| (Key::Int(i as i64), json!({"age": age})))
                    .collect();
                for (key, row) in &rows {
                    index.add(key, row).unwrap();
                }

                let mut paged = index.take_after(first, None, None);
                let cursor = paged.last().and_then(|key| {
                    rows.iter()
                        .find(|(k, _)| k == key)
                        .map(|(k, row)| (row["age"].clone(), k.clone()))
                });
                let next = match &cursor {
                    Some((value, key)) => index.take_after(rest, Some((value, key)), None),
                    None => index.take_after(rest, None, None),
                };
                if paged.len() == first {
                    paged.extend(next);
                    prop_assert_eq!(paged, index.take_after(first + rest, None, None));
                } else {
                    prop_assert_eq!(paged.len(), rows.len());
                }
            }
        }
    }
}
