//! A map that iterates in a maintained sort order.
//!
//! Entries are ordered by an optional value comparator with the key as a
//! tie-break, or by key alone. Lookups go through a hash map; the order is
//! kept in a separate key vector maintained with binary search.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

/// Comparator over values.
pub type ValueComparator<V> = Rc<dyn Fn(&V, &V) -> Ordering>;

pub struct SortedMap<K, V> {
    map: HashMap<K, V>,
    sorted_keys: Vec<K>,
    comparator: Option<ValueComparator<V>>,
}

impl<K, V> SortedMap<K, V>
where
    K: Eq + Hash + Ord + Clone,
{
    /// Create a map ordered by key.
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            sorted_keys: Vec::new(),
            comparator: None,
        }
    }

    /// Create a map ordered by `comparator`, ties broken by key.
    pub fn with_comparator(comparator: ValueComparator<V>) -> Self {
        Self {
            map: HashMap::new(),
            sorted_keys: Vec::new(),
            comparator: Some(comparator),
        }
    }

    fn compare(&self, a_key: &K, a_value: &V, b_key: &K) -> Ordering {
        if let Some(cmp) = &self.comparator {
            if let Some(b_value) = self.map.get(b_key) {
                match cmp(a_value, b_value) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
        }
        a_key.cmp(b_key)
    }

    /// Insert or replace the value for `key`, keeping the sort order.
    pub fn set(&mut self, key: K, value: V) {
        if self.map.contains_key(&key) {
            self.remove_position(&key);
        }
        let position = self.insertion_point(&key, &value);
        self.sorted_keys.insert(position, key.clone());
        self.map.insert(key, value);
    }

    /// Binary search for the first position whose entry does not sort
    /// before `(value, key)`.
    fn insertion_point(&self, key: &K, value: &V) -> usize {
        let mut lo = 0;
        let mut hi = self.sorted_keys.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let candidate = &self.sorted_keys[mid];
            if self.compare(key, value, candidate) == Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn remove_position(&mut self, key: &K) {
        if let Some(value) = self.map.get(key) {
            let position = self.insertion_point(key, value);
            if self.sorted_keys.get(position) == Some(key) {
                self.sorted_keys.remove(position);
                return;
            }
            // Comparator was not consistent with the stored order; fall back
            // to a linear scan so the key vector never holds stale entries.
            if let Some(i) = self.sorted_keys.iter().position(|k| k == key) {
                self.sorted_keys.remove(i);
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.remove_position(key);
        self.map.remove(key)
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.sorted_keys.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Position of a present key in iteration order.
    pub fn position(&self, key: &K) -> Option<usize> {
        let value = self.map.get(key)?;
        let position = self.insertion_point(key, value);
        if self.sorted_keys.get(position) == Some(key) {
            Some(position)
        } else {
            self.sorted_keys.iter().position(|k| k == key)
        }
    }

    /// Key at `index` in iteration order.
    pub fn key_at(&self, index: usize) -> Option<&K> {
        self.sorted_keys.get(index)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.sorted_keys.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.sorted_keys.iter().filter_map(|k| self.map.get(k))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.sorted_keys
            .iter()
            .filter_map(|k| self.map.get(k).map(|v| (k, v)))
    }
}

impl<K, V> Default for SortedMap<K, V>
where
    K: Eq + Hash + Ord + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone, V: Clone> Clone for SortedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
            sorted_keys: self.sorted_keys.clone(),
            comparator: self.comparator.clone(),
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for SortedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedMap")
            .field("keys", &self.sorted_keys)
            .field("len", &self.map.len())
            .field("has_comparator", &self.comparator.is_some())
            .finish()
    }
}
