//! Synced data, the optimistic overlay, and the diffing between them.
//!
//! [`CollectionState`] is owned by one collection. It never publishes events
//! itself; every reconciliation step returns a [`Reconciled`] batch that the
//! collection feeds to its indexes and subscriptions once its own borrows are
//! released.

use crate::change::{ChangeMessage, ChangeType};
use crate::compare::{values_equal, EqualityMode};
use crate::config::{RowComparator, RowUpdateMode};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::sorted_map::SortedMap;
use crate::transaction::{Transaction, TransactionOrder, TransactionState};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// One operation written by the sync backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOperation {
    pub kind: ChangeType,
    pub key: Key,
    pub value: Value,
    pub metadata: Option<Value>,
}

/// Optimistic overlay captured when a sync frame truncates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimisticSnapshot {
    pub upserts: HashMap<Key, Value>,
    pub deletes: HashSet<Key>,
}

/// Writes buffered between a sync `begin` and `commit`.
#[derive(Debug, Clone, Default)]
pub struct PendingSyncTransaction {
    pub committed: bool,
    pub operations: Vec<SyncOperation>,
    pub deleted_keys: HashSet<Key>,
    pub truncate: bool,
    /// Written by the collection itself for a completed local transaction.
    pub local: bool,
    pub optimistic_snapshot: Option<OptimisticSnapshot>,
}

/// Final value of an optimistic mutation whose transaction completed.
#[derive(Debug, Clone, PartialEq)]
struct CompletedOp {
    kind: ChangeType,
    value: Value,
}

/// Output of one reconciliation step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciled {
    /// All synced data was dropped in this step.
    pub truncated: bool,
    /// Every change to the virtual view, for index maintenance.
    pub index_changes: Vec<ChangeMessage>,
    /// The changes subscribers should see.
    pub events: Vec<ChangeMessage>,
}

impl Reconciled {
    pub fn is_empty(&self) -> bool {
        !self.truncated && self.index_changes.is_empty() && self.events.is_empty()
    }
}

pub struct CollectionState {
    collection_id: String,
    synced: SortedMap<Key, Value>,
    synced_metadata: HashMap<Key, Value>,
    upserts: SortedMap<Key, Value>,
    deletes: HashSet<Key>,
    comparator: Option<RowComparator>,
    pending_sync: Vec<PendingSyncTransaction>,
    transactions: BTreeMap<TransactionOrder, Transaction>,
    recently_synced: HashSet<Key>,
    completed: HashMap<Key, CompletedOp>,
    /// Order in which visible keys first appeared.
    arrivals: HashMap<Key, u64>,
    next_arrival: u64,
    size: usize,
    row_update_mode: RowUpdateMode,
    equality: EqualityMode,
}

impl CollectionState {
    pub fn new(
        collection_id: impl Into<String>,
        comparator: Option<RowComparator>,
        row_update_mode: RowUpdateMode,
        equality: EqualityMode,
    ) -> Self {
        Self {
            collection_id: collection_id.into(),
            synced: Self::new_map(&comparator),
            synced_metadata: HashMap::new(),
            upserts: Self::new_map(&comparator),
            deletes: HashSet::new(),
            comparator,
            pending_sync: Vec::new(),
            transactions: BTreeMap::new(),
            recently_synced: HashSet::new(),
            completed: HashMap::new(),
            arrivals: HashMap::new(),
            next_arrival: 0,
            size: 0,
            row_update_mode,
            equality,
        }
    }

    fn new_map(comparator: &Option<RowComparator>) -> SortedMap<Key, Value> {
        match comparator {
            Some(cmp) => SortedMap::with_comparator(cmp.clone()),
            None => SortedMap::new(),
        }
    }

    // Virtual view

    /// Visible value: deletes shadow upserts, which shadow synced data.
    pub fn get(&self, key: &Key) -> Option<&Value> {
        if self.deletes.contains(key) {
            return None;
        }
        self.upserts.get(key).or_else(|| self.synced.get(key))
    }

    pub fn has(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Visible entries: synced order first, then optimistic inserts.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> + '_ {
        let synced = self
            .synced
            .iter()
            .filter(|(k, _)| !self.deletes.contains(*k))
            .map(|(k, v)| (k, self.upserts.get(k).unwrap_or(v)));
        let inserted = self
            .upserts
            .iter()
            .filter(|(k, _)| !self.synced.contains_key(*k) && !self.deletes.contains(*k));
        synced.chain(inserted)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> + '_ {
        self.iter().map(|(k, _)| k)
    }

    pub fn synced_value(&self, key: &Key) -> Option<&Value> {
        self.synced.get(key)
    }

    pub fn synced_metadata(&self, key: &Key) -> Option<&Value> {
        self.synced_metadata.get(key)
    }

    pub fn synced_len(&self) -> usize {
        self.synced.len()
    }

    pub fn optimistic_upserts(&self) -> impl Iterator<Item = (&Key, &Value)> + '_ {
        self.upserts.iter()
    }

    pub fn optimistic_deletes(&self) -> &HashSet<Key> {
        &self.deletes
    }

    /// Sequence number of the moment `key` last became visible.
    pub fn arrival(&self, key: &Key) -> Option<u64> {
        self.arrivals.get(key).copied()
    }

    /// Order `changes` by arrival when the collection has no comparator of
    /// its own. The sort is stable; keys without an arrival go last.
    pub fn sort_by_arrival(&self, changes: &mut [ChangeMessage]) {
        if self.comparator.is_none() {
            changes.sort_by_key(|c| self.arrival(&c.key).unwrap_or(u64::MAX));
        }
    }

    fn track_arrivals(&mut self, changes: &[ChangeMessage]) {
        for change in changes {
            match change.kind {
                ChangeType::Delete => {
                    self.arrivals.remove(&change.key);
                }
                ChangeType::Insert | ChangeType::Update => {
                    if !self.arrivals.contains_key(&change.key) {
                        self.arrivals.insert(change.key.clone(), self.next_arrival);
                        self.next_arrival += 1;
                    }
                }
            }
        }
    }

    fn recompute_size(&mut self) {
        let inserted = self
            .upserts
            .keys()
            .filter(|k| !self.synced.contains_key(*k))
            .count();
        let shadowed = self
            .deletes
            .iter()
            .filter(|k| self.synced.contains_key(*k))
            .count();
        self.size = self.synced.len() + inserted - shadowed;
    }

    // Transactions

    /// Start tracking a transaction that wrote to this collection.
    pub fn track(&mut self, transaction: &Transaction) {
        self.transactions
            .insert(transaction.order(), transaction.clone());
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> + '_ {
        self.transactions.values()
    }

    fn any_persisting(&self) -> bool {
        self.transactions
            .values()
            .any(|tx| tx.state() == TransactionState::Persisting)
    }

    /// Forget transactions that reached a terminal state.
    pub fn prune_terminal(&mut self) {
        self.transactions.retain(|_, tx| !tx.state().is_terminal());
    }

    /// Remember the final values written by a completed transaction so that
    /// the synced echo of those writes stays silent.
    pub fn record_completed(&mut self, transaction: &Transaction) {
        let collection_id = self.collection_id.clone();
        transaction.with_mutations(|mutations| {
            for m in mutations.iter().filter(|m| m.collection_id == collection_id) {
                self.completed.insert(
                    m.key.clone(),
                    CompletedOp {
                        kind: m.kind,
                        value: m.modified.clone(),
                    },
                );
            }
        });
    }

    /// Keep a completed transaction's writes as synced data. Collections
    /// without a sync backend have nothing that would echo them back.
    pub fn persist_local(&mut self, transaction: &Transaction) {
        let collection_id = self.collection_id.clone();
        let operations: Vec<SyncOperation> = transaction.with_mutations(|mutations| {
            mutations
                .iter()
                .filter(|m| m.collection_id == collection_id)
                .map(|m| SyncOperation {
                    kind: match m.kind {
                        ChangeType::Delete => ChangeType::Delete,
                        _ => ChangeType::Insert,
                    },
                    key: m.key.clone(),
                    value: m.modified.clone(),
                    metadata: None,
                })
                .collect()
        });
        if operations.is_empty() {
            return;
        }
        self.pending_sync.push(PendingSyncTransaction {
            committed: true,
            operations,
            local: true,
            ..PendingSyncTransaction::default()
        });
    }

    pub fn clear_completed(&mut self) {
        self.completed.clear();
    }

    pub fn clear_recently_synced(&mut self) {
        self.recently_synced.clear();
    }

    /// Rebuild the overlay and return the keys it holds in mutation order.
    fn rebuild_overlay(&mut self) -> Vec<Key> {
        self.upserts.clear();
        self.deletes.clear();
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        for tx in self.transactions.values() {
            if tx.state().is_terminal() {
                continue;
            }
            tx.with_mutations(|mutations| {
                for m in mutations
                    .iter()
                    .filter(|m| m.collection_id == self.collection_id)
                {
                    if seen.insert(m.key.clone()) {
                        order.push(m.key.clone());
                    }
                    match m.kind {
                        ChangeType::Insert | ChangeType::Update => {
                            self.upserts.set(m.key.clone(), m.modified.clone());
                            self.deletes.remove(&m.key);
                        }
                        ChangeType::Delete => {
                            self.upserts.remove(&m.key);
                            self.deletes.insert(m.key.clone());
                        }
                    }
                }
            });
        }
        self.recompute_size();
        order
    }

    /// Rebuild the optimistic overlay from the active transactions and diff
    /// the keys it touched.
    ///
    /// Keys that just arrived from sync are left out of the subscriber events
    /// unless the recompute comes straight from a user write.
    pub fn recompute(&mut self, triggered_by_user: bool) -> Reconciled {
        let previous_upserts: HashMap<Key, Value> = self
            .upserts
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let previous_deletes = std::mem::take(&mut self.deletes);
        let mut touched = self.rebuild_overlay();

        let current: HashSet<Key> = touched.iter().cloned().collect();
        let dropped: BTreeSet<Key> = previous_upserts
            .keys()
            .chain(previous_deletes.iter())
            .filter(|k| !current.contains(*k))
            .cloned()
            .collect();
        touched.extend(dropped);

        let mut index_changes = Vec::new();
        for key in touched {
            let before = if previous_deletes.contains(&key) {
                None
            } else {
                previous_upserts
                    .get(&key)
                    .or_else(|| self.synced.get(&key))
                    .cloned()
            };
            if let Some(change) = diff_entry(&key, before, self.get(&key).cloned()) {
                index_changes.push(change);
            }
        }
        let events = index_changes
            .iter()
            .filter(|c| triggered_by_user || !self.recently_synced.contains(&c.key))
            .cloned()
            .collect();
        self.track_arrivals(&index_changes);
        Reconciled {
            truncated: false,
            index_changes,
            events,
        }
    }

    // Sync frames

    pub fn begin_sync(&mut self) {
        self.pending_sync.push(PendingSyncTransaction::default());
    }

    fn open_frame(&mut self) -> Result<&mut PendingSyncTransaction> {
        let id = self.collection_id.clone();
        let frame = self
            .pending_sync
            .last_mut()
            .ok_or_else(|| Error::NoPendingSyncTransaction(id.clone()))?;
        if frame.committed {
            return Err(Error::SyncTransactionAlreadyCommitted(id));
        }
        Ok(frame)
    }

    /// Buffer a sync write in the open frame.
    ///
    /// An insert for a key that already holds synced data becomes an update
    /// when the values are equal; otherwise it is a duplicate, unless this
    /// frame truncated or deleted the key first.
    pub fn write_sync(&mut self, mut operation: SyncOperation) -> Result<()> {
        let existing = self.synced.get(&operation.key).cloned();
        let collection = self.collection_id.clone();
        let frame = self.open_frame()?;
        if operation.kind == ChangeType::Insert
            && !frame.truncate
            && !frame.deleted_keys.contains(&operation.key)
        {
            if let Some(existing) = existing {
                if existing == operation.value {
                    operation.kind = ChangeType::Update;
                } else {
                    return Err(Error::DuplicateKeySync {
                        collection,
                        key: operation.key,
                    });
                }
            }
        }
        match operation.kind {
            ChangeType::Delete => {
                frame.deleted_keys.insert(operation.key.clone());
            }
            _ => {
                frame.deleted_keys.remove(&operation.key);
            }
        }
        frame.operations.push(operation);
        Ok(())
    }

    pub fn commit_sync(&mut self) -> Result<()> {
        let frame = self.open_frame()?;
        frame.committed = true;
        Ok(())
    }

    /// Drop the open frame's buffered writes and mark it as a truncate.
    pub fn truncate_sync(&mut self) -> Result<()> {
        let snapshot = OptimisticSnapshot {
            upserts: self
                .upserts
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            deletes: self.deletes.clone(),
        };
        let frame = self.open_frame()?;
        frame.operations.clear();
        frame.deleted_keys.clear();
        frame.truncate = true;
        frame.optimistic_snapshot = Some(snapshot);
        Ok(())
    }

    pub fn has_committed_sync(&self) -> bool {
        self.pending_sync.iter().any(|frame| frame.committed)
    }

    pub fn pending_sync_len(&self) -> usize {
        self.pending_sync.len()
    }

    /// Apply every committed sync frame to the synced data.
    ///
    /// Returns `None` while a transaction writing to this collection is
    /// persisting, unless one of the frames truncates.
    pub fn commit_pending(&mut self) -> Option<Reconciled> {
        let urgent = self
            .pending_sync
            .iter()
            .any(|frame| frame.committed && (frame.truncate || frame.local));
        if self.any_persisting() && !urgent {
            tracing::debug!(
                collection = %self.collection_id,
                "sync commit deferred while a transaction persists"
            );
            return None;
        }
        let (frames, open): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_sync)
            .into_iter()
            .partition(|frame| frame.committed);
        self.pending_sync = open;
        if frames.is_empty() {
            return None;
        }

        let mut truncated = false;
        let mut truncate_changes = Vec::new();
        let mut touched: Vec<Key> = Vec::new();
        let mut before: HashMap<Key, Option<Value>> = HashMap::new();
        let mut operations = 0usize;
        // A truncate retracts what subscribers saw before this commit, not
        // rows that earlier frames of the same batch wrote.
        let mut announced: Option<Vec<ChangeMessage>> = Some(
            self.iter()
                .map(|(key, value)| ChangeMessage::delete(key.clone(), value.clone()))
                .collect(),
        );

        for frame in frames {
            if frame.truncate {
                truncate_changes.extend(announced.take().unwrap_or_default());
                self.synced.clear();
                self.synced_metadata.clear();
                touched.clear();
                before.clear();
                truncated = true;
                // Optimistic writes survive a truncate and are re-announced.
                let mut replay: BTreeSet<Key> = self.upserts.keys().cloned().collect();
                if let Some(snapshot) = &frame.optimistic_snapshot {
                    replay.extend(snapshot.upserts.keys().cloned());
                }
                for key in replay {
                    before.insert(key.clone(), None);
                    touched.push(key);
                }
            }
            for op in frame.operations {
                operations += 1;
                if !before.contains_key(&op.key) {
                    let visible = if truncated {
                        None
                    } else {
                        self.get(&op.key).cloned()
                    };
                    before.insert(op.key.clone(), visible);
                    touched.push(op.key.clone());
                }
                self.apply_operation(op);
            }
        }

        self.rebuild_overlay();

        let mut index_changes = truncate_changes.clone();
        let mut events = truncate_changes;
        for key in touched {
            let previous = before.remove(&key).flatten();
            let current = self.get(&key).cloned();
            let Some(change) = diff_entry(&key, previous, current) else {
                continue;
            };
            let echoed = self.completed.get(&key).is_some_and(|done| match &change.kind {
                ChangeType::Delete => done.kind == ChangeType::Delete,
                _ => values_equal(&change.value, &done.value, self.equality),
            });
            index_changes.push(change.clone());
            self.recently_synced.insert(key);
            if !echoed {
                events.push(change);
            }
        }
        self.track_arrivals(&index_changes);
        tracing::debug!(
            collection = %self.collection_id,
            operations,
            truncated,
            events = events.len(),
            "sync transactions committed"
        );
        Some(Reconciled {
            truncated,
            index_changes,
            events,
        })
    }

    fn apply_operation(&mut self, op: SyncOperation) {
        match op.kind {
            ChangeType::Insert => {
                self.synced.set(op.key.clone(), op.value);
                if let Some(metadata) = op.metadata {
                    self.synced_metadata.insert(op.key, metadata);
                }
            }
            ChangeType::Update => {
                let value = match (self.row_update_mode, self.synced.get(&op.key)) {
                    (RowUpdateMode::Partial, Some(Value::Object(existing))) => {
                        let mut merged = existing.clone();
                        match op.value {
                            Value::Object(fields) => merged.extend(fields),
                            other => return self.replace(op.key, other, op.metadata),
                        }
                        Value::Object(merged)
                    }
                    _ => op.value,
                };
                self.replace(op.key, value, op.metadata);
            }
            ChangeType::Delete => {
                self.synced.remove(&op.key);
                self.synced_metadata.remove(&op.key);
            }
        }
    }

    fn replace(&mut self, key: Key, value: Value, metadata: Option<Value>) {
        self.synced.set(key.clone(), value);
        if let Some(metadata) = metadata {
            let merged = match (self.synced_metadata.remove(&key), metadata) {
                (Some(Value::Object(mut old)), Value::Object(new)) => {
                    old.extend(new);
                    Value::Object(old)
                }
                (_, new) => new,
            };
            self.synced_metadata.insert(key, merged);
        }
    }

    /// Discard everything, keeping configuration.
    pub fn clear(&mut self) {
        self.synced.clear();
        self.synced_metadata.clear();
        self.upserts.clear();
        self.deletes.clear();
        self.pending_sync.clear();
        self.transactions.clear();
        self.recently_synced.clear();
        self.completed.clear();
        self.arrivals.clear();
        self.size = 0;
    }

    pub fn comparator(&self) -> Option<&RowComparator> {
        self.comparator.as_ref()
    }
}

fn diff_entry(key: &Key, before: Option<Value>, after: Option<Value>) -> Option<ChangeMessage> {
    match (before, after) {
        (None, Some(value)) => Some(ChangeMessage::insert(key.clone(), value)),
        (Some(previous), Some(value)) if previous != value => {
            Some(ChangeMessage::update(key.clone(), value, previous))
        }
        (Some(previous), None) => Some(ChangeMessage::delete(key.clone(), previous)),
        _ => None,
    }
}

impl std::fmt::Debug for CollectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionState")
            .field("collection_id", &self.collection_id)
            .field("synced", &self.synced.len())
            .field("upserts", &self.upserts.len())
            .field("deletes", &self.deletes.len())
            .field("pending_sync", &self.pending_sync.len())
            .field("size", &self.size)
            .finish()
    }
}
