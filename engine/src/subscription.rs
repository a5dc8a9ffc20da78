//! Per-consumer views over a collection.
//!
//! A subscription forwards collection changes that pass its `where` filter,
//! rewritten so that the consumer sees a consistent stream: every key it
//! receives a `delete` or `update` for was previously inserted. It also serves
//! snapshots on request, including index-driven pages for ordered, limited
//! consumers, and buffers across truncates so that a forced resync never
//! shows up as an empty collection.

use crate::change::{ChangeMessage, ChangeType, CollectionEvent};
use crate::collection::{Collection, WeakCollection};
use crate::compare::{compare_columns, CompareOptions, SortDirection};
use crate::error::{Error, Result};
use crate::index::{auto, IndexOperation, IndexRead, ReverseIndex};
use crate::key::{get_path, Key};
use crate::query::evaluate::{compile, compile_predicate, Predicate};
use crate::query::ir::{combine_and, Expr, OrderByClause};
use crate::sync::{LoadCursor, LoadSubsetOptions, SubsetLoad};
use crate::task::Deferred;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

/// Receives batches of changes.
pub type ChangeListener = Rc<dyn Fn(&[ChangeMessage])>;

/// Options for [`Collection::subscribe_changes`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeOptions {
    /// Deliver the current matching rows as inserts right away.
    pub include_initial_state: bool,
    /// Row-relative filter.
    pub where_: Option<Expr>,
}

impl SubscribeOptions {
    pub fn with_initial_state(mut self) -> Self {
        self.include_initial_state = true;
        self
    }

    pub fn with_where(mut self, expr: Expr) -> Self {
        self.where_ = Some(expr);
        self
    }
}

/// A one-off snapshot request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotRequest {
    pub where_: Option<Expr>,
    pub order_by: Vec<OrderByClause>,
    pub limit: Option<usize>,
}

/// A page of an ordered view, served from an index.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitedSnapshot {
    pub order_by: OrderByClause,
    pub limit: usize,
    /// Continue after this value of the order column. Rows equal to it that
    /// were not sent yet are included.
    pub min_value: Option<Value>,
    /// Forwarded to `load_subset`.
    pub offset: Option<usize>,
}

#[derive(Default)]
struct SubscriptionState {
    active: bool,
    sent_keys: HashSet<Key>,
    loaded_initial_state: bool,
    loaded_subsets: Vec<LoadSubsetOptions>,
    requested_shapes: HashSet<String>,
    limited_cursor: Option<Value>,
    buffering: bool,
    buffer: Vec<ChangeMessage>,
}

pub(crate) struct SubscriptionInner {
    id: String,
    collection_id: String,
    collection: WeakCollection,
    listener: ChangeListener,
    where_: Option<Expr>,
    filter: Option<Predicate>,
    state: RefCell<SubscriptionState>,
}

/// Handle to a subscription. Clones share state.
#[derive(Clone)]
pub struct Subscription {
    inner: Rc<SubscriptionInner>,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        collection: &Collection,
        listener: ChangeListener,
        where_: Option<Expr>,
    ) -> Result<Self> {
        let filter = where_.as_ref().map(compile_predicate).transpose()?;
        Ok(Self {
            inner: Rc::new(SubscriptionInner {
                id,
                collection_id: collection.id().to_string(),
                collection: collection.downgrade(),
                listener,
                where_,
                filter,
                state: RefCell::new(SubscriptionState {
                    active: true,
                    ..SubscriptionState::default()
                }),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn where_expr(&self) -> Option<&Expr> {
        self.inner.where_.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.borrow().active
    }

    pub fn is_buffering(&self) -> bool {
        self.inner.state.borrow().buffering
    }

    pub fn has_sent(&self, key: &Key) -> bool {
        self.inner.state.borrow().sent_keys.contains(key)
    }

    pub fn sent_key_count(&self) -> usize {
        self.inner.state.borrow().sent_keys.len()
    }

    pub fn loaded_initial_state(&self) -> bool {
        self.inner.state.borrow().loaded_initial_state
    }

    pub fn loaded_subsets(&self) -> Vec<LoadSubsetOptions> {
        self.inner.state.borrow().loaded_subsets.clone()
    }

    /// Largest order-column value delivered by limited snapshots.
    pub fn limited_cursor(&self) -> Option<Value> {
        self.inner.state.borrow().limited_cursor.clone()
    }

    fn collection(&self) -> Result<Collection> {
        self.inner
            .collection
            .upgrade()
            .ok_or_else(|| Error::CollectionCleanedUp(self.inner.collection_id.clone()))
    }

    fn matches(&self, row: &Value) -> bool {
        self.inner.filter.as_ref().map_or(true, |f| f(row))
    }

    pub(crate) fn handle_event(&self, event: &CollectionEvent) {
        match event {
            CollectionEvent::Truncate => self.on_truncate(),
            CollectionEvent::Changes(changes) => {
                let changes = self.filter_and_flip(changes);
                self.deliver(changes);
            }
        }
    }

    /// Rewrite raw collection changes into what this consumer should see.
    fn filter_and_flip(&self, changes: &[ChangeMessage]) -> Vec<ChangeMessage> {
        let mut state = self.inner.state.borrow_mut();
        if !state.active {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(changes.len());
        for change in changes {
            let was_sent = state.sent_keys.contains(&change.key);
            match change.kind {
                ChangeType::Insert => {
                    if was_sent || !self.matches(&change.value) {
                        continue;
                    }
                    state.sent_keys.insert(change.key.clone());
                    out.push(change.clone());
                }
                ChangeType::Update => match (was_sent, self.matches(&change.value)) {
                    (true, true) => out.push(change.clone()),
                    (false, true) => {
                        state.sent_keys.insert(change.key.clone());
                        out.push(ChangeMessage {
                            kind: ChangeType::Insert,
                            previous_value: None,
                            ..change.clone()
                        });
                    }
                    (true, false) => {
                        state.sent_keys.remove(&change.key);
                        let last_seen = change
                            .previous_value
                            .clone()
                            .unwrap_or_else(|| change.value.clone());
                        out.push(ChangeMessage {
                            kind: ChangeType::Delete,
                            value: last_seen,
                            previous_value: None,
                            ..change.clone()
                        });
                    }
                    (false, false) => {}
                },
                ChangeType::Delete => {
                    if was_sent {
                        state.sent_keys.remove(&change.key);
                        out.push(change.clone());
                    }
                }
            }
        }
        out
    }

    fn deliver(&self, changes: Vec<ChangeMessage>) {
        if changes.is_empty() {
            return;
        }
        {
            let mut state = self.inner.state.borrow_mut();
            if !state.active {
                return;
            }
            if state.buffering {
                state.buffer.extend(changes);
                return;
            }
        }
        (self.inner.listener)(&changes);
    }

    fn mark_sent(&self, rows: Vec<(Key, Value)>) -> Vec<ChangeMessage> {
        let mut state = self.inner.state.borrow_mut();
        rows.into_iter()
            .filter(|(key, _)| state.sent_keys.insert(key.clone()))
            .map(|(key, value)| ChangeMessage::insert(key, value))
            .collect()
    }

    /// Deliver the current rows matching this subscription and `request`.
    ///
    /// Each distinct request shape is served once. Returns whether the
    /// matching subset load finished synchronously.
    pub fn request_snapshot(&self, request: SnapshotRequest) -> Result<bool> {
        let collection = self.collection()?;
        let shape = json!({
            "where": request.where_,
            "orderBy": request.order_by,
            "limit": request.limit,
        })
        .to_string();
        {
            let mut state = self.inner.state.borrow_mut();
            if !state.active {
                return Ok(true);
            }
            let full = request.where_.is_none() && request.limit.is_none();
            if (full && state.loaded_initial_state) || !state.requested_shapes.insert(shape) {
                return Ok(true);
            }
        }

        let where_ = combine_and(
            self.inner
                .where_
                .iter()
                .chain(request.where_.iter())
                .cloned()
                .collect(),
        );
        let mut rows: Vec<(Key, Value)> = collection
            .current_state_as_changes(where_.as_ref())?
            .into_iter()
            .map(|c| (c.key, c.value))
            .collect();
        if !request.order_by.is_empty() {
            sort_rows(&mut rows, &request.order_by)?;
        }
        if let Some(limit) = request.limit {
            rows.truncate(limit);
        }
        let changes = self.mark_sent(rows);
        if request.where_.is_none() && request.limit.is_none() {
            self.inner.state.borrow_mut().loaded_initial_state = true;
        }
        self.deliver(changes);

        let options = LoadSubsetOptions {
            where_,
            order_by: request.order_by,
            limit: request.limit,
            subscription_id: Some(self.inner.id.clone()),
            ..LoadSubsetOptions::default()
        };
        let load = collection.load_subset(&options)?;
        self.inner.state.borrow_mut().loaded_subsets.push(options);
        Ok(load.is_complete())
    }

    /// Deliver up to `limit` unsent rows in index order after
    /// `request.min_value`, then ask the backend for the same page.
    ///
    /// Returns how many rows were delivered from local state.
    pub fn request_limited_snapshot(&self, request: LimitedSnapshot) -> Result<usize> {
        let collection = self.collection()?;
        let field = request
            .order_by
            .expr
            .as_ref_path()
            .ok_or_else(|| Error::MissingOrderIndex(request.order_by.expr.to_string()))?
            .to_vec();
        let index = auto::ensure_index_for_order(&collection, &field, &request.order_by.options)
            .ok_or_else(|| Error::MissingOrderIndex(field.join(".")))?;
        let descending = request.order_by.options.direction == SortDirection::Desc;

        let mut keys: Vec<Key> = Vec::new();
        {
            let state = self.inner.state.borrow();
            let wanted = |key: &Key| {
                !state.sent_keys.contains(key)
                    && collection
                        .peek(key)
                        .is_some_and(|row| self.matches(&row))
            };
            // Rows tied with the cursor value first, so a page boundary inside
            // a run of equal values loses none of them.
            if let Some(min) = &request.min_value {
                for key in index.lookup(IndexOperation::Eq, min)? {
                    if wanted(&key) {
                        keys.push(key);
                    }
                }
            }
            let remaining = request.limit.saturating_sub(keys.len());
            if remaining > 0 {
                let tied: HashSet<Key> = keys.iter().cloned().collect();
                let filter = |key: &Key| !tied.contains(key) && wanted(key);
                let from = request.min_value.as_ref();
                let taken = index.with_read(|idx| {
                    if descending {
                        ReverseIndex::new(idx).take(remaining, from, Some(&filter))
                    } else {
                        idx.take(remaining, from, Some(&filter))
                    }
                })?;
                keys.extend(taken);
            }
        }

        let rows: Vec<(Key, Value)> = keys
            .into_iter()
            .filter_map(|key| collection.peek(&key).map(|row| (key, row)))
            .collect();
        if let Some((_, last)) = rows.last() {
            let value = get_path(last, &field).cloned().unwrap_or(Value::Null);
            self.inner.state.borrow_mut().limited_cursor = Some(value);
        }
        let changes = self.mark_sent(rows);
        let delivered = changes.len();
        self.deliver(changes);

        let cursor = request.min_value.map(|min| {
            let op = if descending { "lt" } else { "gt" };
            LoadCursor {
                where_from: Expr::func(op, vec![Expr::prop(field.clone()), Expr::value(min.clone())]),
                where_current: Expr::func("eq", vec![Expr::prop(field.clone()), Expr::value(min)]),
            }
        });
        let options = LoadSubsetOptions {
            where_: self.inner.where_.clone(),
            order_by: vec![request.order_by],
            limit: Some(request.limit),
            offset: request.offset,
            cursor,
            subscription_id: Some(self.inner.id.clone()),
        };
        let load = collection.load_subset(&options)?;
        self.inner.state.borrow_mut().loaded_subsets.push(options);
        if !load.is_complete() {
            tracing::debug!(subscription = %self.inner.id, "limited subset load pending");
        }
        Ok(delivered)
    }

    fn on_truncate(&self) {
        let start_buffering = {
            let mut state = self.inner.state.borrow_mut();
            let reload = state.loaded_initial_state || !state.loaded_subsets.is_empty();
            if !state.active || !reload || state.buffering {
                false
            } else {
                state.buffering = true;
                true
            }
        };
        if !start_buffering {
            return;
        }
        tracing::debug!(subscription = %self.inner.id, "buffering changes across truncate");
        if let Ok(collection) = self.collection() {
            let subscription = self.clone();
            collection.defer(move || subscription.reload_after_truncate());
        }
    }

    /// Re-request everything this subscription had loaded and release the
    /// buffer once every reload has settled.
    fn reload_after_truncate(&self) {
        let (had_initial_state, subsets) = {
            let mut state = self.inner.state.borrow_mut();
            state.requested_shapes.clear();
            let had = std::mem::take(&mut state.loaded_initial_state);
            (had, std::mem::take(&mut state.loaded_subsets))
        };
        let mut pending: Vec<Deferred<()>> = Vec::new();
        if had_initial_state {
            if let Err(e) = self.request_snapshot(SnapshotRequest::default()) {
                tracing::warn!(subscription = %self.inner.id, error = %e, "snapshot reload failed");
            }
        }
        if let Ok(collection) = self.collection() {
            for options in subsets {
                if options.where_ == self.inner.where_
                    && options.order_by.is_empty()
                    && options.limit.is_none()
                    && had_initial_state
                {
                    // Already re-issued by the snapshot reload above.
                    continue;
                }
                match collection.load_subset(&options) {
                    Ok(SubsetLoad::Pending(deferred)) => pending.push(deferred),
                    Ok(SubsetLoad::Complete) => {}
                    Err(e) => {
                        tracing::warn!(subscription = %self.inner.id, error = %e, "subset reload failed");
                    }
                }
                self.inner.state.borrow_mut().loaded_subsets.push(options);
            }
        }
        if pending.is_empty() {
            self.flush_buffer();
        } else {
            let subscription = self.clone();
            Deferred::join_all(pending).on_settled(move |_| subscription.flush_buffer());
        }
    }

    fn flush_buffer(&self) {
        let buffered = {
            let mut state = self.inner.state.borrow_mut();
            state.buffering = false;
            std::mem::take(&mut state.buffer)
        };
        self.deliver(coalesce(buffered));
    }

    /// Stop receiving changes and release every loaded subset.
    pub fn unsubscribe(&self) {
        let subsets = {
            let mut state = self.inner.state.borrow_mut();
            if !state.active {
                return;
            }
            state.active = false;
            state.buffer.clear();
            std::mem::take(&mut state.loaded_subsets)
        };
        if let Some(collection) = self.inner.collection.upgrade() {
            collection.remove_subscription(&self.inner.id);
            for options in &subsets {
                collection.unload_subset(options);
            }
        }
        tracing::debug!(subscription = %self.inner.id, "unsubscribed");
    }

    /// Detach without talking to the backend; used when the collection is
    /// cleaned up underneath the subscription.
    pub(crate) fn deactivate(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.active = false;
        state.buffer.clear();
        state.sent_keys.clear();
    }
}

/// Fold a delete followed by an insert of the same key into one update.
fn coalesce(changes: Vec<ChangeMessage>) -> Vec<ChangeMessage> {
    let mut out: Vec<Option<ChangeMessage>> = Vec::with_capacity(changes.len());
    let mut deleted_at: HashMap<Key, usize> = HashMap::new();
    for change in changes {
        match change.kind {
            ChangeType::Delete => {
                deleted_at.insert(change.key.clone(), out.len());
                out.push(Some(change));
            }
            ChangeType::Insert => match deleted_at.remove(&change.key) {
                Some(position) => {
                    let previous = out[position].take().map(|c| c.value);
                    match previous {
                        Some(previous) if previous == change.value => {}
                        Some(previous) => out.push(Some(ChangeMessage::update(
                            change.key,
                            change.value,
                            previous,
                        ))),
                        None => out.push(Some(change)),
                    }
                }
                None => out.push(Some(change)),
            },
            ChangeType::Update => out.push(Some(change)),
        }
    }
    out.into_iter().flatten().collect()
}

fn sort_rows(rows: &mut [(Key, Value)], order_by: &[OrderByClause]) -> Result<()> {
    let evaluators = order_by
        .iter()
        .map(|clause| compile(&clause.expr))
        .collect::<Result<Vec<_>>>()?;
    let options: Vec<CompareOptions> = order_by.iter().map(|c| c.options).collect();
    let mut decorated: Vec<(Vec<Value>, (Key, Value))> = rows
        .iter()
        .map(|(k, v)| (evaluators.iter().map(|e| e(v)).collect(), (k.clone(), v.clone())))
        .collect();
    // Stable: rows arrive in collection order, which breaks ties.
    decorated.sort_by(|a, b| compare_columns(&a.0, &b.0, &options));
    for (slot, (_, row)) in rows.iter_mut().zip(decorated) {
        *slot = row;
    }
    Ok(())
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("collection", &self.inner.collection_id)
            .field("active", &state.active)
            .field("sent_keys", &state.sent_keys.len())
            .field("buffering", &state.buffering)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_folds_reloaded_rows() {
        let out = coalesce(vec![
            ChangeMessage::delete(Key::from("1"), json!({"v": 1})),
            ChangeMessage::delete(Key::from("2"), json!({"v": 2})),
            ChangeMessage::delete(Key::from("3"), json!({"v": 3})),
            ChangeMessage::insert(Key::from("1"), json!({"v": 1})),
            ChangeMessage::insert(Key::from("2"), json!({"v": 20})),
            ChangeMessage::insert(Key::from("4"), json!({"v": 4})),
        ]);
        assert_eq!(
            out,
            vec![
                ChangeMessage::delete(Key::from("3"), json!({"v": 3})),
                ChangeMessage::update(Key::from("2"), json!({"v": 20}), json!({"v": 2})),
                ChangeMessage::insert(Key::from("4"), json!({"v": 4})),
            ]
        );
    }

    #[test]
    fn sort_rows_keeps_arrival_order_for_ties() {
        let mut rows = vec![
            (Key::from("c"), json!({"n": 2})),
            (Key::from("b"), json!({"n": 1})),
            (Key::from("a"), json!({"n": 2})),
        ];
        let order = vec![OrderByClause {
            expr: Expr::prop(vec!["n".into()]),
            options: CompareOptions::desc(),
        }];
        sort_rows(&mut rows, &order).unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![Key::from("c"), Key::from("a"), Key::from("b")]);
    }
}
