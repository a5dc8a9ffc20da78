//! Collections: synced data plus optimistic writes, observed through
//! subscriptions.
//!
//! A [`Collection`] owns its [`CollectionState`], its indexes, and the list of
//! subscriptions it publishes to. All mutation of that state goes through
//! this module so that every reconciliation step is applied to indexes and
//! published to subscribers as one unit, with no `RefCell` borrow held while
//! user callbacks run.

use crate::change::{ChangeMessage, ChangeType, CollectionEvent};
use crate::compare::CompareOptions;
use crate::config::{CollectionConfig, CollectionOptions, GetKey, MutationFn, SyncMode, TransactionConfig};
use crate::error::{Error, Result};
use crate::index::optimize::candidate_keys;
use crate::index::{auto, IndexId, IndexProxy, IndexResolver, IndexSet, IndexSource};
use crate::key::{global_key, Key};
use crate::lifecycle::{CollectionStatus, Lifecycle};
use crate::query::evaluate::compile_predicate;
use crate::query::ir::Expr;
use crate::state::{CollectionState, Reconciled, SyncOperation};
use crate::subscription::{SnapshotRequest, SubscribeOptions, Subscription};
use crate::sync::{LoadSubsetOptions, SubsetLoad, SyncBackend, SyncContext, SyncWrite};
use crate::task::Deferred;
use crate::transaction::{
    diff_changes, mutation::is_unchanged, PendingMutation, Scheduler, Transaction,
    TransactionRegistry, TransactionState,
};
use chrono::Utc;
use futures::future::LocalBoxFuture;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Instant;

/// Options for [`Collection::create_index`].
#[derive(Debug, Default)]
pub struct IndexOptions {
    /// Defaults to the collection's `compare_options`.
    pub compare_options: Option<CompareOptions>,
    pub resolver: IndexResolver,
}

pub(crate) struct CollectionInner {
    id: String,
    options: CollectionOptions,
    get_key: GetKey,
    sync: Option<Rc<dyn SyncBackend>>,
    on_insert: Option<MutationFn>,
    on_update: Option<MutationFn>,
    on_delete: Option<MutationFn>,
    state: RefCell<CollectionState>,
    lifecycle: RefCell<Lifecycle>,
    indexes: RefCell<IndexSet>,
    subscriptions: RefCell<Vec<Subscription>>,
    deferred: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    draining: Cell<bool>,
    sync_started: Cell<bool>,
    loading_subsets: Cell<usize>,
    next_subscription: Cell<u64>,
    registry: Rc<TransactionRegistry>,
    scheduler: Rc<Scheduler>,
    weak_self: Weak<CollectionInner>,
}

impl IndexSource for CollectionInner {
    fn index_entries(&self) -> Vec<(Key, Value)> {
        self.state
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Handle to a collection. Clones share state.
#[derive(Clone)]
pub struct Collection {
    inner: Rc<CollectionInner>,
}

/// Non-owning handle, held by subscriptions, mutations and sync contexts.
#[derive(Clone, Default)]
pub struct WeakCollection {
    inner: Weak<CollectionInner>,
}

impl WeakCollection {
    pub fn upgrade(&self) -> Option<Collection> {
        self.inner.upgrade().map(|inner| Collection { inner })
    }
}

impl fmt::Debug for WeakCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.upgrade() {
            Some(inner) => write!(f, "WeakCollection({})", inner.id),
            None => f.write_str("WeakCollection(<dropped>)"),
        }
    }
}

impl Collection {
    pub(crate) fn new(
        config: CollectionConfig,
        registry: Rc<TransactionRegistry>,
        scheduler: Rc<Scheduler>,
    ) -> Result<Self> {
        config.options.validate()?;
        let CollectionConfig {
            options,
            get_key,
            compare,
            sync,
            on_insert,
            on_update,
            on_delete,
        } = config;
        let inner = Rc::new_cyclic(|weak_self| CollectionInner {
            id: options.id.clone(),
            state: RefCell::new(CollectionState::new(
                options.id.clone(),
                compare,
                options.row_update_mode,
                options.sync_equality,
            )),
            lifecycle: RefCell::new(Lifecycle::new(options.id.clone(), options.gc_time_ms)),
            options,
            get_key,
            sync,
            on_insert,
            on_update,
            on_delete,
            indexes: RefCell::new(IndexSet::new()),
            subscriptions: RefCell::new(Vec::new()),
            deferred: RefCell::new(VecDeque::new()),
            draining: Cell::new(false),
            sync_started: Cell::new(false),
            loading_subsets: Cell::new(0),
            next_subscription: Cell::new(0),
            registry,
            scheduler,
            weak_self: weak_self.clone(),
        });
        tracing::debug!(collection = %inner.id, "collection created");
        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.inner.options
    }

    pub fn downgrade(&self) -> WeakCollection {
        WeakCollection {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Collection) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Key of `row` according to the collection's key extractor.
    pub fn key_of(&self, row: &Value) -> Result<Key> {
        (self.inner.get_key)(row)
    }

    // Status

    pub fn status(&self) -> CollectionStatus {
        self.inner.lifecycle.borrow().status()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == CollectionStatus::Ready
    }

    /// Reason for the error status, if any.
    pub fn error(&self) -> Option<String> {
        self.inner.lifecycle.borrow().error().map(str::to_string)
    }

    fn ensure_usable(&self) -> Result<()> {
        let lifecycle = self.inner.lifecycle.borrow();
        if lifecycle.status() == CollectionStatus::Error {
            return Err(Error::CollectionInError {
                collection: self.inner.id.clone(),
                reason: lifecycle.error().unwrap_or("unknown").to_string(),
            });
        }
        Ok(())
    }

    fn transition(&self, to: CollectionStatus) -> Result<()> {
        let callbacks = self.inner.lifecycle.borrow_mut().transition(to)?;
        if to == CollectionStatus::Ready {
            let proxies: Vec<IndexProxy> = self.inner.indexes.borrow().proxies().to_vec();
            for proxy in proxies {
                proxy.try_resolve_now();
            }
        }
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    fn fail(&self, error: &Error) {
        tracing::warn!(collection = %self.inner.id, error = %error, "collection failed");
        if let Err(e) = self.inner.lifecycle.borrow_mut().fail(error.to_string()) {
            tracing::warn!(collection = %self.inner.id, error = %e, "could not enter error status");
        }
    }

    /// Run `callback` on the first transition to ready, or now if that
    /// already happened.
    pub fn on_first_ready(&self, callback: impl FnOnce() + 'static) {
        let immediate = self
            .inner
            .lifecycle
            .borrow_mut()
            .on_first_ready(Box::new(callback));
        if let Some(callback) = immediate {
            callback();
        }
    }

    /// Settles on the first transition to ready.
    pub fn ready(&self) -> Deferred<()> {
        let (deferred, resolver) = Deferred::new();
        self.on_first_ready(move || resolver.resolve(()));
        deferred
    }

    /// Start syncing and wait until the collection is ready.
    pub fn preload(&self) -> LocalBoxFuture<'static, Result<()>> {
        let collection = self.clone();
        Box::pin(async move {
            collection.start_sync()?;
            collection.ready().await
        })
    }

    /// Leave the error status. State is discarded; the next subscription or
    /// [`Collection::start_sync`] syncs from scratch.
    pub fn reset_error(&self) -> Result<()> {
        self.transition(CollectionStatus::Idle)?;
        self.inner.sync_started.set(false);
        self.inner.state.borrow_mut().clear();
        for proxy in self.inner.indexes.borrow().proxies() {
            proxy.clear();
        }
        Ok(())
    }

    // Reads

    /// Visible value for `key`, without the status check.
    pub(crate) fn peek(&self, key: &Key) -> Option<Value> {
        self.inner.state.borrow().get(key).cloned()
    }

    pub fn get(&self, key: &Key) -> Result<Option<Value>> {
        self.ensure_usable()?;
        Ok(self.peek(key))
    }

    pub fn has(&self, key: &Key) -> Result<bool> {
        self.ensure_usable()?;
        Ok(self.inner.state.borrow().has(key))
    }

    pub fn size(&self) -> Result<usize> {
        self.ensure_usable()?;
        Ok(self.inner.state.borrow().len())
    }

    /// Keys in collection order.
    pub fn keys(&self) -> Result<Vec<Key>> {
        self.ensure_usable()?;
        Ok(self.inner.state.borrow().keys().cloned().collect())
    }

    pub fn values(&self) -> Result<Vec<Value>> {
        Ok(self.entries()?.map(|(_, v)| v).collect())
    }

    /// Rows in collection order. Values are read as the iterator advances;
    /// rows removed in the meantime are skipped.
    pub fn entries(&self) -> Result<Entries> {
        let keys = self.keys()?;
        Ok(Entries {
            collection: self.clone(),
            keys: keys.into_iter(),
        })
    }

    /// Metadata the sync backend attached to `key`.
    pub fn metadata(&self, key: &Key) -> Option<Value> {
        self.inner.state.borrow().synced_metadata(key).cloned()
    }

    /// Every visible row matching `where_` as an insert, in the order the
    /// rows arrived. Uses indexes when they can answer the predicate.
    pub fn current_state_as_changes(&self, where_: Option<&Expr>) -> Result<Vec<ChangeMessage>> {
        self.ensure_usable()?;
        let Some(expr) = where_ else {
            let state = self.inner.state.borrow();
            let mut changes: Vec<ChangeMessage> = state
                .iter()
                .map(|(k, v)| ChangeMessage::insert(k.clone(), v.clone()))
                .collect();
            state.sort_by_arrival(&mut changes);
            return Ok(changes);
        };
        let predicate = compile_predicate(expr)?;
        let candidates = candidate_keys(expr, &self.inner.indexes.borrow());
        let state = self.inner.state.borrow();
        let mut changes: Vec<ChangeMessage> = match candidates {
            Some(keys) => keys
                .into_iter()
                .filter_map(|key| {
                    let value = state.get(&key)?.clone();
                    predicate(&value).then(|| ChangeMessage::insert(key, value))
                })
                .collect(),
            None => state
                .iter()
                .filter(|(_, v)| predicate(v))
                .map(|(k, v)| ChangeMessage::insert(k.clone(), v.clone()))
                .collect(),
        };
        state.sort_by_arrival(&mut changes);
        Ok(changes)
    }

    // Writes

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_usable()
    }

    fn mutation(
        &self,
        kind: ChangeType,
        key: Key,
        original: Option<Value>,
        modified: Value,
        changes: Value,
    ) -> PendingMutation {
        let now = Utc::now();
        PendingMutation {
            mutation_id: uuid::Uuid::new_v4().to_string(),
            kind,
            global_key: global_key(&self.inner.id, &key),
            key,
            original,
            modified,
            changes,
            metadata: None,
            created_at: now,
            updated_at: now,
            collection_id: self.inner.id.clone(),
            collection: self.downgrade(),
        }
    }

    /// Insert one row.
    pub fn insert(&self, value: Value) -> Result<Transaction> {
        self.insert_many(vec![value])
    }

    /// Insert rows in one transaction. Fails without writing anything if any
    /// key is already visible.
    pub fn insert_many(&self, values: Vec<Value>) -> Result<Transaction> {
        self.ensure_writable()?;
        let mut seen = HashSet::new();
        let mut mutations = Vec::with_capacity(values.len());
        for value in values {
            let key = self.key_of(&value)?;
            if self.inner.state.borrow().has(&key) || !seen.insert(key.clone()) {
                return Err(Error::DuplicateKey {
                    collection: self.inner.id.clone(),
                    key,
                });
            }
            mutations.push(self.mutation(ChangeType::Insert, key, None, value.clone(), value));
        }
        self.apply_write("insert", self.inner.on_insert.clone(), mutations)
    }

    /// Update one row through a draft. The draft must keep the row's key.
    pub fn update(&self, key: impl Into<Key>, f: impl FnOnce(&mut Value)) -> Result<Transaction> {
        let mut f = Some(f);
        self.update_many(vec![key.into()], |draft| {
            if let Some(f) = f.take() {
                f(draft);
            }
        })
    }

    /// Update several rows with the same draft function.
    pub fn update_many(&self, keys: Vec<Key>, mut f: impl FnMut(&mut Value)) -> Result<Transaction> {
        self.ensure_writable()?;
        let mut mutations = Vec::with_capacity(keys.len());
        for key in keys {
            let original = self.peek(&key).ok_or_else(|| Error::KeyNotFound {
                collection: self.inner.id.clone(),
                key: key.clone(),
            })?;
            let mut modified = original.clone();
            f(&mut modified);
            if self.key_of(&modified)? != key {
                return Err(Error::KeyUpdateNotAllowed(key));
            }
            let changes = diff_changes(&original, &modified);
            if is_unchanged(&changes) {
                continue;
            }
            mutations.push(self.mutation(ChangeType::Update, key, Some(original), modified, changes));
        }
        if mutations.is_empty() {
            return self.empty_write();
        }
        self.apply_write("update", self.inner.on_update.clone(), mutations)
    }

    pub fn delete(&self, key: impl Into<Key>) -> Result<Transaction> {
        self.delete_many(vec![key.into()])
    }

    pub fn delete_many(&self, keys: Vec<Key>) -> Result<Transaction> {
        self.ensure_writable()?;
        let mut mutations = Vec::with_capacity(keys.len());
        for key in keys {
            let original = self.peek(&key).ok_or_else(|| Error::KeyNotFound {
                collection: self.inner.id.clone(),
                key: key.clone(),
            })?;
            mutations.push(self.mutation(
                ChangeType::Delete,
                key,
                Some(original.clone()),
                original,
                Value::Null,
            ));
        }
        self.apply_write("delete", self.inner.on_delete.clone(), mutations)
    }

    /// An update that changed nothing: the ambient transaction, or a
    /// transaction that completes right away.
    fn empty_write(&self) -> Result<Transaction> {
        if let Some(ambient) = self.inner.registry.active() {
            return Ok(ambient);
        }
        let config = TransactionConfig::new(|_| Box::pin(async { Ok(()) }));
        let transaction = Transaction::new(config, &self.inner.registry, &self.inner.scheduler)?;
        transaction.start_commit();
        Ok(transaction)
    }

    fn apply_write(
        &self,
        operation: &'static str,
        handler: Option<MutationFn>,
        mutations: Vec<PendingMutation>,
    ) -> Result<Transaction> {
        let (transaction, direct) = match self.inner.registry.active() {
            Some(ambient) => (ambient, false),
            None => {
                let handler = handler.ok_or_else(|| Error::MissingMutationHandler {
                    collection: self.inner.id.clone(),
                    operation,
                })?;
                let config = TransactionConfig {
                    auto_commit: true,
                    mutation_fn: Some(handler),
                    ..TransactionConfig::default()
                };
                let transaction =
                    Transaction::new(config, &self.inner.registry, &self.inner.scheduler)?;
                (transaction, true)
            }
        };
        let count = mutations.len();
        transaction.apply_mutations(mutations)?;
        let outcome = {
            let mut state = self.inner.state.borrow_mut();
            state.track(&transaction);
            state.recompute(true)
        };
        tracing::debug!(
            collection = %self.inner.id,
            transaction = %transaction.id(),
            operation,
            mutations = count,
            "optimistic write applied"
        );
        let published = self.publish(outcome);
        if direct {
            transaction.start_commit();
        }
        published?;
        Ok(transaction)
    }

    /// A transaction touching this collection changed state.
    pub(crate) fn on_transaction_state_change(&self, transaction: &Transaction) {
        if transaction.state() == TransactionState::Completed {
            let mut state = self.inner.state.borrow_mut();
            state.record_completed(transaction);
            if self.inner.sync.is_none() {
                state.persist_local(transaction);
            }
        }
        let committed = {
            let mut state = self.inner.state.borrow_mut();
            if state.has_committed_sync() {
                state.commit_pending()
            } else {
                None
            }
        };
        if let Some(outcome) = committed {
            if let Err(e) = self.publish(outcome) {
                tracing::warn!(collection = %self.inner.id, error = %e, "index update failed");
            }
        }
        let recomputed = {
            let mut state = self.inner.state.borrow_mut();
            let outcome = state.recompute(false);
            state.prune_terminal();
            outcome
        };
        if let Err(e) = self.publish(recomputed) {
            tracing::warn!(collection = %self.inner.id, error = %e, "index update failed");
        }
        let weak = self.downgrade();
        self.defer(move || {
            if let Some(collection) = weak.upgrade() {
                let mut state = collection.inner.state.borrow_mut();
                state.clear_completed();
                state.clear_recently_synced();
            }
        });
        self.drain_deferred();
    }

    /// Feed a reconciliation step to the indexes, then to subscribers.
    fn publish(&self, outcome: Reconciled) -> Result<()> {
        if outcome.is_empty() {
            return Ok(());
        }
        let indexed = self
            .inner
            .indexes
            .borrow()
            .update_indexes(&outcome.index_changes);
        let subscriptions: Vec<Subscription> = self.inner.subscriptions.borrow().clone();
        if outcome.truncated {
            for subscription in &subscriptions {
                subscription.handle_event(&CollectionEvent::Truncate);
            }
        }
        if !outcome.events.is_empty() {
            let event = CollectionEvent::Changes(outcome.events);
            for subscription in &subscriptions {
                subscription.handle_event(&event);
            }
        }
        self.drain_deferred();
        indexed
    }

    /// Queue work to run after the current reconciliation step.
    pub(crate) fn defer(&self, action: impl FnOnce() + 'static) {
        self.inner.deferred.borrow_mut().push_back(Box::new(action));
    }

    fn drain_deferred(&self) {
        if self.inner.draining.replace(true) {
            return;
        }
        loop {
            let next = self.inner.deferred.borrow_mut().pop_front();
            match next {
                Some(action) => action(),
                None => break,
            }
        }
        self.inner.draining.set(false);
    }

    // Sync

    /// Start the sync backend. Idempotent while syncing.
    ///
    /// A collection without a backend is local-only: it becomes ready at
    /// once and only changes through optimistic writes.
    pub fn start_sync(&self) -> Result<()> {
        if self.inner.sync_started.get() {
            return Ok(());
        }
        self.ensure_usable()?;
        let on_demand = self.inner.options.sync_mode == SyncMode::OnDemand;
        let Some(backend) = self.inner.sync.clone() else {
            if on_demand {
                let error = Error::MissingSyncBackend(self.inner.id.clone());
                self.fail(&error);
                return Err(error);
            }
            self.inner.sync_started.set(true);
            self.transition(CollectionStatus::Loading)?;
            return self.transition(CollectionStatus::Ready);
        };
        if on_demand && !backend.supports_load_subset() {
            let error = Error::MissingLoadSubsetHandler(self.inner.id.clone());
            self.fail(&error);
            return Err(error);
        }
        self.inner.sync_started.set(true);
        self.transition(CollectionStatus::Loading)?;
        tracing::debug!(collection = %self.inner.id, "sync started");
        if let Err(error) = backend.start(SyncContext::new(self)) {
            self.inner.sync_started.set(false);
            self.fail(&error);
            return Err(error);
        }
        // On-demand backends have nothing to load up front.
        if on_demand && self.status() == CollectionStatus::Loading {
            self.transition(CollectionStatus::Ready)?;
        }
        Ok(())
    }

    pub(crate) fn sync_begin(&self) {
        self.inner.state.borrow_mut().begin_sync();
        tracing::debug!(collection = %self.inner.id, "sync frame opened");
    }

    pub(crate) fn sync_write(&self, write: SyncWrite) -> Result<()> {
        let key = match write.key {
            Some(key) => key,
            None => self.key_of(&write.value)?,
        };
        self.inner.state.borrow_mut().write_sync(SyncOperation {
            kind: write.kind,
            key,
            value: write.value,
            metadata: write.metadata,
        })
    }

    pub(crate) fn sync_truncate(&self) -> Result<()> {
        self.inner.state.borrow_mut().truncate_sync()?;
        tracing::debug!(collection = %self.inner.id, "sync frame truncated");
        Ok(())
    }

    pub(crate) fn sync_commit(&self) -> Result<()> {
        let outcome = {
            let mut state = self.inner.state.borrow_mut();
            state.commit_sync()?;
            state.commit_pending()
        };
        let published = match outcome {
            Some(outcome) => {
                tracing::debug!(
                    collection = %self.inner.id,
                    changes = outcome.index_changes.len(),
                    truncated = outcome.truncated,
                    "sync frame committed"
                );
                self.publish(outcome)
            }
            None => {
                tracing::debug!(collection = %self.inner.id, "sync commit deferred while persisting");
                Ok(())
            }
        };
        let weak = self.downgrade();
        self.defer(move || {
            if let Some(collection) = weak.upgrade() {
                collection.inner.state.borrow_mut().clear_recently_synced();
            }
        });
        self.drain_deferred();
        if self.status() == CollectionStatus::Loading {
            self.transition(CollectionStatus::Ready)?;
        }
        published
    }

    pub(crate) fn sync_mark_ready(&self) -> Result<()> {
        if self.status() == CollectionStatus::Loading {
            self.transition(CollectionStatus::Ready)?;
        }
        Ok(())
    }

    /// Ask the backend to materialise a subset. Always complete in eager
    /// mode.
    pub fn load_subset(&self, options: &LoadSubsetOptions) -> Result<SubsetLoad> {
        if self.inner.options.sync_mode == SyncMode::Eager {
            return Ok(SubsetLoad::Complete);
        }
        let backend = self
            .inner
            .sync
            .clone()
            .ok_or_else(|| Error::MissingSyncBackend(self.inner.id.clone()))?;
        if !backend.supports_load_subset() {
            return Err(Error::MissingLoadSubsetHandler(self.inner.id.clone()));
        }
        let load = backend.load_subset(options).map_err(|e| {
            tracing::warn!(collection = %self.inner.id, error = %e, "subset load failed");
            e
        })?;
        if let SubsetLoad::Pending(deferred) = &load {
            self.inner.loading_subsets.set(self.inner.loading_subsets.get() + 1);
            let weak = self.downgrade();
            let id = self.inner.id.clone();
            deferred.on_settled(move |outcome| {
                if let Some(collection) = weak.upgrade() {
                    let loading = &collection.inner.loading_subsets;
                    loading.set(loading.get().saturating_sub(1));
                }
                if let Err(e) = outcome {
                    tracing::warn!(collection = %id, error = %e, "subset load rejected");
                }
            });
        }
        Ok(load)
    }

    pub fn unload_subset(&self, options: &LoadSubsetOptions) {
        if self.inner.options.sync_mode == SyncMode::Eager {
            return;
        }
        if let Some(backend) = &self.inner.sync {
            backend.unload_subset(options);
        }
    }

    /// Whether any subset load is still pending.
    pub fn is_loading_subset(&self) -> bool {
        self.inner.loading_subsets.get() > 0
    }

    // Indexes

    /// Create an index on `field`.
    pub fn create_index(&self, field: Vec<String>, options: IndexOptions) -> Result<IndexProxy> {
        let compare_options = options
            .compare_options
            .unwrap_or(self.inner.options.compare_options);
        let id: IndexId = self.inner.indexes.borrow_mut().next_id();
        let source: Weak<dyn IndexSource> = self.inner.weak_self.clone();
        let proxy = match options.resolver {
            IndexResolver::BTree => {
                let entries = self.inner.index_entries();
                IndexProxy::eager(id, field, compare_options, entries, source)?
            }
            IndexResolver::Deferred(loader) => {
                let proxy = IndexProxy::deferred(id, field, compare_options, loader, source);
                if self.is_ready() {
                    proxy.try_resolve_now();
                }
                proxy
            }
        };
        tracing::debug!(
            collection = %self.inner.id,
            index = id,
            field = %proxy.field().join("."),
            "index created"
        );
        self.inner.indexes.borrow_mut().insert(proxy.clone());
        Ok(proxy)
    }

    pub fn remove_index(&self, id: IndexId) -> bool {
        self.inner.indexes.borrow_mut().remove(id)
    }

    pub fn indexes(&self) -> Vec<IndexProxy> {
        self.inner.indexes.borrow().proxies().to_vec()
    }

    /// Whether some index (resolved or not) covers `field`.
    pub fn has_index_on(&self, field: &[String]) -> bool {
        self.inner
            .indexes
            .borrow()
            .proxies()
            .iter()
            .any(|p| p.matches_field(field))
    }

    /// A resolved index able to produce `options` ordering on `field`.
    pub fn index_for_order(&self, field: &[String], options: &CompareOptions) -> Option<IndexProxy> {
        self.inner.indexes.borrow().find_for_order(field, options)
    }

    // Subscriptions

    /// Subscribe to changes, starting sync if needed.
    pub fn subscribe_changes(
        &self,
        listener: impl Fn(&[ChangeMessage]) + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.ensure_usable()?;
        if let Some(where_) = &options.where_ {
            auto::ensure_indexes_for_expr(self, where_);
        }
        self.start_sync()?;
        let n = self.inner.next_subscription.get() + 1;
        self.inner.next_subscription.set(n);
        let subscription = Subscription::new(
            format!("{}:sub-{n}", self.inner.id),
            self,
            Rc::new(listener),
            options.where_,
        )?;
        self.inner.subscriptions.borrow_mut().push(subscription.clone());
        self.inner.lifecycle.borrow_mut().cancel_gc();
        if options.include_initial_state {
            subscription.request_snapshot(SnapshotRequest::default())?;
        }
        Ok(subscription)
    }

    pub(crate) fn remove_subscription(&self, id: &str) {
        let now_empty = {
            let mut subscriptions = self.inner.subscriptions.borrow_mut();
            subscriptions.retain(|s| s.id() != id);
            subscriptions.is_empty()
        };
        if now_empty {
            self.inner.lifecycle.borrow_mut().schedule_gc(Instant::now());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.borrow().len()
    }

    // Garbage collection

    /// Stop syncing and discard all state. Subscriptions are detached.
    pub fn cleanup(&self) -> Result<()> {
        if self.inner.sync_started.replace(false) {
            if let Some(backend) = &self.inner.sync {
                backend.cleanup();
            }
        }
        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.borrow_mut());
        for subscription in subscriptions {
            subscription.deactivate();
        }
        self.inner.state.borrow_mut().clear();
        for proxy in self.inner.indexes.borrow().proxies() {
            proxy.clear();
        }
        self.inner.deferred.borrow_mut().clear();
        self.inner.loading_subsets.set(0);
        {
            let mut lifecycle = self.inner.lifecycle.borrow_mut();
            lifecycle.transition(CollectionStatus::CleanedUp)?;
            lifecycle.reset_ready();
            lifecycle.cancel_gc();
        }
        tracing::info!(collection = %self.inner.id, "collection cleaned up");
        Ok(())
    }

    /// Clean up if the GC deadline has passed with no subscribers.
    pub fn collect_garbage(&self, now: Instant) -> Result<bool> {
        let due = self.subscriber_count() == 0 && self.inner.lifecycle.borrow().gc_due(now);
        if !due {
            return Ok(false);
        }
        tracing::info!(collection = %self.inner.id, "collection garbage collected");
        self.cleanup()?;
        Ok(true)
    }

    /// When GC is scheduled: a future that sleeps until the deadline, then
    /// collects if still due.
    pub fn gc_timer(&self) -> Option<impl Future<Output = Result<bool>>> {
        let deadline = self.inner.lifecycle.borrow().gc_deadline()?;
        let weak = self.downgrade();
        Some(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            match weak.upgrade() {
                Some(collection) => collection.collect_garbage(Instant::now()),
                None => Ok(false),
            }
        })
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("size", &self.inner.state.borrow().len())
            .field("subscriptions", &self.subscriber_count())
            .finish()
    }
}

/// Iterator returned by [`Collection::entries`].
pub struct Entries {
    collection: Collection,
    keys: std::vec::IntoIter<Key>,
}

impl Iterator for Entries {
    type Item = (Key, Value);

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            if let Some(value) = self.collection.peek(&key) {
                return Some((key, value));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.keys.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoIndex, CollectionConfig};
    use crate::query::ir::Expr;
    use futures::executor::block_on;
    use serde_json::json;

    fn local(config: CollectionConfig) -> Collection {
        let config = config
            .on_insert(|_| Box::pin(async { Ok(()) }))
            .on_update(|_| Box::pin(async { Ok(()) }))
            .on_delete(|_| Box::pin(async { Ok(()) }));
        Collection::new(config, Rc::new(TransactionRegistry::new()), Rc::new(Scheduler::new()))
            .unwrap()
    }

    fn hold(config: CollectionConfig) -> Collection {
        let config = config
            .on_insert(|_| Box::pin(futures::future::pending()))
            .on_update(|_| Box::pin(futures::future::pending()))
            .on_delete(|_| Box::pin(futures::future::pending()));
        Collection::new(config, Rc::new(TransactionRegistry::new()), Rc::new(Scheduler::new()))
            .unwrap()
    }

    #[test]
    fn optimistic_writes_are_visible_until_persisted() {
        let todos = hold(CollectionConfig::keyed_by("todos", "id"));
        let tx = todos.insert(json!({"id": "1", "done": false})).unwrap();
        assert_eq!(tx.state(), TransactionState::Persisting);
        assert_eq!(todos.get(&Key::from("1")).unwrap(), Some(json!({"id": "1", "done": false})));
        assert_eq!(todos.size().unwrap(), 1);
    }

    #[test]
    fn write_without_handler_fails() {
        let todos = Collection::new(
            CollectionConfig::keyed_by("todos", "id"),
            Rc::new(TransactionRegistry::new()),
            Rc::new(Scheduler::new()),
        )
        .unwrap();
        let err = todos.insert(json!({"id": 1})).unwrap_err();
        assert_eq!(
            err,
            Error::MissingMutationHandler {
                collection: "todos".into(),
                operation: "insert"
            }
        );
    }

    #[test]
    fn duplicate_and_missing_keys() {
        let todos = hold(CollectionConfig::keyed_by("todos", "id"));
        todos.insert(json!({"id": 1})).unwrap();
        assert!(matches!(todos.insert(json!({"id": 1})), Err(Error::DuplicateKey { .. })));
        assert!(matches!(
            todos.insert_many(vec![json!({"id": 2}), json!({"id": 2})]),
            Err(Error::DuplicateKey { .. })
        ));
        assert!(matches!(todos.update(9, |_| {}), Err(Error::KeyNotFound { .. })));
        assert!(matches!(todos.delete(9), Err(Error::KeyNotFound { .. })));
        assert_eq!(
            todos.update(1, |row| row["id"] = json!(5)).unwrap_err(),
            Error::KeyUpdateNotAllowed(Key::from(1))
        );
    }

    #[test]
    fn update_records_field_changes() {
        let todos = hold(CollectionConfig::keyed_by("todos", "id"));
        todos.insert(json!({"id": 1, "title": "a", "done": false})).unwrap();
        let tx = todos.update(1, |row| row["done"] = json!(true)).unwrap();
        let mutations = tx.mutations();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].changes, json!({"done": true}));
        assert_eq!(mutations[0].original, Some(json!({"id": 1, "title": "a", "done": false})));
    }

    #[test]
    fn noop_update_completes_immediately() {
        let todos = hold(CollectionConfig::keyed_by("todos", "id"));
        todos.insert(json!({"id": 1})).unwrap();
        let tx = todos.update(1, |_| {}).unwrap();
        assert_eq!(tx.state(), TransactionState::Completed);
    }

    #[test]
    fn local_collection_becomes_ready_on_subscribe() {
        let todos = local(CollectionConfig::keyed_by("todos", "id"));
        assert_eq!(todos.status(), CollectionStatus::Idle);
        let sub = todos.subscribe_changes(|_| {}, SubscribeOptions::default()).unwrap();
        assert!(todos.is_ready());
        sub.unsubscribe();
        assert_eq!(todos.subscriber_count(), 0);
    }

    #[test]
    fn on_demand_without_backend_errors() {
        let todos = local(
            CollectionConfig::keyed_by("todos", "id").sync_mode(SyncMode::OnDemand),
        );
        assert_eq!(todos.start_sync(), Err(Error::MissingSyncBackend("todos".into())));
        assert_eq!(todos.status(), CollectionStatus::Error);
        assert!(matches!(todos.get(&Key::from(1)), Err(Error::CollectionInError { .. })));
        todos.reset_error().unwrap();
        assert_eq!(todos.status(), CollectionStatus::Idle);
    }

    #[test]
    fn preload_resolves_when_ready() {
        let todos = local(CollectionConfig::keyed_by("todos", "id"));
        block_on(todos.preload()).unwrap();
        assert!(todos.is_ready());
    }

    #[test]
    fn where_uses_auto_index() {
        let todos = hold(CollectionConfig::keyed_by("todos", "id"));
        todos
            .insert_many(vec![
                json!({"id": 1, "done": true}),
                json!({"id": 2, "done": false}),
                json!({"id": 3, "done": true}),
            ])
            .unwrap();
        let done = Expr::func("eq", vec![Expr::prop(vec!["done".into()]), Expr::value(json!(true))]);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let _sub = todos
            .subscribe_changes(
                move |changes| s.borrow_mut().extend(changes.iter().map(|c| c.key.clone())),
                SubscribeOptions::default().with_where(done.clone()).with_initial_state(),
            )
            .unwrap();
        assert!(todos.has_index_on(&["done".to_string()]));
        assert_eq!(*seen.borrow(), vec![Key::from(1), Key::from(3)]);
        let keys: Vec<Key> = todos
            .current_state_as_changes(Some(&done))
            .unwrap()
            .into_iter()
            .map(|c| c.key)
            .collect();
        assert_eq!(keys, vec![Key::from(1), Key::from(3)]);
    }

    #[test]
    fn auto_index_off_creates_nothing() {
        let todos = hold(CollectionConfig::keyed_by("todos", "id").auto_index(AutoIndex::Off));
        let done = Expr::func("eq", vec![Expr::prop(vec!["done".into()]), Expr::value(json!(true))]);
        let _sub = todos
            .subscribe_changes(|_| {}, SubscribeOptions::default().with_where(done))
            .unwrap();
        assert!(todos.indexes().is_empty());
    }

    #[test]
    fn gc_after_last_subscriber_leaves() {
        let todos = local(CollectionConfig::keyed_by("todos", "id").gc_time_ms(10));
        let sub = todos.subscribe_changes(|_| {}, SubscribeOptions::default()).unwrap();
        assert!(!todos.collect_garbage(Instant::now()).unwrap());
        sub.unsubscribe();
        assert!(todos.gc_timer().is_some());
        let later = Instant::now() + std::time::Duration::from_millis(50);
        assert!(todos.collect_garbage(later).unwrap());
        assert_eq!(todos.status(), CollectionStatus::CleanedUp);
        // Syncing again restarts from loading.
        todos.start_sync().unwrap();
        assert!(todos.is_ready());
    }

    #[test]
    fn entries_skip_rows_removed_mid_iteration() {
        let todos = hold(CollectionConfig::keyed_by("todos", "id"));
        todos.insert_many(vec![json!({"id": 1}), json!({"id": 2})]).unwrap();
        let mut entries = todos.entries().unwrap();
        todos.delete(2).unwrap();
        assert_eq!(entries.next().map(|(k, _)| k), Some(Key::from(1)));
        assert_eq!(entries.next(), None);
    }
}
