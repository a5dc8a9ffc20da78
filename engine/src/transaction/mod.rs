//! Transactions group optimistic mutations into one atomic, retryable unit.
//!
//! While a transaction is pending its mutations overlay the synced state of
//! every collection they touch. Committing runs the user's mutation function;
//! failure rolls the transaction back and cascades to every other pending
//! transaction that wrote one of the same keys.

pub mod mutation;
pub mod registry;
pub mod scheduler;

pub use mutation::{diff_changes, merge_pending, PendingMutation};
pub use registry::{TransactionOrder, TransactionRegistry};
pub use scheduler::{Dependency, ScheduleRequest, Scheduler};

use crate::collection::Collection;
use crate::config::{MutationFn, TransactionConfig};
use crate::error::{Error, Result};
use crate::task::{Deferred, Resolver};
use chrono::{DateTime, Utc};
use futures::future::{self, LocalBoxFuture};
use futures::task::noop_waker_ref;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Pending,
    Persisting,
    Completed,
    Failed,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Completed | TransactionState::Failed)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Pending => "pending",
            TransactionState::Persisting => "persisting",
            TransactionState::Completed => "completed",
            TransactionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

struct TransactionInner {
    id: String,
    created_at: DateTime<Utc>,
    sequence_number: u64,
    auto_commit: bool,
    metadata: Option<Value>,
    state: Cell<TransactionState>,
    mutations: RefCell<Vec<PendingMutation>>,
    mutation_fn: MutationFn,
    error: RefCell<Option<Error>>,
    persisted: Deferred<()>,
    resolver: RefCell<Option<Resolver<()>>>,
    in_flight: RefCell<Option<LocalBoxFuture<'static, Result<()>>>>,
    registry: Weak<TransactionRegistry>,
    scheduler: Weak<Scheduler>,
}

/// Handle to a transaction. Clones share state.
#[derive(Clone)]
pub struct Transaction {
    inner: Rc<TransactionInner>,
}

impl Transaction {
    pub(crate) fn new(
        config: TransactionConfig,
        registry: &Rc<TransactionRegistry>,
        scheduler: &Rc<Scheduler>,
    ) -> Result<Self> {
        let mutation_fn = config.mutation_fn.ok_or(Error::MissingMutationFn)?;
        let (persisted, resolver) = Deferred::new();
        let transaction = Self {
            inner: Rc::new(TransactionInner {
                id: config
                    .id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                created_at: Utc::now(),
                sequence_number: registry.next_sequence(),
                auto_commit: config.auto_commit,
                metadata: config.metadata,
                state: Cell::new(TransactionState::Pending),
                mutations: RefCell::new(Vec::new()),
                mutation_fn,
                error: RefCell::new(None),
                persisted,
                resolver: RefCell::new(Some(resolver)),
                in_flight: RefCell::new(None),
                registry: Rc::downgrade(registry),
                scheduler: Rc::downgrade(scheduler),
            }),
        };
        registry.register(&transaction);
        Ok(transaction)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> TransactionState {
        self.inner.state.get()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn sequence_number(&self) -> u64 {
        self.inner.sequence_number
    }

    pub fn order(&self) -> TransactionOrder {
        (self.inner.created_at, self.inner.sequence_number)
    }

    pub fn auto_commit(&self) -> bool {
        self.inner.auto_commit
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.inner.metadata.as_ref()
    }

    /// Snapshot of the merged mutations.
    pub fn mutations(&self) -> Vec<PendingMutation> {
        self.inner.mutations.borrow().clone()
    }

    /// Borrow the mutations without cloning.
    pub fn with_mutations<R>(&self, f: impl FnOnce(&[PendingMutation]) -> R) -> R {
        f(&self.inner.mutations.borrow())
    }

    /// The error that failed this transaction, if any.
    pub fn error(&self) -> Option<Error> {
        self.inner.error.borrow().clone()
    }

    /// Settles when the transaction completes (`Ok`) or fails (`Err`).
    pub fn is_persisted(&self) -> Deferred<()> {
        self.inner.persisted.clone()
    }

    pub fn global_keys(&self) -> Vec<String> {
        self.with_mutations(|mutations| mutations.iter().map(|m| m.global_key.clone()).collect())
    }

    pub(crate) fn touches_any(&self, keys: &[String]) -> bool {
        self.with_mutations(|mutations| mutations.iter().any(|m| keys.contains(&m.global_key)))
    }

    /// Whether this transaction has a mutation for `collection_id`.
    pub fn touches_collection(&self, collection_id: &str) -> bool {
        self.with_mutations(|mutations| mutations.iter().any(|m| m.collection_id == collection_id))
    }

    fn ensure_pending(&self) -> Result<()> {
        match self.state() {
            TransactionState::Pending => Ok(()),
            state => Err(Error::TransactionNotPending {
                id: self.inner.id.clone(),
                state: state.to_string(),
            }),
        }
    }

    /// Run `f` with this transaction ambient: collection writes made inside
    /// join it. Work scheduled under this transaction is flushed afterwards,
    /// and the transaction starts committing if it auto-commits.
    ///
    /// The optimistic changes are visible as soon as this returns; await
    /// [`Transaction::commit`] or [`Transaction::is_persisted`] for the
    /// outcome of persisting them.
    pub fn mutate(&self, f: impl FnOnce() -> Result<()>) -> Result<()> {
        self.ensure_pending()?;
        let registry = self.inner.registry.upgrade();
        if let Some(registry) = &registry {
            registry.push_ambient(self.clone());
        }
        let outcome = f();
        if let Some(registry) = &registry {
            registry.pop_ambient(&self.inner.id);
        }
        let flushed = match self.inner.scheduler.upgrade() {
            Some(scheduler) => scheduler.flush(&self.inner.id),
            None => Ok(()),
        };
        outcome?;
        flushed?;
        if self.inner.auto_commit {
            self.start_commit();
        }
        Ok(())
    }

    /// Add mutations, merging with existing ones on the same global key.
    pub(crate) fn apply_mutations(&self, incoming: Vec<PendingMutation>) -> Result<()> {
        self.ensure_pending()?;
        let mut mutations = self.inner.mutations.borrow_mut();
        for mutation in incoming {
            match mutations
                .iter()
                .position(|m| m.global_key == mutation.global_key)
            {
                Some(pos) => match merge_pending(&mutations[pos], mutation) {
                    Some(merged) => mutations[pos] = merged,
                    None => {
                        mutations.remove(pos);
                    }
                },
                None => mutations.push(mutation),
            }
        }
        Ok(())
    }

    /// Persist the transaction.
    ///
    /// With no mutations this completes immediately. A transaction whose
    /// commit was already started resumes or awaits that commit.
    pub fn commit(&self) -> LocalBoxFuture<'static, Result<()>> {
        if let Some(in_flight) = self.inner.in_flight.borrow_mut().take() {
            return in_flight;
        }
        match self.state() {
            TransactionState::Pending => {
                let transaction = self.clone();
                Box::pin(async move { transaction.run_commit().await })
            }
            TransactionState::Persisting => Box::pin(self.is_persisted()),
            state => Box::pin(future::ready(Err(Error::TransactionNotPending {
                id: self.inner.id.clone(),
                state: state.to_string(),
            }))),
        }
    }

    /// Begin committing and poll once. A mutation function that does not
    /// finish synchronously is parked until the next [`Transaction::commit`].
    pub(crate) fn start_commit(&self) {
        let mut commit = self.commit();
        let mut cx = Context::from_waker(noop_waker_ref());
        match commit.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => {
                tracing::warn!(transaction = %self.inner.id, error = %e, "automatic commit failed");
            }
            Poll::Pending => {
                *self.inner.in_flight.borrow_mut() = Some(commit);
            }
        }
    }

    async fn run_commit(self) -> Result<()> {
        self.ensure_pending()?;
        if self.inner.mutations.borrow().is_empty() {
            self.inner.state.set(TransactionState::Completed);
            self.finish(Ok(()));
            return Ok(());
        }
        self.inner.state.set(TransactionState::Persisting);
        tracing::debug!(
            transaction = %self.inner.id,
            mutations = self.inner.mutations.borrow().len(),
            "persisting transaction"
        );
        let persist = (self.inner.mutation_fn)(self.clone());
        match persist.await {
            Ok(()) => {
                if self.state() == TransactionState::Failed {
                    return Err(self.error().unwrap_or(Error::MutationFailed(
                        "transaction was rolled back while persisting".into(),
                    )));
                }
                self.inner.state.set(TransactionState::Completed);
                tracing::debug!(transaction = %self.inner.id, "transaction completed");
                self.touch_collections();
                self.finish(Ok(()));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(transaction = %self.inner.id, error = %e, "mutation function failed");
                self.fail(e.clone(), true);
                Err(e)
            }
        }
    }

    /// Roll back: the transaction fails and every other pending transaction
    /// writing one of its keys is rolled back with it.
    pub fn rollback(&self) -> Result<()> {
        match self.state() {
            TransactionState::Completed => {
                Err(Error::TransactionAlreadyCompleted(self.inner.id.clone()))
            }
            TransactionState::Failed => Ok(()),
            _ => {
                self.fail(
                    Error::MutationFailed(format!("transaction {} was rolled back", self.inner.id)),
                    true,
                );
                Ok(())
            }
        }
    }

    fn fail(&self, error: Error, cascade: bool) {
        self.inner.state.set(TransactionState::Failed);
        self.inner
            .error
            .borrow_mut()
            .get_or_insert_with(|| error.clone());
        tracing::debug!(transaction = %self.inner.id, cascade, "transaction rolled back");
        if cascade {
            if let Some(registry) = self.inner.registry.upgrade() {
                let keys = self.global_keys();
                for other in registry.conflicting(&self.inner.id, &keys) {
                    other.fail(
                        Error::MutationFailed(format!(
                            "rolled back together with conflicting transaction {}",
                            self.inner.id
                        )),
                        false,
                    );
                }
            }
        }
        self.touch_collections();
        self.finish(Err(error));
    }

    fn finish(&self, outcome: Result<()>) {
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.unregister(self);
        }
        if let Some(resolver) = self.inner.resolver.borrow_mut().take() {
            resolver.settle(outcome);
        }
    }

    /// Let every collection this transaction wrote to reconcile its state.
    fn touch_collections(&self) {
        let mut collections: Vec<Collection> = Vec::new();
        self.with_mutations(|mutations| {
            for mutation in mutations {
                if let Some(collection) = mutation.collection.upgrade() {
                    if !collections.iter().any(|c| c.id() == collection.id()) {
                        collections.push(collection);
                    }
                }
            }
        });
        for collection in collections {
            collection.on_transaction_state_change(self);
        }
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("mutations", &self.inner.mutations.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn setup() -> (Rc<TransactionRegistry>, Rc<Scheduler>) {
        (Rc::new(TransactionRegistry::new()), Rc::new(Scheduler::new()))
    }

    #[test]
    fn requires_mutation_fn() {
        let (registry, scheduler) = setup();
        let err = Transaction::new(TransactionConfig::default(), &registry, &scheduler).unwrap_err();
        assert_eq!(err, Error::MissingMutationFn);
    }

    #[test]
    fn empty_commit_completes() {
        let (registry, scheduler) = setup();
        let tx = Transaction::new(
            TransactionConfig::new(|_| Box::pin(async { Ok(()) })),
            &registry,
            &scheduler,
        )
        .unwrap();
        assert_eq!(registry.pending().len(), 1);
        block_on(tx.commit()).unwrap();
        assert_eq!(tx.state(), TransactionState::Completed);
        assert!(registry.pending().is_empty());
        assert_eq!(tx.is_persisted().outcome(), Some(Ok(())));
        assert!(matches!(
            block_on(tx.commit()),
            Err(Error::TransactionNotPending { .. })
        ));
    }

    #[test]
    fn transactions_are_totally_ordered() {
        let (registry, scheduler) = setup();
        let config = TransactionConfig::new(|_| Box::pin(async { Ok(()) }));
        let a = Transaction::new(config.clone(), &registry, &scheduler).unwrap();
        let b = Transaction::new(config, &registry, &scheduler).unwrap();
        assert!(a.order() < b.order());
        assert_eq!(registry.pending(), vec![a, b]);
    }

    #[test]
    fn rollback_of_completed_transaction_fails() {
        let (registry, scheduler) = setup();
        let tx = Transaction::new(
            TransactionConfig::new(|_| Box::pin(async { Ok(()) })),
            &registry,
            &scheduler,
        )
        .unwrap();
        block_on(tx.commit()).unwrap();
        assert_eq!(
            tx.rollback(),
            Err(Error::TransactionAlreadyCompleted(tx.id().to_string()))
        );
    }

    #[test]
    fn ambient_transaction_during_mutate() {
        let (registry, scheduler) = setup();
        let tx = Transaction::new(
            TransactionConfig::new(|_| Box::pin(async { Ok(()) })).manual_commit(),
            &registry,
            &scheduler,
        )
        .unwrap();
        let seen = Rc::new(RefCell::new(None));
        let r = Rc::clone(&registry);
        let s = Rc::clone(&seen);
        tx.mutate(move || {
            *s.borrow_mut() = r.active().map(|t| t.id().to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.borrow().as_deref(), Some(tx.id()));
        assert!(registry.active().is_none());
        assert_eq!(tx.state(), TransactionState::Pending);
    }
}
