//! Index handles with deferred construction.
//!
//! A collection never hands out indexes directly. [`IndexProxy`] is a cheap
//! clonable handle that either wraps a built index or a loader that resolves
//! to one later. Until resolution completes every query on the proxy fails
//! with [`Error::IndexNotReady`]; resolution failures are logged and leave the
//! proxy unresolved.

use super::{BTreeIndex, Index, IndexId, IndexOperation, IndexRead, IndexStats};
use crate::change::ChangeMessage;
use crate::compare::CompareOptions;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::task::{Deferred, Resolver};
use futures::future::LocalBoxFuture;
use futures::task::noop_waker_ref;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

/// Index implementations a resolver can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    BTree,
}

/// Asynchronous factory for an index implementation.
pub type IndexLoader = Box<dyn FnOnce() -> LocalBoxFuture<'static, Result<IndexKind>>>;

/// How an index gets its implementation.
pub enum IndexResolver {
    /// Build a [`BTreeIndex`] immediately.
    BTree,
    /// Resolve through a loader on first sync or on demand.
    Deferred(IndexLoader),
}

impl Default for IndexResolver {
    fn default() -> Self {
        IndexResolver::BTree
    }
}

impl fmt::Debug for IndexResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexResolver::BTree => f.write_str("BTree"),
            IndexResolver::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Provides the rows an index is built from.
pub trait IndexSource {
    fn index_entries(&self) -> Vec<(Key, Value)>;
}

enum ResolvedIndex {
    BTree(BTreeIndex),
}

impl ResolvedIndex {
    fn build(kind: IndexKind, id: IndexId, field: &[String], options: CompareOptions) -> Self {
        match kind {
            IndexKind::BTree => ResolvedIndex::BTree(BTreeIndex::new(id, field.to_vec(), options)),
        }
    }

    fn read(&self) -> &dyn IndexRead {
        match self {
            ResolvedIndex::BTree(index) => index,
        }
    }

    fn write(&mut self) -> &mut dyn Index {
        match self {
            ResolvedIndex::BTree(index) => index,
        }
    }
}

enum Slot {
    Pending {
        loader: Option<IndexLoader>,
        in_flight: Option<LocalBoxFuture<'static, Result<IndexKind>>>,
    },
    Ready(ResolvedIndex),
    Failed(Error),
}

struct ProxyInner {
    id: IndexId,
    field: Vec<String>,
    options: CompareOptions,
    slot: RefCell<Slot>,
    source: Weak<dyn IndexSource>,
    ready: Deferred<()>,
    ready_resolver: RefCell<Option<Resolver<()>>>,
}

/// Handle to a (possibly unresolved) index.
#[derive(Clone)]
pub struct IndexProxy {
    inner: Rc<ProxyInner>,
}

impl IndexProxy {
    fn with_slot(
        id: IndexId,
        field: Vec<String>,
        options: CompareOptions,
        slot: Slot,
        source: Weak<dyn IndexSource>,
    ) -> Self {
        let (ready, resolver) = Deferred::new();
        let resolved = matches!(slot, Slot::Ready(_));
        let proxy = Self {
            inner: Rc::new(ProxyInner {
                id,
                field,
                options: options.physical(),
                slot: RefCell::new(slot),
                source,
                ready,
                ready_resolver: RefCell::new(Some(resolver)),
            }),
        };
        if resolved {
            proxy.settle(Ok(()));
        }
        proxy
    }

    /// A proxy over an index built from `entries` right away.
    pub(crate) fn eager(
        id: IndexId,
        field: Vec<String>,
        options: CompareOptions,
        entries: Vec<(Key, Value)>,
        source: Weak<dyn IndexSource>,
    ) -> Result<Self> {
        let mut index = ResolvedIndex::build(IndexKind::BTree, id, &field, options);
        index
            .write()
            .build(&mut entries.iter().map(|(k, v)| (k, v)))?;
        Ok(Self::with_slot(id, field, options, Slot::Ready(index), source))
    }

    /// A proxy waiting on `loader`.
    pub(crate) fn deferred(
        id: IndexId,
        field: Vec<String>,
        options: CompareOptions,
        loader: IndexLoader,
        source: Weak<dyn IndexSource>,
    ) -> Self {
        let slot = Slot::Pending {
            loader: Some(loader),
            in_flight: None,
        };
        Self::with_slot(id, field, options, slot, source)
    }

    pub fn id(&self) -> IndexId {
        self.inner.id
    }

    pub fn field(&self) -> &[String] {
        &self.inner.field
    }

    /// Options of the physical (ascending) index.
    pub fn compare_options(&self) -> &CompareOptions {
        &self.inner.options
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.slot.borrow(), Slot::Ready(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.inner.slot.borrow(), Slot::Failed(_))
    }

    pub fn matches_field(&self, path: &[String]) -> bool {
        self.inner.field == path
    }

    /// Whether walking this index forwards or backwards yields `options`.
    pub fn matches_order(&self, options: &CompareOptions) -> bool {
        self.inner.options == options.physical()
    }

    pub fn supports(&self, op: IndexOperation) -> Result<bool> {
        self.with_read(|index| index.supports(op))
    }

    pub fn stats(&self) -> Result<IndexStats> {
        self.with_read(|index| index.stats())
    }

    pub fn lookup(&self, op: IndexOperation, value: &Value) -> Result<BTreeSet<Key>> {
        self.with_read(|index| index.lookup(op, value))
    }

    /// Run `f` against the resolved index.
    pub fn with_read<R>(&self, f: impl FnOnce(&dyn IndexRead) -> R) -> Result<R> {
        match &*self.inner.slot.borrow() {
            Slot::Ready(index) => Ok(f(index.read())),
            _ => Err(Error::IndexNotReady(self.inner.id)),
        }
    }

    /// Feed collection changes to the index if it is resolved.
    pub(crate) fn apply_changes(&self, changes: &[ChangeMessage]) -> Result<()> {
        if let Slot::Ready(index) = &mut *self.inner.slot.borrow_mut() {
            index.write().apply_changes(changes)?;
        }
        Ok(())
    }

    /// Drop all entries, keeping the index resolved.
    pub(crate) fn clear(&self) {
        if let Slot::Ready(index) = &mut *self.inner.slot.borrow_mut() {
            index.write().clear();
        }
    }

    fn take_future(&self) -> Option<LocalBoxFuture<'static, Result<IndexKind>>> {
        match &mut *self.inner.slot.borrow_mut() {
            Slot::Pending { loader, in_flight } => {
                in_flight.take().or_else(|| loader.take().map(|load| load()))
            }
            _ => None,
        }
    }

    /// Start resolution and poll it once. A loader that is not immediately
    /// ready stays parked until someone awaits [`IndexProxy::when_ready`].
    pub(crate) fn try_resolve_now(&self) {
        let Some(mut fut) = self.take_future() else {
            return;
        };
        let mut cx = Context::from_waker(noop_waker_ref());
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(outcome) => {
                let _ = self.install(outcome);
            }
            Poll::Pending => {
                if let Slot::Pending { in_flight, .. } = &mut *self.inner.slot.borrow_mut() {
                    *in_flight = Some(fut);
                }
            }
        }
    }

    /// Resolve the index, driving the loader if nobody else is.
    pub fn when_ready(&self) -> LocalBoxFuture<'static, Result<()>> {
        let proxy = self.clone();
        Box::pin(async move {
            if let Some(failure) = proxy.failure() {
                return Err(failure);
            }
            match proxy.take_future() {
                Some(fut) => {
                    let outcome = fut.await;
                    proxy.install(outcome)
                }
                None => proxy.inner.ready.clone().await,
            }
        })
    }

    fn failure(&self) -> Option<Error> {
        match &*self.inner.slot.borrow() {
            Slot::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    fn install(&self, outcome: Result<IndexKind>) -> Result<()> {
        let built = outcome.and_then(|kind| {
            let mut index =
                ResolvedIndex::build(kind, self.inner.id, &self.inner.field, self.inner.options);
            let entries = self
                .inner
                .source
                .upgrade()
                .map(|source| source.index_entries())
                .unwrap_or_default();
            index
                .write()
                .build(&mut entries.iter().map(|(k, v)| (k, v)))?;
            Ok(index)
        });
        match built {
            Ok(index) => {
                *self.inner.slot.borrow_mut() = Slot::Ready(index);
                tracing::debug!(index = self.inner.id, "index resolved");
                self.settle(Ok(()));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(index = self.inner.id, error = %e, "index resolution failed");
                let error = Error::IndexResolution(e.to_string());
                *self.inner.slot.borrow_mut() = Slot::Failed(error.clone());
                self.settle(Err(error.clone()));
                Err(error)
            }
        }
    }

    fn settle(&self, outcome: Result<()>) {
        if let Some(resolver) = self.inner.ready_resolver.borrow_mut().take() {
            resolver.settle(outcome);
        }
    }
}

impl fmt::Debug for IndexProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexProxy")
            .field("id", &self.inner.id)
            .field("field", &self.inner.field)
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use serde_json::json;

    struct Rows(Vec<(Key, Value)>);

    impl IndexSource for Rows {
        fn index_entries(&self) -> Vec<(Key, Value)> {
            self.0.clone()
        }
    }

    fn rows() -> Rc<dyn IndexSource> {
        Rc::new(Rows(vec![
            (Key::from(1), json!({"age": 30})),
            (Key::from(2), json!({"age": 40})),
        ]))
    }

    #[test]
    fn deferred_index_rejects_queries_until_resolved() {
        let source = rows();
        let (gate, open) = Deferred::<()>::new();
        let loader: IndexLoader = Box::new(move || {
            Box::pin(async move {
                gate.await?;
                Ok(IndexKind::BTree)
            })
        });
        let proxy = IndexProxy::deferred(
            7,
            vec!["age".into()],
            CompareOptions::default(),
            loader,
            Rc::downgrade(&source),
        );
        proxy.try_resolve_now();
        assert_eq!(proxy.supports(IndexOperation::Eq), Err(Error::IndexNotReady(7)));

        open.resolve(());
        block_on(proxy.when_ready()).unwrap();
        assert!(proxy.is_ready());
        assert_eq!(proxy.lookup(IndexOperation::Gt, &json!(35)).unwrap().len(), 1);
        assert_eq!(proxy.stats().unwrap().entry_count, 2);
    }

    #[test]
    fn failed_resolution_leaves_index_unresolved() {
        let source = rows();
        let loader: IndexLoader =
            Box::new(|| Box::pin(async { Err(Error::IndexResolution("offline".into())) }));
        let proxy = IndexProxy::deferred(
            1,
            vec!["age".into()],
            CompareOptions::default(),
            loader,
            Rc::downgrade(&source),
        );
        proxy.try_resolve_now();
        assert!(proxy.is_failed());
        assert!(block_on(proxy.when_ready()).is_err());
        assert!(proxy.stats().is_err());
    }

    #[test]
    fn order_matching_uses_physical_options() {
        let source = rows();
        let proxy = IndexProxy::eager(
            1,
            vec!["age".into()],
            CompareOptions::default(),
            source.index_entries(),
            Rc::downgrade(&source),
        )
        .unwrap();
        assert!(proxy.matches_order(&CompareOptions::default()));
        // Descending with nulls first walks an ascending nulls-last index.
        assert!(!proxy.matches_order(&CompareOptions::desc()));
        assert!(proxy.matches_order(
            &CompareOptions::desc().with_nulls(crate::compare::NullsOrder::Last)
        ));
        assert!(proxy.matches_field(&["age".to_string()]));
    }
}
