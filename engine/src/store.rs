//! Store - the root that wires collections, transactions and queries.
//!
//! A store owns the transaction registry and the scheduler shared by
//! everything it creates. Separate stores are fully isolated, which keeps
//! tests independent of one another.

use crate::collection::Collection;
use crate::config::{CollectionConfig, TransactionConfig};
use crate::error::{Error, Result};
use crate::query::ir::QueryIr;
use crate::query::live::LiveQuery;
use crate::transaction::{Scheduler, Transaction, TransactionRegistry};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

#[derive(Default)]
pub struct Store {
    registry: Rc<TransactionRegistry>,
    scheduler: Rc<Scheduler>,
    collections: RefCell<HashMap<String, Collection>>,
    next_query: Cell<u64>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a collection. Sync starts right away when the
    /// config asks for it, otherwise on first subscription.
    pub fn create_collection(&self, config: CollectionConfig) -> Result<Collection> {
        let id = config.options.id.clone();
        if self.collections.borrow().contains_key(&id) {
            return Err(Error::InvalidConfig(format!("collection '{id}' already exists")));
        }
        let start = config.options.start_sync;
        let collection = Collection::new(
            config,
            Rc::clone(&self.registry),
            Rc::clone(&self.scheduler),
        )?;
        self.collections.borrow_mut().insert(id, collection.clone());
        if start {
            collection.start_sync()?;
        }
        Ok(collection)
    }

    /// Look up a collection by id.
    pub fn collection(&self, id: &str) -> Option<Collection> {
        self.collections.borrow().get(id).cloned()
    }

    /// Forget a collection after cleaning it up.
    pub fn remove_collection(&self, id: &str) -> Result<bool> {
        let removed = self.collections.borrow_mut().remove(id);
        match removed {
            Some(collection) => {
                collection.cleanup()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Create a transaction for explicit, possibly multi-collection,
    /// mutations.
    pub fn create_transaction(&self, config: TransactionConfig) -> Result<Transaction> {
        Transaction::new(config, &self.registry, &self.scheduler)
    }

    /// Compile `query` and keep its results up to date.
    pub fn live_query(&self, query: impl Into<QueryIr>) -> Result<LiveQuery> {
        let n = self.next_query.get() + 1;
        self.next_query.set(n);
        LiveQuery::new(format!("query-{n}"), &query.into(), &self.registry, &self.scheduler)
    }

    pub fn registry(&self) -> &Rc<TransactionRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Rc<Scheduler> {
        &self.scheduler
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<String> = self.collections.borrow().keys().cloned().collect();
        ids.sort();
        f.debug_struct("Store").field("collections", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::{eq, prop, val, Query};
    use serde_json::json;

    fn todos(store: &Store) -> Collection {
        store
            .create_collection(
                CollectionConfig::keyed_by("todos", "id")
                    .on_insert(|_| Box::pin(async { Ok(()) }))
                    .on_update(|_| Box::pin(async { Ok(()) })),
            )
            .unwrap()
    }

    #[test]
    fn duplicate_collection_ids_are_rejected() {
        let store = Store::new();
        todos(&store);
        let err = store
            .create_collection(CollectionConfig::keyed_by("todos", "id"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(store.collection("todos").is_some());
    }

    #[test]
    fn live_query_follows_writes() {
        let store = Store::new();
        let c = todos(&store);
        c.insert(json!({"id": 1, "done": false})).unwrap();
        let open = store
            .live_query(Query::from_collection("t", &c).where_(eq(prop("t.done"), val(false))))
            .unwrap();
        assert_eq!(open.results(), vec![json!({"id": 1, "done": false})]);

        c.insert(json!({"id": 2, "done": false})).unwrap();
        assert_eq!(open.len(), 2);
        c.update(1, |row| row["done"] = json!(true)).unwrap();
        assert_eq!(open.results(), vec![json!({"id": 2, "done": false})]);
    }

    #[test]
    fn stores_are_isolated() {
        let a = Store::new();
        let b = Store::new();
        todos(&a);
        assert!(b.collection("todos").is_none());
        assert!(!Rc::ptr_eq(a.registry(), b.registry()));
    }
}
