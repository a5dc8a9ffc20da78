//! Registry of live transactions and the ambient transaction stack.

use super::{Transaction, TransactionState};
use chrono::{DateTime, Utc};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

/// Total order of transactions: creation time, then sequence number.
pub type TransactionOrder = (DateTime<Utc>, u64);

/// Tracks pending transactions and which transaction is currently ambient.
///
/// One registry is shared by everything created from the same
/// [`crate::Store`].
#[derive(Default)]
pub struct TransactionRegistry {
    pending: RefCell<BTreeMap<TransactionOrder, Transaction>>,
    ambient: RefCell<Vec<Transaction>>,
    sequence: Cell<u64>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        let next = self.sequence.get() + 1;
        self.sequence.set(next);
        next
    }

    pub(crate) fn register(&self, transaction: &Transaction) {
        self.pending
            .borrow_mut()
            .insert(transaction.order(), transaction.clone());
    }

    pub(crate) fn unregister(&self, transaction: &Transaction) {
        self.pending.borrow_mut().remove(&transaction.order());
    }

    /// Transactions that have not reached a terminal state, oldest first.
    pub fn pending(&self) -> Vec<Transaction> {
        self.pending
            .borrow()
            .values()
            .filter(|tx| !tx.state().is_terminal())
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Transaction> {
        self.pending
            .borrow()
            .values()
            .find(|tx| tx.id() == id)
            .cloned()
    }

    /// The transaction collection writes currently join, if any.
    pub fn active(&self) -> Option<Transaction> {
        self.ambient.borrow().last().cloned()
    }

    pub(crate) fn push_ambient(&self, transaction: Transaction) {
        self.ambient.borrow_mut().push(transaction);
    }

    pub(crate) fn pop_ambient(&self, id: &str) {
        let mut ambient = self.ambient.borrow_mut();
        if let Some(pos) = ambient.iter().rposition(|tx| tx.id() == id) {
            ambient.remove(pos);
        }
    }

    /// Pending transactions other than `except` that write any of `keys`.
    pub(crate) fn conflicting(&self, except: &str, keys: &[String]) -> Vec<Transaction> {
        self.pending()
            .into_iter()
            .filter(|tx| tx.id() != except && tx.state() == TransactionState::Pending)
            .filter(|tx| tx.touches_any(keys))
            .collect()
    }
}

impl std::fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("pending", &self.pending.borrow().len())
            .field("ambient", &self.ambient.borrow().len())
            .finish()
    }
}
