//! Error types for the Reflow engine.

use crate::key::Key;
use crate::lifecycle::CollectionStatus;
use thiserror::Error;

/// All possible errors from the Reflow engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Configuration errors
    #[error("transaction requires a mutation function")]
    MissingMutationFn,

    #[error("collection '{0}' uses on-demand sync but its backend has no load_subset handler")]
    MissingLoadSubsetHandler(String),

    #[error("collection '{collection}' has no {operation} handler and no ambient transaction")]
    MissingMutationHandler {
        collection: String,
        operation: &'static str,
    },

    #[error("collection '{0}' has no sync backend")]
    MissingSyncBackend(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Sync protocol violations
    #[error("no pending sync transaction in collection '{0}'; call begin() first")]
    NoPendingSyncTransaction(String),

    #[error("sync transaction in collection '{0}' is already committed")]
    SyncTransactionAlreadyCommitted(String),

    #[error("cannot insert duplicate key {key} from sync into collection '{collection}'")]
    DuplicateKeySync { collection: String, key: Key },

    // Transaction state errors
    #[error("transaction {id} is not pending (state: {state})")]
    TransactionNotPending { id: String, state: String },

    #[error("transaction {0} is already completed and cannot be rolled back")]
    TransactionAlreadyCompleted(String),

    #[error("mutation function failed: {0}")]
    MutationFailed(String),

    // Collection write errors
    #[error("key {key} already exists in collection '{collection}'")]
    DuplicateKey { collection: String, key: Key },

    #[error("key {key} not found in collection '{collection}'")]
    KeyNotFound { collection: String, key: Key },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("update changed the key of {0}; keys are immutable")]
    KeyUpdateNotAllowed(Key),

    // Lifecycle errors
    #[error("invalid status transition for collection '{collection}': {from} -> {to}")]
    InvalidStatusTransition {
        collection: String,
        from: CollectionStatus,
        to: CollectionStatus,
    },

    #[error("collection '{collection}' is in error state: {reason}")]
    CollectionInError { collection: String, reason: String },

    #[error("collection '{0}' has been cleaned up")]
    CollectionCleanedUp(String),

    // Query shape errors
    #[error("limit and offset require an order_by clause")]
    LimitWithoutOrderBy,

    #[error("having requires a group_by clause or aggregate select")]
    HavingWithoutGroupBy,

    #[error("alias '{0}' is used more than once across query scopes")]
    DuplicateAlias(String),

    #[error("unknown alias '{0}' in expression")]
    UnknownAlias(String),

    #[error("unsupported join: {0}")]
    UnsupportedJoin(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    // Scheduler errors
    #[error("scheduler detected a dependency cycle in context {context}: {jobs:?}")]
    SchedulerCycle { context: String, jobs: Vec<String> },

    // Index errors
    #[error("index {0} is not ready yet")]
    IndexNotReady(u32),

    #[error("failed to evaluate index expression for key {key}: {reason}")]
    IndexEvaluation { key: Key, reason: String },

    #[error("index resolution failed: {0}")]
    IndexResolution(String),

    #[error("no index supports ordering by '{0}'")]
    MissingOrderIndex(String),

    // Subset loading
    #[error("load_subset failed: {0}")]
    LoadSubset(String),
}

impl Error {
    /// Whether this error belongs to the sync protocol-violation family.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::NoPendingSyncTransaction(_)
                | Error::SyncTransactionAlreadyCommitted(_)
                | Error::DuplicateKeySync { .. }
        )
    }

    /// Whether this error was raised while compiling a query.
    pub fn is_query_shape(&self) -> bool {
        matches!(
            self,
            Error::LimitWithoutOrderBy
                | Error::HavingWithoutGroupBy
                | Error::DuplicateAlias(_)
                | Error::UnknownAlias(_)
                | Error::UnsupportedJoin(_)
                | Error::UnknownFunction(_)
                | Error::InvalidExpression(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::NoPendingSyncTransaction("todos".into());
        assert_eq!(
            err.to_string(),
            "no pending sync transaction in collection 'todos'; call begin() first"
        );

        let err = Error::DuplicateKeySync {
            collection: "todos".into(),
            key: Key::from("1"),
        };
        assert_eq!(
            err.to_string(),
            "cannot insert duplicate key \"1\" from sync into collection 'todos'"
        );

        let err = Error::InvalidStatusTransition {
            collection: "todos".into(),
            from: CollectionStatus::Ready,
            to: CollectionStatus::Loading,
        };
        assert_eq!(
            err.to_string(),
            "invalid status transition for collection 'todos': ready -> loading"
        );
    }

    #[test]
    fn error_families() {
        assert!(Error::SyncTransactionAlreadyCommitted("c".into()).is_protocol_violation());
        assert!(!Error::LimitWithoutOrderBy.is_protocol_violation());
        assert!(Error::DuplicateAlias("t".into()).is_query_shape());
    }
}
