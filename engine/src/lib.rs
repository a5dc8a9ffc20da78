//! # Reflow Engine
//!
//! Reactive collections with optimistic mutations and incremental live
//! queries for local-first applications.
//!
//! A [`Collection`] keeps rows synchronized from a [`SyncBackend`] and layers
//! uncommitted local writes on top of them. Writes are grouped into
//! [`Transaction`]s that persist through a user-supplied mutation function
//! and roll back, cascading to conflicting transactions, when it fails.
//! [`LiveQuery`]s compile a typed query into an incremental dataflow and keep
//! their results up to date as rows change, without rescanning.
//!
//! ## Design Principles
//!
//! - **No IO**: backends and mutation functions bring their own transport
//! - **Single-threaded**: state lives behind `Rc`/`RefCell`; suspension
//!   points are explicit futures
//! - **Isolated**: every [`Store`] owns its own scheduler and transaction
//!   registry
//!
//! ## Core Concepts
//!
//! ### Collections
//!
//! Visible state is the synced rows, shadowed by optimistic upserts, shadowed
//! by optimistic deletes. Sync backends write in frames through a
//! [`SyncContext`]: `begin`, `write`, `commit`, plus `mark_ready` and
//! `truncate`.
//!
//! ### Indexes
//!
//! B-tree indexes answer `where` lookups and ordered, bounded scans. With
//! [`AutoIndex::Eager`] they are created on demand for filtered
//! subscriptions and ordered queries.
//!
//! ### Queries
//!
//! Queries are built with [`Query`] and the expression helpers in
//! [`query::builder`], optimised by pushing single-source predicates down to
//! collection subscriptions, and lowered to join, group, distinct and
//! ordered-window operators. Ordered results carry fractional positions.
//!
//! ## Quick Start
//!
//! ```rust
//! use reflow_engine::query::builder::{eq, prop, val};
//! use reflow_engine::{CollectionConfig, Query, Store};
//! use serde_json::json;
//!
//! let store = Store::new();
//! let todos = store
//!     .create_collection(
//!         CollectionConfig::keyed_by("todos", "id")
//!             .on_insert(|_tx| Box::pin(async { Ok(()) })),
//!     )
//!     .unwrap();
//!
//! let open = store
//!     .live_query(Query::from_collection("t", &todos).where_(eq(prop("t.done"), val(false))))
//!     .unwrap();
//!
//! todos.insert(json!({"id": 1, "title": "write docs", "done": false})).unwrap();
//! assert_eq!(open.len(), 1);
//! ```

pub mod change;
pub mod collection;
pub mod compare;
pub mod config;
pub mod error;
pub mod fractional;
pub mod index;
pub mod key;
pub mod lifecycle;
pub mod query;
pub mod sorted_map;
pub mod state;
pub mod store;
pub mod subscription;
pub mod sync;
pub mod task;
pub mod transaction;

// Re-export main types at crate root
pub use change::{ChangeMessage, ChangeType, CollectionEvent};
pub use collection::{Collection, IndexOptions, WeakCollection};
pub use compare::{CompareOptions, EqualityMode, NullsOrder, SortDirection, StringSort};
pub use config::{
    AutoIndex, CollectionConfig, CollectionOptions, RowUpdateMode, SyncMode, TransactionConfig,
};
pub use error::{Error, Result};
pub use index::{IndexOperation, IndexProxy};
pub use key::Key;
pub use lifecycle::CollectionStatus;
pub use query::{LiveQuery, Query, QueryIr};
pub use store::Store;
pub use subscription::{LimitedSnapshot, SnapshotRequest, SubscribeOptions, Subscription};
pub use sync::{LoadCursor, LoadSubsetOptions, SubsetLoad, SyncBackend, SyncContext, SyncWrite};
pub use task::{Deferred, Resolver};
pub use transaction::{PendingMutation, Transaction, TransactionState};
