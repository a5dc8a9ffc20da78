//! Shared fixtures for integration tests.

#![allow(dead_code)]

use reflow_engine::{
    Collection, CollectionConfig, Deferred, LoadSubsetOptions, Resolver, Result, Store, SubsetLoad,
    SyncBackend, SyncContext, SyncMode, SyncWrite,
};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// Sync backend driven by the test through the context it was started with.
#[derive(Clone, Default)]
pub struct ManualSync {
    ctx: Rc<RefCell<Option<SyncContext>>>,
    loads: Rc<RefCell<Vec<LoadSubsetOptions>>>,
    unloads: Rc<RefCell<Vec<LoadSubsetOptions>>>,
    /// When set, `load_subset` returns a pending load settled by the test.
    defer_loads: Rc<RefCell<Option<Vec<Resolver<()>>>>>,
}

impl ManualSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent subset loads pending until [`ManualSync::settle_loads`].
    pub fn hold_loads(&self) {
        *self.defer_loads.borrow_mut() = Some(Vec::new());
    }

    pub fn settle_loads(&self) {
        let resolvers = self.defer_loads.borrow_mut().take().unwrap_or_default();
        for resolver in resolvers {
            resolver.resolve(());
        }
    }

    pub fn ctx(&self) -> SyncContext {
        self.ctx.borrow().clone().expect("sync not started")
    }

    pub fn loads(&self) -> Vec<LoadSubsetOptions> {
        self.loads.borrow().clone()
    }

    pub fn unloads(&self) -> Vec<LoadSubsetOptions> {
        self.unloads.borrow().clone()
    }

    pub fn insert_rows(&self, rows: Vec<Value>) {
        self.ctx()
            .write_batch(rows.into_iter().map(SyncWrite::insert))
            .unwrap();
    }
}

impl SyncBackend for ManualSync {
    fn start(&self, ctx: SyncContext) -> Result<()> {
        *self.ctx.borrow_mut() = Some(ctx);
        Ok(())
    }

    fn supports_load_subset(&self) -> bool {
        true
    }

    fn load_subset(&self, options: &LoadSubsetOptions) -> Result<SubsetLoad> {
        self.loads.borrow_mut().push(options.clone());
        let mut held = self.defer_loads.borrow_mut();
        match held.as_mut() {
            Some(resolvers) => {
                let (deferred, resolver) = Deferred::new();
                resolvers.push(resolver);
                Ok(SubsetLoad::Pending(deferred))
            }
            None => Ok(SubsetLoad::Complete),
        }
    }

    fn unload_subset(&self, options: &LoadSubsetOptions) {
        self.unloads.borrow_mut().push(options.clone());
    }
}

/// Handlers that persist at once.
pub fn accepting(config: CollectionConfig) -> CollectionConfig {
    config
        .on_insert(|_| Box::pin(async { Ok(()) }))
        .on_update(|_| Box::pin(async { Ok(()) }))
        .on_delete(|_| Box::pin(async { Ok(()) }))
}

/// A synced collection keyed by `id`, with its backend already started.
pub fn synced(store: &Store, id: &str) -> (Collection, ManualSync) {
    let backend = ManualSync::new();
    let collection = store
        .create_collection(
            accepting(CollectionConfig::keyed_by(id, "id"))
                .with_sync(backend.clone())
                .start_sync(true),
        )
        .unwrap();
    (collection, backend)
}

/// Like [`synced`] but loading rows only when asked.
pub fn on_demand(store: &Store, id: &str) -> (Collection, ManualSync) {
    let backend = ManualSync::new();
    let collection = store
        .create_collection(
            accepting(CollectionConfig::keyed_by(id, "id"))
                .with_sync(backend.clone())
                .sync_mode(SyncMode::OnDemand)
                .start_sync(true),
        )
        .unwrap();
    (collection, backend)
}

/// A local-only collection with accepting handlers.
pub fn local(store: &Store, id: &str) -> Collection {
    store
        .create_collection(accepting(CollectionConfig::keyed_by(id, "id")))
        .unwrap()
}

/// Record every change batch a listener receives.
pub fn recorder() -> (
    Rc<RefCell<Vec<reflow_engine::ChangeMessage>>>,
    impl Fn(&[reflow_engine::ChangeMessage]) + 'static,
) {
    let seen: Rc<RefCell<Vec<reflow_engine::ChangeMessage>>> = Rc::default();
    let sink = Rc::clone(&seen);
    (seen, move |changes: &[reflow_engine::ChangeMessage]| {
        sink.borrow_mut().extend_from_slice(changes)
    })
}

/// Route engine logs to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
