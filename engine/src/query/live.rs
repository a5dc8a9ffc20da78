//! Live queries: compiled pipelines fed by collection subscriptions.
//!
//! A live query subscribes to every collection it reads, turns the delivered
//! changes into diffs and runs its pipeline through the scheduler, so that a
//! transaction touching several collections recomputes the query once, after
//! all of its writes. Results are kept in pipeline order and changes to them
//! are published to listeners as ordinary [`ChangeMessage`]s.

use crate::change::{ChangeMessage, ChangeType};
use crate::error::Result;
use crate::index::auto;
use crate::key::Key;
use crate::lifecycle::CollectionStatus;
use crate::query::compiler::{compile_query, LazyRequest, LazyRequests, SourcePlan};
use crate::query::dataflow::{Deficit, Diff, InputHandle, Operator};
use crate::query::ir::{Expr, OrderByClause, QueryIr};
use crate::sorted_map::SortedMap;
use crate::subscription::{ChangeListener, LimitedSnapshot, SnapshotRequest, SubscribeOptions, Subscription};
use crate::transaction::{ScheduleRequest, Scheduler, TransactionRegistry};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};

/// One result row and its fractional position, if ordered.
#[derive(Debug, Clone, PartialEq)]
struct ResultRow {
    index: Option<String>,
    value: Value,
}

struct Fed {
    plan: SourcePlan,
    subscription: Subscription,
    /// Join-key values already requested from a lazy source.
    requested: HashSet<String>,
    /// A limited page came back empty; cleared by new input.
    exhausted: bool,
}

struct LiveQueryInner {
    id: String,
    registry: Weak<TransactionRegistry>,
    scheduler: Weak<Scheduler>,
    pipeline: RefCell<Box<dyn Operator>>,
    pending: InputHandle,
    sources: RefCell<Vec<Fed>>,
    lazy_requests: LazyRequests,
    deficit: Deficit,
    single_result: bool,
    results: RefCell<SortedMap<Key, ResultRow>>,
    listeners: RefCell<Vec<(u64, ChangeListener)>>,
    next_listener: Cell<u64>,
    running: Cell<bool>,
    dirty: Cell<bool>,
    disposed: Cell<bool>,
}

/// Handle to a live query. Clones share state; the query stops when the
/// last handle is dropped or [`LiveQuery::dispose`] is called.
#[derive(Clone)]
pub struct LiveQuery {
    inner: Rc<LiveQueryInner>,
}

fn by_position() -> Rc<dyn Fn(&ResultRow, &ResultRow) -> std::cmp::Ordering> {
    Rc::new(|a: &ResultRow, b: &ResultRow| match (&a.index, &b.index) {
        (Some(x), Some(y)) => x.cmp(y),
        _ => std::cmp::Ordering::Equal,
    })
}

impl LiveQuery {
    pub(crate) fn new(
        id: String,
        query: &QueryIr,
        registry: &Rc<TransactionRegistry>,
        scheduler: &Rc<Scheduler>,
    ) -> Result<Self> {
        let compiled = compile_query(query)?;
        let inner = Rc::new(LiveQueryInner {
            id,
            registry: Rc::downgrade(registry),
            scheduler: Rc::downgrade(scheduler),
            pipeline: RefCell::new(compiled.pipeline),
            pending: InputHandle::default(),
            sources: RefCell::new(Vec::new()),
            lazy_requests: compiled.lazy_requests,
            deficit: compiled.deficit,
            single_result: compiled.single_result,
            results: RefCell::new(SortedMap::with_comparator(by_position())),
            listeners: RefCell::new(Vec::new()),
            next_listener: Cell::new(0),
            running: Cell::new(false),
            dirty: Cell::new(false),
            disposed: Cell::new(false),
        });
        let live = LiveQuery { inner };

        for plan in compiled.sources {
            let weak = Rc::downgrade(&live.inner);
            let input = plan.alias.clone();
            let options = SubscribeOptions {
                include_initial_state: false,
                where_: plan.where_.clone(),
            };
            let subscription = plan.collection.subscribe_changes(
                move |changes| {
                    if let Some(inner) = weak.upgrade() {
                        LiveQuery { inner }.on_source_changes(&input, changes);
                    }
                },
                options,
            )?;
            live.inner.sources.borrow_mut().push(Fed {
                plan,
                subscription,
                requested: HashSet::new(),
                exhausted: false,
            });
        }
        tracing::debug!(
            query = %live.inner.id,
            sources = live.inner.sources.borrow().len(),
            "live query started"
        );

        let initial: Vec<(Subscription, Option<LimitedSnapshot>, bool)> = live
            .inner
            .sources
            .borrow()
            .iter()
            .map(|fed| {
                let limited = fed.plan.limited.as_ref().map(|l| LimitedSnapshot {
                    order_by: l.order_by.clone(),
                    limit: l.page,
                    min_value: None,
                    offset: None,
                });
                (fed.subscription.clone(), limited, fed.plan.lazy.is_some())
            })
            .collect();
        for (subscription, limited, lazy) in initial {
            match limited {
                Some(page) => {
                    subscription.request_limited_snapshot(page)?;
                }
                None if lazy => {}
                None => {
                    subscription.request_snapshot(SnapshotRequest::default())?;
                }
            }
        }
        live.run();
        Ok(live)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Result values in query order.
    pub fn results(&self) -> Vec<Value> {
        self.inner
            .results
            .borrow()
            .values()
            .map(|row| row.value.clone())
            .collect()
    }

    /// Result keys and values in query order.
    pub fn entries(&self) -> Vec<(Key, Value)> {
        self.inner
            .results
            .borrow()
            .iter()
            .map(|(key, row)| (key.clone(), row.value.clone()))
            .collect()
    }

    pub fn get(&self, key: &Key) -> Option<Value> {
        self.inner.results.borrow().get(key).map(|row| row.value.clone())
    }

    /// The first result; the whole answer of a `find_one` query.
    pub fn first(&self) -> Option<Value> {
        self.inner
            .results
            .borrow()
            .values()
            .next()
            .map(|row| row.value.clone())
    }

    pub fn is_single_result(&self) -> bool {
        self.inner.single_result
    }

    pub fn len(&self) -> usize {
        self.inner.results.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.results.borrow().is_empty()
    }

    /// Combined status of the source collections.
    pub fn status(&self) -> CollectionStatus {
        if self.inner.disposed.get() {
            return CollectionStatus::CleanedUp;
        }
        let statuses: Vec<CollectionStatus> = self
            .inner
            .sources
            .borrow()
            .iter()
            .map(|fed| fed.plan.collection.status())
            .collect();
        if statuses.contains(&CollectionStatus::Error) {
            CollectionStatus::Error
        } else if statuses.iter().all(|s| *s == CollectionStatus::Ready) {
            CollectionStatus::Ready
        } else {
            CollectionStatus::Loading
        }
    }

    /// Register a listener for result changes. Returns an id for
    /// [`LiveQuery::unsubscribe`].
    pub fn subscribe_changes(&self, listener: impl Fn(&[ChangeMessage]) + 'static) -> u64 {
        let id = self.inner.next_listener.get() + 1;
        self.inner.next_listener.set(id);
        self.inner.listeners.borrow_mut().push((id, Rc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, listener_id: u64) -> bool {
        let mut listeners = self.inner.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != listener_id);
        listeners.len() != before
    }

    /// Detach from every source collection.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    fn on_source_changes(&self, input: &str, changes: &[ChangeMessage]) {
        if self.inner.disposed.get() {
            return;
        }
        self.inner.pending.push(input, to_diffs(changes));
        for fed in self.inner.sources.borrow_mut().iter_mut() {
            if fed.plan.alias == input {
                fed.exhausted = false;
            }
        }
        self.schedule_run();
    }

    /// Run now, or under the ambient transaction so the run happens once
    /// after all of its writes.
    fn schedule_run(&self) {
        let Some(scheduler) = self.inner.scheduler.upgrade() else {
            self.run();
            return;
        };
        let context = self
            .inner
            .registry
            .upgrade()
            .and_then(|registry| registry.active())
            .map(|transaction| transaction.id().to_string());
        let weak = Rc::downgrade(&self.inner);
        scheduler.schedule(ScheduleRequest::new(
            context,
            format!("live-query:{}", self.inner.id),
            move || {
                if let Some(inner) = weak.upgrade() {
                    LiveQuery { inner }.run();
                }
            },
        ));
    }

    fn run(&self) {
        if self.inner.running.get() {
            self.inner.dirty.set(true);
            return;
        }
        self.inner.running.set(true);
        loop {
            self.inner.dirty.set(false);
            let mut inputs = self.inner.pending.take();
            let diffs = self.inner.pipeline.borrow_mut().step(&mut inputs);
            let changes = self.apply(diffs);
            self.emit(&changes);
            let requested_lazy = self.load_lazy_rows();
            let requested_page = self.fill_window();
            if !requested_lazy
                && !requested_page
                && !self.inner.dirty.get()
                && self.inner.pending.is_empty()
            {
                break;
            }
        }
        self.inner.running.set(false);
    }

    /// Fold output diffs into the result set.
    fn apply(&self, diffs: Vec<Diff>) -> Vec<ChangeMessage> {
        if diffs.is_empty() {
            return Vec::new();
        }
        let mut results = self.inner.results.borrow_mut();
        let mut touched: BTreeMap<Key, Option<Value>> = BTreeMap::new();
        for (key, row, multiplicity) in diffs {
            touched
                .entry(key.clone())
                .or_insert_with(|| results.get(&key).map(|r| r.value.clone()));
            if multiplicity < 0 {
                if results.get(&key).map(|r| &r.value) == row.get("value") {
                    results.remove(&key);
                }
            } else if multiplicity > 0 {
                let index = row.get("index").and_then(Value::as_str).map(String::from);
                let value = row.get("value").cloned().unwrap_or(Value::Null);
                results.set(key, ResultRow { index, value });
            }
        }
        touched
            .into_iter()
            .filter_map(|(key, before)| {
                let after = results.get(&key).map(|r| r.value.clone());
                match (before, after) {
                    (None, Some(value)) => Some(ChangeMessage::insert(key, value)),
                    (Some(old), Some(value)) if old != value => {
                        Some(ChangeMessage::update(key, value, old))
                    }
                    (Some(old), None) => Some(ChangeMessage::delete(key, old)),
                    _ => None,
                }
            })
            .collect()
    }

    fn emit(&self, changes: &[ChangeMessage]) {
        if changes.is_empty() {
            return;
        }
        let listeners: Vec<ChangeListener> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in listeners {
            listener(changes);
        }
    }

    /// Ask lazy join sources for rows matching newly seen join keys.
    fn load_lazy_rows(&self) -> bool {
        let requests: Vec<LazyRequest> = std::mem::take(&mut *self.inner.lazy_requests.borrow_mut());
        let mut requested = false;
        for request in requests {
            let target = {
                let mut sources = self.inner.sources.borrow_mut();
                let Some(fed) = sources.iter_mut().find(|f| f.plan.alias == request.input) else {
                    continue;
                };
                let fresh: Vec<Value> = request
                    .values
                    .into_iter()
                    .filter(|v| fed.requested.insert(v.to_string()))
                    .collect();
                if fresh.is_empty() {
                    continue;
                }
                (fed.subscription.clone(), fed.plan.collection.clone(), fresh)
            };
            let (subscription, collection, values) = target;
            let where_ = Expr::func(
                "in",
                vec![Expr::prop(request.field.clone()), Expr::value(Value::Array(values))],
            );
            auto::ensure_indexes_for_expr(&collection, &where_);
            let snapshot = SnapshotRequest {
                where_: Some(where_),
                ..SnapshotRequest::default()
            };
            if let Err(e) = subscription.request_snapshot(snapshot) {
                tracing::warn!(query = %self.inner.id, error = %e, "lazy join load failed");
            }
            requested = true;
        }
        requested
    }

    /// Page more rows into a limited window that lost rows.
    fn fill_window(&self) -> bool {
        let missing = self.inner.deficit.get();
        if missing == 0 {
            return false;
        }
        let target = {
            let sources = self.inner.sources.borrow();
            sources
                .iter()
                .enumerate()
                .find(|(_, f)| f.plan.limited.is_some() && !f.exhausted)
                .and_then(|(i, f)| {
                    let order_by: OrderByClause = f.plan.limited.as_ref()?.order_by.clone();
                    Some((i, f.subscription.clone(), order_by))
                })
        };
        let Some((position, subscription, order_by)) = target else {
            return false;
        };
        let page = LimitedSnapshot {
            order_by,
            limit: missing,
            min_value: subscription.limited_cursor(),
            offset: None,
        };
        let delivered = match subscription.request_limited_snapshot(page) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(query = %self.inner.id, error = %e, "window refill failed");
                0
            }
        };
        if delivered == 0 {
            if let Some(fed) = self.inner.sources.borrow_mut().get_mut(position) {
                fed.exhausted = true;
            }
            // Nothing was delivered, so there is nothing more to run.
            return false;
        }
        true
    }
}

impl LiveQueryInner {
    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let subscriptions: Vec<Subscription> = self
            .sources
            .borrow()
            .iter()
            .map(|f| f.subscription.clone())
            .collect();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        tracing::debug!(query = %self.id, "live query disposed");
    }
}

impl Drop for LiveQueryInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Collection changes as pipeline diffs.
fn to_diffs(changes: &[ChangeMessage]) -> Vec<Diff> {
    let mut diffs = Vec::with_capacity(changes.len());
    for change in changes {
        match change.kind {
            ChangeType::Insert => diffs.push((change.key.clone(), change.value.clone(), 1)),
            ChangeType::Update => {
                if let Some(previous) = &change.previous_value {
                    diffs.push((change.key.clone(), previous.clone(), -1));
                }
                diffs.push((change.key.clone(), change.value.clone(), 1));
            }
            ChangeType::Delete => diffs.push((change.key.clone(), change.value.clone(), -1)),
        }
    }
    diffs
}

impl fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("id", &self.inner.id)
            .field("len", &self.len())
            .finish()
    }
}
