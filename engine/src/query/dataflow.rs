//! Incremental operators over keyed multiset diffs.
//!
//! A pipeline is a tree of [`Operator`]s. Each call to [`Operator::step`]
//! pulls the diffs its inputs produced since the previous step and returns
//! the resulting output diffs. A diff is `(key, value, multiplicity)`: `+1`
//! adds the row, `-1` retracts it. An update is a retraction of the old value
//! followed by an insertion of the new one under the same key.
//!
//! Stateful operators (join, reduce, distinct, top-k) recompute only the
//! groups touched by a step and emit the difference between the old and new
//! output of those groups.

use crate::compare::{compare_columns, CompareOptions};
use crate::fractional::keys_between;
use crate::key::Key;
use crate::query::evaluate::{AggregateKind, Evaluator, Predicate};
use crate::query::ir::JoinKind;
use crate::sorted_map::SortedMap;
use serde_json::{json, Map, Value};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::Rc;

pub type Diff = (Key, Value, i64);

/// Pending diffs per source input.
pub type Inputs = HashMap<String, Vec<Diff>>;

/// Field holding the fractional position of ordered results.
pub const INDEX_FIELD: &str = "$index";
/// Field holding the projected row.
pub const SELECTED_FIELD: &str = "$selected";
/// Field holding aggregate values of a group.
pub const AGG_FIELD: &str = "$agg";
/// Field holding group-by values of a group.
pub const GROUP_FIELD: &str = "$group";

pub trait Operator {
    fn step(&mut self, inputs: &mut Inputs) -> Vec<Diff>;
}

/// Sum multiplicities of identical `(key, value)` pairs and drop zeros.
/// Order of first appearance is kept.
pub fn consolidate(diffs: Vec<Diff>) -> Vec<Diff> {
    let mut order: Vec<(Key, String)> = Vec::new();
    let mut totals: HashMap<(Key, String), (Value, i64)> = HashMap::new();
    for (key, value, multiplicity) in diffs {
        let id = (key, value.to_string());
        match totals.get_mut(&id) {
            Some(entry) => entry.1 += multiplicity,
            None => {
                order.push(id.clone());
                totals.insert(id, (value, multiplicity));
            }
        }
    }
    order
        .into_iter()
        .filter_map(|id| {
            let (value, multiplicity) = totals.remove(&id)?;
            (multiplicity != 0).then_some((id.0, value, multiplicity))
        })
        .collect()
}

/// Net effect per key of a diff batch: retracted value and inserted value.
fn net_by_key(diffs: &[Diff]) -> BTreeMap<Key, (Option<Value>, Option<Value>)> {
    let mut out: BTreeMap<Key, (Option<Value>, Option<Value>)> = BTreeMap::new();
    for (key, value, multiplicity) in diffs {
        let entry = out.entry(key.clone()).or_default();
        if *multiplicity < 0 {
            if entry.1.as_ref() == Some(value) {
                entry.1 = None;
            } else if entry.0.is_none() {
                entry.0 = Some(value.clone());
            }
        } else if *multiplicity > 0 {
            entry.1 = Some(value.clone());
        }
    }
    out
}

/// Emit the diff between two keyed outputs.
fn diff_outputs(old: HashMap<Key, Value>, new: HashMap<Key, Value>, out: &mut Vec<Diff>) {
    let mut retracted: Vec<(Key, Value)> = Vec::new();
    let mut inserted: Vec<(Key, Value)> = Vec::new();
    for (key, value) in &old {
        if new.get(key) != Some(value) {
            retracted.push((key.clone(), value.clone()));
        }
    }
    for (key, value) in new {
        if old.get(&key) != Some(&value) {
            inserted.push((key, value));
        }
    }
    retracted.sort_by(|a, b| a.0.cmp(&b.0));
    inserted.sort_by(|a, b| a.0.cmp(&b.0));
    out.extend(retracted.into_iter().map(|(k, v)| (k, v, -1)));
    out.extend(inserted.into_iter().map(|(k, v)| (k, v, 1)));
}

/// Rows of one source, namespaced under its alias.
pub struct SourceOp {
    input: String,
    alias: String,
}

impl SourceOp {
    pub fn new(input: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            alias: alias.into(),
        }
    }
}

impl Operator for SourceOp {
    fn step(&mut self, inputs: &mut Inputs) -> Vec<Diff> {
        inputs
            .remove(&self.input)
            .unwrap_or_default()
            .into_iter()
            .map(|(key, row, m)| (key, namespaced(&self.alias, row), m))
            .collect()
    }
}

/// Wrap the output of a nested pipeline under an alias.
pub struct NamespaceOp {
    input: Box<dyn Operator>,
    alias: String,
}

impl NamespaceOp {
    pub fn new(input: Box<dyn Operator>, alias: impl Into<String>) -> Self {
        Self {
            input,
            alias: alias.into(),
        }
    }
}

impl Operator for NamespaceOp {
    fn step(&mut self, inputs: &mut Inputs) -> Vec<Diff> {
        self.input
            .step(inputs)
            .into_iter()
            .map(|(key, row, m)| (key, namespaced(&self.alias, row), m))
            .collect()
    }
}

fn namespaced(alias: &str, row: Value) -> Value {
    let mut map = Map::new();
    map.insert(alias.to_string(), row);
    Value::Object(map)
}

pub struct FilterOp {
    input: Box<dyn Operator>,
    predicate: Predicate,
}

impl FilterOp {
    pub fn new(input: Box<dyn Operator>, predicate: Predicate) -> Self {
        Self { input, predicate }
    }
}

impl Operator for FilterOp {
    fn step(&mut self, inputs: &mut Inputs) -> Vec<Diff> {
        let predicate = &self.predicate;
        self.input
            .step(inputs)
            .into_iter()
            .filter(|(_, row, _)| predicate(row))
            .collect()
    }
}

pub struct MapOp {
    input: Box<dyn Operator>,
    f: Evaluator,
}

impl MapOp {
    pub fn new(input: Box<dyn Operator>, f: Evaluator) -> Self {
        Self { input, f }
    }
}

impl Operator for MapOp {
    fn step(&mut self, inputs: &mut Inputs) -> Vec<Diff> {
        let f = &self.f;
        self.input
            .step(inputs)
            .into_iter()
            .map(|(key, row, m)| {
                let mapped = f(&row);
                (key, mapped, m)
            })
            .collect()
    }
}

/// Observe diffs without changing them.
pub struct TapOp {
    input: Box<dyn Operator>,
    f: Box<dyn FnMut(&[Diff])>,
}

impl TapOp {
    pub fn new(input: Box<dyn Operator>, f: impl FnMut(&[Diff]) + 'static) -> Self {
        Self {
            input,
            f: Box::new(f),
        }
    }
}

impl Operator for TapOp {
    fn step(&mut self, inputs: &mut Inputs) -> Vec<Diff> {
        let diffs = self.input.step(inputs);
        if !diffs.is_empty() {
            (self.f)(&diffs);
        }
        diffs
    }
}

/// Join key of a row; `None` never matches.
fn join_key(f: &Evaluator, row: &Value) -> Option<String> {
    match f(row) {
        Value::Null => None,
        value => Some(value.to_string()),
    }
}

#[derive(Default)]
struct JoinSide {
    rows: HashMap<Key, Value>,
    by_join_key: HashMap<Option<String>, BTreeSet<Key>>,
}

impl JoinSide {
    fn remove(&mut self, key: &Key, join_key: &Option<String>) {
        self.rows.remove(key);
        if let Some(keys) = self.by_join_key.get_mut(join_key) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_join_key.remove(join_key);
            }
        }
    }

    fn insert(&mut self, key: Key, join_key: Option<String>, row: Value) {
        self.by_join_key.entry(join_key).or_default().insert(key.clone());
        self.rows.insert(key, row);
    }

    fn group(&self, join_key: &Option<String>) -> Vec<(&Key, &Value)> {
        self.by_join_key
            .get(join_key)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| self.rows.get(k).map(|v| (k, v)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Keyed equi-join of two namespaced streams.
pub struct JoinOp {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    kind: JoinKind,
    left_key: Evaluator,
    right_key: Evaluator,
    left_aliases: Vec<String>,
    right_aliases: Vec<String>,
    left_state: JoinSide,
    right_state: JoinSide,
}

impl JoinOp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
        kind: JoinKind,
        left_key: Evaluator,
        right_key: Evaluator,
        left_aliases: Vec<String>,
        right_aliases: Vec<String>,
    ) -> Self {
        Self {
            left,
            right,
            kind,
            left_key,
            right_key,
            left_aliases,
            right_aliases,
            left_state: JoinSide::default(),
            right_state: JoinSide::default(),
        }
    }

    fn pair_key(left: Option<&Key>, right: Option<&Key>) -> Key {
        let side = |k: Option<&Key>| k.map_or(Value::Null, Key::to_value);
        Key::Str(json!([side(left), side(right)]).to_string())
    }

    fn merge(left: Option<&Value>, right: Option<&Value>, nulls: &[String]) -> Value {
        let mut map = Map::new();
        for side in [left, right].into_iter().flatten() {
            if let Value::Object(fields) = side {
                map.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        for alias in nulls {
            map.entry(alias.clone()).or_insert(Value::Null);
        }
        Value::Object(map)
    }

    /// Output rows of one join-key group.
    fn group_output(&self, join_key: &Option<String>) -> HashMap<Key, Value> {
        let lefts = self.left_state.group(join_key);
        let rights = self.right_state.group(join_key);
        let mut out = HashMap::new();
        let matched = join_key.is_some() && !lefts.is_empty() && !rights.is_empty();
        if matched {
            for (lk, lv) in &lefts {
                for (rk, rv) in &rights {
                    out.insert(Self::pair_key(Some(lk), Some(rk)), Self::merge(Some(lv), Some(rv), &[]));
                }
            }
            return out;
        }
        if matches!(self.kind, JoinKind::Left | JoinKind::Full) {
            for (lk, lv) in &lefts {
                out.insert(Self::pair_key(Some(lk), None), Self::merge(Some(lv), None, &self.right_aliases));
            }
        }
        if matches!(self.kind, JoinKind::Right | JoinKind::Full) {
            for (rk, rv) in &rights {
                out.insert(Self::pair_key(None, Some(rk)), Self::merge(None, Some(rv), &self.left_aliases));
            }
        }
        out
    }
}

impl Operator for JoinOp {
    fn step(&mut self, inputs: &mut Inputs) -> Vec<Diff> {
        let left = net_by_key(&self.left.step(inputs));
        let right = net_by_key(&self.right.step(inputs));
        if left.is_empty() && right.is_empty() {
            return Vec::new();
        }

        let mut affected: HashSet<Option<String>> = HashSet::new();
        for (changes, key_fn) in [(&left, &self.left_key), (&right, &self.right_key)] {
            for (old, new) in changes.values() {
                for row in [old, new].into_iter().flatten() {
                    affected.insert(join_key(key_fn, row));
                }
            }
        }
        let mut old_output = HashMap::new();
        for jk in &affected {
            old_output.extend(self.group_output(jk));
        }

        for (changes, key_fn, state) in [
            (left, &self.left_key, &mut self.left_state),
            (right, &self.right_key, &mut self.right_state),
        ] {
            for (key, (old, new)) in changes {
                if let Some(old) = old {
                    state.remove(&key, &join_key(key_fn, &old));
                } else if let Some(existing) = state.rows.get(&key).cloned() {
                    state.remove(&key, &join_key(key_fn, &existing));
                }
                if let Some(new) = new {
                    let jk = join_key(key_fn, &new);
                    state.insert(key, jk, new);
                }
            }
        }

        let mut new_output = HashMap::new();
        for jk in &affected {
            new_output.extend(self.group_output(jk));
        }
        let mut out = Vec::new();
        diff_outputs(old_output, new_output, &mut out);
        out
    }
}

struct Group {
    values: Vec<Value>,
    rows: BTreeMap<Key, Value>,
}

/// Group rows and fold aggregates per group.
///
/// Each non-empty group emits one row: its first row (by key) with the group
/// values under `$group` and the aggregate values, in declaration order,
/// under `$agg`.
pub struct ReduceOp {
    input: Box<dyn Operator>,
    group_by: Vec<Evaluator>,
    aggregates: Vec<(AggregateKind, Option<Evaluator>)>,
    groups: HashMap<String, Group>,
}

impl ReduceOp {
    pub fn new(
        input: Box<dyn Operator>,
        group_by: Vec<Evaluator>,
        aggregates: Vec<(AggregateKind, Option<Evaluator>)>,
    ) -> Self {
        Self {
            input,
            group_by,
            aggregates,
            groups: HashMap::new(),
        }
    }

    fn group_of(&self, row: &Value) -> (String, Vec<Value>) {
        let values: Vec<Value> = self.group_by.iter().map(|f| f(row)).collect();
        (Value::Array(values.clone()).to_string(), values)
    }

    fn output(&self, id: &str) -> Option<(Key, Value)> {
        let group = self.groups.get(id)?;
        let (_, first) = group.rows.iter().next()?;
        let aggregates: Vec<Value> = self
            .aggregates
            .iter()
            .map(|(kind, arg)| match arg {
                Some(arg) => {
                    let values: Vec<Value> = group.rows.values().map(|r| arg(r)).collect();
                    kind.fold(values.iter())
                }
                None => Value::from(group.rows.len()),
            })
            .collect();
        let mut row = match first {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        row.insert(AGG_FIELD.to_string(), Value::Array(aggregates));
        row.insert(GROUP_FIELD.to_string(), Value::Array(group.values.clone()));
        Some((Key::Str(id.to_string()), Value::Object(row)))
    }
}

impl Operator for ReduceOp {
    fn step(&mut self, inputs: &mut Inputs) -> Vec<Diff> {
        let diffs = self.input.step(inputs);
        if diffs.is_empty() {
            return Vec::new();
        }
        let mut touched: Vec<(String, Vec<Value>, Key, Value, i64)> = Vec::new();
        let mut affected: BTreeSet<String> = BTreeSet::new();
        for (key, row, m) in diffs {
            let (id, values) = self.group_of(&row);
            affected.insert(id.clone());
            touched.push((id, values, key, row, m));
        }
        let old: HashMap<Key, Value> = affected.iter().filter_map(|id| self.output(id)).collect();
        for (id, values, key, row, m) in touched {
            if m < 0 {
                if let Some(group) = self.groups.get_mut(&id) {
                    group.rows.remove(&key);
                    if group.rows.is_empty() {
                        self.groups.remove(&id);
                    }
                }
            } else if m > 0 {
                self.groups
                    .entry(id)
                    .or_insert_with(|| Group {
                        values,
                        rows: BTreeMap::new(),
                    })
                    .rows
                    .insert(key, row);
            }
        }
        let new: HashMap<Key, Value> = affected.iter().filter_map(|id| self.output(id)).collect();
        let mut out = Vec::new();
        diff_outputs(old, new, &mut out);
        out
    }
}

/// Keep one row per distinct `$selected` value.
pub struct DistinctOp {
    input: Box<dyn Operator>,
    counts: HashMap<String, (i64, Key, Value)>,
}

impl DistinctOp {
    pub fn new(input: Box<dyn Operator>) -> Self {
        Self {
            input,
            counts: HashMap::new(),
        }
    }
}

impl Operator for DistinctOp {
    fn step(&mut self, inputs: &mut Inputs) -> Vec<Diff> {
        let mut out = Vec::new();
        for (_, row, m) in self.input.step(inputs) {
            let selected = row.get(SELECTED_FIELD).cloned().unwrap_or(Value::Null);
            let id = selected.to_string();
            let before = self.counts.get(&id).map_or(0, |e| e.0);
            let after = before + m;
            if before <= 0 && after > 0 {
                let key = Key::Str(id.clone());
                self.counts.insert(id, (after, key.clone(), row.clone()));
                out.push((key, row, 1));
            } else if before > 0 && after <= 0 {
                if let Some((_, key, value)) = self.counts.remove(&id) {
                    out.push((key, value, -1));
                }
            } else if let Some(entry) = self.counts.get_mut(&id) {
                entry.0 = after;
            }
        }
        out
    }
}

/// Rows waiting beyond a limited window.
pub type Deficit = Rc<Cell<usize>>;

/// Sort columns, arrival sequence and row.
type Ranked = (Vec<Value>, u64, Value);

/// Order rows and keep the `[offset, offset + limit)` window, tagging each
/// row with a fractional `$index`.
///
/// Rows with equal sort columns keep the order in which they first arrived.
pub struct TopKOp {
    input: Box<dyn Operator>,
    order: Vec<Evaluator>,
    limit: Option<usize>,
    offset: usize,
    rows: SortedMap<Key, Ranked>,
    arrivals: HashMap<Key, u64>,
    next_arrival: u64,
    emitted: HashMap<Key, (String, Value)>,
    deficit: Deficit,
}

impl TopKOp {
    pub fn new(
        input: Box<dyn Operator>,
        order: Vec<Evaluator>,
        options: Vec<CompareOptions>,
        limit: Option<usize>,
        offset: usize,
        deficit: Deficit,
    ) -> Self {
        let options = Rc::new(options);
        let comparator = Rc::new(move |a: &Ranked, b: &Ranked| {
            compare_columns(&a.0, &b.0, &options).then(a.1.cmp(&b.1))
        });
        Self {
            input,
            order,
            limit,
            offset,
            rows: SortedMap::with_comparator(comparator),
            arrivals: HashMap::new(),
            next_arrival: 0,
            emitted: HashMap::new(),
            deficit,
        }
    }

    fn window(&self) -> Vec<Key> {
        let take = self.limit.unwrap_or(usize::MAX);
        self.rows.keys().skip(self.offset).take(take).cloned().collect()
    }

    /// Fractional positions for `window`. Rows that did not move keep their
    /// position; every other row gets a key between its neighbours.
    fn assign_positions(&self, window: &[Key], moved: &HashSet<Key>) -> Vec<String> {
        let mut kept: Vec<Option<String>> = Vec::with_capacity(window.len());
        let mut last: Option<&str> = None;
        for key in window {
            match self.emitted.get(key) {
                Some((frac, _))
                    if !moved.contains(key) && last.map_or(true, |l| frac.as_str() > l) =>
                {
                    last = Some(frac);
                    kept.push(Some(frac.clone()));
                }
                _ => kept.push(None),
            }
        }
        let mut positions = Vec::with_capacity(window.len());
        let mut i = 0;
        while i < kept.len() {
            if let Some(frac) = &kept[i] {
                positions.push(frac.clone());
                i += 1;
                continue;
            }
            let start = i;
            while i < kept.len() && kept[i].is_none() {
                i += 1;
            }
            let lower = positions.last().cloned();
            let upper = kept.get(i).cloned().flatten();
            positions.extend(keys_between(lower.as_deref(), upper.as_deref(), i - start));
        }
        positions
    }
}

impl Operator for TopKOp {
    fn step(&mut self, inputs: &mut Inputs) -> Vec<Diff> {
        let diffs = self.input.step(inputs);
        let changed = !diffs.is_empty();
        for (key, _, multiplicity) in &diffs {
            if *multiplicity > 0 && !self.arrivals.contains_key(key) {
                self.arrivals.insert(key.clone(), self.next_arrival);
                self.next_arrival += 1;
            }
        }
        let mut moved = HashSet::new();
        for (key, (old, new)) in net_by_key(&diffs) {
            if old.is_some() || new.is_some() {
                self.rows.remove(&key);
                moved.insert(key.clone());
            }
            if let Some(row) = new {
                let sort: Vec<Value> = self.order.iter().map(|f| f(&row)).collect();
                let arrival = self.arrivals.get(&key).copied().unwrap_or(u64::MAX);
                self.rows.set(key.clone(), (sort, arrival, row));
            }
            if !self.rows.contains_key(&key) {
                self.arrivals.remove(&key);
            }
        }
        let window = self.window();
        if let Some(limit) = self.limit {
            self.deficit.set(limit.saturating_sub(window.len()));
        }
        if !changed {
            return Vec::new();
        }

        let positions = self.assign_positions(&window, &moved);
        let mut next: HashMap<Key, (String, Value)> = HashMap::with_capacity(window.len());
        for (key, frac) in window.iter().zip(positions) {
            if let Some((_, _, row)) = self.rows.get(key) {
                let mut row = row.clone();
                if let Value::Object(map) = &mut row {
                    map.insert(INDEX_FIELD.to_string(), Value::String(frac.clone()));
                }
                next.insert(key.clone(), (frac, row));
            }
        }
        let old: HashMap<Key, Value> = self.emitted.iter().map(|(k, (_, v))| (k.clone(), v.clone())).collect();
        let new: HashMap<Key, Value> = next.iter().map(|(k, (_, v))| (k.clone(), v.clone())).collect();
        self.emitted = next;
        let mut out = Vec::new();
        diff_outputs(old, new, &mut out);
        out
    }
}

/// Handle for feeding diffs into a pipeline in tests and benches.
#[derive(Clone, Default)]
pub struct InputHandle {
    pending: Rc<RefCell<Inputs>>,
}

impl InputHandle {
    pub fn push(&self, input: &str, diffs: impl IntoIterator<Item = Diff>) {
        self.pending
            .borrow_mut()
            .entry(input.to_string())
            .or_default()
            .extend(diffs);
    }

    pub fn take(&self) -> Inputs {
        std::mem::take(&mut *self.pending.borrow_mut())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::evaluate::compile;
    use crate::query::ir::Expr;

    fn p(s: &str) -> Evaluator {
        compile(&Expr::prop(s.split('.').map(String::from).collect())).unwrap()
    }

    fn ins(key: i64, row: Value) -> Diff {
        (Key::from(key), row, 1)
    }

    fn del(key: i64, row: Value) -> Diff {
        (Key::from(key), row, -1)
    }

    fn run(op: &mut dyn Operator, input: &str, diffs: Vec<Diff>) -> Vec<Diff> {
        let mut inputs = Inputs::new();
        inputs.insert(input.to_string(), diffs);
        op.step(&mut inputs)
    }

    #[test]
    fn consolidate_cancels() {
        let out = consolidate(vec![
            ins(1, json!({"a": 1})),
            del(1, json!({"a": 1})),
            ins(1, json!({"a": 2})),
        ]);
        assert_eq!(out, vec![ins(1, json!({"a": 2}))]);
    }

    #[test]
    fn left_join_null_extends_then_matches() {
        let mut join = JoinOp::new(
            Box::new(SourceOp::new("u", "u")),
            Box::new(SourceOp::new("p", "p")),
            JoinKind::Left,
            p("u.id"),
            p("p.author"),
            vec!["u".into()],
            vec!["p".into()],
        );
        let mut inputs = Inputs::new();
        inputs.insert("u".into(), vec![ins(1, json!({"id": 1}))]);
        let out = join.step(&mut inputs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, json!({"u": {"id": 1}, "p": null}));

        let out = run(&mut join, "p", vec![ins(10, json!({"id": 10, "author": 1}))]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].2, -1);
        assert_eq!(out[1].1, json!({"u": {"id": 1}, "p": {"id": 10, "author": 1}}));

        let out = run(&mut join, "p", vec![del(10, json!({"id": 10, "author": 1}))]);
        assert_eq!(out[1].1, json!({"u": {"id": 1}, "p": null}));
    }

    #[test]
    fn inner_join_ignores_null_keys() {
        let mut join = JoinOp::new(
            Box::new(SourceOp::new("a", "a")),
            Box::new(SourceOp::new("b", "b")),
            JoinKind::Inner,
            p("a.k"),
            p("b.k"),
            vec!["a".into()],
            vec!["b".into()],
        );
        let mut inputs = Inputs::new();
        inputs.insert("a".into(), vec![ins(1, json!({"k": null})), ins(2, json!({"k": 5}))]);
        inputs.insert("b".into(), vec![ins(1, json!({"k": null})), ins(2, json!({"k": 5}))]);
        let out = join.step(&mut inputs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, Key::Str("[2,2]".into()));
    }

    #[test]
    fn reduce_tracks_groups() {
        let mut reduce = ReduceOp::new(
            Box::new(SourceOp::new("t", "t")),
            vec![p("t.kind")],
            vec![(AggregateKind::Sum, Some(p("t.n"))), (AggregateKind::Count, None)],
        );
        let out = run(
            &mut reduce,
            "t",
            vec![ins(1, json!({"kind": "a", "n": 2})), ins(2, json!({"kind": "a", "n": 3}))],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1[AGG_FIELD], json!([5, 2]));
        assert_eq!(out[0].1[GROUP_FIELD], json!(["a"]));

        let out = run(&mut reduce, "t", vec![del(1, json!({"kind": "a", "n": 2}))]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].1[AGG_FIELD], json!([3, 1]));

        let out = run(&mut reduce, "t", vec![del(2, json!({"kind": "a", "n": 3}))]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].2, -1);
    }

    #[test]
    fn distinct_counts_duplicates() {
        let row = |v: i64| json!({ SELECTED_FIELD: {"v": v} });
        // Strip the namespace so `$selected` sits at the top level.
        let mut distinct = DistinctOp::new(Box::new(MapOp::new(
            Box::new(SourceOp::new("t", "t")),
            Rc::new(|row: &Value| row["t"].clone()),
        )));
        let out = run(&mut distinct, "t", vec![ins(1, row(1)), ins(2, row(1))]);
        assert_eq!(out.len(), 1);
        let out = run(&mut distinct, "t", vec![del(1, row(1))]);
        assert!(out.is_empty());
        let out = run(&mut distinct, "t", vec![del(2, row(1))]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].2, -1);
    }

    #[test]
    fn top_k_window_and_positions() {
        let deficit = Deficit::default();
        let mut top = TopKOp::new(
            Box::new(SourceOp::new("t", "t")),
            vec![p("t.n")],
            vec![CompareOptions::default()],
            Some(2),
            0,
            Rc::clone(&deficit),
        );
        let out = run(&mut top, "t", vec![ins(1, json!({"n": 5})), ins(2, json!({"n": 3}))]);
        assert_eq!(out.len(), 2);
        assert_eq!(deficit.get(), 0);
        let index_of = |diffs: &[Diff], key: i64| -> String {
            diffs
                .iter()
                .find(|d| d.0 == Key::from(key) && d.2 > 0)
                .and_then(|d| d.1[INDEX_FIELD].as_str().map(String::from))
                .unwrap_or_default()
        };
        let first = index_of(&out, 2);
        let second = index_of(&out, 1);
        assert!(first < second);

        // A smaller row pushes key 1 out of the window.
        let out = run(&mut top, "t", vec![ins(3, json!({"n": 1}))]);
        assert_eq!(out.len(), 2);
        assert!(out.iter().any(|d| d.0 == Key::from(1) && d.2 == -1));
        assert!(index_of(&out, 3) < first);

        let out = run(&mut top, "t", vec![del(3, json!({"n": 1})), del(2, json!({"n": 3}))]);
        assert!(out.iter().any(|d| d.0 == Key::from(1) && d.2 == 1));
        assert_eq!(deficit.get(), 1);
    }

    fn top(limit: Option<usize>) -> TopKOp {
        TopKOp::new(
            Box::new(SourceOp::new("t", "t")),
            vec![p("t.n")],
            vec![CompareOptions::default()],
            limit,
            0,
            Deficit::default(),
        )
    }

    #[test]
    fn top_k_ties_keep_arrival_order() {
        let mut top = top(Some(1));
        let out = run(&mut top, "t", vec![ins(5, json!({"n": 20})), ins(1, json!({"n": 20}))]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, Key::from(5));

        // An update keeps the row's place among equals.
        let out = run(&mut top, "t", vec![del(5, json!({"n": 20})), ins(5, json!({"n": 20, "x": 1}))]);
        assert!(out.iter().all(|d| d.0 == Key::from(5)));

        // Deleting and re-inserting moves it behind its equal.
        run(&mut top, "t", vec![del(5, json!({"n": 20, "x": 1}))]);
        let out = run(&mut top, "t", vec![ins(5, json!({"n": 20}))]);
        assert!(out.is_empty());
    }

    #[test]
    fn top_k_moves_only_the_changed_row() {
        let mut top = top(None);
        let out = run(
            &mut top,
            "t",
            vec![ins(1, json!({"n": 1})), ins(2, json!({"n": 2})), ins(3, json!({"n": 3}))],
        );
        let position = |diffs: &[Diff], key: i64| -> String {
            diffs
                .iter()
                .find(|d| d.0 == Key::from(key) && d.2 > 0)
                .and_then(|d| d.1[INDEX_FIELD].as_str().map(String::from))
                .unwrap_or_default()
        };
        let first = position(&out, 1);

        let out = run(&mut top, "t", vec![del(3, json!({"n": 3})), ins(3, json!({"n": 0}))]);
        assert!(out.iter().all(|d| d.0 == Key::from(3)));
        assert!(position(&out, 3) < first);
    }
}
