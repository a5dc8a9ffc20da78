//! Lowering of optimised query IR into a dataflow pipeline.
//!
//! Every source becomes an input named after its alias whose rows are
//! namespaced as `{alias: row}`. Joins, filters, grouping, projection,
//! distinct and ordering are stacked on top, and the root maps each row to
//! `{"value": result, "index": position}` where `position` is the fractional
//! index of ordered queries.
//!
//! Alongside the pipeline the compiler describes how each input should be
//! fed: the row-relative filter for its collection subscription, whether it
//! is the lazy side of a join, and whether an index can page it for an
//! ordered, limited query.

use crate::collection::Collection;
use crate::error::{Error, Result};
use crate::index::auto;
use crate::query::dataflow::{
    Deficit, DistinctOp, FilterOp, JoinOp, MapOp, NamespaceOp, Operator, ReduceOp, SourceOp,
    TapOp, TopKOp, AGG_FIELD, GROUP_FIELD, INDEX_FIELD, SELECTED_FIELD,
};
use crate::query::evaluate::{compile, compile_predicate, AggregateKind, Evaluator};
use crate::query::ir::{combine_and, Expr, JoinClause, JoinKind, OrderByClause, QueryIr, Source};
use crate::query::optimizer::{is_pushdown_wrapper, optimize};
use serde_json::{json, Map, Value};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

/// Join-key values seen on the eager side of a join, to be loaded from the
/// lazy side.
#[derive(Debug, Clone, PartialEq)]
pub struct LazyRequest {
    pub input: String,
    /// Row-relative path of the join key on the lazy side.
    pub field: Vec<String>,
    pub values: Vec<Value>,
}

pub type LazyRequests = Rc<RefCell<Vec<LazyRequest>>>;

/// Index-driven paging of the primary source.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitedPlan {
    /// Row-relative order column.
    pub order_by: OrderByClause,
    /// Rows needed to fill `offset + limit`.
    pub page: usize,
}

/// How one pipeline input is fed from a collection.
#[derive(Debug, Clone)]
pub struct SourcePlan {
    pub alias: String,
    pub collection: Collection,
    /// Row-relative filter pushed into the subscription.
    pub where_: Option<Expr>,
    /// Join key path when the source is loaded on demand by a join.
    pub lazy: Option<Vec<String>>,
    pub limited: Option<LimitedPlan>,
}

pub struct CompiledQuery {
    pub pipeline: Box<dyn Operator>,
    pub sources: Vec<SourcePlan>,
    pub lazy_requests: LazyRequests,
    /// Rows missing from the top-level window.
    pub deficit: Deficit,
    pub single_result: bool,
}

/// Compile `query` into a pipeline.
pub fn compile_query(query: &QueryIr) -> Result<CompiledQuery> {
    let optimized = optimize(query);
    let mut compiler = Compiler::default();
    let root = compiler.compile_scope(&optimized, true)?;

    if let Some((alias, collection, clause)) = limited_order(&optimized) {
        let field = clause.expr.as_ref_path().map(<[String]>::to_vec).unwrap_or_default();
        if auto::ensure_index_for_order(&collection, &field, &clause.options).is_some() {
            let page = optimized.limit.unwrap_or(0) + optimized.offset.unwrap_or(0);
            if let Some(plan) = compiler.sources.iter_mut().find(|s| s.alias == alias) {
                plan.limited = Some(LimitedPlan { order_by: clause, page });
            }
        } else {
            tracing::debug!(
                collection = %collection.id(),
                field = %field.join("."),
                "no index for ordered query; materialising every row"
            );
        }
    }

    let single = single_alias(&optimized);
    let pipeline = MapOp::new(
        root,
        Rc::new(move |row: &Value| {
            json!({
                "value": result_of(row, single.as_deref()),
                "index": row.get(INDEX_FIELD).cloned().unwrap_or(Value::Null),
            })
        }),
    );
    Ok(CompiledQuery {
        pipeline: Box::new(pipeline),
        sources: compiler.sources,
        lazy_requests: compiler.lazy_requests,
        deficit: compiler.deficit,
        single_result: optimized.single_result,
    })
}

/// The user-facing value of a pipeline row.
fn result_of(row: &Value, single: Option<&str>) -> Value {
    if let Some(selected) = row.get(SELECTED_FIELD) {
        return selected.clone();
    }
    if let Some(alias) = single {
        return row.get(alias).cloned().unwrap_or(Value::Null);
    }
    match row {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| ![INDEX_FIELD, AGG_FIELD, GROUP_FIELD].contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn single_alias(query: &QueryIr) -> Option<String> {
    query.joins.is_empty().then(|| query.from.alias().to_string())
}

/// Order column of a query whose window can be paged from an index.
fn limited_order(query: &QueryIr) -> Option<(String, Collection, OrderByClause)> {
    let eligible = query.order_by.len() == 1
        && query.limit.is_some()
        && query.joins.is_empty()
        && query.group_by.is_empty()
        && query.having.is_empty()
        && !query.distinct
        && !query.has_aggregate_select()
        && query.where_.is_empty()
        && query.fn_where.is_empty();
    if !eligible {
        return None;
    }
    let clause = &query.order_by[0];
    let alias = query.from.alias();
    let path = clause.expr.as_ref_path()?;
    if path.len() < 2 || path[0] != alias {
        return None;
    }
    let collection = collection_of(&query.from)?;
    Some((
        alias.to_string(),
        collection,
        OrderByClause {
            expr: Expr::prop(path[1..].to_vec()),
            options: clause.options,
        },
    ))
}

/// Collection behind a direct or push-down wrapped source.
fn collection_of(source: &Source) -> Option<Collection> {
    match source {
        Source::Collection(c) => Some(c.collection.clone()),
        Source::Query(q) if is_pushdown_wrapper(source) => match &q.query.from {
            Source::Collection(c) => Some(c.collection.clone()),
            Source::Query(_) => None,
        },
        Source::Query(_) => None,
    }
}

/// Reject references to aliases outside `scope`. Single-segment references
/// are allowed only where they name a selected field.
fn check_refs(expr: &Expr, scope: &[String], allow_raw: bool) -> Result<()> {
    for r in expr.refs() {
        match r.alias() {
            Some(alias) if scope.iter().any(|s| s == alias) => {}
            Some(alias) => return Err(Error::UnknownAlias(alias.to_string())),
            None if allow_raw => {}
            None => {
                return Err(Error::UnknownAlias(
                    r.path.first().cloned().unwrap_or_default(),
                ))
            }
        }
    }
    Ok(())
}

/// Replace aggregate calls with references into the folded `$agg` array.
fn extract_aggregates(expr: &Expr, found: &mut Vec<(String, Vec<Expr>)>) -> Expr {
    match expr {
        Expr::Aggregate { name, args } => {
            let entry = (name.clone(), args.clone());
            let i = match found.iter().position(|f| *f == entry) {
                Some(i) => i,
                None => {
                    found.push(entry);
                    found.len() - 1
                }
            };
            Expr::prop(vec![AGG_FIELD.to_string(), i.to_string()])
        }
        Expr::Func { name, args } => Expr::func(
            name.clone(),
            args.iter().map(|a| extract_aggregates(a, found)).collect(),
        ),
        other => other.clone(),
    }
}

/// Point single-segment references at the selected row.
fn selected_refs(expr: &Expr) -> Expr {
    expr.map_refs(&|r| {
        if r.path.len() == 1 {
            Expr::prop(vec![SELECTED_FIELD.to_string(), r.path[0].clone()])
        } else {
            Expr::Ref(r.clone())
        }
    })
}

#[derive(Default)]
struct Compiler {
    sources: Vec<SourcePlan>,
    aliases: HashSet<String>,
    lazy_requests: LazyRequests,
    deficit: Deficit,
}

/// A compiled source and, when it reads a collection directly, the index of
/// its [`SourcePlan`].
struct Input {
    op: Box<dyn Operator>,
    plan: Option<usize>,
}

enum Side {
    Left,
    Right,
}

impl Compiler {
    fn register_alias(&mut self, alias: &str) -> Result<()> {
        if !self.aliases.insert(alias.to_string()) {
            return Err(Error::DuplicateAlias(alias.to_string()));
        }
        Ok(())
    }

    fn compile_source(&mut self, source: &Source) -> Result<Input> {
        let alias = source.alias().to_string();
        self.register_alias(&alias)?;
        let (collection, where_) = match source {
            Source::Collection(c) => (c.collection.clone(), None),
            Source::Query(q) if is_pushdown_wrapper(source) => {
                let collection = collection_of(source)
                    .ok_or_else(|| Error::UnsupportedJoin(format!("source '{alias}'")))?;
                for predicate in &q.query.where_ {
                    check_refs(predicate, std::slice::from_ref(&alias), false)?;
                }
                let where_ = combine_and(q.query.where_.clone()).map(|e| e.strip_alias(&alias));
                (collection, where_)
            }
            Source::Query(q) => {
                let nested = self.compile_scope(&q.query, false)?;
                let single = single_alias(&q.query);
                let value = MapOp::new(
                    nested,
                    Rc::new(move |row: &Value| result_of(row, single.as_deref())),
                );
                return Ok(Input {
                    op: Box::new(NamespaceOp::new(Box::new(value), alias)),
                    plan: None,
                });
            }
        };
        self.sources.push(SourcePlan {
            alias: alias.clone(),
            collection,
            where_,
            lazy: None,
            limited: None,
        });
        Ok(Input {
            op: Box::new(SourceOp::new(alias.clone(), alias)),
            plan: Some(self.sources.len() - 1),
        })
    }

    fn compile_scope(&mut self, query: &QueryIr, top: bool) -> Result<Box<dyn Operator>> {
        if (query.limit.is_some() || query.offset.is_some()) && query.order_by.is_empty() {
            return Err(Error::LimitWithoutOrderBy);
        }
        if !query.having.is_empty() && query.group_by.is_empty() && !query.has_aggregate_select() {
            return Err(Error::HavingWithoutGroupBy);
        }
        let scope: Vec<String> = query.scope_aliases().into_iter().map(String::from).collect();

        let from = self.compile_source(&query.from)?;
        let mut left_plan = from.plan;
        let mut pipeline = from.op;
        let mut seen = vec![query.from.alias().to_string()];
        for (position, join) in query.joins.iter().enumerate() {
            pipeline = self.compile_join(pipeline, left_plan, &seen, &scope, position, join)?;
            left_plan = None;
            seen.push(join.source.alias().to_string());
        }

        for predicate in &query.where_ {
            check_refs(predicate, &scope, false)?;
        }
        if let Some(predicate) = combine_and(query.where_.clone()) {
            pipeline = Box::new(FilterOp::new(pipeline, compile_predicate(&predicate)?));
        }
        for f in &query.fn_where {
            pipeline = Box::new(FilterOp::new(pipeline, f.0.clone()));
        }

        // Aggregates in select, having and order-by all read the same fold.
        let mut aggregates: Vec<(String, Vec<Expr>)> = Vec::new();
        let select: Option<Vec<(String, Expr)>> = match &query.select {
            Some(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    check_refs(&item.expr, &scope, false)?;
                    out.push((item.alias.clone(), extract_aggregates(&item.expr, &mut aggregates)));
                }
                Some(out)
            }
            None => None,
        };
        let mut having = Vec::with_capacity(query.having.len());
        for predicate in &query.having {
            check_refs(predicate, &scope, true)?;
            having.push(selected_refs(&extract_aggregates(predicate, &mut aggregates)));
        }
        let mut order = Vec::with_capacity(query.order_by.len());
        for clause in &query.order_by {
            check_refs(&clause.expr, &scope, true)?;
            order.push((
                selected_refs(&extract_aggregates(&clause.expr, &mut aggregates)),
                clause.options,
            ));
        }

        let grouped = !query.group_by.is_empty() || !aggregates.is_empty();
        if grouped {
            let mut group_by: Vec<Evaluator> = Vec::with_capacity(query.group_by.len());
            for expr in &query.group_by {
                check_refs(expr, &scope, false)?;
                group_by.push(compile(expr)?);
            }
            let mut folds = Vec::with_capacity(aggregates.len());
            for (name, args) in &aggregates {
                let kind = AggregateKind::from_name(name)?;
                let arg = args.first().map(compile).transpose()?;
                folds.push((kind, arg));
            }
            pipeline = Box::new(ReduceOp::new(pipeline, group_by, folds));
        }

        if let Some(items) = select {
            let items: Vec<(String, Evaluator)> = items
                .iter()
                .map(|(alias, expr)| Ok((alias.clone(), compile(expr)?)))
                .collect::<Result<_>>()?;
            pipeline = Box::new(MapOp::new(
                pipeline,
                Rc::new(move |row: &Value| {
                    let selected: Map<String, Value> =
                        items.iter().map(|(alias, f)| (alias.clone(), f(row))).collect();
                    with_field(row, SELECTED_FIELD, Value::Object(selected))
                }),
            ));
        }
        if let Some(f) = &query.fn_select {
            let f = f.0.clone();
            pipeline = Box::new(MapOp::new(
                pipeline,
                Rc::new(move |row: &Value| with_field(row, SELECTED_FIELD, f(row))),
            ));
        }

        if let Some(predicate) = combine_and(having) {
            pipeline = Box::new(FilterOp::new(pipeline, compile_predicate(&predicate)?));
        }

        if query.distinct {
            if query.select.is_none() && query.fn_select.is_none() {
                let single = single_alias(query);
                pipeline = Box::new(MapOp::new(
                    pipeline,
                    Rc::new(move |row: &Value| {
                        with_field(row, SELECTED_FIELD, result_of(row, single.as_deref()))
                    }),
                ));
            }
            pipeline = Box::new(DistinctOp::new(pipeline));
        }

        if !order.is_empty() {
            let mut evaluators = Vec::with_capacity(order.len());
            let mut options = Vec::with_capacity(order.len());
            for (expr, opts) in &order {
                evaluators.push(compile(expr)?);
                options.push(*opts);
            }
            let deficit = if top {
                Rc::clone(&self.deficit)
            } else {
                Deficit::default()
            };
            pipeline = Box::new(TopKOp::new(
                pipeline,
                evaluators,
                options,
                query.limit,
                query.offset.unwrap_or(0),
                deficit,
            ));
        }
        Ok(pipeline)
    }

    fn compile_join(
        &mut self,
        left: Box<dyn Operator>,
        left_plan: Option<usize>,
        seen: &[String],
        scope: &[String],
        position: usize,
        join: &JoinClause,
    ) -> Result<Box<dyn Operator>> {
        if join.kind == JoinKind::Cross {
            return Err(Error::UnsupportedJoin("cross join".to_string()));
        }
        check_refs(&join.left, scope, false)?;
        check_refs(&join.right, scope, false)?;
        let alias = join.source.alias().to_string();
        let (left_expr, right_expr) = orient(join, &alias, seen)?;
        let right = self.compile_source(&join.source)?;

        let lazy_side = match join.kind {
            JoinKind::Left => Some(Side::Right),
            JoinKind::Right if position == 0 => Some(Side::Left),
            JoinKind::Inner if position == 0 => {
                let size = |plan: Option<usize>| {
                    plan.and_then(|i| self.sources.get(i))
                        .and_then(|s| s.collection.size().ok())
                        .unwrap_or(0)
                };
                if size(left_plan) > size(right.plan) {
                    Some(Side::Left)
                } else {
                    Some(Side::Right)
                }
            }
            JoinKind::Inner => Some(Side::Right),
            _ => None,
        };

        let left_key = compile(&left_expr)?;
        let right_key = compile(&right_expr)?;
        let (mut left_op, mut right_op) = (left, right.op);
        match lazy_side {
            Some(Side::Right) => {
                if let Some(field) = self.mark_lazy(right.plan, &right_expr) {
                    left_op = self.tap_keys(left_op, &left_key, &alias, field);
                }
            }
            Some(Side::Left) => {
                if let Some(field) = self.mark_lazy(left_plan, &left_expr) {
                    let input = seen.first().cloned().unwrap_or_default();
                    right_op = self.tap_keys(right_op, &right_key, &input, field);
                }
            }
            None => {}
        }

        Ok(Box::new(JoinOp::new(
            left_op,
            right_op,
            join.kind,
            left_key,
            right_key,
            seen.to_vec(),
            vec![alias],
        )))
    }

    /// Mark a collection source lazy when its join key is a plain field.
    fn mark_lazy(&mut self, plan: Option<usize>, key: &Expr) -> Option<Vec<String>> {
        let plan = self.sources.get_mut(plan?)?;
        let path = key.as_ref_path()?;
        if path.len() < 2 || path[0] != plan.alias {
            return None;
        }
        let field = path[1..].to_vec();
        plan.lazy = Some(field.clone());
        Some(field)
    }

    /// Record join keys flowing through the eager side.
    fn tap_keys(
        &self,
        op: Box<dyn Operator>,
        key: &Evaluator,
        input: &str,
        field: Vec<String>,
    ) -> Box<dyn Operator> {
        let key = Rc::clone(key);
        let requests = Rc::clone(&self.lazy_requests);
        let input = input.to_string();
        Box::new(TapOp::new(op, move |diffs| {
            let values: Vec<Value> = diffs
                .iter()
                .filter(|(_, _, m)| *m > 0)
                .map(|(_, row, _)| key(row))
                .filter(|v| !v.is_null())
                .collect();
            if !values.is_empty() {
                requests.borrow_mut().push(LazyRequest {
                    input: input.clone(),
                    field: field.clone(),
                    values,
                });
            }
        }))
    }
}

/// Split a join condition into the expression over earlier sources and the
/// expression over the joined source.
fn orient(join: &JoinClause, alias: &str, seen: &[String]) -> Result<(Expr, Expr)> {
    let only_joined = |e: &Expr| {
        let aliases = e.aliases();
        aliases.len() == 1 && aliases.contains(alias)
    };
    let only_earlier = |e: &Expr| {
        let aliases = e.aliases();
        !aliases.is_empty() && aliases.iter().all(|a| seen.contains(a))
    };
    if only_earlier(&join.left) && only_joined(&join.right) {
        Ok((join.left.clone(), join.right.clone()))
    } else if only_joined(&join.left) && only_earlier(&join.right) {
        Ok((join.right.clone(), join.left.clone()))
    } else {
        Err(Error::UnsupportedJoin(format!(
            "join on '{alias}' must compare it with an earlier source: {} = {}",
            join.left, join.right
        )))
    }
}

fn with_field(row: &Value, field: &str, value: Value) -> Value {
    let mut out = match row {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    out.insert(field.to_string(), value);
    Value::Object(out)
}
