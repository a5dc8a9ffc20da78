//! Predicate push-down.
//!
//! Conjuncts of a query's `where` that touch exactly one collection-backed
//! source are moved into a filter-only subquery wrapping that source, under
//! the same alias. The compiler serves such wrappers with a filtered
//! collection subscription, which lets indexes and on-demand backends see the
//! predicate. Sources that can be null-extended by an outer join keep a
//! residual copy of the predicate at the outer level, since null-extended
//! rows must still be tested against it.

use crate::query::ir::{split_and, Expr, JoinKind, QueryIr, QueryRef, Source};
use std::collections::BTreeSet;

/// Optimise `query` and every nested query.
pub fn optimize(query: &QueryIr) -> QueryIr {
    let mut query = query.clone();
    query.from = optimize_source(&query.from);
    for join in &mut query.joins {
        join.source = optimize_source(&join.source);
    }
    push_down(query)
}

fn optimize_source(source: &Source) -> Source {
    match source {
        Source::Collection(_) => source.clone(),
        Source::Query(q) => Source::Query(QueryRef {
            query: Box::new(optimize(&q.query)),
            alias: q.alias.clone(),
        }),
    }
}

/// Whether `source` is a filter-only wrapper produced by push-down.
pub fn is_pushdown_wrapper(source: &Source) -> bool {
    match source {
        Source::Query(q) => q.query.is_simple_filter() && q.query.from.alias() == q.alias,
        Source::Collection(_) => false,
    }
}

/// Aliases whose rows an outer join may replace with nulls.
fn nullable_aliases(query: &QueryIr) -> BTreeSet<String> {
    let mut nullable = BTreeSet::new();
    let mut seen: Vec<&str> = vec![query.from.alias()];
    for join in &query.joins {
        let alias = join.source.alias();
        match join.kind {
            JoinKind::Left => {
                nullable.insert(alias.to_string());
            }
            JoinKind::Right => nullable.extend(seen.iter().map(|a| a.to_string())),
            JoinKind::Full => {
                nullable.extend(seen.iter().map(|a| a.to_string()));
                nullable.insert(alias.to_string());
            }
            JoinKind::Inner | JoinKind::Cross => {}
        }
        seen.push(alias);
    }
    nullable
}

fn can_push(expr: &Expr) -> Option<String> {
    if expr.has_raw_ref() || expr.contains_aggregate() {
        return None;
    }
    let aliases = expr.aliases();
    if aliases.len() != 1 {
        return None;
    }
    aliases.into_iter().next()
}

fn push_down(mut query: QueryIr) -> QueryIr {
    if query.where_.is_empty() {
        return query;
    }
    let nullable = nullable_aliases(&query);
    let conjuncts: Vec<Expr> = query.where_.iter().flat_map(split_and).collect();
    let mut residual = Vec::new();
    for predicate in conjuncts {
        let target = can_push(&predicate).and_then(|alias| {
            let source = std::iter::once(&mut query.from)
                .chain(query.joins.iter_mut().map(|j| &mut j.source))
                .find(|s| s.alias() == alias)?;
            wrap_with(source, predicate.clone()).then_some(alias)
        });
        match target {
            Some(alias) if nullable.contains(&alias) => residual.push(predicate),
            Some(_) => {}
            None => residual.push(predicate),
        }
    }
    query.where_ = residual;
    query
}

/// Add `predicate` to the wrapper around `source`, creating the wrapper if
/// needed. Returns false when `source` cannot take it.
fn wrap_with(source: &mut Source, predicate: Expr) -> bool {
    match source {
        Source::Collection(collection) => {
            let mut inner = QueryIr::new(Source::Collection(collection.clone()));
            inner.where_.push(predicate);
            *source = Source::Query(QueryRef {
                alias: collection.alias.clone(),
                query: Box::new(inner),
            });
            true
        }
        Source::Query(q) if q.query.is_simple_filter() && q.query.from.alias() == q.alias => {
            q.query.where_.push(predicate);
            true
        }
        Source::Query(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectionConfig;
    use crate::query::builder::{eq, gt, prop, val, Query};
    use crate::store::Store;

    fn store_with(ids: &[&str]) -> (Store, Vec<crate::Collection>) {
        let store = Store::new();
        let collections = ids
            .iter()
            .map(|id| store.create_collection(CollectionConfig::keyed_by(*id, "id")).unwrap())
            .collect();
        (store, collections)
    }

    fn wrapper_where(source: &Source) -> Vec<String> {
        match source {
            Source::Query(q) => q.query.where_.iter().map(|e| e.to_string()).collect(),
            Source::Collection(_) => Vec::new(),
        }
    }

    #[test]
    fn pushes_single_source_predicates() {
        let (_store, c) = store_with(&["users", "posts"]);
        let query = Query::from_collection("u", &c[0])
            .inner_join("p", &c[1], prop("u.id"), prop("p.author"))
            .where_(eq(prop("u.active"), val(true)))
            .where_(gt(prop("p.likes"), prop("u.karma")))
            .build();
        let optimized = optimize(&query);
        assert!(is_pushdown_wrapper(&optimized.from));
        assert_eq!(wrapper_where(&optimized.from), vec!["eq(u.active, true)"]);
        assert!(!is_pushdown_wrapper(&optimized.joins[0].source));
        assert_eq!(optimized.where_.len(), 1);
    }

    #[test]
    fn outer_join_keeps_residual() {
        let (_store, c) = store_with(&["users", "posts"]);
        let query = Query::from_collection("u", &c[0])
            .left_join("p", &c[1], prop("u.id"), prop("p.author"))
            .where_(eq(prop("p.published"), val(true)))
            .where_(eq(prop("u.active"), val(true)))
            .build();
        let optimized = optimize(&query);
        assert_eq!(wrapper_where(&optimized.joins[0].source), vec!["eq(p.published, true)"]);
        assert_eq!(wrapper_where(&optimized.from), vec!["eq(u.active, true)"]);
        let residual: Vec<String> = optimized.where_.iter().map(|e| e.to_string()).collect();
        assert_eq!(residual, vec!["eq(p.published, true)"]);
    }

    #[test]
    fn merges_into_existing_wrapper() {
        let (_store, c) = store_with(&["users"]);
        let query = Query::from_collection("u", &c[0])
            .where_(eq(prop("u.active"), val(true)))
            .build();
        let once = optimize(&query);
        let mut again = once.clone();
        again.where_.push(gt(prop("u.age"), val(18)));
        let twice = optimize(&again);
        assert_eq!(
            wrapper_where(&twice.from),
            vec!["eq(u.active, true)", "gt(u.age, 18)"]
        );
        assert!(twice.where_.is_empty());
    }
}
