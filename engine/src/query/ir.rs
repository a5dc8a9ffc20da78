//! Intermediate representation of queries.
//!
//! The IR is an immutable tree: the optimizer produces new trees rather than
//! editing existing ones. Expressions reference fields through [`PropRef`]
//! paths whose first segment is the source alias (`["todos", "done"]`).
//! Expressions handed to collections and sync backends (subscription filters,
//! `load_subset` options) use paths relative to the row instead.

use crate::collection::Collection;
use crate::compare::CompareOptions;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

/// Path into a (namespaced) row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropRef {
    pub path: Vec<String>,
}

impl PropRef {
    pub fn new(path: Vec<String>) -> Self {
        Self { path }
    }

    /// The alias this reference points into, if it is namespaced.
    pub fn alias(&self) -> Option<&str> {
        if self.path.len() > 1 {
            self.path.first().map(|s| s.as_str())
        } else {
            None
        }
    }
}

/// Expression node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Expr {
    Ref(PropRef),
    Value { value: Value },
    Func { name: String, args: Vec<Expr> },
    Aggregate { name: String, args: Vec<Expr> },
}

impl Expr {
    pub fn prop(path: Vec<String>) -> Self {
        Expr::Ref(PropRef::new(path))
    }

    pub fn value(value: Value) -> Self {
        Expr::Value { value }
    }

    pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Func {
            name: name.into(),
            args,
        }
    }

    pub fn as_ref_path(&self) -> Option<&[String]> {
        match self {
            Expr::Ref(r) => Some(&r.path),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Expr::Value { value } => Some(value),
            _ => None,
        }
    }

    /// Visit every node, parents before children.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        if let Expr::Func { args, .. } | Expr::Aggregate { args, .. } = self {
            for arg in args {
                arg.walk(f);
            }
        }
    }

    /// Produce a new tree with every [`PropRef`] rewritten by `f`.
    pub fn map_refs(&self, f: &dyn Fn(&PropRef) -> Expr) -> Expr {
        match self {
            Expr::Ref(r) => f(r),
            Expr::Value { .. } => self.clone(),
            Expr::Func { name, args } => Expr::Func {
                name: name.clone(),
                args: args.iter().map(|a| a.map_refs(f)).collect(),
            },
            Expr::Aggregate { name, args } => Expr::Aggregate {
                name: name.clone(),
                args: args.iter().map(|a| a.map_refs(f)).collect(),
            },
        }
    }

    /// Every property reference in the tree.
    pub fn refs(&self) -> Vec<&PropRef> {
        let mut out = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Ref(r) = e {
                out.push(r);
            }
        });
        out
    }

    /// Aliases referenced by namespaced paths.
    pub fn aliases(&self) -> BTreeSet<String> {
        self.refs()
            .into_iter()
            .filter_map(|r| r.alias().map(|a| a.to_string()))
            .collect()
    }

    /// Whether a non-namespaced (single segment) reference appears.
    pub fn has_raw_ref(&self) -> bool {
        self.refs().iter().any(|r| r.path.len() <= 1)
    }

    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e, Expr::Aggregate { .. }) {
                found = true;
            }
        });
        found
    }

    /// Drop a leading alias segment from every reference into `alias`.
    pub fn strip_alias(&self, alias: &str) -> Expr {
        self.map_refs(&|r| {
            if r.path.len() > 1 && r.path[0] == alias {
                Expr::prop(r.path[1..].to_vec())
            } else {
                Expr::Ref(r.clone())
            }
        })
    }

    /// Prefix every reference with `alias`.
    pub fn with_alias(&self, alias: &str) -> Expr {
        self.map_refs(&|r| {
            let mut path = Vec::with_capacity(r.path.len() + 1);
            path.push(alias.to_string());
            path.extend(r.path.iter().cloned());
            Expr::prop(path)
        })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Ref(r) => write!(f, "{}", r.path.join(".")),
            Expr::Value { value } => write!(f, "{value}"),
            Expr::Func { name, args } | Expr::Aggregate { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Split nested `and(...)` calls into their conjuncts.
pub fn split_and(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::Func { name, args } if name == "and" => args.iter().flat_map(split_and).collect(),
        other => vec![other.clone()],
    }
}

/// Combine predicates with `and`; `None` for an empty list.
pub fn combine_and(mut predicates: Vec<Expr>) -> Option<Expr> {
    match predicates.len() {
        0 => None,
        1 => predicates.pop(),
        _ => Some(Expr::func("and", predicates)),
    }
}

/// Collection-backed source.
#[derive(Clone)]
pub struct CollectionRef {
    pub collection: Collection,
    pub alias: String,
}

/// Nested query used as a source.
#[derive(Clone)]
pub struct QueryRef {
    pub query: Box<QueryIr>,
    pub alias: String,
}

#[derive(Clone)]
pub enum Source {
    Collection(CollectionRef),
    Query(QueryRef),
}

impl Source {
    pub fn alias(&self) -> &str {
        match self {
            Source::Collection(c) => &c.alias,
            Source::Query(q) => &q.alias,
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Collection(c) => f
                .debug_struct("CollectionRef")
                .field("collection", &c.collection.id())
                .field("alias", &c.alias)
                .finish(),
            Source::Query(q) => f
                .debug_struct("QueryRef")
                .field("alias", &q.alias)
                .field("query", &q.query)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone)]
pub struct JoinClause {
    pub source: Source,
    pub kind: JoinKind,
    /// One side of the equality; may reference either source.
    pub left: Expr,
    pub right: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderByClause {
    pub expr: Expr,
    pub options: CompareOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub alias: String,
    pub expr: Expr,
}

/// Row predicate escape hatch evaluated on namespaced rows.
#[derive(Clone)]
pub struct FnWhere(pub Rc<dyn Fn(&Value) -> bool>);

/// Row projection escape hatch evaluated on namespaced rows.
#[derive(Clone)]
pub struct FnSelect(pub Rc<dyn Fn(&Value) -> Value>);

impl fmt::Debug for FnWhere {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnWhere(..)")
    }
}

impl fmt::Debug for FnSelect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnSelect(..)")
    }
}

#[derive(Debug, Clone)]
pub struct QueryIr {
    pub from: Source,
    pub joins: Vec<JoinClause>,
    pub where_: Vec<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Vec<Expr>,
    pub order_by: Vec<OrderByClause>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub distinct: bool,
    pub select: Option<Vec<SelectItem>>,
    pub fn_where: Vec<FnWhere>,
    pub fn_select: Option<FnSelect>,
    pub single_result: bool,
}

impl QueryIr {
    pub fn new(from: Source) -> Self {
        Self {
            from,
            joins: Vec::new(),
            where_: Vec::new(),
            group_by: Vec::new(),
            having: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
            select: None,
            fn_where: Vec::new(),
            fn_select: None,
            single_result: false,
        }
    }

    /// Whether select contains an aggregate (implies one implicit group
    /// when there is no group-by).
    pub fn has_aggregate_select(&self) -> bool {
        self.select
            .as_ref()
            .is_some_and(|items| items.iter().any(|i| i.expr.contains_aggregate()))
    }

    /// A query that only filters one collection. Such queries come out of
    /// predicate push-down and are served directly by a collection
    /// subscription.
    pub fn is_simple_filter(&self) -> bool {
        matches!(self.from, Source::Collection(_))
            && self.joins.is_empty()
            && self.group_by.is_empty()
            && self.having.is_empty()
            && self.order_by.is_empty()
            && self.limit.is_none()
            && self.offset.is_none()
            && !self.distinct
            && self.select.is_none()
            && self.fn_where.is_empty()
            && self.fn_select.is_none()
    }

    /// Every source alias in this query scope (not nested scopes).
    pub fn scope_aliases(&self) -> Vec<&str> {
        std::iter::once(self.from.alias())
            .chain(self.joins.iter().map(|j| j.source.alias()))
            .collect()
    }
}
