//! Typed query construction.
//!
//! ```ignore
//! let q = Query::from_collection("todos", &todos)
//!     .where_(eq(prop("todos.done"), val(false)))
//!     .order_by(prop("todos.created"), CompareOptions::desc())
//!     .limit(20);
//! ```

use crate::collection::Collection;
use crate::compare::CompareOptions;
use crate::query::ir::{
    CollectionRef, Expr, FnSelect, FnWhere, JoinClause, JoinKind, OrderByClause, QueryIr, QueryRef,
    SelectItem, Source,
};
use serde_json::Value;
use std::rc::Rc;

/// Reference to a field, written as a dotted path (`"todos.owner.name"`).
pub fn prop(path: &str) -> Expr {
    Expr::prop(path.split('.').map(String::from).collect())
}

/// A literal.
pub fn val(value: impl Into<Value>) -> Expr {
    Expr::value(value.into())
}

macro_rules! binary_fns {
    ($($name:ident => $func:literal),* $(,)?) => {
        $(
            pub fn $name(a: Expr, b: Expr) -> Expr {
                Expr::func($func, vec![a, b])
            }
        )*
    };
}

macro_rules! unary_fns {
    ($($name:ident => $func:literal),* $(,)?) => {
        $(
            pub fn $name(a: Expr) -> Expr {
                Expr::func($func, vec![a])
            }
        )*
    };
}

macro_rules! aggregate_fns {
    ($($name:ident),* $(,)?) => {
        $(
            pub fn $name(a: Expr) -> Expr {
                Expr::Aggregate {
                    name: stringify!($name).to_string(),
                    args: vec![a],
                }
            }
        )*
    };
}

binary_fns! {
    eq => "eq",
    gt => "gt",
    gte => "gte",
    lt => "lt",
    lte => "lte",
    in_array => "in",
    like => "like",
    ilike => "ilike",
    add => "add",
    subtract => "subtract",
    multiply => "multiply",
    divide => "divide",
}

unary_fns! {
    not => "not",
    is_null => "is_null",
    is_undefined => "is_undefined",
    upper => "upper",
    lower => "lower",
    length => "length",
}

aggregate_fns!(count, sum, avg, min, max);

pub fn and(args: Vec<Expr>) -> Expr {
    Expr::func("and", args)
}

pub fn or(args: Vec<Expr>) -> Expr {
    Expr::func("or", args)
}

pub fn concat(args: Vec<Expr>) -> Expr {
    Expr::func("concat", args)
}

pub fn coalesce(args: Vec<Expr>) -> Expr {
    Expr::func("coalesce", args)
}

/// Right-hand side of a join.
pub enum JoinSource {
    Collection(Collection),
    Query(Query),
}

impl From<&Collection> for JoinSource {
    fn from(collection: &Collection) -> Self {
        JoinSource::Collection(collection.clone())
    }
}

impl From<Query> for JoinSource {
    fn from(query: Query) -> Self {
        JoinSource::Query(query)
    }
}

impl JoinSource {
    fn into_source(self, alias: &str) -> Source {
        match self {
            JoinSource::Collection(collection) => Source::Collection(CollectionRef {
                collection,
                alias: alias.to_string(),
            }),
            JoinSource::Query(query) => Source::Query(QueryRef {
                query: Box::new(query.ir),
                alias: alias.to_string(),
            }),
        }
    }
}

/// Query builder. Every method consumes and returns the builder.
#[derive(Debug, Clone)]
pub struct Query {
    ir: QueryIr,
}

impl Query {
    pub fn from_collection(alias: &str, collection: &Collection) -> Self {
        Self {
            ir: QueryIr::new(Source::Collection(CollectionRef {
                collection: collection.clone(),
                alias: alias.to_string(),
            })),
        }
    }

    /// Use another query's results as the source.
    pub fn from_query(alias: &str, query: Query) -> Self {
        Self {
            ir: QueryIr::new(Source::Query(QueryRef {
                query: Box::new(query.ir),
                alias: alias.to_string(),
            })),
        }
    }

    /// Join on `left == right`.
    pub fn join(
        mut self,
        kind: JoinKind,
        alias: &str,
        source: impl Into<JoinSource>,
        left: Expr,
        right: Expr,
    ) -> Self {
        self.ir.joins.push(JoinClause {
            source: source.into().into_source(alias),
            kind,
            left,
            right,
        });
        self
    }

    pub fn inner_join(self, alias: &str, source: impl Into<JoinSource>, left: Expr, right: Expr) -> Self {
        self.join(JoinKind::Inner, alias, source, left, right)
    }

    pub fn left_join(self, alias: &str, source: impl Into<JoinSource>, left: Expr, right: Expr) -> Self {
        self.join(JoinKind::Left, alias, source, left, right)
    }

    pub fn right_join(self, alias: &str, source: impl Into<JoinSource>, left: Expr, right: Expr) -> Self {
        self.join(JoinKind::Right, alias, source, left, right)
    }

    pub fn full_join(self, alias: &str, source: impl Into<JoinSource>, left: Expr, right: Expr) -> Self {
        self.join(JoinKind::Full, alias, source, left, right)
    }

    /// Add a predicate; several calls are combined with `and`.
    pub fn where_(mut self, predicate: Expr) -> Self {
        self.ir.where_.push(predicate);
        self
    }

    /// Filter with a closure over the namespaced row. Such filters cannot be
    /// pushed down or served by indexes.
    pub fn fn_where(mut self, f: impl Fn(&Value) -> bool + 'static) -> Self {
        self.ir.fn_where.push(FnWhere(Rc::new(f)));
        self
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.ir.group_by.push(expr);
        self
    }

    pub fn having(mut self, predicate: Expr) -> Self {
        self.ir.having.push(predicate);
        self
    }

    pub fn order_by(mut self, expr: Expr, options: CompareOptions) -> Self {
        self.ir.order_by.push(OrderByClause { expr, options });
        self
    }

    pub fn order_by_asc(self, expr: Expr) -> Self {
        self.order_by(expr, CompareOptions::default())
    }

    pub fn order_by_desc(self, expr: Expr) -> Self {
        self.order_by(expr, CompareOptions::desc())
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.ir.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.ir.offset = Some(offset);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.ir.distinct = true;
        self
    }

    /// Project each row to `{alias: expr, ...}`.
    pub fn select(mut self, items: Vec<(&str, Expr)>) -> Self {
        self.ir.select = Some(
            items
                .into_iter()
                .map(|(alias, expr)| SelectItem {
                    alias: alias.to_string(),
                    expr,
                })
                .collect(),
        );
        self
    }

    pub fn fn_select(mut self, f: impl Fn(&Value) -> Value + 'static) -> Self {
        self.ir.fn_select = Some(FnSelect(Rc::new(f)));
        self
    }

    /// Mark the query as producing a single row; consumers read it with
    /// `LiveQuery::first`.
    pub fn find_one(mut self) -> Self {
        self.ir.single_result = true;
        self
    }

    pub fn ir(&self) -> &QueryIr {
        &self.ir
    }

    pub fn build(self) -> QueryIr {
        self.ir
    }
}

impl From<Query> for QueryIr {
    fn from(query: Query) -> Self {
        query.ir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn helpers_build_ir() {
        let e = and(vec![
            eq(prop("todos.done"), val(false)),
            gt(length(prop("todos.title")), val(3)),
        ]);
        assert_eq!(e.to_string(), "and(eq(todos.done, false), gt(length(todos.title), 3))");
        assert_eq!(
            count(prop("todos.id")),
            Expr::Aggregate {
                name: "count".into(),
                args: vec![Expr::prop(vec!["todos".into(), "id".into()])],
            }
        );
        assert_eq!(val("x"), Expr::value(json!("x")));
    }
}
