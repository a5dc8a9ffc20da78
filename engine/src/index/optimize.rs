//! Answering `where` expressions from indexes.
//!
//! The result is a candidate key set: a superset of the matching keys. Callers
//! always re-check the full predicate against the row.

use super::{IndexOperation, IndexSet};
use crate::key::Key;
use crate::query::ir::Expr;
use serde_json::Value;
use std::collections::BTreeSet;

/// A comparison of a row field against a literal.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldComparison<'a> {
    pub path: &'a [String],
    pub op: IndexOperation,
    pub value: &'a Value,
}

/// Recognise `op(field, literal)` and `op(literal, field)`.
pub fn as_field_comparison(expr: &Expr) -> Option<FieldComparison<'_>> {
    let Expr::Func { name, args } = expr else {
        return None;
    };
    let op = IndexOperation::from_func_name(name)?;
    let [lhs, rhs] = args.as_slice() else {
        return None;
    };
    match (lhs.as_ref_path(), rhs.as_value(), rhs.as_ref_path(), lhs.as_value()) {
        (Some(path), Some(value), _, _) => Some(FieldComparison { path, op, value }),
        // `in` only makes sense with the field on the left.
        (_, _, Some(path), Some(value)) if op != IndexOperation::In => Some(FieldComparison {
            path,
            op: op.flipped(),
            value,
        }),
        _ => None,
    }
}

/// Candidate keys for `expr`, or `None` when the indexes cannot narrow it.
pub fn candidate_keys(expr: &Expr, indexes: &IndexSet) -> Option<BTreeSet<Key>> {
    match expr {
        Expr::Func { name, args } if name == "and" => {
            let mut result: Option<BTreeSet<Key>> = None;
            for arg in args {
                if let Some(keys) = candidate_keys(arg, indexes) {
                    result = Some(match result {
                        Some(acc) => acc.intersection(&keys).cloned().collect(),
                        None => keys,
                    });
                }
            }
            result
        }
        Expr::Func { name, args } if name == "or" => {
            let mut result = BTreeSet::new();
            for arg in args {
                result.extend(candidate_keys(arg, indexes)?);
            }
            Some(result)
        }
        _ => {
            let comparison = as_field_comparison(expr)?;
            let proxy = indexes.find_for_lookup(comparison.path, comparison.op)?;
            proxy.lookup(comparison.op, comparison.value).ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::CompareOptions;
    use crate::index::lazy::IndexSource;
    use crate::index::IndexProxy;
    use serde_json::json;
    use std::rc::Rc;

    struct Rows;

    impl IndexSource for Rows {
        fn index_entries(&self) -> Vec<(Key, Value)> {
            (1..=6)
                .map(|i| (Key::from(i), json!({"age": i * 10, "team": i % 2})))
                .collect()
        }
    }

    fn indexes() -> (Rc<dyn IndexSource>, IndexSet) {
        let source: Rc<dyn IndexSource> = Rc::new(Rows);
        let mut set = IndexSet::new();
        let id = set.next_id();
        set.insert(
            IndexProxy::eager(
                id,
                vec!["age".into()],
                CompareOptions::default(),
                source.index_entries(),
                Rc::downgrade(&source),
            )
            .unwrap(),
        );
        (source, set)
    }

    fn field(name: &str) -> Expr {
        Expr::prop(vec![name.to_string()])
    }

    fn keys(ids: &[i64]) -> BTreeSet<Key> {
        ids.iter().map(|i| Key::from(*i)).collect()
    }

    #[test]
    fn single_comparisons() {
        let (_source, set) = indexes();
        let gt = Expr::func("gt", vec![field("age"), Expr::value(json!(40))]);
        assert_eq!(candidate_keys(&gt, &set), Some(keys(&[5, 6])));
        // 40 > age
        let flipped = Expr::func("gt", vec![Expr::value(json!(40)), field("age")]);
        assert_eq!(candidate_keys(&flipped, &set), Some(keys(&[1, 2, 3])));
        let within = Expr::func("in", vec![field("age"), Expr::value(json!([10, 60, 99]))]);
        assert_eq!(candidate_keys(&within, &set), Some(keys(&[1, 6])));
    }

    #[test]
    fn and_uses_any_indexed_conjunct() {
        let (_source, set) = indexes();
        let expr = Expr::func(
            "and",
            vec![
                Expr::func("lte", vec![field("age"), Expr::value(json!(30))]),
                Expr::func("eq", vec![field("team"), Expr::value(json!(1))]),
            ],
        );
        assert_eq!(candidate_keys(&expr, &set), Some(keys(&[1, 2, 3])));
    }

    #[test]
    fn or_requires_every_branch() {
        let (_source, set) = indexes();
        let indexed = Expr::func(
            "or",
            vec![
                Expr::func("eq", vec![field("age"), Expr::value(json!(10))]),
                Expr::func("eq", vec![field("age"), Expr::value(json!(20))]),
            ],
        );
        assert_eq!(candidate_keys(&indexed, &set), Some(keys(&[1, 2])));
        let partial = Expr::func(
            "or",
            vec![
                Expr::func("eq", vec![field("age"), Expr::value(json!(10))]),
                Expr::func("eq", vec![field("team"), Expr::value(json!(0))]),
            ],
        );
        assert_eq!(candidate_keys(&partial, &set), None);
    }
}
