//! Index inference from query shape.
//!
//! With `autoIndex: eager` a collection creates a B-tree index for every field
//! that a subscription filters on or a limited query orders by, unless a
//! suitable index already exists.

use super::optimize::as_field_comparison;
use super::IndexProxy;
use crate::collection::{Collection, IndexOptions};
use crate::compare::CompareOptions;
use crate::config::AutoIndex;
use crate::query::ir::Expr;

/// Fields compared against literals anywhere in an `and`/`or` tree.
pub fn indexable_fields(expr: &Expr) -> Vec<Vec<String>> {
    let mut fields = Vec::new();
    collect_fields(expr, &mut fields);
    fields
}

fn collect_fields(expr: &Expr, out: &mut Vec<Vec<String>>) {
    match expr {
        Expr::Func { name, args } if name == "and" || name == "or" => {
            for arg in args {
                collect_fields(arg, out);
            }
        }
        _ => {
            if let Some(comparison) = as_field_comparison(expr) {
                let path = comparison.path.to_vec();
                if !out.contains(&path) {
                    out.push(path);
                }
            }
        }
    }
}

/// Make sure every field `expr` filters on has an index.
pub fn ensure_indexes_for_expr(collection: &Collection, expr: &Expr) {
    if collection.options().auto_index != AutoIndex::Eager {
        return;
    }
    for field in indexable_fields(expr) {
        if collection.has_index_on(&field) {
            continue;
        }
        if let Err(e) = collection.create_index(field.clone(), IndexOptions::default()) {
            tracing::warn!(
                collection = %collection.id(),
                field = %field.join("."),
                error = %e,
                "automatic index creation failed"
            );
        }
    }
}

/// An index that can serve ordered scans on `field`, created if needed.
pub fn ensure_index_for_order(
    collection: &Collection,
    field: &[String],
    options: &CompareOptions,
) -> Option<IndexProxy> {
    if let Some(existing) = collection.index_for_order(field, options) {
        return Some(existing);
    }
    if collection.options().auto_index != AutoIndex::Eager {
        return None;
    }
    let index_options = IndexOptions {
        compare_options: Some(options.physical()),
        ..IndexOptions::default()
    };
    match collection.create_index(field.to_vec(), index_options) {
        Ok(proxy) => Some(proxy),
        Err(e) => {
            tracing::warn!(
                collection = %collection.id(),
                field = %field.join("."),
                error = %e,
                "automatic order index creation failed"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_fields_in_and_or_trees() {
        let expr = Expr::func(
            "and",
            vec![
                Expr::func("eq", vec![Expr::prop(vec!["done".into()]), Expr::value(json!(true))]),
                Expr::func(
                    "or",
                    vec![
                        Expr::func(
                            "gt",
                            vec![Expr::value(json!(3)), Expr::prop(vec!["meta".into(), "rank".into()])],
                        ),
                        Expr::func("eq", vec![Expr::prop(vec!["done".into()]), Expr::value(json!(false))]),
                        Expr::func("like", vec![Expr::prop(vec!["title".into()]), Expr::value(json!("%a%"))]),
                    ],
                ),
            ],
        );
        assert_eq!(
            indexable_fields(&expr),
            vec![vec!["done".to_string()], vec!["meta".to_string(), "rank".to_string()]]
        );
    }
}
