//! Compiling expressions into row closures.
//!
//! Comparisons follow three-valued logic: an operand that is `null` (or a
//! missing field) makes the comparison unknown, represented as `null`. `and`
//! is `false` if any branch is false, otherwise unknown if any branch is
//! unknown. `or` is the dual. A predicate only passes rows for which the
//! expression is truthy, so unknown rows are filtered out.

use crate::compare::{compare_values, CompareOptions};
use crate::error::{Error, Result};
use crate::key::get_path;
use crate::query::ir::Expr;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::rc::Rc;

/// Evaluates an expression against a row.
pub type Evaluator = Rc<dyn Fn(&Value) -> Value>;

/// Truthiness of an expression against a row.
pub type Predicate = Rc<dyn Fn(&Value) -> bool>;

pub fn compile(expr: &Expr) -> Result<Evaluator> {
    match expr {
        Expr::Ref(r) => {
            let path = r.path.clone();
            Ok(Rc::new(move |row: &Value| get_path(row, &path).cloned().unwrap_or(Value::Null)))
        }
        Expr::Value { value } => {
            let value = value.clone();
            Ok(Rc::new(move |_: &Value| value.clone()))
        }
        Expr::Aggregate { name, .. } => Err(Error::InvalidExpression(format!(
            "aggregate '{name}' used outside of a grouped select or having"
        ))),
        Expr::Func { name, args } => compile_func(name, args),
    }
}

pub fn compile_predicate(expr: &Expr) -> Result<Predicate> {
    let evaluator = compile(expr)?;
    Ok(Rc::new(move |row: &Value| is_truthy(&evaluator(row))))
}

/// Evaluate once; compiles on every call.
pub fn evaluate(expr: &Expr, row: &Value) -> Result<Value> {
    Ok(compile(expr)?(row))
}

/// JavaScript-style truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn arity(name: &str, args: &[Expr], expected: usize) -> Result<()> {
    if args.len() != expected {
        return Err(Error::InvalidExpression(format!(
            "{name} takes {expected} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn binary(args: &[Expr], f: impl Fn(&Value, &Value) -> Value + 'static) -> Result<Evaluator> {
    let a = compile(&args[0])?;
    let b = compile(&args[1])?;
    Ok(Rc::new(move |row: &Value| f(&a(row), &b(row))))
}

fn unary(args: &[Expr], f: impl Fn(Value) -> Value + 'static) -> Result<Evaluator> {
    let a = compile(&args[0])?;
    Ok(Rc::new(move |row: &Value| f(a(row))))
}

fn compile_all(args: &[Expr]) -> Result<Vec<Evaluator>> {
    args.iter().map(compile).collect()
}

fn compile_func(name: &str, args: &[Expr]) -> Result<Evaluator> {
    match name {
        "eq" | "gt" | "gte" | "lt" | "lte" => {
            arity(name, args, 2)?;
            let accept: fn(Ordering) -> bool = match name {
                "eq" => Ordering::is_eq,
                "gt" => Ordering::is_gt,
                "gte" => Ordering::is_ge,
                "lt" => Ordering::is_lt,
                _ => Ordering::is_le,
            };
            binary(args, move |a, b| {
                if a.is_null() || b.is_null() {
                    return Value::Null;
                }
                Value::Bool(accept(compare_values(a, b, &CompareOptions::default())))
            })
        }
        "and" => {
            let parts = compile_all(args)?;
            Ok(Rc::new(move |row: &Value| {
                let mut unknown = false;
                for part in &parts {
                    match part(row) {
                        Value::Null => unknown = true,
                        v if !is_truthy(&v) => return Value::Bool(false),
                        _ => {}
                    }
                }
                if unknown {
                    Value::Null
                } else {
                    Value::Bool(true)
                }
            }))
        }
        "or" => {
            let parts = compile_all(args)?;
            Ok(Rc::new(move |row: &Value| {
                let mut unknown = false;
                for part in &parts {
                    match part(row) {
                        Value::Null => unknown = true,
                        v if is_truthy(&v) => return Value::Bool(true),
                        _ => {}
                    }
                }
                if unknown {
                    Value::Null
                } else {
                    Value::Bool(false)
                }
            }))
        }
        "not" => {
            arity(name, args, 1)?;
            unary(args, |v| match v {
                Value::Null => Value::Null,
                v => Value::Bool(!is_truthy(&v)),
            })
        }
        "in" => {
            arity(name, args, 2)?;
            binary(args, |value, list| {
                if value.is_null() {
                    return Value::Null;
                }
                match list {
                    Value::Array(items) => Value::Bool(items.iter().any(|item| {
                        compare_values(value, item, &CompareOptions::default()).is_eq()
                    })),
                    _ => Value::Bool(false),
                }
            })
        }
        "like" | "ilike" => {
            arity(name, args, 2)?;
            let fold = name == "ilike";
            binary(args, move |value, pattern| match (value, pattern) {
                (Value::String(s), Value::String(p)) => {
                    if fold {
                        Value::Bool(like(&s.to_lowercase(), &p.to_lowercase()))
                    } else {
                        Value::Bool(like(s, p))
                    }
                }
                (Value::Null, _) | (_, Value::Null) => Value::Null,
                _ => Value::Bool(false),
            })
        }
        // Missing fields read as null, so both predicates coincide.
        "is_null" | "isNull" | "is_undefined" | "isUndefined" => {
            arity(name, args, 1)?;
            unary(args, |v| Value::Bool(v.is_null()))
        }
        "upper" | "lower" => {
            arity(name, args, 1)?;
            let upper = name == "upper";
            unary(args, move |v| match v {
                Value::String(s) if upper => Value::String(s.to_uppercase()),
                Value::String(s) => Value::String(s.to_lowercase()),
                other => other,
            })
        }
        "length" => {
            arity(name, args, 1)?;
            unary(args, |v| match v {
                Value::String(s) => Value::from(s.chars().count()),
                Value::Array(items) => Value::from(items.len()),
                _ => Value::Null,
            })
        }
        "concat" => {
            let parts = compile_all(args)?;
            Ok(Rc::new(move |row: &Value| {
                let mut out = String::new();
                for part in &parts {
                    match part(row) {
                        Value::Null => {}
                        Value::String(s) => out.push_str(&s),
                        other => out.push_str(&other.to_string()),
                    }
                }
                Value::String(out)
            }))
        }
        "coalesce" => {
            let parts = compile_all(args)?;
            Ok(Rc::new(move |row: &Value| {
                parts
                    .iter()
                    .map(|part| part(row))
                    .find(|v| !v.is_null())
                    .unwrap_or(Value::Null)
            }))
        }
        "add" | "subtract" | "multiply" | "divide" => {
            arity(name, args, 2)?;
            let op = match name {
                "add" => Arith::Add,
                "subtract" => Arith::Sub,
                "multiply" => Arith::Mul,
                _ => Arith::Div,
            };
            binary(args, move |a, b| arithmetic(op, a, b))
        }
        "count" | "sum" | "avg" | "min" | "max" => Err(Error::InvalidExpression(format!(
            "aggregate '{name}' must be built as an aggregate expression"
        ))),
        other => Err(Error::UnknownFunction(other.to_string())),
    }
}

#[derive(Debug, Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

fn arithmetic(op: Arith, a: &Value, b: &Value) -> Value {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            Arith::Add => x.checked_add(y),
            Arith::Sub => x.checked_sub(y),
            Arith::Mul => x.checked_mul(y),
            Arith::Div => None,
        };
        if let Some(n) = exact {
            return Value::from(n);
        }
    }
    let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
        return Value::Null;
    };
    let result = match op {
        Arith::Add => x + y,
        Arith::Sub => x - y,
        Arith::Mul => x * y,
        Arith::Div if y == 0.0 => return Value::Null,
        Arith::Div => x / y,
    };
    number(result)
}

/// A JSON number, integral when `f` is.
pub(crate) fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map_or(Value::Null, Value::Number)
    }
}

/// SQL `LIKE`: `%` matches any run of characters, `_` exactly one.
fn like(text: &str, pattern: &str) -> bool {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    // matches[j]: pattern prefix of length j matches the text prefix so far.
    let mut matches = vec![false; p.len() + 1];
    matches[0] = true;
    for j in 1..=p.len() {
        matches[j] = matches[j - 1] && p[j - 1] == '%';
    }
    for &c in &t {
        let mut next = vec![false; p.len() + 1];
        for j in 1..=p.len() {
            next[j] = match p[j - 1] {
                '%' => next[j - 1] || matches[j],
                '_' => matches[j - 1],
                pc => matches[j - 1] && pc == c,
            };
        }
        matches = next;
    }
    matches[p.len()]
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "count" => Ok(AggregateKind::Count),
            "sum" => Ok(AggregateKind::Sum),
            "avg" => Ok(AggregateKind::Avg),
            "min" => Ok(AggregateKind::Min),
            "max" => Ok(AggregateKind::Max),
            other => Err(Error::UnknownFunction(other.to_string())),
        }
    }

    /// Fold the argument values of one group.
    pub fn fold<'a>(self, values: impl Iterator<Item = &'a Value>) -> Value {
        let options = CompareOptions::default();
        match self {
            AggregateKind::Count => Value::from(values.filter(|v| !v.is_null()).count()),
            AggregateKind::Sum => number(values.filter_map(Value::as_f64).sum()),
            AggregateKind::Avg => {
                let (sum, n) = values
                    .filter_map(Value::as_f64)
                    .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                if n == 0 {
                    Value::Null
                } else {
                    number(sum / n as f64)
                }
            }
            AggregateKind::Min => values
                .filter(|v| !v.is_null())
                .min_by(|a, b| compare_values(a, b, &options))
                .cloned()
                .unwrap_or(Value::Null),
            AggregateKind::Max => values
                .filter(|v| !v.is_null())
                .max_by(|a, b| compare_values(a, b, &options))
                .cloned()
                .unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(s: &str) -> Expr {
        Expr::prop(s.split('.').map(String::from).collect())
    }

    fn v(value: Value) -> Expr {
        Expr::value(value)
    }

    fn eval(expr: &Expr, row: &Value) -> Value {
        evaluate(expr, row).unwrap()
    }

    #[test]
    fn comparisons_with_nulls_are_unknown() {
        let row = json!({"age": 30, "name": null});
        assert_eq!(eval(&Expr::func("gt", vec![p("age"), v(json!(18))]), &row), json!(true));
        assert_eq!(eval(&Expr::func("eq", vec![p("name"), v(json!("a"))]), &row), Value::Null);
        assert_eq!(eval(&Expr::func("lt", vec![p("missing"), v(json!(1))]), &row), Value::Null);
    }

    #[test]
    fn three_valued_and_or() {
        let row = json!({"a": true, "b": false});
        let unknown = Expr::func("eq", vec![p("x"), v(json!(1))]);
        assert_eq!(eval(&Expr::func("and", vec![unknown.clone(), p("b")]), &row), json!(false));
        assert_eq!(eval(&Expr::func("and", vec![unknown.clone(), p("a")]), &row), Value::Null);
        assert_eq!(eval(&Expr::func("or", vec![unknown.clone(), p("a")]), &row), json!(true));
        assert_eq!(eval(&Expr::func("or", vec![unknown.clone(), p("b")]), &row), Value::Null);
        assert_eq!(eval(&Expr::func("not", vec![unknown]), &row), Value::Null);
        let predicate = compile_predicate(&Expr::func("not", vec![p("b")])).unwrap();
        assert!(predicate(&row));
    }

    #[test]
    fn like_patterns() {
        assert!(like("hello world", "hello%"));
        assert!(like("hello", "h_llo"));
        assert!(like("abc", "%"));
        assert!(!like("abc", "a_"));
        assert!(like("", "%"));
        let row = json!({"title": "Buy Milk"});
        assert_eq!(eval(&Expr::func("ilike", vec![p("title"), v(json!("%milk"))]), &row), json!(true));
        assert_eq!(eval(&Expr::func("like", vec![p("title"), v(json!("%milk"))]), &row), json!(false));
    }

    #[test]
    fn string_and_math_functions() {
        let row = json!({"first": "Ada", "last": "Lovelace", "n": 7, "tags": [1, 2]});
        assert_eq!(
            eval(&Expr::func("concat", vec![p("first"), v(json!(" ")), p("last")]), &row),
            json!("Ada Lovelace")
        );
        assert_eq!(eval(&Expr::func("upper", vec![p("first")]), &row), json!("ADA"));
        assert_eq!(eval(&Expr::func("length", vec![p("tags")]), &row), json!(2));
        assert_eq!(eval(&Expr::func("add", vec![p("n"), v(json!(3))]), &row), json!(10));
        assert_eq!(eval(&Expr::func("divide", vec![p("n"), v(json!(2))]), &row), json!(3.5));
        assert_eq!(eval(&Expr::func("divide", vec![p("n"), v(json!(0))]), &row), Value::Null);
        assert_eq!(
            eval(&Expr::func("coalesce", vec![p("missing"), p("n")]), &row),
            json!(7)
        );
        assert_eq!(eval(&Expr::func("in", vec![p("n"), v(json!([1, 7]))]), &row), json!(true));
        assert_eq!(eval(&Expr::func("is_null", vec![p("missing")]), &row), json!(true));
    }

    #[test]
    fn compile_errors() {
        assert_eq!(
            compile(&Expr::func("frobnicate", vec![])).err(),
            Some(Error::UnknownFunction("frobnicate".into()))
        );
        assert!(matches!(
            compile(&Expr::Aggregate { name: "sum".into(), args: vec![p("n")] }),
            Err(Error::InvalidExpression(_))
        ));
        assert!(matches!(compile(&Expr::func("eq", vec![p("n")])), Err(Error::InvalidExpression(_))));
    }

    #[test]
    fn aggregates_fold() {
        let values = [json!(1), json!(4), Value::Null, json!(2)];
        assert_eq!(AggregateKind::Count.fold(values.iter()), json!(3));
        assert_eq!(AggregateKind::Sum.fold(values.iter()), json!(7));
        assert_eq!(AggregateKind::Min.fold(values.iter()), json!(1));
        assert_eq!(AggregateKind::Max.fold(values.iter()), json!(4));
        assert_eq!(AggregateKind::Avg.fold([json!(1), json!(2)].iter()), json!(1.5));
        assert_eq!(AggregateKind::Avg.fold([Value::Null].iter()), Value::Null);
    }
}
