//! Row keys and path access into JSON rows.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Primary key of a row within a collection.
///
/// Keys are either integers or strings. Integers order before strings so that
/// mixed key spaces still have a total order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    /// Derive a key from a JSON value (number or string).
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Key::Str(s.clone())),
            Value::Number(n) => n
                .as_i64()
                .map(Key::Int)
                .ok_or_else(|| Error::InvalidKey(format!("non-integer numeric key {n}"))),
            other => Err(Error::InvalidKey(format!(
                "keys must be strings or integers, got {other}"
            ))),
        }
    }

    /// Convert back to a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(i) => Value::from(*i),
            Key::Str(s) => Value::String(s.clone()),
        }
    }

    /// Render without quoting, used when building composite keys.
    pub fn raw(&self) -> String {
        match self {
            Key::Int(i) => i.to_string(),
            Key::Str(s) => s.clone(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Key::Int(i64::from(i))
    }
}

/// Key namespaced by collection, used to detect conflicting mutations
/// across transactions.
pub fn global_key(collection_id: &str, key: &Key) -> String {
    format!("KEY::{collection_id}/{}", key.raw())
}

/// Read a (possibly nested) field from a row.
///
/// Returns `None` when any segment is missing. Indexing into a non-object is
/// also `None`; use [`try_get_path`] when that should be reported.
pub fn get_path<'a>(row: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = row;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Strict variant of [`get_path`]: descending into a scalar is an error.
pub fn try_get_path<'a>(row: &'a Value, path: &[String]) -> Result<Option<&'a Value>> {
    let mut current = row;
    for (depth, segment) in path.iter().enumerate() {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => return Ok(None),
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Ok(None),
            },
            Value::Null => return Ok(None),
            other => {
                return Err(Error::InvalidExpression(format!(
                    "cannot read '{}' of {} at depth {}",
                    segment,
                    json_type_name(other),
                    depth
                )))
            }
        };
    }
    Ok(Some(current))
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn key_from_value() {
        assert_eq!(Key::from_value(&json!("a")).unwrap(), Key::from("a"));
        assert_eq!(Key::from_value(&json!(7)).unwrap(), Key::Int(7));
        assert!(Key::from_value(&json!(1.5)).is_err());
        assert!(Key::from_value(&json!(null)).is_err());
    }

    #[test]
    fn ints_order_before_strings() {
        assert!(Key::Int(100) < Key::from("0"));
        assert!(Key::from("a") < Key::from("b"));
    }

    #[test]
    fn nested_paths() {
        let row = json!({"user": {"name": "Ann", "tags": ["x", "y"]}});
        assert_eq!(get_path(&row, &path(&["user", "name"])), Some(&json!("Ann")));
        assert_eq!(get_path(&row, &path(&["user", "tags", "1"])), Some(&json!("y")));
        assert_eq!(get_path(&row, &path(&["user", "age"])), None);
        assert!(try_get_path(&row, &path(&["user", "name", "first"])).is_err());
        assert_eq!(try_get_path(&row, &path(&["missing", "x"])).unwrap(), None);
    }

    #[test]
    fn global_keys_are_namespaced() {
        assert_eq!(global_key("todos", &Key::from("1")), "KEY::todos/1");
        assert_eq!(global_key("todos", &Key::Int(1)), "KEY::todos/1");
    }
}
