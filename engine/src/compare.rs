//! Total ordering over JSON values.
//!
//! Used for ordered queries, collection comparators and index keys. Values of
//! different JSON types order by type rank (bool < number < string < array <
//! object); `null` placement is controlled by [`NullsOrder`] and does not flip
//! with the sort direction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullsOrder {
    #[default]
    First,
    Last,
}

impl NullsOrder {
    pub fn opposite(self) -> Self {
        match self {
            NullsOrder::First => NullsOrder::Last,
            NullsOrder::Last => NullsOrder::First,
        }
    }
}

/// How strings are compared.
///
/// `Locale` folds case before comparing and falls back to the raw string to
/// keep the order total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringSort {
    #[default]
    Lexical,
    Locale,
}

/// Options controlling [`compare_values`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompareOptions {
    pub direction: SortDirection,
    pub nulls: NullsOrder,
    pub string_sort: StringSort,
}

impl CompareOptions {
    pub fn desc() -> Self {
        Self {
            direction: SortDirection::Desc,
            ..Self::default()
        }
    }

    pub fn with_nulls(mut self, nulls: NullsOrder) -> Self {
        self.nulls = nulls;
        self
    }

    pub fn with_string_sort(mut self, string_sort: StringSort) -> Self {
        self.string_sort = string_sort;
        self
    }

    /// The options an ascending physical index needs so that walking it in
    /// this direction yields this ordering.
    pub fn physical(&self) -> Self {
        match self.direction {
            SortDirection::Asc => *self,
            SortDirection::Desc => Self {
                direction: SortDirection::Asc,
                nulls: self.nulls.opposite(),
                string_sort: self.string_sort,
            },
        }
    }
}

/// Equality used when deciding whether a value changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EqualityMode {
    /// Structural equality at every depth.
    #[default]
    Deep,
    /// Top-level fields compared by value; nested objects and arrays are
    /// treated as distinct unless both are empty.
    Shallow,
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    x.total_cmp(&y)
}

fn compare_strings(a: &str, b: &str, sort: StringSort) -> Ordering {
    match sort {
        StringSort::Lexical => a.cmp(b),
        StringSort::Locale => a
            .to_lowercase()
            .cmp(&b.to_lowercase())
            .then_with(|| a.cmp(b)),
    }
}

/// Ascending comparison honouring the null policy and string sort, ignoring
/// direction.
pub fn compare_values(a: &Value, b: &Value, opts: &CompareOptions) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => {
            return match opts.nulls {
                NullsOrder::First => Ordering::Less,
                NullsOrder::Last => Ordering::Greater,
            }
        }
        (false, true) => {
            return match opts.nulls {
                NullsOrder::First => Ordering::Greater,
                NullsOrder::Last => Ordering::Less,
            }
        }
        (false, false) => {}
    }
    compare_non_null(a, b, opts)
}

fn compare_non_null(a: &Value, b: &Value, opts: &CompareOptions) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => compare_strings(x, y, opts.string_sort),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                match compare_values(l, r, opts) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        // Objects have no natural order; their canonical serialisation keeps
        // the comparison total and deterministic.
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Full comparison including direction. Nulls keep their configured place in
/// both directions.
pub fn compare_with_direction(a: &Value, b: &Value, opts: &CompareOptions) -> Ordering {
    if a.is_null() || b.is_null() {
        return compare_values(a, b, opts);
    }
    let ordering = compare_non_null(a, b, opts);
    match opts.direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    }
}

/// Compare two rows on a list of sort columns, first difference wins.
pub fn compare_columns(a: &[Value], b: &[Value], opts: &[CompareOptions]) -> Ordering {
    for ((l, r), o) in a.iter().zip(b.iter()).zip(opts.iter()) {
        match compare_with_direction(l, r, o) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Equality under the given mode.
pub fn values_equal(a: &Value, b: &Value, mode: EqualityMode) -> bool {
    match mode {
        EqualityMode::Deep => a == b,
        EqualityMode::Shallow => match (a, b) {
            (Value::Object(x), Value::Object(y)) => {
                x.len() == y.len()
                    && x.iter().all(|(k, v)| match y.get(k) {
                        Some(w) => shallow_scalar_eq(v, w),
                        None => false,
                    })
            }
            _ => shallow_scalar_eq(a, b),
        },
    }
}

fn shallow_scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => x.is_empty() && y.is_empty(),
        (Value::Array(x), Value::Array(y)) => x.is_empty() && y.is_empty(),
        _ => a == b,
    }
}

/// Totally ordered, hashable form of a value used as an index key.
///
/// Null placement is baked into the variant so that an ascending walk of an
/// ordered map yields the configured null order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKey {
    NullFirst,
    Bool(bool),
    Number(OrderedNumber),
    Text { collation: String, raw: String },
    Array(Vec<IndexKey>),
    Object(String),
    NullLast,
}

/// `f64` with a total order; integers that fit are kept exact.
#[derive(Debug, Clone, Copy)]
pub enum OrderedNumber {
    Int(i64),
    Float(f64),
}

impl OrderedNumber {
    fn as_f64(&self) -> f64 {
        match self {
            OrderedNumber::Int(i) => *i as f64,
            OrderedNumber::Float(f) => *f,
        }
    }
}

impl PartialEq for OrderedNumber {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedNumber {}

impl std::hash::Hash for OrderedNumber {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            OrderedNumber::Int(i) => (*i as f64).to_bits().hash(state),
            OrderedNumber::Float(f) => {
                let f = if *f == 0.0 { 0.0 } else { *f };
                f.to_bits().hash(state)
            }
        }
    }
}

impl PartialOrd for OrderedNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (OrderedNumber::Int(a), OrderedNumber::Int(b)) => a.cmp(b),
            _ => {
                let (a, b) = (self.as_f64(), other.as_f64());
                // -0.0 and 0.0 must collide as index keys.
                let a = if a == 0.0 { 0.0 } else { a };
                let b = if b == 0.0 { 0.0 } else { b };
                a.total_cmp(&b)
            }
        }
    }
}

/// Normalise a value into an [`IndexKey`] under the given options.
///
/// Direction is not part of the key; descending access goes through a
/// reversed view of an ascending index.
pub fn normalize_value(value: &Value, opts: &CompareOptions) -> IndexKey {
    match value {
        Value::Null => match opts.nulls {
            NullsOrder::First => IndexKey::NullFirst,
            NullsOrder::Last => IndexKey::NullLast,
        },
        Value::Bool(b) => IndexKey::Bool(*b),
        Value::Number(n) => IndexKey::Number(match n.as_i64() {
            Some(i) => OrderedNumber::Int(i),
            None => OrderedNumber::Float(n.as_f64().unwrap_or(f64::NAN)),
        }),
        Value::String(s) => IndexKey::Text {
            collation: match opts.string_sort {
                StringSort::Lexical => s.clone(),
                StringSort::Locale => s.to_lowercase(),
            },
            raw: s.clone(),
        },
        Value::Array(items) => {
            IndexKey::Array(items.iter().map(|v| normalize_value(v, opts)).collect())
        }
        Value::Object(_) => IndexKey::Object(value.to_string()),
    }
}

impl IndexKey {
    pub fn is_null(&self) -> bool {
        matches!(self, IndexKey::NullFirst | IndexKey::NullLast)
    }

    /// Recover a JSON value from the key.
    pub fn to_value(&self) -> Value {
        match self {
            IndexKey::NullFirst | IndexKey::NullLast => Value::Null,
            IndexKey::Bool(b) => Value::Bool(*b),
            IndexKey::Number(OrderedNumber::Int(i)) => Value::from(*i),
            IndexKey::Number(OrderedNumber::Float(f)) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            IndexKey::Text { raw, .. } => Value::String(raw.clone()),
            IndexKey::Array(items) => Value::Array(items.iter().map(|k| k.to_value()).collect()),
            IndexKey::Object(s) => serde_json::from_str(s).unwrap_or(Value::Null),
        }
    }
}
