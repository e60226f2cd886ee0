//! Core value types for the quality-check engine
//!
//! A [`Record`] is a flat mapping from field name to [`Value`]. Values carry
//! the scalar types that appear on form submissions plus a `List` variant
//! used by rule arguments and formula intermediates.
//!
//! Note: `PartialEq` is implemented manually so that `Float(NaN) == Float(NaN)`
//! returns `true`. In form data NaN represents invalid/missing input and two
//! missing values are considered equal. Cross-type numeric equality (e.g.
//! `Int(1)` vs `Float(1.0)`) is *not* part of `PartialEq`; that coercion,
//! together with the tolerance, lives in [`soft_equals`].

use crate::config::FLOAT_EQ_TOLERANCE;
use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A single form submission: field name to scalar value, insertion-ordered.
pub type Record = IndexMap<String, Value>;

/// Represents any value a form field or rule argument can hold.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// Null/empty value
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Calendar date. Never produced by deserialization directly; records
    /// acquire dates through casting against a `date`-typed schema field.
    Date(NaiveDate),
    /// List of values (rule arguments and formula intermediates)
    List(Vec<Value>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => {
                if a.is_nan() && b.is_nan() {
                    return true;
                }
                a == b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get value as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get value as i64
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    /// Try to get value as f64 (integers widen)
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get value as string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get value as a date. Strings in a recognized date format
    /// are interpreted as dates.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::String(s) => parse_date(s),
            _ => None,
        }
    }

    /// Try to get value as list reference
    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Convert value to boolean: non-null, non-zero, non-empty is truthy.
    pub fn to_bool(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Date(_) => true,
            Value::List(l) => !l.is_empty(),
        }
    }

    /// Human-readable type tag, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::List(_) => "list",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::String(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::List(list) => {
                write!(f, "[")?;
                for (i, v) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Comparator tokens accepted by `compare_with`, `compare_age` and the
/// formula interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        };
        write!(f, "{}", token)
    }
}

/// Date formats recognized on string values: ISO year-first and the
/// month-first layout common on keyed-in forms.
const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%m-%d-%Y"];

/// Parse a string into a date, trying the recognized formats in order.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

/// Soft equality: numeric values compare within [`FLOAT_EQ_TOLERANCE`],
/// null equals only null, booleans compare against numeric truthiness,
/// numeric strings coerce, and date strings compare against dates.
pub fn soft_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Bool(_), _) | (_, Value::Bool(_)) => a.to_bool() == b.to_bool(),
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(u, v)| soft_equals(u, v))
        }
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Date(_), _) | (_, Value::Date(_)) => match (a.as_date(), b.as_date()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => match (numeric(a), numeric(b)) {
            (Some(x), Some(y)) => (x - y).abs() <= FLOAT_EQ_TOLERANCE,
            _ => false,
        },
    }
}

/// Numeric view of a value, coercing numeric strings.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Partial ordering between two values.
///
/// Numeric pairs (including numeric strings) order as floats, dates order
/// chronologically (date strings coerce), plain strings order
/// lexicographically. Anything else, null included, is incomparable.
pub fn order_values(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    if let (Value::Date(_), _) | (_, Value::Date(_)) = (a, b) {
        return match (a.as_date(), b.as_date()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => None,
        };
    }
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Evaluate `value {comparator} base`.
///
/// Null handling follows the engine-wide convention: two nulls are equal
/// (so `==`, `<=`, `>=` hold), a single null satisfies only `!=`, and
/// ordering never holds when a null is involved. Returns `None` when the
/// operands cannot be ordered (the caller decides how to report that).
pub fn compare_values(comparator: Comparator, value: &Value, base: &Value) -> Option<bool> {
    let value_null = value.is_null();
    let base_null = base.is_null();
    if value_null && base_null {
        return Some(matches!(
            comparator,
            Comparator::Eq | Comparator::Le | Comparator::Ge
        ));
    }
    if value_null != base_null {
        return Some(matches!(comparator, Comparator::Ne));
    }

    match comparator {
        Comparator::Eq => Some(soft_equals(value, base)),
        Comparator::Ne => Some(!soft_equals(value, base)),
        Comparator::Lt => Some(order_values(value, base)? == Ordering::Less),
        Comparator::Le => Some(order_values(value, base)? != Ordering::Greater),
        Comparator::Gt => Some(order_values(value, base)? == Ordering::Greater),
        Comparator::Ge => Some(order_values(value, base)? != Ordering::Less),
    }
}
