//! Formula interpreter for the `logic` rule
//!
//! Rule files embed validation formulas as JSON-logic trees: a formula is
//! either a primitive value or a single-key object `{op: args}` whose
//! arguments are themselves formulas. [`evaluate`] walks the tree against
//! the record under validation and returns a [`Value`].
//!
//! Equality follows the engine-wide soft rules (numeric tolerance,
//! null == null); ordering operators never hold when a null is involved.
//! `and`/`or`/`if`/`?:` evaluate lazily and return the deciding operand,
//! so truthiness survives through nested formulas.

use crate::config::MAX_EXPR_DEPTH;
use crate::error::{EngineError, Result};
use crate::types::{order_values, soft_equals, Record, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A parsed formula node.
///
/// Deserialization order matters: arrays become `List`, scalars become
/// `Literal`, and objects (the only remaining shape) become `Call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expr {
    /// Argument list or literal array
    List(Vec<Expr>),
    /// Primitive value, returned as-is
    Literal(Value),
    /// Operator application `{op: args}`; must have exactly one key
    Call(IndexMap<String, Expr>),
}

/// Evaluate a formula against a record.
pub fn evaluate(expr: &Expr, record: &Record) -> Result<Value> {
    eval(expr, record, 0)
}

fn eval(expr: &Expr, record: &Record, depth: usize) -> Result<Value> {
    if depth > MAX_EXPR_DEPTH {
        return Err(EngineError::MaxDepthExceeded(MAX_EXPR_DEPTH));
    }
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::List(items) => items
            .iter()
            .map(|item| eval(item, record, depth + 1))
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        Expr::Call(call) => {
            if call.len() != 1 {
                return Err(EngineError::InvalidExpression(format!(
                    "operator object must have exactly one key, found {}",
                    call.len()
                )));
            }
            let (op, arg) = call.iter().next().expect("length checked above");
            apply_operator(op, arg, record, depth)
        }
    }
}

/// Unary operators take their argument bare; everything else wraps
/// arguments in a list. Normalize to a slice of expressions.
fn arg_exprs(arg: &Expr) -> Vec<&Expr> {
    match arg {
        Expr::List(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn apply_operator(op: &str, arg: &Expr, record: &Record, depth: usize) -> Result<Value> {
    // Lazy operators: arguments evaluate only as needed
    match op {
        "and" => {
            let mut last = Value::Bool(true);
            for expr in arg_exprs(arg) {
                let value = eval(expr, record, depth + 1)?;
                if !value.to_bool() {
                    return Ok(value);
                }
                last = value;
            }
            return Ok(last);
        }
        "or" => {
            let mut last = Value::Bool(false);
            for expr in arg_exprs(arg) {
                let value = eval(expr, record, depth + 1)?;
                if value.to_bool() {
                    return Ok(value);
                }
                last = value;
            }
            return Ok(last);
        }
        "if" => return eval_if(&arg_exprs(arg), record, depth),
        "?:" => {
            let exprs = arg_exprs(arg);
            if exprs.len() != 3 {
                return Err(EngineError::InvalidExpression(
                    "?: requires exactly three operands".to_string(),
                ));
            }
            let branch = if eval(exprs[0], record, depth + 1)?.to_bool() {
                exprs[1]
            } else {
                exprs[2]
            };
            return eval(branch, record, depth + 1);
        }
        _ => {}
    }

    let values = arg_exprs(arg)
        .into_iter()
        .map(|expr| eval(expr, record, depth + 1))
        .collect::<Result<Vec<_>>>()?;

    match op {
        "var" => eval_var(&values, record),
        "missing" => Ok(Value::List(missing_names(&values, record))),
        "missing_some" => eval_missing_some(&values, record),
        "==" => binary(op, &values).map(|(a, b)| Value::Bool(soft_equals(a, b))),
        "!=" => binary(op, &values).map(|(a, b)| Value::Bool(!soft_equals(a, b))),
        "===" => binary(op, &values).map(|(a, b)| Value::Bool(a == b)),
        "!==" => binary(op, &values).map(|(a, b)| Value::Bool(a != b)),
        "<" => compare_chain(op, &values, |a, b| strict_less(a, b)),
        "<=" => compare_chain(op, &values, |a, b| strict_less(a, b) || soft_equals(a, b)),
        ">" => compare_chain(op, &values, |a, b| strict_less(b, a)),
        ">=" => compare_chain(op, &values, |a, b| strict_less(b, a) || soft_equals(a, b)),
        "!" => single(op, &values).map(|v| Value::Bool(!v.to_bool())),
        "!!" => single(op, &values).map(|v| Value::Bool(v.to_bool())),
        "+" => eval_sum(&values),
        "-" => eval_minus(&values),
        "*" => eval_product(&values),
        "/" => eval_divide(op, &values),
        "%" => eval_modulo(op, &values),
        "min" => eval_extremum(op, &values, |a, b| a.min(b)),
        "max" => eval_extremum(op, &values, |a, b| a.max(b)),
        "in" => binary(op, &values).map(|(a, b)| Value::Bool(contains(b, a))),
        "cat" => Ok(Value::String(
            values.iter().map(Value::to_string).collect::<String>(),
        )),
        "merge" => {
            let mut merged = Vec::new();
            for value in values {
                match value {
                    Value::List(items) => merged.extend(items),
                    other => merged.push(other),
                }
            }
            Ok(Value::List(merged))
        }
        "count" => Ok(Value::Int(
            values.iter().filter(|v| v.to_bool()).count() as i64
        )),
        "count_exact" => {
            let (base, rest) = values.split_first().ok_or_else(|| {
                EngineError::InvalidExpression(
                    "count_exact needs a base and at least 1 value to compare to".to_string(),
                )
            })?;
            if rest.is_empty() {
                return Err(EngineError::InvalidExpression(
                    "count_exact needs a base and at least 1 value to compare to".to_string(),
                ));
            }
            Ok(Value::Int(
                rest.iter().filter(|v| soft_equals(base, v)).count() as i64,
            ))
        }
        "log" => {
            let value = single(op, &values)?;
            tracing::debug!(value = %value, "formula log");
            Ok(value.clone())
        }
        unknown => Err(EngineError::UnknownOperator(unknown.to_string())),
    }
}

/// Chained conditional: `[cond1, then1, cond2, then2, ..., else?]`.
fn eval_if(exprs: &[&Expr], record: &Record, depth: usize) -> Result<Value> {
    let mut i = 0;
    while i + 1 < exprs.len() {
        if eval(exprs[i], record, depth + 1)?.to_bool() {
            return eval(exprs[i + 1], record, depth + 1);
        }
        i += 2;
    }
    if exprs.len() % 2 == 1 {
        if let Some(last) = exprs.last() {
            return eval(last, record, depth + 1);
        }
    }
    Ok(Value::Null)
}

/// Field lookup: `{"var": name}` or `{"var": [name, default]}`.
/// The default applies when the field is missing or null.
fn eval_var(values: &[Value], record: &Record) -> Result<Value> {
    let name = values.first().ok_or_else(|| {
        EngineError::InvalidExpression("var requires a field name".to_string())
    })?;
    let key = match name {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let default = values.get(1);
    match record.get(&key) {
        Some(value) if !value.is_null() => Ok(value.clone()),
        _ => Ok(default.cloned().unwrap_or(Value::Null)),
    }
}

fn missing_names(values: &[Value], record: &Record) -> Vec<Value> {
    let names: Vec<&Value> = match values.first() {
        Some(Value::List(items)) if values.len() == 1 => items.iter().collect(),
        _ => values.iter().collect(),
    };
    names
        .into_iter()
        .filter(|name| !record.contains_key(&name.to_string()))
        .cloned()
        .collect()
}

/// `{"missing_some": [min_required, [names...]]}` — empty list when at
/// least `min_required` of the names are present.
fn eval_missing_some(values: &[Value], record: &Record) -> Result<Value> {
    let min_required = values
        .first()
        .and_then(Value::as_int)
        .ok_or_else(|| {
            EngineError::InvalidExpression(
                "missing_some requires a minimum count and a list of names".to_string(),
            )
        })?;
    let names = values
        .get(1)
        .and_then(Value::as_list)
        .ok_or_else(|| {
            EngineError::InvalidExpression(
                "missing_some requires a minimum count and a list of names".to_string(),
            )
        })?;

    let mut missing = Vec::new();
    let mut found = 0i64;
    for name in names {
        if record.contains_key(&name.to_string()) {
            found += 1;
        } else {
            missing.push(name.clone());
        }
    }
    if found >= min_required {
        Ok(Value::List(Vec::new()))
    } else {
        Ok(Value::List(missing))
    }
}

/// Strict ordering for `<`-family operators: never holds on nulls.
fn strict_less(a: &Value, b: &Value) -> bool {
    order_values(a, b) == Some(Ordering::Less)
}

fn compare_chain<F>(op: &str, values: &[Value], holds: F) -> Result<Value>
where
    F: Fn(&Value, &Value) -> bool,
{
    if values.len() < 2 {
        return Err(EngineError::InvalidExpression(format!(
            "{op} requires at least two operands"
        )));
    }
    Ok(Value::Bool(
        values.windows(2).all(|pair| holds(&pair[0], &pair[1])),
    ))
}

fn single<'a>(op: &str, values: &'a [Value]) -> Result<&'a Value> {
    if values.len() != 1 {
        return Err(EngineError::InvalidExpression(format!(
            "{op} requires exactly one operand"
        )));
    }
    Ok(&values[0])
}

fn binary<'a>(op: &str, values: &'a [Value]) -> Result<(&'a Value, &'a Value)> {
    if values.len() != 2 {
        return Err(EngineError::InvalidExpression(format!(
            "{op} requires exactly two operands"
        )));
    }
    Ok((&values[0], &values[1]))
}

/// Numeric view used by arithmetic folds; tracks whether any operand was a
/// float so integer arithmetic stays integer.
struct Num {
    value: f64,
    is_float: bool,
}

fn to_number(value: &Value) -> Result<Num> {
    match value {
        Value::Int(i) => Ok(Num {
            value: *i as f64,
            is_float: false,
        }),
        Value::Float(f) => Ok(Num {
            value: *f,
            is_float: true,
        }),
        Value::Bool(b) => Ok(Num {
            value: if *b { 1.0 } else { 0.0 },
            is_float: false,
        }),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.contains('.') {
                trimmed
                    .parse::<f64>()
                    .map(|value| Num {
                        value,
                        is_float: true,
                    })
                    .map_err(|_| type_error(value))
            } else {
                trimmed
                    .parse::<i64>()
                    .map(|i| Num {
                        value: i as f64,
                        is_float: false,
                    })
                    .map_err(|_| type_error(value))
            }
        }
        other => Err(type_error(other)),
    }
}

fn type_error(value: &Value) -> EngineError {
    EngineError::TypeMismatch {
        expected: "number".to_string(),
        actual: value.type_name().to_string(),
    }
}

fn num_value(value: f64, is_float: bool) -> Value {
    if is_float {
        Value::Float(value)
    } else {
        Value::Int(value as i64)
    }
}

fn eval_sum(values: &[Value]) -> Result<Value> {
    let mut sum = 0.0;
    let mut has_float = false;
    for value in values {
        let num = to_number(value)?;
        sum += num.value;
        has_float |= num.is_float;
    }
    Ok(num_value(sum, has_float))
}

fn eval_minus(values: &[Value]) -> Result<Value> {
    let (first, rest) = values.split_first().ok_or_else(|| {
        EngineError::InvalidExpression("- requires at least one operand".to_string())
    })?;
    let num = to_number(first)?;
    if rest.is_empty() {
        return Ok(num_value(-num.value, num.is_float));
    }
    let mut result = num.value;
    let mut has_float = num.is_float;
    for value in rest {
        let num = to_number(value)?;
        result -= num.value;
        has_float |= num.is_float;
    }
    Ok(num_value(result, has_float))
}

fn eval_product(values: &[Value]) -> Result<Value> {
    let mut product = 1.0;
    let mut has_float = false;
    for value in values {
        let num = to_number(value)?;
        product *= num.value;
        has_float |= num.is_float;
    }
    Ok(num_value(product, has_float))
}

/// Division always yields a float; a single operand passes through.
fn eval_divide(op: &str, values: &[Value]) -> Result<Value> {
    match values {
        [] => Err(EngineError::InvalidExpression(format!(
            "{op} requires at least one operand"
        ))),
        [only] => Ok(only.clone()),
        [a, b, ..] => {
            let dividend = to_number(a)?;
            let divisor = to_number(b)?;
            if divisor.value == 0.0 {
                return Err(EngineError::DivisionByZero);
            }
            Ok(Value::Float(dividend.value / divisor.value))
        }
    }
}

fn eval_modulo(op: &str, values: &[Value]) -> Result<Value> {
    let (a, b) = binary(op, values)?;
    let lhs = to_number(a)?;
    let rhs = to_number(b)?;
    if rhs.value == 0.0 {
        return Err(EngineError::DivisionByZero);
    }
    Ok(num_value(
        lhs.value % rhs.value,
        lhs.is_float || rhs.is_float,
    ))
}

fn eval_extremum<F>(op: &str, values: &[Value], combine: F) -> Result<Value>
where
    F: Fn(f64, f64) -> f64,
{
    if values.is_empty() {
        return Err(EngineError::InvalidExpression(format!(
            "{op} requires at least one operand"
        )));
    }
    let mut result: Option<f64> = None;
    let mut has_float = false;
    for value in values {
        let num = to_number(value)?;
        has_float |= num.is_float;
        result = Some(match result {
            Some(current) => combine(current, num.value),
            None => num.value,
        });
    }
    Ok(num_value(result.unwrap_or_default(), has_float))
}

/// Membership: list containment under soft equality, or substring match.
fn contains(container: &Value, needle: &Value) -> bool {
    match container {
        Value::List(items) => items.iter().any(|item| soft_equals(item, needle)),
        Value::String(s) => match needle {
            Value::String(sub) => s.contains(sub.as_str()),
            _ => false,
        },
        _ => false,
    }
}
