//! Rule evaluator
//!
//! [`RecordValidator`] walks a record against a [`RuleSchema`], dispatching
//! each declared rule to its handler and collecting structured errors into
//! an [`ErrorTree`]. Rule failures are data; `Err` values are reserved for
//! system faults (datastore missing or raised, unknown operator, ...) which
//! abort the record.
//!
//! Nested clauses (compatibility if/then/else, temporal previous/current,
//! `anyof` branches) evaluate through a fresh validator instance sharing the
//! primary key, datastore and options; the inner instance's errors are
//! captured and folded into one outer-field error.
//!
//! Rule order per field is fixed: `type`, `required`, `nullable`, `allowed`,
//! `forbidden`, `min`, `max`, `regex`, `anyof`, `filled`, then
//! `compare_with`, `compare_age`, `compatibility`, `logic`,
//! `temporalrules`, `compute_gds`, `check_with`, `function`. A null value
//! short-circuits the field after the `nullable` check; only the
//! null-tolerant rules (`filled`, `compare_with`, `compare_age`,
//! `compatibility`, `logic`) still run.

use crate::config::{
    DAYS_PER_YEAR, GDS_MIN_ANSWERED, GDS_NOT_ATTEMPTED_SCORE, GDS_NUM_ITEMS,
};
use crate::datastore::Datastore;
use crate::error::{EngineError, Result};
use crate::logic;
use crate::report::{ErrorTree, ValidationError};
use crate::schema::{
    AdjustOp, CheckWith, CombineOp, CompareAgeRule, CompareWithRule, CompatibilityConstraint,
    DataType, FieldSchema, FunctionArgs, FunctionRule, IgnoreEmpty, LogicRule, RuleSchema,
    SubSchema, TemporalRulesSpec,
};
use crate::types::{compare_values, parse_date, soft_equals, Comparator, Record, Value};
use chrono::{Datelike, Local, NaiveDate};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Rounding mode for the prorated GDS score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GdsRounding {
    /// Ties round away from zero (current behavior)
    #[default]
    HalfUp,
    /// Banker's rounding, kept for regression comparisons
    HalfEven,
}

/// Evaluation options shared by a validator and its nested instances.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorOptions {
    /// When set, record fields absent from the schema are errors
    pub strict: bool,
    pub gds_rounding: GdsRounding,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            strict: true,
            gds_rounding: GdsRounding::default(),
        }
    }
}

/// Resolve the clock-derived special keys.
fn clock_value(key: &str) -> Option<Value> {
    let today = Local::now().date_naive();
    match key {
        "current_date" => Some(Value::Date(today)),
        "current_year" => Some(Value::Int(today.year() as i64)),
        "current_month" => Some(Value::Int(today.month() as i64)),
        "current_day" => Some(Value::Int(today.day() as i64)),
        _ => None,
    }
}

fn render_subschema(sub: &SubSchema) -> String {
    serde_json::to_string(sub).unwrap_or_else(|_| "{}".to_string())
}

/// Evaluates one record at a time against a fixed schema.
///
/// Not thread-safe; concurrent validation of distinct records takes one
/// validator per thread (the schema and datastore may be shared).
pub struct RecordValidator<'a> {
    schema: &'a RuleSchema,
    pk_field: String,
    datastore: Option<&'a dyn Datastore>,
    options: ValidatorOptions,
    allow_unknown: bool,
    errors: ErrorTree,
    sys_errors: IndexMap<String, Vec<String>>,
    prev_records: HashMap<String, Option<Record>>,
    computed_scores: Record,
}

impl<'a> RecordValidator<'a> {
    /// Create a validator bound to a schema and primary-key field.
    pub fn new(
        schema: &'a RuleSchema,
        pk_field: impl Into<String>,
        options: ValidatorOptions,
    ) -> Self {
        Self {
            schema,
            pk_field: pk_field.into(),
            datastore: None,
            allow_unknown: !options.strict,
            options,
            errors: ErrorTree::new(),
            sys_errors: IndexMap::new(),
            prev_records: HashMap::new(),
            computed_scores: Record::new(),
        }
    }

    /// Bind the datastore used for temporal lookups and code validation.
    pub fn set_datastore(&mut self, datastore: &'a dyn Datastore) {
        self.datastore = Some(datastore);
    }

    /// Errors collected by the last `validate` call.
    pub fn errors(&self) -> &ErrorTree {
        &self.errors
    }

    /// Take ownership of the collected error tree.
    pub fn take_error_tree(&mut self) -> ErrorTree {
        std::mem::take(&mut self.errors)
    }

    /// System error messages by field, populated when `validate` returns
    /// `Err`.
    pub fn sys_errors(&self) -> &IndexMap<String, Vec<String>> {
        &self.sys_errors
    }

    /// Side table of scores computed by `score_variables`.
    pub fn computed_scores(&self) -> &Record {
        &self.computed_scores
    }

    /// Take ownership of the computed-scores table.
    pub fn take_computed_scores(&mut self) -> Record {
        std::mem::take(&mut self.computed_scores)
    }

    /// Flat field-to-messages view of the collected errors, with
    /// `meta.errmsg` overrides applied.
    pub fn flat_errors(&self) -> IndexMap<String, Vec<String>> {
        let mut flat = self.errors.flat_messages();
        for (field, messages) in flat.iter_mut() {
            if let Some(errmsg) = self.schema.get(field).and_then(FieldSchema::custom_errmsg) {
                *messages = vec![format!("{field}: {errmsg}")];
            }
        }
        flat
    }

    /// Normalize a record against the schema: empty strings become null,
    /// string values convert to the declared field type where possible, and
    /// missing schema fields are appended as null. Idempotent.
    pub fn cast_record(&self, record: Record) -> Record {
        let mut cast = Record::with_capacity(record.len() + self.schema.len());
        for (key, value) in record {
            let value = match value {
                Value::String(s) if s.trim().is_empty() => Value::Null,
                other => other,
            };
            let value = match (
                self.schema.get(&key).and_then(FieldSchema::primary_type),
                value,
            ) {
                (Some(DataType::Integer), Value::String(s)) => match s.trim().parse::<i64>() {
                    Ok(i) => Value::Int(i),
                    Err(_) => {
                        tracing::warn!(field = %key, value = %s, "failed to cast value to integer");
                        Value::String(s)
                    }
                },
                (Some(DataType::Integer), Value::Float(f)) => Value::Int(f as i64),
                (Some(DataType::Float), Value::String(s)) => match s.trim().parse::<f64>() {
                    Ok(f) => Value::Float(f),
                    Err(_) => {
                        tracing::warn!(field = %key, value = %s, "failed to cast value to float");
                        Value::String(s)
                    }
                },
                (Some(DataType::Bool), Value::String(s)) => {
                    match s.trim().to_ascii_lowercase().as_str() {
                        "true" | "1" => Value::Bool(true),
                        "false" | "0" => Value::Bool(false),
                        _ => {
                            tracing::warn!(field = %key, value = %s, "failed to cast value to bool");
                            Value::String(s)
                        }
                    }
                }
                (Some(DataType::Bool), Value::Int(i)) => Value::Bool(i != 0),
                (Some(DataType::Date), Value::String(s)) => match parse_date(&s) {
                    Some(d) => Value::Date(d),
                    None => {
                        tracing::warn!(field = %key, value = %s, "failed to cast value to date");
                        Value::String(s)
                    }
                },
                (_, value) => value,
            };
            cast.insert(key, value);
        }
        for key in self.schema.keys() {
            if !cast.contains_key(key) {
                cast.insert(key.clone(), Value::Null);
            }
        }
        cast
    }

    /// Validate a record. `Ok(true)` means every rule passed; `Ok(false)`
    /// means validation errors were collected; `Err` is a system fault.
    pub fn validate(&mut self, record: &Record) -> Result<bool> {
        self.errors = ErrorTree::new();
        self.sys_errors.clear();
        self.prev_records.clear();
        self.computed_scores = Record::new();

        if !self.allow_unknown {
            for (field, value) in record {
                if !self.schema.contains_key(field) {
                    self.push_error(
                        field,
                        "unknown",
                        String::new(),
                        value.clone(),
                        "unknown field".to_string(),
                        None,
                    );
                }
            }
        }

        let schema = self.schema;
        for (field, field_schema) in schema {
            self.validate_field(field, field_schema, record)?;
        }
        Ok(self.errors.is_empty())
    }

    fn validate_field(&mut self, field: &str, fs: &FieldSchema, record: &Record) -> Result<()> {
        let Some(value) = record.get(field) else {
            if fs.required == Some(true) {
                self.push_error(
                    field,
                    "required",
                    "true".to_string(),
                    Value::Null,
                    "required field".to_string(),
                    None,
                );
            }
            return Ok(());
        };
        let value = value.clone();

        if value.is_null() {
            if fs.nullable != Some(true) {
                self.push_error(
                    field,
                    "nullable",
                    "false".to_string(),
                    Value::Null,
                    "null value not allowed".to_string(),
                    None,
                );
            }
            // null-tolerant rules only
            if let Some(filled) = fs.filled {
                self.validate_filled(field, &value, filled);
            }
            if let Some(rule) = &fs.compare_with {
                self.validate_compare_with(field, &value, rule, record)?;
            }
            if let Some(rule) = &fs.compare_age {
                self.validate_compare_age(field, &value, rule, record);
            }
            if let Some(constraints) = &fs.compatibility {
                self.validate_compatibility(field, &value, constraints, record)?;
            }
            if let Some(rule) = &fs.logic {
                self.validate_logic(field, &value, rule, record)?;
            }
            return Ok(());
        }

        if let Some(dtype) = &fs.dtype {
            if !dtype.iter().any(|t| t.matches(&value)) {
                let tags: Vec<&str> = dtype.iter().map(DataType::tag).collect();
                let message = if tags.len() == 1 {
                    format!("must be of {} type", tags[0])
                } else {
                    format!("must be of [{}] type", tags.join(", "))
                };
                self.push_error(field, "type", tags.join(", "), value, message, None);
                // a mistyped value would make every later rule misfire
                return Ok(());
            }
        }

        if let Some(allowed) = &fs.allowed {
            if !allowed.iter().any(|candidate| soft_equals(&value, candidate)) {
                self.push_error(
                    field,
                    "allowed",
                    Value::List(allowed.clone()).to_string(),
                    value.clone(),
                    format!("unallowed value {value}"),
                    None,
                );
            }
        }

        if let Some(forbidden) = &fs.forbidden {
            if forbidden.iter().any(|candidate| soft_equals(&value, candidate)) {
                self.push_error(
                    field,
                    "forbidden",
                    Value::List(forbidden.clone()).to_string(),
                    value.clone(),
                    format!("unallowed value {value}"),
                    None,
                );
            }
        }

        if let Some(bound) = &fs.min {
            self.validate_bound(field, &value, bound, false);
        }
        if let Some(bound) = &fs.max {
            self.validate_bound(field, &value, bound, true);
        }

        if let Some(pattern) = &fs.regex {
            self.validate_regex(field, &value, pattern)?;
        }

        if let Some(branches) = &fs.anyof {
            self.validate_anyof(field, &value, branches, record)?;
        }

        if let Some(filled) = fs.filled {
            self.validate_filled(field, &value, filled);
        }

        if let Some(rule) = &fs.compare_with {
            self.validate_compare_with(field, &value, rule, record)?;
        }
        if let Some(rule) = &fs.compare_age {
            self.validate_compare_age(field, &value, rule, record);
        }
        if let Some(constraints) = &fs.compatibility {
            self.validate_compatibility(field, &value, constraints, record)?;
        }
        if let Some(rule) = &fs.logic {
            self.validate_logic(field, &value, rule, record)?;
        }
        if let Some(spec) = &fs.temporalrules {
            self.validate_temporalrules(field, &value, spec, record)?;
        }
        if let Some(keys) = &fs.compute_gds {
            self.validate_compute_gds(field, &value, keys, record);
        }
        if let Some(CheckWith::Rxnorm) = fs.check_with {
            self.validate_rxnorm(field, &value)?;
        }
        if let Some(rule) = &fs.function {
            self.validate_function(field, &value, rule, record)?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Standard rules
    // -------------------------------------------------------------------------

    fn validate_filled(&mut self, field: &str, value: &Value, filled: bool) {
        if filled && value.is_null() {
            self.push_error(
                field,
                "filled",
                "true".to_string(),
                value.clone(),
                "cannot be empty".to_string(),
                None,
            );
        } else if !filled && !value.is_null() {
            self.push_error(
                field,
                "filled",
                "false".to_string(),
                value.clone(),
                "must be empty".to_string(),
                None,
            );
        }
    }

    fn validate_bound(&mut self, field: &str, value: &Value, bound: &Value, is_max: bool) {
        if let Some(key) = bound.as_str() {
            if clock_value(key).is_some() {
                self.validate_clock_bound(field, value, key, is_max);
                return;
            }
        }
        let rule = if is_max { "max" } else { "min" };
        let comparator = if is_max { Comparator::Le } else { Comparator::Ge };
        if compare_values(comparator, value, bound) != Some(true) {
            self.push_error(
                field,
                rule,
                bound.to_string(),
                value.clone(),
                format!("{rule} value is {bound}"),
                None,
            );
        }
    }

    /// min/max against `current_date`/`current_year`/`current_month`/
    /// `current_day`, resolved from the system clock at evaluation time.
    fn validate_clock_bound(&mut self, field: &str, value: &Value, key: &str, is_max: bool) {
        let rule = if is_max { "max" } else { "min" };
        let Some(clock) = clock_value(key) else {
            return;
        };
        let actual = match key {
            "current_date" => value.as_date().map(Value::Date),
            "current_year" => match value {
                Value::Date(d) => Some(Value::Int(d.year() as i64)),
                Value::String(s) => parse_date(s).map(|d| Value::Int(d.year() as i64)),
                Value::Int(i) => Some(Value::Int(*i)),
                _ => None,
            },
            _ => value.as_int().map(Value::Int),
        };
        let Some(actual) = actual else {
            self.push_error(
                field,
                rule,
                key.to_string(),
                value.clone(),
                format!(
                    "{rule} date/year comparison error - {key} not supported for {} values",
                    value.type_name()
                ),
                None,
            );
            return;
        };
        let comparator = if is_max { Comparator::Gt } else { Comparator::Lt };
        if compare_values(comparator, &actual, &clock) == Some(true) {
            let noun = match key {
                "current_date" => "current date",
                "current_year" => "current year",
                "current_month" => "current month",
                _ => "current day",
            };
            let direction = if is_max { "greater" } else { "less" };
            self.push_error(
                field,
                rule,
                key.to_string(),
                value.clone(),
                format!("cannot be {direction} than {noun} {clock}"),
                None,
            );
        }
    }

    fn validate_regex(&mut self, field: &str, value: &Value, pattern: &str) -> Result<()> {
        let regex = match regex::Regex::new(&format!("^(?:{pattern})$")) {
            Ok(regex) => regex,
            Err(e) => {
                let err = EngineError::InvalidRule {
                    field: field.to_string(),
                    reason: format!("regex does not compile: {e}"),
                };
                self.add_system_error(field, &err.to_string());
                return Err(err);
            }
        };
        match value.as_str() {
            Some(s) if regex.is_match(s) => {}
            _ => self.push_error(
                field,
                "regex",
                pattern.to_string(),
                value.clone(),
                format!("value does not match regex '{pattern}'"),
                None,
            ),
        }
        Ok(())
    }

    fn validate_anyof(
        &mut self,
        field: &str,
        value: &Value,
        branches: &[FieldSchema],
        record: &Record,
    ) -> Result<()> {
        let mut captured = Vec::new();
        for branch in branches {
            let mut sub = RuleSchema::new();
            sub.insert(field.to_string(), branch.clone());
            let mut inner = self.subvalidator(&sub);
            match inner.validate(record) {
                Ok(true) => return Ok(()),
                Ok(false) => captured.push(inner.take_error_tree()),
                Err(e) => {
                    self.add_system_error(field, &e.to_string());
                    return Err(e);
                }
            }
        }
        self.push_error(
            field,
            "anyof",
            format!("{} definitions", branches.len()),
            value.clone(),
            "no definitions validate".to_string(),
            None,
        );
        for (i, tree) in captured.into_iter().enumerate() {
            self.errors.attach(field, format!("anyof definition {}", i + 1), tree);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // compare_with
    // -------------------------------------------------------------------------

    fn validate_compare_with(
        &mut self,
        field: &str,
        value: &Value,
        rule: &CompareWithRule,
        record: &Record,
    ) -> Result<()> {
        let base_label = match &rule.base {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let base_display = if rule.previous_record {
            format!("{base_label} (previous record)")
        } else {
            base_label.clone()
        };
        let mut comparison = format!("{field} {} {base_display}", rule.comparator);
        if let (Some(op), Some(adjustment)) = (&rule.op, &rule.adjustment) {
            let adj_label = match adjustment {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if *op == AdjustOp::Abs {
                comparison =
                    format!("abs({field} - {base_display}) {} {adj_label}", rule.comparator);
            } else {
                comparison = format!("{comparison} {op} {adj_label}");
            }
        }

        let base_value = if rule.previous_record {
            let Some(base_field) = rule.base.as_str().map(str::to_string) else {
                self.push_error(
                    field,
                    "compare_with",
                    comparison.clone(),
                    value.clone(),
                    format!("input value doesn't satisfy the condition {comparison}"),
                    None,
                );
                return Ok(());
            };
            let ignore_fields: Option<Vec<String>> = match &rule.ignore_empty {
                Some(IgnoreEmpty::Flag(true)) => Some(vec![base_field.clone()]),
                Some(IgnoreEmpty::One(name)) => Some(vec![name.clone()]),
                Some(IgnoreEmpty::Many(names)) => Some(names.clone()),
                Some(IgnoreEmpty::Flag(false)) | None => None,
            };
            let order_by = self.pk_field.clone();
            match self.fetch_previous(field, &order_by, record, ignore_fields.as_deref())? {
                Some(previous) => previous.get(&base_field).cloned().unwrap_or(Value::Null),
                None if ignore_fields.is_some() => return Ok(()), // no qualifying prior row
                None => {
                    self.push_error(
                        field,
                        "compare_with",
                        comparison.clone(),
                        value.clone(),
                        format!(
                            "failed to retrieve record for previous visit, \
                             cannot proceed with validation {comparison}"
                        ),
                        None,
                    );
                    return Ok(());
                }
            }
        } else {
            self.resolve_key(&rule.base, record)
        };

        if base_value.is_null() {
            self.push_error(
                field,
                "compare_with",
                comparison.clone(),
                value.clone(),
                format!("input value doesn't satisfy the condition {comparison}"),
                None,
            );
            return Ok(());
        }

        let mut effective_value = value.clone();
        let mut target = base_value.clone();
        if let (Some(op), Some(adjustment)) = (&rule.op, &rule.adjustment) {
            let adjustment = self.resolve_key(adjustment, record);
            match apply_adjustment(*op, &base_value, &adjustment, value) {
                Some((adjusted_value, adjusted_target)) => {
                    effective_value = adjusted_value;
                    target = adjusted_target;
                }
                None => {
                    self.push_error(
                        field,
                        "compare_with",
                        comparison.clone(),
                        value.clone(),
                        format!("input value doesn't satisfy the condition {comparison}"),
                        None,
                    );
                    return Ok(());
                }
            }
        }

        if compare_values(rule.comparator, &effective_value, &target) != Some(true) {
            self.push_error(
                field,
                "compare_with",
                comparison.clone(),
                value.clone(),
                format!("input value doesn't satisfy the condition {comparison}"),
                None,
            );
        }
        Ok(())
    }

    /// Resolve a rule argument: clock keys resolve from the system clock,
    /// field names resolve from the record, anything else is a literal.
    fn resolve_key(&self, key: &Value, record: &Record) -> Value {
        if let Value::String(s) = key {
            if let Some(clock) = clock_value(s) {
                return clock;
            }
            if let Some(value) = record.get(s) {
                return value.clone();
            }
        }
        key.clone()
    }

    // -------------------------------------------------------------------------
    // compare_age
    // -------------------------------------------------------------------------

    fn validate_compare_age(
        &mut self,
        field: &str,
        value: &Value,
        rule: &CompareAgeRule,
        record: &Record,
    ) {
        if value.is_null() {
            // no age to compute for an absent date
            return;
        }
        let Some(event_date) = value.as_date() else {
            self.push_error(
                field,
                "compare_age",
                rule.birth_year.to_string(),
                value.clone(),
                format!("failed to convert value {value} to a date"),
                None,
            );
            return;
        };

        let labels: Vec<String> = rule.compare_to.iter().map(Value::to_string).collect();
        let comparison = format!("age at {field} {} {}", rule.comparator, labels.join(", "));

        let birth_year = self.resolve_key(&rule.birth_year, record);
        let birth_month = rule
            .birth_month
            .as_ref()
            .map(|v| self.resolve_key(v, record))
            .unwrap_or(Value::Int(1));
        let birth_day = rule
            .birth_day
            .as_ref()
            .map(|v| self.resolve_key(v, record))
            .unwrap_or(Value::Int(1));

        let Some(birth_date) = make_birth_date(&birth_year, &birth_month, &birth_day) else {
            tracing::warn!(
                field,
                year = %birth_year,
                month = %birth_month,
                day = %birth_day,
                "cannot form a valid birth date for age comparison, skipping rule"
            );
            return;
        };

        let age = (event_date - birth_date).num_days() as f64 / DAYS_PER_YEAR;

        let mut candidates = Vec::new();
        for entry in rule.compare_to.iter() {
            let resolved = self.resolve_key(entry, record);
            match resolved.as_float() {
                Some(candidate) => candidates.push(candidate),
                None => self.push_error(
                    field,
                    "compare_age",
                    comparison.clone(),
                    value.clone(),
                    format!("error in comparing {entry} to age at {field} ({age:.1})"),
                    None,
                ),
            }
        }
        let Some(minimum) = candidates.into_iter().reduce(f64::min) else {
            return;
        };

        if compare_values(rule.comparator, &Value::Float(age), &Value::Float(minimum))
            != Some(true)
        {
            self.push_error(
                field,
                "compare_age",
                comparison.clone(),
                value.clone(),
                format!("input value {minimum} doesn't satisfy the condition: {comparison}"),
                None,
            );
        }
    }

    // -------------------------------------------------------------------------
    // Subschema recursion
    // -------------------------------------------------------------------------

    /// Fresh validator for nested clause evaluation: same primary key,
    /// datastore and options, unknown fields always allowed.
    fn subvalidator<'b>(&self, schema: &'b RuleSchema) -> RecordValidator<'b>
    where
        'a: 'b,
    {
        let mut inner = RecordValidator::new(
            schema,
            self.pk_field.clone(),
            ValidatorOptions {
                strict: false,
                gds_rounding: self.options.gds_rounding,
            },
        );
        inner.datastore = self.datastore;
        inner
    }

    /// Apply every `(field, rules)` pair of a clause against a record,
    /// combined with AND (all must pass) or OR (any passes).
    fn check_subschema(
        &self,
        conds: &SubSchema,
        op: CombineOp,
        record: &Record,
    ) -> Result<(bool, ErrorTree)> {
        let mut collected = ErrorTree::new();
        let mut valid = op != CombineOp::Or;
        for (cond_field, rules) in conds {
            let mut sub = RuleSchema::new();
            sub.insert(cond_field.clone(), rules.clone());
            let mut inner = self.subvalidator(&sub);
            let ok = inner.validate(record)?;
            match op {
                CombineOp::Or => {
                    if ok {
                        return Ok((true, ErrorTree::new()));
                    }
                    valid = false;
                    collected.merge(inner.take_error_tree());
                }
                CombineOp::And => {
                    if !ok {
                        return Ok((false, inner.take_error_tree()));
                    }
                }
            }
        }
        Ok((valid, collected))
    }

    fn check_subschema_wrapped(
        &mut self,
        field: &str,
        conds: &SubSchema,
        op: CombineOp,
        record: &Record,
    ) -> Result<(bool, ErrorTree)> {
        match self.check_subschema(conds, op, record) {
            Ok(result) => Ok(result),
            Err(e) => {
                self.add_system_error(field, &e.to_string());
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // compatibility
    // -------------------------------------------------------------------------

    fn validate_compatibility(
        &mut self,
        field: &str,
        value: &Value,
        constraints: &[CompatibilityConstraint],
        record: &Record,
    ) -> Result<()> {
        for (i, constraint) in constraints.iter().enumerate() {
            let rule_no = constraint.index.unwrap_or(i + 1);
            let (if_ok, _) =
                self.check_subschema_wrapped(field, &constraint.if_conds, constraint.if_op, record)?;
            let if_json = render_subschema(&constraint.if_conds);

            if if_ok {
                let (ok, errors) =
                    self.check_subschema_wrapped(field, &constraint.then, constraint.then_op, record)?;
                if !ok {
                    let then_json = render_subschema(&constraint.then);
                    let message = format!(
                        "{} for if {} then {} - compatibility rule no: {}",
                        errors.summary(),
                        if_json,
                        then_json,
                        rule_no
                    );
                    self.push_error(
                        field,
                        "compatibility",
                        then_json,
                        value.clone(),
                        message,
                        Some(rule_no),
                    );
                    self.errors
                        .attach(field, format!("compatibility rule {rule_no}"), errors);
                }
            } else if let Some(else_conds) = &constraint.else_conds {
                let (ok, errors) =
                    self.check_subschema_wrapped(field, else_conds, constraint.else_op, record)?;
                if !ok {
                    let else_json = render_subschema(else_conds);
                    let message = format!(
                        "{} for if {} else {} - compatibility rule no: {}",
                        errors.summary(),
                        if_json,
                        else_json,
                        rule_no
                    );
                    self.push_error(
                        field,
                        "compatibility",
                        else_json,
                        value.clone(),
                        message,
                        Some(rule_no),
                    );
                    self.errors
                        .attach(field, format!("compatibility rule {rule_no}"), errors);
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // logic
    // -------------------------------------------------------------------------

    fn validate_logic(
        &mut self,
        field: &str,
        value: &Value,
        rule: &LogicRule,
        record: &Record,
    ) -> Result<()> {
        let result = match logic::evaluate(&rule.formula, record) {
            Ok(result) => result,
            Err(e) => {
                self.add_system_error(field, &format!("error in formula evaluation - {e}"));
                return Err(e);
            }
        };
        if !result.to_bool() {
            let message = rule
                .errmsg
                .clone()
                .unwrap_or_else(|| format!("value {value} does not satisfy the specified formula"));
            let constraint =
                serde_json::to_string(&rule.formula).unwrap_or_else(|_| "{}".to_string());
            self.push_error(field, "logic", constraint, value.clone(), message, None);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // temporalrules
    // -------------------------------------------------------------------------

    /// Fetch the participant's previous record, with per-primary-key
    /// caching. `ignore_empty` fetches bypass the cache because the filter
    /// changes which row qualifies.
    fn fetch_previous(
        &mut self,
        field: &str,
        order_by: &str,
        record: &Record,
        ignore_empty: Option<&[String]>,
    ) -> Result<Option<Record>> {
        let Some(datastore) = self.datastore else {
            let err = EngineError::DatastoreNotSet("temporal rules");
            self.add_system_error(field, &err.to_string());
            return Err(err);
        };
        let pk_value = match record.get(&self.pk_field) {
            Some(v) if !v.is_null() => v.clone(),
            _ => {
                let message = format!(
                    "primary key variable {} not set in current visit data",
                    self.pk_field
                );
                self.push_error(
                    field,
                    "temporalrules",
                    self.pk_field.clone(),
                    Value::Null,
                    message,
                    None,
                );
                return Ok(None);
            }
        };

        let cache_key = pk_value.to_string();
        if ignore_empty.is_none() {
            if let Some(cached) = self.prev_records.get(&cache_key) {
                return Ok(cached.clone());
            }
        }

        tracing::debug!(order_by, pk = %pk_value, "fetching previous record");
        let fetched = match datastore.get_previous_record(order_by, record, ignore_empty) {
            Ok(previous) => previous.map(|r| self.cast_record(r)),
            Err(e) => {
                self.add_system_error(field, &e.to_string());
                return Err(EngineError::Datastore(e));
            }
        };
        if ignore_empty.is_none() {
            self.prev_records.insert(cache_key, fetched.clone());
        }
        Ok(fetched)
    }

    fn validate_temporalrules(
        &mut self,
        field: &str,
        value: &Value,
        spec: &TemporalRulesSpec,
        record: &Record,
    ) -> Result<()> {
        let constraints = spec.constraints();
        for (i, constraint) in constraints.iter().enumerate() {
            let rule_no = constraint.index.unwrap_or(i + 1);
            let ignore_fields = constraint.ignore_empty.as_ref().map(|ie| ie.fields());
            let order_by = constraint
                .orderby
                .clone()
                .unwrap_or_else(|| self.pk_field.clone());

            let Some(previous) =
                self.fetch_previous(field, &order_by, record, ignore_fields.as_deref())?
            else {
                // no qualifying history: the constraint is conditional on it
                continue;
            };

            if !constraint.swap_order {
                let (cond_ok, _) = self.check_subschema_wrapped(
                    field,
                    &constraint.previous,
                    constraint.prev_op,
                    &previous,
                )?;
                if !cond_ok {
                    continue;
                }
                let (ok, errors) = self.check_subschema_wrapped(
                    field,
                    &constraint.current,
                    constraint.curr_op,
                    record,
                )?;
                if !ok {
                    let prev_json = render_subschema(&constraint.previous);
                    let message = format!(
                        "{} in current visit for {} in previous visit - temporal rule no: {}",
                        errors.summary(),
                        prev_json,
                        rule_no
                    );
                    self.push_error(
                        field,
                        "temporalrules",
                        prev_json,
                        value.clone(),
                        message,
                        Some(rule_no),
                    );
                    self.errors
                        .attach(field, format!("temporal rule {rule_no}"), errors);
                }
            } else {
                let (cond_ok, _) = self.check_subschema_wrapped(
                    field,
                    &constraint.current,
                    constraint.curr_op,
                    record,
                )?;
                if !cond_ok {
                    continue;
                }
                let (ok, errors) = self.check_subschema_wrapped(
                    field,
                    &constraint.previous,
                    constraint.prev_op,
                    &previous,
                )?;
                if !ok {
                    let curr_json = render_subschema(&constraint.current);
                    let message = format!(
                        "{} in previous visit for {} in current visit - temporal rule no: {}",
                        errors.summary(),
                        curr_json,
                        rule_no
                    );
                    self.push_error(
                        field,
                        "temporalrules",
                        curr_json,
                        value.clone(),
                        message,
                        Some(rule_no),
                    );
                    self.errors
                        .attach(field, format!("temporal rule {rule_no}"), errors);
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // compute_gds
    // -------------------------------------------------------------------------

    fn validate_compute_gds(
        &mut self,
        field: &str,
        value: &Value,
        keys: &[String],
        record: &Record,
    ) {
        let nogds = record
            .get("nogds")
            .and_then(|v| v.as_int())
            .unwrap_or(0);

        let mut answered = 0usize;
        let mut total = 0i64;
        for key in keys {
            if let Some(item) = record.get(key).and_then(|v| v.as_int()) {
                if item == 0 || item == 1 {
                    answered += 1;
                    total += item;
                }
            }
        }

        let constraint = keys.join(", ");
        if nogds == 1 {
            if !soft_equals(value, &Value::Int(GDS_NOT_ATTEMPTED_SCORE)) {
                self.push_error(
                    field,
                    "compute_gds",
                    constraint.clone(),
                    value.clone(),
                    format!(
                        "If GDS not attempted (nogds=1), total GDS score should be {}",
                        GDS_NOT_ATTEMPTED_SCORE
                    ),
                    None,
                );
            }
            if answered >= GDS_MIN_ANSWERED {
                self.push_error(
                    field,
                    "compute_gds",
                    constraint,
                    value.clone(),
                    format!(
                        "If GDS not attempted (nogds=1), there cannot be >={} questions \
                         with valid scores",
                        GDS_MIN_ANSWERED
                    ),
                    None,
                );
            }
            return;
        }

        if answered < GDS_MIN_ANSWERED {
            self.push_error(
                field,
                "compute_gds",
                constraint,
                value.clone(),
                format!(
                    "If GDS attempted (nogds=blank), at least {} questions need to have \
                     valid scores",
                    GDS_MIN_ANSWERED
                ),
                None,
            );
            return;
        }

        let expected = if answered == GDS_NUM_ITEMS {
            total
        } else {
            let prorated = GDS_NUM_ITEMS as f64 * total as f64 / answered as f64;
            match self.options.gds_rounding {
                GdsRounding::HalfUp => (prorated + 0.5).floor() as i64,
                GdsRounding::HalfEven => prorated.round_ties_even() as i64,
            }
        };

        if !soft_equals(value, &Value::Int(expected)) {
            self.push_error(
                field,
                "compute_gds",
                constraint,
                value.clone(),
                format!("incorrect GDS score {value}, expected value {expected}"),
                None,
            );
        }
    }

    // -------------------------------------------------------------------------
    // check_with / function registry
    // -------------------------------------------------------------------------

    fn validate_rxnorm(&mut self, field: &str, value: &Value) -> Result<()> {
        // blank or 0 means no RXCUI code available
        let Some(code) = value.as_int() else {
            return Ok(());
        };
        if code == 0 {
            return Ok(());
        }
        let Some(datastore) = self.datastore else {
            let err = EngineError::DatastoreNotSet("RXNORM codes");
            self.add_system_error(field, &err.to_string());
            return Err(err);
        };
        match datastore.is_valid_rxcui(code) {
            Ok(true) => {}
            Ok(false) => self.push_error(
                field,
                "check_with",
                "rxnorm".to_string(),
                value.clone(),
                format!("Drug ID {code} is not a valid RXCUI code"),
                None,
            ),
            Err(e) => {
                self.add_system_error(field, &e.to_string());
                return Err(EngineError::Datastore(e));
            }
        }
        Ok(())
    }

    fn validate_function(
        &mut self,
        field: &str,
        value: &Value,
        rule: &FunctionRule,
        record: &Record,
    ) -> Result<()> {
        match rule.name.as_str() {
            "score_variables" => self.score_variables(field, value, &rule.args, record),
            "check_adcid" => self.check_adcid(field, value, rule.args.own.unwrap_or(true)),
            other => {
                let err = EngineError::UnknownFunction(other.to_string());
                self.add_system_error(field, &err.to_string());
                Err(err)
            }
        }
    }

    /// Sum the named fields (nulls skipped), record the total in the
    /// computed-scores table, and check it against the expected value.
    fn score_variables(
        &mut self,
        field: &str,
        value: &Value,
        args: &FunctionArgs,
        record: &Record,
    ) -> Result<()> {
        let (Some(fields), Some(expected)) = (&args.fields, &args.expected) else {
            let err = EngineError::InvalidRule {
                field: field.to_string(),
                reason: "score_variables requires fields and expected arguments".to_string(),
            };
            self.add_system_error(field, &err.to_string());
            return Err(err);
        };

        let mut total = 0i64;
        for name in fields {
            match record.get(name) {
                None | Some(Value::Null) => continue,
                Some(item) => match item.as_int() {
                    Some(i) => total += i,
                    None => {
                        tracing::warn!(field = %name, "non-numeric value skipped in score_variables");
                    }
                },
            }
        }

        let store_as = args
            .store_as
            .clone()
            .unwrap_or_else(|| "__total_sum".to_string());
        self.computed_scores.insert(store_as, Value::Int(total));

        let expected_value = self.resolve_key(expected, record);
        if !soft_equals(&Value::Int(total), &expected_value) {
            self.push_error(
                field,
                "function",
                "score_variables".to_string(),
                value.clone(),
                format!(
                    "computed score {total} for {field} does not match expected value \
                     {expected_value}"
                ),
                None,
            );
        }
        Ok(())
    }

    fn check_adcid(&mut self, field: &str, value: &Value, own: bool) -> Result<()> {
        let Some(adcid) = value.as_int() else {
            return Ok(());
        };
        let Some(datastore) = self.datastore else {
            let err = EngineError::DatastoreNotSet("ADCID");
            self.add_system_error(field, &err.to_string());
            return Err(err);
        };
        match datastore.is_valid_adcid(adcid, own) {
            Ok(true) => {}
            Ok(false) => {
                let message = if own {
                    format!("ADCID {adcid} does not match your center's ADCID")
                } else {
                    format!("{adcid} is not a valid ADCID")
                };
                self.push_error(
                    field,
                    "function",
                    "check_adcid".to_string(),
                    value.clone(),
                    message,
                    None,
                );
            }
            Err(e) => {
                self.add_system_error(field, &e.to_string());
                return Err(EngineError::Datastore(e));
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bookkeeping
    // -------------------------------------------------------------------------

    fn push_error(
        &mut self,
        field: &str,
        rule: &str,
        constraint: String,
        value: Value,
        message: String,
        rule_index: Option<usize>,
    ) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            rule: rule.to_string(),
            constraint,
            value,
            message,
            rule_index,
        });
    }

    fn add_system_error(&mut self, field: &str, message: &str) {
        self.sys_errors
            .entry(field.to_string())
            .or_default()
            .push(message.to_string());
    }
}

/// Combine base and adjustment, returning `(effective_value, target)` for
/// the final comparison. `abs` folds the field value instead:
/// `abs(value - base) {comparator} adjustment`.
fn apply_adjustment(
    op: AdjustOp,
    base: &Value,
    adjustment: &Value,
    value: &Value,
) -> Option<(Value, Value)> {
    if op == AdjustOp::Abs {
        let diff = (value.as_float()? - base.as_float()?).abs();
        let effective = if matches!((value, base), (Value::Int(_), Value::Int(_))) {
            Value::Int(diff as i64)
        } else {
            Value::Float(diff)
        };
        return Some((effective, adjustment.clone()));
    }

    let base_num = base.as_float()?;
    let adj_num = adjustment.as_float()?;
    let result = match op {
        AdjustOp::Add => base_num + adj_num,
        AdjustOp::Sub => base_num - adj_num,
        AdjustOp::Mul => base_num * adj_num,
        AdjustOp::Div => {
            if adj_num == 0.0 {
                return None;
            }
            base_num / adj_num
        }
        AdjustOp::Abs => unreachable!("handled above"),
    };
    let both_int = matches!((base, adjustment), (Value::Int(_), Value::Int(_)));
    let target = if both_int && op != AdjustOp::Div {
        Value::Int(result as i64)
    } else {
        Value::Float(result)
    };
    Some((value.clone(), target))
}

/// Birth date from resolved year/month/day components; `None` when the
/// components cannot form a real calendar date.
fn make_birth_date(year: &Value, month: &Value, day: &Value) -> Option<NaiveDate> {
    let year = year.as_int()?;
    let month = month.as_int()?;
    let day = day.as_int()?;
    if !(1..=9999).contains(&year) || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
}
