//! Declarative rule schemas
//!
//! A schema maps field names to [`FieldSchema`] objects, each a bag of
//! rules applied to that field. Schemas load from JSON or YAML and are
//! deserialized once into typed rule arguments; unknown rule names or
//! malformed argument shapes fail at load time, never during validation.
//!
//! Sub-schemas (the clauses of `compatibility` and `temporalrules`, and
//! `anyof` branches) reuse [`FieldSchema`] recursively.

use crate::error::SchemaError;
use crate::logic::Expr;
use crate::types::{Comparator, Value};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;

/// A full validation schema: field name to rules, insertion-ordered.
pub type RuleSchema = IndexMap<String, FieldSchema>;

/// A schema fragment used inside compatibility/temporal clauses.
pub type SubSchema = IndexMap<String, FieldSchema>;

/// Scalar type tags a field may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Integer,
    Float,
    String,
    #[serde(alias = "boolean")]
    Bool,
    Date,
    List,
}

impl DataType {
    /// Check whether a (non-null) value carries this type.
    /// Float accepts integer values.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            DataType::Integer => matches!(value, Value::Int(_)),
            DataType::Float => matches!(value, Value::Int(_) | Value::Float(_)),
            DataType::String => matches!(value, Value::String(_)),
            DataType::Bool => matches!(value, Value::Bool(_)),
            DataType::Date => matches!(value, Value::Date(_)),
            DataType::List => matches!(value, Value::List(_)),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::String => "string",
            DataType::Bool => "bool",
            DataType::Date => "date",
            DataType::List => "list",
        }
    }
}

/// One value or a list of values, accepted interchangeably in rule
/// arguments (`type`, `compare_to`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item).iter(),
            OneOrMany::Many(items) => items.iter(),
        }
    }
}

/// Combination operator for multi-field clauses: do all fields have to
/// pass, or any. Accepts `AND`/`OR` in either case; defaults to `AND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CombineOp {
    #[default]
    And,
    Or,
}

impl<'de> Deserialize<'de> for CombineOp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        match token.to_ascii_uppercase().as_str() {
            "AND" => Ok(CombineOp::And),
            "OR" => Ok(CombineOp::Or),
            other => Err(serde::de::Error::custom(format!(
                "unknown combination operator: {other}"
            ))),
        }
    }
}

/// Adjustment operator for `compare_with`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustOp {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Sub,
    #[serde(rename = "*")]
    Mul,
    #[serde(rename = "/")]
    Div,
    #[serde(rename = "abs")]
    Abs,
}

impl fmt::Display for AdjustOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            AdjustOp::Add => "+",
            AdjustOp::Sub => "-",
            AdjustOp::Mul => "*",
            AdjustOp::Div => "/",
            AdjustOp::Abs => "abs",
        };
        write!(f, "{}", token)
    }
}

/// `ignore_empty` on `compare_with`: a flag (base field must be non-empty)
/// or an explicit field list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IgnoreEmpty {
    Flag(bool),
    One(String),
    Many(Vec<String>),
}

/// `ignore_empty` on temporal constraints: field name(s) the previous
/// record must have filled to qualify.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IgnoreEmptyFields {
    One(String),
    Many(Vec<String>),
}

impl IgnoreEmptyFields {
    pub fn fields(&self) -> Vec<String> {
        match self {
            IgnoreEmptyFields::One(field) => vec![field.clone()],
            IgnoreEmptyFields::Many(fields) => fields.clone(),
        }
    }
}

/// Arguments of the `compare_with` rule:
/// `field {comparator} (base {op} adjustment)`, or with `op: abs`,
/// `abs(field - base) {comparator} adjustment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompareWithRule {
    pub comparator: Comparator,
    /// Field name, clock key (`current_date`/`current_year`/...), or literal
    pub base: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<AdjustOp>,
    /// Resolve `base` against the participant's previous record
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub previous_record: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_empty: Option<IgnoreEmpty>,
}

/// Arguments of the `compare_age` rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompareAgeRule {
    pub comparator: Comparator,
    /// Field name or literal year
    pub birth_year: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_month: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_day: Option<Value>,
    /// Field name(s) or literal age(s); the age compares against the minimum
    pub compare_to: OneOrMany<Value>,
}

/// One `compatibility` constraint: if/then(/else) sub-schemas over the
/// current record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompatibilityConstraint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default)]
    pub if_op: CombineOp,
    #[serde(default)]
    pub then_op: CombineOp,
    #[serde(default)]
    pub else_op: CombineOp,
    #[serde(rename = "if")]
    pub if_conds: SubSchema,
    pub then: SubSchema,
    #[serde(rename = "else", skip_serializing_if = "Option::is_none")]
    pub else_conds: Option<SubSchema>,
}

/// One temporal constraint: a condition on the previous visit and the rule
/// the current visit must then satisfy (or the other way around with
/// `swap_order`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemporalConstraint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default)]
    pub prev_op: CombineOp,
    #[serde(default)]
    pub curr_op: CombineOp,
    pub previous: SubSchema,
    pub current: SubSchema,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_empty: Option<IgnoreEmptyFields>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub swap_order: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orderby: Option<String>,
}

/// `temporalrules` accepts a plain constraint list or a wrapper carrying a
/// shared `orderby`; both normalize to per-constraint form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemporalRulesSpec {
    Grouped(GroupedTemporalRules),
    List(Vec<TemporalConstraint>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupedTemporalRules {
    pub orderby: String,
    pub constraints: Vec<TemporalConstraint>,
}

impl TemporalRulesSpec {
    /// Constraint list with the group-level `orderby` pushed down.
    pub fn constraints(&self) -> Vec<TemporalConstraint> {
        match self {
            TemporalRulesSpec::List(constraints) => constraints.clone(),
            TemporalRulesSpec::Grouped(group) => group
                .constraints
                .iter()
                .cloned()
                .map(|mut constraint| {
                    if constraint.orderby.is_none() {
                        constraint.orderby = Some(group.orderby.clone());
                    }
                    constraint
                })
                .collect(),
        }
    }
}

/// Arguments of the `logic` rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogicRule {
    pub formula: Expr,
    #[serde(alias = "errormsg", skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
}

/// Named lookups routed through the datastore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckWith {
    Rxnorm,
}

/// Arguments of the `function` rule; `name` indexes the registry of
/// scoring/plausibility computations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionRule {
    #[serde(alias = "function_name")]
    pub name: String,
    #[serde(default, alias = "arguments")]
    pub args: FunctionArgs,
}

/// Union of the arguments the registered functions take.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionArgs {
    /// score_variables: fields to sum (nulls skipped)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    /// score_variables: name for the total in the computed-scores table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_as: Option<String>,
    /// score_variables: expected total (literal or field name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    /// check_adcid: validate against the submitting center's own id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub own: Option<bool>,
}

/// Free-form metadata on a field schema. `errmsg` replaces every flat
/// error message reported for the field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
}

/// All rules declared for one field. Unknown keys are rejected at parse
/// time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSchema {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub dtype: Option<OneOrMany<DataType>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forbidden: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anyof: Option<Vec<FieldSchema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compare_with: Option<CompareWithRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compare_age: Option<CompareAgeRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<Vec<CompatibilityConstraint>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logic: Option<LogicRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporalrules: Option<TemporalRulesSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_gds: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_with: Option<CheckWith>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl FieldSchema {
    /// First declared type tag, used for record casting.
    pub fn primary_type(&self) -> Option<DataType> {
        self.dtype.as_ref().and_then(|t| t.iter().next().copied())
    }

    /// Custom error message from `meta.errmsg`, if declared.
    pub fn custom_errmsg(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|m| m.errmsg.as_deref())
    }
}

/// Parse a schema from JSON text.
pub fn parse_schema_json(text: &str) -> Result<RuleSchema, SchemaError> {
    serde_json::from_str(text).map_err(|e| SchemaError::Parse(e.to_string()))
}

/// Parse a schema from YAML text.
pub fn parse_schema_yaml(text: &str) -> Result<RuleSchema, SchemaError> {
    serde_yaml::from_str(text).map_err(|e| SchemaError::Parse(e.to_string()))
}

/// Load a schema file; `.yml`/`.yaml` parse as YAML, everything else as JSON.
pub fn load_schema(path: &Path) -> Result<RuleSchema, SchemaError> {
    let text = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yml") | Some("yaml") => parse_schema_yaml(&text),
        _ => parse_schema_json(&text),
    }
}

/// Validate a parsed schema: primary key declared and required, rule
/// argument shapes consistent, nested sub-schemas well-formed.
pub fn validate_schema(schema: &RuleSchema, pk_field: &str) -> Result<(), SchemaError> {
    match schema.get(pk_field) {
        Some(field) if field.required == Some(true) => {}
        _ => return Err(SchemaError::MissingPrimaryKey(pk_field.to_string())),
    }
    for (field, field_schema) in schema {
        validate_field_schema(field, field_schema)?;
    }
    Ok(())
}

fn validate_field_schema(field: &str, fs: &FieldSchema) -> Result<(), SchemaError> {
    let invalid = |reason: String| SchemaError::InvalidRule {
        field: field.to_string(),
        reason,
    };

    if let Some(pattern) = &fs.regex {
        Regex::new(&format!("^(?:{pattern})$"))
            .map_err(|e| invalid(format!("regex does not compile: {e}")))?;
    }

    if let Some(rule) = &fs.compare_with {
        if rule.op.is_some() != rule.adjustment.is_some() {
            return Err(invalid(
                "compare_with requires op and adjustment together".to_string(),
            ));
        }
    }

    if let Some(keys) = &fs.compute_gds {
        if keys.len() != crate::config::GDS_NUM_ITEMS {
            return Err(invalid(format!(
                "compute_gds requires exactly {} keys, found {}",
                crate::config::GDS_NUM_ITEMS,
                keys.len()
            )));
        }
    }

    if let Some(function) = &fs.function {
        match function.name.as_str() {
            "score_variables" => {
                if function.args.fields.is_none() || function.args.expected.is_none() {
                    return Err(invalid(
                        "score_variables requires fields and expected arguments".to_string(),
                    ));
                }
            }
            "check_adcid" => {}
            other => return Err(invalid(format!("unknown function {other}"))),
        }
    }

    if let Some(branches) = &fs.anyof {
        if branches.is_empty() {
            return Err(invalid("anyof requires at least one definition".to_string()));
        }
        for branch in branches {
            validate_field_schema(field, branch)?;
        }
    }

    if let Some(constraints) = &fs.compatibility {
        if constraints.is_empty() {
            return Err(invalid(
                "compatibility requires at least one constraint".to_string(),
            ));
        }
        for constraint in constraints {
            if constraint.if_conds.is_empty() || constraint.then.is_empty() {
                return Err(invalid(
                    "compatibility constraints need non-empty if and then clauses".to_string(),
                ));
            }
            validate_subschema(&constraint.if_conds)?;
            validate_subschema(&constraint.then)?;
            if let Some(else_conds) = &constraint.else_conds {
                if else_conds.is_empty() {
                    return Err(invalid(
                        "compatibility else clause must not be empty".to_string(),
                    ));
                }
                validate_subschema(else_conds)?;
            }
        }
    }

    if let Some(spec) = &fs.temporalrules {
        let constraints = spec.constraints();
        if constraints.is_empty() {
            return Err(invalid(
                "temporalrules requires at least one constraint".to_string(),
            ));
        }
        for constraint in &constraints {
            if constraint.previous.is_empty() || constraint.current.is_empty() {
                return Err(invalid(
                    "temporal constraints need non-empty previous and current clauses".to_string(),
                ));
            }
            validate_subschema(&constraint.previous)?;
            validate_subschema(&constraint.current)?;
        }
    }

    Ok(())
}

fn validate_subschema(sub: &SubSchema) -> Result<(), SchemaError> {
    for (field, field_schema) in sub {
        validate_field_schema(field, field_schema)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema_from(value: serde_json::Value) -> RuleSchema {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_basic_schema() {
        let schema = schema_from(json!({
            "ptid": {"type": "string", "required": true},
            "hello": {"type": "string", "allowed": ["world"]}
        }));
        assert_eq!(schema.len(), 2);
        assert_eq!(schema["ptid"].required, Some(true));
        assert_eq!(schema["hello"].allowed.as_ref().unwrap().len(), 1);
        assert!(validate_schema(&schema, "ptid").is_ok());
    }

    #[test]
    fn test_unknown_rule_name_fails_parse() {
        let result = parse_schema_json(r#"{"x": {"type": "integer", "frobnicate": 1}}"#);
        assert!(matches!(result, Err(SchemaError::Parse(_))));
    }

    #[test]
    fn test_type_tag_list() {
        let schema = schema_from(json!({
            "x": {"type": ["integer", "string"]}
        }));
        let tags: Vec<DataType> = schema["x"].dtype.as_ref().unwrap().iter().copied().collect();
        assert_eq!(tags, vec![DataType::Integer, DataType::String]);
        assert_eq!(schema["x"].primary_type(), Some(DataType::Integer));
    }

    #[test]
    fn test_boolean_alias() {
        let schema = schema_from(json!({"x": {"type": "boolean"}}));
        assert_eq!(schema["x"].primary_type(), Some(DataType::Bool));
    }

    #[test]
    fn test_missing_primary_key_rejected() {
        let schema = schema_from(json!({"hello": {"type": "string"}}));
        assert!(matches!(
            validate_schema(&schema, "ptid"),
            Err(SchemaError::MissingPrimaryKey(_))
        ));

        // declared but not required is also rejected
        let schema = schema_from(json!({"ptid": {"type": "string"}}));
        assert!(matches!(
            validate_schema(&schema, "ptid"),
            Err(SchemaError::MissingPrimaryKey(_))
        ));
    }

    #[test]
    fn test_compare_with_op_needs_adjustment() {
        let schema = schema_from(json!({
            "ptid": {"type": "string", "required": true},
            "birthyr": {
                "type": "integer",
                "compare_with": {"comparator": "<=", "base": "current_year", "op": "-"}
            }
        }));
        assert!(matches!(
            validate_schema(&schema, "ptid"),
            Err(SchemaError::InvalidRule { .. })
        ));
    }

    #[test]
    fn test_bad_regex_rejected() {
        let schema = schema_from(json!({
            "ptid": {"type": "string", "required": true, "regex": "(unclosed"}
        }));
        assert!(matches!(
            validate_schema(&schema, "ptid"),
            Err(SchemaError::InvalidRule { .. })
        ));
    }

    #[test]
    fn test_temporal_orderby_normalization() {
        // grouped form pushes orderby down to each constraint
        let schema = schema_from(json!({
            "taxes": {
                "type": "integer",
                "temporalrules": {
                    "orderby": "visit_num",
                    "constraints": [
                        {"previous": {"taxes": {"allowed": [0]}},
                         "current": {"taxes": {"forbidden": [8]}}}
                    ]
                }
            }
        }));
        let spec = schema["taxes"].temporalrules.as_ref().unwrap();
        let constraints = spec.constraints();
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].orderby.as_deref(), Some("visit_num"));

        // list form leaves per-constraint orderby alone
        let schema = schema_from(json!({
            "taxes": {
                "type": "integer",
                "temporalrules": [
                    {"previous": {"taxes": {"allowed": [0]}},
                     "current": {"taxes": {"forbidden": [8]}},
                     "orderby": "visit_num"}
                ]
            }
        }));
        let spec = schema["taxes"].temporalrules.as_ref().unwrap();
        assert_eq!(spec.constraints()[0].orderby.as_deref(), Some("visit_num"));
    }

    #[test]
    fn test_combine_op_case_insensitive() {
        let schema = schema_from(json!({
            "x": {
                "compatibility": [{
                    "if_op": "or",
                    "if": {"a": {"allowed": [1]}, "b": {"allowed": [1]}},
                    "then": {"x": {"nullable": false}}
                }]
            }
        }));
        let constraint = &schema["x"].compatibility.as_ref().unwrap()[0];
        assert_eq!(constraint.if_op, CombineOp::Or);
        assert_eq!(constraint.then_op, CombineOp::And);
    }

    #[test]
    fn test_compute_gds_requires_fifteen_keys() {
        let schema = schema_from(json!({
            "ptid": {"type": "string", "required": true},
            "gds": {"type": "integer", "compute_gds": ["a", "b", "c"]}
        }));
        assert!(matches!(
            validate_schema(&schema, "ptid"),
            Err(SchemaError::InvalidRule { .. })
        ));
    }

    #[test]
    fn test_unknown_function_rejected() {
        let schema = schema_from(json!({
            "ptid": {"type": "string", "required": true},
            "x": {"function": {"name": "frobnicate"}}
        }));
        assert!(matches!(
            validate_schema(&schema, "ptid"),
            Err(SchemaError::InvalidRule { .. })
        ));
    }

    #[test]
    fn test_logic_errmsg_alias() {
        let schema = schema_from(json!({
            "x": {"logic": {"formula": {"==": [1, 1]}, "errormsg": "custom"}}
        }));
        assert_eq!(
            schema["x"].logic.as_ref().unwrap().errmsg.as_deref(),
            Some("custom")
        );
    }

    #[test]
    fn test_yaml_schema_parses() {
        let yaml = r#"
ptid:
  type: string
  required: true
birthyr:
  type: integer
  compare_with:
    comparator: "<="
    base: current_year
    op: "-"
    adjustment: 15
"#;
        let schema = parse_schema_yaml(yaml).unwrap();
        assert!(validate_schema(&schema, "ptid").is_ok());
        let rule = schema["birthyr"].compare_with.as_ref().unwrap();
        assert_eq!(rule.comparator, Comparator::Le);
        assert_eq!(rule.op, Some(AdjustOp::Sub));
        assert_eq!(rule.adjustment, Some(Value::Int(15)));
    }
}
