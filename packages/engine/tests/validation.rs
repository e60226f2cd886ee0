//! End-to-end validation scenarios against the public API.

use chrono::Datelike;
use formqc_engine::{parse_schema_json, QualityCheck, Record, RuleSchema, Value};
use pretty_assertions::assert_eq;
use serde_json::json;

fn schema_from(value: serde_json::Value) -> RuleSchema {
    serde_json::from_value(value).unwrap()
}

fn record(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// -----------------------------------------------------------------------------
// Scenario: hello world
// -----------------------------------------------------------------------------

#[test]
fn hello_world() {
    let schema = schema_from(json!({
        "ptid": {"type": "integer", "required": true},
        "hello": {"type": "string", "required": true, "allowed": ["world"]}
    }));
    let qc = QualityCheck::new("ptid", schema, true, None).unwrap();

    let outcome =
        qc.validate_record(&record(&[("ptid", Value::Int(1)), ("hello", Value::from("world"))]));
    assert!(outcome.passed);
    assert!(outcome.errors.is_empty());

    let outcome =
        qc.validate_record(&record(&[("ptid", Value::Int(2)), ("hello", Value::from("pluto"))]));
    assert!(!outcome.passed);
    assert_eq!(
        outcome.errors.get("hello").unwrap(),
        &vec!["unallowed value pluto".to_string()]
    );
}

// -----------------------------------------------------------------------------
// Scenario: compare_with current_year
// -----------------------------------------------------------------------------

#[test]
fn compare_with_current_year() {
    let schema = schema_from(json!({
        "ptid": {"type": "string", "required": true},
        "birthyr": {
            "type": "integer",
            "compare_with": {
                "comparator": "<=", "base": "current_year", "adjustment": 15, "op": "-"
            }
        }
    }));
    let qc = QualityCheck::new("ptid", schema, true, None).unwrap();
    let this_year = chrono::Local::now().date_naive().year() as i64;

    let outcome =
        qc.validate_record(&record(&[("ptid", Value::from("a")), ("birthyr", Value::Int(1995))]));
    assert!(outcome.passed, "{:?}", outcome.errors);

    let outcome = qc.validate_record(&record(&[
        ("ptid", Value::from("a")),
        ("birthyr", Value::Int(this_year - 4)),
    ]));
    assert!(!outcome.passed);
    assert!(outcome.errors.get("birthyr").unwrap()[0]
        .contains("birthyr <= current_year - 15"));
}

// -----------------------------------------------------------------------------
// Scenario: compatibility if/then
// -----------------------------------------------------------------------------

#[test]
fn compatibility_if_then() {
    let schema = schema_from(json!({
        "ptid": {"type": "string", "required": true},
        "incntmod": {"type": "integer", "required": true},
        "incntmdx": {
            "type": "integer",
            "nullable": true,
            "compatibility": [
                {"if": {"incntmod": {"allowed": [6]}},
                 "then": {"incntmdx": {"nullable": false}}}
            ]
        }
    }));
    let qc = QualityCheck::new("ptid", schema, true, None).unwrap();

    let outcome = qc.validate_record(&record(&[
        ("ptid", Value::from("a")),
        ("incntmod", Value::Int(1)),
        ("incntmdx", Value::Null),
    ]));
    assert!(outcome.passed);

    let outcome = qc.validate_record(&record(&[
        ("ptid", Value::from("a")),
        ("incntmod", Value::Int(6)),
        ("incntmdx", Value::Int(1)),
    ]));
    assert!(outcome.passed);

    let outcome = qc.validate_record(&record(&[
        ("ptid", Value::from("a")),
        ("incntmod", Value::Int(6)),
        ("incntmdx", Value::Null),
    ]));
    assert!(!outcome.passed);
    assert!(outcome.errors.get("incntmdx").unwrap()[0].contains("compatibility rule no: 1"));
}

// -----------------------------------------------------------------------------
// Scenario: logic count
// -----------------------------------------------------------------------------

#[test]
fn logic_count() {
    let schema = schema_from(json!({
        "ptid": {"type": "string", "required": true},
        "a": {"type": "integer"},
        "b": {"type": "integer"},
        "c": {"type": "integer"},
        "total": {
            "type": "integer",
            "logic": {
                "formula": {"==": [
                    {"var": "total"},
                    {"count": [{"var": "a"}, {"var": "b"}, {"var": "c"}]}
                ]}
            }
        }
    }));
    let qc = QualityCheck::new("ptid", schema, true, None).unwrap();

    // two of a/b/c are non-null and non-zero
    let outcome = qc.validate_record(&record(&[
        ("ptid", Value::from("a")),
        ("total", Value::Int(2)),
        ("a", Value::Int(1)),
        ("b", Value::Int(0)),
        ("c", Value::Int(5)),
    ]));
    assert!(outcome.passed, "{:?}", outcome.errors);

    let outcome = qc.validate_record(&record(&[
        ("ptid", Value::from("a")),
        ("total", Value::Int(1)),
        ("a", Value::Int(1)),
        ("b", Value::Int(1)),
        ("c", Value::Int(1)),
    ]));
    assert!(!outcome.passed);
}

// -----------------------------------------------------------------------------
// Scenario: compute_gds with proration
// -----------------------------------------------------------------------------

const GDS_KEYS: [&str; 15] = [
    "satis", "dropact", "empty", "bored", "spirits", "afraid", "happy", "helpless", "stayhome",
    "memprob", "wondrful", "wrthless", "energy", "hopeless", "better",
];

#[test]
fn compute_gds_prorated() {
    let mut fields = serde_json::Map::new();
    fields.insert("ptid".into(), json!({"type": "string", "required": true}));
    fields.insert("nogds".into(), json!({"type": "integer", "nullable": true}));
    for key in GDS_KEYS {
        fields.insert(key.into(), json!({"type": "integer", "nullable": true}));
    }
    fields.insert("gds".into(), json!({"type": "integer", "compute_gds": GDS_KEYS}));
    let schema: RuleSchema = serde_json::from_value(serde_json::Value::Object(fields)).unwrap();
    let qc = QualityCheck::new("ptid", schema, true, None).unwrap();

    // 14 answered with sum 8, one null: round(15 * 8 / 14) = 9 half-up
    let make = |gds: i64| {
        let mut rec = record(&[("ptid", Value::from("p")), ("gds", Value::Int(gds))]);
        let answers = [1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0];
        for (key, answer) in GDS_KEYS.iter().zip(answers) {
            rec.insert(key.to_string(), Value::Int(answer));
        }
        rec.insert("better".to_string(), Value::Null);
        rec
    };

    assert!(qc.validate_record(&make(9)).passed);

    let outcome = qc.validate_record(&make(8));
    assert!(!outcome.passed);
    assert!(outcome.errors.get("gds").unwrap()[0].contains("expected value 9"));
}

// -----------------------------------------------------------------------------
// Quantified invariants
// -----------------------------------------------------------------------------

#[test]
fn invariant_validation_is_deterministic() {
    let qc = QualityCheck::new(
        "ptid",
        schema_from(json!({
            "ptid": {"type": "integer", "required": true},
            "a": {"type": "integer", "min": 0, "max": 10},
            "b": {"type": "string", "allowed": ["x", "y"]}
        })),
        true,
        None,
    )
    .unwrap();

    let rec = record(&[
        ("ptid", Value::Int(1)),
        ("a", Value::Int(99)),
        ("b", Value::from("z")),
    ]);
    let first = qc.validate_record(&rec);
    let second = qc.validate_record(&rec);
    assert_eq!(first.passed, second.passed);
    assert_eq!(first.errors, second.errors);
    // field order follows schema insertion order
    let fields: Vec<&String> = first.errors.keys().collect();
    assert_eq!(fields, vec!["a", "b"]);
}

#[test]
fn invariant_null_tolerance() {
    // a nullable null field only produces errors through null-tolerant rules
    let qc = QualityCheck::new(
        "ptid",
        schema_from(json!({
            "ptid": {"type": "integer", "required": true},
            "x": {
                "type": "integer",
                "nullable": true,
                "min": 5,
                "allowed": [7, 8],
                "regex": "[0-9]+",
                "filled": true
            }
        })),
        true,
        None,
    )
    .unwrap();

    let outcome = qc.validate_record(&record(&[("ptid", Value::Int(1)), ("x", Value::Null)]));
    assert!(!outcome.passed);
    // only the filled rule fires; min/allowed/regex are all skipped
    assert_eq!(
        outcome.errors.get("x").unwrap(),
        &vec!["cannot be empty".to_string()]
    );
}

#[test]
fn invariant_error_tree_faithfulness() {
    let qc = QualityCheck::new(
        "ptid",
        schema_from(json!({
            "ptid": {"type": "integer", "required": true},
            "a": {"type": "integer", "min": 0},
            "b": {"type": "integer", "allowed": [1]},
            "c": {
                "type": "integer",
                "nullable": true,
                "compatibility": [
                    {"if": {"a": {"allowed": [-1]}}, "then": {"c": {"nullable": false}}}
                ]
            }
        })),
        true,
        None,
    )
    .unwrap();

    let outcome = qc.validate_record(&record(&[
        ("ptid", Value::Int(1)),
        ("a", Value::Int(-1)),
        ("b", Value::Int(2)),
        ("c", Value::Null),
    ]));
    assert!(!outcome.passed);
    // every flat error entry has a node in the tree under the same field
    for (field, messages) in &outcome.errors {
        let node = outcome.error_tree.get(field).unwrap_or_else(|| {
            panic!("no tree node for field {field}");
        });
        assert_eq!(node.errors.len(), messages.len());
    }
    // the nested compatibility failure keeps its path in the tree
    let c_node = outcome.error_tree.get("c").unwrap();
    assert!(c_node.children.contains_key("compatibility rule 1"));
}

#[test]
fn invariant_strict_mode_flags_unknown_fields() {
    let schema = schema_from(json!({"ptid": {"type": "integer", "required": true}}));
    let strict = QualityCheck::new("ptid", schema.clone(), true, None).unwrap();
    let lenient = QualityCheck::new("ptid", schema, false, None).unwrap();

    let rec = record(&[("ptid", Value::Int(1)), ("surprise", Value::Int(9))]);
    assert!(!strict.validate_record(&rec).passed);
    assert!(lenient.validate_record(&rec).passed);
}

#[test]
fn anyof_accepts_any_branch() {
    let qc = QualityCheck::new(
        "ptid",
        schema_from(json!({
            "ptid": {"type": "integer", "required": true},
            "x": {
                "type": "integer",
                "anyof": [{"min": 100}, {"allowed": [0, 9]}]
            }
        })),
        true,
        None,
    )
    .unwrap();

    assert!(qc.validate_record(&record(&[("ptid", Value::Int(1)), ("x", Value::Int(150))])).passed);
    assert!(qc.validate_record(&record(&[("ptid", Value::Int(1)), ("x", Value::Int(9))])).passed);
    let outcome = qc.validate_record(&record(&[("ptid", Value::Int(1)), ("x", Value::Int(50))]));
    assert!(!outcome.passed);
    assert_eq!(
        outcome.errors.get("x").unwrap(),
        &vec!["no definitions validate".to_string()]
    );
}

#[test]
fn schema_errors_from_json_text() {
    // unknown rule names fail at load
    assert!(parse_schema_json(r#"{"x": {"type": "integer", "mystery": 1}}"#).is_err());
    // malformed argument shapes fail at load
    assert!(parse_schema_json(r#"{"x": {"compare_with": {"comparator": "~", "base": 1}}}"#)
        .is_err());
}
