//! Longitudinal scenarios: temporal rules and previous-record comparisons
//! backed by the in-memory datastore.

use formqc_engine::{InMemoryDatastore, QualityCheck, Record, RuleSchema, Value};
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

fn visit(pk: &str, num: i64, taxes: Value) -> Record {
    record(&[
        ("ptid", Value::from(pk)),
        ("visit_num", Value::Int(num)),
        ("taxes", taxes),
    ])
}

fn taxes_schema() -> RuleSchema {
    schema_from(json!({
        "ptid": {"type": "string", "required": true},
        "visit_num": {"type": "integer"},
        "taxes": {
            "type": "integer",
            "temporalrules": [
                {"previous": {"taxes": {"allowed": [0]}},
                 "current": {"taxes": {"forbidden": [8]}},
                 "orderby": "visit_num"}
            ]
        }
    }))
}

fn store_with_prior_taxes() -> InMemoryDatastore {
    let mut store = InMemoryDatastore::new("ptid", "visit_num");
    store.add_record(visit("P1", 1, Value::Int(0)));
    store
}

// -----------------------------------------------------------------------------
// temporalrules
// -----------------------------------------------------------------------------

#[test]
fn temporal_rule_passes_and_fails() {
    let qc = QualityCheck::new(
        "ptid",
        taxes_schema(),
        true,
        Some(Box::new(store_with_prior_taxes())),
    )
    .unwrap();

    let outcome = qc.validate_record(&visit("P1", 2, Value::Int(1)));
    assert!(outcome.passed, "{:?}", outcome.errors);

    let outcome = qc.validate_record(&visit("P1", 2, Value::Int(8)));
    assert!(!outcome.passed);
    let message = &outcome.errors.get("taxes").unwrap()[0];
    assert!(message.contains("temporal rule no: 1"), "message: {message}");
    assert!(message.contains("in current visit"), "message: {message}");
    // nested errors keep their path in the tree
    let node = outcome.error_tree.get("taxes").unwrap();
    assert!(node.children.contains_key("temporal rule 1"));
}

#[test]
fn temporal_rule_skipped_when_condition_not_met() {
    // prior taxes is 3, so the previous-visit condition (taxes == 0) fails
    // and the constraint does not apply
    let mut store = InMemoryDatastore::new("ptid", "visit_num");
    store.add_record(visit("P1", 1, Value::Int(3)));
    let qc = QualityCheck::new("ptid", taxes_schema(), true, Some(Box::new(store))).unwrap();

    let outcome = qc.validate_record(&visit("P1", 2, Value::Int(8)));
    assert!(outcome.passed, "{:?}", outcome.errors);
}

#[test]
fn temporal_rule_without_history_passes() {
    // no prior visit: the constraint is conditional on history
    let store = InMemoryDatastore::new("ptid", "visit_num");
    let qc = QualityCheck::new("ptid", taxes_schema(), true, Some(Box::new(store))).unwrap();

    let outcome = qc.validate_record(&visit("P9", 1, Value::Int(8)));
    assert!(outcome.passed, "{:?}", outcome.errors);
}

#[test]
fn temporal_rule_grouped_orderby_form() {
    let schema = schema_from(json!({
        "ptid": {"type": "string", "required": true},
        "visit_num": {"type": "integer"},
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
    let mut store = InMemoryDatastore::new("ptid", "visit_num");
    store.add_record(visit("P1", 1, Value::Int(8)));
    store.add_record(visit("P1", 3, Value::Int(0)));
    let qc = QualityCheck::new("ptid", schema, true, Some(Box::new(store))).unwrap();

    // previous visit for visit 4 is visit 3 (taxes = 0)
    assert!(qc.validate_record(&visit("P1", 4, Value::Int(1))).passed);
    let outcome = qc.validate_record(&visit("P1", 4, Value::Int(8)));
    assert!(!outcome.passed);
    assert!(outcome.errors.get("taxes").unwrap()[0].contains("temporal rule no: 1"));
}

#[test]
fn temporal_rule_swap_order() {
    // swapped: when the current visit says taxes are skipped (8), the
    // previous visit must have reported 0
    let schema = schema_from(json!({
        "ptid": {"type": "string", "required": true},
        "visit_num": {"type": "integer"},
        "taxes": {
            "type": "integer",
            "temporalrules": [
                {"current": {"taxes": {"allowed": [8]}},
                 "previous": {"taxes": {"allowed": [0]}},
                 "swap_order": true,
                 "orderby": "visit_num"}
            ]
        }
    }));

    let mut store = InMemoryDatastore::new("ptid", "visit_num");
    store.add_record(visit("P1", 1, Value::Int(0)));
    let qc = QualityCheck::new("ptid", schema.clone(), true, Some(Box::new(store))).unwrap();
    assert!(qc.validate_record(&visit("P1", 2, Value::Int(8))).passed);

    let mut store = InMemoryDatastore::new("ptid", "visit_num");
    store.add_record(visit("P1", 1, Value::Int(5)));
    let qc = QualityCheck::new("ptid", schema, true, Some(Box::new(store))).unwrap();
    let outcome = qc.validate_record(&visit("P1", 2, Value::Int(8)));
    assert!(!outcome.passed);
    assert!(outcome.errors.get("taxes").unwrap()[0].contains("in previous visit"));
}

#[test]
fn temporal_rule_ignore_empty_skips_without_qualifying_row() {
    let schema = schema_from(json!({
        "ptid": {"type": "string", "required": true},
        "visit_num": {"type": "integer"},
        "taxes": {
            "type": "integer",
            "temporalrules": [
                {"previous": {"taxes": {"allowed": [0]}},
                 "current": {"taxes": {"forbidden": [8]}},
                 "ignore_empty": "taxes",
                 "orderby": "visit_num"}
            ]
        }
    }));
    // only prior visit has a null taxes value, so no row qualifies
    let mut store = InMemoryDatastore::new("ptid", "visit_num");
    store.add_record(visit("P1", 1, Value::Null));
    let qc = QualityCheck::new("ptid", schema, true, Some(Box::new(store))).unwrap();

    let outcome = qc.validate_record(&visit("P1", 2, Value::Int(8)));
    assert!(outcome.passed, "{:?}", outcome.errors);
}

// -----------------------------------------------------------------------------
// compare_with previous_record
// -----------------------------------------------------------------------------

#[test]
fn compare_with_previous_record() {
    let schema = schema_from(json!({
        "ptid": {"type": "string", "required": true},
        "visit_num": {"type": "integer"},
        "visityr": {
            "type": "integer",
            "compare_with": {"comparator": ">=", "base": "visityr", "previous_record": true}
        }
    }));
    let mut store = InMemoryDatastore::new("ptid", "visit_num");
    store.add_record(record(&[
        ("ptid", Value::from("P1")),
        ("visit_num", Value::Int(1)),
        ("visityr", Value::Int(2020)),
    ]));
    let qc = QualityCheck::new("ptid", schema, true, Some(Box::new(store))).unwrap();

    let outcome = qc.validate_record(&record(&[
        ("ptid", Value::from("P1")),
        ("visit_num", Value::Int(2)),
        ("visityr", Value::Int(2022)),
    ]));
    assert!(outcome.passed, "{:?}", outcome.errors);

    let outcome = qc.validate_record(&record(&[
        ("ptid", Value::from("P1")),
        ("visit_num", Value::Int(2)),
        ("visityr", Value::Int(2018)),
    ]));
    assert!(!outcome.passed);
    assert!(outcome.errors.get("visityr").unwrap()[0]
        .contains("visityr >= visityr (previous record)"));
}

#[test]
fn compare_with_previous_record_ignore_empty() {
    let schema = schema_from(json!({
        "ptid": {"type": "string", "required": true},
        "visit_num": {"type": "integer"},
        "visityr": {
            "type": "integer",
            "compare_with": {
                "comparator": ">=", "base": "visityr",
                "previous_record": true, "ignore_empty": true
            }
        }
    }));
    // no prior visit at all: the rule is skipped
    let store = InMemoryDatastore::new("ptid", "visit_num");
    let qc = QualityCheck::new("ptid", schema, true, Some(Box::new(store))).unwrap();
    let outcome = qc.validate_record(&record(&[
        ("ptid", Value::from("P1")),
        ("visit_num", Value::Int(1)),
        ("visityr", Value::Int(2020)),
    ]));
    assert!(outcome.passed, "{:?}", outcome.errors);
}

#[test]
fn compare_with_previous_record_without_history_fails() {
    let schema = schema_from(json!({
        "ptid": {"type": "string", "required": true},
        "visit_num": {"type": "integer"},
        "visityr": {
            "type": "integer",
            "compare_with": {"comparator": ">=", "base": "visityr", "previous_record": true}
        }
    }));
    let store = InMemoryDatastore::new("ptid", "visit_num");
    let qc = QualityCheck::new("ptid", schema, true, Some(Box::new(store))).unwrap();
    let outcome = qc.validate_record(&record(&[
        ("ptid", Value::from("P1")),
        ("visit_num", Value::Int(1)),
        ("visityr", Value::Int(2020)),
    ]));
    assert!(!outcome.passed);
    assert!(outcome.errors.get("visityr").unwrap()[0]
        .contains("failed to retrieve record for previous visit"));
}

// -----------------------------------------------------------------------------
// reference code lookups
// -----------------------------------------------------------------------------

#[test]
fn rxnorm_check() {
    let schema = schema_from(json!({
        "ptid": {"type": "string", "required": true},
        "drug": {"type": "integer", "nullable": true, "check_with": "rxnorm"}
    }));
    let mut store = InMemoryDatastore::new("ptid", "visit_num");
    store.add_rxcui(12345);
    let qc = QualityCheck::new("ptid", schema, true, Some(Box::new(store))).unwrap();

    let passing = [Value::Int(12345), Value::Int(0), Value::Null];
    for value in passing {
        let outcome =
            qc.validate_record(&record(&[("ptid", Value::from("p")), ("drug", value)]));
        assert!(outcome.passed, "{:?}", outcome.errors);
    }

    let outcome =
        qc.validate_record(&record(&[("ptid", Value::from("p")), ("drug", Value::Int(999))]));
    assert!(!outcome.passed);
    assert_eq!(
        outcome.errors.get("drug").unwrap(),
        &vec!["Drug ID 999 is not a valid RXCUI code".to_string()]
    );
}

#[test]
fn adcid_check_via_function_rule() {
    let schema = schema_from(json!({
        "ptid": {"type": "string", "required": true},
        "adcid": {"type": "integer", "function": {"name": "check_adcid"}},
        "other_adcid": {
            "type": "integer",
            "function": {"name": "check_adcid", "args": {"own": false}}
        }
    }));
    let mut store = InMemoryDatastore::new("ptid", "visit_num");
    store.add_adcid(5, true);
    store.add_adcid(7, false);
    let qc = QualityCheck::new("ptid", schema, true, Some(Box::new(store))).unwrap();

    let outcome = qc.validate_record(&record(&[
        ("ptid", Value::from("p")),
        ("adcid", Value::Int(5)),
        ("other_adcid", Value::Int(7)),
    ]));
    assert!(outcome.passed, "{:?}", outcome.errors);

    let outcome = qc.validate_record(&record(&[
        ("ptid", Value::from("p")),
        ("adcid", Value::Int(7)),
        ("other_adcid", Value::Int(9)),
    ]));
    assert!(!outcome.passed);
    assert!(outcome.errors.get("adcid").unwrap()[0].contains("does not match your center"));
    assert!(outcome.errors.get("other_adcid").unwrap()[0].contains("not a valid ADCID"));
}

#[test]
fn rxnorm_without_datastore_is_system_failure() {
    let schema = schema_from(json!({
        "ptid": {"type": "string", "required": true},
        "drug": {"type": "integer", "check_with": "rxnorm"}
    }));
    let qc = QualityCheck::new("ptid", schema, true, None).unwrap();
    let outcome =
        qc.validate_record(&record(&[("ptid", Value::from("p")), ("drug", Value::Int(42))]));
    assert!(outcome.system_failure);
    assert!(!outcome.passed);
}
