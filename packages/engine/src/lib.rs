//! FormQC Engine
//!
//! A rule evaluation engine for longitudinal clinical-research form
//! records. This library provides functionality for:
//! - Loading declarative quality-check schemas (JSON or YAML)
//! - Evaluating records against per-field rules, from simple type and
//!   range checks to cross-field conditionals and temporal rules over
//!   prior visits
//! - Interpreting embedded JSON-logic validation formulas
//!
//! # Example
//!
//! ```ignore
//! use formqc_engine::{parse_schema_json, QualityCheck, Record, Value};
//!
//! let schema = parse_schema_json(r#"{
//!     "ptid": {"type": "string", "required": true},
//!     "hello": {"type": "string", "required": true, "allowed": ["world"]}
//! }"#)?;
//! let qc = QualityCheck::new("ptid", schema, true, None)?;
//!
//! let mut record = Record::new();
//! record.insert("ptid".to_string(), Value::from("P001"));
//! record.insert("hello".to_string(), Value::from("world"));
//!
//! let outcome = qc.validate_record(&record);
//! assert!(outcome.passed);
//! ```

pub mod config;
pub mod datastore;
pub mod error;
pub mod logic;
pub mod quality_check;
pub mod report;
pub mod schema;
pub mod types;
pub mod validator;

// Re-export commonly used items
pub use datastore::{Datastore, DatastoreError, DatastoreResult, InMemoryDatastore};
pub use error::{EngineError, Result, SchemaError};
pub use logic::{evaluate, Expr};
pub use quality_check::{QualityCheck, ValidationOutcome};
pub use report::{ErrorNode, ErrorTree, ValidationError};
pub use schema::{
    load_schema, parse_schema_json, parse_schema_yaml, validate_schema, FieldSchema, RuleSchema,
};
pub use types::{compare_values, soft_equals, Comparator, Record, Value};
pub use validator::{GdsRounding, RecordValidator, ValidatorOptions};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
