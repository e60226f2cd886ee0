//! Top-level driver for record quality checks
//!
//! [`QualityCheck`] owns the parsed schema, validates it once at
//! construction, and exposes the per-record entry point. Each call casts
//! the record, gates on the primary key, runs the evaluator and packages
//! the pass/fail flags, flat errors, error tree and computed-scores side
//! table into a [`ValidationOutcome`].

use crate::datastore::Datastore;
use crate::error::SchemaError;
use crate::report::ErrorTree;
use crate::schema::{validate_schema, RuleSchema};
use crate::types::Record;
use crate::validator::{RecordValidator, ValidatorOptions};
use indexmap::IndexMap;
use serde::Serialize;

/// Everything one `validate_record` call produces.
#[derive(Debug, Serialize)]
pub struct ValidationOutcome {
    /// True when the record satisfied every rule
    pub passed: bool,
    /// True when a system fault aborted validation; per-field errors then
    /// carry the system messages instead of validation findings
    pub system_failure: bool,
    /// Formatted error messages by field
    pub errors: IndexMap<String, Vec<String>>,
    /// Structured errors mirroring the schema path
    pub error_tree: ErrorTree,
    /// Scores computed by `score_variables` rules
    pub computed_scores: Record,
}

/// Validator service bound to one schema and primary-key field.
pub struct QualityCheck {
    pk_field: String,
    schema: RuleSchema,
    options: ValidatorOptions,
    datastore: Option<Box<dyn Datastore>>,
}

impl QualityCheck {
    /// Build a quality check. The schema is validated here; a malformed
    /// schema means the checker is never constructed.
    ///
    /// # Arguments
    /// * `pk_field` - Primary key field of the project
    /// * `schema` - Parsed validation rules
    /// * `strict` - When false, record fields unknown to the schema are
    ///   skipped instead of reported
    /// * `datastore` - Host datastore for longitudinal and code lookups
    pub fn new(
        pk_field: impl Into<String>,
        schema: RuleSchema,
        strict: bool,
        datastore: Option<Box<dyn Datastore>>,
    ) -> Result<Self, SchemaError> {
        let options = ValidatorOptions {
            strict,
            ..ValidatorOptions::default()
        };
        Self::with_options(pk_field, schema, options, datastore)
    }

    /// Build a quality check with explicit evaluation options.
    pub fn with_options(
        pk_field: impl Into<String>,
        schema: RuleSchema,
        options: ValidatorOptions,
        datastore: Option<Box<dyn Datastore>>,
    ) -> Result<Self, SchemaError> {
        let pk_field = pk_field.into();
        validate_schema(&schema, &pk_field)?;
        Ok(Self {
            pk_field,
            schema,
            options,
            datastore,
        })
    }

    pub fn pk_field(&self) -> &str {
        &self.pk_field
    }

    pub fn schema(&self) -> &RuleSchema {
        &self.schema
    }

    /// Evaluate one record against the schema.
    ///
    /// The record is cast first (empty strings to null, string values to
    /// their declared types, missing schema fields filled with null), then
    /// the primary key is checked, then every field-rule pair runs. System
    /// faults abort the record and surface as `system_failure`.
    pub fn validate_record(&self, record: &Record) -> ValidationOutcome {
        let mut validator =
            RecordValidator::new(&self.schema, self.pk_field.as_str(), self.options);
        if let Some(datastore) = &self.datastore {
            validator.set_datastore(datastore.as_ref());
        }

        let cast = validator.cast_record(record.clone());

        match cast.get(&self.pk_field) {
            Some(value) if !value.is_null() => {}
            _ => {
                let message = format!(
                    "primary key variable {} not set in current visit data",
                    self.pk_field
                );
                let mut errors = IndexMap::new();
                errors.insert(self.pk_field.clone(), vec![message]);
                return ValidationOutcome {
                    passed: false,
                    system_failure: true,
                    errors,
                    error_tree: ErrorTree::new(),
                    computed_scores: Record::new(),
                };
            }
        }

        match validator.validate(&cast) {
            Ok(passed) => ValidationOutcome {
                passed,
                system_failure: false,
                errors: validator.flat_errors(),
                error_tree: validator.take_error_tree(),
                computed_scores: validator.take_computed_scores(),
            },
            Err(e) => {
                tracing::warn!(error = %e, "system failure while validating record");
                let mut errors = validator.sys_errors().clone();
                if errors.is_empty() {
                    errors.insert(self.pk_field.clone(), vec![e.to_string()]);
                }
                ValidationOutcome {
                    passed: false,
                    system_failure: true,
                    errors,
                    error_tree: ErrorTree::new(),
                    computed_scores: Record::new(),
                }
            }
        }
    }
}

impl std::fmt::Debug for QualityCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityCheck")
            .field("pk_field", &self.pk_field)
            .field("fields", &self.schema.len())
            .field("has_datastore", &self.datastore.is_some())
            .finish()
    }
}
