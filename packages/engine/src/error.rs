//! Error types for the quality-check engine
//!
//! Three kinds of faults exist, with different propagation:
//! - [`SchemaError`]: the rule file itself is invalid; raised at
//!   construction, the validator is never built.
//! - [`EngineError`]: a system fault hit while validating one record
//!   (datastore raised, unknown operator, division by zero, ...). These
//!   abort the current record and surface as `system_failure`, never as
//!   per-field validation errors.
//! - Validation errors: a field violated a rule. These are data, not
//!   `Err` values; see [`crate::report`].

use crate::datastore::DatastoreError;
use thiserror::Error;

/// System-level fault raised while validating a record.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Formula object is structurally invalid (e.g. multiple operator keys)
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// Formula references an operator the interpreter does not know
    #[error("unrecognized operation {0}")]
    UnknownOperator(String),

    /// `function` rule references a name outside the registry
    #[error("function {0} not defined in the validator")]
    UnknownFunction(String),

    /// Division by zero in a formula
    #[error("division by zero")]
    DivisionByZero,

    /// Type mismatch during formula evaluation
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Maximum formula nesting depth exceeded
    #[error("maximum expression depth exceeded: {0} levels")]
    MaxDepthExceeded(usize),

    /// A rule needs the datastore but none was bound
    #[error("datastore not set, cannot validate {0}")]
    DatastoreNotSet(&'static str),

    /// The host datastore reported a failure
    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    /// Malformed rule detected at evaluation time (slipped past load checks)
    #[error("invalid rule for field '{field}': {reason}")]
    InvalidRule { field: String, reason: String },
}

/// Fault raised when loading or validating a rule schema.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// The schema document failed to parse
    #[error("failed to parse schema: {0}")]
    Parse(String),

    /// The primary-key field is missing or not marked required
    #[error("primary key field '{0}' must be declared in the schema with required: true")]
    MissingPrimaryKey(String),

    /// A rule argument has an invalid shape
    #[error("invalid rule for field '{field}': {reason}")]
    InvalidRule { field: String, reason: String },

    /// IO error reading a schema file
    #[error("failed to read schema file: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
