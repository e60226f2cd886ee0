//! Datastore contract for longitudinal lookups
//!
//! Temporal rules compare the record under validation against the
//! participant's previous visit. The engine does not own that history; the
//! host supplies it through the [`Datastore`] trait, together with the
//! reference-code lookups (RXCUI drug codes, center ADCIDs).
//!
//! [`InMemoryDatastore`] is the reference implementation used by the test
//! suite and the CLI; production hosts back the trait with their own
//! warehouse.

use crate::types::{order_values, Record, Value};
use indexmap::IndexMap;
use std::cmp::Ordering;
use std::collections::HashSet;
use thiserror::Error;

/// Failure reported by a host datastore. The engine converts these into
/// system errors: validation of the current record halts.
#[derive(Error, Debug)]
#[error("datastore error: {0}")]
pub struct DatastoreError(String);

impl DatastoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result type alias for datastore operations
pub type DatastoreResult<T> = std::result::Result<T, DatastoreError>;

/// Host-supplied store of prior visit records and reference codes.
pub trait Datastore {
    /// Return the most recent prior record for the participant identified by
    /// `current`, or `None` if there is no earlier visit.
    ///
    /// # Arguments
    /// * `order_by` - Field that orders visits (the engine passes the
    ///   per-constraint `orderby` when the rule declares one, else the
    ///   primary-key field name)
    /// * `current` - Record currently being validated
    /// * `ignore_empty_fields` - When given, only records where all of these
    ///   fields are non-null qualify
    fn get_previous_record(
        &self,
        order_by: &str,
        current: &Record,
        ignore_empty_fields: Option<&[String]>,
    ) -> DatastoreResult<Option<Record>>;

    /// Check whether a drug code is a valid RXCUI.
    fn is_valid_rxcui(&self, code: i64) -> DatastoreResult<bool>;

    /// Check whether a center identifier is valid. `own` selects between
    /// "must match the submitting center" and "must be any known center".
    ///
    /// Optional; the default rejects the lookup so that schemas using the
    /// rule against a host without ADCID data fail loudly.
    fn is_valid_adcid(&self, adcid: i64, own: bool) -> DatastoreResult<bool> {
        let _ = (adcid, own);
        Err(DatastoreError::new("ADCID validation not supported"))
    }
}

/// In-memory datastore holding visit history per participant.
///
/// Records are grouped by the value of the primary-key field and ordered on
/// demand by an order-by field. Intended for tests and the CSV driver.
#[derive(Debug, Default)]
pub struct InMemoryDatastore {
    pk_field: String,
    /// Visit order fallback, used when the engine passes the primary key
    /// itself as `order_by` (the primary key cannot order one participant's
    /// visits).
    order_field: String,
    records: IndexMap<String, Vec<Record>>,
    valid_rxcuis: HashSet<i64>,
    valid_adcids: HashSet<i64>,
    own_adcid: Option<i64>,
}

impl InMemoryDatastore {
    /// Create an empty datastore.
    ///
    /// # Arguments
    /// * `pk_field` - Field identifying the participant across visits
    /// * `order_field` - Field ordering visits within a participant
    pub fn new(pk_field: impl Into<String>, order_field: impl Into<String>) -> Self {
        Self {
            pk_field: pk_field.into(),
            order_field: order_field.into(),
            ..Self::default()
        }
    }

    /// Add a historical visit record.
    pub fn add_record(&mut self, record: Record) {
        let key = record
            .get(&self.pk_field)
            .map(|v| v.to_string())
            .unwrap_or_default();
        self.records.entry(key).or_default().push(record);
    }

    /// Register a valid RXCUI drug code.
    pub fn add_rxcui(&mut self, code: i64) {
        self.valid_rxcuis.insert(code);
    }

    /// Register a valid center identifier; optionally mark it as the
    /// submitting center's own.
    pub fn add_adcid(&mut self, adcid: i64, own: bool) {
        self.valid_adcids.insert(adcid);
        if own {
            self.own_adcid = Some(adcid);
        }
    }

    /// Number of stored history records across all participants.
    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    fn field_is_empty(record: &Record, field: &str) -> bool {
        record.get(field).map(Value::is_null).unwrap_or(true)
    }
}

impl Datastore for InMemoryDatastore {
    fn get_previous_record(
        &self,
        order_by: &str,
        current: &Record,
        ignore_empty_fields: Option<&[String]>,
    ) -> DatastoreResult<Option<Record>> {
        let order_by = if order_by == self.pk_field {
            &self.order_field
        } else {
            order_by
        };

        let key = match current.get(&self.pk_field) {
            Some(v) if !v.is_null() => v.to_string(),
            _ => return Ok(None),
        };
        let Some(history) = self.records.get(&key) else {
            return Ok(None);
        };
        let Some(current_order) = current.get(order_by) else {
            return Ok(None);
        };

        let mut best: Option<&Record> = None;
        for record in history {
            let Some(order_val) = record.get(order_by) else {
                continue;
            };
            if order_values(order_val, current_order) != Some(Ordering::Less) {
                continue;
            }
            if let Some(fields) = ignore_empty_fields {
                if fields.iter().any(|f| Self::field_is_empty(record, f)) {
                    continue;
                }
            }
            best = match best {
                Some(prev)
                    if order_values(
                        prev.get(order_by).unwrap_or(&Value::Null),
                        order_val,
                    ) != Some(Ordering::Less) =>
                {
                    Some(prev)
                }
                _ => Some(record),
            };
        }

        Ok(best.cloned())
    }

    fn is_valid_rxcui(&self, code: i64) -> DatastoreResult<bool> {
        Ok(self.valid_rxcuis.contains(&code))
    }

    fn is_valid_adcid(&self, adcid: i64, own: bool) -> DatastoreResult<bool> {
        if own {
            Ok(self.own_adcid == Some(adcid))
        } else {
            Ok(self.valid_adcids.contains(&adcid))
        }
    }
}
