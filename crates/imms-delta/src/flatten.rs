//! Record flattening for delta entries.

use serde_json::{Map, Value};

use imms_store::{ChangeOperation, Record};

use crate::error::{DeltaError, Result};
use crate::types::action_flag;

/// A flattened record: one string per field plus any conversion problems.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatRecord {
    /// Flat fields keyed by column name.
    pub fields: Map<String, Value>,
    /// Fields that could not be converted.
    pub conversion_errors: Vec<String>,
}

impl FlatRecord {
    /// Renders the record as a JSON object with a `CONVERSION_ERRORS` column.
    #[must_use]
    pub fn into_value(self) -> Value {
        let mut fields = self.fields;
        fields.insert(
            "CONVERSION_ERRORS".to_string(),
            Value::Array(self.conversion_errors.into_iter().map(Value::String).collect()),
        );
        Value::Object(fields)
    }
}

/// Derives the flat representation of a record for downstream consumers.
pub trait RecordFlattener: Send + Sync {
    /// Flattens `record` as committed by `operation`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be flattened at all. Problems with
    /// individual fields belong in [`FlatRecord::conversion_errors`].
    fn flatten(&self, record: &Record, operation: ChangeOperation) -> Result<FlatRecord>;
}

/// Copies the top-level scalar fields of the record body and adds the record's
/// identity columns.
#[derive(Debug, Default, Clone, Copy)]
pub struct ColumnFlattener;

impl RecordFlattener for ColumnFlattener {
    fn flatten(&self, record: &Record, operation: ChangeOperation) -> Result<FlatRecord> {
        let Value::Object(body) = &record.payload.body else {
            return Err(DeltaError::flatten(
                record.id.to_string(),
                "record body is not an object",
            ));
        };

        let mut flat = FlatRecord::default();
        for (name, value) in body {
            let column = name.to_ascii_uppercase();
            match value {
                Value::String(s) => {
                    flat.fields.insert(column, Value::String(s.clone()));
                }
                Value::Number(n) => {
                    flat.fields.insert(column, Value::String(n.to_string()));
                }
                Value::Bool(b) => {
                    flat.fields.insert(column, Value::String(b.to_string()));
                }
                Value::Null => {
                    flat.fields.insert(column, Value::String(String::new()));
                }
                Value::Array(_) | Value::Object(_) => {
                    flat.conversion_errors
                        .push(format!("{column}: nested values are not supported"));
                }
            }
        }

        let identity = [
            ("IMMS_ID", record.id.to_string()),
            ("VERSION", record.version.to_string()),
            ("UNIQUE_ID", record.payload.external_identifier.value.clone()),
            ("UNIQUE_ID_URI", record.payload.external_identifier.system.clone()),
            ("VACCINE_TYPE", record.payload.category.clone()),
            ("ACTION_FLAG", action_flag(operation).to_string()),
        ];
        for (column, value) in identity {
            flat.fields.insert(column.to_string(), Value::String(value));
        }
        Ok(flat)
    }
}
