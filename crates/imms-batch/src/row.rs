//! Bulk file rows and the events emitted for them.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use imms_core::delimited::split_line;
use imms_core::{MessageId, RecordId};
use imms_store::{ErrorKind, ExternalIdentifier, RecordPayload};

use crate::error::{BatchError, Result};
use crate::file_key::file_stem;

/// Columns every bulk file carries, in their published order.
pub const EXPECTED_HEADERS: [&str; 34] = [
    "NHS_NUMBER",
    "PERSON_FORENAME",
    "PERSON_SURNAME",
    "PERSON_DOB",
    "PERSON_GENDER_CODE",
    "PERSON_POSTCODE",
    "DATE_AND_TIME",
    "SITE_CODE",
    "SITE_CODE_TYPE_URI",
    "UNIQUE_ID",
    "UNIQUE_ID_URI",
    "ACTION_FLAG",
    "PERFORMING_PROFESSIONAL_FORENAME",
    "PERFORMING_PROFESSIONAL_SURNAME",
    "RECORDED_DATE",
    "PRIMARY_SOURCE",
    "VACCINATION_PROCEDURE_CODE",
    "VACCINATION_PROCEDURE_TERM",
    "DOSE_SEQUENCE",
    "VACCINE_PRODUCT_CODE",
    "VACCINE_PRODUCT_TERM",
    "VACCINE_MANUFACTURER",
    "BATCH_NUMBER",
    "EXPIRY_DATE",
    "SITE_OF_VACCINATION_CODE",
    "SITE_OF_VACCINATION_TERM",
    "ROUTE_OF_VACCINATION_CODE",
    "ROUTE_OF_VACCINATION_TERM",
    "DOSE_AMOUNT",
    "DOSE_UNIT_CODE",
    "DOSE_UNIT_TERM",
    "INDICATION_CODE",
    "LOCATION_CODE",
    "LOCATION_CODE_TYPE_URI",
];

/// Columns a file may add after the expected ones.
pub const OPTIONAL_HEADERS: [&str; 2] = ["RECORD_ID", "EXPECTED_VERSION"];

/// Checks a header line and returns its column names.
///
/// Every expected column must appear exactly once; the only other columns allowed
/// are [`OPTIONAL_HEADERS`].
///
/// # Errors
///
/// Returns [`BatchError::InvalidHeader`] naming the first problem.
pub fn validate_header(line: &str) -> Result<Vec<String>> {
    let columns: Vec<String> = split_line(line)
        .into_iter()
        .map(|c| c.trim_start_matches('\u{feff}').to_ascii_uppercase())
        .collect();

    let mut seen = BTreeSet::new();
    for column in &columns {
        if !EXPECTED_HEADERS.contains(&column.as_str()) && !OPTIONAL_HEADERS.contains(&column.as_str())
        {
            return Err(BatchError::invalid_header(format!("unexpected column {column}")));
        }
        if !seen.insert(column.as_str()) {
            return Err(BatchError::invalid_header(format!("duplicate column {column}")));
        }
    }
    if let Some(missing) = EXPECTED_HEADERS.iter().find(|h| !seen.contains(*h)) {
        return Err(BatchError::invalid_header(format!("missing column {missing}")));
    }
    Ok(columns)
}

/// Operation a row asks for, from its `ACTION_FLAG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestedOperation {
    /// `NEW`
    Create,
    /// `UPDATE`
    Update,
    /// `DELETE`
    Delete,
    /// Anything else.
    Unknown,
}

impl RequestedOperation {
    /// Parses an `ACTION_FLAG` value, case-insensitively.
    #[must_use]
    pub fn from_action_flag(flag: &str) -> Self {
        match flag.trim().to_ascii_uppercase().as_str() {
            "NEW" => Self::Create,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Unknown,
        }
    }

    /// Permission letter needed for this operation (`C`, `U` or `D`).
    #[must_use]
    pub const fn permission_letter(self) -> Option<char> {
        match self {
            Self::Create => Some('C'),
            Self::Update => Some('U'),
            Self::Delete => Some('D'),
            Self::Unknown => None,
        }
    }
}

/// One data row, keyed by the published column names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
#[allow(missing_docs)]
pub struct VaccinationRow {
    pub nhs_number: String,
    pub person_forename: String,
    pub person_surname: String,
    pub person_dob: String,
    pub person_gender_code: String,
    pub person_postcode: String,
    pub date_and_time: String,
    pub site_code: String,
    pub site_code_type_uri: String,
    pub unique_id: String,
    pub unique_id_uri: String,
    pub action_flag: String,
    pub performing_professional_forename: String,
    pub performing_professional_surname: String,
    pub recorded_date: String,
    pub primary_source: String,
    pub vaccination_procedure_code: String,
    pub vaccination_procedure_term: String,
    pub dose_sequence: String,
    pub vaccine_product_code: String,
    pub vaccine_product_term: String,
    pub vaccine_manufacturer: String,
    pub batch_number: String,
    pub expiry_date: String,
    pub site_of_vaccination_code: String,
    pub site_of_vaccination_term: String,
    pub route_of_vaccination_code: String,
    pub route_of_vaccination_term: String,
    pub dose_amount: String,
    pub dose_unit_code: String,
    pub dose_unit_term: String,
    pub indication_code: String,
    pub location_code: String,
    pub location_code_type_uri: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub record_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub expected_version: String,
}

impl VaccinationRow {
    /// Builds a row from a data line split against `headers`.
    ///
    /// # Errors
    ///
    /// Returns a message if the field count does not match the header.
    pub fn from_line(headers: &[String], line: &str) -> std::result::Result<Self, String> {
        let fields = split_line(line);
        if fields.len() != headers.len() {
            return Err(format!(
                "row has {} fields but the header has {}",
                fields.len(),
                headers.len()
            ));
        }
        let map: serde_json::Map<String, serde_json::Value> = headers
            .iter()
            .cloned()
            .zip(fields.into_iter().map(serde_json::Value::String))
            .collect();
        serde_json::from_value(serde_json::Value::Object(map)).map_err(|e| e.to_string())
    }

    /// Requested operation from `ACTION_FLAG`.
    #[must_use]
    pub fn operation(&self) -> RequestedOperation {
        RequestedOperation::from_action_flag(&self.action_flag)
    }

    /// `{UNIQUE_ID}^{UNIQUE_ID_URI}`, the submitter's reference echoed in acks.
    #[must_use]
    pub fn local_id(&self) -> String {
        format!("{}^{}", self.unique_id, self.unique_id_uri)
    }

    /// Converts the row into a store payload for `category`.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be encoded.
    pub fn to_payload(&self, category: &str) -> Result<RecordPayload> {
        Ok(RecordPayload {
            external_identifier: ExternalIdentifier::new(
                self.unique_id_uri.trim(),
                self.unique_id.trim(),
            ),
            subject_key: self.nhs_number.trim().to_string(),
            category: category.to_ascii_uppercase(),
            body: serde_json::to_value(self)?,
        })
    }
}

/// Where a row's acknowledgment goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckTarget {
    /// Arrival the row belongs to.
    pub message_id: MessageId,
    /// Source file name.
    pub file_key: String,
    /// Arrival time in acknowledgment format.
    pub created_at_formatted: String,
}

impl AckTarget {
    /// Business acknowledgment name: `{stem}_BusAck_{created_at}.csv`.
    #[must_use]
    pub fn bus_ack_name(&self) -> String {
        format!(
            "{}_BusAck_{}.csv",
            file_stem(&self.file_key),
            self.created_at_formatted
        )
    }

    /// File-level acknowledgment name: `{stem}_InfAck_{created_at}.csv`.
    #[must_use]
    pub fn inf_ack_name(&self) -> String {
        format!(
            "{}_InfAck_{}.csv",
            file_stem(&self.file_key),
            self.created_at_formatted
        )
    }
}

/// `{message_id}^{ordinal}`, ordinal 1-based in file order.
#[must_use]
pub fn row_id(message_id: MessageId, ordinal: u64) -> String {
    format!("{message_id}^{ordinal}")
}

/// Ordinal part of a row ID.
#[must_use]
pub fn row_ordinal(row_id: &str) -> Option<u64> {
    row_id.rsplit_once('^').and_then(|(_, n)| n.parse().ok())
}

/// What the forwarder should do with a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowInstruction {
    /// Apply the requested operation to the record store.
    Apply {
        /// Record payload built from the row.
        payload: RecordPayload,
        /// Record ID supplied by the submitter, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record_id: Option<RecordId>,
        /// Version the submitter expects, if supplied.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_version: Option<u64>,
    },
    /// The row failed before reaching the store.
    Reject {
        /// Classification for the outcome.
        error: ErrorKind,
        /// Human-readable details.
        diagnostics: String,
    },
}

/// One row, ready for the forwarder. Emitted in file order per submitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowEvent {
    /// `{message_id}^{ordinal}`.
    pub row_id: String,
    /// Acknowledgment destination.
    pub target: AckTarget,
    /// Submitter system.
    pub submitter: String,
    /// Uppercase vaccine category.
    pub category: String,
    /// Requested operation.
    pub operation: RequestedOperation,
    /// `{UNIQUE_ID}^{UNIQUE_ID_URI}`.
    pub local_id: String,
    /// What to do.
    pub instruction: RowInstruction,
}

/// Result of forwarding one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OutcomeResult {
    /// The store accepted the mutation.
    Success {
        /// The affected record.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record_id: Option<RecordId>,
    },
    /// The row failed.
    Failure {
        /// Classification.
        error: ErrorKind,
        /// Human-readable details.
        diagnostics: String,
        /// The record involved, if one was resolved.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record_id: Option<RecordId>,
    },
}

/// Per-row outcome, the input of the acknowledgment accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowOutcome {
    /// `{message_id}^{ordinal}`.
    pub row_id: String,
    /// Acknowledgment destination.
    pub target: AckTarget,
    /// `{UNIQUE_ID}^{UNIQUE_ID_URI}`.
    pub local_id: String,
    /// What happened.
    pub result: OutcomeResult,
}

impl RowOutcome {
    /// Returns true for successful rows.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.result, OutcomeResult::Success { .. })
    }
}
