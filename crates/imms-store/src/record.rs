//! Record documents and the payload callers submit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use imms_core::RecordId;

use crate::error::{Result, StoreError};

/// Submitter-asserted identifier of a vaccination event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalIdentifier {
    /// Identifier namespace (a URI owned by the submitter).
    pub system: String,
    /// Identifier value within the namespace.
    pub value: String,
}

impl ExternalIdentifier {
    /// Creates an identifier.
    #[must_use]
    pub fn new(system: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ExternalIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.system, self.value)
    }
}

/// Lifecycle of a stored record.
///
/// `Reinstated` behaves exactly like `Active` for reads and mutations; it only
/// remembers that the record was deleted once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Live record.
    Active,
    /// Tombstoned record.
    Deleted,
    /// Live record that was deleted and brought back.
    Reinstated,
}

impl LifecycleState {
    /// Returns true if the record is visible to ordinary reads.
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Deleted)
    }
}

/// The caller-supplied part of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPayload {
    /// External identifier, unique among active and deleted records.
    pub external_identifier: ExternalIdentifier,
    /// Key of the vaccinated person.
    pub subject_key: String,
    /// Vaccine category (e.g. `COVID`, `FLU`).
    pub category: String,
    /// The clinical event itself, opaque to the store.
    pub body: serde_json::Value,
}

impl RecordPayload {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.external_identifier.system.trim().is_empty()
            || self.external_identifier.value.trim().is_empty()
        {
            return Err(StoreError::invalid_payload(
                "external identifier system and value are required",
            ));
        }
        if self.subject_key.trim().is_empty() {
            return Err(StoreError::invalid_payload("subject key is required"));
        }
        let category = self.category.trim();
        if category.is_empty() || category.contains('/') {
            return Err(StoreError::invalid_payload(format!(
                "category is not usable: {:?}",
                self.category
            )));
        }
        Ok(())
    }
}

/// A stored vaccination record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Server-assigned identifier.
    pub id: RecordId,
    /// Logical version, 1 on create, +1 per update or reinstate.
    pub version: u64,
    /// Lifecycle state.
    pub lifecycle_state: LifecycleState,
    /// Submitter system that made the last mutation.
    pub submitter_system: String,
    /// The stored payload.
    pub payload: RecordPayload,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last mutated.
    pub updated_at: DateTime<Utc>,
    /// When the record was tombstoned, if it currently is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Returns true if ordinary reads see this record.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.lifecycle_state.is_live()
    }

    /// The record's external identifier.
    #[must_use]
    pub const fn external_identifier(&self) -> &ExternalIdentifier {
        &self.payload.external_identifier
    }

    /// The record's category.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.payload.category
    }
}
