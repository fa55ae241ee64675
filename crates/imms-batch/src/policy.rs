//! Collaborator seams: field validation, permissions and submitter lookup.
//!
//! Each seam is a trait with a simple in-process implementation so the pipeline
//! runs end to end without external services.

use std::collections::{BTreeMap, BTreeSet};

use imms_core::PipelineConfig;

use crate::row::{RequestedOperation, VaccinationRow};

/// Field-level validation of a row.
pub trait RowValidator: Send + Sync {
    /// Returns every problem found; empty means valid.
    fn validate(&self, row: &VaccinationRow, operation: RequestedOperation) -> Vec<String>;
}

/// Checks that the fields each operation depends on are present.
#[derive(Debug, Default, Clone, Copy)]
pub struct MandatoryFieldValidator;

impl MandatoryFieldValidator {
    fn required(operation: RequestedOperation) -> &'static [&'static str] {
        match operation {
            RequestedOperation::Create | RequestedOperation::Update => &[
                "NHS_NUMBER",
                "PERSON_DOB",
                "DATE_AND_TIME",
                "SITE_CODE",
                "UNIQUE_ID",
                "UNIQUE_ID_URI",
                "VACCINATION_PROCEDURE_CODE",
            ],
            RequestedOperation::Delete => &["UNIQUE_ID", "UNIQUE_ID_URI"],
            RequestedOperation::Unknown => &[],
        }
    }
}

impl RowValidator for MandatoryFieldValidator {
    fn validate(&self, row: &VaccinationRow, operation: RequestedOperation) -> Vec<String> {
        let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(row) else {
            return vec!["row could not be inspected".to_string()];
        };
        let mut problems: Vec<String> = Self::required(operation)
            .iter()
            .filter(|name| {
                fields
                    .get(**name)
                    .and_then(serde_json::Value::as_str)
                    .map_or(true, |v| v.trim().is_empty())
            })
            .map(|name| format!("{name} is a mandatory field"))
            .collect();

        if !row.expected_version.trim().is_empty()
            && row.expected_version.trim().parse::<u64>().is_err()
        {
            problems.push("EXPECTED_VERSION must be a whole number".to_string());
        }
        problems
    }
}

/// Authorization decisions for submitters.
pub trait PermissionPolicy: Send + Sync {
    /// Returns true if `submitter` may perform `operation` on `category`.
    fn is_permitted(&self, submitter: &str, category: &str, operation: RequestedOperation) -> bool;

    /// Returns true if `submitter` holds any permission on `category`.
    fn can_submit(&self, submitter: &str, category: &str) -> bool;
}

/// Grants parsed from `CATEGORY.LETTERS` strings such as `COVID.CRUD` or `FLU.CD`.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissionPolicy {
    grants: BTreeMap<String, BTreeMap<String, BTreeSet<char>>>,
}

impl StaticPermissionPolicy {
    /// Creates a policy with no grants.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a grant such as `COVID.CRUD` for `submitter`. Malformed grants are
    /// ignored with a warning.
    #[must_use]
    pub fn with_grant(mut self, submitter: &str, grant: &str) -> Self {
        let Some((category, letters)) = grant.split_once('.') else {
            tracing::warn!(submitter, grant, "ignoring malformed permission grant");
            return self;
        };
        self.grants
            .entry(submitter.to_ascii_uppercase())
            .or_default()
            .entry(category.trim().to_ascii_uppercase())
            .or_default()
            .extend(letters.trim().to_ascii_uppercase().chars());
        self
    }

    fn letters(&self, submitter: &str, category: &str) -> Option<&BTreeSet<char>> {
        self.grants
            .get(&submitter.to_ascii_uppercase())?
            .get(&category.to_ascii_uppercase())
    }
}

impl PermissionPolicy for StaticPermissionPolicy {
    fn is_permitted(&self, submitter: &str, category: &str, operation: RequestedOperation) -> bool {
        let Some(letter) = operation.permission_letter() else {
            return false;
        };
        self.letters(submitter, category)
            .is_some_and(|letters| letters.contains(&letter))
    }

    fn can_submit(&self, submitter: &str, category: &str) -> bool {
        self.letters(submitter, category)
            .is_some_and(|letters| !letters.is_empty())
    }
}

/// Maps file-name submitter codes to submitter systems.
pub trait SubmitterDirectory: Send + Sync {
    /// Returns the submitter system for an (uppercase) code.
    fn submitter_for_code(&self, code: &str) -> Option<String>;
}

/// Directory backed by a fixed map.
#[derive(Debug, Clone, Default)]
pub struct StaticSubmitterDirectory {
    codes: BTreeMap<String, String>,
}

impl StaticSubmitterDirectory {
    /// Uses the codes configured in `IMMS_SUBMITTER_CODES`.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            codes: config.submitter_codes.clone(),
        }
    }

    /// Adds a code.
    #[must_use]
    pub fn with_code(mut self, code: &str, submitter: &str) -> Self {
        self.codes
            .insert(code.to_ascii_uppercase(), submitter.to_string());
        self
    }
}

impl SubmitterDirectory for StaticSubmitterDirectory {
    fn submitter_for_code(&self, code: &str) -> Option<String> {
        self.codes.get(&code.to_ascii_uppercase()).cloned()
    }
}
