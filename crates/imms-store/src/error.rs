//! Error taxonomy for record store operations.
//!
//! The same taxonomy classifies per-row outcomes in the batch pipeline and maps to
//! status codes at the synchronous request boundary.

use imms_core::RecordId;

use crate::record::ExternalIdentifier;

/// Result type for record store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Record store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The record does not exist (or is deleted and deleted records were not requested).
    #[error("Immunization resource does not exist. ID: {record_id}")]
    NotFound {
        /// The record ID that was looked up.
        record_id: String,
    },

    /// The caller's expected version does not match the stored version.
    #[error(
        "version conflict for record {record_id}: expected version {expected}, stored version {actual}"
    )]
    VersionConflict {
        /// The record being mutated.
        record_id: RecordId,
        /// The version the caller asserted.
        expected: u64,
        /// The version currently stored.
        actual: u64,
    },

    /// The external identifier is already bound to another record.
    #[error("The provided identifier: {identifier} is duplicated")]
    DuplicateIdentifier {
        /// The identifier that is already bound.
        identifier: ExternalIdentifier,
    },

    /// The payload's external identifier differs from the stored one.
    #[error(
        "external identifier {supplied} does not match stored identifier {stored} for record {record_id}"
    )]
    InconsistentIdentifier {
        /// The record being mutated.
        record_id: RecordId,
        /// The identifier on the stored record.
        stored: ExternalIdentifier,
        /// The identifier the caller supplied.
        supplied: ExternalIdentifier,
    },

    /// The submitter may not perform this operation.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Human-readable details.
        message: String,
    },

    /// The payload is structurally unusable (missing identifier, subject or category).
    #[error("invalid payload: {message}")]
    InvalidPayload {
        /// Human-readable details.
        message: String,
    },

    /// The mutation is durable but its change notification was neither published
    /// nor kept for later delivery.
    #[error(
        "record {record_id} was committed but change notification {event_id} could not be recorded: {source}"
    )]
    ChangeNotRecorded {
        /// The committed record.
        record_id: RecordId,
        /// Idempotency key of the lost notification.
        event_id: String,
        /// Why the outbox write failed.
        #[source]
        source: imms_core::Error,
    },

    /// Any other failure, surfaced unclassified and never retried here.
    #[error("unhandled error: {message}")]
    Unhandled {
        /// Human-readable details.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<imms_core::Error>,
    },
}

/// Error classification without payload, used for outcome reporting and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`StoreError::NotFound`].
    NotFound,
    /// See [`StoreError::VersionConflict`].
    VersionConflict,
    /// See [`StoreError::DuplicateIdentifier`].
    DuplicateIdentifier,
    /// See [`StoreError::InconsistentIdentifier`].
    InconsistentIdentifier,
    /// See [`StoreError::Unauthorized`].
    Unauthorized,
    /// See [`StoreError::InvalidPayload`].
    InvalidPayload,
    /// See [`StoreError::Unhandled`].
    Unhandled,
}

impl ErrorKind {
    /// Status code this kind maps to at the synchronous boundary.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::VersionConflict => 409,
            Self::DuplicateIdentifier => 422,
            Self::InconsistentIdentifier | Self::InvalidPayload => 400,
            Self::Unauthorized => 403,
            Self::Unhandled => 500,
        }
    }

    /// Stable lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::VersionConflict => "version_conflict",
            Self::DuplicateIdentifier => "duplicate_identifier",
            Self::InconsistentIdentifier => "inconsistent_identifier",
            Self::Unauthorized => "unauthorized",
            Self::InvalidPayload => "invalid_payload",
            Self::Unhandled => "unhandled",
        }
    }
}

impl StoreError {
    /// Creates a not found error.
    #[must_use]
    pub fn not_found(record_id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            record_id: record_id.to_string(),
        }
    }

    /// Creates an unauthorized error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Creates an invalid payload error.
    #[must_use]
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Creates an unhandled error without a source.
    #[must_use]
    pub fn unhandled(message: impl Into<String>) -> Self {
        Self::Unhandled {
            message: message.into(),
            source: None,
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::DuplicateIdentifier { .. } => ErrorKind::DuplicateIdentifier,
            Self::InconsistentIdentifier { .. } => ErrorKind::InconsistentIdentifier,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::InvalidPayload { .. } => ErrorKind::InvalidPayload,
            Self::ChangeNotRecorded { .. } | Self::Unhandled { .. } => ErrorKind::Unhandled,
        }
    }
}

impl From<imms_core::Error> for StoreError {
    fn from(err: imms_core::Error) -> Self {
        Self::Unhandled {
            message: err.to_string(),
            source: Some(err),
        }
    }
}
