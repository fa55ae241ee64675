//! Error types for bulk ingestion.
//!
//! Row-level problems never surface here: they become row outcomes. A
//! [`BatchError`] means the pipeline step itself failed and should be retried by
//! redelivery.

use imms_core::MessageId;

/// The result type used throughout imms-batch.
pub type Result<T> = std::result::Result<T, BatchError>;

/// Errors that can occur while ingesting a bulk file.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// The file name does not follow the bulk file naming convention.
    #[error("invalid file key {file_key:?}: {reason}")]
    InvalidFileKey {
        /// The rejected file key.
        file_key: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The header row does not match the expected column layout.
    #[error("invalid header row: {message}")]
    InvalidHeader {
        /// Description of the mismatch.
        message: String,
    },

    /// No ledger entry exists for the message.
    #[error("no ledger entry for message {message_id}")]
    LedgerEntryNotFound {
        /// The unknown message ID.
        message_id: MessageId,
    },

    /// A ledger entry was asked to leave a terminal status.
    #[error("invalid status transition for message {message_id}: {from} -> {to}")]
    InvalidTransition {
        /// The entry being transitioned.
        message_id: MessageId,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A read-modify-write loop on a shared document ran out of attempts.
    #[error("concurrent modification of {path} after {attempts} attempts")]
    ConcurrentModification {
        /// Scope-relative path of the contended document.
        path: String,
        /// Attempts made.
        attempts: u32,
    },

    /// Handing a queued file to the next stage failed.
    #[error("failed to trigger message {message_id}: {message}")]
    TriggerFailed {
        /// The file that could not be triggered.
        message_id: MessageId,
        /// Description of the failure.
        message: String,
    },

    /// The in-memory row log failed.
    #[error("row log error: {message}")]
    Log {
        /// Description of the failure.
        message: String,
    },

    /// Shared infrastructure (storage, serialization) failed.
    #[error(transparent)]
    Core(#[from] imms_core::Error),
}

impl BatchError {
    /// Creates an invalid file key error.
    #[must_use]
    pub fn invalid_file_key(file_key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFileKey {
            file_key: file_key.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid header error.
    #[must_use]
    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::InvalidHeader {
            message: message.into(),
        }
    }

    /// Creates a row log error.
    #[must_use]
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Core(err.into())
    }
}
