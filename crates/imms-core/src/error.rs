//! Error types and result aliases shared across the pipeline.
//!
//! Component crates wrap [`Error`] in their own taxonomies; this enum only covers
//! failures of the shared infrastructure (storage, serialization, configuration).

/// The result type used throughout the shared infrastructure.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by storage, configuration and serialization primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A record ID, message ID or environment name could not be parsed.
    #[error("invalid identifier: {message}")]
    InvalidIdentifier {
        /// What was wrong with it.
        message: String,
    },

    /// The backend failed to read, write, list or delete an object.
    #[error("storage error: {message}")]
    Storage {
        /// Backend-specific details.
        message: String,
    },

    /// A stored document did not match its expected shape.
    #[error("serialization error: {message}")]
    Serialization {
        /// Decoder message.
        message: String,
    },

    /// No object exists at the path.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path, segment or configuration value was rejected.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The backend's internal state is unusable (poisoned lock).
    #[error("internal error: {message}")]
    Internal {
        /// Details.
        message: String,
    },
}

impl Error {
    /// Storage failure with a message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Serialization failure from any displayable cause.
    #[must_use]
    pub fn serialization(message: impl std::fmt::Display) -> Self {
        Self::Serialization {
            message: message.to_string(),
        }
    }

    /// Returns true if this error means the object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
