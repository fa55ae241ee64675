//! Error types for `imms-delta`.

/// Result type for change-feed sync.
pub type Result<T> = std::result::Result<T, DeltaError>;

/// Change-feed sync errors.
#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    /// The notification cannot be turned into a delta entry.
    #[error("flatten error for event {event_id}: {message}")]
    Flatten {
        /// The notification's event ID.
        event_id: String,
        /// Human-readable details.
        message: String,
    },

    /// The dead-letter channel refused a notification.
    #[error("dead-letter error for event {event_id}: {message}")]
    DeadLetter {
        /// The notification's event ID.
        event_id: String,
        /// Human-readable details.
        message: String,
    },

    /// A storage operation failed.
    #[error(transparent)]
    Storage(#[from] imms_core::Error),

    /// Failed to serialize/deserialize JSON.
    #[error("serialization error: {message}")]
    Serialization {
        /// Human-readable serialization details.
        message: String,
    },
}

impl DeltaError {
    /// Creates a flatten error.
    #[must_use]
    pub fn flatten(event_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Flatten {
            event_id: event_id.into(),
            message: message.into(),
        }
    }

    pub(crate) fn dead_letter(event_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeadLetter {
            event_id: event_id.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for DeltaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
