//! Delta entries and sync results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use imms_core::RecordId;
use imms_store::{ChangeNotification, ChangeOperation};

/// Downstream operation name. Creates are reported as `NEW`, matching the bulk
/// file `ACTION_FLAG` vocabulary.
#[must_use]
pub const fn action_flag(operation: ChangeOperation) -> &'static str {
    match operation {
        ChangeOperation::Create => "NEW",
        ChangeOperation::Update => "UPDATE",
        ChangeOperation::Delete => "DELETE",
    }
}

/// One immutable delta entry, keyed by the notification's event ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaEntry {
    /// Idempotency key of the originating commit.
    pub event_id: String,
    /// Mutated record.
    pub record_id: RecordId,
    /// Source label (`IMMS_DELTA_SOURCE`).
    pub source: String,
    /// `NEW`, `UPDATE` or `DELETE`.
    pub operation: String,
    /// Vaccine category.
    pub category: String,
    /// Submitter system that made the mutation.
    pub submitter: String,
    /// Commit time of the mutation.
    pub date_time_stamp: DateTime<Utc>,
    /// Flattened record.
    pub payload: serde_json::Value,
    /// When the entry may be expired.
    pub expires_at: DateTime<Utc>,
}

/// What [`crate::ChangeFeedSync::handle`] did with a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A new delta entry was written.
    Written {
        /// Fields the flattener could not convert.
        conversion_errors: usize,
    },
    /// An entry for this event already existed; nothing was written.
    AlreadyPresent,
    /// The submitter is excluded from the feed.
    Skipped {
        /// Why.
        reason: String,
    },
    /// Writing kept failing; the notification went to the dead-letter channel.
    DeadLettered {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

impl SyncOutcome {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Written { .. } => "written",
            Self::AlreadyPresent => "already_present",
            Self::Skipped { .. } => "skipped",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// A notification that could not be synced, with the last error seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// The raw notification.
    pub notification: ChangeNotification,
    /// Last failure.
    pub error: String,
    /// Attempts made.
    pub attempts: u32,
    /// When it was dead-lettered.
    pub failed_at: DateTime<Utc>,
}
