//! Change notifications emitted after every committed mutation.
//!
//! The store hands each commit to a [`ChangeSink`] through its storage outbox,
//! right after the conditional write succeeds. [`InMemoryChangeFeed`] is a single ordered queue, so per-record commit
//! order is preserved for consumers.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use imms_core::RecordId;

use crate::error::{Result, StoreError};
use crate::record::Record;

/// Operation recorded on the change feed. A reinstate is reported as `Update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    /// A record was created.
    Create,
    /// A record was updated or reinstated.
    Update,
    /// A record was tombstoned.
    Delete,
}

impl ChangeOperation {
    /// Uppercase name used in downstream payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Signal emitted on every record store commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Idempotency key: `{record_id}:{storage_generation}`, unique per commit.
    pub event_id: String,
    /// Mutated record.
    pub record_id: RecordId,
    /// What happened.
    pub operation: ChangeOperation,
    /// Record category.
    pub category: String,
    /// Submitter system that made the mutation.
    pub submitter_system: String,
    /// Commit time.
    pub commit_timestamp: DateTime<Utc>,
    /// Stored record before the commit, absent for creates.
    pub before: Option<Record>,
    /// Stored record after the commit.
    pub after: Record,
}

impl ChangeNotification {
    /// Builds the idempotency key for a commit.
    #[must_use]
    pub fn event_id_for(record_id: RecordId, generation: &str) -> String {
        format!("{record_id}:{generation}")
    }
}

/// Receiver of change notifications.
///
/// Delivery is at least once: a notification can arrive again after a retry,
/// with the same `event_id`.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    /// Publishes one notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the notification could not be accepted.
    async fn publish(&self, notification: ChangeNotification) -> Result<()>;
}

/// Sink that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardChangeSink;

#[async_trait]
impl ChangeSink for DiscardChangeSink {
    async fn publish(&self, _notification: ChangeNotification) -> Result<()> {
        Ok(())
    }
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::unhandled("change feed lock poisoned")
}

/// In-memory change feed for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryChangeFeed {
    pending: RwLock<VecDeque<ChangeNotification>>,
}

impl InMemoryChangeFeed {
    /// Creates an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns every pending notification in commit order.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn drain(&self) -> Result<Vec<ChangeNotification>> {
        let mut pending = self.pending.write().map_err(poison_err)?;
        Ok(pending.drain(..).collect())
    }

    /// Returns the number of pending notifications.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.pending.read().map_err(poison_err)?.len())
    }

    /// Returns true if no notifications are pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl ChangeSink for InMemoryChangeFeed {
    async fn publish(&self, notification: ChangeNotification) -> Result<()> {
        self.pending
            .write()
            .map_err(poison_err)?
            .push_back(notification);
        Ok(())
    }
}
