//! Republishes record store commits as immutable delta entries.
//!
//! One entry per commit, written with a does-not-exist precondition keyed by the
//! notification's event ID, so redelivery never produces a second entry.
//! Notifications that cannot be written within the attempt bound go to the
//! dead-letter channel instead of blocking the feed.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use imms_core::metrics::record_delta_result;
use imms_core::scoped_storage::hashed_segment;
use imms_core::{PipelineConfig, ScopedStorage, WritePrecondition, WriteResult};
use imms_store::ChangeNotification;

use crate::dead_letter::DeadLetterSink;
use crate::error::Result;
use crate::flatten::RecordFlattener;
use crate::types::{DeadLetter, DeltaEntry, SyncOutcome, action_flag};

/// Change-feed consumer writing delta entries.
#[derive(Clone)]
pub struct ChangeFeedSync {
    storage: ScopedStorage,
    flattener: Arc<dyn RecordFlattener>,
    dead_letters: Arc<dyn DeadLetterSink>,
    source: String,
    excluded_submitters: HashSet<String>,
    ttl: chrono::Duration,
    max_write_attempts: u32,
}

impl std::fmt::Debug for ChangeFeedSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedSync")
            .field("storage", &self.storage)
            .field("source", &self.source)
            .field("excluded_submitters", &self.excluded_submitters)
            .field("max_write_attempts", &self.max_write_attempts)
            .finish_non_exhaustive()
    }
}

impl ChangeFeedSync {
    /// Creates a sync with default settings.
    #[must_use]
    pub fn new(
        storage: ScopedStorage,
        flattener: Arc<dyn RecordFlattener>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            storage,
            flattener,
            dead_letters,
            source: String::new(),
            excluded_submitters: HashSet::new(),
            ttl: chrono::Duration::zero(),
            max_write_attempts: 1,
        }
        .with_config(&PipelineConfig::default())
    }

    /// Applies source label, exclusions, TTL and attempt bound from `config`.
    #[must_use]
    pub fn with_config(mut self, config: &PipelineConfig) -> Self {
        self.source.clone_from(&config.delta_source);
        self.excluded_submitters = config
            .excluded_submitters
            .iter()
            .map(|s| s.trim().to_ascii_uppercase())
            .collect();
        let days = i64::try_from(config.delta_ttl_days.min(36_500)).unwrap_or(36_500);
        self.ttl = chrono::Duration::days(days);
        self.max_write_attempts = config.delta_max_write_attempts.max(1);
        self
    }

    /// Syncs one notification.
    ///
    /// # Errors
    ///
    /// Returns an error only if the dead-letter channel itself fails.
    #[tracing::instrument(
        skip(self, notification),
        fields(event_id = %notification.event_id, record_id = %notification.record_id)
    )]
    pub async fn handle(&self, notification: &ChangeNotification) -> Result<SyncOutcome> {
        let outcome = self.handle_inner(notification).await?;
        record_delta_result(outcome.as_str());
        Ok(outcome)
    }

    /// Syncs notifications in order, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns an error if the dead-letter channel fails.
    pub async fn handle_all(&self, notifications: &[ChangeNotification]) -> Result<Vec<SyncOutcome>> {
        let mut outcomes = Vec::with_capacity(notifications.len());
        for notification in notifications {
            outcomes.push(self.handle(notification).await?);
        }
        Ok(outcomes)
    }

    /// Reads the delta entry written for an event, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn get(&self, event_id: &str) -> Result<Option<DeltaEntry>> {
        Ok(self
            .storage
            .read_json::<DeltaEntry>(&entry_path(event_id))
            .await?
            .map(|(entry, _)| entry))
    }

    async fn handle_inner(&self, notification: &ChangeNotification) -> Result<SyncOutcome> {
        let submitter = notification.submitter_system.trim().to_ascii_uppercase();
        if self.excluded_submitters.contains(&submitter) {
            let reason = format!("record from {} skipped", notification.submitter_system);
            tracing::info!(submitter = %notification.submitter_system, "excluded submitter, skipping");
            return Ok(SyncOutcome::Skipped { reason });
        }

        let flat = match self
            .flattener
            .flatten(&notification.after, notification.operation)
        {
            Ok(flat) => flat,
            Err(err) => {
                tracing::error!(error = %err, "notification cannot be flattened");
                return self.dead_letter(notification, err.to_string(), 1).await;
            }
        };
        let conversion_errors = flat.conversion_errors.len();
        if conversion_errors > 0 {
            tracing::warn!(conversion_errors, "synced with conversion errors");
        }

        let entry = DeltaEntry {
            event_id: notification.event_id.clone(),
            record_id: notification.record_id,
            source: self.source.clone(),
            operation: action_flag(notification.operation).to_string(),
            category: notification.category.clone(),
            submitter: notification.submitter_system.clone(),
            date_time_stamp: notification.commit_timestamp,
            payload: flat.into_value(),
            expires_at: notification.commit_timestamp + self.ttl,
        };
        let path = entry_path(&notification.event_id);

        let mut last_error = String::new();
        for attempt in 1..=self.max_write_attempts {
            match self
                .storage
                .write_json(&path, &entry, WritePrecondition::DoesNotExist)
                .await
            {
                Ok(WriteResult::Success { .. }) => {
                    tracing::debug!("delta entry written");
                    return Ok(SyncOutcome::Written { conversion_errors });
                }
                Ok(WriteResult::PreconditionFailed { .. }) => {
                    tracing::debug!("delta entry already present");
                    return Ok(SyncOutcome::AlreadyPresent);
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "delta write failed");
                    last_error = err.to_string();
                }
            }
        }
        self.dead_letter(notification, last_error, self.max_write_attempts)
            .await
    }

    async fn dead_letter(
        &self,
        notification: &ChangeNotification,
        error: String,
        attempts: u32,
    ) -> Result<SyncOutcome> {
        tracing::error!(attempts, error = %error, "routing notification to dead-letter channel");
        self.dead_letters
            .send(DeadLetter {
                notification: notification.clone(),
                error,
                attempts,
                failed_at: Utc::now(),
            })
            .await?;
        Ok(SyncOutcome::DeadLettered { attempts })
    }
}

fn entry_path(event_id: &str) -> String {
    ScopedStorage::delta_entry_path(&hashed_segment(&[event_id]))
}
