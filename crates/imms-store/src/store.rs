//! Record store operations over scoped object storage.
//!
//! ## Write protocol
//!
//! Each mutation is exactly one conditional write of the record document,
//! planned by [`crate::transition::plan`]. Index objects are maintained around it:
//!
//! 1. **Create** claims the identifier (`DoesNotExist`), writes the subject marker,
//!    then writes the record (`DoesNotExist`). If the record write fails the
//!    claim is released so a retry can succeed. A claim whose record never
//!    appeared (the process died in between) is taken over once it is older
//!    than `claim_stale_after`.
//! 2. **Update / reinstate** writes the record with `MatchesVersion(generation)`.
//!    A new subject marker is written first when subject or category change.
//! 3. **Delete** tombstones the record with `MatchesVersion(generation)`. The
//!    identifier claim is kept so deleted records still block duplicates.
//!
//! Readers re-check every index hit against the record document, so markers left
//! behind by failed or superseded writes are harmless.
//!
//! ## Change notifications
//!
//! After the record write, the commit's [`ChangeNotification`] is written to
//! `changes/pending/{record_id}/` and the record's pending notifications are
//! handed to the [`ChangeSink`] in commit order, each removed once accepted. A
//! sink failure leaves them for [`RecordStore::publish_pending`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use imms_core::metrics::{record_change_publish, record_mutation};
use imms_core::observability::record_span;
use imms_core::{PipelineConfig, RecordId, ScopedStorage, WritePrecondition, WriteResult};

use crate::change::{ChangeNotification, ChangeOperation, ChangeSink};
use crate::error::{Result, StoreError};
use crate::record::{ExternalIdentifier, Record, RecordPayload};
use crate::transition::{
    DeletedAtChange, Plan, Rejection, RequestedMutation, Transition, WriteCondition, plan,
};

/// Default age after which an identifier claim without a record can be reused.
pub const DEFAULT_CLAIM_STALE_AFTER: chrono::Duration = chrono::Duration::minutes(5);

/// Record store tuning.
#[derive(Debug, Clone)]
pub struct RecordStoreConfig {
    /// Objects fetched per page when walking subject markers.
    pub page_size: usize,
    /// Age after which an orphaned identifier claim may be taken over.
    pub claim_stale_after: chrono::Duration,
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            claim_stale_after: DEFAULT_CLAIM_STALE_AFTER,
        }
    }
}

impl RecordStoreConfig {
    /// Derives store settings from the pipeline configuration.
    #[must_use]
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            page_size: config.index_page_size.max(1),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentifierClaim {
    record_id: RecordId,
    identifier: ExternalIdentifier,
    claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubjectMarker {
    record_id: RecordId,
}

/// Durable record table with identifier and subject indexes.
#[derive(Clone)]
pub struct RecordStore {
    storage: ScopedStorage,
    changes: Arc<dyn ChangeSink>,
    config: RecordStoreConfig,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("storage", &self.storage)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Creates a store publishing commits to `changes`.
    #[must_use]
    pub fn new(storage: ScopedStorage, changes: Arc<dyn ChangeSink>) -> Self {
        Self {
            storage,
            changes,
            config: RecordStoreConfig::default(),
        }
    }

    /// Replaces the store configuration.
    #[must_use]
    pub fn with_config(mut self, config: RecordStoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Creates a record and returns its server-assigned ID.
    ///
    /// # Errors
    ///
    /// - `DuplicateIdentifier` if the external identifier is bound to another record
    /// - `InvalidPayload` if the payload lacks identifier, subject or category
    /// - `ChangeNotRecorded` if the record was stored but its notification was not
    /// - `Unhandled` on storage failure
    #[tracing::instrument(skip(self, payload), fields(category = %payload.category))]
    pub async fn create(&self, payload: RecordPayload, submitter_system: &str) -> Result<RecordId> {
        payload.validate()?;
        let id = RecordId::generate();
        let Plan::Apply(transition) = plan(None, RequestedMutation::Create).map_err(|r| reject(id, r))?
        else {
            return Err(StoreError::unhandled("create planned as a no-op"));
        };

        self.claim_identifier(&payload.external_identifier, id).await?;
        let identifier = payload.external_identifier.clone();
        let (record, generation) = match self
            .insert_new(id, &transition, payload, submitter_system)
            .await
        {
            Ok(written) => written,
            Err(err) => {
                self.release_claim(&identifier, id).await;
                return Err(err);
            }
        };

        // A concurrent takeover of a claim we believed stale means someone else owns
        // the identifier now; back the record out before anyone observes it.
        if !self.owns_claim(record.external_identifier(), id).await? {
            self.storage
                .delete(&ScopedStorage::record_path(&id.to_string()))
                .await?;
            record_mutation("create", "duplicate_identifier");
            return Err(StoreError::DuplicateIdentifier {
                identifier: record.payload.external_identifier,
            });
        }

        record_mutation("create", "success");
        tracing::debug!(record_id = %id, "record created");
        self.publish(ChangeOperation::Create, None, record, &generation)
            .await?;
        Ok(id)
    }

    async fn insert_new(
        &self,
        id: RecordId,
        transition: &Transition,
        payload: RecordPayload,
        submitter_system: &str,
    ) -> Result<(Record, String)> {
        self.write_subject_marker(&payload, id).await?;
        let record = materialize(None, id, transition, payload, submitter_system, Utc::now());
        match self.write_record(&record, transition, None).await? {
            WriteResult::Success { version } => Ok((record, version)),
            WriteResult::PreconditionFailed { .. } => {
                record_mutation("create", "conflict");
                let actual = self.load(id).await?.map_or(0, |(r, _)| r.version);
                Err(StoreError::VersionConflict {
                    record_id: id,
                    expected: 0,
                    actual,
                })
            }
        }
    }

    /// Reads a record.
    ///
    /// Deleted records are reported as `NotFound` unless `include_deleted` is set.
    /// Reinstated records read like active ones.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Unhandled`.
    pub async fn read(&self, id: RecordId, include_deleted: bool) -> Result<Record> {
        match self.load(id).await? {
            Some((record, _)) if record.is_live() || include_deleted => Ok(record),
            _ => Err(StoreError::not_found(id)),
        }
    }

    /// Replaces a record's payload, returning the new version.
    ///
    /// Updating a deleted record reinstates it.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the record never existed
    /// - `VersionConflict` if `expected_version` is not the stored version
    /// - `InconsistentIdentifier` if the payload's identifier differs from the stored one
    /// - `Unhandled` on storage failure
    #[tracing::instrument(skip(self, payload), fields(record_id = %id))]
    pub async fn update(
        &self,
        id: RecordId,
        payload: RecordPayload,
        expected_version: u64,
        submitter_system: &str,
    ) -> Result<u64> {
        payload.validate()?;
        let Some((current, generation)) = self.load(id).await? else {
            record_mutation("update", "not_found");
            return Err(StoreError::not_found(id));
        };

        if current.payload.external_identifier != payload.external_identifier {
            record_mutation("update", "inconsistent_identifier");
            return Err(StoreError::InconsistentIdentifier {
                record_id: id,
                stored: current.payload.external_identifier,
                supplied: payload.external_identifier,
            });
        }

        let planned = plan(
            Some((current.lifecycle_state, current.version)),
            RequestedMutation::Update { expected_version },
        )
        .map_err(|r| {
            record_mutation("update", "rejected");
            reject(id, r)
        })?;
        let Plan::Apply(transition) = planned else {
            return Ok(current.version);
        };

        let index_moved = current.payload.subject_key != payload.subject_key
            || !current.payload.category.eq_ignore_ascii_case(&payload.category);
        if index_moved || !current.is_live() {
            self.write_subject_marker(&payload, id).await?;
        }

        let record = materialize(
            Some(&current),
            id,
            &transition,
            payload,
            submitter_system,
            Utc::now(),
        );
        let new_generation = match self
            .write_record(&record, &transition, Some(generation))
            .await?
        {
            WriteResult::Success { version } => version,
            WriteResult::PreconditionFailed { .. } => {
                record_mutation("update", "conflict");
                return Err(match self.load(id).await? {
                    Some((latest, _)) => StoreError::VersionConflict {
                        record_id: id,
                        expected: expected_version,
                        actual: latest.version,
                    },
                    None => StoreError::not_found(id),
                });
            }
        };

        if index_moved {
            let stale = ScopedStorage::subject_marker_path(
                &current.payload.subject_key,
                &current.payload.category,
                &id.to_string(),
            );
            if let Err(err) = self.storage.delete(&stale).await {
                tracing::warn!(record_id = %id, error = %err, "failed to remove superseded subject marker");
            }
        }

        let outcome = if current.is_live() { "success" } else { "reinstated" };
        record_mutation("update", outcome);
        let version = record.version;
        self.publish(transition.operation, Some(current), record, &new_generation)
            .await?;
        Ok(version)
    }

    /// Tombstones a record. Deleting an already-deleted record is a no-op.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the record never existed
    /// - `VersionConflict` if the record changed between read and write
    /// - `Unhandled` on storage failure
    #[tracing::instrument(skip(self), fields(record_id = %id))]
    pub async fn delete(&self, id: RecordId, submitter_system: &str) -> Result<()> {
        let Some((current, generation)) = self.load(id).await? else {
            record_mutation("delete", "not_found");
            return Err(StoreError::not_found(id));
        };

        let planned = plan(
            Some((current.lifecycle_state, current.version)),
            RequestedMutation::Delete,
        )
        .map_err(|r| reject(id, r))?;
        let Plan::Apply(transition) = planned else {
            tracing::debug!(record_id = %id, "record already deleted");
            record_mutation("delete", "noop");
            return Ok(());
        };

        let record = materialize(
            Some(&current),
            id,
            &transition,
            current.payload.clone(),
            submitter_system,
            Utc::now(),
        );
        let new_generation = match self
            .write_record(&record, &transition, Some(generation))
            .await?
        {
            WriteResult::Success { version } => version,
            WriteResult::PreconditionFailed { .. } => {
                return match self.load(id).await? {
                    Some((latest, _)) if !latest.is_live() => {
                        record_mutation("delete", "noop");
                        Ok(())
                    }
                    Some((latest, _)) => {
                        record_mutation("delete", "conflict");
                        Err(StoreError::VersionConflict {
                            record_id: id,
                            expected: current.version,
                            actual: latest.version,
                        })
                    }
                    None => Err(StoreError::not_found(id)),
                };
            }
        };

        record_mutation("delete", "success");
        self.publish(ChangeOperation::Delete, Some(current), record, &new_generation)
            .await?;
        Ok(())
    }

    /// Looks a record up by its external identifier, in any lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns `Unhandled` on storage failure.
    pub async fn find_by_external_identifier(
        &self,
        identifier: &ExternalIdentifier,
    ) -> Result<Option<Record>> {
        let path = ScopedStorage::identifier_claim_path(&identifier.system, &identifier.value);
        let Some((claim, _)) = self.storage.read_json::<IdentifierClaim>(&path).await? else {
            return Ok(None);
        };
        Ok(self
            .load(claim.record_id)
            .await?
            .map(|(record, _)| record)
            .filter(|record| record.external_identifier() == identifier))
    }

    /// Returns every live record for a subject in any of `categories`.
    ///
    /// Walks the subject markers page by page until exhausted.
    ///
    /// # Errors
    ///
    /// Returns `Unhandled` on storage failure.
    pub async fn find_by_subject_and_category(
        &self,
        subject_key: &str,
        categories: &[&str],
    ) -> Result<Vec<Record>> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for category in categories {
            let prefix = ScopedStorage::subject_category_prefix(subject_key, category);
            let mut cursor: Option<String> = None;
            loop {
                let page = self
                    .storage
                    .list_page(&prefix, cursor.as_deref(), self.config.page_size)
                    .await?;
                for meta in page.objects {
                    let Some((marker, _)) =
                        self.storage.read_json::<SubjectMarker>(&meta.path).await?
                    else {
                        continue;
                    };
                    if !seen.insert(marker.record_id) {
                        continue;
                    }
                    let Some((record, _)) = self.load(marker.record_id).await? else {
                        continue;
                    };
                    if record.is_live()
                        && record.payload.subject_key == subject_key
                        && record.payload.category.eq_ignore_ascii_case(category)
                    {
                        found.push(record);
                    }
                }
                match page.next_start_after {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }

        Ok(found)
    }

    async fn load(&self, id: RecordId) -> Result<Option<(Record, String)>> {
        Ok(self
            .storage
            .read_json(&ScopedStorage::record_path(&id.to_string()))
            .await?)
    }

    async fn write_record(
        &self,
        record: &Record,
        transition: &Transition,
        generation: Option<String>,
    ) -> Result<WriteResult> {
        let precondition = match (transition.condition, generation) {
            (WriteCondition::Absent, _) => WritePrecondition::DoesNotExist,
            (WriteCondition::Unchanged { .. }, Some(generation)) => {
                WritePrecondition::MatchesVersion(generation)
            }
            (WriteCondition::Unchanged { .. }, None) => {
                return Err(StoreError::unhandled(
                    "conditional update planned without an observed generation",
                ));
            }
        };
        Ok(self
            .storage
            .write_json(
                &ScopedStorage::record_path(&record.id.to_string()),
                record,
                precondition,
            )
            .await?)
    }

    async fn claim_identifier(&self, identifier: &ExternalIdentifier, id: RecordId) -> Result<()> {
        let path = ScopedStorage::identifier_claim_path(&identifier.system, &identifier.value);
        let claim = IdentifierClaim {
            record_id: id,
            identifier: identifier.clone(),
            claimed_at: Utc::now(),
        };
        let duplicate = || StoreError::DuplicateIdentifier {
            identifier: identifier.clone(),
        };

        if self
            .storage
            .write_json(&path, &claim, WritePrecondition::DoesNotExist)
            .await?
            .is_success()
        {
            return Ok(());
        }

        let Some((existing, claim_version)) =
            self.storage.read_json::<IdentifierClaim>(&path).await?
        else {
            // Claim vanished between the write and the read; try exactly once more.
            return if self
                .storage
                .write_json(&path, &claim, WritePrecondition::DoesNotExist)
                .await?
                .is_success()
            {
                Ok(())
            } else {
                Err(duplicate())
            };
        };

        if self.load(existing.record_id).await?.is_some() {
            return Err(duplicate());
        }
        if Utc::now().signed_duration_since(existing.claimed_at) < self.config.claim_stale_after {
            return Err(duplicate());
        }

        let taken = self
            .storage
            .write_json(
                &path,
                &claim,
                WritePrecondition::MatchesVersion(claim_version),
            )
            .await?;
        if taken.is_success() {
            tracing::warn!(
                identifier = %identifier,
                previous_record_id = %existing.record_id,
                "took over orphaned identifier claim"
            );
            Ok(())
        } else {
            Err(duplicate())
        }
    }

    async fn owns_claim(&self, identifier: &ExternalIdentifier, id: RecordId) -> Result<bool> {
        let path = ScopedStorage::identifier_claim_path(&identifier.system, &identifier.value);
        Ok(self
            .storage
            .read_json::<IdentifierClaim>(&path)
            .await?
            .is_some_and(|(claim, _)| claim.record_id == id))
    }

    /// Frees a claim taken by a create that stored nothing. A record that did
    /// land under `id` (an ambiguous write failure) keeps its claim.
    async fn release_claim(&self, identifier: &ExternalIdentifier, id: RecordId) {
        match self.load(id).await {
            Ok(None) => {}
            Ok(Some(_)) => return,
            Err(err) => {
                tracing::warn!(record_id = %id, error = %err, "cannot tell whether the record landed, keeping claim");
                return;
            }
        }
        match self.owns_claim(identifier, id).await {
            Ok(true) => {
                let path =
                    ScopedStorage::identifier_claim_path(&identifier.system, &identifier.value);
                if let Err(err) = self.storage.delete(&path).await {
                    tracing::warn!(record_id = %id, error = %err, "failed to release identifier claim");
                }
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(record_id = %id, error = %err, "failed to inspect identifier claim");
            }
        }
    }

    async fn write_subject_marker(&self, payload: &RecordPayload, id: RecordId) -> Result<()> {
        let path = ScopedStorage::subject_marker_path(
            &payload.subject_key,
            &payload.category,
            &id.to_string(),
        );
        self.storage
            .write_json(&path, &SubjectMarker { record_id: id }, WritePrecondition::None)
            .await?;
        Ok(())
    }

    /// Records the commit's notification in the outbox, then delivers the
    /// record's outbox in commit order.
    ///
    /// A sink failure leaves the notification pending for
    /// [`Self::publish_pending`]. Only a failed outbox write is an error.
    async fn publish(
        &self,
        operation: ChangeOperation,
        before: Option<Record>,
        after: Record,
        generation: &str,
    ) -> Result<()> {
        let record_id = after.id;
        let notification = ChangeNotification {
            event_id: ChangeNotification::event_id_for(record_id, generation),
            record_id,
            operation,
            category: after.payload.category.clone(),
            submitter_system: after.submitter_system.clone(),
            commit_timestamp: after.updated_at,
            before,
            after,
        };

        let path = ScopedStorage::pending_change_path(
            &record_id.to_string(),
            &commit_sequence(&notification),
        );
        if let Err(source) = self
            .storage
            .write_json(&path, &notification, WritePrecondition::DoesNotExist)
            .await
        {
            record_change_publish("unrecorded");
            tracing::error!(
                event_id = %notification.event_id,
                error = %source,
                "committed mutation has no change notification"
            );
            return Err(StoreError::ChangeNotRecorded {
                record_id,
                event_id: notification.event_id,
                source,
            });
        }

        let span = record_span("publish_change", &record_id.to_string());
        if let Err(err) = self.deliver_pending(record_id).instrument(span).await {
            tracing::warn!(
                event_id = %notification.event_id,
                error = %err,
                "change notification left pending"
            );
        }
        Ok(())
    }

    /// Delivers every pending change notification, oldest first per record.
    ///
    /// Returns the number delivered. Records whose sink still fails keep their
    /// notifications and are reported in the log.
    ///
    /// # Errors
    ///
    /// Returns `Unhandled` if the outbox cannot be listed.
    #[tracing::instrument(skip(self))]
    pub async fn publish_pending(&self) -> Result<usize> {
        let mut records: Vec<RecordId> = Vec::new();
        for meta in self
            .storage
            .list(ScopedStorage::PENDING_CHANGES_PREFIX)
            .await?
        {
            let Some(id) = meta
                .path
                .strip_prefix(ScopedStorage::PENDING_CHANGES_PREFIX)
                .and_then(|rest| rest.split('/').next())
                .and_then(|id| id.parse::<RecordId>().ok())
            else {
                continue;
            };
            if records.last() != Some(&id) {
                records.push(id);
            }
        }

        let mut delivered = 0;
        for id in records {
            match self.deliver_pending(id).await {
                Ok(n) => delivered += n,
                Err(err) => {
                    tracing::warn!(record_id = %id, error = %err, "change notifications still pending");
                }
            }
        }
        Ok(delivered)
    }

    /// Number of change notifications awaiting delivery.
    ///
    /// # Errors
    ///
    /// Returns `Unhandled` if the outbox cannot be listed.
    pub async fn pending_change_count(&self) -> Result<usize> {
        Ok(self
            .storage
            .list(ScopedStorage::PENDING_CHANGES_PREFIX)
            .await?
            .len())
    }

    /// Publishes one record's outbox in order, stopping at the first failure so
    /// later commits never overtake an undelivered one.
    async fn deliver_pending(&self, id: RecordId) -> Result<usize> {
        let prefix = ScopedStorage::pending_changes_prefix(&id.to_string());
        let mut delivered = 0;
        for meta in self.storage.list(&prefix).await? {
            let Some((notification, _)) = self
                .storage
                .read_json::<ChangeNotification>(&meta.path)
                .await?
            else {
                continue;
            };
            if let Err(err) = self.changes.publish(notification).await {
                record_change_publish("pending");
                return Err(err);
            }
            record_change_publish("published");
            self.storage.delete(&meta.path).await?;
            delivered += 1;
        }
        Ok(delivered)
    }
}

/// Outbox sort key. Every commit bumps the version except a delete, which keeps
/// it and sorts after the commit that produced that version.
fn commit_sequence(notification: &ChangeNotification) -> String {
    let tombstone = u8::from(notification.operation == ChangeOperation::Delete);
    format!("{:020}-{tombstone}", notification.after.version)
}

fn reject(id: RecordId, rejection: Rejection) -> StoreError {
    match rejection {
        Rejection::NotFound => StoreError::not_found(id),
        Rejection::AlreadyExists { actual } => StoreError::VersionConflict {
            record_id: id,
            expected: 0,
            actual,
        },
        Rejection::VersionConflict { expected, actual } => StoreError::VersionConflict {
            record_id: id,
            expected,
            actual,
        },
    }
}

fn materialize(
    current: Option<&Record>,
    id: RecordId,
    transition: &Transition,
    payload: RecordPayload,
    submitter_system: &str,
    now: DateTime<Utc>,
) -> Record {
    let payload = match current {
        Some(current) if !transition.delta.replace_payload => current.payload.clone(),
        _ => payload,
    };
    let deleted_at = match transition.delta.deleted_at {
        DeletedAtChange::Keep => current.and_then(|c| c.deleted_at),
        DeletedAtChange::Set => Some(now),
        DeletedAtChange::Clear => None,
    };
    Record {
        id,
        version: transition.delta.new_version,
        lifecycle_state: transition.new_state,
        submitter_system: submitter_system.to_string(),
        payload,
        created_at: current.map_or(now, |c| c.created_at),
        updated_at: now,
        deleted_at,
    }
}
