//! File audit ledger.
//!
//! One [`FileAuditEntry`] per file arrival, keyed by [`MessageId`], with secondary
//! markers by file key and by queue key. Processing is serialized per queue key
//! (`{submitter}_{category}`) through a slot document:
//!
//! ```text
//! ledger/entries/{message_id}.json          the entry
//! ledger/by-file/{hash(file_key)}/{id}.json file key index marker
//! ledger/by-queue/{queue_key}/{id}.json     queue index marker
//! ledger/slots/{queue_key}.json             current holder of the queue
//! ```
//!
//! The slot is only ever changed with conditional writes. It names the entry that
//! currently owns the queue; the owner keeps it while `Processing` or `Preprocessed`
//! and loses it once terminal. Handing the slot over always picks the oldest
//! `Queued` entry, so admission and release share one [`FileAuditLedger::advance`]
//! step.
//!
//! An entry stuck in `Processing` (the worker died) keeps its queue blocked; there
//! is no automatic recovery.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use imms_core::metrics::{record_cas_retry, record_file_status};
use imms_core::{MessageId, ScopedStorage, WritePrecondition, WriteResult};

use crate::error::{BatchError, Result};
use crate::file_key::{format_created_at, queue_key};

/// Why a file was not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotProcessedReason {
    /// Another arrival with the same file key was already accepted.
    Duplicate,
    /// The submitter has no permission for the file's category.
    Unauthorised,
    /// The file has no data rows.
    EmptyFile,
}

impl NotProcessedReason {
    /// Label used in the status string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "Duplicate",
            Self::Unauthorised => "Unauthorised",
            Self::EmptyFile => "Empty file",
        }
    }
}

/// Status of a file arrival.
///
/// Serialized as the status strings external readers see, e.g. `Processed` or
/// `Not processed - Duplicate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum FileStatus {
    /// Waiting for its queue to become free.
    Queued,
    /// Owns its queue; rows are being streamed.
    Processing,
    /// Every row has been emitted; acknowledgments are outstanding.
    Preprocessed,
    /// Acknowledgment finalized.
    Processed,
    /// Failed at file level.
    Failed,
    /// Rejected without processing.
    NotProcessed(NotProcessedReason),
}

const NOT_PROCESSED_PREFIX: &str = "Not processed - ";

impl FileStatus {
    /// Returns true if the entry will never change status again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Failed | Self::NotProcessed(_))
    }

    /// Returns true if an arrival in this status makes later arrivals of the same
    /// file key duplicates.
    #[must_use]
    pub const fn blocks_duplicates(self) -> bool {
        matches!(self, Self::Processing | Self::Preprocessed | Self::Processed)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("Queued"),
            Self::Processing => f.write_str("Processing"),
            Self::Preprocessed => f.write_str("Preprocessed"),
            Self::Processed => f.write_str("Processed"),
            Self::Failed => f.write_str("Failed"),
            Self::NotProcessed(reason) => write!(f, "{NOT_PROCESSED_PREFIX}{}", reason.as_str()),
        }
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(Self::Queued),
            "Processing" => Ok(Self::Processing),
            "Preprocessed" => Ok(Self::Preprocessed),
            "Processed" => Ok(Self::Processed),
            "Failed" => Ok(Self::Failed),
            other => match other.strip_prefix(NOT_PROCESSED_PREFIX) {
                Some("Duplicate") => Ok(Self::NotProcessed(NotProcessedReason::Duplicate)),
                Some("Unauthorised") => Ok(Self::NotProcessed(NotProcessedReason::Unauthorised)),
                Some("Empty file") => Ok(Self::NotProcessed(NotProcessedReason::EmptyFile)),
                _ => Err(format!("unknown file status: {other}")),
            },
        }
    }
}

impl From<FileStatus> for String {
    fn from(status: FileStatus) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for FileStatus {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// One file arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAuditEntry {
    /// Arrival identifier.
    pub message_id: MessageId,
    /// File name as received.
    pub file_key: String,
    /// Submitter system.
    pub submitter: String,
    /// Uppercase vaccine category.
    pub category: String,
    /// `{submitter}_{category}`.
    pub queue_key: String,
    /// Current status.
    pub status: FileStatus,
    /// Number of data rows, known once the file has been streamed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    /// Rows acknowledged as successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_succeeded: Option<u64>,
    /// Rows acknowledged as failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_failed: Option<u64>,
    /// File-level failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    /// When the entry started processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingestion_start_time: Option<DateTime<Utc>>,
    /// When the acknowledgment was finalized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingestion_end_time: Option<DateTime<Utc>>,
    /// Arrival time.
    pub created_at: DateTime<Utc>,
    /// When the entry may be expired by storage lifecycle rules.
    pub expires_at: DateTime<Utc>,
}

impl FileAuditEntry {
    /// `created_at` in acknowledgment format.
    #[must_use]
    pub fn created_at_formatted(&self) -> String {
        format_created_at(self.created_at)
    }
}

/// A file arrival to record.
#[derive(Debug, Clone)]
pub struct AdmitRequest {
    /// Arrival identifier.
    pub message_id: MessageId,
    /// File name as received.
    pub file_key: String,
    /// Submitter system.
    pub submitter: String,
    /// Vaccine category.
    pub category: String,
    /// Arrival time.
    pub created_at: DateTime<Utc>,
}

impl AdmitRequest {
    /// Creates a request timestamped now.
    #[must_use]
    pub fn new(
        message_id: MessageId,
        file_key: impl Into<String>,
        submitter: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            file_key: file_key.into(),
            submitter: submitter.into(),
            category: category.into(),
            created_at: Utc::now(),
        }
    }

    /// The queue key this arrival serializes on.
    #[must_use]
    pub fn queue_key(&self) -> String {
        queue_key(&self.submitter, &self.category)
    }
}

/// Outcome of [`FileAuditLedger::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    /// The arrival owns its queue and should be processed now.
    Proceed,
    /// The queue is busy; the arrival waits.
    Queued,
    /// The file key was already accepted; the arrival is not processed.
    Duplicate,
    /// The arrival was rejected or failed earlier.
    Rejected,
}

impl AdmitDecision {
    /// Returns true if the caller should process the file now.
    #[must_use]
    pub const fn proceed(self) -> bool {
        matches!(self, Self::Proceed)
    }
}

/// Attributes written alongside a status transition. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryAttributes {
    /// Number of data rows.
    pub record_count: Option<u64>,
    /// Rows acknowledged as successful.
    pub records_succeeded: Option<u64>,
    /// Rows acknowledged as failed.
    pub records_failed: Option<u64>,
    /// File-level failure details.
    pub error_details: Option<String>,
    /// Completion time.
    pub ingestion_end_time: Option<DateTime<Utc>>,
}

impl EntryAttributes {
    /// Sets the row count.
    #[must_use]
    pub const fn with_record_count(mut self, count: u64) -> Self {
        self.record_count = Some(count);
        self
    }

    /// Sets the failure details.
    #[must_use]
    pub fn with_error_details(mut self, details: impl Into<String>) -> Self {
        self.error_details = Some(details.into());
        self
    }

    fn apply(self, entry: &mut FileAuditEntry) {
        if let Some(v) = self.record_count {
            entry.record_count = Some(v);
        }
        if let Some(v) = self.records_succeeded {
            entry.records_succeeded = Some(v);
        }
        if let Some(v) = self.records_failed {
            entry.records_failed = Some(v);
        }
        if let Some(v) = self.error_details {
            entry.error_details = Some(v);
        }
        if let Some(v) = self.ingestion_end_time {
            entry.ingestion_end_time = Some(v);
        }
    }
}

/// Starts processing of a file that left the queue.
#[async_trait]
pub trait FileTrigger: Send + Sync {
    /// Hands `entry` (now `Processing`) to the row processor.
    ///
    /// # Errors
    ///
    /// Returns an error if the file could not be handed over.
    async fn trigger(&self, entry: &FileAuditEntry) -> Result<()>;
}

/// Trigger that only logs. For deployments where a separate poller picks up
/// `Processing` entries.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFileTrigger;

#[async_trait]
impl FileTrigger for LoggingFileTrigger {
    async fn trigger(&self, entry: &FileAuditEntry) -> Result<()> {
        tracing::info!(
            message_id = %entry.message_id,
            file_key = %entry.file_key,
            "queued file released for processing"
        );
        Ok(())
    }
}

/// Trigger that sends released message IDs down a channel.
#[derive(Debug, Clone)]
pub struct ChannelFileTrigger {
    sender: UnboundedSender<MessageId>,
}

impl ChannelFileTrigger {
    /// Wraps a channel sender.
    #[must_use]
    pub const fn new(sender: UnboundedSender<MessageId>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl FileTrigger for ChannelFileTrigger {
    async fn trigger(&self, entry: &FileAuditEntry) -> Result<()> {
        self.sender
            .send(entry.message_id)
            .map_err(|_| BatchError::TriggerFailed {
                message_id: entry.message_id,
                message: "receiver dropped".to_string(),
            })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueSlot {
    holder: Option<MessageId>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexMarker {
    message_id: MessageId,
}

/// Durable audit ledger for file arrivals.
#[derive(Clone)]
pub struct FileAuditLedger {
    storage: ScopedStorage,
    trigger: Arc<dyn FileTrigger>,
    ttl: chrono::Duration,
    max_cas_retries: u32,
}

impl fmt::Debug for FileAuditLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileAuditLedger")
            .field("storage", &self.storage)
            .field("ttl", &self.ttl)
            .field("max_cas_retries", &self.max_cas_retries)
            .finish_non_exhaustive()
    }
}

impl FileAuditLedger {
    /// Creates a ledger that releases queued files through `trigger`.
    #[must_use]
    pub fn new(storage: ScopedStorage, trigger: Arc<dyn FileTrigger>) -> Self {
        Self {
            storage,
            trigger,
            ttl: chrono::Duration::days(30),
            max_cas_retries: 5,
        }
    }

    /// Sets how long entries are kept (`expiresAt = createdAt + ttl`).
    #[must_use]
    pub fn with_ttl_days(mut self, days: u64) -> Self {
        // Clamped to a century; chrono durations are bounded.
        let days = i64::try_from(days.min(36_500)).unwrap_or(36_500);
        self.ttl = chrono::Duration::days(days);
        self
    }

    /// Sets the retry bound for conditional-write loops.
    #[must_use]
    pub fn with_max_cas_retries(mut self, retries: u32) -> Self {
        self.max_cas_retries = retries.max(1);
        self
    }

    /// Records a file arrival and decides whether it may be processed now.
    ///
    /// Re-admitting a known message ID returns the stored decision.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the queue slot stays contended.
    #[tracing::instrument(skip(self, request), fields(message_id = %request.message_id, file_key = %request.file_key))]
    pub async fn admit(&self, request: AdmitRequest) -> Result<AdmitDecision> {
        if let Some(existing) = self.get(request.message_id).await? {
            return self.redecide(existing).await;
        }

        let duplicate = self
            .entries_for_file(&request.file_key)
            .await?
            .iter()
            .any(|e| e.message_id != request.message_id && e.status.blocks_duplicates());
        if duplicate {
            let entry = self.new_entry(
                &request,
                FileStatus::NotProcessed(NotProcessedReason::Duplicate),
            );
            return match self.insert(&entry).await? {
                Some(stored) => self.redecide(stored).await,
                None => {
                    tracing::info!(file_key = %request.file_key, "duplicate file arrival");
                    Ok(AdmitDecision::Duplicate)
                }
            };
        }

        let entry = self.new_entry(&request, FileStatus::Queued);
        if let Some(stored) = self.insert(&entry).await? {
            return self.redecide(stored).await;
        }
        self.decide_queued(&entry).await
    }

    /// Records an arrival that is rejected outright.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn reject(
        &self,
        request: AdmitRequest,
        reason: NotProcessedReason,
    ) -> Result<FileAuditEntry> {
        let entry = self.new_entry(&request, FileStatus::NotProcessed(reason));
        Ok(match self.insert(&entry).await? {
            Some(stored) => stored,
            None => entry,
        })
    }

    /// Moves an entry to `status`, writing `attrs` with it.
    ///
    /// Returns `false` if the entry already held `status` (nothing is written), so
    /// repeated transitions happen exactly once.
    ///
    /// # Errors
    ///
    /// - `LedgerEntryNotFound` if the message ID is unknown
    /// - `InvalidTransition` if the entry is terminal in a different status
    #[tracing::instrument(skip(self, attrs))]
    pub async fn transition(
        &self,
        message_id: MessageId,
        status: FileStatus,
        attrs: EntryAttributes,
    ) -> Result<bool> {
        let path = ScopedStorage::ledger_entry_path(&message_id.to_string());
        for attempt in 0..self.max_cas_retries {
            let Some((mut entry, version)) =
                self.storage.read_json::<FileAuditEntry>(&path).await?
            else {
                return Err(BatchError::LedgerEntryNotFound { message_id });
            };
            if entry.status == status {
                return Ok(false);
            }
            if entry.status.is_terminal() {
                return Err(BatchError::InvalidTransition {
                    message_id,
                    from: entry.status.to_string(),
                    to: status.to_string(),
                });
            }

            if status == FileStatus::Processing {
                entry.ingestion_start_time = Some(Utc::now());
            }
            entry.status = status;
            attrs.clone().apply(&mut entry);

            match self
                .storage
                .write_json(&path, &entry, WritePrecondition::MatchesVersion(version))
                .await?
            {
                WriteResult::Success { .. } => {
                    record_file_status(&status.to_string());
                    tracing::debug!(queue_key = %entry.queue_key, "ledger entry transitioned");
                    return Ok(true);
                }
                WriteResult::PreconditionFailed { .. } => {
                    record_cas_retry("ledger_transition");
                    tracing::debug!(attempt, "ledger entry changed concurrently, retrying");
                }
            }
        }
        Err(BatchError::ConcurrentModification {
            path,
            attempts: self.max_cas_retries,
        })
    }

    /// Frees `queue_key` if its holder is terminal and hands it to the oldest
    /// `Queued` entry, which is triggered.
    ///
    /// Returns the message ID that now holds the queue, if one was released.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails, the slot stays contended, or the trigger
    /// fails.
    #[tracing::instrument(skip(self))]
    pub async fn release_next(&self, queue_key: &str) -> Result<Option<MessageId>> {
        let Some(next) = self.advance(queue_key).await? else {
            return Ok(None);
        };
        self.trigger.trigger(&next).await?;
        Ok(Some(next.message_id))
    }

    /// Reads one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn get(&self, message_id: MessageId) -> Result<Option<FileAuditEntry>> {
        let path = ScopedStorage::ledger_entry_path(&message_id.to_string());
        Ok(self
            .storage
            .read_json::<FileAuditEntry>(&path)
            .await?
            .map(|(entry, _)| entry))
    }

    /// Every arrival of a file key, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn entries_for_file(&self, file_key: &str) -> Result<Vec<FileAuditEntry>> {
        self.entries_under(&ScopedStorage::ledger_file_prefix(file_key))
            .await
    }

    /// Every arrival for a queue key, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn entries_for_queue(&self, queue_key: &str) -> Result<Vec<FileAuditEntry>> {
        self.entries_under(&ScopedStorage::ledger_queue_prefix(queue_key))
            .await
    }

    /// Hands the queue to its oldest `Queued` entry if the current holder is done.
    ///
    /// Returns the entry that was newly moved to `Processing`. An entry that holds
    /// the slot but is still `Queued` had its promotion interrupted and is
    /// promoted again.
    async fn advance(&self, queue_key: &str) -> Result<Option<FileAuditEntry>> {
        let slot_path = ScopedStorage::queue_slot_path(queue_key);

        for attempt in 0..self.max_cas_retries {
            let current = self.storage.read_json::<QueueSlot>(&slot_path).await?;
            let (slot, version) = match current {
                Some((slot, version)) => (slot, Some(version)),
                None => (QueueSlot::default(), None),
            };

            if let Some(holder) = slot.holder {
                match self.get(holder).await? {
                    Some(entry) if entry.status == FileStatus::Queued => {
                        self.transition(holder, FileStatus::Processing, EntryAttributes::default())
                            .await?;
                        return self.get(holder).await;
                    }
                    Some(entry) if !entry.status.is_terminal() => return Ok(None),
                    _ => {}
                }
            }

            let next = self
                .entries_for_queue(queue_key)
                .await?
                .into_iter()
                .find(|e| e.status == FileStatus::Queued);

            let updated = QueueSlot {
                holder: next.as_ref().map(|e| e.message_id),
                updated_at: Some(Utc::now()),
            };
            if slot.holder.is_none() && updated.holder.is_none() {
                return Ok(None);
            }
            let precondition = version.map_or(
                WritePrecondition::DoesNotExist,
                WritePrecondition::MatchesVersion,
            );
            match self
                .storage
                .write_json(&slot_path, &updated, precondition)
                .await?
            {
                WriteResult::Success { .. } => {
                    let Some(next) = next else {
                        tracing::debug!(queue_key, "queue released with nothing waiting");
                        return Ok(None);
                    };
                    self.transition(next.message_id, FileStatus::Processing, EntryAttributes::default())
                        .await?;
                    tracing::info!(queue_key, message_id = %next.message_id, "queue handed to next file");
                    return self.get(next.message_id).await;
                }
                WriteResult::PreconditionFailed { .. } => {
                    record_cas_retry("queue_slot");
                    tracing::debug!(queue_key, attempt, "queue slot changed concurrently, retrying");
                }
            }
        }
        Err(BatchError::ConcurrentModification {
            path: slot_path,
            attempts: self.max_cas_retries,
        })
    }

    async fn decide_queued(&self, entry: &FileAuditEntry) -> Result<AdmitDecision> {
        match self.advance(&entry.queue_key).await? {
            Some(promoted) if promoted.message_id == entry.message_id => Ok(AdmitDecision::Proceed),
            Some(promoted) => {
                // An older arrival was waiting on a free queue; it goes first.
                self.trigger.trigger(&promoted).await?;
                Ok(AdmitDecision::Queued)
            }
            None => match self.get(entry.message_id).await? {
                Some(stored) if stored.status == FileStatus::Processing => Ok(AdmitDecision::Proceed),
                _ => Ok(AdmitDecision::Queued),
            },
        }
    }

    async fn redecide(&self, entry: FileAuditEntry) -> Result<AdmitDecision> {
        match entry.status {
            FileStatus::Queued => self.decide_queued(&entry).await,
            FileStatus::NotProcessed(NotProcessedReason::Duplicate) => Ok(AdmitDecision::Duplicate),
            FileStatus::Processing | FileStatus::Preprocessed | FileStatus::Processed => {
                Ok(AdmitDecision::Proceed)
            }
            FileStatus::Failed | FileStatus::NotProcessed(_) => Ok(AdmitDecision::Rejected),
        }
    }

    fn new_entry(&self, request: &AdmitRequest, status: FileStatus) -> FileAuditEntry {
        FileAuditEntry {
            message_id: request.message_id,
            file_key: request.file_key.clone(),
            submitter: request.submitter.clone(),
            category: request.category.to_ascii_uppercase(),
            queue_key: request.queue_key(),
            status,
            record_count: None,
            records_succeeded: None,
            records_failed: None,
            error_details: None,
            ingestion_start_time: None,
            ingestion_end_time: None,
            created_at: request.created_at,
            expires_at: request.created_at + self.ttl,
        }
    }

    /// Writes a new entry and its index markers. Returns the stored entry if the
    /// message ID was already recorded.
    async fn insert(&self, entry: &FileAuditEntry) -> Result<Option<FileAuditEntry>> {
        let id = entry.message_id.to_string();
        let marker = IndexMarker {
            message_id: entry.message_id,
        };
        // Markers first: an entry is never visible without them.
        self.storage
            .write_json(
                &format!("{}{id}.json", ScopedStorage::ledger_file_prefix(&entry.file_key)),
                &marker,
                WritePrecondition::None,
            )
            .await?;
        self.storage
            .write_json(
                &format!("{}{id}.json", ScopedStorage::ledger_queue_prefix(&entry.queue_key)),
                &marker,
                WritePrecondition::None,
            )
            .await?;

        let written = self
            .storage
            .write_json(
                &ScopedStorage::ledger_entry_path(&id),
                entry,
                WritePrecondition::DoesNotExist,
            )
            .await?;
        if written.is_success() {
            record_file_status(&entry.status.to_string());
            Ok(None)
        } else {
            self.get(entry.message_id).await
        }
    }

    async fn entries_under(&self, prefix: &str) -> Result<Vec<FileAuditEntry>> {
        let mut entries = Vec::new();
        for meta in self.storage.list(prefix).await? {
            let Some((marker, _)) = self.storage.read_json::<IndexMarker>(&meta.path).await? else {
                continue;
            };
            if let Some(entry) = self.get(marker.message_id).await? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imms_core::MemoryBackend;

    fn ledger() -> FileAuditLedger {
        let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "unit").unwrap();
        FileAuditLedger::new(storage, Arc::new(LoggingFileTrigger))
    }

    #[test]
    fn status_strings_round_trip() {
        let all = [
            FileStatus::Queued,
            FileStatus::Processing,
            FileStatus::Preprocessed,
            FileStatus::Processed,
            FileStatus::Failed,
            FileStatus::NotProcessed(NotProcessedReason::Duplicate),
            FileStatus::NotProcessed(NotProcessedReason::Unauthorised),
            FileStatus::NotProcessed(NotProcessedReason::EmptyFile),
        ];
        for status in all {
            assert_eq!(status.to_string().parse::<FileStatus>().unwrap(), status);
        }
        assert_eq!(
            FileStatus::NotProcessed(NotProcessedReason::EmptyFile).to_string(),
            "Not processed - Empty file"
        );
        assert!("Bogus".parse::<FileStatus>().is_err());
    }

    #[test]
    fn entry_serializes_status_string() {
        let request = AdmitRequest::new(MessageId::generate(), "f.csv", "EMIS", "covid");
        let entry = ledger().new_entry(&request, FileStatus::Queued);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["status"], "Queued");
        assert_eq!(json["queueKey"], "EMIS_COVID");
        assert!(json.get("recordCount").is_none());
        assert_eq!(entry.expires_at - entry.created_at, chrono::Duration::days(30));
    }

    #[tokio::test]
    async fn first_arrival_proceeds() {
        let ledger = ledger();
        let id = MessageId::generate();
        let decision = ledger
            .admit(AdmitRequest::new(id, "f.csv", "EMIS", "COVID"))
            .await
            .unwrap();
        assert_eq!(decision, AdmitDecision::Proceed);
        let entry = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, FileStatus::Processing);
        assert!(entry.ingestion_start_time.is_some());
    }

    #[tokio::test]
    async fn transition_of_unknown_entry_fails() {
        let err = ledger()
            .transition(MessageId::generate(), FileStatus::Processed, EntryAttributes::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::LedgerEntryNotFound { .. }));
    }
}
