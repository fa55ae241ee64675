//! File intake: the first stop for a newly arrived bulk file.
//!
//! Validates the file name, resolves the submitter, checks that the submitter may
//! send the category at all, then records the arrival on the audit ledger. Files
//! that fail any of these checks get a file-level acknowledgment and are archived.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;

use imms_core::{MessageId, ScopedStorage};
use imms_core::scoped_storage::SourceStage;

use crate::ack::{AckAccumulator, FileAckStatus};
use crate::error::{BatchError, Result};
use crate::file_key::{FileKey, format_created_at};
use crate::ledger::{AdmitDecision, AdmitRequest, FileAuditEntry, FileAuditLedger, NotProcessedReason};
use crate::policy::{PermissionPolicy, SubmitterDirectory};
use crate::row::AckTarget;
use crate::source::SourceArea;

/// What happened to an arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeDecision {
    /// The file owns its queue; process it now.
    Proceed(FileAuditEntry),
    /// The file waits behind another file of the same queue.
    Queued(FileAuditEntry),
    /// The file will not be processed.
    Rejected {
        /// The ledger entry, when the arrival could be attributed to a queue.
        entry: Option<FileAuditEntry>,
        /// Why.
        reason: String,
    },
}

/// Admits arriving files onto the ledger.
#[derive(Clone)]
pub struct FileIntake {
    ledger: FileAuditLedger,
    acks: AckAccumulator,
    sources: SourceArea,
    directory: Arc<dyn SubmitterDirectory>,
    permissions: Arc<dyn PermissionPolicy>,
}

impl std::fmt::Debug for FileIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIntake")
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl FileIntake {
    /// Creates an intake.
    #[must_use]
    pub fn new(
        ledger: FileAuditLedger,
        acks: AckAccumulator,
        sources: SourceArea,
        directory: Arc<dyn SubmitterDirectory>,
        permissions: Arc<dyn PermissionPolicy>,
    ) -> Self {
        Self {
            ledger,
            acks,
            sources,
            directory,
            permissions,
        }
    }

    /// Handles the arrival of `file_key`, already stored under `source/incoming/`.
    ///
    /// Redelivery with the same `message_id` returns the recorded decision.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger or storage fail.
    #[tracing::instrument(skip(self))]
    pub async fn receive(&self, message_id: MessageId, file_key: &str) -> Result<IntakeDecision> {
        let parsed = match FileKey::parse(file_key) {
            Ok(parsed) => parsed,
            Err(BatchError::InvalidFileKey { reason, .. }) => {
                return self.reject_unattributed(message_id, file_key, reason).await;
            }
            Err(err) => return Err(err),
        };

        let Some(submitter) = self.directory.submitter_for_code(parsed.submitter_code()) else {
            let reason = format!("unknown submitter code {}", parsed.submitter_code());
            return self.reject_unattributed(message_id, file_key, reason).await;
        };

        let request = AdmitRequest::new(message_id, file_key, &submitter, parsed.category());

        if !self.permissions.can_submit(&submitter, parsed.category()) {
            let entry = self
                .ledger
                .reject(request, NotProcessedReason::Unauthorised)
                .await?;
            let reason = format!(
                "{submitter} has no permissions for {}",
                parsed.category()
            );
            self.acknowledge_rejection(&entry, &reason).await?;
            return Ok(IntakeDecision::Rejected {
                entry: Some(entry),
                reason,
            });
        }

        let decision = self.ledger.admit(request).await?;
        let entry = self
            .ledger
            .get(message_id)
            .await?
            .ok_or(BatchError::LedgerEntryNotFound { message_id })?;

        match decision {
            AdmitDecision::Proceed => {
                tracing::info!(file_key, queue_key = %entry.queue_key, "file admitted");
                Ok(IntakeDecision::Proceed(entry))
            }
            AdmitDecision::Queued => {
                tracing::info!(file_key, queue_key = %entry.queue_key, "file queued");
                Ok(IntakeDecision::Queued(entry))
            }
            AdmitDecision::Duplicate => {
                let reason = "Duplicate file".to_string();
                self.acknowledge_rejection(&entry, &reason).await?;
                Ok(IntakeDecision::Rejected {
                    entry: Some(entry),
                    reason,
                })
            }
            AdmitDecision::Rejected => Ok(IntakeDecision::Rejected {
                reason: entry.status.to_string(),
                entry: Some(entry),
            }),
        }
    }

    /// Moves an admitted file from `incoming` to `processing` and returns its
    /// content. `None` if the source is gone from both places.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn start_processing(&self, entry: &FileAuditEntry) -> Result<Option<String>> {
        self.sources
            .move_to(&entry.file_key, SourceStage::Incoming, SourceStage::Processing)
            .await?;
        let Some(data) = self
            .sources
            .read(SourceStage::Processing, &entry.file_key)
            .await?
        else {
            tracing::warn!(file_key = %entry.file_key, "admitted file has no source");
            return Ok(None);
        };
        Ok(Some(decode(&data)))
    }

    async fn acknowledge_rejection(&self, entry: &FileAuditEntry, reason: &str) -> Result<()> {
        let target = AckTarget {
            message_id: entry.message_id,
            file_key: entry.file_key.clone(),
            created_at_formatted: entry.created_at_formatted(),
        };
        self.acks
            .write_file_ack(
                &target,
                &FileAckStatus::Rejected {
                    reason: reason.to_string(),
                },
            )
            .await?;
        self.sources
            .move_to(&entry.file_key, SourceStage::Incoming, SourceStage::Archive)
            .await?;
        Ok(())
    }

    /// Rejects a file that cannot be tied to a queue. No ledger entry is written.
    async fn reject_unattributed(
        &self,
        message_id: MessageId,
        file_key: &str,
        reason: String,
    ) -> Result<IntakeDecision> {
        tracing::warn!(file_key, reason = %reason, "file rejected at intake");
        // Names that are not a single safe path segment cannot be acknowledged.
        if ScopedStorage::validate_segment(file_key, "file key").is_ok() {
            let target = AckTarget {
                message_id,
                file_key: file_key.to_string(),
                created_at_formatted: format_created_at(Utc::now()),
            };
            self.acks
                .write_file_ack(
                    &target,
                    &FileAckStatus::Rejected {
                        reason: reason.clone(),
                    },
                )
                .await?;
            self.sources
                .move_to(file_key, SourceStage::Incoming, SourceStage::Archive)
                .await?;
        }
        Ok(IntakeDecision::Rejected {
            entry: None,
            reason,
        })
    }
}

/// Decodes file content. Invalid UTF-8 sequences are replaced, not rejected.
fn decode(data: &Bytes) -> String {
    String::from_utf8_lossy(data).into_owned()
}
