//! Bulk file row processor.
//!
//! Turns the rows of one admitted file into ordered [`RowEvent`]s on the
//! submitter's log partition. Rows that fail validation or permission checks still
//! produce an event, carrying the failure, so every row is acknowledged. The
//! processor never touches the record store.

use std::str::FromStr;
use std::sync::Arc;

use imms_core::RecordId;
use imms_core::observability::ingest_span;
use imms_core::scoped_storage::SourceStage;
use imms_store::ErrorKind;
use tracing::Instrument;

use crate::ack::{AckAccumulator, FileAckStatus};
use crate::error::{BatchError, Result};
use crate::ledger::{EntryAttributes, FileAuditEntry, FileAuditLedger, FileStatus, NotProcessedReason};
use crate::log::RowEventLog;
use crate::policy::{PermissionPolicy, RowValidator};
use crate::row::{
    AckTarget, RequestedOperation, RowEvent, RowInstruction, VaccinationRow, row_id,
    validate_header,
};
use crate::source::SourceArea;

/// Result of processing one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSummary {
    /// Every row was emitted; the entry is `Preprocessed`.
    Emitted {
        /// Rows emitted.
        rows: u64,
        /// Rows emitted as failures.
        rejected: u64,
    },
    /// The file has no data rows.
    Empty,
    /// The header row is invalid; the entry is `Failed`.
    InvalidHeader,
    /// The entry is not in a processable status; nothing was done.
    Skipped(FileStatus),
}

/// Streams bulk file rows onto the row log.
#[derive(Clone)]
pub struct BatchRowProcessor {
    ledger: FileAuditLedger,
    acks: AckAccumulator,
    sources: SourceArea,
    log: Arc<dyn RowEventLog>,
    validator: Arc<dyn RowValidator>,
    permissions: Arc<dyn PermissionPolicy>,
}

impl std::fmt::Debug for BatchRowProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRowProcessor")
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl BatchRowProcessor {
    /// Creates a processor.
    #[must_use]
    pub fn new(
        ledger: FileAuditLedger,
        acks: AckAccumulator,
        sources: SourceArea,
        log: Arc<dyn RowEventLog>,
        validator: Arc<dyn RowValidator>,
        permissions: Arc<dyn PermissionPolicy>,
    ) -> Self {
        Self {
            ledger,
            acks,
            sources,
            log,
            validator,
            permissions,
        }
    }

    /// Processes the content of an admitted file.
    ///
    /// Safe to repeat: events carry stable row IDs and the acknowledgment
    /// deduplicates them.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger, log or storage fail.
    pub async fn process(&self, entry: &FileAuditEntry, content: &str) -> Result<ProcessSummary> {
        let span = ingest_span("process_rows", &entry.file_key);
        self.process_inner(entry, content).instrument(span).await
    }

    async fn process_inner(&self, entry: &FileAuditEntry, content: &str) -> Result<ProcessSummary> {
        if !matches!(entry.status, FileStatus::Processing | FileStatus::Preprocessed) {
            tracing::info!(status = %entry.status, "entry not processable, skipping");
            return Ok(ProcessSummary::Skipped(entry.status));
        }
        let target = AckTarget {
            message_id: entry.message_id,
            file_key: entry.file_key.clone(),
            created_at_formatted: entry.created_at_formatted(),
        };

        let mut lines = content
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty());

        let Some(header_line) = lines.next() else {
            return self.finish_empty(entry, &target).await;
        };
        let headers = match validate_header(header_line) {
            Ok(headers) => headers,
            Err(BatchError::InvalidHeader { message }) => {
                return self.finish_invalid_header(entry, &target, &message).await;
            }
            Err(err) => return Err(err),
        };

        let mut rows = 0u64;
        let mut rejected = 0u64;
        for line in lines {
            rows += 1;
            let event = self.row_event(entry, &target, &headers, line, rows)?;
            if matches!(event.instruction, RowInstruction::Reject { .. }) {
                rejected += 1;
            }
            self.log.append(&entry.submitter, event).await?;
        }

        if rows == 0 {
            return self.finish_empty(entry, &target).await;
        }

        self.acks
            .write_file_ack(&target, &FileAckStatus::Accepted)
            .await?;
        self.ledger
            .transition(
                entry.message_id,
                FileStatus::Preprocessed,
                EntryAttributes::default().with_record_count(rows),
            )
            .await?;
        tracing::info!(rows, rejected, "all rows emitted");

        // Rows forwarded before the count was recorded could not finalize.
        self.acks.finalize(&target).await?;
        Ok(ProcessSummary::Emitted { rows, rejected })
    }

    fn row_event(
        &self,
        entry: &FileAuditEntry,
        target: &AckTarget,
        headers: &[String],
        line: &str,
        ordinal: u64,
    ) -> Result<RowEvent> {
        let row_id = row_id(entry.message_id, ordinal);
        let row = match VaccinationRow::from_line(headers, line) {
            Ok(row) => row,
            Err(message) => {
                return Ok(RowEvent {
                    row_id,
                    target: target.clone(),
                    submitter: entry.submitter.clone(),
                    category: entry.category.clone(),
                    operation: RequestedOperation::Unknown,
                    local_id: String::new(),
                    instruction: RowInstruction::Reject {
                        error: ErrorKind::InvalidPayload,
                        diagnostics: message,
                    },
                });
            }
        };

        let operation = row.operation();
        let instruction = self.instruction_for(entry, &row, operation)?;
        Ok(RowEvent {
            row_id,
            target: target.clone(),
            submitter: entry.submitter.clone(),
            category: entry.category.clone(),
            operation,
            local_id: row.local_id(),
            instruction,
        })
    }

    fn instruction_for(
        &self,
        entry: &FileAuditEntry,
        row: &VaccinationRow,
        operation: RequestedOperation,
    ) -> Result<RowInstruction> {
        let reject = |error: ErrorKind, diagnostics: String| {
            Ok(RowInstruction::Reject { error, diagnostics })
        };

        if operation == RequestedOperation::Unknown {
            return reject(ErrorKind::InvalidPayload, "Invalid ACTION_FLAG".to_string());
        }
        if !self
            .permissions
            .is_permitted(&entry.submitter, &entry.category, operation)
        {
            return reject(
                ErrorKind::Unauthorized,
                format!(
                    "No permissions for requested operation {operation:?} on {}",
                    entry.category
                ),
            );
        }
        let problems = self.validator.validate(row, operation);
        if !problems.is_empty() {
            return reject(ErrorKind::InvalidPayload, problems.join("; "));
        }

        let record_id = match row.record_id.trim() {
            "" => None,
            raw => match RecordId::from_str(raw) {
                Ok(id) => Some(id),
                Err(err) => return reject(ErrorKind::InvalidPayload, err.to_string()),
            },
        };
        let expected_version = match row.expected_version.trim() {
            "" => None,
            raw => match raw.parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    return reject(
                        ErrorKind::InvalidPayload,
                        "EXPECTED_VERSION must be a whole number".to_string(),
                    );
                }
            },
        };

        Ok(RowInstruction::Apply {
            payload: row.to_payload(&entry.category)?,
            record_id,
            expected_version,
        })
    }

    async fn finish_empty(&self, entry: &FileAuditEntry, target: &AckTarget) -> Result<ProcessSummary> {
        tracing::info!("file has no data rows");
        self.ledger
            .transition(
                entry.message_id,
                FileStatus::NotProcessed(NotProcessedReason::EmptyFile),
                EntryAttributes::default().with_record_count(0),
            )
            .await?;
        self.acks
            .write_file_ack(
                target,
                &FileAckStatus::Rejected {
                    reason: "Empty file".to_string(),
                },
            )
            .await?;
        self.archive_and_release(entry).await?;
        Ok(ProcessSummary::Empty)
    }

    async fn finish_invalid_header(
        &self,
        entry: &FileAuditEntry,
        target: &AckTarget,
        message: &str,
    ) -> Result<ProcessSummary> {
        tracing::warn!(error = message, "invalid header row");
        self.ledger
            .transition(
                entry.message_id,
                FileStatus::Failed,
                EntryAttributes::default().with_error_details(message),
            )
            .await?;
        self.acks
            .write_file_ack(
                target,
                &FileAckStatus::Rejected {
                    reason: message.to_string(),
                },
            )
            .await?;
        self.archive_and_release(entry).await?;
        Ok(ProcessSummary::InvalidHeader)
    }

    async fn archive_and_release(&self, entry: &FileAuditEntry) -> Result<()> {
        self.sources
            .move_to(&entry.file_key, SourceStage::Processing, SourceStage::Archive)
            .await?;
        self.ledger.release_next(&entry.queue_key).await?;
        Ok(())
    }
}
