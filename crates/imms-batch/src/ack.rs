//! Acknowledgment artifacts.
//!
//! Row outcomes accumulate in a partial business acknowledgment under
//! `ack/temp/`. Once it holds one line per source row it is finalized: written
//! under `ack/forwarded/` sorted by row ordinal, the partial is removed, the ledger
//! entry moves to `Processed` and the queue is released.
//!
//! Appends deduplicate by row ID, so redelivered outcomes never count twice.
//! Finalization is idempotent and picks up where a crashed attempt stopped.

use std::collections::HashSet;

use bytes::Bytes;
use chrono::Utc;

use imms_core::delimited::{join_line, split_line};
use imms_core::metrics::{record_ack_finalized, record_cas_retry};
use imms_core::scoped_storage::SourceStage;
use imms_core::{ScopedStorage, WritePrecondition, WriteResult};

use crate::error::{BatchError, Result};
use crate::ledger::{EntryAttributes, FileAuditEntry, FileAuditLedger, FileStatus};
use crate::row::{AckTarget, OutcomeResult, RowOutcome, row_ordinal};
use crate::source::SourceArea;

/// Business acknowledgment columns.
pub const ACK_HEADERS: [&str; 14] = [
    "MESSAGE_HEADER_ID",
    "HEADER_RESPONSE_CODE",
    "ISSUE_SEVERITY",
    "ISSUE_CODE",
    "ISSUE_DETAILS_CODE",
    "RESPONSE_TYPE",
    "RESPONSE_CODE",
    "RESPONSE_DISPLAY",
    "RECEIVED_TIME",
    "MAILBOX_FROM",
    "LOCAL_ID",
    "IMMS_ID",
    "OPERATION_OUTCOME",
    "MESSAGE_DELIVERY",
];

/// File-level acknowledgment columns.
pub const INF_ACK_HEADERS: [&str; 12] = [
    "MESSAGE_HEADER_ID",
    "HEADER_RESPONSE_CODE",
    "ISSUE_SEVERITY",
    "ISSUE_CODE",
    "ISSUE_DETAILS_CODE",
    "RESPONSE_TYPE",
    "RESPONSE_CODE",
    "RESPONSE_DISPLAY",
    "RECEIVED_TIME",
    "MAILBOX_FROM",
    "LOCAL_ID",
    "MESSAGE_DELIVERY",
];

const SUCCESS_COLUMNS: [&str; 7] = ["OK", "Information", "OK", "30001", "Business", "30001", "Success"];

const FAILURE_COLUMNS: [&str; 7] = [
    "Fatal Error",
    "Fatal",
    "Fatal Error",
    "30002",
    "Business",
    "30002",
    "Business Level Response Value - Processing Error",
];

/// Packs multi-line diagnostics into one line.
#[must_use]
pub fn collapse_diagnostics(diagnostics: &str) -> String {
    diagnostics.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Formats one business acknowledgment line.
#[must_use]
pub fn format_ack_line(outcome: &RowOutcome) -> String {
    let (columns, imms_id, operation_outcome, delivered) = match &outcome.result {
        OutcomeResult::Success { record_id } => (
            SUCCESS_COLUMNS,
            record_id.map(|id| id.to_string()).unwrap_or_default(),
            String::new(),
            "True",
        ),
        OutcomeResult::Failure {
            diagnostics,
            record_id,
            ..
        } => (
            FAILURE_COLUMNS,
            record_id.map(|id| id.to_string()).unwrap_or_default(),
            collapse_diagnostics(diagnostics),
            "False",
        ),
    };

    let mut fields: Vec<&str> = Vec::with_capacity(ACK_HEADERS.len());
    fields.push(&outcome.row_id);
    fields.extend(columns);
    fields.push(&outcome.target.created_at_formatted);
    fields.push("");
    fields.push(&outcome.local_id);
    fields.push(&imms_id);
    fields.push(&operation_outcome);
    fields.push(delivered);
    join_line(fields)
}

/// Result of a file-level check, reported in the InfAck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAckStatus {
    /// The file passed file-level validation and was accepted.
    Accepted,
    /// The file was rejected at file level.
    Rejected {
        /// Why, for logs.
        reason: String,
    },
}

/// Result of [`AckAccumulator::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendSummary {
    /// Lines written by this call.
    pub appended: usize,
    /// Lines in the partial artifact afterwards.
    pub total: usize,
}

/// Result of [`AckAccumulator::finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Not every row has been acknowledged yet.
    Incomplete {
        /// Lines accumulated so far.
        appended: u64,
        /// Rows expected, if the file has been fully streamed.
        expected: Option<u64>,
    },
    /// This call finalized the artifact.
    Finalized {
        /// Successful rows.
        succeeded: u64,
        /// Failed rows.
        failed: u64,
    },
    /// An earlier call already finalized the artifact.
    AlreadyFinalized,
}

struct PartialArtifact {
    lines: Vec<String>,
    version: Option<String>,
}

/// Accumulates row outcomes into per-file acknowledgment artifacts.
#[derive(Debug, Clone)]
pub struct AckAccumulator {
    storage: ScopedStorage,
    ledger: FileAuditLedger,
    sources: SourceArea,
    max_cas_retries: u32,
}

impl AckAccumulator {
    /// Creates an accumulator completing files on `ledger`.
    #[must_use]
    pub fn new(storage: ScopedStorage, ledger: FileAuditLedger) -> Self {
        Self {
            sources: SourceArea::new(storage.clone()),
            storage,
            ledger,
            max_cas_retries: 5,
        }
    }

    /// Sets the retry bound for conditional appends.
    #[must_use]
    pub fn with_max_cas_retries(mut self, retries: u32) -> Self {
        self.max_cas_retries = retries.max(1);
        self
    }

    /// Appends outcomes for one file, skipping row IDs already present.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the artifact stays contended.
    #[tracing::instrument(skip(self, outcomes), fields(file_key = %target.file_key, count = outcomes.len()))]
    pub async fn append(&self, target: &AckTarget, outcomes: &[RowOutcome]) -> Result<AppendSummary> {
        let name = target.bus_ack_name();
        let temp_path = ScopedStorage::ack_temp_path(&name);

        for attempt in 0..self.max_cas_retries {
            if self
                .storage
                .head_raw(&ScopedStorage::ack_forwarded_path(&name))
                .await?
                .is_some()
            {
                tracing::debug!("acknowledgment already finalized, dropping late outcomes");
                return Ok(AppendSummary {
                    appended: 0,
                    total: 0,
                });
            }

            let Some(mut partial) = self.read_partial(&temp_path).await? else {
                continue;
            };
            let mut present: HashSet<String> =
                partial.lines.iter().filter_map(|l| line_row_id(l)).collect();
            let before = partial.lines.len();
            for outcome in outcomes {
                if present.insert(outcome.row_id.clone()) {
                    partial.lines.push(format_ack_line(outcome));
                }
            }
            let appended = partial.lines.len() - before;
            if appended == 0 {
                return Ok(AppendSummary {
                    appended,
                    total: before,
                });
            }

            let precondition = partial.version.map_or(
                WritePrecondition::DoesNotExist,
                WritePrecondition::MatchesVersion,
            );
            match self
                .storage
                .put_raw(&temp_path, render(&ACK_HEADERS, &partial.lines), precondition)
                .await?
            {
                WriteResult::Success { .. } => {
                    return Ok(AppendSummary {
                        appended,
                        total: partial.lines.len(),
                    });
                }
                WriteResult::PreconditionFailed { .. } => {
                    record_cas_retry("ack_append");
                    tracing::debug!(attempt, "partial acknowledgment changed concurrently, retrying");
                }
            }
        }
        Err(BatchError::ConcurrentModification {
            path: temp_path,
            attempts: self.max_cas_retries,
        })
    }

    /// Finalizes the artifact once it holds one line per source row.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger entry is missing or storage fails.
    #[tracing::instrument(skip(self), fields(file_key = %target.file_key, message_id = %target.message_id))]
    pub async fn finalize(&self, target: &AckTarget) -> Result<FinalizeOutcome> {
        let name = target.bus_ack_name();
        let forwarded_path = ScopedStorage::ack_forwarded_path(&name);
        let temp_path = ScopedStorage::ack_temp_path(&name);

        let entry = self
            .ledger
            .get(target.message_id)
            .await?
            .ok_or(BatchError::LedgerEntryNotFound {
                message_id: target.message_id,
            })?;

        if let Some(data) = self.read_optional(&forwarded_path).await? {
            // A previous attempt wrote the artifact; make sure the rest happened.
            let lines = data_lines(&data);
            let (succeeded, failed) = count_outcomes(&lines);
            self.storage.delete(&temp_path).await?;
            self.complete(&entry, succeeded, failed).await?;
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }

        let partial = self
            .read_partial(&temp_path)
            .await?
            .map_or_else(Vec::new, |p| p.lines);
        let appended = partial.len() as u64;
        match entry.record_count {
            Some(expected) if appended >= expected => {}
            expected => {
                tracing::debug!(appended, ?expected, "acknowledgment not complete yet");
                return Ok(FinalizeOutcome::Incomplete { appended, expected });
            }
        }

        let mut lines = partial;
        lines.sort_by_key(|l| line_row_id(l).and_then(|id| row_ordinal(&id)).unwrap_or(u64::MAX));
        let (succeeded, failed) = count_outcomes(&lines);

        let written = self
            .storage
            .put_raw(
                &forwarded_path,
                render(&ACK_HEADERS, &lines),
                WritePrecondition::DoesNotExist,
            )
            .await?;
        if !written.is_success() {
            tracing::debug!("acknowledgment finalized concurrently");
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }
        self.storage.delete(&temp_path).await?;
        self.complete(&entry, succeeded, failed).await?;
        tracing::info!(succeeded, failed, "acknowledgment finalized");
        Ok(FinalizeOutcome::Finalized { succeeded, failed })
    }

    /// Writes a file-level acknowledgment (InfAck).
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn write_file_ack(&self, target: &AckTarget, status: &FileAckStatus) -> Result<()> {
        let line: [&str; 12] = match status {
            FileAckStatus::Accepted => [
                "",
                "Success",
                "Information",
                "OK",
                "20013",
                "Technical",
                "20013",
                "Success",
                "",
                "",
                "",
                "True",
            ],
            FileAckStatus::Rejected { reason } => {
                tracing::info!(file_key = %target.file_key, reason = %reason, "file rejected at file level");
                [
                    "",
                    "Failure",
                    "Fatal",
                    "Fatal Error",
                    "10001",
                    "Technical",
                    "10002",
                    "Infrastructure Level Response Value - Processing Error",
                    "",
                    "",
                    "",
                    "False",
                ]
            }
        };
        let message_id = target.message_id.to_string();
        let mut fields = line;
        fields[0] = &message_id;
        fields[8] = &target.created_at_formatted;

        self.storage
            .put_raw(
                &ScopedStorage::file_ack_path(&target.inf_ack_name()),
                render(&INF_ACK_HEADERS, &[join_line(fields)]),
                WritePrecondition::None,
            )
            .await?;
        Ok(())
    }

    async fn complete(&self, entry: &FileAuditEntry, succeeded: u64, failed: u64) -> Result<()> {
        self.sources
            .move_to(&entry.file_key, SourceStage::Processing, SourceStage::Archive)
            .await?;
        let attrs = EntryAttributes {
            records_succeeded: Some(succeeded),
            records_failed: Some(failed),
            ingestion_end_time: Some(Utc::now()),
            ..EntryAttributes::default()
        };
        if self
            .ledger
            .transition(entry.message_id, FileStatus::Processed, attrs)
            .await?
        {
            record_ack_finalized();
        }
        self.ledger.release_next(&entry.queue_key).await?;
        Ok(())
    }

    /// Reads the partial artifact. `None` means it vanished between head and get.
    async fn read_partial(&self, path: &str) -> Result<Option<PartialArtifact>> {
        let Some(meta) = self.storage.head_raw(path).await? else {
            return Ok(Some(PartialArtifact {
                lines: Vec::new(),
                version: None,
            }));
        };
        match self.storage.get_raw(path).await {
            Ok(data) => Ok(Some(PartialArtifact {
                lines: data_lines(&data),
                version: Some(meta.version),
            })),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_optional(&self, path: &str) -> Result<Option<Bytes>> {
        match self.storage.get_raw(path).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn render(headers: &[&str], lines: &[String]) -> Bytes {
    let mut out = headers.join("|");
    out.push('\n');
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    Bytes::from(out)
}

/// Non-empty lines after the header.
fn data_lines(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data)
        .lines()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

fn line_row_id(line: &str) -> Option<String> {
    split_line(line).into_iter().next().filter(|id| !id.is_empty())
}

fn count_outcomes(lines: &[String]) -> (u64, u64) {
    let failed = lines
        .iter()
        .filter(|l| split_line(l).get(1).map(String::as_str) != Some("OK"))
        .count() as u64;
    (lines.len() as u64 - failed, failed)
}
