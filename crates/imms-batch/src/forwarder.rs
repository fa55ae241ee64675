//! Applies row events to the record store.
//!
//! Every event yields exactly one [`RowOutcome`]; store errors are classified,
//! never propagated.

use imms_core::RecordId;
use imms_core::metrics::record_row_outcome;
use imms_core::observability::ingest_span;
use imms_store::{ErrorKind, RecordPayload, RecordStore, StoreError};
use tracing::Instrument;

use crate::row::{OutcomeResult, RequestedOperation, RowEvent, RowInstruction, RowOutcome};

/// Maps row events onto record store mutations.
#[derive(Debug, Clone)]
pub struct RecordForwarder {
    store: RecordStore,
}

impl RecordForwarder {
    /// Creates a forwarder over `store`.
    #[must_use]
    pub const fn new(store: RecordStore) -> Self {
        Self { store }
    }

    /// Applies one event and reports its outcome.
    pub async fn forward(&self, event: &RowEvent) -> RowOutcome {
        let span = ingest_span("forward_row", &event.target.file_key);
        let result = self.apply(event).instrument(span).await;

        let kind = match &result {
            OutcomeResult::Success { .. } => "success",
            OutcomeResult::Failure { error, .. } => error.as_str(),
        };
        record_row_outcome(kind);

        RowOutcome {
            row_id: event.row_id.clone(),
            target: event.target.clone(),
            local_id: event.local_id.clone(),
            result,
        }
    }

    async fn apply(&self, event: &RowEvent) -> OutcomeResult {
        let (payload, record_id, expected_version) = match &event.instruction {
            RowInstruction::Reject { error, diagnostics } => {
                return OutcomeResult::Failure {
                    error: *error,
                    diagnostics: diagnostics.clone(),
                    record_id: None,
                };
            }
            RowInstruction::Apply {
                payload,
                record_id,
                expected_version,
            } => (payload.clone(), *record_id, *expected_version),
        };

        let submitter = event.submitter.as_str();
        let result = match event.operation {
            RequestedOperation::Create => self
                .store
                .create(payload, submitter)
                .await
                .map(Some),
            RequestedOperation::Update => {
                self.update(payload, record_id, expected_version, submitter)
                    .await
            }
            RequestedOperation::Delete => self.delete(&payload, record_id, submitter).await,
            RequestedOperation::Unknown => Err(StoreError::invalid_payload("Invalid ACTION_FLAG")),
        };

        match result {
            Ok(record_id) => OutcomeResult::Success { record_id },
            Err(err) => {
                let error = err.kind();
                if error == ErrorKind::Unhandled {
                    tracing::error!(row_id = %event.row_id, error = %err, "row failed unexpectedly");
                } else {
                    tracing::debug!(row_id = %event.row_id, error = %err, "row rejected by store");
                }
                OutcomeResult::Failure {
                    error,
                    diagnostics: err.to_string(),
                    record_id,
                }
            }
        }
    }

    async fn update(
        &self,
        payload: RecordPayload,
        record_id: Option<RecordId>,
        expected_version: Option<u64>,
        submitter: &str,
    ) -> imms_store::Result<Option<RecordId>> {
        let id = self.resolve(&payload, record_id).await?;
        let expected = match expected_version {
            Some(version) => version,
            None => self.store.read(id, true).await?.version,
        };
        self.store.update(id, payload, expected, submitter).await?;
        Ok(Some(id))
    }

    async fn delete(
        &self,
        payload: &RecordPayload,
        record_id: Option<RecordId>,
        submitter: &str,
    ) -> imms_store::Result<Option<RecordId>> {
        let id = self.resolve(payload, record_id).await?;
        self.store.delete(id, submitter).await?;
        Ok(Some(id))
    }

    async fn resolve(
        &self,
        payload: &RecordPayload,
        record_id: Option<RecordId>,
    ) -> imms_store::Result<RecordId> {
        if let Some(id) = record_id {
            return Ok(id);
        }
        self.store
            .find_by_external_identifier(&payload.external_identifier)
            .await?
            .map(|record| record.id)
            .ok_or_else(|| StoreError::not_found(&payload.external_identifier))
    }
}
