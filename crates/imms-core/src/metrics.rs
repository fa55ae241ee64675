//! Pipeline metrics.
//!
//! Counters complement structured logging. Names are shared across crates so a
//! single recorder sees the whole pipeline.

use metrics::{counter, describe_counter};

// ============================================================================
// Record store
// ============================================================================

/// Record store mutations by operation and outcome.
pub const RECORD_MUTATIONS: &str = "imms_record_mutations_total";

/// CAS retry counter for read-modify-write loops.
pub const CAS_RETRY: &str = "imms_cas_retry_total";

/// Change notifications by delivery result (`published`, `pending`, `unrecorded`).
pub const CHANGE_PUBLISH: &str = "imms_change_publish_total";

// ============================================================================
// Batch pipeline
// ============================================================================

/// Ledger status transitions by status.
pub const FILE_STATUS: &str = "imms_file_status_total";

/// Row outcomes by outcome kind.
pub const ROW_OUTCOMES: &str = "imms_row_outcomes_total";

/// Acknowledgment artifacts finalized.
pub const ACKS_FINALIZED: &str = "imms_acks_finalized_total";

// ============================================================================
// Change feed
// ============================================================================

/// Delta handling results (`written`, `already_present`, `skipped`, `dead_lettered`).
pub const DELTA_RESULTS: &str = "imms_delta_results_total";

/// Registers all metric descriptions.
///
/// Call once at startup after installing a metrics recorder.
pub fn register_metrics() {
    describe_counter!(RECORD_MUTATIONS, "Record store mutations by operation and outcome");
    describe_counter!(CAS_RETRY, "Total CAS retry attempts");
    describe_counter!(CHANGE_PUBLISH, "Change notifications by delivery result");
    describe_counter!(FILE_STATUS, "File audit ledger status transitions");
    describe_counter!(ROW_OUTCOMES, "Per-row forwarding outcomes");
    describe_counter!(ACKS_FINALIZED, "Acknowledgment artifacts finalized");
    describe_counter!(DELTA_RESULTS, "Change feed delta handling results");
}

/// Records a record store mutation.
pub fn record_mutation(operation: &'static str, outcome: &'static str) {
    counter!(RECORD_MUTATIONS, "operation" => operation, "outcome" => outcome).increment(1);
}

/// Records a CAS retry attempt.
pub fn record_cas_retry(operation: &'static str) {
    counter!(CAS_RETRY, "operation" => operation).increment(1);
}

/// Records the delivery result of a change notification.
pub fn record_change_publish(result: &'static str) {
    counter!(CHANGE_PUBLISH, "result" => result).increment(1);
}

/// Records a ledger status transition.
pub fn record_file_status(status: &str) {
    counter!(FILE_STATUS, "status" => status.to_string()).increment(1);
}

/// Records a row outcome.
pub fn record_row_outcome(kind: &'static str) {
    counter!(ROW_OUTCOMES, "kind" => kind).increment(1);
}

/// Records an acknowledgment finalization.
pub fn record_ack_finalized() {
    counter!(ACKS_FINALIZED).increment(1);
}

/// Records a change feed result.
pub fn record_delta_result(result: &'static str) {
    counter!(DELTA_RESULTS, "result" => result).increment(1);
}
