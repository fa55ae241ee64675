//! Row forwarding against a live record store.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use imms_batch::{
    AckTarget, OutcomeResult, RecordForwarder, RequestedOperation, RowEvent, RowInstruction,
};
use imms_core::{MessageId, RecordId};
use imms_store::{ErrorKind, ExternalIdentifier, InMemoryChangeFeed, RecordPayload, RecordStore};
use imms_test_utils::{TEST_IDENTIFIER_URI, TestContext};

fn forwarder(ctx: &TestContext) -> (RecordForwarder, RecordStore) {
    let store = RecordStore::new(ctx.storage.clone(), Arc::new(InMemoryChangeFeed::new()));
    (RecordForwarder::new(store.clone()), store)
}

fn payload(value: &str, dose: &str) -> RecordPayload {
    RecordPayload {
        external_identifier: ExternalIdentifier::new(TEST_IDENTIFIER_URI, value),
        subject_key: "9000000009".to_string(),
        category: "COVID".to_string(),
        body: serde_json::json!({ "UNIQUE_ID": value, "DOSE_SEQUENCE": dose }),
    }
}

fn event(ordinal: u64, operation: RequestedOperation, instruction: RowInstruction) -> RowEvent {
    let message_id = MessageId::generate();
    RowEvent {
        row_id: format!("{message_id}^{ordinal}"),
        target: AckTarget {
            message_id,
            file_key: "COVID_Vaccinations_v5_ABC12_20240101T120000.csv".to_string(),
            created_at_formatted: "20240101T12000000".to_string(),
        },
        submitter: "EMIS".to_string(),
        category: "COVID".to_string(),
        operation,
        local_id: format!("V-1^{TEST_IDENTIFIER_URI}"),
        instruction,
    }
}

fn apply(payload: RecordPayload, record_id: Option<RecordId>, expected: Option<u64>) -> RowInstruction {
    RowInstruction::Apply {
        payload,
        record_id,
        expected_version: expected,
    }
}

#[tokio::test]
async fn redelivered_create_is_a_duplicate() {
    let ctx = TestContext::new();
    let (forwarder, _) = forwarder(&ctx);
    let create = event(1, RequestedOperation::Create, apply(payload("V-1", "1"), None, None));

    let first = forwarder.forward(&create).await;
    assert!(first.is_success());
    assert_eq!(first.row_id, create.row_id);

    let second = forwarder.forward(&create).await;
    let OutcomeResult::Failure { error, diagnostics, .. } = second.result else {
        panic!("expected failure");
    };
    assert_eq!(error, ErrorKind::DuplicateIdentifier);
    assert!(diagnostics.contains("duplicated"));
}

#[tokio::test]
async fn update_without_version_uses_stored_version() {
    let ctx = TestContext::new();
    let (forwarder, store) = forwarder(&ctx);
    forwarder
        .forward(&event(1, RequestedOperation::Create, apply(payload("V-1", "1"), None, None)))
        .await;

    let outcome = forwarder
        .forward(&event(2, RequestedOperation::Update, apply(payload("V-1", "2"), None, None)))
        .await;
    let OutcomeResult::Success {
        record_id: Some(id),
    } = outcome.result.clone()
    else {
        panic!("expected success, got {:?}", outcome.result);
    };

    let record = store.read(id, false).await.unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.payload.body["DOSE_SEQUENCE"], "2");
}

#[tokio::test]
async fn stale_expected_version_is_a_conflict() {
    let ctx = TestContext::new();
    let (forwarder, _) = forwarder(&ctx);
    forwarder
        .forward(&event(1, RequestedOperation::Create, apply(payload("V-1", "1"), None, None)))
        .await;

    let outcome = forwarder
        .forward(&event(
            2,
            RequestedOperation::Update,
            apply(payload("V-1", "2"), None, Some(7)),
        ))
        .await;
    assert!(matches!(
        outcome.result,
        OutcomeResult::Failure {
            error: ErrorKind::VersionConflict,
            ..
        }
    ));
}

#[tokio::test]
async fn delete_of_unknown_identifier_is_not_found() {
    let ctx = TestContext::new();
    let (forwarder, _) = forwarder(&ctx);

    let outcome = forwarder
        .forward(&event(1, RequestedOperation::Delete, apply(payload("V-9", "1"), None, None)))
        .await;
    assert!(matches!(
        outcome.result,
        OutcomeResult::Failure {
            error: ErrorKind::NotFound,
            record_id: None,
            ..
        }
    ));
}

#[tokio::test]
async fn delete_by_identifier_removes_record() {
    let ctx = TestContext::new();
    let (forwarder, store) = forwarder(&ctx);
    forwarder
        .forward(&event(1, RequestedOperation::Create, apply(payload("V-1", "1"), None, None)))
        .await;

    let outcome = forwarder
        .forward(&event(2, RequestedOperation::Delete, apply(payload("V-1", "1"), None, None)))
        .await;
    let OutcomeResult::Success {
        record_id: Some(id),
    } = outcome.result
    else {
        panic!("expected success");
    };
    assert!(store.read(id, false).await.is_err());
    assert!(store.read(id, true).await.is_ok());
}

#[tokio::test]
async fn rejected_rows_pass_through_untouched() {
    let ctx = TestContext::new();
    let (forwarder, _) = forwarder(&ctx);
    ctx.backend.clear_operations();

    let outcome = forwarder
        .forward(&event(
            3,
            RequestedOperation::Unknown,
            RowInstruction::Reject {
                error: ErrorKind::InvalidPayload,
                diagnostics: "Invalid ACTION_FLAG".to_string(),
            },
        ))
        .await;
    assert_eq!(
        outcome.result,
        OutcomeResult::Failure {
            error: ErrorKind::InvalidPayload,
            diagnostics: "Invalid ACTION_FLAG".to_string(),
            record_id: None,
        }
    );
    assert!(ctx.backend.operations().is_empty());
}
