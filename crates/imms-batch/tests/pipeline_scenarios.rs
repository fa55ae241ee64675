//! End-to-end bulk file scenarios through the local pipeline.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use bytes::Bytes;

use imms_batch::row::EXPECTED_HEADERS;
use imms_batch::{
    FileAuditEntry, FileStatus, IntakeDecision, LocalPipeline, NotProcessedReason,
    StaticPermissionPolicy, StaticSubmitterDirectory,
};
use imms_core::delimited::split_line;
use imms_core::{PipelineConfig, RecordId};
use imms_test_utils::{
    BulkFileFixture, RowFixture, TEST_SUBMITTER_CODE, TEST_SUBMITTER_SYSTEM, TestContext,
    bulk_file_name,
};

fn pipeline(ctx: &TestContext) -> LocalPipeline {
    let config = PipelineConfig::default()
        .with_environment("test")
        .with_submitter_code(TEST_SUBMITTER_CODE, TEST_SUBMITTER_SYSTEM);
    LocalPipeline::new(
        ctx.backend.clone(),
        &config,
        Arc::new(StaticSubmitterDirectory::from_config(&config)),
        Arc::new(StaticPermissionPolicy::new().with_grant(TEST_SUBMITTER_SYSTEM, "COVID.CRUD")),
    )
    .unwrap()
}

fn headers() -> Vec<&'static str> {
    let mut headers = EXPECTED_HEADERS.to_vec();
    headers.extend(["RECORD_ID", "EXPECTED_VERSION"]);
    headers
}

fn file(rows: Vec<RowFixture>) -> Bytes {
    let headers = headers();
    let fixture = rows
        .into_iter()
        .fold(BulkFileFixture::new(&headers), BulkFileFixture::row);
    Bytes::from(fixture.render())
}

fn admitted(decision: &IntakeDecision) -> FileAuditEntry {
    match decision {
        IntakeDecision::Proceed(entry) | IntakeDecision::Queued(entry) => entry.clone(),
        IntakeDecision::Rejected { reason, .. } => panic!("unexpected rejection: {reason}"),
    }
}

async fn current(pipeline: &LocalPipeline, entry: &FileAuditEntry) -> FileAuditEntry {
    pipeline
        .ledger()
        .get(entry.message_id)
        .await
        .unwrap()
        .expect("ledger entry")
}

fn data_lines(artifact: &str) -> Vec<Vec<String>> {
    artifact
        .lines()
        .skip(1)
        .filter(|l| !l.is_empty())
        .map(split_line)
        .collect()
}

#[tokio::test]
async fn mixed_file_acknowledges_every_row() {
    let ctx = TestContext::new();
    let pipeline = pipeline(&ctx);
    let file_key = bulk_file_name("COVID", "20240101T120000");

    let content = file(vec![
        RowFixture::new("V-1"),
        RowFixture::new("V-1")
            .action("UPDATE")
            .set("EXPECTED_VERSION", "5"),
        RowFixture::new("V-404")
            .action("DELETE")
            .set("RECORD_ID", RecordId::generate().to_string()),
    ]);
    let decision = pipeline.submit(&file_key, content).await.unwrap();
    assert!(matches!(decision, IntakeDecision::Proceed(_)));
    let entry = admitted(&decision);

    assert_eq!(pipeline.run_until_idle().await.unwrap(), 3);

    let done = current(&pipeline, &entry).await;
    assert_eq!(done.status, FileStatus::Processed);
    assert_eq!(done.record_count, Some(3));
    assert_eq!(done.records_succeeded, Some(1));
    assert_eq!(done.records_failed, Some(2));
    assert!(done.ingestion_end_time.is_some());

    let ack = pipeline.business_ack(&done).await.unwrap().expect("business ack");
    let lines = data_lines(&ack);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0][1], "OK");
    assert!(!lines[0][11].is_empty(), "created record id is reported");
    assert_eq!(lines[1][1], "Fatal Error");
    assert!(lines[1][12].contains("version conflict"), "{}", lines[1][12]);
    assert_eq!(lines[2][1], "Fatal Error");
    assert!(lines[2][12].contains("does not exist"), "{}", lines[2][12]);
    for (n, line) in lines.iter().enumerate() {
        assert!(line[0].ends_with(&format!("^{}", n + 1)));
    }

    let inf_ack = pipeline.file_ack(&done).await.unwrap().expect("file ack");
    assert!(inf_ack.contains("|Success|"));
    assert!(pipeline.is_archived(&done).await.unwrap());
    assert!(ctx.backend.paths_containing("ack/temp/").await.is_empty());

    // One create committed.
    assert_eq!(pipeline.changes().len().unwrap(), 1);
}

#[tokio::test]
async fn outcomes_are_kept_when_acknowledgment_fails() {
    let ctx = TestContext::new();
    let pipeline = pipeline(&ctx);
    let file_key = bulk_file_name("COVID", "20240101T120000");
    let content = file(vec![RowFixture::new("V-1"), RowFixture::new("V-2")]);
    let entry = admitted(&pipeline.submit(&file_key, content).await.unwrap());

    ctx.backend.fail_next_puts("ack/temp/", 1);
    pipeline
        .run_until_idle()
        .await
        .expect_err("partial acknowledgment write fails");
    assert_eq!(
        current(&pipeline, &entry).await.status,
        FileStatus::Preprocessed
    );

    // Nothing is forwarded again; the kept outcomes are acknowledged.
    assert_eq!(pipeline.run_until_idle().await.unwrap(), 0);
    let done = current(&pipeline, &entry).await;
    assert_eq!(done.status, FileStatus::Processed);
    assert_eq!(done.records_succeeded, Some(2));
    assert_eq!(done.records_failed, Some(0));
    let ack = pipeline.business_ack(&done).await.unwrap().expect("business ack");
    assert!(data_lines(&ack).iter().all(|line| line[1] == "OK"));
    assert_eq!(pipeline.changes().len().unwrap(), 2);
}

#[tokio::test]
async fn files_for_one_queue_are_processed_one_at_a_time() {
    let ctx = TestContext::new();
    let pipeline = pipeline(&ctx);

    let first = admitted(
        &pipeline
            .submit(
                &bulk_file_name("COVID", "20240101T120000"),
                file(vec![RowFixture::new("A-1"), RowFixture::new("A-2")]),
            )
            .await
            .unwrap(),
    );
    let second_decision = pipeline
        .submit(
            &bulk_file_name("COVID", "20240101T130000"),
            file(vec![RowFixture::new("B-1")]),
        )
        .await
        .unwrap();
    assert!(matches!(second_decision, IntakeDecision::Queued(_)));
    let second = admitted(&second_decision);

    assert_eq!(current(&pipeline, &first).await.status, FileStatus::Preprocessed);
    assert_eq!(current(&pipeline, &second).await.status, FileStatus::Queued);

    assert_eq!(pipeline.run_until_idle().await.unwrap(), 3);

    let first = current(&pipeline, &first).await;
    let second = current(&pipeline, &second).await;
    assert_eq!(first.status, FileStatus::Processed);
    assert_eq!(second.status, FileStatus::Processed);
    assert!(second.ingestion_start_time.unwrap() >= first.ingestion_end_time.unwrap());
    assert_eq!(second.records_succeeded, Some(1));
}

#[tokio::test]
async fn empty_file_is_not_processed_and_frees_the_queue() {
    let ctx = TestContext::new();
    let pipeline = pipeline(&ctx);

    let empty = admitted(
        &pipeline
            .submit(&bulk_file_name("COVID", "20240101T120000"), file(Vec::new()))
            .await
            .unwrap(),
    );
    let empty = current(&pipeline, &empty).await;
    assert_eq!(
        empty.status,
        FileStatus::NotProcessed(NotProcessedReason::EmptyFile)
    );
    assert!(pipeline.file_ack(&empty).await.unwrap().unwrap().contains("|Failure|"));
    assert!(pipeline.is_archived(&empty).await.unwrap());

    let next = pipeline
        .submit(
            &bulk_file_name("COVID", "20240101T130000"),
            file(vec![RowFixture::new("C-1")]),
        )
        .await
        .unwrap();
    assert!(matches!(next, IntakeDecision::Proceed(_)));
}

#[tokio::test]
async fn invalid_header_fails_the_file() {
    let ctx = TestContext::new();
    let pipeline = pipeline(&ctx);

    let entry = admitted(
        &pipeline
            .submit(
                &bulk_file_name("COVID", "20240101T120000"),
                Bytes::from_static(b"NHS_NUMBER|SURPRISE\n9000000009|x\n"),
            )
            .await
            .unwrap(),
    );
    let entry = current(&pipeline, &entry).await;
    assert_eq!(entry.status, FileStatus::Failed);
    assert!(entry.error_details.is_some());
    assert!(pipeline.file_ack(&entry).await.unwrap().unwrap().contains("|Failure|"));
    assert!(pipeline.is_archived(&entry).await.unwrap());
    assert_eq!(pipeline.run_until_idle().await.unwrap(), 0);
}

#[tokio::test]
async fn submitter_without_category_permission_is_rejected() {
    let ctx = TestContext::new();
    let pipeline = pipeline(&ctx);

    let decision = pipeline
        .submit(
            &bulk_file_name("FLU", "20240101T120000"),
            file(vec![RowFixture::new("F-1")]),
        )
        .await
        .unwrap();
    let IntakeDecision::Rejected {
        entry: Some(entry), ..
    } = decision
    else {
        panic!("expected rejection with ledger entry, got {decision:?}");
    };
    assert_eq!(
        entry.status,
        FileStatus::NotProcessed(NotProcessedReason::Unauthorised)
    );
    assert!(pipeline.file_ack(&entry).await.unwrap().unwrap().contains("|Failure|"));
    assert!(pipeline.is_archived(&entry).await.unwrap());
    assert_eq!(pipeline.run_until_idle().await.unwrap(), 0);
}

#[tokio::test]
async fn rows_without_operation_permission_fail_individually() {
    let ctx = TestContext::new();
    let config = PipelineConfig::default()
        .with_environment("test")
        .with_submitter_code(TEST_SUBMITTER_CODE, TEST_SUBMITTER_SYSTEM);
    let pipeline = LocalPipeline::new(
        ctx.backend.clone(),
        &config,
        Arc::new(StaticSubmitterDirectory::from_config(&config)),
        Arc::new(StaticPermissionPolicy::new().with_grant(TEST_SUBMITTER_SYSTEM, "COVID.C")),
    )
    .unwrap();

    let entry = admitted(
        &pipeline
            .submit(
                &bulk_file_name("COVID", "20240101T120000"),
                file(vec![
                    RowFixture::new("P-1"),
                    RowFixture::new("P-1").action("DELETE"),
                    RowFixture::new("P-2").action("REMOVE"),
                ]),
            )
            .await
            .unwrap(),
    );
    pipeline.run_until_idle().await.unwrap();

    let done = current(&pipeline, &entry).await;
    assert_eq!(done.status, FileStatus::Processed);
    assert_eq!(done.records_failed, Some(2));
    let lines = data_lines(&pipeline.business_ack(&done).await.unwrap().unwrap());
    assert!(lines[1][12].contains("No permissions"), "{}", lines[1][12]);
    assert_eq!(lines[2][12], "Invalid ACTION_FLAG");
}

#[tokio::test]
async fn unparseable_file_name_gets_file_ack_without_ledger_entry() {
    let ctx = TestContext::new();
    let pipeline = pipeline(&ctx);

    let decision = pipeline
        .submit("not_a_vaccination_file.csv", file(vec![RowFixture::new("X-1")]))
        .await
        .unwrap();
    assert!(matches!(decision, IntakeDecision::Rejected { entry: None, .. }));

    let acks = ctx.backend.paths_containing("ack/").await;
    assert_eq!(acks.len(), 1);
    assert!(acks[0].contains("not_a_vaccination_file_InfAck_"));
    assert_eq!(
        ctx.backend
            .paths_containing("source/archive/not_a_vaccination_file.csv")
            .await
            .len(),
        1
    );
    assert!(ctx.backend.paths_containing("ledger/").await.is_empty());
}

#[tokio::test]
async fn unknown_submitter_code_is_rejected() {
    let ctx = TestContext::new();
    let pipeline = pipeline(&ctx);

    let decision = pipeline
        .submit(
            "COVID_Vaccinations_v5_ZZZ99_20240101T120000.csv",
            file(vec![RowFixture::new("Z-1")]),
        )
        .await
        .unwrap();
    let IntakeDecision::Rejected { entry, reason } = decision else {
        panic!("expected rejection");
    };
    assert!(entry.is_none());
    assert!(reason.contains("ZZZ99"));
}

#[tokio::test]
async fn resubmitted_file_key_is_a_duplicate() {
    let ctx = TestContext::new();
    let pipeline = pipeline(&ctx);
    let file_key = bulk_file_name("COVID", "20240101T120000");

    pipeline
        .submit(&file_key, file(vec![RowFixture::new("D-1")]))
        .await
        .unwrap();
    pipeline.run_until_idle().await.unwrap();

    let decision = pipeline
        .submit(&file_key, file(vec![RowFixture::new("D-1")]))
        .await
        .unwrap();
    let IntakeDecision::Rejected {
        entry: Some(entry), ..
    } = decision
    else {
        panic!("expected duplicate rejection, got {decision:?}");
    };
    assert_eq!(
        entry.status,
        FileStatus::NotProcessed(NotProcessedReason::Duplicate)
    );
    assert_eq!(pipeline.run_until_idle().await.unwrap(), 0);
    assert_eq!(pipeline.ledger().entries_for_file(&file_key).await.unwrap().len(), 2);
}
