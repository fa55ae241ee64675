//! Acknowledgment accumulation under redelivery, reordering and concurrency.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use proptest::prelude::*;
use tokio_test::block_on;

use imms_batch::ack::ACK_HEADERS;
use imms_batch::row::row_id;
use imms_batch::{
    AckAccumulator, AckTarget, AdmitDecision, AdmitRequest, EntryAttributes, FileAuditLedger,
    FileStatus, FinalizeOutcome, LoggingFileTrigger, OutcomeResult, RowOutcome,
};
use imms_core::delimited::split_line;
use imms_core::{MessageId, ScopedStorage};
use imms_store::ErrorKind;
use imms_test_utils::{TestContext, bulk_file_name};

struct Harness {
    ctx: TestContext,
    ledger: FileAuditLedger,
    acks: AckAccumulator,
    target: AckTarget,
}

async fn harness(rows: u64, retries: u32) -> Harness {
    let ctx = TestContext::new();
    let ledger = FileAuditLedger::new(ctx.storage.clone(), Arc::new(LoggingFileTrigger));
    let acks = AckAccumulator::new(ctx.storage.clone(), ledger.clone()).with_max_cas_retries(retries);

    let message_id = MessageId::generate();
    let file_key = bulk_file_name("COVID", "20240101T120000");
    let decision = ledger
        .admit(AdmitRequest::new(message_id, &file_key, "EMIS", "COVID"))
        .await
        .unwrap();
    assert_eq!(decision, AdmitDecision::Proceed);
    ledger
        .transition(
            message_id,
            FileStatus::Preprocessed,
            EntryAttributes::default().with_record_count(rows),
        )
        .await
        .unwrap();
    let entry = ledger.get(message_id).await.unwrap().unwrap();

    Harness {
        ctx,
        ledger,
        acks,
        target: AckTarget {
            message_id,
            file_key,
            created_at_formatted: entry.created_at_formatted(),
        },
    }
}

fn outcome(target: &AckTarget, ordinal: u64) -> RowOutcome {
    let result = if ordinal % 3 == 0 {
        OutcomeResult::Failure {
            error: ErrorKind::NotFound,
            diagnostics: "Immunization resource does not exist.\nID: x".to_string(),
            record_id: None,
        }
    } else {
        OutcomeResult::Success { record_id: None }
    };
    RowOutcome {
        row_id: row_id(target.message_id, ordinal),
        target: target.clone(),
        local_id: format!("V-{ordinal}^https://supplier/ids"),
        result,
    }
}

async fn forwarded_lines(h: &Harness) -> Vec<Vec<String>> {
    let data = h
        .ctx
        .storage
        .get_raw(&ScopedStorage::ack_forwarded_path(&h.target.bus_ack_name()))
        .await
        .unwrap();
    let text = String::from_utf8(data.to_vec()).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next().unwrap(), ACK_HEADERS.join("|"));
    lines.map(split_line).collect()
}

fn arb_delivery() -> impl Strategy<Value = (u64, Vec<u64>, usize)> {
    (1u64..30).prop_flat_map(|rows| {
        let order = Just((1..=rows).collect::<Vec<_>>()).prop_shuffle();
        let redelivered = prop::collection::vec(1..=rows, 0..10);
        (Just(rows), order, redelivered, 1usize..8).prop_map(|(rows, mut order, extra, chunk)| {
            order.extend(extra);
            (rows, order, chunk)
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn any_delivery_order_finalizes_once((rows, order, chunk) in arb_delivery()) {
        block_on(async {
            let h = harness(rows, 5).await;
            let mut finalized = 0;
            for ordinals in order.chunks(chunk) {
                let outcomes: Vec<RowOutcome> =
                    ordinals.iter().map(|n| outcome(&h.target, *n)).collect();
                h.acks.append(&h.target, &outcomes).await.unwrap();
                if matches!(
                    h.acks.finalize(&h.target).await.unwrap(),
                    FinalizeOutcome::Finalized { .. }
                ) {
                    finalized += 1;
                }
            }
            prop_assert_eq!(finalized, 1);

            let lines = forwarded_lines(&h).await;
            prop_assert_eq!(lines.len() as u64, rows);
            for (n, line) in lines.iter().enumerate() {
                prop_assert_eq!(&line[0], &row_id(h.target.message_id, n as u64 + 1));
                prop_assert_eq!(line.len(), ACK_HEADERS.len());
            }

            let entry = h.ledger.get(h.target.message_id).await.unwrap().unwrap();
            let failed = (1..=rows).filter(|n| n % 3 == 0).count() as u64;
            prop_assert_eq!(entry.status, FileStatus::Processed);
            prop_assert_eq!(entry.records_failed, Some(failed));
            prop_assert_eq!(entry.records_succeeded, Some(rows - failed));
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn finalize_waits_for_every_row() {
    let h = harness(3, 5).await;
    h.acks
        .append(&h.target, &[outcome(&h.target, 2), outcome(&h.target, 1)])
        .await
        .unwrap();
    assert_eq!(
        h.acks.finalize(&h.target).await.unwrap(),
        FinalizeOutcome::Incomplete {
            appended: 2,
            expected: Some(3),
        }
    );
    assert_eq!(
        h.ledger.get(h.target.message_id).await.unwrap().unwrap().status,
        FileStatus::Preprocessed
    );

    h.acks.append(&h.target, &[outcome(&h.target, 3)]).await.unwrap();
    assert_eq!(
        h.acks.finalize(&h.target).await.unwrap(),
        FinalizeOutcome::Finalized {
            succeeded: 2,
            failed: 1,
        }
    );
    assert_eq!(
        h.acks.finalize(&h.target).await.unwrap(),
        FinalizeOutcome::AlreadyFinalized
    );
    assert!(h.ctx.backend.paths_containing("ack/temp/").await.is_empty());
}

#[tokio::test]
async fn late_outcomes_after_finalize_are_dropped() {
    let h = harness(1, 5).await;
    h.acks.append(&h.target, &[outcome(&h.target, 1)]).await.unwrap();
    h.acks.finalize(&h.target).await.unwrap();

    let summary = h.acks.append(&h.target, &[outcome(&h.target, 1)]).await.unwrap();
    assert_eq!(summary.appended, 0);
    assert_eq!(forwarded_lines(&h).await.len(), 1);
}

#[tokio::test]
async fn concurrent_appends_lose_nothing() {
    let rows = 12;
    let h = harness(rows, 20).await;

    let appends = (1..=rows).map(|n| {
        let acks = h.acks.clone();
        let target = h.target.clone();
        async move {
            let row = outcome(&target, n);
            acks.append(&target, &[row]).await
        }
    });
    for result in futures::future::join_all(appends).await {
        result.unwrap();
    }

    assert!(matches!(
        h.acks.finalize(&h.target).await.unwrap(),
        FinalizeOutcome::Finalized { .. }
    ));
    let lines = forwarded_lines(&h).await;
    let ordinals: Vec<String> = lines.iter().map(|l| l[0].clone()).collect();
    let expected: Vec<String> = (1..=rows).map(|n| row_id(h.target.message_id, n)).collect();
    assert_eq!(ordinals, expected);
}

#[tokio::test]
async fn finalize_completes_on_retry_after_ledger_write_fails() {
    let h = harness(2, 5).await;
    h.acks
        .append(&h.target, &[outcome(&h.target, 1), outcome(&h.target, 2)])
        .await
        .unwrap();

    h.ctx.backend.fail_next_puts("ledger/entries/", 1);
    h.acks
        .finalize(&h.target)
        .await
        .expect_err("ledger update fails after the artifact is written");
    assert_eq!(
        h.ctx.backend.paths_containing("ack/forwarded/").await.len(),
        1
    );
    assert_eq!(
        h.ledger.get(h.target.message_id).await.unwrap().unwrap().status,
        FileStatus::Preprocessed
    );

    assert_eq!(
        h.acks.finalize(&h.target).await.unwrap(),
        FinalizeOutcome::AlreadyFinalized
    );
    let entry = h.ledger.get(h.target.message_id).await.unwrap().unwrap();
    assert_eq!(entry.status, FileStatus::Processed);
    assert_eq!(entry.records_succeeded, Some(2));
    assert_eq!(entry.records_failed, Some(0));
    assert!(h.ctx.backend.paths_containing("ack/temp/").await.is_empty());
    assert_eq!(forwarded_lines(&h).await.len(), 2);
}
