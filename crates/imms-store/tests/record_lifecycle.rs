//! Lifecycle, concurrency and index behaviour of the record store.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use imms_core::{RecordId, WritePrecondition};
use imms_store::{
    ChangeNotification, ChangeOperation, ChangeSink, ErrorKind, ExternalIdentifier,
    InMemoryChangeFeed, LifecycleState, RecordPayload, RecordStore, RecordStoreConfig, StoreError,
};
use imms_test_utils::{TestContext, assert_no_writes, count_puts};

const SUBMITTER: &str = "EMIS";

fn payload(value: &str, subject: &str, category: &str) -> RecordPayload {
    RecordPayload {
        external_identifier: ExternalIdentifier::new("https://supplierABC/identifiers/vacc", value),
        subject_key: subject.to_string(),
        category: category.to_string(),
        body: serde_json::json!({ "dose": 1, "value": value }),
    }
}

fn store(ctx: &TestContext) -> (RecordStore, Arc<InMemoryChangeFeed>) {
    let feed = Arc::new(InMemoryChangeFeed::new());
    (RecordStore::new(ctx.storage.clone(), feed.clone()), feed)
}

#[tokio::test]
async fn create_assigns_id_and_version_one() {
    let ctx = TestContext::new();
    let (store, feed) = store(&ctx);

    let id = store
        .create(payload("u1", "9000000009", "COVID"), SUBMITTER)
        .await
        .expect("create");

    let record = store.read(id, false).await.expect("read");
    assert_eq!(record.version, 1);
    assert_eq!(record.lifecycle_state, LifecycleState::Active);
    assert_eq!(record.submitter_system, SUBMITTER);

    let changes = feed.drain().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].operation, ChangeOperation::Create);
    assert_eq!(changes[0].record_id, id);
    assert!(changes[0].before.is_none());
}

#[tokio::test]
async fn duplicate_identifier_persists_nothing() {
    let ctx = TestContext::new();
    let (store, feed) = store(&ctx);
    store
        .create(payload("dup", "9000000009", "COVID"), SUBMITTER)
        .await
        .expect("first create");
    feed.drain().unwrap();
    ctx.backend.clear_operations();

    let err = store
        .create(payload("dup", "9000000001", "FLU"), SUBMITTER)
        .await
        .expect_err("second create must fail");
    assert_eq!(err.kind(), ErrorKind::DuplicateIdentifier);

    let ops = ctx.backend.operations();
    assert_eq!(count_puts(&ops, "records/"), 0);
    assert_no_writes(&ops, "index/subject/");
    assert!(feed.is_empty().unwrap());
}

#[tokio::test]
async fn deleted_records_still_block_duplicates() {
    let ctx = TestContext::new();
    let (store, _) = store(&ctx);
    let id = store
        .create(payload("gone", "9000000009", "COVID"), SUBMITTER)
        .await
        .unwrap();
    store.delete(id, SUBMITTER).await.unwrap();

    let err = store
        .create(payload("gone", "9000000009", "COVID"), SUBMITTER)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateIdentifier { .. }));
}

#[tokio::test]
async fn stale_update_leaves_record_unchanged() {
    let ctx = TestContext::new();
    let (store, feed) = store(&ctx);
    let id = store
        .create(payload("u2", "9000000009", "COVID"), SUBMITTER)
        .await
        .unwrap();
    feed.drain().unwrap();

    let mut changed = payload("u2", "9000000009", "COVID");
    changed.body = serde_json::json!({ "dose": 2 });
    let err = store.update(id, changed, 5, SUBMITTER).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::VersionConflict {
            expected: 5,
            actual: 1,
            ..
        }
    ));

    let record = store.read(id, false).await.unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(record.payload.body["dose"], 1);
    assert!(feed.is_empty().unwrap());
}

#[tokio::test]
async fn update_rejects_changed_identifier() {
    let ctx = TestContext::new();
    let (store, _) = store(&ctx);
    let id = store
        .create(payload("u3", "9000000009", "COVID"), SUBMITTER)
        .await
        .unwrap();

    let err = store
        .update(id, payload("other", "9000000009", "COVID"), 1, SUBMITTER)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InconsistentIdentifier);
}

#[tokio::test]
async fn update_and_delete_of_unknown_id_are_not_found() {
    let ctx = TestContext::new();
    let (store, _) = store(&ctx);
    let id = RecordId::generate();

    let err = store
        .update(id, payload("x", "9000000009", "COVID"), 1, SUBMITTER)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(
        store.delete(id, SUBMITTER).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(store.read(id, true).await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn delete_is_idempotent_and_keeps_version() {
    let ctx = TestContext::new();
    let (store, feed) = store(&ctx);
    let id = store
        .create(payload("d1", "9000000009", "COVID"), SUBMITTER)
        .await
        .unwrap();
    store
        .update(id, payload("d1", "9000000009", "COVID"), 1, SUBMITTER)
        .await
        .unwrap();

    store.delete(id, SUBMITTER).await.expect("first delete");
    store.delete(id, SUBMITTER).await.expect("second delete is a no-op");

    assert_eq!(store.read(id, false).await.unwrap_err().kind(), ErrorKind::NotFound);
    let tombstone = store.read(id, true).await.unwrap();
    assert_eq!(tombstone.lifecycle_state, LifecycleState::Deleted);
    assert_eq!(tombstone.version, 2);
    assert!(tombstone.deleted_at.is_some());

    let ops: Vec<_> = feed
        .drain()
        .unwrap()
        .into_iter()
        .map(|c| c.operation)
        .collect();
    assert_eq!(
        ops,
        vec![
            ChangeOperation::Create,
            ChangeOperation::Update,
            ChangeOperation::Delete
        ]
    );
}

#[tokio::test]
async fn update_of_deleted_record_reinstates() {
    let ctx = TestContext::new();
    let (store, _) = store(&ctx);
    let id = store
        .create(payload("r1", "9000000009", "COVID"), SUBMITTER)
        .await
        .unwrap();
    store.delete(id, SUBMITTER).await.unwrap();

    let version = store
        .update(id, payload("r1", "9000000009", "COVID"), 1, "TPP")
        .await
        .expect("reinstate");
    assert_eq!(version, 2);

    let record = store.read(id, false).await.expect("reinstated reads as live");
    assert_eq!(record.lifecycle_state, LifecycleState::Reinstated);
    assert!(record.deleted_at.is_none());
    assert_eq!(record.submitter_system, "TPP");

    // Version checks still apply after reinstatement.
    let err = store
        .update(id, payload("r1", "9000000009", "COVID"), 1, SUBMITTER)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VersionConflict);
    assert_eq!(
        store
            .update(id, payload("r1", "9000000009", "COVID"), 2, SUBMITTER)
            .await
            .unwrap(),
        3
    );

    // A reinstated record can be deleted again.
    store.delete(id, SUBMITTER).await.unwrap();
    assert_eq!(store.read(id, true).await.unwrap().version, 3);
}

#[tokio::test]
async fn concurrent_updates_admit_exactly_one_winner() {
    let ctx = TestContext::new();
    let (store, _) = store(&ctx);
    let id = store
        .create(payload("c1", "9000000009", "COVID"), SUBMITTER)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for n in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut p = payload("c1", "9000000009", "COVID");
            p.body = serde_json::json!({ "writer": n });
            store.update(id, p, 1, SUBMITTER).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(version) => {
                assert_eq!(version, 2);
                winners += 1;
            }
            Err(err) => assert_eq!(err.kind(), ErrorKind::VersionConflict),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.read(id, false).await.unwrap().version, 2);
}

#[tokio::test]
async fn concurrent_creates_bind_identifier_once() {
    let ctx = TestContext::new();
    let (store, _) = store(&ctx);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .create(payload("race", "9000000009", "COVID"), SUBMITTER)
                .await
        }));
    }

    let mut created = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(id) => created.push(id),
            Err(err) => assert_eq!(err.kind(), ErrorKind::DuplicateIdentifier),
        }
    }
    assert_eq!(created.len(), 1);

    let found = store
        .find_by_external_identifier(&ExternalIdentifier::new(
            "https://supplierABC/identifiers/vacc",
            "race",
        ))
        .await
        .unwrap()
        .expect("bound record");
    assert_eq!(found.id, created[0]);
}

#[tokio::test]
async fn find_by_identifier_returns_deleted_records() {
    let ctx = TestContext::new();
    let (store, _) = store(&ctx);
    let identifier = ExternalIdentifier::new("https://supplierABC/identifiers/vacc", "f1");
    assert!(store
        .find_by_external_identifier(&identifier)
        .await
        .unwrap()
        .is_none());

    let id = store
        .create(payload("f1", "9000000009", "COVID"), SUBMITTER)
        .await
        .unwrap();
    store.delete(id, SUBMITTER).await.unwrap();

    let found = store
        .find_by_external_identifier(&identifier)
        .await
        .unwrap()
        .expect("deleted record still found");
    assert_eq!(found.lifecycle_state, LifecycleState::Deleted);
}

#[tokio::test]
async fn subject_search_paginates_and_hides_deleted() {
    let ctx = TestContext::new();
    let feed = Arc::new(InMemoryChangeFeed::new());
    let store = RecordStore::new(ctx.storage.clone(), feed).with_config(RecordStoreConfig {
        page_size: 2,
        ..RecordStoreConfig::default()
    });

    let mut covid = Vec::new();
    for n in 0..5 {
        covid.push(
            store
                .create(payload(&format!("s{n}"), "9000000009", "COVID"), SUBMITTER)
                .await
                .unwrap(),
        );
    }
    let flu = store
        .create(payload("flu", "9000000009", "FLU"), SUBMITTER)
        .await
        .unwrap();
    store
        .create(payload("other", "9000000001", "COVID"), SUBMITTER)
        .await
        .unwrap();

    store.delete(covid[0], SUBMITTER).await.unwrap();
    store.delete(covid[1], SUBMITTER).await.unwrap();
    store
        .update(covid[1], payload("s1", "9000000009", "COVID"), 1, SUBMITTER)
        .await
        .unwrap();

    let mut found: Vec<_> = store
        .find_by_subject_and_category("9000000009", &["COVID", "FLU"])
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    found.sort();

    let mut expected = vec![covid[1], covid[2], covid[3], covid[4], flu];
    expected.sort();
    assert_eq!(found, expected);
}

#[tokio::test]
async fn moving_subject_drops_old_marker() {
    let ctx = TestContext::new();
    let (store, _) = store(&ctx);
    let id = store
        .create(payload("m1", "9000000009", "COVID"), SUBMITTER)
        .await
        .unwrap();

    store
        .update(id, payload("m1", "9000000001", "COVID"), 1, SUBMITTER)
        .await
        .unwrap();

    assert!(store
        .find_by_subject_and_category("9000000009", &["COVID"])
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        store
            .find_by_subject_and_category("9000000001", &["COVID"])
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn backend_failures_surface_unhandled() {
    let ctx = TestContext::new();
    let (store, feed) = store(&ctx);
    let id = store
        .create(payload("b1", "9000000009", "COVID"), SUBMITTER)
        .await
        .unwrap();
    feed.drain().unwrap();

    ctx.backend.fail_next_puts("records/", 1);
    let err = store
        .update(id, payload("b1", "9000000009", "COVID"), 1, SUBMITTER)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unhandled);
    assert_eq!(store.read(id, false).await.unwrap().version, 1);
    assert!(feed.is_empty().unwrap());
}

#[tokio::test]
async fn orphaned_claim_is_taken_over_once_stale() {
    let ctx = TestContext::new();
    let feed = Arc::new(InMemoryChangeFeed::new());
    let store = RecordStore::new(ctx.storage.clone(), feed).with_config(RecordStoreConfig {
        claim_stale_after: chrono::Duration::zero(),
        ..RecordStoreConfig::default()
    });

    // A crashed create left a claim behind without a record.
    ctx.storage
        .write_json(
            &imms_core::ScopedStorage::identifier_claim_path(
                "https://supplierABC/identifiers/vacc",
                "orphan",
            ),
            &serde_json::json!({
                "record_id": RecordId::generate(),
                "identifier": { "system": "https://supplierABC/identifiers/vacc", "value": "orphan" },
                "claimed_at": "2024-01-01T00:00:00Z",
            }),
            WritePrecondition::DoesNotExist,
        )
        .await
        .unwrap();

    let id = store
        .create(payload("orphan", "9000000009", "COVID"), SUBMITTER)
        .await
        .expect("stale claim is reusable");
    assert_eq!(store.read(id, false).await.unwrap().version, 1);
}

#[tokio::test]
async fn create_can_be_retried_after_record_write_fails() {
    let ctx = TestContext::new();
    let (store, feed) = store(&ctx);
    let first = payload("retry", "9000000009", "COVID");

    ctx.backend.fail_next_puts("/records/", 1);
    let err = store
        .create(first.clone(), SUBMITTER)
        .await
        .expect_err("record write fails");
    assert_eq!(err.kind(), ErrorKind::Unhandled);
    assert!(store
        .find_by_external_identifier(&first.external_identifier)
        .await
        .unwrap()
        .is_none());
    assert!(ctx.backend.paths_containing("index/identifier/").await.is_empty());
    assert!(feed.is_empty().unwrap());

    let id = store.create(first, SUBMITTER).await.expect("retried create");
    assert_eq!(store.read(id, false).await.unwrap().version, 1);
    assert_eq!(feed.drain().unwrap().len(), 1);
}

/// Sink that rejects everything while `down` is set.
#[derive(Default)]
struct SwitchableSink {
    down: AtomicBool,
    accepted: Mutex<Vec<ChangeNotification>>,
}

#[async_trait]
impl ChangeSink for SwitchableSink {
    async fn publish(&self, notification: ChangeNotification) -> imms_store::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::unhandled("change feed unavailable"));
        }
        self.accepted.lock().unwrap().push(notification);
        Ok(())
    }
}

#[tokio::test]
async fn undelivered_changes_wait_in_the_outbox() {
    let ctx = TestContext::new();
    let sink = Arc::new(SwitchableSink::default());
    sink.down.store(true, Ordering::SeqCst);
    let store = RecordStore::new(ctx.storage.clone(), sink.clone());

    let id = store
        .create(payload("pending", "9000000009", "COVID"), SUBMITTER)
        .await
        .expect("commit stands without the feed");
    store
        .update(id, payload("pending", "9000000001", "COVID"), 1, SUBMITTER)
        .await
        .expect("update");
    assert_eq!(store.pending_change_count().await.unwrap(), 2);
    assert!(sink.accepted.lock().unwrap().is_empty());

    assert_eq!(store.publish_pending().await.unwrap(), 0);
    assert_eq!(store.pending_change_count().await.unwrap(), 2);

    sink.down.store(false, Ordering::SeqCst);
    assert_eq!(store.publish_pending().await.unwrap(), 2);
    assert_eq!(store.pending_change_count().await.unwrap(), 0);

    let accepted = sink.accepted.lock().unwrap().clone();
    let operations: Vec<ChangeOperation> = accepted.iter().map(|n| n.operation).collect();
    assert_eq!(operations, vec![ChangeOperation::Create, ChangeOperation::Update]);
    assert!(accepted.iter().all(|n| n.record_id == id));
    assert_ne!(accepted[0].event_id, accepted[1].event_id);
}

#[tokio::test]
async fn later_commits_queue_behind_an_undelivered_one() {
    let ctx = TestContext::new();
    let sink = Arc::new(SwitchableSink::default());
    let store = RecordStore::new(ctx.storage.clone(), sink.clone());

    sink.down.store(true, Ordering::SeqCst);
    let id = store
        .create(payload("ordered", "9000000009", "COVID"), SUBMITTER)
        .await
        .unwrap();
    sink.down.store(false, Ordering::SeqCst);

    // Delivering the delete also flushes the create ahead of it.
    store.delete(id, SUBMITTER).await.unwrap();
    let operations: Vec<ChangeOperation> = sink
        .accepted
        .lock()
        .unwrap()
        .iter()
        .map(|n| n.operation)
        .collect();
    assert_eq!(operations, vec![ChangeOperation::Create, ChangeOperation::Delete]);
    assert_eq!(store.pending_change_count().await.unwrap(), 0);
}

#[tokio::test]
async fn unrecorded_change_is_an_error() {
    let ctx = TestContext::new();
    let (store, feed) = store(&ctx);
    let lost = payload("lost", "9000000009", "COVID");

    ctx.backend.fail_next_puts("changes/pending/", 1);
    let err = store
        .create(lost.clone(), SUBMITTER)
        .await
        .expect_err("outbox write fails");
    assert!(matches!(err, StoreError::ChangeNotRecorded { .. }));
    assert_eq!(err.kind(), ErrorKind::Unhandled);

    // The record write itself stands.
    assert!(store
        .find_by_external_identifier(&lost.external_identifier)
        .await
        .unwrap()
        .is_some());
    assert!(feed.is_empty().unwrap());
}
