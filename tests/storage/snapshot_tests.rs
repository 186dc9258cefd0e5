//! Snapshot interface tests.
//!
//! These tests verify the snapshot half of the EventStore contract.

use serde_json::json;

use eventide::storage::{EventStore, StorageError};
use eventide::Payload;

use super::event_store_tests::{payload, stream};

pub async fn test_get_snapshot_missing<S: EventStore>(store: &S) {
    let snapshot = store
        .get_snapshot(&stream("test_snapshot_missing"))
        .await
        .expect("get_snapshot should succeed");
    assert!(snapshot.is_none());
}

pub async fn test_save_and_get_snapshot<S: EventStore>(store: &S) {
    let sid = stream("test_snapshot_roundtrip");
    let state = payload(json!({ "balance": 40, "owner": { "name": "ana" } }));
    store.save_snapshot(&sid, 3, state.clone()).await.unwrap();

    let snapshot = store.get_snapshot(&sid).await.unwrap().expect("snapshot exists");
    assert_eq!(snapshot.stream_id, sid);
    assert_eq!(snapshot.revision_id, 3);
    assert_eq!(snapshot.payload, state);
}

pub async fn test_latest_snapshot_wins<S: EventStore>(store: &S) {
    let sid = stream("test_snapshot_latest");
    store.save_snapshot(&sid, 5, payload(json!({ "v": 5 }))).await.unwrap();
    store.save_snapshot(&sid, 10, payload(json!({ "v": 10 }))).await.unwrap();
    // Saved out of order: still older than revision 10.
    store.save_snapshot(&sid, 7, payload(json!({ "v": 7 }))).await.unwrap();

    let snapshot = store.get_snapshot(&sid).await.unwrap().unwrap();
    assert_eq!(snapshot.revision_id, 10);
    assert_eq!(snapshot.payload, payload(json!({ "v": 10 })));
}

pub async fn test_snapshot_overwrite_same_revision<S: EventStore>(store: &S) {
    let sid = stream("test_snapshot_overwrite");
    store.save_snapshot(&sid, 2, payload(json!({ "v": "old" }))).await.unwrap();
    store.save_snapshot(&sid, 2, payload(json!({ "v": "new" }))).await.unwrap();

    let snapshot = store.get_snapshot(&sid).await.unwrap().unwrap();
    assert_eq!(snapshot.revision_id, 2);
    assert_eq!(snapshot.payload, payload(json!({ "v": "new" })));
}

pub async fn test_snapshots_isolated_by_stream<S: EventStore>(store: &S) {
    let a = stream("test_snapshot_a");
    let b = stream("test_snapshot_b");
    store.save_snapshot(&a, 1, payload(json!({ "who": "a" }))).await.unwrap();

    assert!(store.get_snapshot(&b).await.unwrap().is_none());
    assert_eq!(store.get_snapshot(&a).await.unwrap().unwrap().revision_id, 1);
}

pub async fn test_snapshot_requires_stream_id<S: EventStore>(store: &S) {
    let err = store.save_snapshot("", 1, Payload::new()).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidArgument(_)));
}

/// Run all snapshot interface tests against a store implementation.
#[macro_export]
macro_rules! run_snapshot_tests {
    ($store:expr) => {
        use $crate::storage::snapshot_tests::*;

        test_get_snapshot_missing($store).await;
        println!("  test_get_snapshot_missing: PASSED");

        test_save_and_get_snapshot($store).await;
        println!("  test_save_and_get_snapshot: PASSED");

        test_latest_snapshot_wins($store).await;
        println!("  test_latest_snapshot_wins: PASSED");

        test_snapshot_overwrite_same_revision($store).await;
        println!("  test_snapshot_overwrite_same_revision: PASSED");

        test_snapshots_isolated_by_stream($store).await;
        println!("  test_snapshots_isolated_by_stream: PASSED");

        test_snapshot_requires_stream_id($store).await;
        println!("  test_snapshot_requires_stream_id: PASSED");
    };
}
