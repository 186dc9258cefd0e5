//! EventStore interface tests.
//!
//! These tests verify the contract of the EventStore trait.
//! Each storage implementation should run these tests. Stream ids are
//! random, so the suite can share one store with other tests.

use serde_json::json;
use uuid::Uuid;

use eventide::storage::shard::{replay_all, shard_for};
use eventide::storage::{EventStore, StorageError, TransactionState};
use eventide::{Event, Payload};

/// Unique stream id for one test.
pub fn stream(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

pub fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap_or_default()
}

pub fn make_event(stream_id: &str, event_id: u64) -> Event {
    Event::new(
        stream_id,
        event_id,
        format!("Event{}", event_id),
        payload(json!({ "n": event_id })),
    )
    .expect("valid event")
}

fn event_ids(events: &[Event]) -> Vec<u64> {
    events.iter().map(|e| e.event_id).collect()
}

// =============================================================================
// save tests
// =============================================================================

pub async fn test_save_sequential_revisions<S: EventStore>(store: &S) {
    let sid = stream("test_save_sequential");

    for revision in 0..3 {
        let event = store
            .save(&sid, revision, "Step", payload(json!({ "revision": revision })))
            .await
            .expect("save should succeed");
        assert_eq!(event.event_id, revision + 1);
    }

    let events = store.get_stream(&sid).await.expect("get_stream should succeed");
    assert_eq!(event_ids(&events), vec![1, 2, 3]);
    assert_eq!(events[2].payload, payload(json!({ "revision": 2 })));
}

pub async fn test_save_stale_revision_conflicts<S: EventStore>(store: &S) {
    let sid = stream("test_save_stale");
    store.save(&sid, 0, "Created", Payload::new()).await.unwrap();
    store.save(&sid, 1, "Updated", Payload::new()).await.unwrap();

    let err = store
        .save(&sid, 1, "Late", Payload::new())
        .await
        .expect_err("stale revision must conflict");
    assert!(
        matches!(err, StorageError::StreamRevisionConflict { event_id: 2, .. }),
        "unexpected error: {}",
        err
    );

    let events = store.get_stream(&sid).await.unwrap();
    assert_eq!(event_ids(&events), vec![1, 2]);
    assert_eq!(events[1].message, "Updated");
}

pub async fn test_save_rejects_gap<S: EventStore>(store: &S) {
    let sid = stream("test_save_gap");
    store.save(&sid, 0, "Created", Payload::new()).await.unwrap();

    let err = store.save(&sid, 5, "Skipped", Payload::new()).await.unwrap_err();
    assert!(matches!(err, StorageError::StreamRevisionConflict { .. }));

    // Revisions start at 1, so id 0 never fits.
    let err = store.save_event(make_event(&sid, 0)).await.unwrap_err();
    assert!(matches!(err, StorageError::StreamRevisionConflict { event_id: 0, .. }));
    assert_eq!(event_ids(&store.get_stream(&sid).await.unwrap()), vec![1]);
}

pub async fn test_save_strips_revision_hint<S: EventStore>(store: &S) {
    let sid = stream("test_save_hint");
    let saved = store
        .save(&sid, 0, "Created", payload(json!({ "_revisionId": 7, "name": "x" })))
        .await
        .unwrap();
    assert_eq!(saved.payload, payload(json!({ "name": "x" })));

    let events = store.get_stream(&sid).await.unwrap();
    assert_eq!(events[0].payload, payload(json!({ "name": "x" })));
}

pub async fn test_save_invalid_arguments<S: EventStore>(store: &S) {
    assert!(matches!(
        store.save("", 0, "Created", Payload::new()).await,
        Err(StorageError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.save(&stream("test_invalid"), 0, "", Payload::new()).await,
        Err(StorageError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.get_stream("").await,
        Err(StorageError::InvalidArgument(_))
    ));
}

pub async fn test_concurrent_saves_single_winner<S: EventStore>(store: &S) {
    let sid = stream("test_concurrent");
    store.save(&sid, 0, "Created", Payload::new()).await.unwrap();

    let attempts = (0..5).map(|i| store.save(&sid, 1, "Raced", payload(json!({ "writer": i }))));
    let results = futures::future::join_all(attempts).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(StorageError::StreamRevisionConflict { .. })))
        .count();
    assert_eq!(winners, 1, "exactly one writer may win");
    assert_eq!(conflicts, 4);
    assert_eq!(store.get_stream(&sid).await.unwrap().len(), 2);
}

pub async fn test_save_events_stops_at_first_failure<S: EventStore>(store: &S) {
    let sid = stream("test_save_events");
    let err = store
        .save_events(vec![
            make_event(&sid, 1),
            make_event(&sid, 2),
            make_event(&sid, 4),
            make_event(&sid, 5),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::StreamRevisionConflict { event_id: 4, .. }));
    assert_eq!(event_ids(&store.get_stream(&sid).await.unwrap()), vec![1, 2]);
}

// =============================================================================
// get_stream tests
// =============================================================================

pub async fn test_get_stream_empty<S: EventStore>(store: &S) {
    let events = store.get_stream(&stream("test_never_written")).await.unwrap();
    assert!(events.is_empty());
}

pub async fn test_get_stream_preserves_event<S: EventStore>(store: &S) {
    let sid = stream("test_preserve");
    let event = Event::new(
        &sid,
        1,
        "OrderCreated",
        payload(json!({ "total": 12.5, "lines": [{ "sku": "a" }], "paid": false })),
    )
    .unwrap();
    store.save_event(event.clone()).await.unwrap();

    let events = store.get_stream(&sid).await.unwrap();
    assert_eq!(events, vec![event]);
}

// =============================================================================
// transaction tests
// =============================================================================

pub async fn test_transaction_commits_all_streams<S: EventStore>(store: &S) {
    let a = stream("test_tx_a");
    let b = stream("test_tx_b");

    let mut tx = store.start_transaction();
    tx.save_events(vec![make_event(&a, 1), make_event(&a, 2)]).unwrap();
    tx.save_event(make_event(&b, 1)).unwrap();
    tx.commit().await.expect("commit should succeed");
    assert_eq!(tx.state(), TransactionState::Committed);

    assert_eq!(event_ids(&store.get_stream(&a).await.unwrap()), vec![1, 2]);
    assert_eq!(event_ids(&store.get_stream(&b).await.unwrap()), vec![1]);
}

pub async fn test_transaction_is_all_or_nothing<S: EventStore>(store: &S) {
    let a = stream("test_tx_atomic_a");
    let b = stream("test_tx_atomic_b");
    store.save(&b, 0, "Created", Payload::new()).await.unwrap();

    let mut tx = store.start_transaction();
    tx.save_events(vec![make_event(&a, 1), make_event(&b, 1)]).unwrap();
    let err = store.commit_transaction(&tx).await.unwrap_err();
    assert!(matches!(err, StorageError::TransactionConflict(_)));

    assert!(store.get_stream(&a).await.unwrap().is_empty());
    assert_eq!(store.get_stream(&b).await.unwrap().len(), 1);
}

pub async fn test_transaction_recommit_conflicts<S: EventStore>(store: &S) {
    let sid = stream("test_tx_recommit");
    let mut tx = store.start_transaction();
    tx.save_events(vec![make_event(&sid, 1), make_event(&sid, 2)]).unwrap();

    store.commit_transaction(&tx).await.unwrap();
    assert_eq!(event_ids(&store.get_stream(&sid).await.unwrap()), vec![1, 2]);

    let err = store.commit_transaction(&tx).await.unwrap_err();
    assert!(matches!(err, StorageError::TransactionConflict(_)));
    assert_eq!(store.get_stream(&sid).await.unwrap().len(), 2);

    let mut next = store.start_transaction();
    next.save_event(make_event(&sid, 3)).unwrap();
    next.commit().await.unwrap();
    let err = next.commit().await.unwrap_err();
    assert!(matches!(err, StorageError::TransactionConflict(_)));
    assert_eq!(event_ids(&store.get_stream(&sid).await.unwrap()), vec![1, 2, 3]);
}

pub async fn test_transaction_requires_consecutive_ids<S: EventStore>(store: &S) {
    let sid = stream("test_tx_consecutive");
    let mut tx = store.start_transaction();
    tx.save_events(vec![make_event(&sid, 1), make_event(&sid, 3)]).unwrap();

    let err = store.commit_transaction(&tx).await.unwrap_err();
    assert!(matches!(err, StorageError::TransactionInvalid(_)));
    assert!(store.get_stream(&sid).await.unwrap().is_empty());
}

pub async fn test_transaction_respects_max_size<S: EventStore>(store: &S) {
    let max = store.transaction_max_size();
    if max > 1000 {
        // Effectively unbounded.
        return;
    }
    let sid = stream("test_tx_max");
    let mut tx = store.start_transaction();
    let events: Vec<Event> = (1..=max as u64).map(|i| make_event(&sid, i)).collect();
    assert_eq!(tx.save_events(events).unwrap(), max);

    let err = tx.save_event(make_event(&sid, max as u64 + 1)).unwrap_err();
    assert!(matches!(err, StorageError::TransactionTooLarge { .. }));
    assert_eq!(tx.len(), max);
}

// =============================================================================
// replay tests
// =============================================================================

pub async fn test_replay_shard_contains_stream<S: EventStore>(store: &S) {
    let sid = stream("test_replay");
    for revision in 0..3 {
        store.save(&sid, revision, "Step", Payload::new()).await.unwrap();
    }

    let shard = shard_for(&sid);
    let events = store.replay_shard(shard).await.unwrap();
    assert!(events.iter().all(|e| shard_for(&e.stream_id) == shard));
    let ours: Vec<u64> = events
        .iter()
        .filter(|e| e.stream_id == sid)
        .map(|e| e.event_id)
        .collect();
    assert_eq!(ours, vec![1, 2, 3]);

    let all = replay_all(store, 2).await.unwrap();
    assert_eq!(all.iter().filter(|e| e.stream_id == sid).count(), 3);
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all EventStore interface tests against a store implementation.
#[macro_export]
macro_rules! run_event_store_tests {
    ($store:expr) => {
        use $crate::storage::event_store_tests::*;

        // save tests
        test_save_sequential_revisions($store).await;
        println!("  test_save_sequential_revisions: PASSED");

        test_save_stale_revision_conflicts($store).await;
        println!("  test_save_stale_revision_conflicts: PASSED");

        test_save_rejects_gap($store).await;
        println!("  test_save_rejects_gap: PASSED");

        test_save_strips_revision_hint($store).await;
        println!("  test_save_strips_revision_hint: PASSED");

        test_save_invalid_arguments($store).await;
        println!("  test_save_invalid_arguments: PASSED");

        test_concurrent_saves_single_winner($store).await;
        println!("  test_concurrent_saves_single_winner: PASSED");

        test_save_events_stops_at_first_failure($store).await;
        println!("  test_save_events_stops_at_first_failure: PASSED");

        // get_stream tests
        test_get_stream_empty($store).await;
        println!("  test_get_stream_empty: PASSED");

        test_get_stream_preserves_event($store).await;
        println!("  test_get_stream_preserves_event: PASSED");

        // transaction tests
        test_transaction_commits_all_streams($store).await;
        println!("  test_transaction_commits_all_streams: PASSED");

        test_transaction_is_all_or_nothing($store).await;
        println!("  test_transaction_is_all_or_nothing: PASSED");

        test_transaction_recommit_conflicts($store).await;
        println!("  test_transaction_recommit_conflicts: PASSED");

        test_transaction_requires_consecutive_ids($store).await;
        println!("  test_transaction_requires_consecutive_ids: PASSED");

        test_transaction_respects_max_size($store).await;
        println!("  test_transaction_respects_max_size: PASSED");

        // replay tests
        test_replay_shard_contains_stream($store).await;
        println!("  test_replay_shard_contains_stream: PASSED");
    };
}
