//! EventBroker interface tests.
//!
//! These tests verify the delivery contract of the EventBroker trait.
//! Every test drains what it publishes, so the suite can run in sequence
//! against one queue. Visibility timeouts are short and the tests sleep
//! past them; run in-process brokers with a paused clock.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use eventide::broker::{start_poll, BrokerError, BrokerEvent, EventBroker, GetEventOptions};
use eventide::{Event, Payload};

/// Visibility timeout used by the suite.
pub const VISIBILITY: Duration = Duration::from_secs(1);

pub fn make_event(prefix: &str, event_id: u64) -> Event {
    let payload = json!({ "n": event_id })
        .as_object()
        .cloned()
        .unwrap_or_default();
    Event::new(
        format!("{}-{}", prefix, Uuid::new_v4()),
        event_id,
        "Happened",
        payload,
    )
    .expect("valid event")
}

fn short() -> GetEventOptions {
    GetEventOptions::count(10).with_visibility_timeout(VISIBILITY)
}

/// Remove everything currently visible.
pub async fn drain<B: EventBroker + ?Sized>(broker: &B) {
    loop {
        let batch = broker.get_event(short()).await.expect("get_event should succeed");
        if batch.is_empty() {
            return;
        }
        for message in &batch {
            broker.remove(message).await.expect("remove should succeed");
        }
    }
}

// =============================================================================
// publish / get_event tests
// =============================================================================

pub async fn test_get_event_empty<B: EventBroker + ?Sized>(broker: &B) {
    let messages = broker.get_event(short()).await.unwrap();
    assert!(messages.is_empty());
}

pub async fn test_publish_then_get<B: EventBroker + ?Sized>(broker: &B) {
    let event = make_event("test_publish", 1);
    broker.publish(&event).await.expect("publish should succeed");

    let messages = broker.get_event(short()).await.unwrap();
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.stream_id, event.stream_id);
    assert_eq!(message.event_id, 1);
    assert_eq!(message.message, "Happened");
    assert_eq!(message.payload, event.payload);
    assert!(!message.receipt_handle.is_empty());
    assert!(!message.message_id.is_empty());

    broker.remove(message).await.unwrap();
    assert!(broker.get_event(short()).await.unwrap().is_empty());
}

pub async fn test_publish_rejects_malformed_event<B: EventBroker + ?Sized>(broker: &B) {
    let mut event = make_event("test_malformed", 1);
    event.message = String::new();

    let err = broker.publish(&event).await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidEvent(_)), "unexpected error: {}", err);
}

pub async fn test_get_event_respects_count<B: EventBroker + ?Sized>(broker: &B) {
    for i in 1..=3 {
        broker.publish(&make_event("test_count", i)).await.unwrap();
    }

    let first = broker
        .get_event(GetEventOptions::count(2).with_visibility_timeout(VISIBILITY))
        .await
        .unwrap();
    assert!(!first.is_empty() && first.len() <= 2);
    for message in &first {
        broker.remove(message).await.unwrap();
    }
    drain(broker).await;
}

// =============================================================================
// visibility tests
// =============================================================================

pub async fn test_retrieved_message_is_hidden<B: EventBroker + ?Sized>(broker: &B) {
    broker.publish(&make_event("test_hidden", 1)).await.unwrap();

    let first = broker.get_event(short()).await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(
        broker.get_event(short()).await.unwrap().is_empty(),
        "message must stay hidden during its visibility timeout"
    );

    broker.remove(&first[0]).await.unwrap();
}

pub async fn test_unremoved_message_is_redelivered<B: EventBroker + ?Sized>(broker: &B) {
    let event = make_event("test_redelivery", 7);
    broker.publish(&event).await.unwrap();

    let first = broker.get_event(short()).await.unwrap();
    assert_eq!(first.len(), 1);

    tokio::time::sleep(VISIBILITY * 2).await;

    let second = broker.get_event(short()).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].stream_id, event.stream_id);
    assert_eq!(second[0].event_id, 7);
    assert_eq!(second[0].message_id, first[0].message_id);
    assert_ne!(second[0].receipt_handle, first[0].receipt_handle);

    broker.destroy_event(&second[0]).await.unwrap();
}

pub async fn test_removed_message_is_not_redelivered<B: EventBroker + ?Sized>(broker: &B) {
    broker.publish(&make_event("test_removed", 1)).await.unwrap();

    let messages = broker.get_event(short()).await.unwrap();
    broker.destroy_event(&messages[0]).await.unwrap();

    tokio::time::sleep(VISIBILITY * 2).await;
    assert!(broker.get_event(short()).await.unwrap().is_empty());
}

pub async fn test_ignored_message_is_redelivered<B: EventBroker + ?Sized>(broker: &B) {
    broker.publish(&make_event("test_ignored", 1)).await.unwrap();

    let messages = broker.get_event(short()).await.unwrap();
    broker.ignore_event(&messages[0]).await.unwrap();
    assert!(broker.get_event(short()).await.unwrap().is_empty());

    tokio::time::sleep(VISIBILITY * 2).await;
    let again = broker.get_event(short()).await.unwrap();
    assert_eq!(again.len(), 1);
    broker.remove(&again[0]).await.unwrap();
}

pub async fn test_settling_requires_receipt<B: EventBroker + ?Sized>(broker: &B) {
    let unreceived = BrokerEvent::new(make_event("test_receipt", 1), "", "");

    assert!(matches!(
        broker.hide(&unreceived).await,
        Err(BrokerError::InvalidEvent(_))
    ));
    assert!(matches!(
        broker.remove(&unreceived).await,
        Err(BrokerError::InvalidEvent(_))
    ));
}

pub async fn test_subscribe_rejects_empty_topic<B: EventBroker + ?Sized>(broker: &B) {
    assert!(matches!(
        broker.subscribe("").await,
        Err(BrokerError::InvalidArgument(_))
    ));
}

// =============================================================================
// poll tests
// =============================================================================

pub async fn test_poll_delivers_published_events(broker: Arc<dyn EventBroker>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Payload>();
    let settle = broker.clone();
    let handle = start_poll(
        broker.clone(),
        short(),
        move |result: eventide::broker::Result<Vec<BrokerEvent>>| {
            let settle = settle.clone();
            let tx = tx.clone();
            async move {
                for message in result.unwrap_or_default() {
                    settle.remove(&message).await.unwrap();
                    let _ = tx.send(message.event.payload.clone());
                }
            }
        },
        Duration::from_millis(200),
    );

    for i in 1..=2 {
        broker.publish(&make_event("test_poll", i)).await.unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 2 {
        let payload = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("poll should deliver within the timeout")
            .expect("handler channel open");
        received.push(payload);
    }
    assert_eq!(received.len(), 2);

    handle.shutdown().await;
    drain(broker.as_ref()).await;
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all EventBroker interface tests against a broker implementation.
///
/// Takes an `Arc` of the broker.
#[macro_export]
macro_rules! run_event_broker_tests {
    ($broker:expr) => {
        use $crate::broker::event_broker_tests::*;

        let broker: std::sync::Arc<dyn eventide::broker::EventBroker> = $broker;
        drain(broker.as_ref()).await;

        // publish / get_event tests
        test_get_event_empty(broker.as_ref()).await;
        println!("  test_get_event_empty: PASSED");

        test_publish_then_get(broker.as_ref()).await;
        println!("  test_publish_then_get: PASSED");

        test_publish_rejects_malformed_event(broker.as_ref()).await;
        println!("  test_publish_rejects_malformed_event: PASSED");

        test_get_event_respects_count(broker.as_ref()).await;
        println!("  test_get_event_respects_count: PASSED");

        // visibility tests
        test_retrieved_message_is_hidden(broker.as_ref()).await;
        println!("  test_retrieved_message_is_hidden: PASSED");

        test_unremoved_message_is_redelivered(broker.as_ref()).await;
        println!("  test_unremoved_message_is_redelivered: PASSED");

        test_removed_message_is_not_redelivered(broker.as_ref()).await;
        println!("  test_removed_message_is_not_redelivered: PASSED");

        test_ignored_message_is_redelivered(broker.as_ref()).await;
        println!("  test_ignored_message_is_redelivered: PASSED");

        test_settling_requires_receipt(broker.as_ref()).await;
        println!("  test_settling_requires_receipt: PASSED");

        test_subscribe_rejects_empty_topic(broker.as_ref()).await;
        println!("  test_subscribe_rejects_empty_topic: PASSED");

        // poll tests
        test_poll_delivers_published_events(broker.clone()).await;
        println!("  test_poll_delivers_published_events: PASSED");
    };
}
