//! In-memory EventBroker implementation.
//!
//! Messages wait in a FIFO queue. `get_event` moves a message in flight and
//! arms a timer that puts it back at the head of the queue unless `remove`
//! settles it first. Timer and `remove` race on one lock, and each acts only
//! if the in-flight entry still carries its receipt handle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    validate_broker_name, validate_publish, BrokerEvent, EventBroker, GetEventOptions, Result,
    TopicHub, TopicListener, DEFAULT_VISIBILITY_TIMEOUT,
};
use crate::event::Event;

#[derive(Debug, Clone)]
struct QueuedMessage {
    message_id: String,
    event: Event,
}

struct InFlight {
    message: QueuedMessage,
    receipt_handle: String,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct QueueState {
    visible: VecDeque<QueuedMessage>,
    in_flight: HashMap<String, InFlight>,
}

impl QueueState {
    fn enqueue(&mut self, event: Event) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.visible.push_back(QueuedMessage {
            message_id: message_id.clone(),
            event,
        });
        message_id
    }
}

/// Enqueues events emitted on a subscribed topic.
struct QueueListener {
    broker: String,
    state: Arc<Mutex<QueueState>>,
}

impl TopicListener for QueueListener {
    fn deliver(&self, event: &Event) {
        let message_id = self.state.lock().enqueue(event.clone());
        debug!(
            broker = %self.broker,
            message_id = %message_id,
            stream_id = %event.stream_id,
            event_id = event.event_id,
            "Enqueued event from topic"
        );
    }
}

/// In-memory event broker.
pub struct InMemoryEventBroker {
    name: String,
    hub: TopicHub,
    visibility_timeout: Duration,
    state: Arc<Mutex<QueueState>>,
    topics: Mutex<HashSet<String>>,
}

impl InMemoryEventBroker {
    /// Create a broker that subscribes through `hub`.
    pub fn new(name: impl Into<String>, hub: TopicHub) -> Result<Self> {
        let name = name.into();
        validate_broker_name(&name)?;
        Ok(Self {
            name,
            hub,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            state: Arc::new(Mutex::new(QueueState::default())),
            topics: Mutex::new(HashSet::new()),
        })
    }

    /// Set the default visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Events currently visible, in delivery order.
    pub fn pending(&self) -> Vec<Event> {
        self.state
            .lock()
            .visible
            .iter()
            .map(|m| m.event.clone())
            .collect()
    }

    /// Number of retrieved messages not yet removed or redelivered.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Drop every message and cancel all visibility timers.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        for (_, entry) in state.in_flight.drain() {
            entry.timer.abort();
        }
        state.visible.clear();
        debug!(broker = %self.name, "Broker reset");
    }

    /// Arm the timer that returns a message to the queue head.
    fn arm_timer(&self, message_id: String, receipt_handle: String, timeout: Duration) -> JoinHandle<()> {
        let state = Arc::downgrade(&self.state);
        let broker = self.name.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut state = state.lock();
            let expired = matches!(
                state.in_flight.get(&message_id),
                Some(entry) if entry.receipt_handle == receipt_handle
            );
            if expired {
                if let Some(entry) = state.in_flight.remove(&message_id) {
                    warn!(
                        broker = %broker,
                        message_id = %message_id,
                        stream_id = %entry.message.event.stream_id,
                        event_id = entry.message.event.event_id,
                        "Visibility timeout expired, message redelivered"
                    );
                    state.visible.push_front(entry.message);
                }
            }
        })
    }
}

impl Drop for InMemoryEventBroker {
    fn drop(&mut self) {
        for entry in self.state.lock().in_flight.values() {
            entry.timer.abort();
        }
    }
}

#[async_trait]
impl EventBroker for InMemoryEventBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        validate_publish(event)?;
        let message_id = self.state.lock().enqueue(event.clone());
        debug!(
            broker = %self.name,
            message_id = %message_id,
            stream_id = %event.stream_id,
            event_id = event.event_id,
            "Published event"
        );
        Ok(())
    }

    async fn get_event(&self, options: GetEventOptions) -> Result<Vec<BrokerEvent>> {
        let timeout = options.visibility_timeout.unwrap_or(self.visibility_timeout);
        let mut state = self.state.lock();
        let mut delivered = Vec::new();

        while delivered.len() < options.effective_count() {
            let Some(message) = state.visible.pop_front() else {
                break;
            };
            let receipt_handle = Uuid::new_v4().to_string();
            let timer = self.arm_timer(message.message_id.clone(), receipt_handle.clone(), timeout);

            delivered.push(BrokerEvent::new(
                message.event.clone(),
                receipt_handle.clone(),
                message.message_id.clone(),
            ));
            state.in_flight.insert(
                message.message_id.clone(),
                InFlight {
                    message,
                    receipt_handle,
                    timer,
                },
            );
        }

        if !delivered.is_empty() {
            debug!(
                broker = %self.name,
                count = delivered.len(),
                visibility_timeout_ms = timeout.as_millis() as u64,
                "Delivered messages"
            );
        }
        Ok(delivered)
    }

    async fn hide(&self, event: &BrokerEvent) -> Result<()> {
        event.require_receipt()?;
        debug!(broker = %self.name, message_id = %event.message_id, "Message left for redelivery");
        Ok(())
    }

    async fn remove(&self, event: &BrokerEvent) -> Result<()> {
        event.require_receipt()?;
        let mut state = self.state.lock();

        let current = matches!(
            state.in_flight.get(&event.message_id),
            Some(entry) if entry.receipt_handle == event.receipt_handle
        );
        if !current {
            debug!(
                broker = %self.name,
                message_id = %event.message_id,
                "Stale receipt handle, nothing removed"
            );
            return Ok(());
        }

        if let Some(entry) = state.in_flight.remove(&event.message_id) {
            entry.timer.abort();
        }
        debug!(
            broker = %self.name,
            message_id = %event.message_id,
            stream_id = %event.event.stream_id,
            event_id = event.event.event_id,
            "Removed message"
        );
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        if topic.is_empty() {
            return Err(super::BrokerError::InvalidArgument(
                "topic must be a non-empty string".to_string(),
            ));
        }
        if !self.topics.lock().insert(topic.to_string()) {
            debug!(broker = %self.name, topic = %topic, "Already subscribed");
            return Ok(());
        }
        self.hub.listen(
            topic,
            Arc::new(QueueListener {
                broker: self.name.clone(),
                state: self.state.clone(),
            }),
        );
        debug!(broker = %self.name, topic = %topic, "Subscribed to topic");
        Ok(())
    }
}
