//! Event broker for at-least-once delivery.
//!
//! This module contains:
//! - `EventBroker` trait: publish, visibility-timeout retrieval, hide/remove,
//!   topic subscription
//! - `BrokerEvent`: an event plus the delivery metadata needed to settle it
//! - `TopicHub`: explicit in-process topic fan-out
//! - Polling (`start_poll` / `stop_poll`)
//! - Broker configuration types and the `init_event_broker` factory
//! - Implementations: in-memory, SQS

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::event::Event;

pub mod memory;
pub mod poll;
pub mod topics;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use memory::InMemoryEventBroker;
pub use poll::{start_poll, stop_poll, PollHandle, PollHandler, DEFAULT_POLL_INTERVAL};
#[cfg(feature = "sqs")]
pub use sqs::SqsEventBroker;
pub use topics::{TopicForwarder, TopicHub, TopicListener};

/// Visibility timeout used when `GetEventOptions` does not set one.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(15);

// ============================================================================
// Traits
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Remove failed: {0}")]
    Remove(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An event retrieved from a broker.
///
/// `receipt_handle` identifies this particular delivery and is what `remove`
/// acts on. A redelivered message gets a new handle, so settling with an old
/// one has no effect.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerEvent {
    pub event: Event,
    pub receipt_handle: String,
    pub message_id: String,
}

impl BrokerEvent {
    pub fn new(
        event: Event,
        receipt_handle: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            event,
            receipt_handle: receipt_handle.into(),
            message_id: message_id.into(),
        }
    }

    /// Fail with `InvalidEvent` unless this came from `get_event`.
    pub fn require_receipt(&self) -> Result<()> {
        if self.receipt_handle.is_empty() {
            return Err(BrokerError::InvalidEvent(format!(
                "event {}:{} has no receipt handle; it was not retrieved from a broker",
                self.event.stream_id, self.event.event_id
            )));
        }
        Ok(())
    }
}

impl std::ops::Deref for BrokerEvent {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.event
    }
}

/// Options for `EventBroker::get_event`.
#[derive(Debug, Clone)]
pub struct GetEventOptions {
    /// Maximum number of messages to retrieve. Zero is treated as one.
    pub count: usize,
    /// How long retrieved messages stay hidden. Backend default if unset.
    pub visibility_timeout: Option<Duration>,
}

impl Default for GetEventOptions {
    fn default() -> Self {
        Self {
            count: 1,
            visibility_timeout: None,
        }
    }
}

impl GetEventOptions {
    pub fn count(count: usize) -> Self {
        Self {
            count,
            ..Default::default()
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    /// Requested count, at least one.
    pub fn effective_count(&self) -> usize {
        self.count.max(1)
    }
}

/// Interface for event delivery with visibility-timeout semantics.
///
/// Delivery is at-least-once: a retrieved message that is not removed within
/// its visibility timeout is delivered again. Consumers must be idempotent
/// on `(stream_id, event_id)`.
///
/// Implementations:
/// - `InMemoryEventBroker`: in-process queue with real timers
/// - `SqsEventBroker`: SQS queue bound to SNS topics
#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Broker name. Backend resource names derive from it.
    fn name(&self) -> &str;

    /// Enqueue an event for delivery.
    async fn publish(&self, event: &Event) -> Result<()>;

    /// Retrieve up to `options.count` visible messages, hiding each for the
    /// visibility timeout. Returns an empty vector when nothing is visible.
    async fn get_event(&self, options: GetEventOptions) -> Result<Vec<BrokerEvent>>;

    /// Reserved for extending a message's visibility timeout. Leaves the
    /// current timeout unchanged.
    async fn hide(&self, event: &BrokerEvent) -> Result<()>;

    /// Permanently delete a retrieved message.
    async fn remove(&self, event: &BrokerEvent) -> Result<()>;

    /// Receive every future publish addressed to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Leave a message for redelivery once its timeout expires.
    async fn ignore_event(&self, event: &BrokerEvent) -> Result<()> {
        self.hide(event).await
    }

    /// Settle a message for good.
    async fn destroy_event(&self, event: &BrokerEvent) -> Result<()> {
        self.remove(event).await
    }
}

/// Reject an empty broker name.
pub fn validate_broker_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BrokerError::InvalidArgument(
            "broker name must be a non-empty string".to_string(),
        ));
    }
    Ok(())
}

/// Check an event before it is enqueued.
pub fn validate_publish(event: &Event) -> Result<()> {
    event
        .validate()
        .map_err(|e| BrokerError::InvalidEvent(e.to_string()))
}

// ============================================================================
// Configuration
// ============================================================================

/// Broker type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// In-process queue.
    #[default]
    Memory,
    /// SQS queue with SNS topics.
    Sqs,
}

/// Broker configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker type discriminator.
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    /// Broker name. The queue is named `{name}Queue`.
    pub name: String,
    /// Default visibility timeout in milliseconds.
    pub visibility_timeout_ms: u64,
    /// SQS-specific configuration.
    pub sqs: SqsConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_type: BrokerType::Memory,
            name: "eventide".to_string(),
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT.as_millis() as u64,
            sqs: SqsConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Name of the backing queue.
    pub fn queue_name(&self) -> String {
        format!("{}Queue", self.name)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}

/// SQS-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqsConfig {
    /// AWS region. Uses default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack or testing).
    pub endpoint_url: Option<String>,
    /// Long-poll wait time in seconds.
    pub wait_time_secs: i32,
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            region: None,
            endpoint_url: None,
            wait_time_secs: 20,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the event broker selected by configuration.
///
/// The in-memory broker subscribes through `hub`; the SQS broker ignores it.
pub async fn init_event_broker(
    config: &BrokerConfig,
    hub: TopicHub,
) -> std::result::Result<Arc<dyn EventBroker>, Box<dyn std::error::Error + Send + Sync>> {
    match config.broker_type {
        BrokerType::Memory => {
            let broker = InMemoryEventBroker::new(&config.name, hub)?
                .with_visibility_timeout(config.visibility_timeout());
            info!(broker_type = "memory", name = %config.name, "Event broker initialized");
            Ok(Arc::new(broker))
        }
        BrokerType::Sqs => {
            #[cfg(feature = "sqs")]
            {
                let _ = hub;
                let broker = SqsEventBroker::new(config).await?;
                info!(broker_type = "sqs", queue = %config.queue_name(), "Event broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "sqs"))]
            {
                let _ = hub;
                tracing::error!("SQS broker requested but 'sqs' feature is not enabled");
                Err("SQS support requires the 'sqs' feature. Rebuild with --features sqs".into())
            }
        }
    }
}
