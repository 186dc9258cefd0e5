//! AWS SQS event broker implementation.
//!
//! Each broker owns one SQS queue named `{name}Queue`. `subscribe` binds the
//! queue to an SNS topic with raw message delivery, so topic publishes land
//! in the queue as plain event JSON. Queues and topics may be created
//! elsewhere; this module only looks the queue up.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sns::Client as SnsClient;
use aws_sdk_sqs::types::{MessageAttributeValue, QueueAttributeName};
use aws_sdk_sqs::Client as SqsClient;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    validate_broker_name, validate_publish, BrokerConfig, BrokerError, BrokerEvent, EventBroker,
    GetEventOptions, Result,
};
use crate::event::Event;

/// Service limit for one `ReceiveMessage` call.
pub const MAX_RECEIVE_BATCH: usize = 10;

const STREAM_ID_ATTR: &str = "StreamId";
const EVENT_ID_ATTR: &str = "EventId";
const MESSAGE_ATTR: &str = "Message";

/// SQS-backed event broker.
pub struct SqsEventBroker {
    sqs: SqsClient,
    sns: SnsClient,
    name: String,
    queue_name: String,
    visibility_timeout: Duration,
    wait_time_secs: i32,
    /// Cached queue URL.
    queue_url: RwLock<Option<String>>,
    /// Cache of SNS topic ARNs by topic name.
    topic_arns: RwLock<HashMap<String, String>>,
    /// Topics the queue policy currently admits.
    subscribed: RwLock<Vec<String>>,
}

impl SqsEventBroker {
    /// Connect using the default AWS provider chain.
    pub async fn new(config: &BrokerConfig) -> Result<Self> {
        validate_broker_name(&config.name)?;

        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region) = config.sqs.region {
            aws_config_builder =
                aws_config_builder.region(aws_config::Region::new(region.clone()));
        }

        if let Some(ref endpoint) = config.sqs.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        info!(
            region = ?config.sqs.region,
            endpoint = ?config.sqs.endpoint_url,
            queue = %config.queue_name(),
            "Connected to AWS SQS"
        );

        Ok(Self {
            sqs: SqsClient::new(&aws_config),
            sns: SnsClient::new(&aws_config),
            name: config.name.clone(),
            queue_name: config.queue_name(),
            visibility_timeout: config.visibility_timeout(),
            wait_time_secs: config.sqs.wait_time_secs,
            queue_url: RwLock::new(None),
            topic_arns: RwLock::new(HashMap::new()),
            subscribed: RwLock::new(Vec::new()),
        })
    }

    /// Look up (and cache) the queue URL.
    async fn queue_url(&self) -> Result<String> {
        if let Some(url) = self.queue_url.read().await.as_ref() {
            return Ok(url.clone());
        }

        let result = self
            .sqs
            .get_queue_url()
            .queue_name(&self.queue_name)
            .send()
            .await
            .map_err(|e| BrokerError::Receive(format!("Failed to get SQS queue URL: {}", e)))?;

        let url = result
            .queue_url()
            .ok_or_else(|| BrokerError::Receive("SQS get_queue_url returned no URL".to_string()))?
            .to_string();

        *self.queue_url.write().await = Some(url.clone());
        debug!(queue = %self.queue_name, url = %url, "Resolved SQS queue");
        Ok(url)
    }

    /// Get or create an SNS topic ARN.
    async fn topic_arn(&self, topic: &str) -> Result<String> {
        if let Some(arn) = self.topic_arns.read().await.get(topic) {
            return Ok(arn.clone());
        }

        // create_topic is idempotent and returns the existing ARN.
        let result = self
            .sns
            .create_topic()
            .name(topic)
            .send()
            .await
            .map_err(|e| BrokerError::Subscribe(format!("Failed to create SNS topic: {}", e)))?;

        let arn = result
            .topic_arn()
            .ok_or_else(|| BrokerError::Subscribe("SNS create_topic returned no ARN".to_string()))?
            .to_string();

        self.topic_arns.write().await.insert(topic.to_string(), arn.clone());
        info!(topic = %topic, arn = %arn, "Created/found SNS topic");
        Ok(arn)
    }

    async fn queue_arn(&self, queue_url: &str) -> Result<String> {
        let attrs = self
            .sqs
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| BrokerError::Subscribe(format!("Failed to get queue ARN: {}", e)))?;

        attrs
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| BrokerError::Subscribe("Queue has no ARN attribute".to_string()))
    }
}

/// Number of messages to ask SQS for.
pub fn receive_batch_size(options: &GetEventOptions) -> i32 {
    options.effective_count().min(MAX_RECEIVE_BATCH) as i32
}

/// SQS visibility timeouts are whole seconds; sub-second remainders are dropped.
pub fn visibility_secs(timeout: Duration) -> i32 {
    timeout.as_secs().min(i32::MAX as u64) as i32
}

/// Queue policy letting each topic in `topic_arns` send to the queue.
pub fn queue_policy(queue_arn: &str, topic_arns: &[String]) -> serde_json::Value {
    let statements: Vec<serde_json::Value> = topic_arns
        .iter()
        .enumerate()
        .map(|(i, topic_arn)| {
            json!({
                "Sid": format!("topic-{}", i),
                "Effect": "Allow",
                "Principal": { "Service": "sns.amazonaws.com" },
                "Action": "sqs:SendMessage",
                "Resource": queue_arn,
                "Condition": { "ArnEquals": { "aws:SourceArn": topic_arn } }
            })
        })
        .collect();

    json!({
        "Version": "2012-10-17",
        "Statement": statements
    })
}

/// Rebuild a delivery from a received message.
pub fn to_broker_event(body: &str, receipt_handle: &str, message_id: &str) -> Result<BrokerEvent> {
    let event =
        Event::from_json(body).map_err(|e| BrokerError::InvalidEvent(format!("message {}: {}", message_id, e)))?;
    Ok(BrokerEvent::new(event, receipt_handle, message_id))
}

fn string_attribute(value: &str) -> Result<MessageAttributeValue> {
    MessageAttributeValue::builder()
        .data_type("String")
        .string_value(value)
        .build()
        .map_err(|e| BrokerError::Publish(format!("Failed to build attribute: {}", e)))
}

#[async_trait]
impl EventBroker for SqsEventBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        validate_publish(event)?;
        let queue_url = self.queue_url().await.map_err(|e| BrokerError::Publish(e.to_string()))?;

        let mut attrs = HashMap::new();
        attrs.insert(STREAM_ID_ATTR.to_string(), string_attribute(&event.stream_id)?);
        attrs.insert(EVENT_ID_ATTR.to_string(), string_attribute(&event.event_id.to_string())?);
        attrs.insert(MESSAGE_ATTR.to_string(), string_attribute(&event.message)?);

        let result = self
            .sqs
            .send_message()
            .queue_url(&queue_url)
            .message_body(event.to_json())
            .delay_seconds(0)
            .set_message_attributes(Some(attrs))
            .send()
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to send SQS message: {}", e)))?;

        debug!(
            broker = %self.name,
            message_id = ?result.message_id(),
            stream_id = %event.stream_id,
            event_id = event.event_id,
            "Published event to SQS"
        );
        Ok(())
    }

    async fn get_event(&self, options: GetEventOptions) -> Result<Vec<BrokerEvent>> {
        let queue_url = self.queue_url().await?;
        let timeout = options.visibility_timeout.unwrap_or(self.visibility_timeout);

        let result = self
            .sqs
            .receive_message()
            .queue_url(&queue_url)
            .max_number_of_messages(receive_batch_size(&options))
            .visibility_timeout(visibility_secs(timeout))
            .wait_time_seconds(self.wait_time_secs)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| BrokerError::Receive(format!("Failed to receive SQS messages: {}", e)))?;

        let mut delivered = Vec::new();
        for message in result.messages.unwrap_or_default() {
            let (Some(body), Some(receipt), Some(id)) =
                (message.body(), message.receipt_handle(), message.message_id())
            else {
                warn!(broker = %self.name, "Skipping SQS message without body or receipt handle");
                continue;
            };
            match to_broker_event(body, receipt, id) {
                Ok(event) => delivered.push(event),
                // Left in the queue; it reappears when its timeout expires.
                Err(e) => warn!(broker = %self.name, error = %e, "Skipping undecodable SQS message"),
            }
        }

        if !delivered.is_empty() {
            debug!(broker = %self.name, count = delivered.len(), "Received messages from SQS");
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
        let queue_url = self.queue_url().await.map_err(|e| BrokerError::Remove(e.to_string()))?;

        self.sqs
            .delete_message()
            .queue_url(&queue_url)
            .receipt_handle(&event.receipt_handle)
            .send()
            .await
            .map_err(|e| BrokerError::Remove(format!("Failed to delete SQS message: {}", e)))?;

        debug!(
            broker = %self.name,
            message_id = %event.message_id,
            stream_id = %event.event.stream_id,
            event_id = event.event.event_id,
            "Removed message from SQS"
        );
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        if topic.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "topic must be a non-empty string".to_string(),
            ));
        }

        let topic_arn = self.topic_arn(topic).await?;
        let queue_url = self.queue_url().await.map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        let queue_arn = self.queue_arn(&queue_url).await?;

        // The policy attribute is replaced wholesale, so it lists every topic.
        let policy = {
            let mut subscribed = self.subscribed.write().await;
            if !subscribed.contains(&topic_arn) {
                subscribed.push(topic_arn.clone());
            }
            queue_policy(&queue_arn, &subscribed)
        };

        self.sqs
            .set_queue_attributes()
            .queue_url(&queue_url)
            .attributes(QueueAttributeName::Policy, policy.to_string())
            .send()
            .await
            .map_err(|e| BrokerError::Subscribe(format!("Failed to set queue policy: {}", e)))?;

        self.sns
            .subscribe()
            .topic_arn(&topic_arn)
            .protocol("sqs")
            .endpoint(&queue_arn)
            .attributes("RawMessageDelivery", "true")
            .send()
            .await
            .map_err(|e| BrokerError::Subscribe(format!("Failed to subscribe queue to topic: {}", e)))?;

        info!(broker = %self.name, topic = %topic, topic_arn = %topic_arn, queue_arn = %queue_arn, "Subscribed queue to topic");
        Ok(())
    }
}
