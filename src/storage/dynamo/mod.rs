//! DynamoDB EventStore implementation.
//!
//! Event table schema:
//! - PK: `StreamId` (String), SK: `EventId` (Number)
//! - `Message` (String), `Payload` (Map), `CreatedAt` (String, RFC 3339)
//! - `ReplayShard` (Number) and `ReplayKey` (String, `{stream}:{event}`),
//!   indexed by the `ReplayIndex` global secondary index
//!
//! Snapshot table schema:
//! - PK: `StreamId` (String), SK: `RevisionId` (Number), `Payload` (Map)
//!
//! Every append is a conditional write: the new key must not exist and, past
//! the first revision, its predecessor must. Tables are provisioned outside
//! this crate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::{AttributeValue, ConditionCheck, Put, TransactWriteItem};
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, Utc};
use serde_json::{Number, Value};
use tracing::{debug, info, warn};

use crate::event::{Event, Payload};
use crate::snapshot::Snapshot;
use crate::storage::helpers::{group_by_stream, require_revision_id, require_stream_id};
use crate::storage::shard::{replay_sort_key, shard_for, sort_for_replay};
use crate::storage::{
    CommitObserver, CommitObservers, EventStore, Result, StorageConfig, StorageError, Transaction,
};

/// Items per `TransactWriteItems` call accepted for events.
pub const DYNAMO_TRANSACTION_MAX_SIZE: usize = 25;

/// Global secondary index over `(ReplayShard, ReplayKey)`.
pub const REPLAY_INDEX: &str = "ReplayIndex";

const STREAM_ID: &str = "StreamId";
const EVENT_ID: &str = "EventId";
const MESSAGE: &str = "Message";
const PAYLOAD: &str = "Payload";
const CREATED_AT: &str = "CreatedAt";
const REPLAY_SHARD: &str = "ReplayShard";
const REPLAY_KEY: &str = "ReplayKey";
const REVISION_ID: &str = "RevisionId";

type Item = HashMap<String, AttributeValue>;

/// DynamoDB implementation of EventStore.
pub struct DynamoEventStore {
    client: Client,
    events_table: String,
    snapshots_table: String,
    snapshots_enabled: bool,
    observers: CommitObservers,
}

impl DynamoEventStore {
    /// Connect using the default AWS provider chain.
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region) = config.dynamo.region {
            aws_config_builder =
                aws_config_builder.region(aws_config::Region::new(region.clone()));
        }

        if let Some(ref endpoint) = config.dynamo.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;
        let client = Client::new(&aws_config);

        info!(
            region = ?config.dynamo.region,
            endpoint = ?config.dynamo.endpoint_url,
            table = %config.events_table(),
            "Connected to DynamoDB"
        );

        Ok(Self::from_client(client, config))
    }

    /// Wrap an already configured client.
    pub fn from_client(client: Client, config: &StorageConfig) -> Self {
        Self {
            client,
            events_table: config.events_table(),
            snapshots_table: config.snapshots_table(),
            snapshots_enabled: config.dynamo.snapshots_enabled,
            observers: CommitObservers::new(),
        }
    }

    fn check_snapshots_enabled(&self) -> Result<()> {
        if self.snapshots_enabled {
            Ok(())
        } else {
            Err(StorageError::NotImplemented(
                "snapshots are disabled for this DynamoDB event store".to_string(),
            ))
        }
    }

    /// Put of a new event that fails if its key already exists.
    fn put_new_event(&self, event: &Event) -> Result<Put> {
        Put::builder()
            .table_name(&self.events_table)
            .set_item(Some(event_to_item(event)))
            .condition_expression("attribute_not_exists(#EID)")
            .expression_attribute_names("#EID", EVENT_ID)
            .build()
            .map_err(|e| StorageError::Dynamo(format!("Failed to build put: {}", e)))
    }

    /// Check that `event_id` already exists in `stream_id`.
    fn predecessor_check(&self, stream_id: &str, event_id: u64) -> Result<ConditionCheck> {
        ConditionCheck::builder()
            .table_name(&self.events_table)
            .set_key(Some(event_key(stream_id, event_id)))
            .condition_expression("attribute_exists(#EID)")
            .expression_attribute_names("#EID", EVENT_ID)
            .build()
            .map_err(|e| StorageError::Dynamo(format!("Failed to build condition check: {}", e)))
    }

    /// Query all items matching a key condition, following pagination.
    async fn query_all(
        &self,
        table: &str,
        index: Option<&str>,
        key_condition: &str,
        values: Item,
    ) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut start_key: Option<Item> = None;

        loop {
            let result = self
                .client
                .query()
                .table_name(table)
                .set_index_name(index.map(str::to_string))
                .key_condition_expression(key_condition)
                .set_expression_attribute_values(Some(values.clone()))
                // Global secondary indexes only support eventual consistency.
                .consistent_read(index.is_none())
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| StorageError::Dynamo(format!("DynamoDB query failed: {}", e)))?;

            items.extend(result.items.unwrap_or_default());
            match result.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }

        Ok(items)
    }
}

#[async_trait]
impl EventStore for DynamoEventStore {
    async fn save_event(&self, event: Event) -> Result<Event> {
        event.validate()?;
        require_revision_id(&event)?;
        let conflict = || StorageError::StreamRevisionConflict {
            stream_id: event.stream_id.clone(),
            event_id: event.event_id,
        };

        if event.event_id == 1 {
            self.client
                .put_item()
                .table_name(&self.events_table)
                .set_item(Some(event_to_item(&event)))
                .condition_expression("attribute_not_exists(#EID)")
                .expression_attribute_names("#EID", EVENT_ID)
                .send()
                .await
                .map_err(|e| match e.into_service_error() {
                    PutItemError::ConditionalCheckFailedException(_) => conflict(),
                    other => StorageError::Dynamo(format!("DynamoDB put_item failed: {}", other)),
                })?;
        } else {
            let predecessor = self.predecessor_check(&event.stream_id, event.event_id - 1)?;
            let put = self.put_new_event(&event)?;
            self.client
                .transact_write_items()
                .transact_items(TransactWriteItem::builder().condition_check(predecessor).build())
                .transact_items(TransactWriteItem::builder().put(put).build())
                .send()
                .await
                .map_err(|e| match e.into_service_error() {
                    TransactWriteItemsError::TransactionCanceledException(_) => conflict(),
                    other => StorageError::Dynamo(format!(
                        "DynamoDB transact_write_items failed: {}",
                        other
                    )),
                })?;
        }

        debug!(
            stream_id = %event.stream_id,
            event_id = event.event_id,
            message = %event.message,
            "Saved event to DynamoDB"
        );
        self.observers.notify(&event);
        Ok(event)
    }

    async fn commit_transaction(&self, transaction: &Transaction<'_>) -> Result<()> {
        if transaction.len() > DYNAMO_TRANSACTION_MAX_SIZE {
            return Err(StorageError::TransactionTooLarge {
                max: DYNAMO_TRANSACTION_MAX_SIZE,
                requested: transaction.len(),
            });
        }

        let batches = group_by_stream(transaction.events())?;
        if batches.is_empty() {
            return Ok(());
        }

        let mut items = Vec::with_capacity(transaction.len() + batches.len());
        for batch in &batches {
            let first = batch.first_event_id();
            if let Some(event) = batch.events.first() {
                require_revision_id(event).map_err(|_| {
                    StorageError::TransactionConflict(format!(
                        "stream '{}' cannot start at revision 0",
                        batch.stream_id
                    ))
                })?;
            }
            if first > 1 {
                let check = self.predecessor_check(batch.stream_id, first - 1)?;
                items.push(TransactWriteItem::builder().condition_check(check).build());
            }
            for event in &batch.events {
                let put = self.put_new_event(event)?;
                items.push(TransactWriteItem::builder().put(put).build());
            }
        }

        self.client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await
            .map_err(|e| match e.into_service_error() {
                TransactWriteItemsError::TransactionCanceledException(cancelled) => {
                    warn!(
                        reasons = ?cancelled.cancellation_reasons(),
                        "DynamoDB transaction cancelled"
                    );
                    StorageError::TransactionConflict(format!("transaction cancelled: {}", cancelled))
                }
                other => StorageError::Dynamo(format!("DynamoDB transact_write_items failed: {}", other)),
            })?;

        debug!(streams = batches.len(), events = transaction.len(), "Committed transaction to DynamoDB");
        Ok(())
    }

    async fn get_stream(&self, stream_id: &str) -> Result<Vec<Event>> {
        require_stream_id(stream_id)?;

        let values = HashMap::from([(":sid".to_string(), AttributeValue::S(stream_id.to_string()))]);
        let items = self
            .query_all(&self.events_table, None, "StreamId = :sid", values)
            .await?;
        items.iter().map(item_to_event).collect()
    }

    async fn save_snapshot(&self, stream_id: &str, revision_id: u64, payload: Payload) -> Result<()> {
        let snapshot = Snapshot::new(stream_id, revision_id, payload)?;
        self.check_snapshots_enabled()?;

        self.client
            .put_item()
            .table_name(&self.snapshots_table)
            .set_item(Some(snapshot_to_item(&snapshot)))
            .send()
            .await
            .map_err(|e| StorageError::Dynamo(format!("DynamoDB put_item failed: {}", e)))?;

        debug!(stream_id = %stream_id, revision_id = revision_id, "Saved snapshot to DynamoDB");
        Ok(())
    }

    async fn get_snapshot(&self, stream_id: &str) -> Result<Option<Snapshot>> {
        require_stream_id(stream_id)?;
        self.check_snapshots_enabled()?;

        let result = self
            .client
            .query()
            .table_name(&self.snapshots_table)
            .key_condition_expression("StreamId = :sid")
            .expression_attribute_values(":sid", AttributeValue::S(stream_id.to_string()))
            .scan_index_forward(false)
            .limit(1)
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| StorageError::Dynamo(format!("DynamoDB query failed: {}", e)))?;

        result
            .items
            .unwrap_or_default()
            .first()
            .map(item_to_snapshot)
            .transpose()
    }

    async fn replay_shard(&self, shard: u32) -> Result<Vec<Event>> {
        let values = HashMap::from([(":shard".to_string(), AttributeValue::N(shard.to_string()))]);
        let items = self
            .query_all(
                &self.events_table,
                Some(REPLAY_INDEX),
                "ReplayShard = :shard",
                values,
            )
            .await?;

        // ReplayKey sorts as text, so "s:10" precedes "s:2".
        let mut events = items.iter().map(item_to_event).collect::<Result<Vec<_>>>()?;
        sort_for_replay(&mut events);
        Ok(events)
    }

    fn transaction_max_size(&self) -> usize {
        DYNAMO_TRANSACTION_MAX_SIZE
    }

    fn register_observer(&self, observer: Arc<dyn CommitObserver>) {
        self.observers.register(observer);
    }
}

// ============================================================================
// Item mapping
// ============================================================================

fn event_key(stream_id: &str, event_id: u64) -> Item {
    HashMap::from([
        (STREAM_ID.to_string(), AttributeValue::S(stream_id.to_string())),
        (EVENT_ID.to_string(), AttributeValue::N(event_id.to_string())),
    ])
}

fn event_to_item(event: &Event) -> Item {
    let mut item = event_key(&event.stream_id, event.event_id);
    item.insert(MESSAGE.to_string(), AttributeValue::S(event.message.clone()));
    item.insert(PAYLOAD.to_string(), payload_to_attribute(&event.payload));
    item.insert(CREATED_AT.to_string(), AttributeValue::S(event.created_at.to_rfc3339()));
    item.insert(
        REPLAY_SHARD.to_string(),
        AttributeValue::N(shard_for(&event.stream_id).to_string()),
    );
    item.insert(
        REPLAY_KEY.to_string(),
        AttributeValue::S(replay_sort_key(&event.stream_id, event.event_id)),
    );
    item
}

fn item_to_event(item: &Item) -> Result<Event> {
    let created_at = match item.get(CREATED_AT) {
        Some(AttributeValue::S(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StorageError::Corrupt(format!("{} '{}': {}", CREATED_AT, s, e)))?,
        _ => Utc::now(),
    };

    Ok(Event {
        stream_id: string_attr(item, STREAM_ID)?,
        event_id: number_attr(item, EVENT_ID)?,
        message: string_attr(item, MESSAGE)?,
        payload: payload_attr(item)?,
        created_at,
    })
}

fn snapshot_to_item(snapshot: &Snapshot) -> Item {
    HashMap::from([
        (STREAM_ID.to_string(), AttributeValue::S(snapshot.stream_id.clone())),
        (REVISION_ID.to_string(), AttributeValue::N(snapshot.revision_id.to_string())),
        (PAYLOAD.to_string(), payload_to_attribute(&snapshot.payload)),
    ])
}

fn item_to_snapshot(item: &Item) -> Result<Snapshot> {
    Ok(Snapshot {
        stream_id: string_attr(item, STREAM_ID)?,
        revision_id: number_attr(item, REVISION_ID)?,
        payload: payload_attr(item)?,
    })
}

fn string_attr(item: &Item, name: &str) -> Result<String> {
    match item.get(name) {
        Some(AttributeValue::S(s)) => Ok(s.clone()),
        _ => Err(StorageError::Corrupt(format!("missing string attribute {}", name))),
    }
}

fn number_attr(item: &Item, name: &str) -> Result<u64> {
    match item.get(name) {
        Some(AttributeValue::N(n)) => n
            .parse()
            .map_err(|_| StorageError::Corrupt(format!("attribute {} is not a revision: {}", name, n))),
        _ => Err(StorageError::Corrupt(format!("missing number attribute {}", name))),
    }
}

/// A missing payload reads back as an empty one.
fn payload_attr(item: &Item) -> Result<Payload> {
    match item.get(PAYLOAD) {
        None => Ok(Payload::new()),
        Some(attr) => match attribute_to_value(attr)? {
            Value::Object(map) => Ok(map),
            other => Err(StorageError::Corrupt(format!("payload is not a map: {}", other))),
        },
    }
}

fn payload_to_attribute(payload: &Payload) -> AttributeValue {
    AttributeValue::M(
        payload
            .iter()
            .map(|(k, v)| (k.clone(), value_to_attribute(v)))
            .collect(),
    )
}

/// Convert a JSON value to its DynamoDB attribute.
pub fn value_to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(value_to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_attribute(v)))
                .collect(),
        ),
    }
}

/// Convert a DynamoDB attribute back to JSON.
///
/// Sets and binary values are not produced by this store and are rejected.
pub fn attribute_to_value(attr: &AttributeValue) -> Result<Value> {
    Ok(match attr {
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => {
            let number: Number = n
                .parse()
                .map_err(|_| StorageError::Corrupt(format!("invalid number attribute: {}", n)))?;
            Value::Number(number)
        }
        AttributeValue::L(items) => {
            Value::Array(items.iter().map(attribute_to_value).collect::<Result<_>>()?)
        }
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| attribute_to_value(v).map(|v| (k.clone(), v)))
                .collect::<Result<_>>()?,
        ),
        other => {
            return Err(StorageError::Corrupt(format!(
                "unsupported attribute type: {:?}",
                other
            )))
        }
    })
}
