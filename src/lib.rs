//! Eventide - event-sourcing core
//!
//! An append-only, per-stream event log with optimistic concurrency,
//! atomic multi-stream transactions, snapshots and sharded replay, plus an
//! at-least-once event broker with visibility-timeout redelivery.
//!
//! Backends are chosen by configuration and Cargo features:
//! - storage: in-memory, SQLite (`sqlite`, default), DynamoDB (`dynamo`)
//! - broker: in-memory, SQS (`sqs`)

pub mod broker;
pub mod config;
pub mod event;
pub mod snapshot;
pub mod storage;
pub mod utils;

pub use broker::{BrokerError, BrokerEvent, EventBroker, GetEventOptions, TopicHub};
pub use config::Config;
pub use event::{Event, EventError, Payload};
pub use snapshot::Snapshot;
pub use storage::{EventStore, StorageError, Transaction};
