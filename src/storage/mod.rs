//! Event storage.
//!
//! This module contains:
//! - `EventStore` trait: append log, optimistic concurrency, snapshots,
//!   replay shards
//! - `Transaction`: client-side buffer committed atomically through a store
//! - `CommitObserver`: optional in-process hook fired on single-event commits
//! - Storage configuration types and the `init_storage` factory
//! - Implementations: in-memory, SQLite, DynamoDB

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::event::{Event, EventError, Payload};
use crate::snapshot::Snapshot;

pub mod helpers;
pub mod memory;
pub mod observer;
pub mod shard;
pub mod transaction;

#[cfg(feature = "dynamo")]
pub mod dynamo;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "dynamo")]
pub use dynamo::DynamoEventStore;
pub use memory::InMemoryEventStore;
pub use observer::{CommitObserver, CommitObservers};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEventStore;
pub use transaction::{Transaction, TransactionState};

// ============================================================================
// Traits
// ============================================================================

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// None of these are retried by the store. On `StreamRevisionConflict` the
/// caller re-reads the stream and decides the next revision itself.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Stream revision conflict: stream={stream_id}, event_id={event_id}")]
    StreamRevisionConflict { stream_id: String, event_id: u64 },

    #[error("Invalid transaction: {0}")]
    TransactionInvalid(String),

    #[error("Transaction too large: {requested} events requested, backend supports at most {max}")]
    TransactionTooLarge { max: usize, requested: usize },

    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("DynamoDB error: {0}")]
    Dynamo(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt stored record: {0}")]
    Corrupt(String),
}

impl From<EventError> for StorageError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::InvalidArgument(msg) => StorageError::InvalidArgument(msg),
        }
    }
}

/// Interface for event persistence.
///
/// `(stream_id, event_id)` is the unique key for stored events. The
/// backend's atomic conditional write is the only concurrency control: no
/// locks are held between a caller reading a stream and appending to it.
///
/// Implementations:
/// - `InMemoryEventStore`: in-process test double, unbounded transactions
/// - `SqliteEventStore`: SQLite storage
/// - `DynamoEventStore`: DynamoDB storage, 25 events per transaction
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Conditionally append one pre-built event.
    ///
    /// Succeeds only if `(stream_id, event_id)` is not yet taken and the
    /// event directly follows the current revision. Otherwise fails with
    /// `StreamRevisionConflict`. Registered observers are notified after
    /// the write succeeds.
    async fn save_event(&self, event: Event) -> Result<Event>;

    /// Atomically append every event buffered in `transaction`.
    ///
    /// Fails with `TransactionInvalid` if the events for one stream are not
    /// consecutive, and with `TransactionConflict` if any stream has moved.
    /// Nothing is persisted on failure.
    async fn commit_transaction(&self, transaction: &Transaction<'_>) -> Result<()>;

    /// Retrieve all events of a stream ordered by `event_id`.
    ///
    /// Returns an empty vector for a stream that was never written.
    async fn get_stream(&self, stream_id: &str) -> Result<Vec<Event>>;

    /// Store (or overwrite) the snapshot of a stream at `revision_id`.
    async fn save_snapshot(&self, stream_id: &str, revision_id: u64, payload: Payload)
        -> Result<()>;

    /// Retrieve the latest snapshot of a stream.
    ///
    /// Returns `None` if no snapshot exists.
    async fn get_snapshot(&self, stream_id: &str) -> Result<Option<Snapshot>>;

    /// Retrieve every event whose stream hashes to `shard`.
    ///
    /// Events are ordered by stream, then `event_id`. See `shard::replay_all`
    /// for a parallel scan of the whole log.
    async fn replay_shard(&self, shard: u32) -> Result<Vec<Event>>;

    /// Maximum number of events one transaction may carry.
    fn transaction_max_size(&self) -> usize;

    /// Register an observer notified of every single-event commit.
    fn register_observer(&self, observer: Arc<dyn CommitObserver>);

    /// Append a new event after `expected_revision`.
    ///
    /// The new event gets `event_id = expected_revision + 1`. The reserved
    /// `_revisionId` payload key is dropped before storing.
    async fn save(
        &self,
        stream_id: &str,
        expected_revision: u64,
        message: &str,
        mut payload: Payload,
    ) -> Result<Event> {
        helpers::strip_revision_hint(&mut payload);
        let event_id = expected_revision.checked_add(1).ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "expected revision {} is out of range",
                expected_revision
            ))
        })?;
        let event = Event::new(stream_id, event_id, message, payload)?;
        self.save_event(event).await
    }

    /// Append events one by one.
    ///
    /// Not atomic: stops at the first failure, leaving earlier events stored.
    /// Use a `Transaction` for all-or-nothing writes.
    async fn save_events(&self, events: Vec<Event>) -> Result<Vec<Event>> {
        let mut saved = Vec::with_capacity(events.len());
        for event in events {
            saved.push(self.save_event(event).await?);
        }
        Ok(saved)
    }

    /// Open a transaction bound to this store.
    fn start_transaction(&self) -> Transaction<'_>
    where
        Self: Sized,
    {
        Transaction::new(self)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Storage type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// In-process store, lost on exit.
    Memory,
    /// SQLite file.
    #[default]
    Sqlite,
    /// DynamoDB tables.
    Dynamo,
}

/// Storage configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// Event store name. Table names derive from it.
    pub name: String,
    /// SQLite-specific configuration.
    pub sqlite: SqliteConfig,
    /// DynamoDB-specific configuration.
    pub dynamo: DynamoConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Sqlite,
            name: "eventide".to_string(),
            sqlite: SqliteConfig::default(),
            dynamo: DynamoConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Name of the event log table.
    pub fn events_table(&self) -> String {
        format!("{}EventStreamTable", self.name)
    }

    /// Name of the snapshot table.
    pub fn snapshots_table(&self) -> String {
        format!("{}SnapshotTable", self.name)
    }
}

/// SQLite-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Path to database file, or `:memory:`.
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "./data/events.db".to_string(),
        }
    }
}

/// DynamoDB-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DynamoConfig {
    /// AWS region. Uses default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack or DynamoDB Local).
    pub endpoint_url: Option<String>,
    /// Whether the snapshot table is provisioned.
    pub snapshots_enabled: bool,
}

impl Default for DynamoConfig {
    fn default() -> Self {
        Self {
            region: None,
            endpoint_url: None,
            snapshots_enabled: true,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the event store selected by configuration.
///
/// Requires the corresponding feature to be enabled:
/// - SQLite: `--features sqlite` (included in default)
/// - DynamoDB: `--features dynamo`
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<Arc<dyn EventStore>, Box<dyn std::error::Error + Send + Sync>> {
    match config.storage_type {
        StorageType::Memory => {
            info!(storage_type = "memory", "Event store initialized");
            Ok(Arc::new(InMemoryEventStore::new()))
        }
        StorageType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                if let Some(parent) = std::path::Path::new(&config.sqlite.path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let store = SqliteEventStore::connect(&config.sqlite.path)
                    .await?
                    .with_tables(config.events_table(), config.snapshots_table());
                store.init().await?;
                info!(storage_type = "sqlite", path = %config.sqlite.path, "Event store initialized");
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                tracing::error!("SQLite storage requested but 'sqlite' feature is not enabled");
                Err("SQLite support requires the 'sqlite' feature. Rebuild with --features sqlite".into())
            }
        }
        StorageType::Dynamo => {
            #[cfg(feature = "dynamo")]
            {
                let store = DynamoEventStore::new(config).await?;
                info!(storage_type = "dynamo", table = %config.events_table(), "Event store initialized");
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "dynamo"))]
            {
                tracing::error!("DynamoDB storage requested but 'dynamo' feature is not enabled");
                Err("DynamoDB support requires the 'dynamo' feature. Rebuild with --features dynamo".into())
            }
        }
    }
}
