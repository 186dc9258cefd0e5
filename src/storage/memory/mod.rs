//! In-memory EventStore implementation.
//!
//! Test double and local development backend. All state lives behind one
//! lock per table, so a conditional write is a check-and-insert under the
//! write guard.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::event::{Event, Payload};
use crate::snapshot::Snapshot;
use crate::storage::helpers::{check_next_revision, group_by_stream, require_stream_id};
use crate::storage::shard::{shard_for, sort_for_replay};
use crate::storage::{
    CommitObserver, CommitObservers, EventStore, Result, StorageError, Transaction,
};

/// In-memory event store.
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<String, Vec<Event>>>,
    /// Snapshots keyed by stream, then revision. The last entry is current.
    snapshots: RwLock<HashMap<String, BTreeMap<u64, Snapshot>>>,
    observers: CommitObservers,
    transaction_max_size: usize,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            observers: CommitObservers::new(),
            transaction_max_size: usize::MAX,
        }
    }
}

impl InMemoryEventStore {
    /// Create an empty store with unbounded transactions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a finite transaction limit, e.g. to mimic a partitioned backend.
    pub fn with_transaction_max_size(mut self, max: usize) -> Self {
        self.transaction_max_size = max;
        self
    }

    /// Drop every stream and snapshot.
    pub async fn reset(&self) {
        self.streams.write().await.clear();
        self.snapshots.write().await.clear();
    }

    /// Number of streams with at least one event.
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save_event(&self, event: Event) -> Result<Event> {
        event.validate()?;

        {
            let mut streams = self.streams.write().await;
            let current = streams
                .get(&event.stream_id)
                .map(|s| s.len() as u64)
                .unwrap_or(0);
            if let Err(e) = check_next_revision(current, &event) {
                warn!(
                    stream_id = %event.stream_id,
                    event_id = event.event_id,
                    current_revision = current,
                    "Stream revision conflict"
                );
                return Err(e);
            }
            streams
                .entry(event.stream_id.clone())
                .or_default()
                .push(event.clone());
        }

        debug!(
            stream_id = %event.stream_id,
            event_id = event.event_id,
            message = %event.message,
            "Saved event"
        );
        self.observers.notify(&event);
        Ok(event)
    }

    async fn commit_transaction(&self, transaction: &Transaction<'_>) -> Result<()> {
        let batches = group_by_stream(transaction.events())?;
        if batches.is_empty() {
            return Ok(());
        }

        let mut streams = self.streams.write().await;

        for batch in &batches {
            let current = streams.get(batch.stream_id).map(|s| s.len() as u64).unwrap_or(0);
            if batch.first_event_id() != current + 1 {
                warn!(
                    stream_id = %batch.stream_id,
                    event_id = batch.first_event_id(),
                    current_revision = current,
                    "Transaction conflict"
                );
                return Err(StorageError::TransactionConflict(format!(
                    "stream '{}' is at revision {}, transaction starts at {}",
                    batch.stream_id,
                    current,
                    batch.first_event_id()
                )));
            }
        }

        for batch in &batches {
            streams
                .entry(batch.stream_id.to_string())
                .or_default()
                .extend(batch.events.iter().map(|e| (*e).clone()));
        }

        debug!(
            streams = batches.len(),
            events = transaction.len(),
            "Committed transaction"
        );
        Ok(())
    }

    async fn get_stream(&self, stream_id: &str) -> Result<Vec<Event>> {
        require_stream_id(stream_id)?;
        let streams = self.streams.read().await;
        Ok(streams.get(stream_id).cloned().unwrap_or_default())
    }

    async fn save_snapshot(&self, stream_id: &str, revision_id: u64, payload: Payload) -> Result<()> {
        let snapshot = Snapshot::new(stream_id, revision_id, payload)?;
        self.snapshots
            .write()
            .await
            .entry(snapshot.stream_id.clone())
            .or_default()
            .insert(revision_id, snapshot);
        debug!(stream_id = %stream_id, revision_id = revision_id, "Saved snapshot");
        Ok(())
    }

    async fn get_snapshot(&self, stream_id: &str) -> Result<Option<Snapshot>> {
        require_stream_id(stream_id)?;
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(stream_id)
            .and_then(|by_revision| by_revision.values().next_back().cloned()))
    }

    async fn replay_shard(&self, shard: u32) -> Result<Vec<Event>> {
        let streams = self.streams.read().await;
        let mut events: Vec<Event> = streams
            .iter()
            .filter(|(stream_id, _)| shard_for(stream_id) == shard)
            .flat_map(|(_, events)| events.iter().cloned())
            .collect();
        sort_for_replay(&mut events);
        Ok(events)
    }

    fn transaction_max_size(&self) -> usize {
        self.transaction_max_size
    }

    fn register_observer(&self, observer: Arc<dyn CommitObserver>) {
        self.observers.register(observer);
    }
}
