//! Client-side transaction buffer.
//!
//! A `Transaction` collects events locally and hands them to its owning
//! store in one atomic commit. Buffering never touches the backend.

use tracing::debug;

use super::{EventStore, Result, StorageError};
use crate::event::Event;

/// Lifecycle of a transaction.
///
/// There is no aborted state: nothing is reserved before commit, so an
/// abandoned transaction is simply dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting events.
    Open,
    /// Committed through the owning store. Terminal.
    Committed,
}

/// Events buffered for one atomic commit.
pub struct Transaction<'a> {
    store: &'a dyn EventStore,
    events: Vec<Event>,
    state: TransactionState,
}

impl<'a> Transaction<'a> {
    /// Create an empty transaction bound to `store`.
    pub fn new(store: &'a dyn EventStore) -> Self {
        Self {
            store,
            events: Vec::new(),
            state: TransactionState::Open,
        }
    }

    /// Buffer one event. Returns the transaction size.
    pub fn save_event(&mut self, event: Event) -> Result<usize> {
        self.check_open()?;
        event.validate()?;
        self.check_size(1)?;
        self.events.push(event);
        Ok(self.events.len())
    }

    /// Buffer several events. Returns the transaction size.
    ///
    /// Either all events are buffered or none are.
    pub fn save_events(&mut self, events: Vec<Event>) -> Result<usize> {
        self.check_open()?;
        for (i, event) in events.iter().enumerate() {
            event.validate().map_err(|e| {
                StorageError::InvalidArgument(format!("event in position {} is invalid: {}", i, e))
            })?;
        }
        self.check_size(events.len())?;
        self.events.extend(events);
        Ok(self.events.len())
    }

    /// Commit through the owning store.
    ///
    /// Committing again fails with `TransactionConflict`: its events are
    /// already in the log.
    pub async fn commit(&mut self) -> Result<()> {
        if self.state == TransactionState::Committed {
            return Err(StorageError::TransactionConflict(
                "transaction already committed".to_string(),
            ));
        }
        let store = self.store;
        store.commit_transaction(self).await?;
        self.state = TransactionState::Committed;
        debug!(events = self.events.len(), "Transaction committed");
        Ok(())
    }

    /// Buffered events in insertion order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum size declared by the owning store.
    pub fn max_size(&self) -> usize {
        self.store.transaction_max_size()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            TransactionState::Open => Ok(()),
            TransactionState::Committed => Err(StorageError::InvalidArgument(
                "transaction already committed".to_string(),
            )),
        }
    }

    fn check_size(&self, additional: usize) -> Result<()> {
        let max = self.max_size();
        let requested = self.events.len().saturating_add(additional);
        if requested > max {
            return Err(StorageError::TransactionTooLarge { max, requested });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("events", &self.events)
            .field("state", &self.state)
            .field("max_size", &self.max_size())
            .finish()
    }
}
