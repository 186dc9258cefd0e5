//! In-process commit notification.
//!
//! Observers are a local fan-out only. They run inline on the committing
//! task, so they must not block, and they never see commits made by other
//! processes.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::event::Event;

/// Receives every event committed through `EventStore::save_event`.
pub trait CommitObserver: Send + Sync {
    fn on_commit(&self, event: &Event);
}

impl<F> CommitObserver for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_commit(&self, event: &Event) {
        self(event)
    }
}

/// Observer registry owned by a store instance.
#[derive(Default)]
pub struct CommitObservers {
    observers: RwLock<Vec<Arc<dyn CommitObserver>>>,
}

impl CommitObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn CommitObserver>) {
        self.observers.write().push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Notify all observers of a committed event.
    pub fn notify(&self, event: &Event) {
        let observers = self.observers.read().clone();
        trace!(
            stream_id = %event.stream_id,
            event_id = event.event_id,
            observers = observers.len(),
            "Notifying commit observers"
        );
        for observer in observers {
            observer.on_commit(event);
        }
    }
}
