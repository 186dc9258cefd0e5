//! In-process topic fan-out.
//!
//! A `TopicHub` is an explicit instance created by the process entry point
//! and handed to whatever needs it. Cloning shares the same listener table.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::event::Event;
use crate::storage::CommitObserver;

/// Receives events emitted on a topic.
///
/// Called inline by `TopicHub::emit`; must not block.
pub trait TopicListener: Send + Sync {
    fn deliver(&self, event: &Event);
}

impl<F> TopicListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn deliver(&self, event: &Event) {
        self(event)
    }
}

/// Topic name to listeners.
#[derive(Clone, Default)]
pub struct TopicHub {
    listeners: Arc<RwLock<HashMap<String, Vec<Arc<dyn TopicListener>>>>>,
}

impl TopicHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener to `topic`.
    pub fn listen(&self, topic: impl Into<String>, listener: Arc<dyn TopicListener>) {
        let topic = topic.into();
        debug!(topic = %topic, "Topic listener registered");
        self.listeners.write().entry(topic).or_default().push(listener);
    }

    /// Deliver `event` to every listener of `topic`. Returns how many ran.
    pub fn emit(&self, topic: &str, event: &Event) -> usize {
        let listeners = match self.listeners.read().get(topic) {
            Some(listeners) => listeners.clone(),
            None => return 0,
        };
        trace!(
            topic = %topic,
            stream_id = %event.stream_id,
            event_id = event.event_id,
            listeners = listeners.len(),
            "Emitting event"
        );
        for listener in &listeners {
            listener.deliver(event);
        }
        listeners.len()
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.listeners.read().get(topic).map(Vec::len).unwrap_or(0)
    }

    /// A commit observer that emits every committed event on `topic`.
    pub fn forwarder(&self, topic: impl Into<String>) -> Arc<dyn CommitObserver> {
        Arc::new(TopicForwarder {
            hub: self.clone(),
            topic: topic.into(),
        })
    }
}

impl std::fmt::Debug for TopicHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.read();
        let mut topics: Vec<&String> = listeners.keys().collect();
        topics.sort();
        f.debug_struct("TopicHub").field("topics", &topics).finish()
    }
}

/// Forwards store commits to a topic.
pub struct TopicForwarder {
    hub: TopicHub,
    topic: String,
}

impl CommitObserver for TopicForwarder {
    fn on_commit(&self, event: &Event) {
        self.hub.emit(&self.topic, event);
    }
}
