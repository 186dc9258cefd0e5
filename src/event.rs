//! Event value type.
//!
//! An `Event` is one immutable fact appended to a stream. `event_id` is the
//! 1-based revision of the stream the event was committed at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event and snapshot payload: always a JSON object.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Result type for event construction.
pub type Result<T> = std::result::Result<T, EventError>;

/// Errors raised while building or decoding an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// One fact appended to a stream.
///
/// Serialized with camelCase keys. Decoding also accepts the PascalCase keys
/// written by the table and queue backends (`StreamId`, `EventId`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(alias = "StreamId")]
    pub stream_id: String,
    #[serde(alias = "EventId")]
    pub event_id: u64,
    #[serde(alias = "Message")]
    pub message: String,
    #[serde(alias = "Payload")]
    pub payload: Payload,
    #[serde(alias = "CreatedAt", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Build a new event stamped with the current time.
    pub fn new(
        stream_id: impl Into<String>,
        event_id: u64,
        message: impl Into<String>,
        payload: Payload,
    ) -> Result<Self> {
        let event = Self {
            stream_id: stream_id.into(),
            event_id,
            message: message.into(),
            payload,
            created_at: Utc::now(),
        };
        event.validate()?;
        Ok(event)
    }

    /// Check the event is well formed.
    ///
    /// Fields are public, so anything arriving from outside `Event::new`
    /// (decoded rows, hand-built values) goes through this before use.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.stream_id.is_empty() {
            missing.push("streamId");
        }
        if self.message.is_empty() {
            missing.push("message");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(EventError::InvalidArgument(format!(
                "Event: missing the following parameters: {}",
                missing.join(", ")
            )))
        }
    }

    /// Decode an event from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        let event: Event = serde_json::from_str(json)
            .map_err(|e| EventError::InvalidArgument(format!("malformed event: {}", e)))?;
        event.validate()?;
        Ok(event)
    }

    /// Encode the event as JSON.
    pub fn to_json(&self) -> String {
        // Serializing a struct of strings, integers and a JSON map cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
