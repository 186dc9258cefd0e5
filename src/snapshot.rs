//! Snapshot value type.

use serde::{Deserialize, Serialize};

use crate::event::{EventError, Payload, Result};

/// Folded state of a stream up to and including `revision_id`.
///
/// Snapshots are an optimization: a reader loads the snapshot and replays
/// only the events after `revision_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(alias = "StreamId")]
    pub stream_id: String,
    #[serde(alias = "RevisionId")]
    pub revision_id: u64,
    #[serde(alias = "Payload")]
    pub payload: Payload,
}

impl Snapshot {
    pub fn new(stream_id: impl Into<String>, revision_id: u64, payload: Payload) -> Result<Self> {
        let stream_id = stream_id.into();
        if stream_id.is_empty() {
            return Err(EventError::InvalidArgument(
                "Snapshot: missing the following parameters: streamId".to_string(),
            ));
        }
        Ok(Self {
            stream_id,
            revision_id,
            payload,
        })
    }
}
