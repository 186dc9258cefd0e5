//! Shared storage helper functions.
//!
//! Common logic for argument checks, revision gating and transaction
//! grouping used across storage backend implementations.

use crate::event::{Event, Payload};

use super::{Result, StorageError};

/// Payload key callers may use to carry a revision hint. Never persisted.
pub const REVISION_HINT_KEY: &str = "_revisionId";

/// Drop the reserved revision hint from a payload.
pub fn strip_revision_hint(payload: &mut Payload) {
    payload.remove(REVISION_HINT_KEY);
}

/// Reject empty stream ids before any I/O.
pub fn require_stream_id(stream_id: &str) -> Result<()> {
    if stream_id.is_empty() {
        return Err(StorageError::InvalidArgument(
            "'streamId' must be a non-empty string".to_string(),
        ));
    }
    Ok(())
}

/// Check that `event` is the next revision after `current_revision`.
///
/// An occupied `event_id` and one that would leave a gap are both reported
/// as a stale view of the stream.
pub fn check_next_revision(current_revision: u64, event: &Event) -> Result<()> {
    if event.event_id == current_revision + 1 {
        Ok(())
    } else {
        Err(StorageError::StreamRevisionConflict {
            stream_id: event.stream_id.clone(),
            event_id: event.event_id,
        })
    }
}

/// Reject `event_id` 0 before any I/O.
///
/// Revisions start at 1. Backends whose conditional write only checks that
/// the key is free would otherwise accept 0 on any stream.
pub fn require_revision_id(event: &Event) -> Result<()> {
    if event.event_id == 0 {
        return Err(StorageError::StreamRevisionConflict {
            stream_id: event.stream_id.clone(),
            event_id: 0,
        });
    }
    Ok(())
}

/// Events of one transaction that target the same stream.
#[derive(Debug)]
pub struct StreamBatch<'a> {
    pub stream_id: &'a str,
    pub events: Vec<&'a Event>,
}

impl StreamBatch<'_> {
    /// `event_id` of the first event in the batch.
    pub fn first_event_id(&self) -> u64 {
        self.events.first().map(|e| e.event_id).unwrap_or_default()
    }
}

/// Group transaction events by stream, preserving first-seen stream order.
///
/// Within a stream, events must carry strictly consecutive `event_id`s in
/// buffer order; anything else is a client-side ordering bug reported as
/// `TransactionInvalid`.
pub fn group_by_stream(events: &[Event]) -> Result<Vec<StreamBatch<'_>>> {
    let mut batches: Vec<StreamBatch<'_>> = Vec::new();

    for event in events {
        match batches.iter_mut().find(|b| b.stream_id == event.stream_id) {
            Some(batch) => {
                // Batches are created with one event, so last() is always set.
                let previous = batch.events.last().map(|e| e.event_id).unwrap_or_default();
                if event.event_id != previous + 1 {
                    return Err(StorageError::TransactionInvalid(format!(
                        "events for stream '{}' are not consecutive: {} follows {}",
                        event.stream_id, event.event_id, previous
                    )));
                }
                batch.events.push(event);
            }
            None => batches.push(StreamBatch {
                stream_id: &event.stream_id,
                events: vec![event],
            }),
        }
    }

    Ok(batches)
}
