//! Replay shards.
//!
//! Every stored event also carries a replay-shard key so the full log can be
//! scanned as `REPLAY_SHARDS` independent partitions instead of one hot one.
//! The shard is a storage detail: it never changes `get_stream` ordering.

use futures::{StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{EventStore, Result};
use crate::event::Event;

/// Number of replay shards.
pub const REPLAY_SHARDS: u32 = 5;

/// Deterministic shard of a stream: `hash(stream_id) mod REPLAY_SHARDS`.
pub fn shard_for(stream_id: &str) -> u32 {
    let digest = Sha256::digest(stream_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % REPLAY_SHARDS as u64) as u32
}

/// Sort key of an event inside its replay shard.
pub fn replay_sort_key(stream_id: &str, event_id: u64) -> String {
    format!("{}:{}", stream_id, event_id)
}

/// Order shard scan results by stream, then revision.
pub fn sort_for_replay(events: &mut [Event]) {
    events.sort_by(|a, b| {
        a.stream_id
            .cmp(&b.stream_id)
            .then(a.event_id.cmp(&b.event_id))
    });
}

/// Scan the whole log, reading up to `concurrency` shards at once.
///
/// Events come back grouped by shard in shard order; within a shard they
/// follow `replay_shard` ordering. No cross-stream ordering is implied.
pub async fn replay_all(store: &dyn EventStore, concurrency: usize) -> Result<Vec<Event>> {
    let concurrency = concurrency.clamp(1, REPLAY_SHARDS as usize);

    let mut shards: Vec<(u32, Vec<Event>)> = futures::stream::iter(0..REPLAY_SHARDS)
        .map(|shard| async move { store.replay_shard(shard).await.map(|events| (shard, events)) })
        .buffer_unordered(concurrency)
        .try_collect()
        .await?;

    shards.sort_by_key(|(shard, _)| *shard);

    let total: usize = shards.iter().map(|(_, events)| events.len()).sum();
    debug!(shards = shards.len(), events = total, "Replayed full log");

    Ok(shards.into_iter().flat_map(|(_, events)| events).collect())
}
