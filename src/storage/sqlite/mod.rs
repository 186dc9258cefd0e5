//! SQLite EventStore implementation.
//!
//! Conditional writes run inside `BEGIN IMMEDIATE` so the revision check and
//! the insert see the same stream state. The `(stream_id, event_id)` primary
//! key backs that up if a writer slips past the check.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Alias, Expr, Iden, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::event::{Event, Payload};
use crate::snapshot::Snapshot;
use crate::storage::helpers::{check_next_revision, group_by_stream, require_stream_id};
use crate::storage::shard::shard_for;
use crate::storage::{
    CommitObserver, CommitObservers, EventStore, Result, StorageConfig, StorageError, Transaction,
};

/// Default number of events accepted in one transaction.
pub const DEFAULT_TRANSACTION_MAX_SIZE: usize = 1000;

/// Event table columns.
#[derive(Iden)]
enum Events {
    StreamId,
    EventId,
    Message,
    Payload,
    CreatedAt,
    ReplayShard,
}

/// Snapshot table columns.
#[derive(Iden)]
enum Snapshots {
    StreamId,
    RevisionId,
    Payload,
}

/// SQLite implementation of EventStore.
pub struct SqliteEventStore {
    pool: SqlitePool,
    events_table: String,
    snapshots_table: String,
    observers: CommitObservers,
    transaction_max_size: usize,
}

impl SqliteEventStore {
    /// Create a store over an existing pool, using the default table names.
    pub fn new(pool: SqlitePool) -> Self {
        let defaults = StorageConfig::default();
        Self {
            pool,
            events_table: defaults.events_table(),
            snapshots_table: defaults.snapshots_table(),
            observers: CommitObservers::new(),
            transaction_max_size: DEFAULT_TRANSACTION_MAX_SIZE,
        }
    }

    /// Open (or create) the database at `path`.
    ///
    /// `:memory:` gives a private database per connection, so the pool is
    /// pinned to a single connection that is never recycled.
    pub async fn connect(path: &str) -> Result<Self> {
        let pool = if path == ":memory:" {
            let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await?
        } else {
            let opts = SqliteConnectOptions::from_str(path)?
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(30))
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(opts)
                .await?
        };
        Ok(Self::new(pool))
    }

    /// Use the given table names instead of the defaults.
    pub fn with_tables(
        mut self,
        events_table: impl Into<String>,
        snapshots_table: impl Into<String>,
    ) -> Self {
        self.events_table = events_table.into();
        self.snapshots_table = snapshots_table.into();
        self
    }

    pub fn with_transaction_max_size(mut self, max: usize) -> Self {
        self.transaction_max_size = max;
        self
    }

    /// Create tables and indexes if they do not exist.
    pub async fn init(&self) -> Result<()> {
        let events = format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
    stream_id TEXT NOT NULL,
    event_id INTEGER NOT NULL,
    message TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    replay_shard INTEGER NOT NULL,
    PRIMARY KEY (stream_id, event_id)
)"#,
            table = self.events_table
        );
        let replay_index = format!(
            r#"CREATE INDEX IF NOT EXISTS "{table}_replay" ON "{table}" (replay_shard, stream_id, event_id)"#,
            table = self.events_table
        );
        let snapshots = format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
    stream_id TEXT NOT NULL,
    revision_id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (stream_id, revision_id)
)"#,
            table = self.snapshots_table
        );

        for statement in [events, replay_index, snapshots] {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        debug!(events_table = %self.events_table, snapshots_table = %self.snapshots_table, "SQLite schema ready");
        Ok(())
    }

    fn events(&self) -> Alias {
        Alias::new(self.events_table.as_str())
    }

    fn snapshots(&self) -> Alias {
        Alias::new(self.snapshots_table.as_str())
    }

    /// Highest stored `event_id` of a stream, 0 if empty.
    async fn current_revision(&self, conn: &mut SqliteConnection, stream_id: &str) -> Result<u64> {
        let query = Query::select()
            .expr(Expr::col(Events::EventId).max())
            .from(self.events())
            .and_where(Expr::col(Events::StreamId).eq(stream_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&mut *conn).await?;
        let max: Option<i64> = row.try_get(0)?;
        Ok(max.map(|m| m as u64).unwrap_or(0))
    }

    async fn insert_event(&self, conn: &mut SqliteConnection, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)?;
        let query = Query::insert()
            .into_table(self.events())
            .columns([
                Events::StreamId,
                Events::EventId,
                Events::Message,
                Events::Payload,
                Events::CreatedAt,
                Events::ReplayShard,
            ])
            .values_panic([
                event.stream_id.as_str().into(),
                to_sql_revision(event.event_id)?.into(),
                event.message.as_str().into(),
                payload.into(),
                event.created_at.to_rfc3339().into(),
                shard_for(&event.stream_id).into(),
            ])
            .to_string(SqliteQueryBuilder);

        match sqlx::query(&query).execute(&mut *conn).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::StreamRevisionConflict {
                    stream_id: event.stream_id.clone(),
                    event_id: event.event_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append_checked(&self, conn: &mut SqliteConnection, event: &Event) -> Result<()> {
        let current = self.current_revision(conn, &event.stream_id).await?;
        if let Err(e) = check_next_revision(current, event) {
            warn!(
                stream_id = %event.stream_id,
                event_id = event.event_id,
                current_revision = current,
                "Stream revision conflict"
            );
            return Err(e);
        }
        self.insert_event(conn, event).await
    }

    async fn append_transaction(&self, conn: &mut SqliteConnection, events: &[Event]) -> Result<usize> {
        let batches = group_by_stream(events)?;

        for batch in &batches {
            let current = self.current_revision(conn, batch.stream_id).await?;
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
            for event in &batch.events {
                self.insert_event(conn, event).await.map_err(|e| match e {
                    StorageError::StreamRevisionConflict { stream_id, event_id } => {
                        StorageError::TransactionConflict(format!(
                            "event {} of stream '{}' already exists",
                            event_id, stream_id
                        ))
                    }
                    other => other,
                })?;
            }
        }

        Ok(batches.len())
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(conn: &mut SqliteConnection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(value)
        }
        Err(e) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(e)
        }
    }
}

fn to_sql_revision(revision: u64) -> Result<i64> {
    i64::try_from(revision).map_err(|_| {
        StorageError::InvalidArgument(format!("revision {} does not fit in SQLite INTEGER", revision))
    })
}

fn event_from_row(row: &SqliteRow) -> Result<Event> {
    let payload: String = row.try_get("payload")?;
    let created_at: String = row.try_get("created_at")?;
    let event_id: i64 = row.try_get("event_id")?;

    Ok(Event {
        stream_id: row.try_get("stream_id")?,
        event_id: event_id as u64,
        message: row.try_get("message")?,
        payload: serde_json::from_str::<Payload>(&payload)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StorageError::Corrupt(format!("created_at '{}': {}", created_at, e)))?,
    })
}

const EVENT_COLUMNS: [Events; 5] = [
    Events::StreamId,
    Events::EventId,
    Events::Message,
    Events::Payload,
    Events::CreatedAt,
];

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn save_event(&self, event: Event) -> Result<Event> {
        event.validate()?;

        // BEGIN IMMEDIATE acquires the write lock upfront, so the revision
        // read and the insert cannot interleave with another writer.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let result = self.append_checked(&mut conn, &event).await;
        finish(&mut conn, result).await?;

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
        if transaction.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let result = self.append_transaction(&mut conn, transaction.events()).await;
        let streams = finish(&mut conn, result).await?;

        debug!(streams, events = transaction.len(), "Committed transaction");
        Ok(())
    }

    async fn get_stream(&self, stream_id: &str) -> Result<Vec<Event>> {
        require_stream_id(stream_id)?;

        let query = Query::select()
            .columns(EVENT_COLUMNS)
            .from(self.events())
            .and_where(Expr::col(Events::StreamId).eq(stream_id))
            .order_by(Events::EventId, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn save_snapshot(&self, stream_id: &str, revision_id: u64, payload: Payload) -> Result<()> {
        let snapshot = Snapshot::new(stream_id, revision_id, payload)?;
        let payload = serde_json::to_string(&snapshot.payload)?;

        let query = Query::insert()
            .into_table(self.snapshots())
            .columns([Snapshots::StreamId, Snapshots::RevisionId, Snapshots::Payload])
            .values_panic([
                snapshot.stream_id.as_str().into(),
                to_sql_revision(revision_id)?.into(),
                payload.into(),
            ])
            .on_conflict(
                OnConflict::columns([Snapshots::StreamId, Snapshots::RevisionId])
                    .update_column(Snapshots::Payload)
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        debug!(stream_id = %stream_id, revision_id = revision_id, "Saved snapshot");
        Ok(())
    }

    async fn get_snapshot(&self, stream_id: &str) -> Result<Option<Snapshot>> {
        require_stream_id(stream_id)?;

        let query = Query::select()
            .columns([Snapshots::StreamId, Snapshots::RevisionId, Snapshots::Payload])
            .from(self.snapshots())
            .and_where(Expr::col(Snapshots::StreamId).eq(stream_id))
            .order_by(Snapshots::RevisionId, Order::Desc)
            .limit(1)
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let revision_id: i64 = row.try_get("revision_id")?;
        let payload: String = row.try_get("payload")?;
        Ok(Some(Snapshot {
            stream_id: row.try_get("stream_id")?,
            revision_id: revision_id as u64,
            payload: serde_json::from_str(&payload)?,
        }))
    }

    async fn replay_shard(&self, shard: u32) -> Result<Vec<Event>> {
        let query = Query::select()
            .columns(EVENT_COLUMNS)
            .from(self.events())
            .and_where(Expr::col(Events::ReplayShard).eq(shard))
            .order_by(Events::StreamId, Order::Asc)
            .order_by(Events::EventId, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }

    fn transaction_max_size(&self) -> usize {
        self.transaction_max_size
    }

    fn register_observer(&self, observer: Arc<dyn CommitObserver>) {
        self.observers.register(observer);
    }
}
