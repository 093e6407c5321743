// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable buffer for change events.
//!
//! An embedded, ordered, crash-safe event queue persisted to a single SQLite
//! file. Events are keyed by `{unix_nanos}_{id}` so a forward scan yields
//! ingestion-time order; the value is the JSON-serialized [`Event`]. Key and
//! value formats are the only cross-version persistence contract.
//!
//! The same file carries the change-stream resume token (`stream_cursor`
//! table) so a restarted process resumes where the previous one left off.
//!
//! # Durability
//!
//! WAL journal with `synchronous = NORMAL`: `store()` returns only after the
//! write reaches the WAL. A crash before return may lose the event; a crash
//! after return must not.
//!
//! # Readiness Scan
//!
//! `ready_events(n)` walks forward from the smallest key, decoding and
//! selecting events whose `ready_at` is absent or within the configured
//! window, stopping at n matches. It is O(#scanned), not O(#ready); the
//! queue is expected to stay small while the downstream is healthy.
//!
//! # Write Contention
//!
//! The pool holds two connections, so a writer can briefly collide with the
//! drain scan on the other connection. Contended writes (SQLITE_BUSY /
//! SQLITE_LOCKED) back off and retry a few times before surfacing as
//! [`RelayError::Storage`].

use crate::error::{RelayError, Result};
use crate::event::{storage_key, Event};
use crate::metrics;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Contended writes are retried this many times in total.
const BUSY_ATTEMPTS: u32 = 4;
const BUSY_BASE_DELAY: Duration = Duration::from_millis(15);
const BUSY_MAX_DELAY: Duration = Duration::from_millis(250);

/// Name of the single row in `stream_cursor` holding the resume token.
const UPSTREAM_CURSOR: &str = "upstream";

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6) mean another connection holds the
/// write lock; anything else is a real storage error.
fn sqlite_contended(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = e else {
        return false;
    };
    matches!(db.code().as_deref(), Some("5") | Some("6"))
        || db.message().to_lowercase().contains("locked")
}

/// Durable, ordered event queue backed by a single SQLite file.
///
/// All mutating operations are serialized by the engine; readers see a
/// consistent snapshot. The buffer exclusively owns the file - other
/// components only hold transient copies of events it returns.
pub struct EventBuffer {
    pool: SqlitePool,
    /// Early-release slack applied by the readiness scan.
    ready_window: chrono::Duration,
    path: String,
}

impl EventBuffer {
    /// Open (or create) the buffer file and run table setup.
    pub async fn open(path: impl AsRef<Path>, ready_window: Duration) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening event buffer");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| RelayError::Config(format!("Invalid buffer path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2) // single writer, occasional concurrent reader
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stream_cursor (
                name       TEXT PRIMARY KEY,
                token      TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = std::fs::metadata(&path_str) {
                let mut perms = meta.permissions();
                perms.set_mode(0o600);
                if let Err(e) = std::fs::set_permissions(&path_str, perms) {
                    warn!(path = %path_str, error = %e, "Failed to restrict buffer file mode");
                }
            }
        }

        let ready_window =
            chrono::Duration::from_std(ready_window).unwrap_or_else(|_| chrono::Duration::MAX);

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&pool)
            .await?;
        if count.0 > 0 {
            info!(count = count.0, "Restored buffered events from previous run");
        }

        Ok(Self {
            pool,
            ready_window,
            path: path_str,
        })
    }

    /// Run a write, backing off while the database is contended. Gives up
    /// after [`BUSY_ATTEMPTS`] tries and surfaces the storage error.
    async fn retry_busy<F, Fut, T>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut delay = BUSY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < BUSY_ATTEMPTS && sqlite_contended(&e) => {
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Buffer contended, backing off"
                    );
                    metrics::record_buffer_retry(operation);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(BUSY_MAX_DELAY);
                    attempt += 1;
                }
                Err(e) => return Err(RelayError::Storage(e)),
            }
        }
    }

    /// Durably persist an event. An existing event with the same
    /// `(timestamp, id)` key is overwritten (later write wins).
    pub async fn store(&self, event: &Event) -> Result<()> {
        let key = event.storage_key();
        let value = serde_json::to_string(event)?;
        let pool = &self.pool;

        self.retry_busy("store", || async {
            sqlx::query(
                r#"
                INSERT INTO events (key, value) VALUES (?, ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(&key)
            .bind(&value)
            .execute(pool)
            .await
        })
        .await?;

        debug!(key = %key, operation = %event.operation, "Event stored");
        Ok(())
    }

    /// Fetch up to `max` events in key order, regardless of readiness.
    ///
    /// Rows that fail to decode are skipped with a warning; they do not
    /// count toward `max`.
    pub async fn batch(&self, max: usize) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        let mut rows =
            sqlx::query_as::<_, (String, String)>("SELECT key, value FROM events ORDER BY key ASC")
                .fetch(&self.pool);

        while let Some((key, value)) = rows.try_next().await? {
            if events.len() >= max {
                break;
            }
            match serde_json::from_str::<Event>(&value) {
                Ok(event) => events.push(event),
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable buffered event"),
            }
        }

        Ok(events)
    }

    /// Fetch up to `max` *ready* events in key order.
    ///
    /// An event is ready when `ready_at` is absent or falls within the
    /// configured window of now (inclusive). Not-yet-ready events are
    /// skipped; later-keyed ready events may therefore overtake them within
    /// a scan.
    pub async fn ready_events(&self, max: usize) -> Result<Vec<Event>> {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut rows =
            sqlx::query_as::<_, (String, String)>("SELECT key, value FROM events ORDER BY key ASC")
                .fetch(&self.pool);

        while let Some((key, value)) = rows.try_next().await? {
            if events.len() >= max {
                break;
            }
            match serde_json::from_str::<Event>(&value) {
                Ok(event) => {
                    if event.is_ready(now, self.ready_window) {
                        events.push(event);
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable buffered event"),
            }
        }

        Ok(events)
    }

    /// Remove an event by primary key. Deleting an absent key is a no-op.
    pub async fn delete(&self, id: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let key = storage_key(timestamp, id);
        let pool = &self.pool;

        self.retry_busy("delete", || async {
            sqlx::query("DELETE FROM events WHERE key = ?")
                .bind(&key)
                .execute(pool)
                .await
        })
        .await?;

        Ok(())
    }

    /// Atomically replace the retry counter of a stored event.
    ///
    /// Returns [`RelayError::NotFound`] when the key is absent (the event
    /// was delivered or pruned concurrently).
    pub async fn update_retries(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
        retries: u32,
    ) -> Result<()> {
        let key = storage_key(timestamp, id);

        let mut tx = self.pool.begin().await?;

        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM events WHERE key = ?")
            .bind(&key)
            .fetch_optional(&mut *tx)
            .await?;

        let Some((value,)) = row else {
            return Err(RelayError::NotFound { key });
        };

        let mut event: Event = serde_json::from_str(&value)?;
        event.retries = retries;
        let updated = serde_json::to_string(&event)?;

        sqlx::query("UPDATE events SET value = ? WHERE key = ?")
            .bind(&updated)
            .bind(&key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Total number of buffered events.
    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Persist the upstream change-stream resume token.
    pub async fn save_resume_token(&self, token: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let pool = &self.pool;

        self.retry_busy("save_resume_token", || async {
            sqlx::query(
                r#"
                INSERT INTO stream_cursor (name, token, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(name) DO UPDATE SET
                    token = excluded.token,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(UPSTREAM_CURSOR)
            .bind(token)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        Ok(())
    }

    /// Load the persisted resume token, if any.
    pub async fn load_resume_token(&self) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT token FROM stream_cursor WHERE name = ?")
                .bind(UPSTREAM_CURSOR)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(token,)| token))
    }

    /// Buffer file path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        let pool = &self.pool;
        let checkpoint = self
            .retry_busy("checkpoint", || async {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                    .execute(pool)
                    .await
            })
            .await;
        if let Err(e) = checkpoint {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }

        self.pool.close().await;
        info!("Event buffer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Operation;
    use chrono::TimeZone;
    use serde_json::Map;
    use tempfile::tempdir;

    fn event_at(id: &str, nanos: i64) -> Event {
        Event::new(
            id.to_string(),
            Operation::Insert,
            Utc.timestamp_nanos(nanos),
            Map::new(),
            None,
        )
    }

    async fn open_buffer(dir: &tempfile::TempDir, window: Duration) -> EventBuffer {
        let path = dir.path().join("buffer.db");
        EventBuffer::open(&path, window).await.unwrap()
    }

    #[tokio::test]
    async fn test_store_and_batch_in_key_order() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir, Duration::ZERO).await;

        // Stored out of order; batch returns key order.
        buffer
            .store(&event_at("b", 1_700_000_000_000_000_002))
            .await
            .unwrap();
        buffer
            .store(&event_at("a", 1_700_000_000_000_000_001))
            .await
            .unwrap();
        buffer
            .store(&event_at("c", 1_700_000_000_000_000_003))
            .await
            .unwrap();

        let events = buffer.batch(10).await.unwrap();
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let limited = buffer.batch(2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, "a");

        buffer.close().await;
    }

    #[tokio::test]
    async fn test_store_delete_restores_count() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir, Duration::ZERO).await;

        let before = buffer.count().await.unwrap();
        let event = event_at("x", 1_700_000_000_000_000_042);
        buffer.store(&event).await.unwrap();
        assert_eq!(buffer.count().await.unwrap(), before + 1);

        buffer.delete(&event.id, event.timestamp).await.unwrap();
        assert_eq!(buffer.count().await.unwrap(), before);

        buffer.close().await;
    }

    #[tokio::test]
    async fn test_delete_absent_key_is_noop() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir, Duration::ZERO).await;

        let result = buffer
            .delete("nonexistent", Utc.timestamp_nanos(1_700_000_000_000_000_000))
            .await;
        assert!(result.is_ok());

        buffer.close().await;
    }

    #[tokio::test]
    async fn test_ready_events_strict_window() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir, Duration::ZERO).await;

        let now = Utc::now();
        let mut immediate = event_at("now", 1_700_000_000_000_000_001);
        immediate.ready_at = None;
        let mut scheduled = event_at("later", 1_700_000_000_000_000_002);
        scheduled.ready_at = Some(now + chrono::Duration::seconds(60));
        let mut overdue = event_at("past", 1_700_000_000_000_000_003);
        overdue.ready_at = Some(now - chrono::Duration::seconds(60));

        buffer.store(&immediate).await.unwrap();
        buffer.store(&scheduled).await.unwrap();
        buffer.store(&overdue).await.unwrap();

        let ready = buffer.ready_events(10).await.unwrap();
        let ids: Vec<&str> = ready.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["now", "past"]);

        buffer.close().await;
    }

    #[tokio::test]
    async fn test_ready_events_early_release_window() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir, Duration::from_secs(30 * 60)).await;

        let now = Utc::now();
        let mut near = event_at("near", 1_700_000_000_000_000_001);
        near.ready_at = Some(now + chrono::Duration::minutes(10));
        let mut far = event_at("far", 1_700_000_000_000_000_002);
        far.ready_at = Some(now + chrono::Duration::minutes(45));

        buffer.store(&near).await.unwrap();
        buffer.store(&far).await.unwrap();

        let ready = buffer.ready_events(10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "near");

        buffer.close().await;
    }

    #[tokio::test]
    async fn test_ready_events_stops_at_max_matches() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir, Duration::ZERO).await;

        for i in 0..10 {
            buffer
                .store(&event_at(
                    &format!("e{}", i),
                    1_700_000_000_000_000_000 + i,
                ))
                .await
                .unwrap();
        }

        let ready = buffer.ready_events(4).await.unwrap();
        assert_eq!(ready.len(), 4);
        assert_eq!(ready[0].id, "e0");
        assert_eq!(ready[3].id, "e3");

        buffer.close().await;
    }

    #[tokio::test]
    async fn test_update_retries_visible_in_batch() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir, Duration::ZERO).await;

        let event = event_at("r", 1_700_000_000_000_000_009);
        buffer.store(&event).await.unwrap();

        buffer
            .update_retries(&event.id, event.timestamp, 7)
            .await
            .unwrap();

        let events = buffer.batch(1).await.unwrap();
        assert_eq!(events[0].retries, 7);
        // Everything else round-trips unchanged.
        assert_eq!(events[0].id, event.id);
        assert_eq!(events[0].timestamp, event.timestamp);

        buffer.close().await;
    }

    #[tokio::test]
    async fn test_update_retries_absent_key_not_found() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir, Duration::ZERO).await;

        let result = buffer
            .update_retries("ghost", Utc.timestamp_nanos(1_700_000_000_000_000_000), 1)
            .await;
        assert!(matches!(result, Err(RelayError::NotFound { .. })));

        buffer.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_key_last_write_wins() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir, Duration::ZERO).await;

        let mut first = event_at("dup", 1_700_000_000_000_000_000);
        first.retries = 1;
        let mut second = first.clone();
        second.retries = 2;

        buffer.store(&first).await.unwrap();
        buffer.store(&second).await.unwrap();

        assert_eq!(buffer.count().await.unwrap(), 1);
        let events = buffer.batch(1).await.unwrap();
        assert_eq!(events[0].retries, 2);

        buffer.close().await;
    }

    #[tokio::test]
    async fn test_events_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");

        {
            let buffer = EventBuffer::open(&path, Duration::ZERO).await.unwrap();
            buffer
                .store(&event_at("keep", 1_700_000_000_000_000_055))
                .await
                .unwrap();
            buffer.close().await;
        }

        {
            let buffer = EventBuffer::open(&path, Duration::ZERO).await.unwrap();
            assert_eq!(buffer.count().await.unwrap(), 1);
            let events = buffer.batch(1).await.unwrap();
            assert_eq!(events[0].id, "keep");
            buffer.close().await;
        }
    }

    #[tokio::test]
    async fn test_resume_token_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cursor.db");

        {
            let buffer = EventBuffer::open(&path, Duration::ZERO).await.unwrap();
            assert!(buffer.load_resume_token().await.unwrap().is_none());

            buffer.save_resume_token(r#"{"_data":"8264A1"}"#).await.unwrap();
            buffer.save_resume_token(r#"{"_data":"8264A2"}"#).await.unwrap();
            buffer.close().await;
        }

        {
            let buffer = EventBuffer::open(&path, Duration::ZERO).await.unwrap();
            assert_eq!(
                buffer.load_resume_token().await.unwrap().as_deref(),
                Some(r#"{"_data":"8264A2"}"#)
            );
            buffer.close().await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_buffer_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("mode.db");
        let buffer = EventBuffer::open(&path, Duration::ZERO).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        buffer.close().await;
    }

    #[test]
    fn test_contention_check_ignores_other_errors() {
        assert!(!sqlite_contended(&sqlx::Error::RowNotFound));
        assert!(!sqlite_contended(&sqlx::Error::PoolTimedOut));
    }
}
