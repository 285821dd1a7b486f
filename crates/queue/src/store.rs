//! SQLite persistence for queue entries and consumers.
//!
//! Two relations: `queue_entries(topic, cursor, event_json, created_at)`
//! keyed by `(topic, cursor)`, and `consumers(consumer_id, topic,
//! cursor, last_activity_at)` keyed by `(consumer_id, topic)`. Cursors
//! are strings that sort lexicographically in append order, so range
//! scans use plain string comparison.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use convoy_domain::{Error, Event, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub topic: String,
    pub cursor: String,
    pub event: Event,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Consumer {
    pub consumer_id: String,
    pub topic: String,
    pub cursor: Option<String>,
    pub last_activity_at: i64,
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

pub struct QueueStore {
    conn: Mutex<Connection>,
}

impl QueueStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS queue_entries (
                    topic TEXT NOT NULL,
                    cursor TEXT NOT NULL,
                    event_json TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (topic, cursor)
                );

                CREATE INDEX IF NOT EXISTS idx_entries_age
                    ON queue_entries(topic, created_at);

                CREATE TABLE IF NOT EXISTS consumers (
                    consumer_id TEXT NOT NULL,
                    topic TEXT NOT NULL,
                    cursor TEXT,
                    last_activity_at INTEGER NOT NULL,
                    PRIMARY KEY (consumer_id, topic)
                );
                "#,
            )
            .map_err(db_err)
    }

    // ── Entries ──────────────────────────────────────────────────────

    pub fn insert_entry(&self, entry: &QueueEntry) -> Result<()> {
        let event_json = serde_json::to_string(&entry.event)?;
        self.conn
            .lock()
            .execute(
                r#"
                INSERT INTO queue_entries (topic, cursor, event_json, created_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![&entry.topic, &entry.cursor, &event_json, entry.created_at],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Entries with cursor strictly greater than `after`, in cursor
    /// order. `after = None` starts from the beginning.
    pub fn entries_after(
        &self,
        topic: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT topic, cursor, event_json, created_at
                FROM queue_entries
                WHERE topic = ?1 AND cursor > ?2
                ORDER BY cursor ASC
                LIMIT ?3
                "#,
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(
                params![topic, after.unwrap_or(""), limit as i64],
                row_to_entry,
            )
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;

        rows.into_iter().map(decode_entry).collect()
    }

    /// Entries in `(after, upto]`, in cursor order (the range an ACK
    /// newly covers).
    pub fn entries_between(
        &self,
        topic: &str,
        after: Option<&str>,
        upto: &str,
    ) -> Result<Vec<QueueEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT topic, cursor, event_json, created_at
                FROM queue_entries
                WHERE topic = ?1 AND cursor > ?2 AND cursor <= ?3
                ORDER BY cursor ASC
                "#,
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![topic, after.unwrap_or(""), upto], row_to_entry)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;

        rows.into_iter().map(decode_entry).collect()
    }

    pub fn latest_cursor(&self, topic: &str) -> Result<Option<String>> {
        self.conn
            .lock()
            .query_row(
                "SELECT MAX(cursor) FROM queue_entries WHERE topic = ?1",
                [topic],
                |row| row.get(0),
            )
            .map_err(db_err)
    }

    pub fn count_entries(&self, topic: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM queue_entries WHERE topic = ?1",
                [topic],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as usize)
    }

    /// Topics present in either relation.
    pub fn topics(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT topic FROM queue_entries
                UNION
                SELECT topic FROM consumers
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Delete entries older than `age_cutoff` whose cursor is below
    /// `min_cursor` (`None` lifts the cursor bound — no live consumer
    /// cursor protects anything). Returns the number deleted.
    pub fn delete_expired(
        &self,
        topic: &str,
        age_cutoff: i64,
        min_cursor: Option<&str>,
    ) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = match min_cursor {
            Some(min) => conn
                .execute(
                    r#"
                    DELETE FROM queue_entries
                    WHERE topic = ?1 AND created_at < ?2 AND cursor < ?3
                    "#,
                    params![topic, age_cutoff, min],
                )
                .map_err(db_err)?,
            None => conn
                .execute(
                    "DELETE FROM queue_entries WHERE topic = ?1 AND created_at < ?2",
                    params![topic, age_cutoff],
                )
                .map_err(db_err)?,
        };
        Ok(deleted)
    }

    /// Trim the oldest entries beyond `max_entries`. Returns the number
    /// deleted.
    pub fn trim_to_cap(&self, topic: &str, max_entries: usize) -> Result<usize> {
        let count = self.count_entries(topic)?;
        if count <= max_entries {
            return Ok(0);
        }
        let excess = (count - max_entries) as i64;
        self.conn
            .lock()
            .execute(
                r#"
                DELETE FROM queue_entries
                WHERE topic = ?1 AND cursor IN (
                    SELECT cursor FROM queue_entries
                    WHERE topic = ?1
                    ORDER BY cursor ASC
                    LIMIT ?2
                )
                "#,
                params![topic, excess],
            )
            .map_err(db_err)
    }

    // ── Consumers ────────────────────────────────────────────────────

    pub fn insert_consumer(&self, consumer: &Consumer) -> Result<()> {
        self.conn
            .lock()
            .execute(
                r#"
                INSERT INTO consumers (consumer_id, topic, cursor, last_activity_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(consumer_id, topic) DO UPDATE SET
                    last_activity_at = ?4
                "#,
                params![
                    &consumer.consumer_id,
                    &consumer.topic,
                    &consumer.cursor,
                    consumer.last_activity_at
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_consumer(&self, consumer_id: &str, topic: &str) -> Result<Option<Consumer>> {
        self.conn
            .lock()
            .query_row(
                r#"
                SELECT consumer_id, topic, cursor, last_activity_at
                FROM consumers
                WHERE consumer_id = ?1 AND topic = ?2
                "#,
                params![consumer_id, topic],
                |row| {
                    Ok(Consumer {
                        consumer_id: row.get(0)?,
                        topic: row.get(1)?,
                        cursor: row.get(2)?,
                        last_activity_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)
    }

    /// Max-merge the consumer cursor and bump activity. Returns the
    /// cursor stored before the merge.
    pub fn advance_consumer(
        &self,
        consumer_id: &str,
        topic: &str,
        cursor: &str,
        now: i64,
    ) -> Result<Option<String>> {
        let previous = self
            .get_consumer(consumer_id, topic)?
            .ok_or_else(|| Error::NotFound(format!("consumer {consumer_id} on {topic}")))?
            .cursor;

        self.conn
            .lock()
            .execute(
                r#"
                UPDATE consumers
                SET cursor = CASE
                        WHEN cursor IS NULL OR cursor < ?3 THEN ?3
                        ELSE cursor
                    END,
                    last_activity_at = ?4
                WHERE consumer_id = ?1 AND topic = ?2
                "#,
                params![consumer_id, topic, cursor, now],
            )
            .map_err(db_err)?;

        Ok(previous)
    }

    pub fn touch_consumer(&self, consumer_id: &str, topic: &str, now: i64) -> Result<()> {
        self.conn
            .lock()
            .execute(
                r#"
                UPDATE consumers SET last_activity_at = ?3
                WHERE consumer_id = ?1 AND topic = ?2
                "#,
                params![consumer_id, topic, now],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn delete_consumer(&self, consumer_id: &str, topic: &str) -> Result<bool> {
        let deleted = self
            .conn
            .lock()
            .execute(
                "DELETE FROM consumers WHERE consumer_id = ?1 AND topic = ?2",
                params![consumer_id, topic],
            )
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    /// Lowest ACKed cursor among live consumers of `topic`. `None` when
    /// no consumer has ACKed anything (nothing is cursor-protected).
    pub fn min_live_cursor(&self, topic: &str) -> Result<Option<String>> {
        self.conn
            .lock()
            .query_row(
                r#"
                SELECT MIN(cursor) FROM consumers
                WHERE topic = ?1 AND cursor IS NOT NULL
                "#,
                [topic],
                |row| row.get(0),
            )
            .map_err(db_err)
    }

    pub fn purge_stale_consumers(&self, cutoff: i64) -> Result<usize> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM consumers WHERE last_activity_at < ?1",
                [cutoff],
            )
            .map_err(db_err)
    }
}

struct RawEntry {
    topic: String,
    cursor: String,
    event_json: String,
    created_at: i64,
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> std::result::Result<RawEntry, rusqlite::Error> {
    Ok(RawEntry {
        topic: row.get(0)?,
        cursor: row.get(1)?,
        event_json: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn decode_entry(raw: RawEntry) -> Result<QueueEntry> {
    Ok(QueueEntry {
        event: serde_json::from_str(&raw.event_json)?,
        topic: raw.topic,
        cursor: raw.cursor,
        created_at: raw.created_at,
    })
}
