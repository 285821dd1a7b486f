//! SQLite store for sessions, images, containers and messages.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use convoy_domain::{now_millis, Error, Result};

use crate::records::{ContainerRecord, ImageKind, ImageRecord, MessageRecord, SessionRecord};

fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        tracing::info!(path = %db_path.display(), "session store opened");
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
                CREATE TABLE IF NOT EXISTS sessions (
                    session_id TEXT PRIMARY KEY,
                    image_id TEXT NOT NULL,
                    container_id TEXT NOT NULL,
                    title TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS images (
                    image_id TEXT PRIMARY KEY,
                    type TEXT NOT NULL,
                    definition_name TEXT NOT NULL,
                    parent_image_id TEXT,
                    definition_json TEXT NOT NULL,
                    config_json TEXT NOT NULL,
                    messages_json TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS containers (
                    container_id TEXT PRIMARY KEY,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    config_json TEXT
                );

                CREATE TABLE IF NOT EXISTS messages (
                    message_id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    subtype TEXT,
                    content_json TEXT NOT NULL,
                    timestamp INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_messages_session
                    ON messages(session_id, timestamp);
                "#,
            )
            .map_err(db_err)
    }

    // ── Sessions ─────────────────────────────────────────────────────

    /// Allocate and persist a new session bound to an image and a
    /// container.
    pub fn create_session(
        &self,
        image_id: &str,
        container_id: &str,
        title: Option<&str>,
    ) -> Result<SessionRecord> {
        let now = now_millis();
        let record = SessionRecord {
            session_id: uuid::Uuid::new_v4().to_string(),
            image_id: image_id.to_owned(),
            container_id: container_id.to_owned(),
            title: title.map(str::to_owned),
            created_at: now,
            updated_at: now,
        };
        self.conn
            .lock()
            .execute(
                r#"
                INSERT INTO sessions
                    (session_id, image_id, container_id, title, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    &record.session_id,
                    &record.image_id,
                    &record.container_id,
                    &record.title,
                    record.created_at,
                    record.updated_at
                ],
            )
            .map_err(db_err)?;
        Ok(record)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.conn
            .lock()
            .query_row(
                r#"
                SELECT session_id, image_id, container_id, title, created_at, updated_at
                FROM sessions WHERE session_id = ?1
                "#,
                [session_id],
                |row| {
                    Ok(SessionRecord {
                        session_id: row.get(0)?,
                        image_id: row.get(1)?,
                        container_id: row.get(2)?,
                        title: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT session_id, image_id, container_id, title, created_at, updated_at
                FROM sessions ORDER BY updated_at DESC
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SessionRecord {
                    session_id: row.get(0)?,
                    image_id: row.get(1)?,
                    container_id: row.get(2)?,
                    title: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub fn touch_session(&self, session_id: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE sessions SET updated_at = ?2 WHERE session_id = ?1",
                params![session_id, now_millis()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_session_title(&self, session_id: &str, title: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE sessions SET title = ?2, updated_at = ?3 WHERE session_id = ?1",
                params![session_id, title, now_millis()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Delete a session and its message collection.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM messages WHERE session_id = ?1", [session_id])
            .map_err(db_err)?;
        let deleted = conn
            .execute("DELETE FROM sessions WHERE session_id = ?1", [session_id])
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    // ── Images ───────────────────────────────────────────────────────

    pub fn insert_image(&self, image: &ImageRecord) -> Result<()> {
        self.conn
            .lock()
            .execute(
                r#"
                INSERT INTO images
                    (image_id, type, definition_name, parent_image_id,
                     definition_json, config_json, messages_json, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    &image.image_id,
                    image.kind.as_str(),
                    &image.definition_name,
                    &image.parent_image_id,
                    serde_json::to_string(&image.definition)?,
                    serde_json::to_string(&image.config)?,
                    serde_json::to_string(&image.messages)?,
                    image.created_at
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_image(&self, image_id: &str) -> Result<Option<ImageRecord>> {
        let row = self
            .conn
            .lock()
            .query_row(
                r#"
                SELECT image_id, type, definition_name, parent_image_id,
                       definition_json, config_json, messages_json, created_at
                FROM images WHERE image_id = ?1
                "#,
                [image_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some((image_id, kind, definition_name, parent, definition, config, messages, created)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(ImageRecord {
            image_id,
            kind: ImageKind::parse(&kind)
                .ok_or_else(|| Error::Storage(format!("unknown image type: {kind}")))?,
            definition_name,
            parent_image_id: parent,
            definition: serde_json::from_str(&definition)?,
            config: serde_json::from_str(&config)?,
            messages: serde_json::from_str(&messages)?,
            created_at: created,
        }))
    }

    // ── Containers ───────────────────────────────────────────────────

    pub fn create_container(&self, config: Option<&Value>) -> Result<ContainerRecord> {
        let now = now_millis();
        let record = ContainerRecord {
            container_id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            config: config.cloned(),
        };
        let config_json = match &record.config {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        self.conn
            .lock()
            .execute(
                r#"
                INSERT INTO containers (container_id, created_at, updated_at, config_json)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![&record.container_id, now, now, config_json],
            )
            .map_err(db_err)?;
        Ok(record)
    }

    pub fn get_container(&self, container_id: &str) -> Result<Option<ContainerRecord>> {
        let row = self
            .conn
            .lock()
            .query_row(
                r#"
                SELECT container_id, created_at, updated_at, config_json
                FROM containers WHERE container_id = ?1
                "#,
                [container_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some((container_id, created_at, updated_at, config_json)) = row else {
            return Ok(None);
        };
        Ok(Some(ContainerRecord {
            container_id,
            created_at,
            updated_at,
            config: match config_json {
                Some(raw) => Some(serde_json::from_str(&raw)?),
                None => None,
            },
        }))
    }

    pub fn delete_container(&self, container_id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .lock()
            .execute(
                "DELETE FROM containers WHERE container_id = ?1",
                [container_id],
            )
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    // ── Messages ─────────────────────────────────────────────────────

    /// Persist one message. Re-delivered ACKs upsert idempotently.
    pub fn insert_message(&self, message: &MessageRecord) -> Result<()> {
        self.conn
            .lock()
            .execute(
                r#"
                INSERT INTO messages
                    (message_id, session_id, role, subtype, content_json, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(message_id) DO NOTHING
                "#,
                params![
                    &message.message_id,
                    &message.session_id,
                    &message.role,
                    &message.subtype,
                    serde_json::to_string(&message.content)?,
                    message.timestamp
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn messages_for_session(&self, session_id: &str) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT message_id, session_id, role, subtype, content_json, timestamp
                FROM messages WHERE session_id = ?1
                ORDER BY timestamp ASC, message_id ASC
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(message_id, session_id, role, subtype, content, timestamp)| {
                Ok(MessageRecord {
                    message_id,
                    session_id,
                    role,
                    subtype,
                    content: serde_json::from_str(&content)?,
                    timestamp,
                })
            })
            .collect()
    }
}
