//! Structured on-device database backed by SQLite.

use crate::storage::models::NoteRecord;
use crate::storage::{StorageError, StoreArea};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Current schema version. Incremented when the schema changes.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// SQLite connection and schema manager
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open a database at the specified path and make sure the schema exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Create a new in-memory database for testing
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::LockPoisoned("sqlite store".to_string()))
    }

    /// Initialize the database schema
    pub fn initialize_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS notes (
                scope TEXT NOT NULL,
                note_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                markdown_text TEXT NOT NULL,
                attachments TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                pinned INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (scope, note_id)
            );

            CREATE INDEX IF NOT EXISTS idx_notes_scope_position ON notes(scope, position);",
        )?;

        for area in [StoreArea::SyncQueue, StoreArea::Metadata, StoreArea::Session] {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );",
                area.name()
            ))?;
        }

        conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
        Ok(())
    }

    /// Schema version recorded in the database header.
    pub fn schema_version(&self) -> Result<i32, StorageError> {
        let conn = self.conn()?;
        let version = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        Ok(version)
    }

    /// Read a value from a key-value area.
    pub fn get(&self, area: StoreArea, key: &str) -> Result<Option<String>, StorageError> {
        let table = kv_table(area)?;
        let conn = self.conn()?;
        let value = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", table),
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Write (upsert) a value in a key-value area.
    pub fn put(&self, area: StoreArea, key: &str, value: &str) -> Result<(), StorageError> {
        let table = kv_table(area)?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                table
            ),
            rusqlite::params![key, value, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Remove a key from a key-value area.
    pub fn remove(&self, area: StoreArea, key: &str) -> Result<(), StorageError> {
        let table = kv_table(area)?;
        let conn = self.conn()?;
        conn.execute(&format!("DELETE FROM {} WHERE key = ?1", table), [key])?;
        Ok(())
    }

    /// Load every note in `scope`, in the order they were saved.
    pub fn load_notes(&self, scope: &str) -> Result<Vec<NoteRecord>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT note_id, markdown_text, attachments, created_at, updated_at,
                    last_activity_at, pinned
             FROM notes
             WHERE scope = ?1
             ORDER BY position ASC",
        )?;

        let rows = stmt.query_map([scope], |row| {
            Ok((
                row.get::<_, String>(0)?, // note_id
                row.get::<_, String>(1)?, // markdown_text
                row.get::<_, String>(2)?, // attachments (json)
                row.get::<_, String>(3)?, // created_at
                row.get::<_, String>(4)?, // updated_at
                row.get::<_, String>(5)?, // last_activity_at
                row.get::<_, bool>(6)?,   // pinned
            ))
        })?;

        let mut notes = Vec::new();
        for row in rows {
            let (note_id, markdown_text, attachments, created_at, updated_at, last_activity, pinned) =
                row?;
            let attachments = serde_json::from_str(&attachments)
                .map_err(|e| StorageError::Serialization(format!("attachments of {}: {}", note_id, e)))?;
            notes.push(NoteRecord {
                note_id,
                markdown_text,
                attachments,
                created_at_iso: created_at,
                updated_at_iso: updated_at,
                last_activity_iso: last_activity,
                pinned,
            });
        }

        Ok(notes)
    }

    /// Replace every note in `scope` inside one transaction.
    pub fn replace_notes(&self, scope: &str, notes: &[NoteRecord]) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM notes WHERE scope = ?1", [scope])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO notes (
                    scope, note_id, position, markdown_text, attachments,
                    created_at, updated_at, last_activity_at, pinned
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (position, note) in notes.iter().enumerate() {
                let attachments = serde_json::to_string(&note.attachments)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                stmt.execute(rusqlite::params![
                    scope,
                    note.note_id,
                    position as i64,
                    note.markdown_text,
                    attachments,
                    note.created_at_iso,
                    note.updated_at_iso,
                    note.last_activity_iso,
                    note.pinned,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }
}

fn kv_table(area: StoreArea) -> Result<&'static str, StorageError> {
    match area {
        StoreArea::Notes => Err(StorageError::Unsupported(
            "notes are stored as rows, not key-value pairs".to_string(),
        )),
        other => Ok(other.name()),
    }
}
