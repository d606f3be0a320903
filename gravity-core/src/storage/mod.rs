//! Local persistence.
//!
//! The backing medium is chosen once at startup by [`StorageBackend::probe`]
//! and injected everywhere else:
//! - `Structured`: SQLite database with one table per store area
//! - `KeyValue`: one JSON file per key, replaced atomically
//! - `Unavailable`: reads come back empty and writes are dropped

pub mod file;
pub mod models;
pub mod notes;
pub mod sqlite;

pub use file::FileStore;
pub use models::NoteRecord;
pub use notes::LocalNoteStore;
pub use sqlite::SqliteStore;

use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Logical store names. Each maps to its own table or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreArea {
    Notes,
    SyncQueue,
    Metadata,
    Session,
}

impl StoreArea {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Notes => "notes",
            Self::SyncQueue => "sync_queue",
            Self::Metadata => "metadata",
            Self::Session => "session",
        }
    }
}

/// Which medium a [`StorageBackend`] ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Structured,
    KeyValue,
    Unavailable,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structured => write!(f, "structured database"),
            Self::KeyValue => write!(f, "key-value files"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Storage medium selected by capability probe.
pub enum StorageBackend {
    Structured(SqliteStore),
    KeyValue(FileStore),
    Unavailable,
}

impl StorageBackend {
    /// Probe `dir` for the best available medium: a SQLite database first,
    /// then plain files, otherwise `Unavailable`.
    pub fn probe(dir: &Path) -> Self {
        let backend = match std::fs::create_dir_all(dir)
            .map_err(StorageError::from)
            .and_then(|_| SqliteStore::open(dir.join("gravity.db")))
        {
            Ok(store) => Self::Structured(store),
            Err(e) => {
                warn!("Structured storage unavailable ({}), trying key-value files", e);
                match FileStore::open(dir.join("kv")) {
                    Ok(store) => Self::KeyValue(store),
                    Err(e) => {
                        warn!("Key-value storage unavailable ({}), persistence disabled", e);
                        Self::Unavailable
                    }
                }
            }
        };
        info!("Local storage: {}", backend.kind());
        backend
    }

    /// In-memory structured backend for tests and throwaway sessions.
    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self::Structured(SqliteStore::in_memory()?))
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Structured(_) => BackendKind::Structured,
            Self::KeyValue(_) => BackendKind::KeyValue,
            Self::Unavailable => BackendKind::Unavailable,
        }
    }

    pub fn get(&self, area: StoreArea, key: &str) -> Result<Option<String>, StorageError> {
        match self {
            Self::Structured(db) => db.get(area, key),
            Self::KeyValue(files) => files.get(area, key),
            Self::Unavailable => Ok(None),
        }
    }

    pub fn put(&self, area: StoreArea, key: &str, value: &str) -> Result<(), StorageError> {
        match self {
            Self::Structured(db) => db.put(area, key, value),
            Self::KeyValue(files) => files.put(area, key, value),
            Self::Unavailable => Ok(()),
        }
    }

    pub fn remove(&self, area: StoreArea, key: &str) -> Result<(), StorageError> {
        match self {
            Self::Structured(db) => db.remove(area, key),
            Self::KeyValue(files) => files.remove(area, key),
            Self::Unavailable => Ok(()),
        }
    }

    /// Load the note set for `scope`.
    pub fn load_notes(&self, scope: &str) -> Result<Vec<NoteRecord>, StorageError> {
        match self {
            Self::Structured(db) => db.load_notes(scope),
            Self::KeyValue(files) => match files.get(StoreArea::Notes, scope)? {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| StorageError::Serialization(e.to_string())),
                None => Ok(Vec::new()),
            },
            Self::Unavailable => Ok(Vec::new()),
        }
    }

    /// Replace the note set for `scope` in one atomic step.
    pub fn replace_notes(&self, scope: &str, notes: &[NoteRecord]) -> Result<(), StorageError> {
        match self {
            Self::Structured(db) => db.replace_notes(scope, notes),
            Self::KeyValue(files) => {
                let raw = serde_json::to_string(notes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                files.put(StoreArea::Notes, scope, &raw)
            }
            Self::Unavailable => Ok(()),
        }
    }
}
