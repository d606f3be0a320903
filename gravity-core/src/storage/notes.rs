//! Per-user note persistence on top of a [`StorageBackend`].

use crate::storage::models::NoteRecord;
use crate::storage::{StorageBackend, StorageError};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Scope used while nobody is signed in.
pub const ANONYMOUS_SCOPE: &str = "anonymous";

/// Derive the storage scope for a user. Ids are hashed so the raw subject
/// never becomes a table key or file name.
pub fn scope_for_user(user_id: Option<&str>) -> String {
    match user_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => {
            let digest = hex::encode(Sha256::digest(id.as_bytes()));
            format!("user-{}", &digest[..32])
        }
        None => ANONYMOUS_SCOPE.to_string(),
    }
}

/// The full note set of one user. All writes go through [`LocalNoteStore::save_all`].
#[derive(Clone)]
pub struct LocalNoteStore {
    backend: Arc<StorageBackend>,
    scope: String,
}

impl LocalNoteStore {
    pub fn for_user(backend: Arc<StorageBackend>, user_id: Option<&str>) -> Self {
        Self {
            backend,
            scope: scope_for_user(user_id),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn backend(&self) -> &Arc<StorageBackend> {
        &self.backend
    }

    pub fn load_all(&self) -> Result<Vec<NoteRecord>, StorageError> {
        self.backend.load_notes(&self.scope)
    }

    /// Replace the stored set. Readers see either the old set or the new one.
    pub fn save_all(&self, records: &[NoteRecord]) -> Result<(), StorageError> {
        self.backend.replace_notes(&self.scope, records)
    }

    pub fn get_by_id(&self, note_id: &str) -> Result<Option<NoteRecord>, StorageError> {
        Ok(self
            .load_all()?
            .into_iter()
            .find(|note| note.note_id == note_id))
    }

    /// Insert or replace one record and return what was stored. A replacement
    /// never carries edit timestamps older than the record it replaces.
    pub fn upsert(&self, record: &NoteRecord) -> Result<NoteRecord, StorageError> {
        let mut records = self.load_all()?;
        let mut stored = record.clone();
        match records.iter_mut().find(|n| n.note_id == record.note_id) {
            Some(existing) => {
                stored.not_older_than(existing);
                *existing = stored.clone();
            }
            None => records.push(stored.clone()),
        }
        self.save_all(&records)?;
        Ok(stored)
    }

    /// Remove one record. Returns whether it existed.
    pub fn remove(&self, note_id: &str) -> Result<bool, StorageError> {
        let mut records = self.load_all()?;
        let before = records.len();
        records.retain(|n| n.note_id != note_id);
        if records.len() == before {
            return Ok(false);
        }
        self.save_all(&records)?;
        Ok(true)
    }
}
