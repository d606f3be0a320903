//! Sync settings and the sync metadata stored alongside the notes.

use crate::storage::{StorageBackend, StorageError, StoreArea};
use crate::sync::backoff::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Storage key of [`SyncMetadata`] in the metadata area.
pub const SYNC_METADATA_KEY: &str = "sync_metadata";

/// Tunables for the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Deadline for a single backend call.
    pub attempt_timeout: Duration,
    /// Flush rounds per `sync()` before giving up and leaving entries queued.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// The change stream is reconnected when nothing, heartbeats included,
    /// arrives for this long. The backend sends a heartbeat every 25 s.
    pub heartbeat_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

/// Per-device sync bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub device_id: Option<Uuid>,
    /// Unix seconds of the last completed `sync()`.
    pub last_sync_at: Option<i64>,
    /// Unix seconds of the last applied snapshot pull.
    pub last_pull_at: Option<i64>,
}

impl SyncMetadata {
    /// Load sync metadata. Returns default if nothing is stored or the stored
    /// value cannot be read.
    pub fn load(backend: &StorageBackend) -> Result<Self, StorageError> {
        match backend.get(StoreArea::Metadata, SYNC_METADATA_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable sync metadata: {}", e);
                Self::default()
            })),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, backend: &StorageBackend) -> Result<(), StorageError> {
        let raw =
            serde_json::to_string(self).map_err(|e| StorageError::Serialization(e.to_string()))?;
        backend.put(StoreArea::Metadata, SYNC_METADATA_KEY, &raw)
    }

    /// Return the device id, minting and persisting one on first use.
    pub fn ensure_device_id(backend: &StorageBackend) -> Result<Uuid, StorageError> {
        let mut metadata = Self::load(backend)?;
        if let Some(id) = metadata.device_id {
            return Ok(id);
        }
        let id = Uuid::new_v4();
        metadata.device_id = Some(id);
        metadata.save(backend)?;
        Ok(id)
    }
}
