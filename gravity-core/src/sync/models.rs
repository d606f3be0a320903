//! Sync data models: wire format and status summaries.

use crate::storage::models::{parse_iso, NoteRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of change carried by a queue entry or sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upsert,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

/// One change in a `POST /notes/sync` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub note_id: String,
    pub operation: Operation,
    #[serde(default)]
    pub base_version: i64,
    pub client_edit_seq: i64,
    pub client_device: String,
    pub client_time_s: i64,
    pub created_at_s: i64,
    pub updated_at_s: i64,
    pub payload: Option<NoteRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub operations: Vec<SyncOperation>,
}

/// Server verdict for one submitted operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub note_id: String,
    pub accepted: bool,
    pub version: i64,
    #[serde(default)]
    pub updated_at_s: i64,
    #[serde(default)]
    pub last_writer_edit_seq: i64,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub results: Vec<SyncResult>,
}

/// A note as returned by `GET /notes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteNote {
    pub note_id: String,
    pub version: i64,
    #[serde(default)]
    pub last_writer_edit_seq: i64,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub created_at_s: i64,
    #[serde(default)]
    pub updated_at_s: i64,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub notes: Vec<RemoteNote>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenExchangeRequest {
    pub id_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenExchangeResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
}

/// `GET /me`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeResponse {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Server copy of a note, decoded from a sync result or snapshot entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerCopy {
    pub note_id: String,
    pub version: i64,
    pub is_deleted: bool,
    pub record: Option<NoteRecord>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Decode a wire payload. `null` (an empty note) decodes to `None`.
pub fn decode_payload(payload: Option<&serde_json::Value>) -> Result<Option<NoteRecord>, String> {
    match payload {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| e.to_string()),
    }
}

fn server_copy(
    note_id: &str,
    version: i64,
    is_deleted: bool,
    updated_at_s: i64,
    payload: Option<&serde_json::Value>,
) -> Result<ServerCopy, String> {
    let record = decode_payload(payload)?;
    if let Some(record) = &record {
        if record.note_id != note_id {
            return Err(format!(
                "payload id {} does not match note {}",
                record.note_id, note_id
            ));
        }
    }
    // The payload timestamp has millisecond precision; the column only seconds.
    let updated_at = record
        .as_ref()
        .and_then(|r| parse_iso(&r.updated_at_iso))
        .or_else(|| DateTime::from_timestamp(updated_at_s, 0).filter(|_| updated_at_s > 0));
    Ok(ServerCopy {
        note_id: note_id.to_string(),
        version,
        is_deleted,
        record,
        updated_at,
    })
}

impl SyncResult {
    pub fn server_copy(&self) -> Result<ServerCopy, String> {
        server_copy(
            &self.note_id,
            self.version,
            self.is_deleted,
            self.updated_at_s,
            self.payload.as_ref(),
        )
    }
}

impl RemoteNote {
    pub fn server_copy(&self) -> Result<ServerCopy, String> {
        server_copy(
            &self.note_id,
            self.version,
            self.is_deleted,
            self.updated_at_s,
            self.payload.as_ref(),
        )
    }
}

/// Outcome of one `sync()` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Operations submitted, counting resubmissions.
    pub pushed: usize,
    /// Operations the server confirmed as-is.
    pub acknowledged: usize,
    pub conflicts_resolved: usize,
    /// Remote changes applied locally.
    pub pulled: usize,
    /// Entries still queued afterwards.
    pub pending: usize,
}

/// Summary for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub signed_in: bool,
    pub user_email: Option<String>,
    pub device_id: Option<uuid::Uuid>,
    pub last_sync_at: Option<i64>,
    pub pending: usize,
}
