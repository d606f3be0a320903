//! Durable queue of local changes awaiting acknowledgement.
//!
//! One entry per note: a second edit before the first is sent replaces the
//! queued snapshot. An edit made while the entry is in flight is parked in
//! `superseded_by` and takes over once the request resolves.

use crate::storage::models::NoteRecord;
use crate::storage::{StorageBackend, StorageError, StoreArea};
use crate::sync::models::Operation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Per-note sync state. A note with no entry is clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    InFlight,
    Conflict,
}

/// A local edit that arrived while the entry was in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupersedingEdit {
    pub operation: Operation,
    pub snapshot: NoteRecord,
    pub client_edit_seq: i64,
    pub last_edit_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub note_id: String,
    pub operation: Operation,
    pub snapshot: NoteRecord,
    pub client_edit_seq: i64,
    pub base_version: i64,
    pub last_edit_at_ms: i64,
    pub state: EntryState,
    pub attempts: u32,
    pub next_attempt_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<SupersedingEdit>,
}

impl QueueEntry {
    /// The newest local intent for this note: the superseding edit if one
    /// is parked, otherwise the queued snapshot.
    pub fn latest(&self) -> (Operation, &NoteRecord) {
        match &self.superseded_by {
            Some(edit) => (edit.operation, &edit.snapshot),
            None => (self.operation, &self.snapshot),
        }
    }

    /// Swap the parked edit in as the content to send. Counters are untouched.
    fn adopt_superseding(&mut self) -> bool {
        match self.superseded_by.take() {
            Some(edit) => {
                self.operation = edit.operation;
                self.snapshot = edit.snapshot;
                self.client_edit_seq = edit.client_edit_seq;
                self.last_edit_at_ms = edit.last_edit_at_ms;
                true
            }
            None => false,
        }
    }

    /// Adopt the parked edit as a fresh submission.
    fn promote_superseding(&mut self) {
        if self.adopt_superseding() {
            self.attempts = 0;
            self.next_attempt_at_ms = 0;
        }
    }
}

/// The queue plus the per-note counters that outlive individual entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueue {
    entries: Vec<QueueEntry>,
    /// Last `client_edit_seq` issued per note.
    #[serde(default)]
    edit_seqs: BTreeMap<String, i64>,
    /// Last server version seen per note.
    #[serde(default)]
    versions: BTreeMap<String, i64>,
}

impl SyncQueue {
    /// Load the queue for `scope`. In-flight entries from an interrupted run
    /// come back as pending. An unreadable queue is logged and replaced.
    pub fn load(backend: &StorageBackend, scope: &str) -> Result<Self, StorageError> {
        let mut queue = match backend.get(StoreArea::SyncQueue, scope)? {
            Some(raw) => serde_json::from_str::<SyncQueue>(&raw).unwrap_or_else(|e| {
                warn!("Discarding unreadable sync queue for {}: {}", scope, e);
                SyncQueue::default()
            }),
            None => SyncQueue::default(),
        };
        for entry in &mut queue.entries {
            if entry.state != EntryState::Pending {
                entry.state = EntryState::Pending;
                entry.promote_superseding();
            }
        }
        Ok(queue)
    }

    pub fn save(&self, backend: &StorageBackend, scope: &str) -> Result<(), StorageError> {
        let raw =
            serde_json::to_string(self).map_err(|e| StorageError::Serialization(e.to_string()))?;
        backend.put(StoreArea::SyncQueue, scope, &raw)
    }

    pub fn get(&self, note_id: &str) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.note_id == note_id)
    }

    fn get_mut(&mut self, note_id: &str) -> Option<&mut QueueEntry> {
        self.entries.iter_mut().find(|e| e.note_id == note_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn known_version(&self, note_id: &str) -> i64 {
        self.versions.get(note_id).copied().unwrap_or(0)
    }

    pub fn record_version(&mut self, note_id: &str, version: i64) {
        let known = self.versions.entry(note_id.to_string()).or_insert(0);
        *known = (*known).max(version);
    }

    /// Queue a local change, coalescing with any existing entry.
    pub fn enqueue(&mut self, operation: Operation, snapshot: NoteRecord, now_ms: i64) {
        let note_id = snapshot.note_id.clone();
        let seq = {
            let seq = self.edit_seqs.entry(note_id.clone()).or_insert(0);
            *seq += 1;
            *seq
        };
        let base_version = self.known_version(&note_id);

        match self.get_mut(&note_id) {
            Some(entry) if entry.state == EntryState::InFlight => {
                debug!("Note {} edited while in flight; parking edit {}", note_id, seq);
                entry.superseded_by = Some(SupersedingEdit {
                    operation,
                    snapshot,
                    client_edit_seq: seq,
                    last_edit_at_ms: now_ms,
                });
            }
            Some(entry) => {
                debug!("Coalescing edit {} into queued note {}", seq, note_id);
                entry.operation = operation;
                entry.snapshot = snapshot;
                entry.client_edit_seq = seq;
                entry.last_edit_at_ms = now_ms;
                entry.state = EntryState::Pending;
                entry.attempts = 0;
                entry.next_attempt_at_ms = 0;
            }
            None => {
                debug!("Queueing {} of note {}", operation.as_str(), note_id);
                self.entries.push(QueueEntry {
                    note_id,
                    operation,
                    snapshot,
                    client_edit_seq: seq,
                    base_version,
                    last_edit_at_ms: now_ms,
                    state: EntryState::Pending,
                    attempts: 0,
                    next_attempt_at_ms: 0,
                    superseded_by: None,
                });
            }
        }
    }

    /// Select pending entries whose backoff has elapsed, oldest edit first,
    /// and mark them in flight.
    pub fn take_ready(&mut self, now_ms: i64) -> Vec<QueueEntry> {
        let mut ready: Vec<&mut QueueEntry> = self
            .entries
            .iter_mut()
            .filter(|e| e.state == EntryState::Pending && e.next_attempt_at_ms <= now_ms)
            .collect();
        ready.sort_by_key(|e| e.last_edit_at_ms);
        ready
            .into_iter()
            .map(|entry| {
                entry.state = EntryState::InFlight;
                entry.clone()
            })
            .collect()
    }

    /// Milliseconds until the earliest pending entry becomes ready, or `None`
    /// when nothing is pending.
    pub fn next_ready_in(&self, now_ms: i64) -> Option<i64> {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Pending)
            .map(|e| (e.next_attempt_at_ms - now_ms).max(0))
            .min()
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Pending)
            .count()
    }

    /// The server stored exactly what was sent. Returns true if a parked
    /// edit keeps the entry alive.
    pub fn acknowledge(&mut self, note_id: &str, version: i64) -> bool {
        self.record_version(note_id, version);
        let Some(entry) = self.get_mut(note_id) else {
            return false;
        };
        if entry.superseded_by.is_some() {
            entry.promote_superseding();
            entry.base_version = version;
            entry.state = EntryState::Pending;
            debug!("Note {} acknowledged; parked edit now pending", note_id);
            true
        } else {
            self.drop_entry(note_id);
            debug!("Note {} acknowledged at version {}", note_id, version);
            false
        }
    }

    pub fn mark_conflict(&mut self, note_id: &str) {
        if let Some(entry) = self.get_mut(note_id) {
            entry.state = EntryState::Conflict;
        }
    }

    /// Conflict resolved in the client's favour: resubmit the newest local
    /// intent on top of the server's version.
    pub fn requeue_over(&mut self, note_id: &str, server_version: i64) {
        self.record_version(note_id, server_version);
        if let Some(entry) = self.get_mut(note_id) {
            entry.promote_superseding();
            entry.base_version = server_version;
            entry.state = EntryState::Pending;
            entry.attempts = 0;
            entry.next_attempt_at_ms = 0;
        }
    }

    /// Remove the entry (and any parked edit).
    pub fn drop_entry(&mut self, note_id: &str) {
        self.entries.retain(|e| e.note_id != note_id);
    }

    /// A transient failure: back to pending with the given delay.
    pub fn retry_later(&mut self, note_id: &str, now_ms: i64, delay_ms: i64) {
        if let Some(entry) = self.get_mut(note_id) {
            entry.attempts = entry.attempts.saturating_add(1);
            entry.next_attempt_at_ms = now_ms.saturating_add(delay_ms);
            entry.state = EntryState::Pending;
            // The next attempt carries the newest content.
            entry.adopt_superseding();
        }
    }

    /// Return an in-flight entry to pending without counting an attempt.
    pub fn release(&mut self, note_id: &str) {
        if let Some(entry) = self.get_mut(note_id) {
            if entry.state != EntryState::Pending {
                entry.state = EntryState::Pending;
                entry.adopt_superseding();
            }
        }
    }
}
