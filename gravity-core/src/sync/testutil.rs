//! Scripted in-memory backend for unit tests.

use crate::auth::credential::{self, encode_unsigned};
use crate::storage::models::NoteRecord;
use crate::sync::models::{
    MeResponse, Operation, RemoteNote, SnapshotResponse, SyncRequest, SyncResponse, SyncResult,
    TokenExchangeResponse,
};
use crate::sync::realtime::{NoteEvents, RealtimeEvent};
use crate::sync::remote::{NotesRemote, RemoteError};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};

pub const CLIENT_ID: &str = "test-client.apps.googleusercontent.com";
pub const NOW_SECS: i64 = 1_700_000_000;

/// A Google-shaped credential for `sub`, valid for an hour from [`NOW_SECS`].
pub fn credential_for(sub: &str) -> String {
    encode_unsigned(&json!({
        "sub": sub,
        "aud": CLIENT_ID,
        "iss": "https://accounts.google.com",
        "iat": NOW_SECS - 60,
        "exp": NOW_SECS + 3600,
        "email": format!("{}@example.com", sub),
        "name": sub,
    }))
}

#[derive(Debug, Clone)]
pub struct StoredNote {
    pub version: i64,
    pub last_writer_edit_seq: i64,
    pub is_deleted: bool,
    pub updated_at_s: i64,
    pub payload: Option<NoteRecord>,
}

#[derive(Default)]
struct FakeState {
    notes: BTreeMap<String, StoredNote>,
    tokens: HashSet<String>,
    token_subjects: BTreeMap<String, String>,
    issued: usize,
    sync_failures: VecDeque<RemoteError>,
    exchange_failures: VecDeque<RemoteError>,
    list_failures: VecDeque<RemoteError>,
    /// Per-call overrides for sync results, keyed by note id.
    result_overrides: VecDeque<BTreeMap<String, Option<SyncResult>>>,
    block_syncs: bool,
    gate: Option<Arc<Notify>>,
    requests: Vec<SyncRequest>,
    logouts: usize,
    list_calls: usize,
    streams: Vec<mpsc::UnboundedSender<Result<RealtimeEvent, RemoteError>>>,
    stream_connects: usize,
    stream_failures: VecDeque<RemoteError>,
}

/// Change stream fed by [`FakeRemote::push_event`].
struct FakeEvents {
    rx: mpsc::UnboundedReceiver<Result<RealtimeEvent, RemoteError>>,
}

#[async_trait]
impl NoteEvents for FakeEvents {
    async fn next_event(&mut self) -> Result<Option<RealtimeEvent>, RemoteError> {
        match self.rx.recv().await {
            Some(item) => item.map(Some),
            None => Ok(None),
        }
    }
}

/// Mimics the Gravity backend: versions per note, rejection of stale base
/// versions with different content, bearer tokens minted by the exchange.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn fail_next_sync(&self, error: RemoteError) {
        self.state().sync_failures.push_back(error);
    }

    pub fn fail_next_exchange(&self, error: RemoteError) {
        self.state().exchange_failures.push_back(error);
    }

    pub fn fail_next_list(&self, error: RemoteError) {
        self.state().list_failures.push_back(error);
    }

    /// Replace (`Some`) or drop (`None`) results for the next sync call.
    pub fn override_next_results(&self, overrides: BTreeMap<String, Option<SyncResult>>) {
        self.state().result_overrides.push_back(overrides);
    }

    /// Make every sync call hang until the caller gives up on it.
    pub fn block_syncs(&self) {
        self.state().block_syncs = true;
    }

    /// Hold each sync call until the returned gate is notified.
    pub fn gate_syncs(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().gate = Some(gate.clone());
        gate
    }

    pub fn open_syncs(&self) {
        self.state().gate = None;
    }

    /// Invalidate all issued tokens, as if they expired server-side.
    pub fn revoke_tokens(&self) {
        self.state().tokens.clear();
    }

    /// Write a note as another device would.
    pub fn put_server_note(&self, record: NoteRecord, is_deleted: bool) -> i64 {
        let mut state = self.state();
        let updated_at_s = record.updated_at().map(|t| t.timestamp()).unwrap_or(0);
        let note = state
            .notes
            .entry(record.note_id.clone())
            .or_insert(StoredNote {
                version: 0,
                last_writer_edit_seq: 0,
                is_deleted: false,
                updated_at_s: 0,
                payload: None,
            });
        note.version += 1;
        note.is_deleted = is_deleted;
        note.updated_at_s = updated_at_s;
        note.payload = Some(record);
        note.version
    }

    /// Store a live note whose payload is empty.
    pub fn put_empty_server_note(&self, note_id: &str, updated_at_s: i64) -> i64 {
        let mut state = self.state();
        let note = state.notes.entry(note_id.to_string()).or_insert(StoredNote {
            version: 0,
            last_writer_edit_seq: 0,
            is_deleted: false,
            updated_at_s: 0,
            payload: None,
        });
        note.version += 1;
        note.is_deleted = false;
        note.updated_at_s = updated_at_s;
        note.payload = None;
        note.version
    }

    pub fn server_note(&self, note_id: &str) -> Option<StoredNote> {
        self.state().notes.get(note_id).cloned()
    }

    pub fn server_note_count(&self) -> usize {
        self.state().notes.len()
    }

    pub fn requests(&self) -> Vec<SyncRequest> {
        self.state().requests.clone()
    }

    pub fn exchanges(&self) -> usize {
        self.state().issued
    }

    pub fn logouts(&self) -> usize {
        self.state().logouts
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub fn stream_connects(&self) -> usize {
        self.state().stream_connects
    }

    pub fn fail_next_stream(&self, error: RemoteError) {
        self.state().stream_failures.push_back(error);
    }

    /// Deliver an event to every open change stream.
    pub fn push_event(&self, event: RealtimeEvent) {
        self.state()
            .streams
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    /// Break every open change stream with `error`.
    pub fn break_streams(&self, error: RemoteError) {
        for tx in self.state().streams.drain(..) {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// End every open change stream cleanly.
    pub fn close_streams(&self) {
        self.state().streams.clear();
    }

    fn authorize(state: &FakeState, token: &str) -> Result<(), RemoteError> {
        if state.tokens.contains(token) {
            Ok(())
        } else {
            Err(RemoteError::Unauthorized)
        }
    }

    fn result_for(note_id: &str, note: &StoredNote, accepted: bool) -> SyncResult {
        SyncResult {
            note_id: note_id.to_string(),
            accepted,
            version: note.version,
            updated_at_s: note.updated_at_s,
            last_writer_edit_seq: note.last_writer_edit_seq,
            is_deleted: note.is_deleted,
            payload: note
                .payload
                .as_ref()
                .and_then(|record| serde_json::to_value(record).ok()),
        }
    }
}

#[async_trait]
impl NotesRemote for FakeRemote {
    async fn exchange_credential(&self, id_token: &str) -> Result<TokenExchangeResponse, RemoteError> {
        let mut state = self.state();
        if let Some(error) = state.exchange_failures.pop_front() {
            return Err(error);
        }
        let claims = credential::decode(id_token).map_err(|_| RemoteError::Unauthorized)?;
        let subject = claims.subject().ok_or(RemoteError::Unauthorized)?.to_string();
        state.issued += 1;
        let token = format!("backend-token-{}", state.issued);
        state.tokens.insert(token.clone());
        state.token_subjects.insert(token.clone(), subject);
        Ok(TokenExchangeResponse {
            access_token: token,
            expires_in: 1800,
            token_type: "Bearer".to_string(),
        })
    }

    async fn me(&self, access_token: &str) -> Result<MeResponse, RemoteError> {
        let state = self.state();
        Self::authorize(&state, access_token)?;
        let user_id = state
            .token_subjects
            .get(access_token)
            .cloned()
            .unwrap_or_default();
        Ok(MeResponse {
            email: Some(format!("{}@example.com", user_id)),
            name: None,
            user_id,
        })
    }

    async fn sync_notes(
        &self,
        access_token: &str,
        request: &SyncRequest,
    ) -> Result<SyncResponse, RemoteError> {
        let (blocked, gate) = {
            let mut state = self.state();
            Self::authorize(&state, access_token)?;
            state.requests.push(request.clone());
            if let Some(error) = state.sync_failures.pop_front() {
                return Err(error);
            }
            (state.block_syncs, state.gate.clone())
        };
        if blocked {
            std::future::pending::<()>().await;
        }
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state();
        let mut results = Vec::new();
        for op in &request.operations {
            let updated_at_s = op.updated_at_s;
            let candidate = op.payload.clone();
            let note = state.notes.entry(op.note_id.clone()).or_insert(StoredNote {
                version: 0,
                last_writer_edit_seq: 0,
                is_deleted: false,
                updated_at_s: 0,
                payload: None,
            });

            let is_delete = op.operation == Operation::Delete;
            let same_content = note.payload == candidate && note.is_deleted == is_delete;
            let accepted = if same_content {
                // Duplicate submission: nothing new to store.
                true
            } else if op.base_version != note.version {
                false
            } else {
                note.version += 1;
                note.last_writer_edit_seq = op.client_edit_seq;
                note.is_deleted = is_delete;
                note.updated_at_s = updated_at_s;
                note.payload = candidate;
                true
            };
            results.push(Self::result_for(&op.note_id, note, accepted));
        }

        if let Some(overrides) = state.result_overrides.pop_front() {
            let mut patched = Vec::new();
            for result in results {
                match overrides.get(&result.note_id) {
                    Some(Some(replacement)) => patched.push(replacement.clone()),
                    Some(None) => {}
                    None => patched.push(result),
                }
            }
            results = patched;
        }

        Ok(SyncResponse { results })
    }

    async fn list_notes(&self, access_token: &str) -> Result<SnapshotResponse, RemoteError> {
        let mut state = self.state();
        Self::authorize(&state, access_token)?;
        state.list_calls += 1;
        if let Some(error) = state.list_failures.pop_front() {
            return Err(error);
        }
        let notes = state
            .notes
            .iter()
            .map(|(note_id, note)| RemoteNote {
                note_id: note_id.clone(),
                version: note.version,
                last_writer_edit_seq: note.last_writer_edit_seq,
                is_deleted: note.is_deleted,
                created_at_s: note.updated_at_s,
                updated_at_s: note.updated_at_s,
                payload: note
                    .payload
                    .as_ref()
                    .and_then(|record| serde_json::to_value(record).ok()),
            })
            .collect();
        Ok(SnapshotResponse { notes })
    }

    async fn logout(&self, access_token: &str) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.logouts += 1;
        state.tokens.remove(access_token);
        Ok(())
    }

    async fn stream_notes(&self, access_token: &str) -> Result<Box<dyn NoteEvents>, RemoteError> {
        let mut state = self.state();
        Self::authorize(&state, access_token)?;
        if let Some(error) = state.stream_failures.pop_front() {
            return Err(error);
        }
        state.stream_connects += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.streams.push(tx);
        Ok(Box::new(FakeEvents { rx }))
    }
}
