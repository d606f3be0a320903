//! Sync engine: orchestrates the push/resolve/pull cycle.

use crate::auth::session::{SessionContext, SessionError};
use crate::clock::Clock;
use crate::storage::models::NoteRecord;
use crate::storage::{LocalNoteStore, StorageBackend};
use crate::sync::config::{SyncMetadata, SyncSettings};
use crate::sync::conflict::{ConflictResolver, Resolution};
use crate::sync::models::{
    Operation, ServerCopy, SyncOperation, SyncReport, SyncRequest, SyncResponse, SyncStatus,
};
use crate::sync::queue::{EntryState, QueueEntry, SyncQueue};
use crate::sync::realtime::RealtimeEvent;
use crate::sync::remote::{NotesRemote, RemoteError};
use crate::sync::SyncError;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one flush round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub pushed: usize,
    pub acknowledged: usize,
    pub conflicts_resolved: usize,
    /// Entries sent back to pending because their result was unusable.
    pub retrying: usize,
}

impl SyncReport {
    fn absorb(&mut self, outcome: FlushOutcome) {
        self.pushed += outcome.pushed;
        self.acknowledged += outcome.acknowledged;
        self.conflicts_resolved += outcome.conflicts_resolved;
    }
}

/// Notes and queue of the user the engine is currently working for.
struct ScopeState {
    loaded: bool,
    user_id: Option<String>,
    notes: LocalNoteStore,
    queue: SyncQueue,
}

/// Why an authorized backend call did not produce a value.
enum CallError {
    Cancelled,
    Remote(RemoteError),
    /// The session cannot be refreshed; sync must stop.
    Halt(SessionError),
    Sync(SyncError),
}

/// Drives local edits to the backend and server changes back into the note store.
pub struct SyncEngine {
    remote: Arc<dyn NotesRemote>,
    session: Arc<SessionContext>,
    backend: Arc<StorageBackend>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    scope: Mutex<ScopeState>,
    /// Session epoch at which sync halted.
    halted_at: Mutex<Option<u64>>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn NotesRemote>,
        session: Arc<SessionContext>,
        backend: Arc<StorageBackend>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        let notes = LocalNoteStore::for_user(backend.clone(), None);
        Self {
            remote,
            session,
            backend,
            clock,
            settings,
            scope: Mutex::new(ScopeState {
                loaded: false,
                user_id: None,
                notes,
                queue: SyncQueue::default(),
            }),
            halted_at: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    fn current_user_id(&self) -> Option<String> {
        self.session.current_user().map(|user| user.id)
    }

    /// Run `f` against the notes and queue of `user_id`, loading them first
    /// if the engine was last working for someone else.
    fn with_scope<R>(
        &self,
        user_id: Option<&str>,
        f: impl FnOnce(&mut ScopeState) -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        let mut state = self
            .scope
            .lock()
            .map_err(|_| SyncError::LockPoisoned("sync scope".to_string()))?;
        if !state.loaded || state.user_id.as_deref() != user_id {
            let notes = LocalNoteStore::for_user(self.backend.clone(), user_id);
            let queue = SyncQueue::load(&self.backend, notes.scope())?;
            debug!("Loaded sync scope {} ({} queued)", notes.scope(), queue.len());
            *state = ScopeState {
                loaded: true,
                user_id: user_id.map(str::to_string),
                notes,
                queue,
            };
        }
        f(&mut *state)
    }

    fn persist_queue(&self, state: &ScopeState) {
        if let Err(e) = state.queue.save(&self.backend, state.notes.scope()) {
            warn!("Failed to persist sync queue: {}", e);
        }
    }

    fn halted(&self) -> Result<MutexGuard<'_, Option<u64>>, SyncError> {
        self.halted_at
            .lock()
            .map_err(|_| SyncError::LockPoisoned("halt flag".to_string()))
    }

    /// Fails with `Halted` until a new sign-in replaces the session that
    /// could not be refreshed.
    fn check_halted(&self) -> Result<(), SyncError> {
        let mut halted = self.halted()?;
        match *halted {
            Some(epoch) if epoch == self.session.epoch() => Err(SyncError::Halted),
            Some(_) => {
                info!("New session detected; resuming sync");
                *halted = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn halt(&self, reason: SessionError) -> SyncError {
        warn!("Session could not be refreshed ({}); signing out and halting sync", reason);
        let epoch = self.session.epoch();
        self.session.sign_out().await;
        match self.halted() {
            Ok(mut halted) => {
                *halted = Some(epoch);
                SyncError::Halted
            }
            Err(e) => e,
        }
    }

    /// The note store for whoever is signed in (or the anonymous store).
    pub fn notes(&self) -> Result<LocalNoteStore, SyncError> {
        let user_id = self.current_user_id();
        self.with_scope(user_id.as_deref(), |state| Ok(state.notes.clone()))
    }

    /// Persist `record` locally and queue it for upload.
    pub fn record_edit(&self, record: NoteRecord) -> Result<(), SyncError> {
        let user_id = self.current_user_id();
        let now_ms = self.clock.now_ms();
        self.with_scope(user_id.as_deref(), |state| {
            let stored = state.notes.upsert(&record)?;
            state.queue.enqueue(Operation::Upsert, stored, now_ms);
            self.persist_queue(state);
            Ok(())
        })
    }

    /// Remove a note locally and queue the deletion. Returns false if the
    /// note is unknown.
    pub fn record_delete(&self, note_id: &str) -> Result<bool, SyncError> {
        let user_id = self.current_user_id();
        let now = self.clock.now();
        let now_ms = self.clock.now_ms();
        self.with_scope(user_id.as_deref(), |state| {
            let existing = match state.notes.get_by_id(note_id)? {
                Some(record) => Some(record),
                None => state.queue.get(note_id).map(|entry| entry.latest().1.clone()),
            };
            let Some(mut tombstone) = existing else {
                return Ok(false);
            };
            tombstone.touch(now);
            state.notes.remove(note_id)?;
            state.queue.enqueue(Operation::Delete, tombstone, now_ms);
            self.persist_queue(state);
            Ok(true)
        })
    }

    /// Entries still queued for the current user.
    pub fn pending_count(&self) -> Result<usize, SyncError> {
        let user_id = self.current_user_id();
        self.with_scope(user_id.as_deref(), |state| Ok(state.queue.len()))
    }

    pub fn status(&self) -> Result<SyncStatus, SyncError> {
        let user = self.session.current_user();
        let metadata = SyncMetadata::load(&self.backend)?;
        let pending = self.pending_count()?;
        Ok(SyncStatus {
            signed_in: user.is_some(),
            user_email: user.and_then(|u| u.email),
            device_id: metadata.device_id,
            last_sync_at: metadata.last_sync_at,
            pending,
        })
    }

    /// Access token, mapping session failures onto the flush outcomes.
    async fn token(&self) -> Result<String, CallError> {
        match self.session.access_token().await {
            Ok(token) => Ok(token),
            Err(SessionError::NotSignedIn) => Err(CallError::Sync(SyncError::NotSignedIn)),
            Err(SessionError::Remote(e)) => Err(CallError::Remote(e)),
            Err(e) => Err(CallError::Halt(e)),
        }
    }

    /// Run one backend call under the attempt timeout, abandoning it if the
    /// session signs out meanwhile.
    async fn guarded<T>(
        &self,
        sign_outs: &mut watch::Receiver<u64>,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, CallError> {
        let call = tokio::time::timeout(self.settings.attempt_timeout, call);
        tokio::select! {
            biased;
            _ = sign_outs.changed() => Err(CallError::Cancelled),
            result = call => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(CallError::Remote(e)),
                Err(_) => Err(CallError::Remote(RemoteError::Timeout)),
            },
        }
    }

    /// Make an authorized call; on 401 refresh the token once and retry.
    async fn authorized<T, F, Fut>(
        &self,
        sign_outs: &mut watch::Receiver<u64>,
        call: F,
    ) -> Result<T, CallError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let token = self.token().await?;
        match self.guarded(sign_outs, call(token)).await {
            Err(CallError::Remote(RemoteError::Unauthorized)) => {}
            other => return other,
        }

        debug!("Backend rejected the access token; refreshing");
        let token = match self.session.refresh().await {
            Ok(token) => token,
            Err(SessionError::Remote(e)) if e.is_transient() => return Err(CallError::Remote(e)),
            Err(e) => return Err(CallError::Halt(e)),
        };
        match self.guarded(sign_outs, call(token)).await {
            Err(CallError::Remote(RemoteError::Unauthorized)) => {
                Err(CallError::Halt(SessionError::Rejected))
            }
            other => other,
        }
    }

    /// Push ready queue entries in one batch and settle the results.
    pub async fn flush(&self) -> Result<FlushOutcome, SyncError> {
        self.check_halted()?;
        let mut sign_outs = self.session.subscribe_sign_out();
        let user_id = self.current_user_id().ok_or(SyncError::NotSignedIn)?;
        let device_id = SyncMetadata::ensure_device_id(&self.backend)?;

        let now_ms = self.clock.now_ms();
        let batch = self.with_scope(Some(user_id.as_str()), |state| {
            let batch = state.queue.take_ready(now_ms);
            if !batch.is_empty() {
                self.persist_queue(state);
            }
            Ok(batch)
        })?;
        if batch.is_empty() {
            return Ok(FlushOutcome::default());
        }

        debug!("Pushing {} queued notes", batch.len());
        let request = build_request(&batch, device_id, self.clock.now_secs());
        let request = &request;
        let remote = &self.remote;
        let response = self
            .authorized(&mut sign_outs, |token| async move {
                remote.sync_notes(&token, request).await
            })
            .await;

        match response {
            Ok(response) => self.apply_results(&user_id, &batch, response),
            Err(CallError::Cancelled) => {
                info!("Signed out during sync; abandoning {} in-flight notes", batch.len());
                self.release(&user_id, &batch)?;
                Err(SyncError::Cancelled)
            }
            Err(CallError::Remote(e)) => {
                warn!("Sync push failed: {}", e);
                self.retry_later(&user_id, &batch)?;
                Err(SyncError::Remote(e))
            }
            Err(CallError::Halt(reason)) => {
                self.release(&user_id, &batch)?;
                Err(self.halt(reason).await)
            }
            Err(CallError::Sync(e)) => {
                self.release(&user_id, &batch)?;
                Err(e)
            }
        }
    }

    fn release(&self, user_id: &str, batch: &[QueueEntry]) -> Result<(), SyncError> {
        self.with_scope(Some(user_id), |state| {
            for entry in batch {
                state.queue.release(&entry.note_id);
            }
            self.persist_queue(state);
            Ok(())
        })
    }

    fn retry_later(&self, user_id: &str, batch: &[QueueEntry]) -> Result<(), SyncError> {
        let now_ms = self.clock.now_ms();
        self.with_scope(Some(user_id), |state| {
            for entry in batch {
                self.schedule_retry(&mut state.queue, &entry.note_id, now_ms);
            }
            self.persist_queue(state);
            Ok(())
        })
    }

    fn schedule_retry(&self, queue: &mut SyncQueue, note_id: &str, now_ms: i64) {
        let attempt = queue.get(note_id).map_or(1, |e| e.attempts.saturating_add(1));
        let delay = self.settings.backoff.delay(attempt);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        debug!("Retrying note {} in {} ms (attempt {})", note_id, delay_ms, attempt);
        queue.retry_later(note_id, now_ms, delay_ms);
    }

    fn apply_results(
        &self,
        user_id: &str,
        batch: &[QueueEntry],
        response: SyncResponse,
    ) -> Result<FlushOutcome, SyncError> {
        let now_ms = self.clock.now_ms();
        self.with_scope(Some(user_id), |state| {
            let mut notes = match state.notes.load_all() {
                Ok(notes) => notes,
                Err(e) => {
                    for entry in batch {
                        state.queue.release(&entry.note_id);
                    }
                    self.persist_queue(state);
                    return Err(e.into());
                }
            };

            let mut outcome = FlushOutcome {
                pushed: batch.len(),
                ..FlushOutcome::default()
            };
            let mut notes_changed = false;

            for entry in batch {
                let note_id = entry.note_id.as_str();
                let Some(result) = response.results.iter().find(|r| r.note_id == note_id) else {
                    warn!("Sync response has no result for note {}", note_id);
                    self.schedule_retry(&mut state.queue, note_id, now_ms);
                    outcome.retrying += 1;
                    continue;
                };
                let server = match result.server_copy() {
                    Ok(server) => server,
                    Err(reason) => {
                        warn!("Malformed sync result for note {}: {}", note_id, reason);
                        self.schedule_retry(&mut state.queue, note_id, now_ms);
                        outcome.retrying += 1;
                        continue;
                    }
                };

                if result.accepted && server_matches(entry, &server) {
                    state.queue.acknowledge(note_id, server.version);
                    outcome.acknowledged += 1;
                    continue;
                }

                state.queue.mark_conflict(note_id);
                let local_updated_at = state
                    .queue
                    .get(note_id)
                    .and_then(|e| e.latest().1.updated_at());
                match resolve_against(local_updated_at, &server) {
                    Resolution::AcceptRemote => {
                        debug!("Conflict on note {}: server copy wins", note_id);
                        notes_changed |= apply_server_copy(&mut notes, &server);
                        state.queue.drop_entry(note_id);
                        state.queue.record_version(note_id, server.version);
                    }
                    Resolution::KeepLocal => {
                        debug!("Conflict on note {}: local copy wins, resubmitting", note_id);
                        state.queue.requeue_over(note_id, server.version);
                    }
                }
                outcome.conflicts_resolved += 1;
            }

            if notes_changed {
                if let Err(e) = state.notes.save_all(&notes) {
                    // Nothing was applied; restart from the persisted queue.
                    state.queue = SyncQueue::load(&self.backend, state.notes.scope())?;
                    return Err(e.into());
                }
            }
            self.persist_queue(state);
            Ok(outcome)
        })
    }

    /// Fetch the server snapshot and merge it into the note store.
    /// Returns the number of notes changed locally.
    pub async fn pull(&self) -> Result<usize, SyncError> {
        self.check_halted()?;
        let mut sign_outs = self.session.subscribe_sign_out();
        let user_id = self.current_user_id().ok_or(SyncError::NotSignedIn)?;

        let remote = &self.remote;
        let snapshot = match self
            .authorized(&mut sign_outs, |token| async move { remote.list_notes(&token).await })
            .await
        {
            Ok(snapshot) => snapshot,
            Err(CallError::Cancelled) => return Err(SyncError::Cancelled),
            Err(CallError::Remote(e)) => return Err(SyncError::Remote(e)),
            Err(CallError::Halt(reason)) => return Err(self.halt(reason).await),
            Err(CallError::Sync(e)) => return Err(e),
        };

        let applied = self.with_scope(Some(user_id.as_str()), |state| {
            let mut notes = state.notes.load_all()?;
            let mut applied = 0;

            for remote_note in &snapshot.notes {
                let server = match remote_note.server_copy() {
                    Ok(server) => server,
                    Err(reason) => {
                        warn!("Skipping malformed note {} in snapshot: {}", remote_note.note_id, reason);
                        continue;
                    }
                };
                let note_id = server.note_id.as_str();

                match state.queue.get(note_id) {
                    // The flush that owns it will settle it.
                    Some(entry) if entry.state == EntryState::InFlight => {}
                    Some(entry) => {
                        let local_updated_at = entry.latest().1.updated_at();
                        match resolve_against(local_updated_at, &server) {
                            Resolution::AcceptRemote => {
                                if apply_server_copy(&mut notes, &server) {
                                    applied += 1;
                                }
                                state.queue.drop_entry(note_id);
                                state.queue.record_version(note_id, server.version);
                            }
                            Resolution::KeepLocal => {
                                state.queue.requeue_over(note_id, server.version);
                            }
                        }
                    }
                    None => {
                        let local = notes.iter().find(|n| n.note_id == note_id);
                        let newer = if server.is_deleted {
                            local.is_some()
                        } else {
                            server.record.is_some()
                                && local.map_or(true, |l| {
                                    ConflictResolver::remote_is_newer(l.updated_at(), server.updated_at)
                                })
                        };
                        if newer && apply_server_copy(&mut notes, &server) {
                            applied += 1;
                        }
                        state.queue.record_version(note_id, server.version);
                    }
                }
            }

            if applied > 0 {
                state.notes.save_all(&notes)?;
            }
            self.persist_queue(state);
            Ok(applied)
        })?;

        let mut metadata = SyncMetadata::load(&self.backend)?;
        metadata.last_pull_at = Some(self.clock.now_secs());
        metadata.save(&self.backend)?;

        debug!("Pulled {} remote changes", applied);
        Ok(applied)
    }

    /// Flush with bounded retries, then pull.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        let mut rounds = 0;

        loop {
            rounds += 1;
            match self.flush().await {
                Ok(outcome) => report.absorb(outcome),
                Err(SyncError::Remote(e)) if e.is_transient() => {
                    debug!("Flush round {} failed transiently: {}", rounds, e);
                }
                Err(e) => return Err(e),
            }

            let user_id = self.current_user_id().ok_or(SyncError::NotSignedIn)?;
            let now_ms = self.clock.now_ms();
            let wait_ms = self.with_scope(Some(user_id.as_str()), |state| {
                Ok(state.queue.next_ready_in(now_ms))
            })?;
            match wait_ms {
                None => break,
                Some(_) if rounds >= self.settings.max_attempts => {
                    info!("Giving up after {} rounds; notes remain queued", rounds);
                    break;
                }
                Some(ms) if ms > 0 => {
                    tokio::time::sleep(Duration::from_millis(ms.unsigned_abs())).await;
                }
                Some(_) => {}
            }
        }

        report.pulled = self.pull().await?;
        report.pending = self.pending_count()?;

        let mut metadata = SyncMetadata::load(&self.backend)?;
        metadata.last_sync_at = Some(self.clock.now_secs());
        metadata.save(&self.backend)?;

        info!(
            "Sync complete: pushed {}, acknowledged {}, conflicts {}, pulled {}, pending {}",
            report.pushed, report.acknowledged, report.conflicts_resolved, report.pulled, report.pending
        );
        Ok(report)
    }

    /// Follow the realtime change stream, pulling whenever the backend
    /// reports a change. Returns `Ok(())` once the session signs out.
    pub async fn watch(&self) -> Result<(), SyncError> {
        self.current_user_id().ok_or(SyncError::NotSignedIn)?;
        let mut sign_outs = self.session.subscribe_sign_out();
        let mut attempt: u32 = 0;

        loop {
            self.check_halted()?;
            let remote = &self.remote;
            let connected = self
                .authorized(&mut sign_outs, |token| async move {
                    remote.stream_notes(&token).await
                })
                .await;
            let mut events = match connected {
                Ok(events) => events,
                Err(CallError::Cancelled) | Err(CallError::Sync(SyncError::NotSignedIn)) => {
                    return Ok(())
                }
                Err(CallError::Remote(e)) if e.is_transient() => {
                    attempt = attempt.saturating_add(1);
                    warn!("Change stream unavailable ({}); retry {}", e, attempt);
                    if !self.pause(&mut sign_outs, attempt).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(CallError::Remote(e)) => return Err(SyncError::Remote(e)),
                Err(CallError::Halt(reason)) => return Err(self.halt(reason).await),
                Err(CallError::Sync(e)) => return Err(e),
            };

            info!("Change stream connected");
            attempt = 0;
            // Catch up on whatever changed while disconnected.
            if !self.pull_on_change().await? {
                return Ok(());
            }

            loop {
                let next = tokio::time::timeout(self.settings.heartbeat_timeout, events.next_event());
                let event = tokio::select! {
                    biased;
                    _ = sign_outs.changed() => return Ok(()),
                    event = next => event,
                };
                match event {
                    Ok(Ok(Some(RealtimeEvent::NoteChange { note_ids, .. }))) => {
                        debug!("Backend reported changes to {} notes", note_ids.len());
                        if !self.pull_on_change().await? {
                            return Ok(());
                        }
                    }
                    Ok(Ok(Some(RealtimeEvent::Heartbeat))) => {}
                    Ok(Ok(Some(RealtimeEvent::Other(name)))) => {
                        debug!("Ignoring stream event {}", name);
                    }
                    Ok(Ok(None)) => {
                        info!("Change stream closed by the backend");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!("Change stream failed: {}", e);
                        break;
                    }
                    Err(_) => {
                        warn!(
                            "No stream event for {:?}; reconnecting",
                            self.settings.heartbeat_timeout
                        );
                        break;
                    }
                }
            }

            attempt = attempt.saturating_add(1);
            if !self.pause(&mut sign_outs, attempt).await {
                return Ok(());
            }
        }
    }

    /// Pull for the change stream. `Ok(false)` means the session is gone.
    async fn pull_on_change(&self) -> Result<bool, SyncError> {
        match self.pull().await {
            Ok(applied) => {
                if applied > 0 {
                    info!("Applied {} remote changes", applied);
                }
                Ok(true)
            }
            Err(SyncError::Cancelled) | Err(SyncError::NotSignedIn) => Ok(false),
            Err(SyncError::Remote(e)) if e.is_transient() => {
                warn!("Pull after stream event failed: {}", e);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait out the reconnect delay. Returns false if the session signed out.
    async fn pause(&self, sign_outs: &mut watch::Receiver<u64>, attempt: u32) -> bool {
        let delay = self.settings.backoff.delay(attempt);
        tokio::select! {
            biased;
            _ = sign_outs.changed() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

fn build_request(batch: &[QueueEntry], device_id: Uuid, now_secs: i64) -> SyncRequest {
    let operations = batch
        .iter()
        .map(|entry| SyncOperation {
            note_id: entry.note_id.clone(),
            operation: entry.operation,
            base_version: entry.base_version,
            client_edit_seq: entry.client_edit_seq,
            client_device: device_id.to_string(),
            client_time_s: now_secs,
            created_at_s: entry
                .snapshot
                .created_at()
                .map_or(now_secs, |t| t.timestamp()),
            updated_at_s: entry
                .snapshot
                .updated_at()
                .map_or(now_secs, |t| t.timestamp()),
            payload: Some(entry.snapshot.clone()),
        })
        .collect();
    SyncRequest { operations }
}

/// Settle a queued local edit against a server copy. A live server copy
/// without a payload has nothing to apply, so the local edit stands.
fn resolve_against(local_updated_at: Option<DateTime<Utc>>, server: &ServerCopy) -> Resolution {
    if !server.is_deleted && server.record.is_none() {
        return Resolution::KeepLocal;
    }
    ConflictResolver::resolve(local_updated_at, server.updated_at)
}

/// Whether the server stored exactly what this entry sent.
fn server_matches(entry: &QueueEntry, server: &ServerCopy) -> bool {
    match entry.operation {
        Operation::Upsert => !server.is_deleted && server.record.as_ref() == Some(&entry.snapshot),
        Operation::Delete => server.is_deleted,
    }
}

/// Apply a server copy to the in-memory note set. Returns whether it changed.
fn apply_server_copy(notes: &mut Vec<NoteRecord>, server: &ServerCopy) -> bool {
    if server.is_deleted {
        let before = notes.len();
        notes.retain(|n| n.note_id != server.note_id);
        return notes.len() != before;
    }
    let Some(record) = &server.record else {
        return false;
    };
    match notes.iter_mut().find(|n| n.note_id == record.note_id) {
        Some(existing) if existing == record => false,
        Some(existing) => {
            *existing = record.clone();
            true
        }
        None => {
            notes.push(record.clone());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::identity::NoopIdentityProvider;
    use crate::auth::state::AuthStateStore;
    use crate::clock::FixedClock;
    use crate::storage::notes::scope_for_user;
    use crate::sync::backoff::BackoffPolicy;
    use crate::sync::testutil::{credential_for, FakeRemote, CLIENT_ID, NOW_SECS};
    use chrono::DateTime;
    use std::collections::BTreeMap;

    struct Harness {
        backend: Arc<StorageBackend>,
        remote: Arc<FakeRemote>,
        clock: Arc<FixedClock>,
        session: Arc<SessionContext>,
        engine: SyncEngine,
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            attempt_timeout: Duration::from_secs(5),
            max_attempts: 3,
            backoff: BackoffPolicy {
                base: Duration::ZERO,
                max: Duration::ZERO,
                jitter: 0.0,
            },
            heartbeat_timeout: Duration::from_secs(5),
        }
    }

    async fn harness() -> Harness {
        harness_with(settings()).await
    }

    async fn harness_with(settings: SyncSettings) -> Harness {
        let backend = Arc::new(StorageBackend::in_memory().unwrap());
        let remote = Arc::new(FakeRemote::new());
        let clock = Arc::new(FixedClock::at_secs(NOW_SECS));
        let session = Arc::new(SessionContext::new(
            AuthStateStore::new(backend.clone(), CLIENT_ID),
            remote.clone(),
            Arc::new(NoopIdentityProvider),
            clock.clone(),
        ));
        session.initialize().await.unwrap();
        session.sign_in(&credential_for("u1")).await.unwrap();
        let engine = SyncEngine::new(
            remote.clone(),
            session.clone(),
            backend.clone(),
            clock.clone(),
            settings,
        );
        Harness {
            backend,
            remote,
            clock,
            session,
            engine,
        }
    }

    fn note_at(id: &str, text: &str, secs: i64) -> NoteRecord {
        NoteRecord::with_id(id, text, DateTime::from_timestamp(secs, 0).unwrap())
    }

    impl Harness {
        fn edit(&self, id: &str, text: &str) -> NoteRecord {
            let now = self.clock.now();
            let record = match self.engine.notes().unwrap().get_by_id(id).unwrap() {
                Some(mut existing) => {
                    existing.edit(text, now);
                    existing
                }
                None => NoteRecord::with_id(id, text, now),
            };
            self.engine.record_edit(record.clone()).unwrap();
            record
        }

        fn local(&self, id: &str) -> Option<NoteRecord> {
            self.engine.notes().unwrap().get_by_id(id).unwrap()
        }

        fn queued(&self, id: &str) -> Option<QueueEntry> {
            let queue = SyncQueue::load(&self.backend, &scope_for_user(Some("u1"))).unwrap();
            queue.get(id).cloned()
        }
    }

    #[tokio::test]
    async fn coalesced_edits_are_sent_once() {
        let h = harness().await;
        h.edit("n1", "first");
        h.clock.advance_ms(1_000);
        h.edit("n1", "second");
        assert_eq!(h.engine.pending_count().unwrap(), 1);

        let outcome = h.engine.flush().await.unwrap();
        assert_eq!(outcome.pushed, 1);
        assert_eq!(outcome.acknowledged, 1);

        let requests = h.remote.requests();
        assert_eq!(requests.len(), 1);
        let op = &requests[0].operations[0];
        assert_eq!(op.client_edit_seq, 2);
        assert_eq!(op.payload.as_ref().unwrap().markdown_text, "second");
        assert_eq!(h.engine.pending_count().unwrap(), 0);
        assert_eq!(h.remote.server_note("n1").unwrap().version, 1);
    }

    #[tokio::test]
    async fn stale_edit_does_not_move_updated_at_backwards() {
        let h = harness().await;
        let newer = note_at("n1", "newer", NOW_SECS + 100);
        h.engine.record_edit(newer.clone()).unwrap();
        h.engine
            .record_edit(note_at("n1", "stale edit", NOW_SECS))
            .unwrap();

        let stored = h.local("n1").unwrap();
        assert_eq!(stored.markdown_text, "stale edit");
        assert_eq!(stored.updated_at_iso, newer.updated_at_iso);

        let queued = h.queued("n1").unwrap();
        assert_eq!(queued.latest().1.updated_at_iso, newer.updated_at_iso);
        assert_eq!(queued.latest().1.markdown_text, "stale edit");
    }

    #[tokio::test]
    async fn newer_server_copy_overwrites_local() {
        let h = harness().await;
        h.edit("n1", "local");
        h.remote
            .put_server_note(note_at("n1", "from another device", NOW_SECS + 60), false);

        let outcome = h.engine.flush().await.unwrap();
        assert_eq!(outcome.conflicts_resolved, 1);
        assert_eq!(h.local("n1").unwrap().markdown_text, "from another device");
        assert!(h.queued("n1").is_none());
    }

    #[tokio::test]
    async fn newer_local_copy_is_resubmitted_over_server_version() {
        let h = harness().await;
        h.remote
            .put_server_note(note_at("n1", "older server", NOW_SECS - 60), false);
        h.edit("n1", "newer local");

        let report = h.engine.sync().await.unwrap();
        assert_eq!(report.conflicts_resolved, 1);
        assert_eq!(report.acknowledged, 1);
        assert_eq!(report.pending, 0);

        let requests = h.remote.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].operations[0].base_version, 1);
        let server = h.remote.server_note("n1").unwrap();
        assert_eq!(server.version, 2);
        assert_eq!(server.payload.unwrap().markdown_text, "newer local");
    }

    #[tokio::test]
    async fn equal_timestamps_prefer_server() {
        let h = harness().await;
        h.edit("n1", "local");
        h.remote
            .put_server_note(note_at("n1", "server", NOW_SECS), false);

        h.engine.flush().await.unwrap();
        assert_eq!(h.local("n1").unwrap().markdown_text, "server");
    }

    #[tokio::test]
    async fn transient_failure_then_success_stores_once() {
        let h = harness().await;
        h.edit("n1", "hello");
        h.remote.fail_next_sync(RemoteError::Transport("connection reset".into()));

        let err = h.engine.flush().await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::Transport(_))));
        let entry = h.queued("n1").unwrap();
        assert_eq!(entry.state, EntryState::Pending);
        assert_eq!(entry.attempts, 1);

        h.clock.advance_ms(10);
        let outcome = h.engine.flush().await.unwrap();
        assert_eq!(outcome.acknowledged, 1);
        assert!(h.queued("n1").is_none());
        assert_eq!(h.remote.server_note_count(), 1);
        assert_eq!(h.remote.server_note("n1").unwrap().version, 1);

        // Resubmission carried the same edit sequence.
        let requests = h.remote.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].operations, requests[1].operations);
    }

    #[tokio::test]
    async fn sync_retries_transient_failures() {
        let h = harness().await;
        h.edit("n1", "hello");
        h.remote.fail_next_sync(RemoteError::Timeout);
        h.remote.fail_next_sync(RemoteError::Status {
            status: 503,
            body: "busy".into(),
        });

        let report = h.engine.sync().await.unwrap();
        assert_eq!(report.acknowledged, 1);
        assert_eq!(report.pending, 0);
        assert_eq!(h.remote.requests().len(), 3);
        assert!(h.engine.status().unwrap().last_sync_at.is_some());
    }

    #[tokio::test]
    async fn sync_gives_up_after_max_attempts() {
        let h = harness().await;
        h.edit("n1", "hello");
        for _ in 0..5 {
            h.remote.fail_next_sync(RemoteError::Timeout);
        }
        let report = h.engine.sync().await.unwrap();
        assert_eq!(report.pending, 1);
        assert_eq!(h.remote.requests().len(), 3);
        assert_eq!(h.queued("n1").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn edit_during_flight_goes_out_in_second_request() {
        let h = harness().await;
        h.edit("n1", "first");
        let gate = h.remote.gate_syncs();

        let (first, _) = tokio::join!(h.engine.flush(), async {
            tokio::task::yield_now().await;
            h.clock.advance_ms(1_000);
            h.edit("n1", "second");
            gate.notify_one();
        });
        let first = first.unwrap();
        assert_eq!(first.acknowledged, 1);
        assert_eq!(h.local("n1").unwrap().markdown_text, "second");

        let entry = h.queued("n1").unwrap();
        assert_eq!(entry.state, EntryState::Pending);
        assert_eq!(entry.base_version, 1);

        h.remote.open_syncs();
        h.engine.flush().await.unwrap();
        let requests = h.remote.requests();
        assert_eq!(requests.len(), 2);
        let op = &requests[1].operations[0];
        assert_eq!(op.payload.as_ref().unwrap().markdown_text, "second");
        assert_eq!(op.client_edit_seq, 2);
        assert!(h.queued("n1").is_none());
    }

    #[tokio::test]
    async fn unauthorized_triggers_refresh() {
        let h = harness().await;
        h.edit("n1", "hello");
        h.remote.revoke_tokens();

        let outcome = h.engine.flush().await.unwrap();
        assert_eq!(outcome.acknowledged, 1);
        assert_eq!(h.remote.exchanges(), 2);
        assert!(h.session.is_signed_in());
    }

    #[tokio::test]
    async fn failed_refresh_halts_until_next_sign_in() {
        let h = harness().await;
        h.edit("n1", "hello");
        h.remote.revoke_tokens();
        h.remote.fail_next_exchange(RemoteError::Unauthorized);

        assert!(matches!(h.engine.flush().await, Err(SyncError::Halted)));
        assert!(!h.session.is_signed_in());
        assert!(matches!(h.engine.flush().await, Err(SyncError::Halted)));
        assert_eq!(h.queued("n1").unwrap().state, EntryState::Pending);

        h.session.sign_in(&credential_for("u1")).await.unwrap();
        let outcome = h.engine.flush().await.unwrap();
        assert_eq!(outcome.acknowledged, 1);
    }

    #[tokio::test]
    async fn sign_out_during_flush_leaves_store_untouched() {
        let h = harness().await;
        h.edit("n1", "mine");
        h.remote
            .put_server_note(note_at("n1", "theirs", NOW_SECS + 600), false);
        h.remote.block_syncs();

        let (result, _) = tokio::join!(h.engine.flush(), async {
            tokio::task::yield_now().await;
            h.session.sign_out().await;
        });
        assert!(matches!(result, Err(SyncError::Cancelled)));

        let store = LocalNoteStore::for_user(h.backend.clone(), Some("u1"));
        assert_eq!(store.get_by_id("n1").unwrap().unwrap().markdown_text, "mine");
        assert_eq!(h.queued("n1").unwrap().state, EntryState::Pending);
    }

    #[tokio::test]
    async fn missing_or_malformed_results_stay_pending() {
        let h = harness().await;
        h.edit("n1", "one");
        h.edit("n2", "two");

        let mut overrides = BTreeMap::new();
        overrides.insert("n1".to_string(), None);
        overrides.insert(
            "n2".to_string(),
            Some(crate::sync::models::SyncResult {
                note_id: "n2".into(),
                accepted: true,
                version: 1,
                updated_at_s: NOW_SECS,
                last_writer_edit_seq: 1,
                is_deleted: false,
                payload: Some(serde_json::json!({ "garbage": true })),
            }),
        );
        h.remote.override_next_results(overrides);

        let outcome = h.engine.flush().await.unwrap();
        assert_eq!(outcome.retrying, 2);
        assert_eq!(h.queued("n1").unwrap().state, EntryState::Pending);
        assert_eq!(h.queued("n2").unwrap().attempts, 1);
        assert_eq!(h.local("n2").unwrap().markdown_text, "two");
    }

    #[tokio::test]
    async fn delete_is_pushed_as_tombstone() {
        let h = harness().await;
        h.edit("n1", "doomed");
        h.engine.flush().await.unwrap();

        h.clock.advance_ms(1_000);
        assert!(h.engine.record_delete("n1").unwrap());
        assert!(!h.engine.record_delete("missing").unwrap());
        assert!(h.local("n1").is_none());

        h.engine.flush().await.unwrap();
        let server = h.remote.server_note("n1").unwrap();
        assert!(server.is_deleted);
        assert_eq!(server.version, 2);
        assert!(h.queued("n1").is_none());
    }

    #[tokio::test]
    async fn pull_merges_remote_changes() {
        let h = harness().await;
        h.edit("kept", "local and newer");
        h.edit("gone", "will be deleted remotely");
        h.engine.flush().await.unwrap();

        h.clock.advance_ms(5_000);
        h.edit("kept", "edited again locally");

        h.remote
            .put_server_note(note_at("fresh", "from phone", NOW_SECS + 1), false);
        h.remote
            .put_server_note(note_at("gone", "", NOW_SECS + 2), true);
        h.remote
            .put_server_note(note_at("kept", "stale server", NOW_SECS + 3), false);

        let pulled = h.engine.pull().await.unwrap();
        assert_eq!(pulled, 2);
        assert_eq!(h.local("fresh").unwrap().markdown_text, "from phone");
        assert!(h.local("gone").is_none());
        assert_eq!(h.local("kept").unwrap().markdown_text, "edited again locally");

        let entry = h.queued("kept").unwrap();
        assert_eq!(entry.base_version, 2);
    }

    #[tokio::test]
    async fn empty_server_copy_leaves_queued_edit_pending() {
        let h = harness().await;
        h.edit("n1", "local draft");
        let version = h.remote.put_empty_server_note("n1", NOW_SECS + 60);

        assert_eq!(h.engine.pull().await.unwrap(), 0);
        assert_eq!(h.local("n1").unwrap().markdown_text, "local draft");
        let entry = h.queued("n1").unwrap();
        assert_eq!(entry.base_version, version);
        assert_eq!(entry.state, EntryState::Pending);

        let outcome = h.engine.flush().await.unwrap();
        assert_eq!(outcome.acknowledged, 1);
        let stored = h.remote.server_note("n1").unwrap();
        assert_eq!(stored.payload.unwrap().markdown_text, "local draft");
    }

    #[tokio::test]
    async fn rejected_result_without_payload_resubmits_local() {
        let h = harness().await;
        h.edit("n1", "local draft");
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "n1".to_string(),
            Some(crate::sync::models::SyncResult {
                note_id: "n1".into(),
                accepted: false,
                version: 5,
                updated_at_s: NOW_SECS + 60,
                last_writer_edit_seq: 0,
                is_deleted: false,
                payload: None,
            }),
        );
        h.remote.override_next_results(overrides);

        let outcome = h.engine.flush().await.unwrap();
        assert_eq!(outcome.conflicts_resolved, 1);
        assert_eq!(h.local("n1").unwrap().markdown_text, "local draft");
        let entry = h.queued("n1").unwrap();
        assert_eq!(entry.base_version, 5);
        assert_eq!(entry.state, EntryState::Pending);
    }

    #[tokio::test]
    async fn queue_survives_restart() {
        let h = harness().await;
        h.edit("n1", "offline edit");

        let restarted = SyncEngine::new(
            h.remote.clone(),
            h.session.clone(),
            h.backend.clone(),
            h.clock.clone(),
            settings(),
        );
        assert_eq!(restarted.pending_count().unwrap(), 1);
        let outcome = restarted.flush().await.unwrap();
        assert_eq!(outcome.acknowledged, 1);
    }

    #[tokio::test]
    async fn status_reports_queue_and_device() {
        let h = harness().await;
        h.edit("n1", "x");
        let status = h.engine.status().unwrap();
        assert!(status.signed_in);
        assert_eq!(status.user_email.as_deref(), Some("u1@example.com"));
        assert_eq!(status.pending, 1);
        assert!(status.device_id.is_none());

        h.engine.sync().await.unwrap();
        let status = h.engine.status().unwrap();
        assert_eq!(status.pending, 0);
        assert!(status.device_id.is_some());
        assert_eq!(status.last_sync_at, Some(NOW_SECS));
    }

    #[tokio::test]
    async fn flush_requires_sign_in() {
        let h = harness().await;
        h.session.sign_out().await;
        h.edit("n1", "anonymous");
        assert!(matches!(h.engine.flush().await, Err(SyncError::NotSignedIn)));
        assert_eq!(h.engine.pending_count().unwrap(), 1);
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn change(note_id: &str) -> RealtimeEvent {
        RealtimeEvent::NoteChange {
            note_ids: vec![note_id.to_string()],
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn change_event_pulls_remote_note() {
        let h = harness().await;
        let driver = async {
            wait_until(|| h.remote.stream_connects() == 1 && h.remote.list_calls() == 1).await;
            h.remote
                .put_server_note(note_at("n1", "from phone", NOW_SECS + 1), false);
            h.remote.push_event(change("n1"));
            wait_until(|| h.local("n1").is_some()).await;
            assert_eq!(h.local("n1").unwrap().markdown_text, "from phone");
            h.session.sign_out().await;
        };

        let (watched, ()) = tokio::join!(h.engine.watch(), driver);
        watched.unwrap();
        assert_eq!(h.remote.list_calls(), 2);
        assert_eq!(h.remote.stream_connects(), 1);
    }

    #[tokio::test]
    async fn heartbeats_keep_the_stream_open() {
        let h = harness_with(SyncSettings {
            heartbeat_timeout: Duration::from_millis(150),
            ..settings()
        })
        .await;
        let driver = async {
            wait_until(|| h.remote.stream_connects() == 1).await;
            for _ in 0..20 {
                h.remote.push_event(RealtimeEvent::Heartbeat);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            h.session.sign_out().await;
        };

        let (watched, ()) = tokio::join!(h.engine.watch(), driver);
        watched.unwrap();
        assert_eq!(h.remote.stream_connects(), 1);
        assert_eq!(h.remote.list_calls(), 1);
    }

    #[tokio::test]
    async fn silent_stream_is_reconnected() {
        let h = harness_with(SyncSettings {
            heartbeat_timeout: Duration::from_millis(30),
            ..settings()
        })
        .await;
        let driver = async {
            wait_until(|| h.remote.stream_connects() >= 2).await;
            h.session.sign_out().await;
        };

        let (watched, ()) = tokio::join!(h.engine.watch(), driver);
        watched.unwrap();
        // Each reconnect catches up with a pull.
        assert!(h.remote.list_calls() >= 2);
    }

    #[tokio::test]
    async fn closed_or_broken_stream_is_reconnected() {
        let h = harness().await;
        let driver = async {
            wait_until(|| h.remote.stream_connects() == 1).await;
            h.remote.close_streams();
            wait_until(|| h.remote.stream_connects() == 2).await;
            h.remote.break_streams(RemoteError::Transport("reset".into()));
            wait_until(|| h.remote.stream_connects() == 3).await;
            h.session.sign_out().await;
        };

        let (watched, ()) = tokio::join!(h.engine.watch(), driver);
        watched.unwrap();
    }

    #[tokio::test]
    async fn stream_connect_failures_are_retried() {
        let h = harness().await;
        h.remote.fail_next_stream(RemoteError::Status {
            status: 503,
            body: "stream_unavailable".into(),
        });
        let driver = async {
            wait_until(|| h.remote.stream_connects() == 1).await;
            h.session.sign_out().await;
        };

        let (watched, ()) = tokio::join!(h.engine.watch(), driver);
        watched.unwrap();
    }

    #[tokio::test]
    async fn rejected_stream_ends_watch() {
        let h = harness().await;
        h.remote.fail_next_stream(RemoteError::Status {
            status: 404,
            body: "not found".into(),
        });
        let err = h.engine.watch().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Remote(RemoteError::Status { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn stream_refreshes_expired_token() {
        let h = harness().await;
        h.remote.revoke_tokens();
        let driver = async {
            wait_until(|| h.remote.stream_connects() == 1).await;
            h.session.sign_out().await;
        };

        let (watched, ()) = tokio::join!(h.engine.watch(), driver);
        watched.unwrap();
        assert_eq!(h.remote.exchanges(), 2);
    }

    #[tokio::test]
    async fn watch_requires_sign_in() {
        let h = harness().await;
        h.session.sign_out().await;
        assert!(matches!(
            h.engine.watch().await,
            Err(SyncError::NotSignedIn)
        ));
    }
}
