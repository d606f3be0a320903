//! Note synchronization with the Gravity backend.
//!
//! Local edits are written to the note store first and queued; the engine
//! pushes the queue in batches, settles conflicts last-writer-wins on
//! `updatedAtIso`, and pulls the server snapshot back in. A realtime change
//! stream triggers those pulls as soon as another device writes.

pub mod backoff;
#[cfg(feature = "sync")]
pub mod client;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod models;
pub mod queue;
pub mod realtime;
pub mod remote;
#[cfg(test)]
pub mod testutil;

#[cfg(feature = "sync")]
pub use client::BackendClient;
pub use config::{SyncMetadata, SyncSettings};
pub use conflict::{ConflictResolver, Resolution};
pub use engine::{FlushOutcome, SyncEngine};
pub use models::{SyncReport, SyncStatus};
pub use queue::{EntryState, QueueEntry, SyncQueue};
pub use realtime::{NoteEvents, RealtimeEvent};
pub use remote::{NotesRemote, RemoteError};

pub use crate::storage::models::NoteRecord;

use crate::auth::session::SessionError;
use crate::storage::StorageError;
use thiserror::Error;

/// Sync errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Not signed in")]
    NotSignedIn,

    #[error("Sync halted: the session could not be refreshed; sign in again")]
    Halted,

    #[error("Sync cancelled by sign-out")]
    Cancelled,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}
