//! Backend collaborator boundary.
//!
//! The engine and session only talk to the backend through [`NotesRemote`],
//! so the HTTP client can be swapped for an in-process fake in tests.

use crate::sync::models::{
    MeResponse, SnapshotResponse, SyncRequest, SyncResponse, TokenExchangeResponse,
};
use crate::sync::realtime::NoteEvents;
use async_trait::async_trait;
use thiserror::Error;

/// Failures talking to the backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Whether retrying the same request later could succeed.
    ///
    /// Network failures, timeouts, 5xx, 408 and 429 are transient. A malformed
    /// body is also retried since the next response may well be complete.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::Malformed(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Unauthorized => false,
        }
    }
}

/// The Gravity backend as seen by the client.
#[async_trait]
pub trait NotesRemote: Send + Sync {
    /// `POST /auth/google`: trade an identity credential for a backend token.
    async fn exchange_credential(&self, id_token: &str) -> Result<TokenExchangeResponse, RemoteError>;

    /// `GET /me`
    async fn me(&self, access_token: &str) -> Result<MeResponse, RemoteError>;

    /// `POST /notes/sync`
    async fn sync_notes(
        &self,
        access_token: &str,
        request: &SyncRequest,
    ) -> Result<SyncResponse, RemoteError>;

    /// `GET /notes`
    async fn list_notes(&self, access_token: &str) -> Result<SnapshotResponse, RemoteError>;

    /// `POST /auth/logout`. Best effort; callers ignore failures.
    async fn logout(&self, access_token: &str) -> Result<(), RemoteError>;

    /// `GET /notes/stream`: open the realtime change stream.
    async fn stream_notes(&self, access_token: &str) -> Result<Box<dyn NoteEvents>, RemoteError>;
}
