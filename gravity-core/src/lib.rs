//! Gravity Notes Core Library
//!
//! This library provides the client-side core of Gravity Notes: credential
//! validation, persisted session state, local-first note storage and
//! background synchronization with the Gravity backend.

pub mod auth;
pub mod clock;
pub mod config;
pub mod platform;
pub mod readiness;
pub mod storage;
pub mod sync;

pub use auth::credential::{decode, CredentialClaims, CredentialError};
pub use auth::session::{SessionContext, SessionError, SessionPhase};
pub use auth::state::{AuthStateStore, AuthUser, PersistedAuthState};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConfigError, Environment, RuntimeConfig};
pub use platform::{ensure_data_dir, get_data_dir};
pub use storage::{LocalNoteStore, StorageBackend, StorageError};
pub use sync::{NoteRecord, SyncEngine, SyncError, SyncReport, SyncSettings, SyncStatus};
