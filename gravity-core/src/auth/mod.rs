//! Authentication: credential decoding, persisted auth state, the identity
//! provider adapter and the session lifecycle built on top of them.

pub mod credential;
pub mod identity;
pub mod session;
pub mod state;

pub use credential::{CredentialClaims, CredentialError};
pub use identity::{select_identity_provider, IdentityCapabilities, IdentityError, IdentityProvider};
pub use session::{SessionContext, SessionError, SessionPhase};
pub use state::{AuthStateStore, AuthUser, PersistedAuthState};
