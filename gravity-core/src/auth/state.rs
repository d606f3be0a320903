//! Persisted auth state and its store.
//!
//! The stored record is validated on the way in and again on every load: the
//! configured client id can change between deployments, so a record that was
//! valid when written may no longer be valid when read.

use crate::auth::credential::{self, CredentialClaims, CLOCK_SKEW_SECS};
use crate::clock::Clock;
use crate::storage::{StorageBackend, StoreArea};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage key of the auth record inside the session area.
pub const AUTH_STATE_KEY: &str = "auth_state";

/// Signed-in user profile.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture_url: Option<String>,
}

/// Session record kept in durable storage.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedAuthState {
    pub user: AuthUser,
    pub credential: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_access_token_expires_at_ms: Option<i64>,
}

impl std::fmt::Debug for PersistedAuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedAuthState")
            .field("user", &self.user)
            .field("credential", &"<redacted>")
            .field("client_id", &self.client_id)
            .field(
                "backend_access_token",
                &self.backend_access_token.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "backend_access_token_expires_at_ms",
                &self.backend_access_token_expires_at_ms,
            )
            .finish()
    }
}

/// Why a record was refused. Only used for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Malformed(String),
    MissingUser,
    SubjectMismatch,
    AudienceMismatch,
    UntrustedIssuer,
}

impl PersistedAuthState {
    /// Build a record from a credential the identity provider just handed us.
    pub fn from_credential(credential: &str, client_id: &str) -> Result<Self, credential::CredentialError> {
        let claims = credential::decode(credential)?;
        Ok(Self {
            user: AuthUser {
                id: claims.subject().unwrap_or_default().to_string(),
                email: claims.email.clone(),
                name: claims.name.clone(),
                picture_url: claims.picture.clone(),
            },
            credential: credential.to_string(),
            client_id: client_id.to_string(),
            backend_access_token: None,
            backend_access_token_expires_at_ms: None,
        })
    }

    /// Attach a backend access token that expires `expires_in_secs` from now.
    pub fn with_backend_token(mut self, token: String, expires_in_secs: i64, clock: &dyn Clock) -> Self {
        self.backend_access_token = Some(token);
        self.backend_access_token_expires_at_ms =
            Some(clock.now_ms().saturating_add(expires_in_secs.saturating_mul(1000)));
        self
    }

    /// Whether the Google credential itself is still within its lifetime.
    pub fn is_fresh(&self, clock: &dyn Clock) -> bool {
        credential::decode(&self.credential)
            .map(|claims| claims.is_fresh(clock.now()))
            .unwrap_or(false)
    }

    /// The backend access token, if present and not about to expire.
    pub fn usable_backend_token(&self, clock: &dyn Clock) -> Option<&str> {
        let token = self.backend_access_token.as_deref().filter(|t| !t.is_empty())?;
        let expires_at = self.backend_access_token_expires_at_ms?;
        if clock.now_ms().saturating_add(CLOCK_SKEW_SECS * 1000) < expires_at {
            Some(token)
        } else {
            None
        }
    }

    /// Check the record's invariants against the live client id.
    pub fn validate(&self, configured_client_id: &str) -> Result<CredentialClaims, Rejection> {
        if self.user.id.trim().is_empty() {
            return Err(Rejection::MissingUser);
        }
        let claims = credential::decode(&self.credential)
            .map_err(|e| Rejection::Malformed(e.to_string()))?;
        if claims.subject() != Some(self.user.id.as_str()) {
            return Err(Rejection::SubjectMismatch);
        }
        if !claims.audience_matches(&[self.client_id.as_str(), configured_client_id]) {
            return Err(Rejection::AudienceMismatch);
        }
        if !claims.issuer_allowed() {
            return Err(Rejection::UntrustedIssuer);
        }
        Ok(claims)
    }
}

/// Parse and validate a raw stored record. Unknown fields are dropped.
pub fn validate_persisted_auth_state(
    raw: &serde_json::Value,
    configured_client_id: &str,
) -> Option<PersistedAuthState> {
    let state: PersistedAuthState = serde_json::from_value(raw.clone()).ok()?;
    state.validate(configured_client_id).ok()?;
    Some(state)
}

/// Durable home of the single [`PersistedAuthState`].
#[derive(Clone)]
pub struct AuthStateStore {
    backend: Arc<StorageBackend>,
    configured_client_id: String,
}

impl AuthStateStore {
    pub fn new(backend: Arc<StorageBackend>, configured_client_id: impl Into<String>) -> Self {
        Self {
            backend,
            configured_client_id: configured_client_id.into(),
        }
    }

    pub fn configured_client_id(&self) -> &str {
        &self.configured_client_id
    }

    /// Persist `state` if it passes validation. Invalid records are dropped
    /// without an error, so storage only ever holds validated records.
    pub fn save(&self, state: &PersistedAuthState) {
        if let Err(reason) = state.validate(&self.configured_client_id) {
            debug!("Not persisting auth state: {:?}", reason);
            return;
        }

        let raw = match serde_json::to_string(state) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize auth state: {}", e);
                return;
            }
        };

        if let Err(e) = self.backend.put(StoreArea::Session, AUTH_STATE_KEY, &raw) {
            warn!("Failed to persist auth state: {}", e);
        }
    }

    /// Read and re-validate the stored record. Anything invalid is removed.
    pub fn load(&self) -> Option<PersistedAuthState> {
        let raw = match self.backend.get(StoreArea::Session, AUTH_STATE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read auth state: {}", e);
                return None;
            }
        };

        let parsed: Result<PersistedAuthState, Rejection> = serde_json::from_str(&raw)
            .map_err(|e| Rejection::Malformed(e.to_string()))
            .and_then(|state: PersistedAuthState| {
                state.validate(&self.configured_client_id)?;
                Ok(state)
            });

        match parsed {
            Ok(state) => Some(state),
            Err(reason) => {
                debug!("Discarding stored auth state: {:?}", reason);
                self.clear();
                None
            }
        }
    }

    /// Remove the stored record.
    pub fn clear(&self) {
        if let Err(e) = self.backend.remove(StoreArea::Session, AUTH_STATE_KEY) {
            warn!("Failed to clear auth state: {}", e);
        }
    }
}
