//! Session lifecycle.
//!
//! A [`SessionContext`] is created once by the application root and shared
//! by reference. It owns the signed-in state, hands out backend access
//! tokens, and broadcasts sign-out so in-flight work can abandon itself.

use crate::auth::credential::{self, CredentialError};
use crate::auth::identity::{IdentityError, IdentityProvider};
use crate::auth::state::{AuthStateStore, AuthUser, PersistedAuthState};
use crate::clock::Clock;
use crate::readiness::{poll_until, Readiness, ReadinessError};
use crate::sync::models::MeResponse;
use crate::sync::remote::{NotesRemote, RemoteError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

/// How long to wait for the identity provider's runtime to load.
const PROVIDER_LOAD_TIMEOUT: Duration = Duration::from_secs(5);
const PROVIDER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Where the sign-in button goes.
pub const SIGN_IN_TARGET: &str = "gravity-sign-in";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session is not ready (phase: {0:?})")]
    NotReady(SessionPhase),

    #[error("Not signed in")]
    NotSignedIn,

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Credential has no subject")]
    MissingSubject,

    #[error("Credential was issued for a different client")]
    AudienceMismatch,

    #[error("Credential issuer is not trusted")]
    UntrustedIssuer,

    #[error("Credential has expired")]
    CredentialExpired,

    #[error("Backend rejected the credential")]
    Rejected,

    #[error("Backend identity {backend} does not match signed-in user {local}")]
    IdentityMismatch { backend: String, local: String },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Readiness(#[from] ReadinessError),
}

struct SessionInner {
    phase: SessionPhase,
    state: Option<PersistedAuthState>,
    /// Bumped on every sign-in.
    epoch: u64,
}

pub struct SessionContext {
    store: AuthStateStore,
    remote: Arc<dyn NotesRemote>,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    inner: Mutex<SessionInner>,
    ready: Readiness,
    sign_outs: watch::Sender<u64>,
}

impl SessionContext {
    pub fn new(
        store: AuthStateStore,
        remote: Arc<dyn NotesRemote>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (sign_outs, _rx) = watch::channel(0);
        Self {
            store,
            remote,
            identity,
            clock,
            inner: Mutex::new(SessionInner {
                phase: SessionPhase::Uninitialized,
                state: None,
                epoch: 0,
            }),
            ready: Readiness::new(),
            sign_outs,
        }
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner().phase
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    pub fn client_id(&self) -> &str {
        self.store.configured_client_id()
    }

    /// Bring up the identity provider and restore any stored session.
    ///
    /// A restored record is kept while either its credential or its backend
    /// token is still usable; otherwise it is cleared and the session starts
    /// signed out. Calling this again after success is a no-op; after a
    /// failure it retries.
    pub async fn initialize(&self) -> Result<(), SessionError> {
        {
            let mut inner = self.inner();
            match inner.phase {
                SessionPhase::Initializing | SessionPhase::Ready => return Ok(()),
                SessionPhase::Uninitialized | SessionPhase::Failed => {
                    inner.phase = SessionPhase::Initializing;
                }
            }
        }

        if let Err(e) = self.start_identity_provider().await {
            warn!("Identity provider {} failed to start: {}", self.identity.name(), e);
            self.inner().phase = SessionPhase::Failed;
            return Err(e);
        }

        let clock = self.clock.as_ref();
        let restored = match self.store.load() {
            Some(state) if state.is_fresh(clock) || state.usable_backend_token(clock).is_some() => {
                Some(state)
            }
            Some(_) => {
                info!("Stored session has expired; starting signed out");
                self.store.clear();
                None
            }
            None => None,
        };

        let user = restored.as_ref().map(|state| state.user.id.clone());
        {
            let mut inner = self.inner();
            inner.state = restored;
            inner.phase = SessionPhase::Ready;
            if user.is_some() {
                inner.epoch += 1;
            }
        }
        self.ready.mark_ready();

        match user {
            Some(id) => info!("Session ready; restored user {}", id),
            None => info!("Session ready; signed out"),
        }
        Ok(())
    }

    async fn start_identity_provider(&self) -> Result<(), SessionError> {
        let identity = self.identity.clone();
        poll_until(
            move || identity.is_loaded(),
            PROVIDER_POLL_INTERVAL,
            PROVIDER_LOAD_TIMEOUT,
        )
        .await?;
        self.identity.initialize(self.client_id()).await?;
        Ok(())
    }

    /// Wait for `initialize` to finish, up to `timeout`.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        self.ready.wait_timeout(timeout).await?;
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        match self.phase() {
            SessionPhase::Ready => Ok(()),
            other => Err(SessionError::NotReady(other)),
        }
    }

    pub fn current_user(&self) -> Option<AuthUser> {
        self.inner().state.as_ref().map(|state| state.user.clone())
    }

    pub fn is_signed_in(&self) -> bool {
        self.inner().state.is_some()
    }

    /// Sign-in counter; changes whenever a different session begins.
    pub fn epoch(&self) -> u64 {
        self.inner().epoch
    }

    /// Receiver that changes on every sign-out.
    pub fn subscribe_sign_out(&self) -> watch::Receiver<u64> {
        self.sign_outs.subscribe()
    }

    /// Sign in with a credential from the identity provider.
    pub async fn sign_in(&self, credential: &str) -> Result<AuthUser, SessionError> {
        self.ensure_ready()?;

        let claims = credential::decode(credential)?;
        if claims.subject().is_none() {
            return Err(SessionError::MissingSubject);
        }
        if !claims.audience_matches(&[self.client_id()]) {
            return Err(SessionError::AudienceMismatch);
        }
        if !claims.issuer_allowed() {
            return Err(SessionError::UntrustedIssuer);
        }
        if !claims.is_fresh(self.clock.now()) {
            return Err(SessionError::CredentialExpired);
        }

        let exchange = self
            .remote
            .exchange_credential(credential)
            .await
            .map_err(rejected_on_unauthorized)?;

        let state = PersistedAuthState::from_credential(credential, self.client_id())?
            .with_backend_token(exchange.access_token, exchange.expires_in, self.clock.as_ref());
        self.store.save(&state);

        let user = state.user.clone();
        {
            let mut inner = self.inner();
            if let Some(mut previous) = inner.state.replace(state) {
                scrub(&mut previous);
            }
            inner.epoch += 1;
        }
        info!("Signed in as {}", user.id);
        Ok(user)
    }

    /// Render the sign-in affordance and sign in with whatever the provider returns.
    pub async fn sign_in_interactive(&self) -> Result<AuthUser, SessionError> {
        self.ensure_ready()?;
        self.identity.render_button(SIGN_IN_TARGET)?;
        let credential = Zeroizing::new(self.identity.prompt().await?);
        self.sign_in(&credential).await
    }

    /// A backend access token, refreshed if the current one is missing or
    /// about to expire.
    pub async fn access_token(&self) -> Result<String, SessionError> {
        let cached = {
            let inner = self.inner();
            let state = inner.state.as_ref().ok_or(SessionError::NotSignedIn)?;
            state
                .usable_backend_token(self.clock.as_ref())
                .map(str::to_string)
        };
        match cached {
            Some(token) => Ok(token),
            None => self.refresh().await,
        }
    }

    /// Re-exchange the stored credential for a new backend token.
    pub async fn refresh(&self) -> Result<String, SessionError> {
        let credential = {
            let inner = self.inner();
            let state = inner.state.as_ref().ok_or(SessionError::NotSignedIn)?;
            Zeroizing::new(state.credential.clone())
        };

        let claims = credential::decode(&credential)?;
        if !claims.is_fresh(self.clock.now()) {
            return Err(SessionError::CredentialExpired);
        }

        let exchange = self
            .remote
            .exchange_credential(&credential)
            .await
            .map_err(rejected_on_unauthorized)?;

        let updated = {
            let mut inner = self.inner();
            let state = match inner.state.as_mut() {
                Some(state) if state.credential == *credential => state,
                // Signed out (or in as someone else) while we were waiting.
                _ => return Err(SessionError::NotSignedIn),
            };
            state.backend_access_token = Some(exchange.access_token.clone());
            state.backend_access_token_expires_at_ms = Some(
                self.clock
                    .now_ms()
                    .saturating_add(exchange.expires_in.saturating_mul(1000)),
            );
            state.clone()
        };
        self.store.save(&updated);
        debug!("Refreshed backend token for {}", updated.user.id);
        Ok(exchange.access_token)
    }

    /// Ask the backend who we are and check it matches the local session.
    pub async fn probe(&self) -> Result<MeResponse, SessionError> {
        let token = self.access_token().await?;
        let me = self.remote.me(&token).await?;
        let local = self.current_user().ok_or(SessionError::NotSignedIn)?;
        if me.user_id != local.id {
            return Err(SessionError::IdentityMismatch {
                backend: me.user_id,
                local: local.id,
            });
        }
        Ok(me)
    }

    /// Forget the session everywhere and notify subscribers. The backend
    /// logout call is best effort.
    pub async fn sign_out(&self) {
        let previous = self.inner().state.take();
        self.store.clear();
        self.identity.disable_auto_select();
        self.sign_outs.send_modify(|count| *count += 1);

        let Some(mut state) = previous else {
            return;
        };
        let user = state.user.id.clone();
        if let Some(token) = state.backend_access_token.take().map(Zeroizing::new) {
            if let Err(e) = self.remote.logout(&token).await {
                debug!("Backend logout failed: {}", e);
            }
        }
        scrub(&mut state);
        info!("Signed out {}", user);
    }
}

fn rejected_on_unauthorized(error: RemoteError) -> SessionError {
    match error {
        RemoteError::Unauthorized => SessionError::Rejected,
        other => SessionError::Remote(other),
    }
}

fn scrub(state: &mut PersistedAuthState) {
    state.credential.zeroize();
    if let Some(token) = state.backend_access_token.as_mut() {
        token.zeroize();
    }
}
