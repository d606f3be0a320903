//! Identity provider adapter.
//!
//! The sign-in surface (a Google button, a one-tap prompt, a token pasted on
//! the command line) is hidden behind [`IdentityProvider`]. Hosts without any
//! sign-in capability get [`NoopIdentityProvider`], which never produces a
//! credential.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("No identity provider is available")]
    Unavailable,

    #[error("Sign-in was cancelled")]
    Cancelled,

    #[error("Identity provider failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the provider's runtime is loaded. Providers that load
    /// asynchronously override this; the session polls it with a deadline.
    fn is_loaded(&self) -> bool {
        true
    }

    async fn initialize(&self, client_id: &str) -> Result<(), IdentityError>;

    /// Show the sign-in affordance in `target`.
    fn render_button(&self, target: &str) -> Result<(), IdentityError>;

    /// Ask the user to sign in and return the resulting credential.
    async fn prompt(&self) -> Result<String, IdentityError>;

    /// Stop silently re-selecting the last account (called on sign-out).
    fn disable_auto_select(&self);
}

/// Used when the host has no sign-in capability.
#[derive(Debug, Default)]
pub struct NoopIdentityProvider;

#[async_trait]
impl IdentityProvider for NoopIdentityProvider {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn initialize(&self, _client_id: &str) -> Result<(), IdentityError> {
        Ok(())
    }

    fn render_button(&self, _target: &str) -> Result<(), IdentityError> {
        Ok(())
    }

    async fn prompt(&self) -> Result<String, IdentityError> {
        Err(IdentityError::Unavailable)
    }

    fn disable_auto_select(&self) {}
}

/// Hands out a credential obtained out of band (flag, environment, file).
pub struct StaticCredentialProvider {
    credential: Mutex<Option<Zeroizing<String>>>,
    client_id: Mutex<Option<String>>,
    auto_select: AtomicBool,
}

impl StaticCredentialProvider {
    pub fn new(credential: impl Into<String>) -> Self {
        Self {
            credential: Mutex::new(Some(Zeroizing::new(credential.into()))),
            client_id: Mutex::new(None),
            auto_select: AtomicBool::new(true),
        }
    }

    pub fn auto_select_enabled(&self) -> bool {
        self.auto_select.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for StaticCredentialProvider {
    fn name(&self) -> &'static str {
        "static-credential"
    }

    async fn initialize(&self, client_id: &str) -> Result<(), IdentityError> {
        if client_id.trim().is_empty() {
            return Err(IdentityError::Failed("client id is empty".to_string()));
        }
        *self.client_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(client_id.to_string());
        Ok(())
    }

    fn render_button(&self, target: &str) -> Result<(), IdentityError> {
        debug!("No button to render for {} in {}", self.name(), target);
        Ok(())
    }

    async fn prompt(&self) -> Result<String, IdentityError> {
        if self
            .client_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
        {
            return Err(IdentityError::Failed("provider is not initialized".to_string()));
        }
        // Each credential is handed out once.
        self.credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|credential| credential.to_string())
            .ok_or(IdentityError::Cancelled)
    }

    fn disable_auto_select(&self) {
        self.auto_select.store(false, Ordering::SeqCst);
    }
}

/// What the host can offer for sign-in.
#[derive(Debug, Clone, Default)]
pub struct IdentityCapabilities {
    /// A credential supplied out of band.
    pub credential: Option<String>,
}

/// Pick the provider matching the host's capabilities.
pub fn select_identity_provider(capabilities: IdentityCapabilities) -> Arc<dyn IdentityProvider> {
    match capabilities
        .credential
        .filter(|credential| !credential.trim().is_empty())
    {
        Some(credential) => Arc::new(StaticCredentialProvider::new(credential.trim())),
        None => Arc::new(NoopIdentityProvider),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_never_produces_a_credential() {
        let provider = select_identity_provider(IdentityCapabilities::default());
        assert_eq!(provider.name(), "none");
        provider.initialize("client").await.unwrap();
        provider.render_button("anywhere").unwrap();
        assert_eq!(provider.prompt().await, Err(IdentityError::Unavailable));
    }

    #[tokio::test]
    async fn static_provider_hands_out_credential_once() {
        let provider = select_identity_provider(IdentityCapabilities {
            credential: Some("  header.payload.sig \n".to_string()),
        });
        assert_eq!(provider.name(), "static-credential");
        provider.initialize("client").await.unwrap();
        assert_eq!(provider.prompt().await.unwrap(), "header.payload.sig");
        assert_eq!(provider.prompt().await, Err(IdentityError::Cancelled));
    }

    #[tokio::test]
    async fn static_provider_requires_initialization() {
        let provider = StaticCredentialProvider::new("a.b.c");
        assert!(matches!(provider.prompt().await, Err(IdentityError::Failed(_))));
        assert!(provider.initialize(" ").await.is_err());

        assert!(provider.auto_select_enabled());
        provider.disable_auto_select();
        assert!(!provider.auto_select_enabled());
    }

    #[test]
    fn blank_credential_selects_noop() {
        let provider = select_identity_provider(IdentityCapabilities {
            credential: Some("   ".to_string()),
        });
        assert_eq!(provider.name(), "none");
    }
}
