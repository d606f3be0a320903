//! Google identity credential decoding and freshness checks.
//!
//! The signature is verified by the backend during the credential exchange.
//! The client only reads the payload claims to decide whether a stored
//! session is still usable, so nothing here touches the network.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Clock-skew allowance applied to `exp`, in seconds.
pub const CLOCK_SKEW_SECS: i64 = 30;

/// The two issuer spellings Google uses for ID tokens.
pub const ALLOWED_ISSUERS: [&str; 2] = ["https://accounts.google.com", "accounts.google.com"];

/// Credential decoding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Malformed credential: {0}")]
    MalformedCredential(String),
}

impl CredentialError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedCredential(reason.into())
    }
}

/// `aud` may be a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

/// Decoded (unverified) credential payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub aud: Option<Audience>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

impl CredentialClaims {
    /// Subject, if present and non-empty.
    pub fn subject(&self) -> Option<&str> {
        self.sub.as_deref().filter(|s| !s.is_empty())
    }

    /// All audience values, flattened.
    pub fn audiences(&self) -> Vec<&str> {
        match &self.aud {
            Some(Audience::One(aud)) => vec![aud.as_str()],
            Some(Audience::Many(list)) => list.iter().map(String::as_str).collect(),
            None => Vec::new(),
        }
    }

    /// Whether any audience value equals one of `client_ids`. Empty ids never match.
    pub fn audience_matches(&self, client_ids: &[&str]) -> bool {
        self.audiences()
            .iter()
            .any(|aud| !aud.is_empty() && client_ids.iter().any(|id| !id.is_empty() && id == aud))
    }

    /// Whether the issuer is one of [`ALLOWED_ISSUERS`].
    pub fn issuer_allowed(&self) -> bool {
        self.iss
            .as_deref()
            .map(|iss| ALLOWED_ISSUERS.contains(&iss))
            .unwrap_or(false)
    }

    /// `now + skew < exp`. The skew allowance is dropped when `iat` postdates
    /// `exp`, so a token with inverted timestamps gets no grace period.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let Some(exp) = self.exp else {
            return false;
        };
        let skew = match self.iat {
            Some(iat) if iat > exp => 0,
            _ => CLOCK_SKEW_SECS,
        };
        now.timestamp().saturating_add(skew) < exp
    }

    /// Expiry as a timestamp.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| DateTime::from_timestamp(exp, 0))
    }
}

/// Decode the payload segment of a credential.
///
/// # Errors
///
/// Returns `MalformedCredential` if the token has fewer than two segments,
/// the payload is not base64url, or it does not decode to a JSON object.
pub fn decode(credential: &str) -> Result<CredentialClaims, CredentialError> {
    let mut segments = credential.trim().split('.');
    let _header = segments.next();
    let payload = segments
        .next()
        .ok_or_else(|| CredentialError::malformed("expected at least two segments"))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| CredentialError::malformed(format!("payload is not base64url: {}", e)))?;

    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| CredentialError::malformed(format!("payload is not JSON: {}", e)))?;

    if !value.is_object() {
        return Err(CredentialError::malformed("payload is not a JSON object"));
    }

    serde_json::from_value(value)
        .map_err(|e| CredentialError::malformed(format!("unexpected claim types: {}", e)))
}

/// Build an unsigned credential from a claims object. Test and tooling helper.
pub fn encode_unsigned(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{}.{}.signature", header, payload)
}
