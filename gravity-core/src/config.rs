//! Runtime configuration.
//!
//! A [`RuntimeConfig`] is resolved once at startup from the defaults of the
//! active [`Environment`] plus an optional JSON override document, then shared
//! read-only (`Arc<RuntimeConfig>`) for the rest of the process.
//!
//! ```json
//! {
//!   "environment": "production",
//!   "backendBaseUrl": "https://api.example.com",
//!   "authBaseUrl": "https://api.example.com",
//!   "googleClientId": "1234.apps.googleusercontent.com",
//!   "tenantId": "gravity"
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

const DEVELOPMENT_BACKEND_URL: &str = "http://localhost:8080";
const DEFAULT_TENANT_ID: &str = "gravity";

/// Configuration errors. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("Malformed runtime config: {0}")]
    Malformed(String),

    #[error("Runtime config is for {found}, expected {expected}")]
    EnvironmentMismatch {
        expected: Environment,
        found: Environment,
    },

    #[error("Missing required setting `{key}` for {environment}")]
    MissingRequired {
        key: &'static str,
        environment: Environment,
    },

    #[error("Invalid URL for `{key}`: {value}")]
    InvalidUrl { key: &'static str, value: String },

    #[error("Failed to read runtime config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to fetch runtime config: {0}")]
    Fetch(String),
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Development => "development",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => Err(ConfigError::UnknownEnvironment(other.to_string())),
        }
    }
}

/// Override document as fetched. Unknown keys are rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RuntimeOverrides {
    environment: Option<Environment>,
    backend_base_url: Option<String>,
    auth_base_url: Option<String>,
    google_client_id: Option<String>,
    tenant_id: Option<String>,
}

/// Resolved, immutable runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub environment: Environment,
    pub backend_base_url: String,
    pub auth_base_url: String,
    pub google_client_id: String,
    pub tenant_id: String,
}

impl RuntimeConfig {
    /// Resolve the configuration for `environment` from its defaults and an
    /// optional JSON override document.
    pub fn resolve(environment: Environment, overrides_json: Option<&str>) -> Result<Self, ConfigError> {
        let overrides = match overrides_json {
            Some(raw) => parse_overrides(raw)?,
            None => RuntimeOverrides::default(),
        };

        if let Some(found) = overrides.environment {
            if found != environment {
                return Err(ConfigError::EnvironmentMismatch {
                    expected: environment,
                    found,
                });
            }
        }

        let default_url = match environment {
            Environment::Development => Some(DEVELOPMENT_BACKEND_URL),
            Environment::Production => None,
        };

        let backend_base_url = non_empty(overrides.backend_base_url)
            .or_else(|| default_url.map(str::to_string))
            .ok_or(ConfigError::MissingRequired {
                key: "backendBaseUrl",
                environment,
            })?;
        let backend_base_url = normalize_url("backendBaseUrl", &backend_base_url)?;

        let auth_base_url = match non_empty(overrides.auth_base_url) {
            Some(url) => normalize_url("authBaseUrl", &url)?,
            None => backend_base_url.clone(),
        };

        let google_client_id =
            non_empty(overrides.google_client_id).ok_or(ConfigError::MissingRequired {
                key: "googleClientId",
                environment,
            })?;

        let tenant_id =
            non_empty(overrides.tenant_id).unwrap_or_else(|| DEFAULT_TENANT_ID.to_string());

        Ok(Self {
            environment,
            backend_base_url,
            auth_base_url,
            google_client_id,
            tenant_id,
        })
    }

    /// Resolve from a JSON document on disk.
    pub fn load_from_path(environment: Environment, path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::resolve(environment, Some(&raw))
    }

    /// Fetch the override document over HTTP and resolve it.
    #[cfg(feature = "sync")]
    pub async fn load_from_url(environment: Environment, url: &str) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ConfigError::Fetch(e.to_string()))?;

        let resp = client
            .get(url)
            .header("Cache-Control", "no-store")
            .send()
            .await
            .map_err(|e| ConfigError::Fetch(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ConfigError::Fetch(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }

        let raw = resp
            .text()
            .await
            .map_err(|e| ConfigError::Fetch(e.to_string()))?;
        Self::resolve(environment, Some(&raw))
    }
}

fn parse_overrides(raw: &str) -> Result<RuntimeOverrides, ConfigError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ConfigError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ConfigError::Malformed(
            "expected a JSON object".to_string(),
        ));
    }
    serde_json::from_value(value).map_err(|e| ConfigError::Malformed(e.to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize_url(key: &'static str, value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim().trim_end_matches('/');
    let scheme_ok = trimmed.starts_with("http://") || trimmed.starts_with("https://");
    let host = trimmed
        .split_once("://")
        .map(|(_, rest)| rest.split(['/', '?', '#']).next().unwrap_or(""))
        .unwrap_or("");
    if !scheme_ok || host.is_empty() || trimmed.contains(char::is_whitespace) {
        return Err(ConfigError::InvalidUrl {
            key,
            value: value.to_string(),
        });
    }
    Ok(trimmed.to_string())
}
