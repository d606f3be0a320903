//! HTTP client for the Gravity backend.

use crate::config::RuntimeConfig;
use crate::sync::models::{
    MeResponse, SnapshotResponse, SyncRequest, SyncResponse, TokenExchangeRequest,
    TokenExchangeResponse,
};
use crate::sync::realtime::{NoteEvents, RealtimeEvent, SseParser};
use crate::sync::remote::{NotesRemote, RemoteError};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Header naming the tenant on auth calls.
pub const TENANT_HEADER: &str = "X-TAuth-Tenant";

/// `reqwest`-backed [`NotesRemote`].
pub struct BackendClient {
    client: reqwest::Client,
    /// No overall deadline: the change stream stays open indefinitely.
    stream_client: reqwest::Client,
    backend_url: String,
    auth_url: String,
    tenant_id: String,
}

impl BackendClient {
    pub fn new(backend_url: &str, auth_url: &str, tenant_id: &str) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            stream_client,
            backend_url: backend_url.trim_end_matches('/').to_string(),
            auth_url: auth_url.trim_end_matches('/').to_string(),
            tenant_id: tenant_id.to_string(),
        })
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self, RemoteError> {
        Self::new(
            &config.backend_base_url,
            &config.auth_base_url,
            &config.tenant_id,
        )
    }

    fn backend(&self, path: &str) -> String {
        format!("{}{}", self.backend_url, path)
    }

    fn auth(&self, path: &str) -> String {
        format!("{}{}", self.auth_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let resp = request.send().await.map_err(map_send_error)?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Unauthorized);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RemoteError> {
        let resp = self.send(request).await?;
        let bytes = resp.bytes().await.map_err(map_send_error)?;
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::Malformed(e.to_string()))
    }
}

fn map_send_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Transport(error.to_string())
    }
}

#[async_trait]
impl NotesRemote for BackendClient {
    async fn exchange_credential(&self, id_token: &str) -> Result<TokenExchangeResponse, RemoteError> {
        debug!("Exchanging identity credential at {}", self.auth_url);
        let body = TokenExchangeRequest {
            id_token: id_token.to_string(),
        };
        self.send_json(
            self.client
                .post(self.auth("/auth/google"))
                .header(TENANT_HEADER, &self.tenant_id)
                .json(&body),
        )
        .await
    }

    async fn me(&self, access_token: &str) -> Result<MeResponse, RemoteError> {
        self.send_json(
            self.client
                .get(self.backend("/me"))
                .bearer_auth(access_token),
        )
        .await
    }

    async fn sync_notes(
        &self,
        access_token: &str,
        request: &SyncRequest,
    ) -> Result<SyncResponse, RemoteError> {
        self.send_json(
            self.client
                .post(self.backend("/notes/sync"))
                .bearer_auth(access_token)
                .json(request),
        )
        .await
    }

    async fn list_notes(&self, access_token: &str) -> Result<SnapshotResponse, RemoteError> {
        self.send_json(
            self.client
                .get(self.backend("/notes"))
                .bearer_auth(access_token),
        )
        .await
    }

    async fn logout(&self, access_token: &str) -> Result<(), RemoteError> {
        self.send(
            self.client
                .post(self.auth("/auth/logout"))
                .header(TENANT_HEADER, &self.tenant_id)
                .bearer_auth(access_token),
        )
        .await
        .map(|_| ())
    }

    async fn stream_notes(&self, access_token: &str) -> Result<Box<dyn NoteEvents>, RemoteError> {
        debug!("Opening change stream at {}", self.backend_url);
        let response = self
            .send(
                self.stream_client
                    .get(self.backend("/notes/stream"))
                    .header(ACCEPT, "text/event-stream")
                    .bearer_auth(access_token),
            )
            .await?;
        Ok(Box::new(EventStream::new(response)))
    }
}

/// `text/event-stream` response body decoded as it arrives.
struct EventStream {
    response: reqwest::Response,
    parser: SseParser,
    ready: VecDeque<RealtimeEvent>,
}

impl EventStream {
    fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            parser: SseParser::new(),
            ready: VecDeque::new(),
        }
    }
}

#[async_trait]
impl NoteEvents for EventStream {
    async fn next_event(&mut self) -> Result<Option<RealtimeEvent>, RemoteError> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(Some(event));
            }
            match self.response.chunk().await.map_err(map_send_error)? {
                Some(chunk) => self.ready.extend(self.parser.feed(&chunk)),
                None => return Ok(None),
            }
        }
    }
}
