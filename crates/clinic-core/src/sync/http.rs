//! HTTP client for the central replication server and queue endpoints.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::protocol::{PullBatch, PushRequest, PushResponse};
use super::transport::{RemoteTransport, TransportError, TransportResult};
use crate::config::{normalize_server_url, setting, SyncConfig};
use crate::error::{Error, Result};
use crate::models::{format_date, Document, NewQueueEntry, QueueEntry, QueueEntryUpdate, QueueStatus};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Characters of an unstructured error body kept in messages
const MAX_ERROR_EXCERPT: usize = 180;

/// Shared, replaceable bearer token.
///
/// Cloned handles see the same token, so a renewed session takes effect
/// for the transport without rebuilding it.
#[derive(Clone, Default)]
pub struct Credentials {
    token: Arc<RwLock<Option<String>>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.get().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Credentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(setting(token))),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) =
            setting(Some(token.into()));
    }

    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn get(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// [`RemoteTransport`] over HTTP/JSON
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    credentials: Credentials,
}

impl HttpTransport {
    /// Build a client for an explicit server base URL
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Result<Self> {
        let base_url = normalize_server_url(&base_url.into()).ok_or_else(|| {
            Error::InvalidInput("server URL must include http:// or https://".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| Error::InvalidInput(format!("Failed to construct HTTP client: {error}")))?;

        Ok(Self {
            base_url,
            client,
            credentials,
        })
    }

    /// Build a client from the sync configuration's server URL and token
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let url = config
            .server_url
            .clone()
            .ok_or_else(|| Error::InvalidInput("no sync server configured".to_string()))?;
        Self::new(url, Credentials::new(config.auth_token.clone()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Queue entries in server priority order
    pub async fn list_queue(
        &self,
        status: Option<QueueStatus>,
        queue_date: Option<NaiveDate>,
    ) -> TransportResult<Vec<QueueEntry>> {
        let mut params = Vec::new();
        if let Some(status) = status {
            params.push(format!("status={}", status.as_str()));
        }
        if let Some(date) = queue_date {
            params.push(format!("queue_date={}", format_date(date)));
        }
        let mut url = format!("{}/queue", self.base_url);
        if !params.is_empty() {
            url = format!("{url}?{}", params.join("&"));
        }
        self.send_json(self.client.get(url), "queue list").await
    }

    /// Create an entry directly on the server, which assigns the token
    pub async fn create_queue_entry(&self, entry: &NewQueueEntry) -> TransportResult<QueueEntry> {
        let url = format!("{}/queue", self.base_url);
        self.send_json(self.client.post(url).json(entry), "queue create")
            .await
    }

    pub async fn update_queue_entry(
        &self,
        id: &str,
        update: &QueueEntryUpdate,
    ) -> TransportResult<QueueEntry> {
        let url = format!("{}/queue/{}", self.base_url, urlencoding::encode(id));
        self.send_json(self.client.put(url).json(update), "queue update")
            .await
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Accept", "application/json");
        match self.credentials.get() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> TransportResult<Response> {
        self.authorized(request)
            .send()
            .await
            .map_err(|error| TransportError::Network(format!("{what} request failed: {error}")))
    }

    async fn send_json<R: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> TransportResult<R> {
        let response = check_status(self.send(request, what).await?).await?;
        response
            .json::<R>()
            .await
            .map_err(|error| TransportError::Decode(format!("Failed to parse {what} response: {error}")))
    }

    fn changes_url(&self, collection: &str, since: Option<&str>, limit: usize) -> String {
        let mut url = format!(
            "{}/v1/replication/changes?collection={}&limit={limit}",
            self.base_url,
            urlencoding::encode(collection)
        );
        if let Some(since) = since {
            url.push_str("&since=");
            url.push_str(&urlencoding::encode(since));
        }
        url
    }
}

impl RemoteTransport for HttpTransport {
    async fn push(&self, request: PushRequest) -> TransportResult<PushResponse> {
        let url = format!("{}/v1/replication/push", self.base_url);
        self.send_json(self.client.post(url).json(&request), "push")
            .await
    }

    async fn pull(
        &self,
        collection: &str,
        since: Option<&str>,
        limit: usize,
    ) -> TransportResult<PullBatch> {
        let url = self.changes_url(collection, since, limit);
        self.send_json(self.client.get(url), "pull").await
    }

    async fn fetch(&self, collection: &str, id: &str) -> TransportResult<Option<Document>> {
        let url = format!(
            "{}/v1/replication/documents/{}/{}",
            self.base_url,
            urlencoding::encode(collection),
            urlencoding::encode(id)
        );
        let response = self.send(self.client.get(url), "fetch").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        response
            .json::<Document>()
            .await
            .map(Some)
            .map_err(|error| TransportError::Decode(format!("Failed to parse fetch response: {error}")))
    }

    async fn ping(&self) -> TransportResult<()> {
        let url = format!("{}/healthz", self.base_url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| TransportError::Network(format!("health check failed: {error}")))?;
        check_status(response).await.map(|_| ())
    }
}

async fn check_status(response: Response) -> TransportResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_for_status(status, &body))
}

fn error_for_status(status: StatusCode, body: &str) -> TransportError {
    if status == StatusCode::UNAUTHORIZED {
        return TransportError::AuthExpired;
    }
    let message = parse_api_error(status, body);
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        TransportError::Server {
            status: status.as_u16(),
            message,
        }
    } else {
        TransportError::Rejected(message)
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim().chars().take(MAX_ERROR_EXCERPT).collect::<String>();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{trimmed} ({})", status.as_u16())
    }
}
