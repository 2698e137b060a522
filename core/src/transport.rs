use crate::config::ClientSettings;
use crate::credentials::{Credential, CredentialStore, RefreshOutcome, TokenRefresher};
use crate::error::{ClientError, ClientResult};
use crate::models::TokenPair;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A request description that can be dispatched more than once.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Bytes>,
    streaming: bool,
    anonymous: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            streaming: false,
            anonymous: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> ClientResult<Self> {
        self.body = Some(Bytes::from(serde_json::to_vec(body)?));
        Ok(self)
    }

    /// The response body is a long-lived stream; the per-request timeout is
    /// not applied to it.
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Send without the stored bearer token and never refresh on a 401.
    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Sends requests with the stored bearer token and performs a single
/// refresh-and-retry when the service answers 401.
#[derive(Clone)]
pub struct TokenGuardedTransport {
    client: Client,
    base_url: String,
    timeout: Duration,
    credentials: CredentialStore,
    refresher: Arc<dyn TokenRefresher>,
}

impl TokenGuardedTransport {
    pub fn new(settings: &ClientSettings, credentials: CredentialStore) -> ClientResult<Self> {
        let client = Client::builder()
            .connect_timeout(settings.timeout())
            .build()?;
        let base_url = normalize_base(settings.base_url.as_str());
        let refresher = Arc::new(HttpTokenRefresher::new(client.clone(), &base_url));
        Ok(Self::with_refresher(
            client,
            base_url,
            settings.timeout(),
            credentials,
            refresher,
        ))
    }

    pub fn with_refresher(
        client: Client,
        base_url: impl AsRef<str>,
        timeout: Duration,
        credentials: CredentialStore,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            client,
            base_url: normalize_base(base_url.as_ref()),
            timeout,
            credentials,
            refresher,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Dispatch `request`. Statuses other than an initial 401 come back
    /// untouched; use [`ensure_success`] to turn them into errors.
    pub async fn send(&self, request: &ApiRequest) -> ClientResult<Response> {
        if request.anonymous {
            return self.dispatch(request, None).await;
        }
        let token = self.credentials.access_token();
        let response = self.dispatch(request, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(path = %request.path, "request unauthorized, refreshing credentials");
        let outcome = self
            .credentials
            .refresh_after(token.as_deref(), self.refresher.as_ref())
            .await?;
        match outcome {
            RefreshOutcome::Unavailable => Ok(response),
            RefreshOutcome::Refreshed(token) | RefreshOutcome::Reused(token) => {
                debug!(path = %request.path, "retrying request with refreshed credentials");
                self.dispatch(request, Some(token.as_str())).await
            }
        }
    }

    async fn dispatch(&self, request: &ApiRequest, token: Option<&str>) -> ClientResult<Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path));
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());
        }
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if !request.streaming {
            builder = builder.timeout(self.timeout);
        }
        Ok(builder.send().await?)
    }
}

/// Calls the dedicated, unauthenticated refresh endpoint.
pub struct HttpTokenRefresher {
    client: Client,
    url: String,
}

impl HttpTokenRefresher {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/auth/refresh", normalize_base(base_url)),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> ClientResult<Credential> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let pair: TokenPair = response.json().await?;
        Ok(Credential::new(pair.access_token, pair.refresh_token))
    }
}

/// Map a non-success response to [`ClientError::Server`], preferring the
/// service's JSON `detail` message.
pub async fn ensure_success(response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = error_detail(status, &body);
    warn!(status = %status, %message, "request failed");
    Err(ClientError::Server { status, message })
}

fn error_detail(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| match value.get("detail")? {
            serde_json::Value::String(detail) => Some(detail.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        });
    if let Some(detail) = from_json {
        return detail;
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return trimmed.chars().take(200).collect();
    }
    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}

fn normalize_base(base: &str) -> String {
    base.trim_end_matches('/').to_string()
}
