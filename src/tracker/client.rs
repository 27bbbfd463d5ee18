//! Remote API client
//!
//! Every request borrows a key from the [`KeyPool`] and carries it as a bearer
//! token. Responses with an `ETag` are remembered per path; a later `304 Not
//! Modified` is answered from memory and flagged as a cache hit.

use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use super::keys::{KeyPool, KeyPoolError};

/// Errors raised by the API client
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport or protocol failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// No key could be obtained
    #[error("API key unavailable: {0}")]
    Key(KeyPoolError),

    /// Base URL and path do not form a valid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The caller's cancellation token fired
    #[error("Request cancelled")]
    Cancelled,
}

impl From<KeyPoolError> for ClientError {
    fn from(err: KeyPoolError) -> Self {
        match err {
            KeyPoolError::Cancelled => Self::Cancelled,
            other => Self::Key(other),
        }
    }
}

impl ClientError {
    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Key(e) => e.is_recoverable(),
            Self::InvalidUrl(_) | Self::Cancelled => false,
        }
    }
}

/// A fully read response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    /// HTTP status; a revalidated cache entry reports 200
    pub status: u16,

    /// Response body
    pub body: String,

    /// The body came from the local ETag cache
    pub cache_hit: bool,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status == StatusCode::OK.as_u16()
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

#[derive(Debug, Clone)]
struct CachedResponse {
    etag: String,
    body: String,
}

/// HTTP client for the remote API
pub struct ApiClient {
    http: Client,
    base_url: String,
    keys: Arc<KeyPool>,
    etags: Mutex<HashMap<String, CachedResponse>>,
}

impl ApiClient {
    /// Create a client for `base_url`
    pub fn new(base_url: &str, timeout: Duration, keys: Arc<KeyPool>) -> Result<Self, ClientError> {
        Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;

        let http = Client::builder()
            .timeout(timeout)
            .gzip(true)
            .user_agent(concat!("coc-tracker/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            keys,
            etags: Mutex::new(HashMap::new()),
        })
    }

    /// Key pool backing this client
    pub fn keys(&self) -> &Arc<KeyPool> {
        &self.keys
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        let full = if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        };
        Url::parse(&full).map_err(|e| ClientError::InvalidUrl(format!("{full}: {e}")))
    }

    /// GET `path` relative to the base URL
    ///
    /// Waits for a key if every key is throttled. Cancellation aborts the
    /// wait and the request.
    pub async fn get(&self, cancel: &CancellationToken, path: &str) -> Result<ApiResponse, ClientError> {
        let url = self.endpoint(path)?;
        let key = self.keys.select(cancel).await?;
        let cached = self.etags.lock().await.get(path).cloned();

        let mut request = self.http.get(url).bearer_auth(key.as_str());
        if let Some(entry) = &cached {
            request = request.header(IF_NONE_MATCH, entry.etag.as_str());
        }

        trace!(path, key = %key, "Sending request");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            if let Some(entry) = cached {
                debug!(path, "Served from cache");
                return Ok(ApiResponse {
                    status: StatusCode::OK.as_u16(),
                    body: entry.body,
                    cache_hit: true,
                });
            }
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            body = response.text() => body?,
        };

        if status == StatusCode::OK {
            if let Some(etag) = etag {
                self.etags.lock().await.insert(
                    path.to_string(),
                    CachedResponse {
                        etag,
                        body: body.clone(),
                    },
                );
            }
        }

        debug!(path, status = status.as_u16(), "Request finished");

        Ok(ApiResponse {
            status: status.as_u16(),
            body,
            cache_hit: false,
        })
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("keys", &self.keys.len())
            .finish()
    }
}
