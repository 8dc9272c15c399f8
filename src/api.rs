//! Admin backend API client.
//!
//! Provides authenticated HTTP access to the two remote collections (Users
//! and Customers) behind one generic [`Collection`] interface. The engine
//! never talks to reqwest directly; everything goes through this boundary so
//! tests can substitute an in-memory collection.

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Transport and protocol failures from the admin backend.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("cannot reach admin backend at {0}")]
    Unreachable(String),
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("{detail} (HTTP {code})")]
    Status { code: u16, detail: String },
    #[error("invalid JSON from admin backend: {0}")]
    InvalidJson(String),
}

impl ApiError {
    fn from_reqwest(base: &str, err: &reqwest::Error) -> Self {
        if err.is_connect() {
            return Self::Unreachable(base.to_string());
        }
        if err.is_timeout() {
            return Self::Timeout(base.to_string());
        }
        Self::Network(err.to_string())
    }
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "not authorized for this collection".to_string(),
        404 => "admin backend endpoint not found".to_string(),
        s if s >= 500 => format!("admin backend server error (HTTP {s})"),
        s => format!("unexpected response from admin backend (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin backend URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Collection interface
// ---------------------------------------------------------------------------

/// Connection settings for the admin backend. The bearer credential is
/// injected by the host application; this crate never stores it elsewhere.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: String,
}

/// Generic accessor over one remote collection, used identically for the
/// Users and Customers collections.
#[allow(async_fn_in_trait)]
pub trait Collection: Send + Sync {
    /// Short collection label for logging ("users" / "customers").
    fn label(&self) -> &str;

    async fn list(&self) -> Result<Vec<Value>, ApiError>;
    async fn get_by_id(&self, id: i64) -> Result<Value, ApiError>;
    /// Server-side free-text search; matches email/name/document loosely.
    /// Callers must exact-filter the results.
    async fn search(&self, term: &str) -> Result<Vec<Value>, ApiError>;
    async fn create(&self, payload: &Value) -> Result<Value, ApiError>;
    async fn update(&self, id: i64, payload: &Value) -> Result<Value, ApiError>;
    async fn patch(&self, id: i64, payload: &Value) -> Result<Value, ApiError>;
    async fn delete(&self, id: i64) -> Result<(), ApiError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// A [`Collection`] backed by the admin backend's REST routes at
/// `{base}/api/{collection}`.
pub struct HttpCollection {
    client: Client,
    base_url: String,
    api_key: String,
    collection: String,
}

impl HttpCollection {
    pub fn new(config: &RemoteConfig, collection: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(&config.base_url),
            api_key: config.api_key.clone(),
            collection: collection.to_string(),
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let full_url = format!("{}/api/{}{}", self.base_url, self.collection, path);
        debug!(method = %method, url = %full_url, "admin backend request");

        let mut req = self
            .client
            .request(method, &full_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");

        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(&self.base_url, &e))?;
        let status = resp.status();

        if !status.is_success() {
            // Preserve validation details from the response body when present.
            let body_text = resp.text().await.unwrap_or_default();
            let detail = if let Ok(json) = serde_json::from_str::<Value>(&body_text) {
                json.get("error")
                    .or_else(|| json.get("message"))
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| status_error(status))
            } else if !body_text.trim().is_empty() {
                format!("{}: {}", status_error(status), body_text.trim())
            } else {
                status_error(status)
            };
            return Err(ApiError::Status {
                code: status.as_u16(),
                detail,
            });
        }

        // Empty 204 bodies come back as null.
        let body_text = resp.text().await.unwrap_or_default();
        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| ApiError::InvalidJson(e.to_string()))
    }
}

/// Accept both a bare JSON array and the `{ "data": [...] }` envelope some
/// routes wrap lists in.
fn unwrap_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(rows)) => rows,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

impl Collection for HttpCollection {
    fn label(&self) -> &str {
        &self.collection
    }

    async fn list(&self) -> Result<Vec<Value>, ApiError> {
        self.request(Method::GET, "", None).await.map(unwrap_rows)
    }

    async fn get_by_id(&self, id: i64) -> Result<Value, ApiError> {
        self.request(Method::GET, &format!("/{id}"), None).await
    }

    async fn search(&self, term: &str) -> Result<Vec<Value>, ApiError> {
        self.request(
            Method::GET,
            &format!("?search={}", percent_encode(term)),
            None,
        )
        .await
        .map(unwrap_rows)
    }

    async fn create(&self, payload: &Value) -> Result<Value, ApiError> {
        self.request(Method::POST, "", Some(payload)).await
    }

    async fn update(&self, id: i64, payload: &Value) -> Result<Value, ApiError> {
        self.request(Method::PUT, &format!("/{id}"), Some(payload))
            .await
    }

    async fn patch(&self, id: i64, payload: &Value) -> Result<Value, ApiError> {
        self.request(Method::PATCH, &format!("/{id}"), Some(payload))
            .await
    }

    async fn delete(&self, id: i64) -> Result<(), ApiError> {
        self.request(Method::DELETE, &format!("/{id}"), None)
            .await
            .map(|_| ())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
