//! Engage HTTP client with transparent rate-limit handling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RetryPolicy;
use crate::engage::endpoint::Endpoint;
use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// User agent string for all Engage API requests.
const CLIENT_USER_AGENT: &str = concat!("engage-bulk/", env!("CARGO_PKG_VERSION"));

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Header carrying the Integration API token.
const AUTH_HEADER: &str = "authToken";

/// Engage sometimes answers 200 with this warning instead of a 429.
pub const RATE_LIMIT_MARKER: &str = "Your per minute call rate";

/// 429 body that means the request itself is too large. Retrying cannot help.
pub const BATCH_SIZE_EXCEEDED_MARKER: &str = "Requested batch size exceeds the allowed size";

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level Engage response document.
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    payload: Option<Value>,
    #[serde(default)]
    errors: Option<Value>,
}

/// How a single HTTP exchange should be treated.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Complete,
    RateLimited,
    Failed,
}

fn classify(status: StatusCode, body: &str) -> Outcome {
    match status {
        StatusCode::OK if body.contains(RATE_LIMIT_MARKER) => Outcome::RateLimited,
        StatusCode::OK => Outcome::Complete,
        StatusCode::TOO_MANY_REQUESTS if body.contains(BATCH_SIZE_EXCEEDED_MARKER) => {
            Outcome::Failed
        }
        StatusCode::TOO_MANY_REQUESTS => Outcome::RateLimited,
        _ => Outcome::Failed,
    }
}

/// Turns one exchange into the payload or an error. A retryable rate limit
/// comes back as `AppError::RateLimited`.
fn interpret(status: StatusCode, body: &str, log_path: &str) -> Result<Value, AppError> {
    match classify(status, body) {
        Outcome::Complete => decode_payload(body, log_path),
        Outcome::RateLimited => Err(AppError::RateLimited),
        Outcome::Failed => Err(AppError::transport(status.as_u16(), log_path, body)),
    }
}

/// Decodes a 200 body and returns its `payload`.
fn decode_payload(body: &str, log_path: &str) -> Result<Value, AppError> {
    let envelope: WireEnvelope = serde_json::from_str(body).map_err(|e| {
        AppError::MalformedResponse(format!("{} returned invalid JSON: {}", log_path, e))
    })?;

    if let Some(errors) = envelope.errors.as_ref().filter(|e| has_content(e)) {
        warn!("[ENGAGE] {} returned errors: {}", log_path, errors);
    }

    envelope.payload.ok_or_else(|| {
        AppError::MalformedResponse(format!("{} returned no payload", log_path))
    })
}

fn has_content(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Flattens a request document into GET query pairs.
///
/// Scalars become single pairs, arrays repeat the key, nested objects are
/// sent as JSON text and nulls are skipped.
fn query_pairs(request: &Value) -> Result<Vec<(String, String)>, AppError> {
    let map = match request {
        Value::Null => return Ok(Vec::new()),
        Value::Object(map) => map,
        _ => {
            return Err(AppError::Config(
                "GET requests must be a JSON object or null".to_string(),
            ))
        }
    };

    let mut pairs = Vec::with_capacity(map.len());
    for (key, value) in map {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    pairs.push((key.clone(), scalar_text(item)));
                }
            }
            other => pairs.push((key.clone(), scalar_text(other))),
        }
    }
    Ok(pairs)
}

fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RateLimitedClient
// ─────────────────────────────────────────────────────────────────────────────

/// Client for one Engage endpoint.
///
/// Rate limiting (HTTP 429, or a 200 carrying the per-minute warning) is
/// absorbed here: the client sleeps for the policy's backoff and repeats the
/// identical request. Every other non-200 status is returned as
/// `AppError::Transport` without retrying.
///
/// # Thread Safety
///
/// Holds no mutable state. Clones share the connection pool and can be used
/// from any number of tasks at once.
#[derive(Clone)]
pub struct RateLimitedClient {
    http: reqwest::Client,
    endpoint: Arc<Endpoint>,
    retry: RetryPolicy,
    cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for RateLimitedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedClient")
            .field("endpoint", &self.endpoint)
            .field("retry", &self.retry)
            .finish()
    }
}

impl RateLimitedClient {
    /// Creates a client with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` if the HTTP client fails to initialize.
    pub fn new(endpoint: Endpoint, retry: RetryPolicy) -> Result<Self, AppError> {
        Ok(Self::with_http(build_http_client()?, endpoint, retry))
    }

    /// Creates a client on an existing connection pool.
    pub fn with_http(http: reqwest::Client, endpoint: Endpoint, retry: RetryPolicy) -> Self {
        Self {
            http,
            endpoint: Arc::new(endpoint),
            retry,
            cancel: None,
        }
    }

    /// Stops rate-limit retries when `token` is cancelled. A backoff in
    /// progress is cut short and `send` returns `AppError::Cancelled`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Sends `request` and returns the response's `payload`.
    ///
    /// # Errors
    ///
    /// - `AppError::Transport` - any non-200 status other than a retryable 429
    /// - `AppError::RateLimitExhausted` - the retry ceiling was reached
    /// - `AppError::MalformedResponse` - the body is not JSON or has no payload
    /// - `AppError::ConnectionFailed` - network error
    pub async fn send(&self, request: &Value) -> Result<Value, AppError> {
        let mut retries: u32 = 0;

        loop {
            let (status, body) = self.execute_once(request).await?;

            match interpret(status, &body, &self.log_path()) {
                Err(AppError::RateLimited) => {
                    if !self.retry.allows_retry(retries) {
                        return Err(AppError::RateLimitExhausted {
                            attempts: retries + 1,
                        });
                    }
                    retries += 1;
                    warn!(
                        "[ENGAGE] {} {} rate limited (retry {}), napping {}ms",
                        self.endpoint.method(),
                        self.log_path(),
                        retries,
                        self.retry.backoff.as_millis()
                    );
                    self.nap().await?;
                }
                other => return other,
            }
        }
    }

    /// Sleeps for the backoff, or until cancelled.
    async fn nap(&self) -> Result<(), AppError> {
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = tokio::time::sleep(self.retry.backoff) => Ok(()),
                _ = token.cancelled() => {
                    info!("[ENGAGE] {} backoff cancelled", self.log_path());
                    Err(AppError::Cancelled)
                }
            },
            None => {
                tokio::time::sleep(self.retry.backoff).await;
                Ok(())
            }
        }
    }

    /// Performs one HTTP exchange and returns the status and body text.
    async fn execute_once(&self, request: &Value) -> Result<(StatusCode, String), AppError> {
        let method = self.endpoint.method();
        let log_path = self.log_path();
        let start = Instant::now();

        let mut builder = self
            .http
            .request(method.into(), self.endpoint.url().clone())
            .header(AUTH_HEADER, self.endpoint.token().expose_secret())
            .header(CONTENT_TYPE, "application/json");

        if method.sends_body() {
            if !request.is_null() {
                builder = builder.json(request);
            }
        } else {
            builder = builder.query(&query_pairs(request)?);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                info!(
                    "[ENGAGE] {} {} FAILED {}ms",
                    method,
                    log_path,
                    start.elapsed().as_millis()
                );
                let reason = if e.is_timeout() {
                    "request timed out"
                } else {
                    "connection to Engage failed"
                };
                return Err(AppError::ConnectionFailed(format!("{}: {}", log_path, reason)));
            }
        };

        let status = response.status();
        let body = response.text().await.map_err(|_| {
            AppError::ConnectionFailed(format!("{}: failed to read response body", log_path))
        })?;

        info!(
            "[ENGAGE] {} {} {} {}ms",
            method,
            log_path,
            status.as_u16(),
            start.elapsed().as_millis()
        );

        Ok((status, body))
    }

    /// Path only; the token travels in a header and GET queries are added later.
    fn log_path(&self) -> String {
        self.endpoint.url().path().to_string()
    }
}

/// Builds the configured HTTP client.
pub fn build_http_client() -> Result<reqwest::Client, AppError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
