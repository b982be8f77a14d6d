//! Endpoint descriptors: one Engage API operation plus the token used to call it.

use std::fmt;
use std::str::FromStr;

use reqwest::Method;
use secrecy::SecretString;
use url::Url;

use crate::config::DEFAULT_HOST;
use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// HttpMethod
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP methods the Engage Integration API uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    /// GET sends the request as query parameters; everything else as a JSON body.
    pub fn sends_body(self) -> bool {
        !matches!(self, HttpMethod::Get)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl From<HttpMethod> for Method {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

impl FromStr for HttpMethod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            // Older scripts spell it "DEL".
            "DELETE" | "DEL" => Ok(HttpMethod::Delete),
            other => Err(AppError::Config(format!("unsupported HTTP method {:?}", other))),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable description of one API operation.
///
/// Built through [`EndpointBuilder`], which refuses to produce an endpoint
/// with a missing path, method or token.
#[derive(Clone)]
pub struct Endpoint {
    url: Url,
    method: HttpMethod,
    token: SecretString,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url.as_str())
            .field("method", &self.method)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl Endpoint {
    /// Starts a builder.
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::default()
    }

    /// Full endpoint URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub(crate) fn token(&self) -> &SecretString {
        &self.token
    }
}

/// Builder for [`Endpoint`]. Every field except `host` is required.
#[derive(Default)]
pub struct EndpointBuilder {
    host: Option<String>,
    path: Option<String>,
    method: Option<HttpMethod>,
    token: Option<SecretString>,
}

impl EndpointBuilder {
    /// API host. Defaults to `api.salsalabs.org`. A bare host is reached over
    /// https; a host with an explicit scheme is used as given.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// API path, e.g. `/api/integration/ext/v1/supporters/search`.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    /// Validates the fields and produces the endpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first missing or invalid field.
    pub fn build(self) -> Result<Endpoint, AppError> {
        use secrecy::ExposeSecret;

        let path = self
            .path
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| AppError::Config("endpoint path is required".to_string()))?;
        let method = self
            .method
            .ok_or_else(|| AppError::Config("endpoint method is required".to_string()))?;
        let token = self
            .token
            .filter(|t| !t.expose_secret().trim().is_empty())
            .ok_or_else(|| AppError::Config("endpoint token is required".to_string()))?;

        let host = self
            .host
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let url = base_url(&host)?
            .join(&path)
            .map_err(|e| AppError::Config(format!("invalid endpoint path {:?}: {}", path, e)))?;

        Ok(Endpoint { url, method, token })
    }
}

/// Resolves a host setting into a base URL.
fn base_url(host: &str) -> Result<Url, AppError> {
    let host = host.trim();
    let raw = if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    };
    Url::parse(&raw).map_err(|e| AppError::Config(format!("invalid host {:?}: {}", host, e)))
}
