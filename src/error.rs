use thiserror::Error;

/// Patterns (lowercase) that indicate a response body echoes credentials.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "authtoken",
    "bearer ",
    "access_token",
    "api_key",
    "authorization:",
];

/// Longest response body kept inside an error message.
const MAX_BODY_CHARS: usize = 2_000;

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitizes a message for display.
/// If sensitive content is detected, returns the fallback instead.
fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// Prepares a raw response body for inclusion in an error: redacts bodies
/// that echo credentials and truncates long ones on a char boundary.
pub(crate) fn sanitize_body(body: &str) -> String {
    let body = sanitize_message(body.trim(), "[response body redacted]");
    match body.char_indices().nth(MAX_BODY_CHARS) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body,
    }
}

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Configuration ─────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    // ── API ───────────────────────────────────────────────────────────────────
    #[error("HTTP status {status} from {url}: {body}")]
    Transport {
        status: u16,
        url: String,
        body: String,
    },

    /// Retry signal inside `RateLimitedClient::send`; absorbed there.
    #[error("Rate limited")]
    RateLimited,

    #[error("Still rate limited after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    // ── Network ───────────────────────────────────────────────────────────────
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // ── Runs ──────────────────────────────────────────────────────────────────
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Run incomplete: {failed} failed batch(es), {unresolved} unresolved batch(es)")]
    RunIncomplete { failed: usize, unresolved: usize },

    // ── File / CSV ────────────────────────────────────────────────────────────
    #[error("CSV error: {0}")]
    Csv(String),

    #[error("I/O error: {0}")]
    Io(String),

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Builds a `Transport` error with the body sanitized for display.
    pub fn transport(status: u16, url: impl Into<String>, body: &str) -> Self {
        AppError::Transport {
            status,
            url: url.into(),
            body: sanitize_body(body),
        }
    }

    /// Whether this error should stop a fail-fast batch run.
    ///
    /// Malformed responses only spoil the batch that produced them, and
    /// `RateLimited` never leaves the client.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AppError::MalformedResponse(_) | AppError::RateLimited | AppError::Cancelled
        )
    }

    /// HTTP status code carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::Transport { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<csv::Error> for AppError {
    fn from(e: csv::Error) -> Self {
        AppError::Csv(e.to_string())
    }
}
