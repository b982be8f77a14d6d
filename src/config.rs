//! Run configuration shared by the library and the CLI.
//!
//! Holds the defaults the Engage tools have always used (30 second nap on
//! rate limiting, five workers) plus the knobs that make those defaults
//! adjustable.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Engage production API host.
pub const DEFAULT_HOST: &str = "api.salsalabs.org";

/// Fixed sleep after a rate-limit signal.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(30);

/// Number of concurrent batch workers.
pub const DEFAULT_WORKERS: usize = 5;

/// Records per page for paginated searches.
pub const DEFAULT_PAGE_SIZE: u64 = 20;

/// Environment variable holding the Integration API token.
pub const TOKEN_ENV: &str = "ENGAGE_TOKEN";

/// Environment variable overriding the API host.
pub const HOST_ENV: &str = "ENGAGE_HOST";

// ─────────────────────────────────────────────────────────────────────────────
// RetryPolicy
// ─────────────────────────────────────────────────────────────────────────────

/// How the client reacts to rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep between attempts. Fixed; no exponential growth, no jitter.
    pub backoff: Duration,
    /// Maximum number of retries after rate limiting. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given backoff and unbounded retries.
    pub fn with_backoff(backoff: Duration) -> Self {
        Self {
            backoff,
            max_retries: None,
        }
    }

    /// Caps the number of retries.
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    /// Whether another attempt is allowed after `retries` retries so far.
    pub fn allows_retry(&self, retries: u32) -> bool {
        self.max_retries.map_or(true, |max| retries < max)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FailurePolicy
// ─────────────────────────────────────────────────────────────────────────────

/// What a batch run does when one batch hits a fatal error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Cancel the run: no new batches, in-flight requests are abandoned.
    #[default]
    FailFast,
    /// Write `ERROR` rows for the failed batch and keep draining the queue.
    Continue,
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Resolved settings for one invocation of the tool.
#[derive(Clone)]
pub struct Settings {
    /// Engage host, with or without scheme.
    pub host: String,
    /// Integration API token.
    pub token: SecretString,
    /// Rate-limit handling.
    pub retry: RetryPolicy,
    /// Log every result row.
    pub verbose: bool,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("host", &self.host)
            .field("token", &"[REDACTED]")
            .field("retry", &self.retry)
            .field("verbose", &self.verbose)
            .finish()
    }
}

impl Settings {
    /// Validates and assembles settings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the token or host is blank.
    pub fn new(
        host: impl Into<String>,
        token: impl Into<String>,
        retry: RetryPolicy,
        verbose: bool,
    ) -> Result<Self, AppError> {
        let host = host.into();
        let token = token.into();

        if token.trim().is_empty() {
            return Err(AppError::Config(format!(
                "token is required (pass --token or set {})",
                TOKEN_ENV
            )));
        }
        if host.trim().is_empty() {
            return Err(AppError::Config("host must not be empty".to_string()));
        }

        Ok(Self {
            host,
            token: SecretString::from(token),
            retry,
            verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_defaults_to_thirty_seconds_unbounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff, Duration::from_secs(30));
        assert_eq!(policy.max_retries, None);
        assert!(policy.allows_retry(u32::MAX - 1));
    }

    #[test]
    fn retry_policy_ceiling() {
        let policy = RetryPolicy::with_backoff(Duration::from_millis(1)).max_retries(2);
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(1));
        assert!(!policy.allows_retry(2));
    }

    #[test]
    fn failure_policy_defaults_to_fail_fast() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::FailFast);
    }

    #[test]
    fn settings_reject_blank_token() {
        let result = Settings::new(DEFAULT_HOST, "  ", RetryPolicy::default(), false);
        assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains(TOKEN_ENV)));
    }

    #[test]
    fn settings_debug_redacts_token() {
        let settings =
            Settings::new(DEFAULT_HOST, "super_secret_token", RetryPolicy::default(), false)
                .unwrap();
        let debug_output = format!("{:?}", settings);

        assert!(debug_output.contains(DEFAULT_HOST));
        assert!(!debug_output.contains("super_secret_token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
