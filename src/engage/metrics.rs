//! Engage call metrics: quota usage and the service's batch size limit.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::Settings;
use crate::engage::client::RateLimitedClient;
use crate::engage::endpoint::{Endpoint, HttpMethod};
use crate::error::AppError;

/// Path of the metrics endpoint.
pub const METRICS_PATH: &str = "/api/integration/ext/v1/metrics";

/// Payload of the metrics endpoint.
///
/// Only `maxBatchSize` drives behaviour; the remaining fields are kept for
/// display and tolerated when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// Largest number of records one request may carry.
    pub max_batch_size: usize,
    /// Calls allowed per period.
    #[serde(default)]
    pub rate_limit: Option<u64>,
    /// Calls left in the current period.
    #[serde(default)]
    pub current_rate_limit: Option<u64>,
    #[serde(default, rename = "totalAPICalls")]
    pub total_api_calls: Option<u64>,
    #[serde(default, rename = "totalAPICallFailures")]
    pub total_api_call_failures: Option<u64>,
    /// Everything else the service reports.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Builds the metrics endpoint for `settings`.
pub fn metrics_endpoint(settings: &Settings) -> Result<Endpoint, AppError> {
    Endpoint::builder()
        .host(settings.host.clone())
        .path(METRICS_PATH)
        .method(HttpMethod::Get)
        .token(settings.token.clone())
        .build()
}

/// Reads the current metrics.
///
/// `client` must be bound to a GET endpoint on [`METRICS_PATH`].
///
/// # Errors
///
/// Client errors pass through; a payload without a positive `maxBatchSize`
/// is `AppError::MalformedResponse`.
pub async fn fetch_metrics(client: &RateLimitedClient) -> Result<Metrics, AppError> {
    let payload = client.send(&Value::Null).await?;
    let metrics = parse_metrics(payload)?;

    info!(
        "[ENGAGE] Metrics: maxBatchSize={} currentRateLimit={:?}",
        metrics.max_batch_size, metrics.current_rate_limit
    );
    Ok(metrics)
}

fn parse_metrics(payload: Value) -> Result<Metrics, AppError> {
    let metrics: Metrics = serde_json::from_value(payload)
        .map_err(|e| AppError::MalformedResponse(format!("unreadable metrics payload: {}", e)))?;

    if metrics.max_batch_size == 0 {
        return Err(AppError::MalformedResponse(
            "metrics report a maxBatchSize of 0".to_string(),
        ));
    }
    Ok(metrics)
}
