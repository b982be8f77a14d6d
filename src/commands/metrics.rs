//! `metrics`: show the account's call metrics.

use crate::config::Settings;
use crate::engage::client::RateLimitedClient;
use crate::engage::metrics::{fetch_metrics, metrics_endpoint, Metrics};
use crate::error::AppError;

/// Fetches the current metrics.
pub async fn show_metrics(settings: &Settings) -> Result<Metrics, AppError> {
    let client = RateLimitedClient::new(metrics_endpoint(settings)?, settings.retry)?;
    fetch_metrics(&client).await
}

/// Metrics as pretty-printed JSON, in the service's field names.
pub fn render_metrics(metrics: &Metrics) -> Result<String, AppError> {
    serde_json::to_string_pretty(metrics)
        .map_err(|e| AppError::Internal(format!("Failed to render metrics: {}", e)))
}
