//! `check` and `delete`: run a supporter operation over an ID file.
//!
//! Reads the identifiers, asks the service for its batch size limit, then
//! drives the batch processor with a CSV sink.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::batch::operation::BatchOperation;
use crate::batch::processor::{BatchProcessor, RunReport};
use crate::config::{FailurePolicy, Settings, DEFAULT_WORKERS};
use crate::engage::client::{build_http_client, RateLimitedClient};
use crate::engage::metrics::{fetch_metrics, metrics_endpoint};
use crate::engage::supporters::{SupporterDelete, SupporterSearch};
use crate::error::AppError;
use crate::streaming::{read_identifiers, CsvResultSink};

// ─────────────────────────────────────────────────────────────────────────────
// Request Types
// ─────────────────────────────────────────────────────────────────────────────

/// Which supporter operation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupporterAction {
    Check,
    Delete,
}

/// Options for one supporter run.
#[derive(Debug, Clone)]
pub struct SupporterRunRequest {
    pub action: SupporterAction,
    /// CSV whose first column holds supporter ids.
    pub id_file: PathBuf,
    /// Where `SupporterID,Result` rows go. Truncated first.
    pub csv_file: PathBuf,
    pub workers: usize,
    /// Optional cap below the service's `maxBatchSize`.
    pub batch_size: Option<usize>,
    pub failure_policy: FailurePolicy,
}

impl SupporterRunRequest {
    pub fn new(action: SupporterAction, id_file: PathBuf, csv_file: PathBuf) -> Self {
        Self {
            action,
            id_file,
            csv_file,
            workers: DEFAULT_WORKERS,
            batch_size: None,
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Batch size for a run: the service's limit, lowered by `cap` if given.
///
/// # Errors
///
/// `AppError::Config` if `cap` is 0.
pub fn effective_batch_size(service_max: usize, cap: Option<usize>) -> Result<usize, AppError> {
    match cap {
        Some(0) => Err(AppError::Config("batch size must be positive".to_string())),
        Some(cap) => Ok(cap.min(service_max)),
        None => Ok(service_max),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command
// ─────────────────────────────────────────────────────────────────────────────

/// Runs a supporter check or delete.
///
/// Returns the report even when some batches failed; the caller decides how
/// to surface that.
///
/// # Errors
///
/// Configuration, ID file and metrics errors abort before any batch is sent.
pub async fn run_supporters(
    settings: &Settings,
    request: SupporterRunRequest,
    cancel: CancellationToken,
) -> Result<RunReport, AppError> {
    let list = read_identifiers(&request.id_file)?;
    let processor = BatchProcessor::new(request.workers)?
        .with_failure_policy(request.failure_policy)
        .with_cancellation(cancel.clone())
        .verbose(settings.verbose);

    let http = build_http_client()?;
    let client = |endpoint| {
        RateLimitedClient::with_http(http.clone(), endpoint, settings.retry)
            .with_cancellation(cancel.clone())
    };
    let metrics_client = client(metrics_endpoint(settings)?);
    let metrics = fetch_metrics(&metrics_client).await?;
    let batch_size = effective_batch_size(metrics.max_batch_size, request.batch_size)?;

    let operation: Arc<dyn BatchOperation> = match request.action {
        SupporterAction::Check => {
            Arc::new(SupporterSearch::new(client(SupporterSearch::endpoint(settings)?)))
        }
        SupporterAction::Delete => {
            Arc::new(SupporterDelete::new(client(SupporterDelete::endpoint(settings)?)))
        }
    };

    let sink = Arc::new(CsvResultSink::create(&request.csv_file)?);
    let report = processor
        .run(list.identifiers, batch_size, operation, sink)
        .await?;

    info!(
        "[BATCH] Results written to {} ({} rows)",
        request.csv_file.display(),
        report.rows_written
    );
    Ok(report)
}
