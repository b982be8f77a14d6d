//! The operation a batch run applies to each batch, and the rows it produces.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tracing::warn;

use crate::batch::partition::Batch;
use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// ResultStatus / ResultRow
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResultStatus {
    Found,
    NotFound,
    Deleted,
    /// The run could not resolve this identifier.
    Error,
    /// A status string the service returned that has no variant of its own.
    Other(String),
}

impl ResultStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ResultStatus::Found => "FOUND",
            ResultStatus::NotFound => "NOT_FOUND",
            ResultStatus::Deleted => "DELETED",
            ResultStatus::Error => "ERROR",
            ResultStatus::Other(s) => s,
        }
    }
}

impl From<&str> for ResultStatus {
    fn from(s: &str) -> Self {
        match s {
            "FOUND" => ResultStatus::Found,
            "NOT_FOUND" => ResultStatus::NotFound,
            "DELETED" => ResultStatus::Deleted,
            "ERROR" => ResultStatus::Error,
            other => ResultStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One output row: an identifier and what happened to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRow {
    pub identifier: String,
    pub status: ResultStatus,
    /// Explanation for `Error` rows. Logged, not written to CSV.
    pub detail: Option<String>,
}

impl ResultRow {
    pub fn new(identifier: impl Into<String>, status: ResultStatus) -> Self {
        Self {
            identifier: identifier.into(),
            status,
            detail: None,
        }
    }

    pub fn error(identifier: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            status: ResultStatus::Error,
            detail: Some(detail.into()),
        }
    }
}

/// Rows pulled out of one batch response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub rows: Vec<ResultRow>,
    /// Records that could not be tied to any identifier in the batch.
    pub unattributed: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// BatchOperation
// ─────────────────────────────────────────────────────────────────────────────

/// An operation the batch processor can apply to a batch, e.g. a supporter
/// search or delete bound to a [`RateLimitedClient`](crate::engage::RateLimitedClient).
pub trait BatchOperation: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Sends the batch and returns the response payload.
    fn execute<'a>(
        &'a self,
        batch: &'a Batch,
    ) -> Pin<Box<dyn Future<Output = Result<Value, AppError>> + Send + 'a>>;

    /// Turns a response payload into one row per identifier in `batch`.
    ///
    /// # Errors
    ///
    /// `AppError::MalformedResponse` when the payload lacks the expected
    /// record list. Problems with individual records become `Error` rows.
    fn extract(&self, batch: &Batch, payload: &Value) -> Result<Extraction, AppError>;
}

/// Field names for the common Engage per-identifier record shape:
/// `payload[records_key][i][id_key]` and `payload[records_key][i][status_key]`.
#[derive(Debug, Clone, Copy)]
pub struct RecordShape {
    pub records_key: &'static str,
    pub id_key: &'static str,
    pub status_key: &'static str,
}

/// Extracts rows from a payload of the given shape, then reconciles them
/// against the batch so every identifier appears exactly as often as it was
/// sent.
///
/// Rows keep the service's order. Identifiers the service did not mention are
/// appended as `Error` rows; a repeated identifier that the service answered
/// once reuses that answer.
pub fn extract_records(
    batch: &Batch,
    payload: &Value,
    shape: RecordShape,
) -> Result<Extraction, AppError> {
    let records = payload
        .get(shape.records_key)
        .and_then(Value::as_array)
        .ok_or_else(|| {
            AppError::MalformedResponse(format!(
                "payload for batch {} has no {} list",
                batch.index(),
                shape.records_key
            ))
        })?;

    let mut pending: HashMap<&str, usize> = HashMap::new();
    for id in batch.identifiers() {
        *pending.entry(id.as_str()).or_insert(0) += 1;
    }

    let mut extraction = Extraction::default();
    let mut answered: HashMap<String, ResultStatus> = HashMap::new();

    for record in records {
        let Some(id) = record.get(shape.id_key).and_then(Value::as_str) else {
            warn!(
                "[BATCH] Batch {}: record without {} skipped",
                batch.index(),
                shape.id_key
            );
            extraction.unattributed += 1;
            continue;
        };

        match pending.get_mut(id) {
            Some(remaining) if *remaining > 0 => *remaining -= 1,
            _ => {
                warn!(
                    "[BATCH] Batch {}: unexpected identifier in response skipped",
                    batch.index()
                );
                extraction.unattributed += 1;
                continue;
            }
        }

        let row = match record.get(shape.status_key).and_then(Value::as_str) {
            Some(status) => ResultRow::new(id, ResultStatus::from(status)),
            None => ResultRow::error(id, format!("record has no {}", shape.status_key)),
        };
        answered.insert(row.identifier.clone(), row.status.clone());
        extraction.rows.push(row);
    }

    // Walk the batch in order so leftover rows come out in input order.
    for id in batch.identifiers() {
        let Some(remaining) = pending.get_mut(id.as_str()) else {
            continue;
        };
        if *remaining == 0 {
            continue;
        }
        *remaining -= 1;

        let row = match answered.get(id) {
            Some(status) => ResultRow::new(id.clone(), status.clone()),
            None => ResultRow::error(id.clone(), "missing from response"),
        };
        extraction.rows.push(row);
    }

    Ok(extraction)
}

/// Marks every identifier in `batch` as an error with the same detail.
pub fn error_rows(batch: &Batch, detail: &str) -> Vec<ResultRow> {
    batch
        .identifiers()
        .iter()
        .map(|id| ResultRow::error(id.clone(), detail))
        .collect()
}
