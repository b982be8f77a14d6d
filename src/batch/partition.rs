//! Splitting an identifier list into ordered, bounded batches.

use crate::error::AppError;

/// A contiguous slice of the input identifiers, sent to the service in one
/// request. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    index: usize,
    identifiers: Vec<String>,
}

impl Batch {
    pub fn new(index: usize, identifiers: Vec<String>) -> Self {
        Self { index, identifiers }
    }

    /// Zero-based position of this batch in enqueue order.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }
}

/// Partitions `identifiers` into batches of at most `max_batch_size`,
/// preserving input order. Duplicates are kept.
///
/// # Errors
///
/// Returns `AppError::Config` if `max_batch_size` is 0.
pub fn partition(identifiers: Vec<String>, max_batch_size: usize) -> Result<Vec<Batch>, AppError> {
    if max_batch_size == 0 {
        return Err(AppError::Config(
            "max batch size must be positive".to_string(),
        ));
    }

    let mut batches = Vec::with_capacity(identifiers.len().div_ceil(max_batch_size));
    let mut current = Vec::with_capacity(max_batch_size.min(identifiers.len()));

    for id in identifiers {
        current.push(id);
        if current.len() == max_batch_size {
            let full = std::mem::replace(&mut current, Vec::with_capacity(max_batch_size));
            batches.push(Batch::new(batches.len(), full));
        }
    }
    if !current.is_empty() {
        batches.push(Batch::new(batches.len(), current));
    }

    Ok(batches)
}
