//! Batch processing: partitioning, the shared work queue, and the worker pool.

pub mod operation;
pub mod partition;
pub mod processor;
pub mod queue;

pub use operation::{
    error_rows, extract_records, BatchOperation, Extraction, RecordShape, ResultRow, ResultStatus,
};
pub use partition::{partition, Batch};
pub use processor::{BatchFailure, BatchProcessor, RunReport};
pub use queue::WorkQueue;
