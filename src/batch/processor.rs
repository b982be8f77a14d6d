//! Concurrent batch runs.
//!
//! A run partitions the identifiers, queues every batch up front, then starts
//! a fixed pool of workers on a `JoinSet`. Each worker pops a batch, calls the
//! operation, turns the payload into rows and writes them to the sink, until
//! the queue is empty or the run is cancelled. The run returns once every
//! worker has exited.
//!
//! # Ordering
//!
//! Rows reach the sink in batch *completion* order, which depends on response
//! latency and rate-limit naps. Only rows from the same batch keep their
//! relative order.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::operation::{error_rows, BatchOperation, ResultRow, ResultStatus};
use crate::batch::partition::{partition, Batch};
use crate::batch::queue::WorkQueue;
use crate::config::FailurePolicy;
use crate::error::AppError;
use crate::streaming::ResultSink;

/// Workers log progress every this many batches.
const PROGRESS_EVERY: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// RunReport
// ─────────────────────────────────────────────────────────────────────────────

/// A batch that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub size: usize,
    pub error: String,
    /// Whether the error counts as fatal under the failure policy.
    pub fatal: bool,
}

/// Outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Short id used in this run's log lines.
    pub run_id: String,
    pub total_batches: usize,
    pub completed_batches: usize,
    pub rows_written: u64,
    pub failed: Vec<BatchFailure>,
    /// Indexes of batches that were never dispatched, or were dispatched into
    /// a worker that was cancelled or panicked.
    pub unresolved: Vec<usize>,
    /// Response records that could not be tied to a requested identifier.
    pub unattributed_records: usize,
    /// The caller's cancellation token fired during the run.
    pub cancelled: bool,
    pub worker_panics: usize,
}

impl RunReport {
    /// True when every batch completed.
    pub fn is_success(&self) -> bool {
        self.completed_batches == self.total_batches
            && self.failed.is_empty()
            && self.unresolved.is_empty()
    }

    /// Converts an unsuccessful report into an error.
    ///
    /// # Errors
    ///
    /// `AppError::Cancelled` if the caller cancelled and nothing failed,
    /// `AppError::RunIncomplete` otherwise.
    pub fn ensure_success(&self) -> Result<(), AppError> {
        if self.is_success() {
            return Ok(());
        }
        if self.cancelled && self.failed.is_empty() {
            return Err(AppError::Cancelled);
        }
        Err(AppError::RunIncomplete {
            failed: self.failed.len(),
            unresolved: self.unresolved.len(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

/// What one worker did.
#[derive(Debug, Default)]
struct WorkerOutcome {
    completed: usize,
    rows_written: u64,
    failed: Vec<BatchFailure>,
    unresolved: Vec<usize>,
    unattributed: usize,
}

/// Everything a worker shares with its siblings.
struct WorkerContext<O: ?Sized, S: ?Sized> {
    run_id: String,
    queue: Arc<WorkQueue>,
    operation: Arc<O>,
    sink: Arc<S>,
    cancel: CancellationToken,
    policy: FailurePolicy,
    verbose: bool,
}

impl<O: ?Sized, S: ?Sized> Clone for WorkerContext<O, S> {
    fn clone(&self) -> Self {
        Self {
            run_id: self.run_id.clone(),
            queue: self.queue.clone(),
            operation: self.operation.clone(),
            sink: self.sink.clone(),
            cancel: self.cancel.clone(),
            policy: self.policy,
            verbose: self.verbose,
        }
    }
}

impl<O, S> WorkerContext<O, S>
where
    O: BatchOperation + ?Sized + 'static,
    S: ResultSink + ?Sized + 'static,
{
    async fn work(self, worker_id: usize) -> WorkerOutcome {
        let mut outcome = WorkerOutcome::default();
        let mut popped = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(batch) = self.queue.pop() else {
                break;
            };

            popped += 1;
            if popped % PROGRESS_EVERY == 0 {
                info!(
                    "[BATCH] Run {} worker {}: popped batch {}",
                    self.run_id, worker_id, popped
                );
            }

            // A request stuck in rate-limit backoff must not outlive the run.
            let result = tokio::select! {
                result = self.operation.execute(&batch) => result,
                _ = self.cancel.cancelled() => Err(AppError::Cancelled),
            };

            let rows = result.and_then(|payload| {
                let extraction = self.operation.extract(&batch, &payload)?;
                outcome.unattributed += extraction.unattributed;
                Ok(extraction.rows)
            });

            match rows {
                Ok(rows) => {
                    if let Err(e) = self.write(&batch, rows, &mut outcome).await {
                        self.record_sink_failure(&batch, e, &mut outcome);
                        break;
                    }
                    outcome.completed += 1;
                }
                Err(AppError::Cancelled) => {
                    info!(
                        "[BATCH] Run {} worker {}: batch {} abandoned on cancellation",
                        self.run_id,
                        worker_id,
                        batch.index()
                    );
                    outcome.unresolved.push(batch.index());
                    break;
                }
                Err(e) if e.is_fatal() && self.policy == FailurePolicy::FailFast => {
                    warn!(
                        "[BATCH] Run {} worker {}: batch {} failed, stopping run: {}",
                        self.run_id,
                        worker_id,
                        batch.index(),
                        e
                    );
                    outcome.failed.push(failure(&batch, e.to_string(), true));
                    self.cancel.cancel();
                    break;
                }
                Err(e) => {
                    // The batch is lost but its identifiers still get rows.
                    warn!(
                        "[BATCH] Run {} worker {}: batch {} failed: {}",
                        self.run_id,
                        worker_id,
                        batch.index(),
                        e
                    );
                    let fatal = e.is_fatal();
                    let detail = e.to_string();
                    let rows = error_rows(&batch, &detail);
                    if let Err(e) = self.write(&batch, rows, &mut outcome).await {
                        self.record_sink_failure(&batch, e, &mut outcome);
                        break;
                    }
                    outcome.failed.push(failure(&batch, detail, fatal));
                }
            }
        }

        info!(
            "[BATCH] Run {} worker {}: done after {} batches",
            self.run_id, worker_id, popped
        );
        outcome
    }

    /// Logs `rows`, then hands them to the sink on the blocking pool.
    async fn write(
        &self,
        batch: &Batch,
        rows: Vec<ResultRow>,
        outcome: &mut WorkerOutcome,
    ) -> Result<(), AppError> {
        for row in &rows {
            if row.status == ResultStatus::Error {
                warn!(
                    "[BATCH] Batch {}: {} ERROR {}",
                    batch.index(),
                    row.identifier,
                    row.detail.as_deref().unwrap_or("")
                );
            } else if self.verbose {
                info!("[BATCH] {} {}", row.identifier, row.status);
            }
        }

        let count = rows.len() as u64;
        let sink = self.sink.clone();
        tokio::task::spawn_blocking(move || sink.write_rows(&rows))
            .await
            .map_err(|e| AppError::Internal(format!("Result writer task failed: {}", e)))??;
        outcome.rows_written += count;
        Ok(())
    }

    /// A sink that cannot be written stops the whole run whatever the policy.
    fn record_sink_failure(&self, batch: &Batch, e: AppError, outcome: &mut WorkerOutcome) {
        warn!(
            "[BATCH] Run {}: cannot write results for batch {}: {}",
            self.run_id,
            batch.index(),
            e
        );
        outcome.failed.push(failure(batch, e.to_string(), true));
        self.cancel.cancel();
    }
}

fn failure(batch: &Batch, error: String, fatal: bool) -> BatchFailure {
    BatchFailure {
        batch_index: batch.index(),
        size: batch.len(),
        error,
        fatal,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BatchProcessor
// ─────────────────────────────────────────────────────────────────────────────

/// Drives a bulk operation over a large identifier list with bounded
/// concurrency.
///
/// ```ignore
/// let processor = BatchProcessor::new(5)?;
/// let report = processor
///     .run(ids, metrics.max_batch_size, Arc::new(search), sink.clone())
///     .await?;
/// report.ensure_success()?;
/// ```
#[derive(Debug, Clone)]
pub struct BatchProcessor {
    workers: usize,
    policy: FailurePolicy,
    cancel: CancellationToken,
    verbose: bool,
}

impl BatchProcessor {
    /// Creates a processor with `workers` concurrent workers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `workers` is 0.
    pub fn new(workers: usize) -> Result<Self, AppError> {
        if workers == 0 {
            return Err(AppError::Config(
                "worker count must be positive".to_string(),
            ));
        }
        Ok(Self {
            workers,
            policy: FailurePolicy::default(),
            cancel: CancellationToken::new(),
            verbose: false,
        })
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Uses `token` for cancellation instead of a private one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Logs every result row at info level.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Token that cancels every run of this processor.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs `operation` over `identifiers` in batches of at most
    /// `max_batch_size`, writing rows to `sink`.
    ///
    /// Per-batch failures do not make this return `Err`; they are reported in
    /// the [`RunReport`]. Use [`RunReport::ensure_success`] to turn an
    /// incomplete run into an error.
    ///
    /// # Errors
    ///
    /// `AppError::Config` if `max_batch_size` is 0; `AppError::Io`/`Csv` if
    /// the final sink flush fails.
    pub async fn run<O, S>(
        &self,
        identifiers: Vec<String>,
        max_batch_size: usize,
        operation: Arc<O>,
        sink: Arc<S>,
    ) -> Result<RunReport, AppError>
    where
        O: BatchOperation + ?Sized + 'static,
        S: ResultSink + ?Sized + 'static,
    {
        let identifier_count = identifiers.len();
        let batches = partition(identifiers, max_batch_size)?;
        let total_batches = batches.len();
        let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();

        let mut report = RunReport {
            run_id: run_id.clone(),
            total_batches,
            ..RunReport::default()
        };

        if total_batches == 0 {
            info!("[BATCH] Run {}: no identifiers, nothing to do", run_id);
            return Ok(report);
        }

        let worker_count = self.workers.min(total_batches);
        info!(
            "[BATCH] Run {} ({}): {} identifiers in {} batches of up to {}, {} workers",
            run_id,
            operation.name(),
            identifier_count,
            total_batches,
            max_batch_size,
            worker_count
        );

        let start = Instant::now();
        let run_cancel = self.cancel.child_token();
        let ctx = WorkerContext {
            run_id: run_id.clone(),
            queue: Arc::new(WorkQueue::new(batches)),
            operation,
            sink: sink.clone(),
            cancel: run_cancel.clone(),
            policy: self.policy,
            verbose: self.verbose,
        };
        let queue = ctx.queue.clone();

        let mut join_set: JoinSet<WorkerOutcome> = JoinSet::new();
        for worker_id in 1..=worker_count {
            join_set.spawn(ctx.clone().work(worker_id));
        }
        drop(ctx);

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => {
                    report.completed_batches += outcome.completed;
                    report.rows_written += outcome.rows_written;
                    report.failed.extend(outcome.failed);
                    report.unresolved.extend(outcome.unresolved);
                    report.unattributed_records += outcome.unattributed;
                }
                Err(e) => {
                    warn!("[BATCH] Run {}: worker task failed: {:?}", run_id, e);
                    report.worker_panics += 1;
                    run_cancel.cancel();
                }
            }
        }

        report
            .unresolved
            .extend(queue.drain().iter().map(Batch::index));
        report.unresolved.sort_unstable();
        report.failed.sort_by_key(|f| f.batch_index);
        report.cancelled = self.cancel.is_cancelled();

        // A panicked worker may have taken a batch with it.
        let accounted =
            report.completed_batches + report.failed.len() + report.unresolved.len();
        if accounted < total_batches {
            warn!(
                "[BATCH] Run {}: {} batch(es) lost with failed workers",
                run_id,
                total_batches - accounted
            );
        }

        tokio::task::spawn_blocking(move || sink.flush())
            .await
            .map_err(|e| AppError::Internal(format!("Result writer task failed: {}", e)))??;

        info!(
            "[BATCH] Run {} finished in {}ms: {}/{} batches, {} rows, {} failed, {} unresolved",
            run_id,
            start.elapsed().as_millis(),
            report.completed_batches,
            total_batches,
            report.rows_written,
            report.failed.len(),
            report.unresolved.len()
        );

        Ok(report)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::operation::{extract_records, Extraction, RecordShape};
    use crate::streaming::MemorySink;
    use serde_json::{json, Value};
    use std::collections::{HashMap, HashSet};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const SHAPE: RecordShape = RecordShape {
        records_key: "supporters",
        id_key: "supporterId",
        status_key: "result",
    };

    // ─────────────────────────────────────────────────────────────────────────
    // Fake Operation
    // ─────────────────────────────────────────────────────────────────────────

    /// How the fake answers a given batch.
    #[derive(Clone)]
    enum Reply {
        Found,
        Fatal,
        Malformed,
        /// Never answers, like a request stuck behind an endless rate limit.
        Stall,
    }

    /// Fake operation: answers FOUND for every identifier unless a batch index
    /// is scripted otherwise, after a small delay that varies by batch.
    struct FakeOperation {
        calls: AtomicUsize,
        seen_batches: Mutex<Vec<Vec<String>>>,
        scripted: HashMap<usize, Reply>,
    }

    impl FakeOperation {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen_batches: Mutex::new(Vec::new()),
                scripted: HashMap::new(),
            }
        }

        fn script(mut self, index: usize, reply: Reply) -> Self {
            self.scripted.insert(index, reply);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl BatchOperation for FakeOperation {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn execute<'a>(
            &'a self,
            batch: &'a Batch,
        ) -> Pin<Box<dyn Future<Output = Result<Value, AppError>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.seen_batches
                    .lock()
                    .unwrap()
                    .push(batch.identifiers().to_vec());
                // Vary latency so completion order differs from dispatch order.
                tokio::time::sleep(Duration::from_millis((batch.index() % 3) as u64 * 5)).await;

                match self.scripted.get(&batch.index()).cloned().unwrap_or(Reply::Found) {
                    Reply::Found => {
                        let supporters: Vec<Value> = batch
                            .identifiers()
                            .iter()
                            .map(|id| json!({"supporterId": id, "result": "FOUND"}))
                            .collect();
                        Ok(json!({ "supporters": supporters }))
                    }
                    Reply::Fatal => Err(AppError::transport(500, "/fake", "boom")),
                    Reply::Malformed => Ok(json!({"unexpected": true})),
                    Reply::Stall => std::future::pending().await,
                }
            })
        }

        fn extract(&self, batch: &Batch, payload: &Value) -> Result<Extraction, AppError> {
            extract_records(batch, payload, SHAPE)
        }
    }

    fn letters(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn many_ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("id-{:04}", i)).collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn five_ids_batch_size_two_all_found() {
        let op = Arc::new(FakeOperation::new());
        let sink = Arc::new(MemorySink::new());
        let processor = BatchProcessor::new(5).unwrap();

        let report = processor
            .run(letters(&["a", "b", "c", "d", "e"]), 2, op.clone(), sink.clone())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.total_batches, 3);
        assert_eq!(report.completed_batches, 3);
        assert_eq!(report.rows_written, 5);
        assert_eq!(op.calls(), 3);

        let mut seen = op.seen_batches.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![letters(&["a", "b"]), letters(&["c", "d"]), letters(&["e"])]
        );

        let rows = sink.rows();
        assert_eq!(rows.len(), 5);
        let ids: HashSet<_> = rows.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c", "d", "e"].into_iter().collect());
        assert!(rows.iter().all(|r| r.status == ResultStatus::Found));
    }

    #[tokio::test]
    async fn coverage_is_independent_of_worker_count() {
        let input = many_ids(237);
        let mut expected = input.clone();
        expected.sort();

        for workers in [1, 2, 8] {
            let sink = Arc::new(MemorySink::new());
            let report = BatchProcessor::new(workers)
                .unwrap()
                .run(input.clone(), 10, Arc::new(FakeOperation::new()), sink.clone())
                .await
                .unwrap();

            assert!(report.is_success(), "workers={}", workers);
            let mut got: Vec<String> = sink.rows().into_iter().map(|r| r.identifier).collect();
            got.sort();
            assert_eq!(got, expected, "workers={}", workers);
        }
    }

    #[tokio::test]
    async fn duplicates_in_input_are_preserved() {
        let sink = Arc::new(MemorySink::new());
        let report = BatchProcessor::new(2)
            .unwrap()
            .run(letters(&["x", "y", "x"]), 2, Arc::new(FakeOperation::new()), sink.clone())
            .await
            .unwrap();

        assert!(report.is_success());
        let xs = sink.rows().iter().filter(|r| r.identifier == "x").count();
        assert_eq!(xs, 2);
    }

    #[tokio::test]
    async fn search_is_idempotent_against_deterministic_backend() {
        let input = many_ids(30);
        let mut runs = Vec::new();

        for _ in 0..2 {
            let sink = Arc::new(MemorySink::new());
            BatchProcessor::new(4)
                .unwrap()
                .run(input.clone(), 7, Arc::new(FakeOperation::new()), sink.clone())
                .await
                .unwrap();
            let mut rows: Vec<(String, String)> = sink
                .rows()
                .into_iter()
                .map(|r| (r.identifier, r.status.to_string()))
                .collect();
            rows.sort();
            runs.push(rows);
        }

        assert_eq!(runs[0], runs[1]);
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let op = Arc::new(FakeOperation::new());
        let sink = Arc::new(MemorySink::new());

        let report = BatchProcessor::new(5)
            .unwrap()
            .run(Vec::new(), 20, op.clone(), sink.clone())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.total_batches, 0);
        assert_eq!(op.calls(), 0);
        assert!(sink.rows().is_empty());
    }

    #[tokio::test]
    async fn zero_workers_or_batch_size_is_config_error() {
        assert!(matches!(BatchProcessor::new(0), Err(AppError::Config(_))));

        let result = BatchProcessor::new(1)
            .unwrap()
            .run(
                many_ids(3),
                0,
                Arc::new(FakeOperation::new()),
                Arc::new(MemorySink::new()),
            )
            .await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn fail_fast_stops_dispatch_and_reports_unresolved() {
        // One worker makes dispatch order deterministic: batch 2 fails, 3.. never run.
        let op = Arc::new(FakeOperation::new().script(2, Reply::Fatal));
        let sink = Arc::new(MemorySink::new());

        let report = BatchProcessor::new(1)
            .unwrap()
            .run(many_ids(50), 5, op.clone(), sink.clone())
            .await
            .unwrap();

        assert!(!report.is_success());
        assert_eq!(report.completed_batches, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].batch_index, 2);
        assert!(report.failed[0].fatal);
        assert!(report.failed[0].error.contains("500"));
        assert_eq!(report.unresolved, (3..10).collect::<Vec<_>>());
        assert!(!report.cancelled);
        assert_eq!(op.calls(), 3);
        assert_eq!(sink.rows().len(), 10);
        assert!(matches!(
            report.ensure_success(),
            Err(AppError::RunIncomplete { failed: 1, unresolved: 7 })
        ));
    }

    #[tokio::test]
    async fn fail_fast_with_many_workers_still_accounts_for_every_batch() {
        let op = Arc::new(FakeOperation::new().script(0, Reply::Fatal));
        let sink = Arc::new(MemorySink::new());

        let report = BatchProcessor::new(4)
            .unwrap()
            .run(many_ids(200), 5, op, sink.clone())
            .await
            .unwrap();

        assert!(!report.is_success());
        assert_eq!(
            report.completed_batches + report.failed.len() + report.unresolved.len(),
            report.total_batches
        );
        assert!(!report.unresolved.is_empty());
        assert_eq!(sink.rows().len() as u64, report.rows_written);
    }

    #[tokio::test]
    async fn continue_policy_lets_other_workers_drain() {
        let op = Arc::new(FakeOperation::new().script(0, Reply::Fatal));
        let sink = Arc::new(MemorySink::new());

        let report = BatchProcessor::new(3)
            .unwrap()
            .with_failure_policy(FailurePolicy::Continue)
            .run(many_ids(100), 10, op.clone(), sink.clone())
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].fatal);
        assert_eq!(report.completed_batches, 9);
        assert!(report.unresolved.is_empty());
        assert_eq!(op.calls(), 10);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn continue_policy_writes_error_rows_for_fatal_batch() {
        let input = many_ids(100);
        let op = Arc::new(FakeOperation::new().script(0, Reply::Fatal));
        let sink = Arc::new(MemorySink::new());

        let report = BatchProcessor::new(3)
            .unwrap()
            .with_failure_policy(FailurePolicy::Continue)
            .run(input.clone(), 10, op, sink.clone())
            .await
            .unwrap();

        let rows = sink.rows();
        assert_eq!(rows.len(), 100);
        assert_eq!(report.rows_written, 100);

        let written: HashSet<_> = rows.iter().map(|r| r.identifier.clone()).collect();
        let expected: HashSet<_> = input.iter().cloned().collect();
        assert_eq!(written, expected);

        let errors: HashSet<_> = rows
            .iter()
            .filter(|r| r.status == ResultStatus::Error)
            .map(|r| r.identifier.clone())
            .collect();
        let first_batch: HashSet<_> = input[..10].iter().cloned().collect();
        assert_eq!(errors, first_batch);
        assert!(rows
            .iter()
            .filter(|r| r.status == ResultStatus::Error)
            .all(|r| r.detail.as_deref().is_some_and(|d| d.contains("500"))));
    }

    #[tokio::test]
    async fn malformed_batch_writes_error_rows_and_run_continues() {
        let op = Arc::new(FakeOperation::new().script(1, Reply::Malformed));
        let sink = Arc::new(MemorySink::new());

        let report = BatchProcessor::new(2)
            .unwrap()
            .run(letters(&["a", "b", "c", "d", "e"]), 2, op.clone(), sink.clone())
            .await
            .unwrap();

        assert_eq!(op.calls(), 3);
        assert_eq!(report.completed_batches, 2);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.failed[0].fatal);
        assert!(report.unresolved.is_empty());

        let rows = sink.rows();
        assert_eq!(rows.len(), 5);
        let errors: HashSet<_> = rows
            .iter()
            .filter(|r| r.status == ResultStatus::Error)
            .map(|r| r.identifier.as_str())
            .collect();
        assert_eq!(errors, ["c", "d"].into_iter().collect());
    }

    #[tokio::test]
    async fn cancelled_before_start_dispatches_nothing() {
        let op = Arc::new(FakeOperation::new());
        let sink = Arc::new(MemorySink::new());
        let token = CancellationToken::new();
        token.cancel();

        let report = BatchProcessor::new(3)
            .unwrap()
            .with_cancellation(token)
            .run(many_ids(20), 5, op.clone(), sink)
            .await
            .unwrap();

        assert_eq!(op.calls(), 0);
        assert!(report.cancelled);
        assert_eq!(report.unresolved, vec![0, 1, 2, 3]);
        assert!(matches!(report.ensure_success(), Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn cancelling_mid_run_stops_further_dispatch() {
        let op = Arc::new(FakeOperation::new());
        let sink = Arc::new(MemorySink::new());
        let processor = BatchProcessor::new(2).unwrap();
        let token = processor.cancellation_token();

        let handle = {
            let op = op.clone();
            let sink = sink.clone();
            tokio::spawn(async move { processor.run(many_ids(2000), 1, op, sink).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        let report = handle.await.unwrap().unwrap();

        assert!(report.cancelled);
        assert!(op.calls() < 2000);
        assert_eq!(
            report.completed_batches + report.unresolved.len(),
            report.total_batches
        );
        assert_eq!(sink.rows().len(), report.completed_batches);
    }

    #[tokio::test]
    async fn cancel_interrupts_workers_stuck_in_rate_limit() {
        use crate::config::{RetryPolicy, Settings};
        use crate::engage::client::{build_http_client, RateLimitedClient};
        use crate::engage::supporters::{SupporterSearch, SEARCH_PATH};
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SEARCH_PATH))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let settings = Settings::new(
            server.uri(),
            "test_token",
            RetryPolicy::with_backoff(Duration::from_millis(50)),
            false,
        )
        .unwrap();
        // The client gets no token: the worker alone must notice cancellation.
        let client = RateLimitedClient::with_http(
            build_http_client().unwrap(),
            SupporterSearch::endpoint(&settings).unwrap(),
            settings.retry,
        );
        let op = Arc::new(SupporterSearch::new(client));
        let sink = Arc::new(MemorySink::new());
        let processor = BatchProcessor::new(2).unwrap();
        let token = processor.cancellation_token();

        let handle = {
            let sink = sink.clone();
            tokio::spawn(async move { processor.run(many_ids(10), 2, op, sink).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();

        let report = tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("run must return after cancel")
            .unwrap()
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.completed_batches, 0);
        assert_eq!(report.unresolved.len(), report.total_batches);
        assert!(sink.rows().is_empty());
        assert!(matches!(report.ensure_success(), Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn fail_fast_does_not_wait_for_a_stalled_sibling() {
        let op = Arc::new(
            FakeOperation::new()
                .script(0, Reply::Fatal)
                .script(1, Reply::Stall),
        );
        let sink = Arc::new(MemorySink::new());

        let report = tokio::time::timeout(
            Duration::from_secs(3),
            BatchProcessor::new(2)
                .unwrap()
                .run(many_ids(20), 5, op, sink),
        )
        .await
        .expect("run must return once a batch fails")
        .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].batch_index, 0);
        assert!(report.unresolved.contains(&1));
        assert!(!report.cancelled);
        assert_eq!(
            report.completed_batches + report.failed.len() + report.unresolved.len(),
            report.total_batches
        );
    }

    /// Sink whose writes hold the thread, like a slow disk.
    struct SlowSink {
        inner: MemorySink,
        delay: Duration,
    }

    impl ResultSink for SlowSink {
        fn write_rows(&self, rows: &[ResultRow]) -> Result<(), AppError> {
            std::thread::sleep(self.delay);
            self.inner.write_rows(rows)
        }
    }

    #[tokio::test]
    async fn slow_sink_does_not_stall_the_runtime() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        let sink = Arc::new(SlowSink {
            inner: MemorySink::new(),
            delay: Duration::from_millis(300),
        });

        let report = BatchProcessor::new(1)
            .unwrap()
            .run(letters(&["a", "b"]), 2, Arc::new(FakeOperation::new()), sink.clone())
            .await
            .unwrap();
        ticker.abort();

        assert!(report.is_success());
        assert_eq!(sink.inner.rows().len(), 2);
        // Single-threaded test runtime: the ticker only advances if the
        // write ran off the runtime thread.
        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }

    #[test]
    fn report_success_requires_every_batch() {
        let report = RunReport {
            total_batches: 2,
            completed_batches: 2,
            ..RunReport::default()
        };
        assert!(report.is_success());
        assert!(report.ensure_success().is_ok());

        let short = RunReport {
            total_batches: 2,
            completed_batches: 1,
            ..RunReport::default()
        };
        assert!(!short.is_success());
    }
}
