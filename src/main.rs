//! `engage-bulk` - bulk supporter operations against the Engage Integration API.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use engage_bulk::commands::{
    export_members, render_metrics, run_supporters, show_metrics, SupporterAction,
    SupporterRunRequest,
};
use engage_bulk::config::{
    FailurePolicy, RetryPolicy, Settings, DEFAULT_BACKOFF, DEFAULT_HOST, DEFAULT_PAGE_SIZE,
    DEFAULT_WORKERS, HOST_ENV, TOKEN_ENV,
};
use engage_bulk::error::AppError;

/// Bulk supporter operations against the Engage Integration API.
///
/// Rate limiting is handled by sleeping and retrying, so long runs simply
/// take longer instead of failing.
#[derive(Parser, Debug)]
#[command(name = "engage-bulk", author, version)]
struct Args {
    /// Integration API token
    #[arg(long, env = TOKEN_ENV, hide_env_values = true, global = true)]
    token: Option<String>,

    /// API host, with or without scheme
    #[arg(long, env = HOST_ENV, default_value = DEFAULT_HOST, global = true)]
    host: String,

    /// Seconds to wait after a rate-limit response
    #[arg(long, default_value_t = DEFAULT_BACKOFF.as_secs(), global = true)]
    backoff_secs: u64,

    /// Give up on a request after this many rate-limit retries (default: never)
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    /// Log every result row
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Look up every supporter id in a file and record FOUND / NOT_FOUND
    Check(RunArgs),

    /// Delete every supporter id in a file and record the result
    Delete(RunArgs),

    /// Print the account's API metrics as JSON
    Metrics,

    /// Export the supporter ids of a segment
    Members {
        /// Segment to export
        #[arg(long)]
        segment_id: String,

        /// Output CSV
        #[arg(long)]
        csv_file: PathBuf,

        /// Records per page
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        count: u64,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// CSV whose first column holds supporter ids
    #[arg(long)]
    id_file: PathBuf,

    /// Output CSV (SupporterID,Result)
    #[arg(long)]
    csv_file: PathBuf,

    /// Concurrent workers
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Cap on identifiers per request; never above the service's maxBatchSize
    #[arg(long)]
    batch_size: Option<usize>,

    /// Keep processing other batches after a batch fails
    #[arg(long)]
    keep_going: bool,
}

impl RunArgs {
    fn into_request(self, action: SupporterAction) -> SupporterRunRequest {
        let mut request = SupporterRunRequest::new(action, self.id_file, self.csv_file);
        request.workers = self.workers;
        request.batch_size = self.batch_size;
        request.failure_policy = if self.keep_going {
            FailurePolicy::Continue
        } else {
            FailurePolicy::FailFast
        };
        request
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn settings_from(args: &Args) -> Result<Settings, AppError> {
    let mut retry = RetryPolicy::with_backoff(Duration::from_secs(args.backoff_secs));
    if let Some(max) = args.max_retries {
        retry = retry.max_retries(max);
    }
    Settings::new(
        args.host.clone(),
        args.token.clone().unwrap_or_default(),
        retry,
        args.verbose,
    )
}

/// Cancels `token` on Ctrl-C. Workers drop their current request and stop.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping workers");
            token.cancel();
        }
    });
}

async fn run(args: Args) -> Result<(), AppError> {
    let settings = settings_from(&args)?;

    match args.command {
        Command::Check(run_args) => {
            run_batch(&settings, run_args.into_request(SupporterAction::Check)).await
        }
        Command::Delete(run_args) => {
            run_batch(&settings, run_args.into_request(SupporterAction::Delete)).await
        }
        Command::Metrics => {
            let metrics = show_metrics(&settings).await?;
            println!("{}", render_metrics(&metrics)?);
            Ok(())
        }
        Command::Members {
            segment_id,
            csv_file,
            count,
        } => {
            export_members(&settings, &segment_id, &csv_file, count).await?;
            Ok(())
        }
    }
}

async fn run_batch(settings: &Settings, request: SupporterRunRequest) -> Result<(), AppError> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let report = run_supporters(settings, request, cancel).await?;

    for failure in &report.failed {
        error!(
            "Batch {} ({} ids) failed: {}",
            failure.batch_index, failure.size, failure.error
        );
    }
    if report.unattributed_records > 0 {
        warn!(
            "{} response records could not be matched to a requested id",
            report.unattributed_records
        );
    }
    if report.is_success() {
        info!(
            "Done: {} batches, {} rows",
            report.completed_batches, report.rows_written
        );
    }
    report.ensure_success()
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
