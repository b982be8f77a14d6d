//! Command implementations behind the CLI subcommands.

pub mod members;
pub mod metrics;
pub mod supporters;

pub use members::export_members;
pub use metrics::{render_metrics, show_metrics};
pub use supporters::{effective_batch_size, run_supporters, SupporterAction, SupporterRunRequest};
