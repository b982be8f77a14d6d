//! `members`: export a segment's supporter ids to CSV.

use std::path::Path;

use tracing::info;

use crate::config::Settings;
use crate::engage::client::RateLimitedClient;
use crate::engage::segments::{export_member_ids, members_endpoint};
use crate::error::AppError;
use crate::streaming::CsvIdWriter;

/// Writes every member id of `segment_id` to `csv_file`, one page at a time.
/// Returns the number of ids written.
pub async fn export_members(
    settings: &Settings,
    segment_id: &str,
    csv_file: &Path,
    page_size: u64,
) -> Result<u64, AppError> {
    let client = RateLimitedClient::new(members_endpoint(settings)?, settings.retry)?;
    let mut writer = CsvIdWriter::create(csv_file)?;

    export_member_ids(&client, segment_id, page_size, |ids| writer.append(ids)).await?;

    let written = writer.finish()?;
    info!(
        "[SINK] Wrote {} member ids to {}",
        written,
        csv_file.display()
    );
    Ok(written)
}
