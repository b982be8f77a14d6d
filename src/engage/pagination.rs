//! Paged reads over a [`RateLimitedClient`].
//!
//! Engage pages search results two ways:
//!
//! - **offset/count**: the caller asks for `count` records at `offset`, then
//!   advances `offset` by the `count` the service returned. A short page (or
//!   an empty one) is the last page.
//! - **cursor**: the service returns an opaque `cursor` that is echoed into
//!   the next request. No cursor, or a page with no records, ends the read.
//!
//! Both pagers hand each page to a callback as it arrives, so large result
//! sets never need to be held in memory.

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::engage::client::RateLimitedClient;
use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// One page of results.
#[derive(Debug, Clone)]
pub struct Page {
    /// Records found under the pager's records key.
    pub records: Vec<Value>,
    /// Offset this page starts at (offset pagination only, 0 otherwise).
    pub offset: u64,
    /// Total matching records, when the service reports it.
    pub total: Option<u64>,
}

/// Totals for a completed paged read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageSummary {
    pub pages: u32,
    pub records: u64,
    pub total: Option<u64>,
}

fn request_fields(request: Value) -> Result<Map<String, Value>, AppError> {
    match request {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(AppError::Config(
            "paged request payload must be a JSON object".to_string(),
        )),
    }
}

fn records_from(payload: &Value, key: &str) -> Vec<Value> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// OffsetPager
// ─────────────────────────────────────────────────────────────────────────────

/// Offset/count pagination.
pub struct OffsetPager<'a> {
    client: &'a RateLimitedClient,
    fields: Map<String, Value>,
    records_key: String,
    page_size: u64,
    start_offset: u64,
}

impl<'a> OffsetPager<'a> {
    /// Creates a pager.
    ///
    /// `request` holds the search fields that go inside the request's
    /// `payload` object; `offset` and `count` are filled in per page.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `request` is not an object or
    /// `page_size` is 0.
    pub fn new(
        client: &'a RateLimitedClient,
        request: Value,
        records_key: impl Into<String>,
        page_size: u64,
    ) -> Result<Self, AppError> {
        if page_size == 0 {
            return Err(AppError::Config("page size must be positive".to_string()));
        }
        Ok(Self {
            client,
            fields: request_fields(request)?,
            records_key: records_key.into(),
            page_size,
            start_offset: 0,
        })
    }

    /// Starts reading at `offset` instead of 0. Useful to resume after an outage.
    pub fn start_offset(mut self, offset: u64) -> Self {
        self.start_offset = offset;
        self
    }

    /// Reads every page, handing each to `on_page`.
    pub async fn for_each_page<F>(&self, mut on_page: F) -> Result<PageSummary, AppError>
    where
        F: FnMut(Page) -> Result<(), AppError>,
    {
        let mut summary = PageSummary::default();
        let mut offset = self.start_offset;

        loop {
            let mut fields = self.fields.clone();
            fields.insert("offset".to_string(), Value::from(offset));
            fields.insert("count".to_string(), Value::from(self.page_size));
            let request = serde_json::json!({ "payload": fields });

            let payload = self.client.send(&request).await?;

            let records = records_from(&payload, &self.records_key);
            let returned = payload
                .get("count")
                .and_then(Value::as_u64)
                .unwrap_or(records.len() as u64);
            let total = payload.get("total").and_then(Value::as_u64);

            summary.pages += 1;
            summary.records += records.len() as u64;
            if total.is_some() {
                summary.total = total;
            }

            debug!(
                "[PAGER] offset {} returned {} of {:?}",
                offset, returned, total
            );

            if !records.is_empty() {
                on_page(Page {
                    records,
                    offset,
                    total,
                })?;
            }

            if returned < self.page_size {
                break;
            }
            offset += returned;
        }

        info!(
            "[PAGER] Offset read complete: {} records, {} pages",
            summary.records, summary.pages
        );
        Ok(summary)
    }

    /// Reads every page and returns all records.
    pub async fn collect(&self) -> Result<Vec<Value>, AppError> {
        let mut all = Vec::new();
        self.for_each_page(|page| {
            all.extend(page.records);
            Ok(())
        })
        .await?;
        Ok(all)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CursorPager
// ─────────────────────────────────────────────────────────────────────────────

/// Cursor pagination.
pub struct CursorPager<'a> {
    client: &'a RateLimitedClient,
    fields: Map<String, Value>,
    records_key: String,
}

impl<'a> CursorPager<'a> {
    /// Creates a pager. `request` holds the fields that go inside `payload`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `request` is not an object.
    pub fn new(
        client: &'a RateLimitedClient,
        request: Value,
        records_key: impl Into<String>,
    ) -> Result<Self, AppError> {
        Ok(Self {
            client,
            fields: request_fields(request)?,
            records_key: records_key.into(),
        })
    }

    /// Reads every page, handing each to `on_page`.
    pub async fn for_each_page<F>(&self, mut on_page: F) -> Result<PageSummary, AppError>
    where
        F: FnMut(Page) -> Result<(), AppError>,
    {
        let mut summary = PageSummary::default();
        let mut cursor: Option<String> = None;

        loop {
            let mut fields = self.fields.clone();
            if let Some(ref c) = cursor {
                fields.insert("cursor".to_string(), Value::from(c.as_str()));
            }
            let request = serde_json::json!({ "payload": fields });

            let payload = self.client.send(&request).await?;

            let records = records_from(&payload, &self.records_key);
            let total = payload.get("total").and_then(Value::as_u64);
            summary.pages += 1;
            summary.records += records.len() as u64;
            if total.is_some() {
                summary.total = total;
            }

            if records.is_empty() {
                break;
            }
            on_page(Page {
                records,
                offset: 0,
                total,
            })?;

            cursor = payload
                .get("cursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        info!(
            "[PAGER] Cursor read complete: {} records, {} pages",
            summary.records, summary.pages
        );
        Ok(summary)
    }

    /// Reads every page and returns all records.
    pub async fn collect(&self) -> Result<Vec<Value>, AppError> {
        let mut all = Vec::new();
        self.for_each_page(|page| {
            all.extend(page.records);
            Ok(())
        })
        .await?;
        Ok(all)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
