//! Supporter search and delete, as batch operations.
//!
//! Both endpoints take a list of supporter ids in one request and answer with
//! one `{supporterId, result}` record per id under `payload.supporters`.

use std::future::Future;
use std::pin::Pin;

use serde_json::{json, Value};

use crate::batch::operation::{extract_records, BatchOperation, Extraction, RecordShape};
use crate::batch::partition::Batch;
use crate::config::Settings;
use crate::engage::client::RateLimitedClient;
use crate::engage::endpoint::{Endpoint, HttpMethod};
use crate::error::AppError;

pub const SEARCH_PATH: &str = "/api/integration/ext/v1/supporters/search";
pub const DELETE_PATH: &str = "/api/integration/ext/v1/supporters";

/// Where supporter ids and results sit in a search or delete response.
pub const SUPPORTER_SHAPE: RecordShape = RecordShape {
    records_key: "supporters",
    id_key: "supporterId",
    status_key: "result",
};

fn endpoint(settings: &Settings, path: &str, method: HttpMethod) -> Result<Endpoint, AppError> {
    Endpoint::builder()
        .host(settings.host.clone())
        .path(path)
        .method(method)
        .token(settings.token.clone())
        .build()
}

// ─────────────────────────────────────────────────────────────────────────────
// Search
// ─────────────────────────────────────────────────────────────────────────────

/// Looks supporters up by id. Results are `FOUND` or `NOT_FOUND`.
#[derive(Debug, Clone)]
pub struct SupporterSearch {
    client: RateLimitedClient,
}

impl SupporterSearch {
    /// `client` must be bound to a POST endpoint on [`SEARCH_PATH`].
    pub fn new(client: RateLimitedClient) -> Self {
        Self { client }
    }

    /// Builds the search endpoint for `settings`.
    pub fn endpoint(settings: &Settings) -> Result<Endpoint, AppError> {
        endpoint(settings, SEARCH_PATH, HttpMethod::Post)
    }

    pub fn request(identifiers: &[String]) -> Value {
        json!({
            "payload": {
                "identifiers": identifiers,
                "identifierType": "SUPPORTER_ID",
            }
        })
    }
}

impl BatchOperation for SupporterSearch {
    fn name(&self) -> &'static str {
        "supporter search"
    }

    fn execute<'a>(
        &'a self,
        batch: &'a Batch,
    ) -> Pin<Box<dyn Future<Output = Result<Value, AppError>> + Send + 'a>> {
        Box::pin(async move {
            self.client
                .send(&Self::request(batch.identifiers()))
                .await
        })
    }

    fn extract(&self, batch: &Batch, payload: &Value) -> Result<Extraction, AppError> {
        extract_records(batch, payload, SUPPORTER_SHAPE)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Delete
// ─────────────────────────────────────────────────────────────────────────────

/// Deletes supporters by id. Results are typically `DELETED` or `NOT_FOUND`.
///
/// The request is a DELETE with a JSON body, which is what Engage expects.
#[derive(Debug, Clone)]
pub struct SupporterDelete {
    client: RateLimitedClient,
}

impl SupporterDelete {
    /// `client` must be bound to a DELETE endpoint on [`DELETE_PATH`].
    pub fn new(client: RateLimitedClient) -> Self {
        Self { client }
    }

    /// Builds the delete endpoint for `settings`.
    pub fn endpoint(settings: &Settings) -> Result<Endpoint, AppError> {
        endpoint(settings, DELETE_PATH, HttpMethod::Delete)
    }

    pub fn request(identifiers: &[String]) -> Value {
        let supporters: Vec<Value> = identifiers
            .iter()
            .map(|id| json!({ "supporterId": id }))
            .collect();
        json!({ "payload": { "supporters": supporters } })
    }
}

impl BatchOperation for SupporterDelete {
    fn name(&self) -> &'static str {
        "supporter delete"
    }

    fn execute<'a>(
        &'a self,
        batch: &'a Batch,
    ) -> Pin<Box<dyn Future<Output = Result<Value, AppError>> + Send + 'a>> {
        Box::pin(async move {
            self.client
                .send(&Self::request(batch.identifiers()))
                .await
        })
    }

    fn extract(&self, batch: &Batch, payload: &Value) -> Result<Extraction, AppError> {
        extract_records(batch, payload, SUPPORTER_SHAPE)
    }
}
