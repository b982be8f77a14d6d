//! Segment membership export.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::Settings;
use crate::engage::client::RateLimitedClient;
use crate::engage::endpoint::{Endpoint, HttpMethod};
use crate::engage::pagination::OffsetPager;
use crate::error::AppError;

pub const SEGMENT_MEMBERS_PATH: &str = "/api/integration/ext/v1/segments/members/search";

/// Builds the segment members endpoint for `settings`.
pub fn members_endpoint(settings: &Settings) -> Result<Endpoint, AppError> {
    Endpoint::builder()
        .host(settings.host.clone())
        .path(SEGMENT_MEMBERS_PATH)
        .method(HttpMethod::Post)
        .token(settings.token.clone())
        .build()
}

/// Reads every member of `segment_id`, handing supporter ids to `on_ids` one
/// page at a time. Returns the number of ids handed over.
///
/// Members without a `supporterId` are skipped with a warning.
///
/// # Errors
///
/// Client errors and errors returned by `on_ids` stop the export.
pub async fn export_member_ids<F>(
    client: &RateLimitedClient,
    segment_id: &str,
    page_size: u64,
    mut on_ids: F,
) -> Result<u64, AppError>
where
    F: FnMut(Vec<String>) -> Result<(), AppError>,
{
    if segment_id.trim().is_empty() {
        return Err(AppError::Config("segment id must not be empty".to_string()));
    }

    let pager = OffsetPager::new(
        client,
        json!({ "segmentId": segment_id }),
        "supporters",
        page_size,
    )?;

    let mut exported = 0u64;
    let summary = pager
        .for_each_page(|page| {
            let ids: Vec<String> = page
                .records
                .iter()
                .filter_map(|record| {
                    let id = record.get("supporterId").and_then(Value::as_str);
                    if id.is_none() {
                        warn!("[ENGAGE] Segment member without supporterId at offset {}", page.offset);
                    }
                    id.map(str::to_string)
                })
                .collect();
            exported += ids.len() as u64;
            on_ids(ids)
        })
        .await?;

    info!(
        "[ENGAGE] Segment {}: {} member ids over {} pages",
        segment_id, exported, summary.pages
    );
    Ok(exported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> RateLimitedClient {
        let settings = Settings::new(
            server.uri(),
            "test_token",
            RetryPolicy::with_backoff(Duration::from_millis(5)),
            false,
        )
        .unwrap();
        RateLimitedClient::new(members_endpoint(&settings).unwrap(), settings.retry).unwrap()
    }

    fn page(ids: &[&str]) -> ResponseTemplate {
        let supporters: Vec<Value> = ids.iter().map(|id| json!({"supporterId": id})).collect();
        ResponseTemplate::new(200).set_body_json(json!({
            "payload": {"count": ids.len(), "offset": 0, "total": 3, "supporters": supporters}
        }))
    }

    #[tokio::test]
    async fn exports_every_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SEGMENT_MEMBERS_PATH))
            .and(body_partial_json(json!({"payload": {"segmentId": "seg-1", "offset": 0, "count": 2}})))
            .respond_with(page(&["a", "b"]))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(SEGMENT_MEMBERS_PATH))
            .and(body_partial_json(json!({"payload": {"segmentId": "seg-1", "offset": 2, "count": 2}})))
            .respond_with(page(&["c"]))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let mut got = Vec::new();

        let exported = export_member_ids(&client, "seg-1", 2, |ids| {
            got.extend(ids);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(exported, 3);
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn members_without_id_are_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SEGMENT_MEMBERS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "payload": {"count": 2, "supporters": [{"firstName": "x"}, {"supporterId": "b"}]}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let mut got = Vec::new();

        let exported = export_member_ids(&client, "seg-1", 20, |ids| {
            got.extend(ids);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(exported, 1);
        assert_eq!(got, vec!["b"]);
    }

    #[tokio::test]
    async fn blank_segment_id_is_rejected() {
        let server = MockServer::start().await;
        let client = client_for(&server).await;

        let result = export_member_ids(&client, " ", 20, |_| Ok(())).await;

        assert!(matches!(result, Err(AppError::Config(_))));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
