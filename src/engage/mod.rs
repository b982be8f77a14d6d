//! Engage Integration API access.
//!
//! Every call goes through a [`RateLimitedClient`], which absorbs the
//! service's per-minute rate limiting by sleeping and retrying.

pub mod client;
pub mod endpoint;
pub mod metrics;
pub mod pagination;
pub mod segments;
pub mod supporters;

pub use client::{build_http_client, RateLimitedClient};
pub use endpoint::{Endpoint, EndpointBuilder, HttpMethod};
pub use metrics::{fetch_metrics, metrics_endpoint, Metrics};
pub use pagination::{CursorPager, OffsetPager, Page, PageSummary};
pub use segments::{export_member_ids, members_endpoint};
pub use supporters::{SupporterDelete, SupporterSearch};
