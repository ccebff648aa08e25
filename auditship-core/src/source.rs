//! Paginated, read-only access to the remote audit-log feed.

use crate::error::Result;
use crate::watermark::Watermark;
use serde::{Deserialize, Serialize};

/// Cloudflare organization audit-log API client.
mod cloudflare;
pub use cloudflare::{
    CloudflareAuditLogs, CloudflareConfig, DEFAULT_BASE_URL, DEFAULT_PAGE_SIZE,
    DEFAULT_REQUEST_TIMEOUT,
};

/// An audit-log event. It is never inspected, only counted and forwarded in the order received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditLogRecord(serde_json::Value);

impl AuditLogRecord {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// One fetch worth of records. Page numbers start at 1, an empty page means the feed is
/// exhausted for the current watermark.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub number: u32,
    pub records: Vec<AuditLogRecord>,
}

impl Page {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// AuditLogSource is implemented by the remote feed adapters. Callers own the pagination loop and
/// must request pages in increasing order starting at 1. There is no retry inside a source, a
/// failed call surfaces as an error and the next tick is the retry.
#[trait_variant::make(Send)]
pub trait AuditLogSource {
    /// Identity of the acting principal. `None` (or an empty identity) means the credentials are
    /// valid but scoped out, the caller skips fetching for that tick.
    async fn identity(&self) -> Result<Option<String>>;

    /// Fetches page `page` of the events at or after `since`.
    async fn fetch_page(&self, since: Watermark, page: u32) -> Result<Page>;
}
