use crate::error::{Error, Result};
use crate::source::{AuditLogRecord, AuditLogSource, Page};
use crate::watermark::Watermark;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::trace;

pub const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const HEADER_AUTH_EMAIL: &str = "X-Auth-Email";
const HEADER_AUTH_KEY: &str = "X-Auth-Key";

#[derive(Clone, PartialEq)]
pub struct CloudflareConfig {
    pub base_url: String,
    pub api_email: String,
    pub api_key: String,
    pub organization_id: String,
    pub page_size: u32,
    /// Upper bound for a single request, a hung fetch would otherwise stall the tick forever.
    pub request_timeout: Duration,
}

impl std::fmt::Debug for CloudflareConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareConfig")
            .field("base_url", &self.base_url)
            .field("api_email", &self.api_email)
            .field("api_key", &"<redacted>")
            .field("organization_id", &self.organization_id)
            .field("page_size", &self.page_size)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Every Cloudflare v4 response is wrapped in this envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct UserDetails {
    #[serde(default)]
    email: String,
}

/// Reads the organization audit log through the Cloudflare v4 API.
#[derive(Debug, Clone)]
pub struct CloudflareAuditLogs {
    client: reqwest::Client,
    base_url: String,
    organization_id: String,
    page_size: u32,
}

impl CloudflareAuditLogs {
    pub fn new(config: CloudflareConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HEADER_AUTH_EMAIL,
            HeaderValue::from_str(&config.api_email)
                .map_err(|e| Error::Config(format!("Invalid API email header: {e}")))?,
        );
        let mut api_key = HeaderValue::from_str(&config.api_key)
            .map_err(|e| Error::Config(format!("Invalid API key header: {e}")))?;
        api_key.set_sensitive(true);
        headers.insert(HEADER_AUTH_KEY, api_key);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .user_agent(concat!("auditship/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            organization_id: config.organization_id,
            page_size: config.page_size,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::Source(format!("Request to {path} failed: {e}")))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Source(format!("Failed to read response from {path}: {e}")))?;

        let envelope: Envelope<T> = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(Error::Source(format!("{path} returned {status}")));
            }
            Err(e) => {
                return Err(Error::Source(format!(
                    "Failed to decode response from {path}: {e}"
                )));
            }
        };

        if !status.is_success() || !envelope.success {
            let errors = envelope
                .errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(Error::Source(format!("{path} returned {status}: [{errors}]")));
        }

        envelope
            .result
            .ok_or_else(|| Error::Source(format!("{path} returned no result")))
    }
}

impl AuditLogSource for CloudflareAuditLogs {
    async fn identity(&self) -> Result<Option<String>> {
        let user: UserDetails = self.get("/user", &[]).await?;
        Ok(Some(user.email).filter(|email| !email.trim().is_empty()))
    }

    async fn fetch_page(&self, since: Watermark, page: u32) -> Result<Page> {
        let path = format!("/organizations/{}/audit_logs", self.organization_id);
        let records: Vec<AuditLogRecord> = self
            .get(
                &path,
                &[
                    ("since", since.to_string()),
                    ("page", page.to_string()),
                    ("per_page", self.page_size.to_string()),
                    ("direction", "asc".to_string()),
                ],
            )
            .await?;

        trace!(page, records = records.len(), "Fetched audit log page");
        Ok(Page {
            number: page,
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    const EMAIL: &str = "ops@example.com";
    const KEY: &str = "secret-key";
    const ORG: &str = "org-123";

    #[derive(Clone)]
    struct FakeApi {
        email: &'static str,
        pages: Arc<Vec<Vec<serde_json::Value>>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get(HEADER_AUTH_EMAIL).and_then(|v| v.to_str().ok()) == Some(EMAIL)
            && headers.get(HEADER_AUTH_KEY).and_then(|v| v.to_str().ok()) == Some(KEY)
    }

    fn unauthorized() -> axum::response::Response {
        (
            StatusCode::FORBIDDEN,
            Json(json!({
                "success": false,
                "errors": [{"code": 9103, "message": "Unknown X-Auth-Key or X-Auth-Email"}],
                "result": null
            })),
        )
            .into_response()
    }

    async fn user(State(api): State<FakeApi>, headers: HeaderMap) -> axum::response::Response {
        if !authorized(&headers) {
            return unauthorized();
        }
        Json(json!({"success": true, "errors": [], "result": {"email": api.email}})).into_response()
    }

    async fn audit_logs(
        State(api): State<FakeApi>,
        Path(org): Path<String>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> axum::response::Response {
        if !authorized(&headers) {
            return unauthorized();
        }
        if org != ORG || query.get("since").map(String::as_str) != Some("2024-05-01T10:00:00Z") {
            return (StatusCode::BAD_REQUEST, "unexpected request").into_response();
        }
        if query.get("per_page").map(String::as_str) != Some("2") {
            return (StatusCode::BAD_REQUEST, "unexpected page size").into_response();
        }
        let page: usize = query
            .get("page")
            .and_then(|p| p.parse().ok())
            .unwrap_or(1);
        let records = api.pages.get(page - 1).cloned().unwrap_or_default();
        Json(json!({"success": true, "errors": [], "result": records})).into_response()
    }

    async fn start_fake_api(email: &'static str, pages: Vec<Vec<serde_json::Value>>) -> String {
        let app = Router::new()
            .route("/user", get(user))
            .route("/organizations/{org}/audit_logs", get(audit_logs))
            .with_state(FakeApi {
                email,
                pages: Arc::new(pages),
            });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn config(base_url: String, api_key: &str) -> CloudflareConfig {
        CloudflareConfig {
            base_url,
            api_email: EMAIL.to_string(),
            api_key: api_key.to_string(),
            organization_id: ORG.to_string(),
            page_size: 2,
            request_timeout: Duration::from_secs(5),
        }
    }

    fn since() -> Watermark {
        Watermark::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_identity_returns_email() {
        let base_url = start_fake_api(EMAIL, vec![]).await;
        let source = CloudflareAuditLogs::new(config(base_url, KEY)).unwrap();

        assert_eq!(source.identity().await.unwrap().as_deref(), Some(EMAIL));
    }

    #[tokio::test]
    async fn test_identity_empty_email_is_none() {
        let base_url = start_fake_api("", vec![]).await;
        let source = CloudflareAuditLogs::new(config(base_url, KEY)).unwrap();

        assert_eq!(source.identity().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bad_credentials_surface_api_errors() {
        let base_url = start_fake_api(EMAIL, vec![]).await;
        let source = CloudflareAuditLogs::new(config(base_url, "wrong")).unwrap();

        let err = source.identity().await.unwrap_err();
        assert!(matches!(err, Error::Source(_)));
        assert!(err.to_string().contains("403"));
        assert!(err.to_string().contains("9103"));
        assert!(!err.to_string().contains("wrong"));
    }

    #[tokio::test]
    async fn test_fetch_pages_until_empty() {
        let pages = vec![
            vec![json!({"id": "a"}), json!({"id": "b"})],
            vec![json!({"id": "c"})],
        ];
        let base_url = start_fake_api(EMAIL, pages).await;
        let source = CloudflareAuditLogs::new(config(base_url, KEY)).unwrap();

        let first = source.fetch_page(since(), 1).await.unwrap();
        assert_eq!(first.number, 1);
        assert_eq!(
            first.records,
            vec![
                AuditLogRecord::new(json!({"id": "a"})),
                AuditLogRecord::new(json!({"id": "b"}))
            ]
        );

        let second = source.fetch_page(since(), 2).await.unwrap();
        assert_eq!(second.records.len(), 1);

        let third = source.fetch_page(since(), 3).await.unwrap();
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn test_non_json_error_response() {
        let base_url = start_fake_api(EMAIL, vec![]).await;
        let source = CloudflareAuditLogs::new(config(format!("{base_url}missing"), KEY)).unwrap();

        let err = source.fetch_page(since(), 1).await.unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = config(DEFAULT_BASE_URL.to_string(), KEY);
        assert!(!format!("{config:?}").contains(KEY));
    }

    #[test]
    fn test_invalid_header_value_is_config_error() {
        let mut config = config(DEFAULT_BASE_URL.to_string(), KEY);
        config.api_key = "bad\nkey".to_string();
        assert!(matches!(
            CloudflareAuditLogs::new(config),
            Err(Error::Config(_))
        ));
    }
}
