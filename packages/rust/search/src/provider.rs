//! Search provider boundary and the Serper (Google News) implementation.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Months, NaiveDate, TimeDelta, Utc};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use newsfeed_shared::{ArticleRef, NewsfeedError, Result};

/// User-Agent string for provider requests.
const USER_AGENT: &str = concat!("newsfeed/", env!("CARGO_PKG_VERSION"));

static RELATIVE_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d+)\s+(minute|min|hour|day|week|month|year)s?\s+ago$")
        .expect("static regex")
});

/// Absolute date layouts seen in provider payloads.
const DATE_FORMATS: &[&str] = &["%b %d, %Y", "%d %b %Y", "%Y-%m-%d", "%B %d, %Y"];

// ---------------------------------------------------------------------------
// Boundary
// ---------------------------------------------------------------------------

/// One provider request: free-text query plus a rolling recency window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    /// Maximum number of results requested.
    pub num: u32,
    pub recency_months: u32,
}

/// A news search backend.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    /// Run one query. Transient failures (timeouts, 429, 5xx) are marked
    /// retryable so the caller's retry loop can act on them.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<ArticleRef>>;
}

// ---------------------------------------------------------------------------
// Serper
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperOrganic>,
}

#[derive(Debug, Deserialize)]
struct SerperOrganic {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: String,
    date: Option<String>,
    position: Option<u32>,
}

/// Serper.dev Google search over HTTPS.
pub struct SerperProvider {
    client: Client,
    endpoint: Url,
    api_key: String,
}

impl SerperProvider {
    /// `timeout` bounds the HTTP exchange; the retry wrapper applies its own
    /// per-attempt bound on top.
    pub fn new(endpoint: &str, api_key: String, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            NewsfeedError::config(format!("invalid search endpoint '{endpoint}': {e}"))
        })?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| NewsfeedError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl SearchProvider for SerperProvider {
    fn name(&self) -> &str {
        "serper"
    }

    #[instrument(skip_all, fields(query = %query.text))]
    async fn search(&self, query: &SearchQuery) -> Result<Vec<ArticleRef>> {
        let body = serde_json::json!({
            "q": query.text,
            "num": query.num,
            "tbs": format!("qdr:m{}", query.recency_months),
        });

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("X-API-KEY", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NewsfeedError::provider_transient(format!("serper request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let msg = format!("serper HTTP {status}: {}", detail.trim());
            return Err(if is_retryable_status(status) {
                NewsfeedError::provider_transient(msg)
            } else {
                NewsfeedError::provider_fatal(msg)
            });
        }

        let parsed: SerperResponse = response
            .json()
            .await
            .map_err(|e| NewsfeedError::provider_fatal(format!("serper response: {e}")))?;

        let now = Utc::now();
        let items: Vec<ArticleRef> = parsed
            .organic
            .into_iter()
            .map(|o| ArticleRef {
                published_at: o.date.as_deref().and_then(|d| parse_published(d, now)),
                url: o.link,
                title: o.title,
                snippet: o.snippet,
                source_rank: o.position,
            })
            .collect();

        debug!(results = items.len(), "serper search complete");
        Ok(items)
    }
}

/// 429 and 5xx are worth another attempt; other client errors are not.
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Parse a provider date string, absolute ("Mar 5, 2025") or relative
/// ("3 days ago") to `now`. Unrecognized strings yield `None`.
pub fn parse_published(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Some(caps) = RELATIVE_DATE_RE.captures(raw) {
        let n: u32 = caps[1].parse().ok()?;
        return match caps[2].to_ascii_lowercase().as_str() {
            "minute" | "min" => now.checked_sub_signed(TimeDelta::try_minutes(n.into())?),
            "hour" => now.checked_sub_signed(TimeDelta::try_hours(n.into())?),
            "day" => now.checked_sub_signed(TimeDelta::try_days(n.into())?),
            "week" => now.checked_sub_signed(TimeDelta::try_weeks(n.into())?),
            "month" => now.checked_sub_months(Months::new(n)),
            "year" => now.checked_sub_months(Months::new(n.checked_mul(12)?)),
            _ => None,
        };
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    DATE_FORMATS.iter().find_map(|fmt| {
        NaiveDate::parse_from_str(raw, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn query() -> SearchQuery {
        SearchQuery {
            text: "\"Anna Keller\" Germany news".into(),
            num: 10,
            recency_months: 8,
        }
    }

    fn provider(server: &MockServer) -> SerperProvider {
        SerperProvider::new(
            &format!("{}/search", server.uri()),
            "test-key".into(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn serper_maps_organic_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header("X-API-KEY", "test-key"))
            .and(body_partial_json(serde_json::json!({
                "q": "\"Anna Keller\" Germany news",
                "num": 10,
                "tbs": "qdr:m8"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "organic": [
                    {
                        "title": "Keller pushes climate bill",
                        "link": "https://news.example.com/keller-climate",
                        "snippet": "The MEP said...",
                        "date": "Mar 5, 2025",
                        "position": 1
                    },
                    {
                        "title": "Committee vote",
                        "link": "https://news.example.com/vote",
                        "position": 2
                    }
                ]
            })))
            .mount(&server)
            .await;

        let items = provider(&server).search(&query()).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Keller pushes climate bill");
        assert_eq!(items[0].source_rank, Some(1));
        assert_eq!(
            items[0].published_at,
            Some(Utc.with_ymd_and_hms(2025, 3, 5, 0, 0, 0).unwrap())
        );
        assert_eq!(items[1].snippet, "");
        assert!(items[1].published_at.is_none());
    }

    #[tokio::test]
    async fn missing_organic_is_empty_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let items = provider(&server).search(&query()).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = provider(&server).search(&query()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn auth_errors_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let err = provider(&server).search(&query()).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.kind(), "provider_error");
    }

    #[test]
    fn relative_dates() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        assert_eq!(
            parse_published("3 days ago", now),
            Some(Utc.with_ymd_and_hms(2025, 6, 12, 12, 0, 0).unwrap())
        );
        assert_eq!(
            parse_published("1 hour ago", now),
            Some(Utc.with_ymd_and_hms(2025, 6, 15, 11, 0, 0).unwrap())
        );
        assert_eq!(
            parse_published("2 months ago", now),
            Some(Utc.with_ymd_and_hms(2025, 4, 15, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn absolute_and_unknown_dates() {
        let now = Utc::now();
        assert_eq!(
            parse_published("2025-01-20", now),
            Some(Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap())
        );
        assert_eq!(
            parse_published("7 Feb 2025", now),
            Some(Utc.with_ymd_and_hms(2025, 2, 7, 0, 0, 0).unwrap())
        );
        assert!(parse_published("sometime last spring", now).is_none());
    }
}
