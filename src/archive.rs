//! Month-granular news archive client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ArchiveSettings;
use crate::error::{CapabilityError, TransientExternalError};
use crate::model::Article;
use crate::TARGET_WEB_REQUEST;

/// A whole month of archive is one large document.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The first month the archive covers.
const FIRST_ARCHIVE_YEAR: i32 = 1851;

#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// Every article published in the given month. A rate-limited request is
    /// reported as a transient error so the caller can retry it.
    async fn fetch_month(&self, year: i32, month: u32) -> Result<Vec<Article>, CapabilityError>;
}

/// Inclusive list of `(year, month)` pairs from `start` to `end`.
pub fn months_between(start: (i32, u32), end: (i32, u32)) -> Vec<(i32, u32)> {
    let mut months = Vec::new();
    let (mut year, mut month) = start;
    while (year, month) <= end {
        months.push((year, month));
        month += 1;
        if month > 12 {
            month = 1;
            year += 1;
        }
    }
    months
}

fn parse_pub_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn non_empty(doc: &Value, key: &str) -> Option<String> {
    doc.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn article_from_doc(doc: &Value) -> Option<Article> {
    let id = non_empty(doc, "_id").or_else(|| non_empty(doc, "uri"))?;
    let published_at = match doc.get("pub_date").and_then(Value::as_str).and_then(parse_pub_date) {
        Some(published_at) => published_at,
        None => {
            warn!(target: TARGET_WEB_REQUEST, "Skipping archive document {} without a usable pub_date", id);
            return None;
        }
    };

    let mut paragraphs: Vec<String> = Vec::new();
    for key in ["abstract", "lead_paragraph"] {
        if let Some(text) = non_empty(doc, key) {
            if !paragraphs.contains(&text) {
                paragraphs.push(text);
            }
        }
    }
    // the snippet usually repeats the abstract
    if paragraphs.is_empty() {
        paragraphs.extend(non_empty(doc, "snippet"));
    }
    if paragraphs.is_empty() {
        debug!(target: TARGET_WEB_REQUEST, "Skipping archive document {} without text", id);
        return None;
    }

    let url = non_empty(doc, "web_url").unwrap_or_default();
    let article = Article::new(id, published_at, paragraphs.join("\n\n"), url);
    let headline = doc
        .get("headline")
        .and_then(|h| non_empty(h, "main").or_else(|| non_empty(h, "print_headline")));

    Some(match headline {
        Some(headline) => article.with_headline(headline),
        None => article,
    })
}

/// Articles in an archive response, skipping documents that have no id, no
/// publication date or no text.
pub fn parse_archive_response(body: &Value) -> Vec<Article> {
    body.pointer("/response/docs")
        .and_then(Value::as_array)
        .map(|docs| docs.iter().filter_map(article_from_doc).collect())
        .unwrap_or_default()
}

fn status_error(status: StatusCode) -> CapabilityError {
    let message = format!("archive returned HTTP {}", status);
    if status == StatusCode::TOO_MANY_REQUESTS {
        TransientExternalError::RateLimited(message).into()
    } else if status.is_server_error() {
        TransientExternalError::Network(message).into()
    } else {
        CapabilityError::Hard(message)
    }
}

pub struct NytArchiveClient {
    client: reqwest::Client,
    settings: ArchiveSettings,
    last_request: Mutex<Option<Instant>>,
}

impl NytArchiveClient {
    pub fn new(settings: ArchiveSettings) -> Result<Self, CapabilityError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .redirect(reqwest::redirect::Policy::default())
            .build()
            .map_err(|e| CapabilityError::Hard(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            settings,
            last_request: Mutex::new(None),
        })
    }

    fn month_url(&self, year: i32, month: u32, api_key: &str) -> Result<Url, CapabilityError> {
        let mut url = Url::parse(self.settings.base_url.trim_end_matches('/'))
            .map_err(|e| CapabilityError::Hard(format!("invalid archive url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| CapabilityError::Hard("archive url cannot be a base".to_string()))?
            .push(&year.to_string())
            .push(&format!("{}.json", month));
        url.query_pairs_mut().append_pair("api-key", api_key);
        Ok(url)
    }

    /// Holds the caller until the configured spacing since the previous
    /// request has passed.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.settings.request_spacing;
            let now = Instant::now();
            if ready_at > now {
                debug!(target: TARGET_WEB_REQUEST, "Waiting {:?} before the next archive request", ready_at - now);
                sleep(ready_at - now).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl ArchiveSource for NytArchiveClient {
    async fn fetch_month(&self, year: i32, month: u32) -> Result<Vec<Article>, CapabilityError> {
        if !(1..=12).contains(&month) {
            return Err(CapabilityError::Hard(format!("month must be 1-12, got {}", month)));
        }
        if year < FIRST_ARCHIVE_YEAR {
            return Err(CapabilityError::Hard(format!(
                "archive starts in {}, got {}",
                FIRST_ARCHIVE_YEAR, year
            )));
        }
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .ok_or_else(|| CapabilityError::Hard("ARCHIVE_API_KEY is not set".to_string()))?;
        let url = self.month_url(year, month, api_key)?;

        self.pace().await;
        info!(target: TARGET_WEB_REQUEST, "Fetching archive for {}-{:02}", year, month);

        let response = match timeout(REQUEST_TIMEOUT, self.client.get(url).send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => {
                return Err(TransientExternalError::Timeout(REQUEST_TIMEOUT).into())
            }
            Ok(Err(e)) => return Err(TransientExternalError::Network(e.to_string()).into()),
            Err(_) => return Err(TransientExternalError::Timeout(REQUEST_TIMEOUT).into()),
        };

        if !response.status().is_success() {
            warn!(target: TARGET_WEB_REQUEST, "Archive request for {}-{:02} failed: {}", year, month, response.status());
            return Err(status_error(response.status()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TransientExternalError::Network(format!("could not read archive body: {}", e)))?;
        let articles = parse_archive_response(&body);
        info!(target: TARGET_WEB_REQUEST, "Archive {}-{:02} holds {} usable articles", year, month, articles.len());
        Ok(articles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn settings() -> ArchiveSettings {
        ArchiveSettings {
            base_url: "https://api.nytimes.com/svc/archive/v1/".to_string(),
            api_key: Some("secret key".to_string()),
            request_spacing: Duration::from_millis(0),
        }
    }

    #[test]
    fn test_parse_archive_response() {
        let body = json!({
            "copyright": "Copyright (c) 2024",
            "response": {
                "docs": [
                    {
                        "_id": "nyt://article/1",
                        "web_url": "https://www.nytimes.com/2024/01/10/nyregion/council.html",
                        "pub_date": "2024-01-10T05:00:00+0000",
                        "headline": {"main": "Council Approves Budget", "print_headline": null},
                        "abstract": "The City Council approved the budget.",
                        "snippet": "The City Council approved the budget.",
                        "lead_paragraph": "After a long debate, members voted 7 to 2."
                    },
                    {
                        "uri": "nyt://article/2",
                        "pub_date": "2024-01-11T12:30:00Z",
                        "headline": {"main": ""},
                        "lead_paragraph": "A bridge closed."
                    },
                    {"_id": "nyt://article/3", "pub_date": "2024-01-12T00:00:00+0000", "abstract": "  "},
                    {"_id": "nyt://article/4", "pub_date": "not a date", "abstract": "Text"},
                    {"pub_date": "2024-01-12T00:00:00+0000", "abstract": "No id"}
                ]
            }
        });

        let articles = parse_archive_response(&body);
        assert_eq!(articles.len(), 2);

        let first = &articles[0];
        assert_eq!(first.id, "nyt://article/1");
        assert_eq!(first.published_at, Utc.with_ymd_and_hms(2024, 1, 10, 5, 0, 0).unwrap());
        assert_eq!(first.headline.as_deref(), Some("Council Approves Budget"));
        assert_eq!(
            first.text,
            "The City Council approved the budget.\n\nAfter a long debate, members voted 7 to 2."
        );

        let second = &articles[1];
        assert_eq!(second.id, "nyt://article/2");
        assert_eq!(second.headline, None);
        assert_eq!(second.url, "");

        assert!(parse_archive_response(&json!({"fault": "bad key"})).is_empty());
    }

    #[test]
    fn test_months_between_wraps_years() {
        assert_eq!(
            months_between((2023, 11), (2024, 2)),
            vec![(2023, 11), (2023, 12), (2024, 1), (2024, 2)]
        );
        assert!(months_between((2024, 3), (2024, 2)).is_empty());
    }

    #[test]
    fn test_month_url_and_status_mapping() {
        let client = NytArchiveClient::new(settings()).unwrap();
        let url = client.month_url(2024, 3, "secret key").unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.nytimes.com/svc/archive/v1/2024/3.json?api-key=secret+key"
        );

        assert!(status_error(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(status_error(StatusCode::BAD_GATEWAY).is_transient());
        assert!(!status_error(StatusCode::UNAUTHORIZED).is_transient());
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_months() {
        let client = NytArchiveClient::new(settings()).unwrap();
        assert!(matches!(client.fetch_month(2024, 13).await, Err(CapabilityError::Hard(_))));
        assert!(matches!(client.fetch_month(1700, 1).await, Err(CapabilityError::Hard(_))));

        let keyless = NytArchiveClient::new(ArchiveSettings { api_key: None, ..settings() }).unwrap();
        assert!(matches!(keyless.fetch_month(2024, 1).await, Err(CapabilityError::Hard(_))));
    }
}
