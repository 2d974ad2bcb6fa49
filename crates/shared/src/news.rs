use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{Config, RefreshSettings};
use crate::models::{sort_newest_first, Article};

pub const PROVIDER: &str = "finnhub";

/// Read side of the news provider.
///
/// Failures never cross this boundary: a failed call is an empty result.
#[async_trait]
pub trait NewsSource: Send + Sync {
    async fn fetch(&self, category: &str) -> Vec<Article>;
}

#[derive(Debug, Deserialize)]
struct FinnhubItem {
    id: Option<i64>,
    headline: Option<String>,
    summary: Option<String>,
    source: Option<String>,
    url: Option<String>,
    image: Option<String>,
    datetime: Option<i64>,
    related: Option<String>,
}

pub struct FinnhubClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    rate_limit: Duration,
    max_articles: usize,
    last_request: Mutex<Option<Instant>>,
}

impl FinnhubClient {
    pub fn new(
        api_key: Option<String>,
        base_url: impl Into<String>,
        settings: &RefreshSettings,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.into(),
            rate_limit: settings.rate_limit,
            max_articles: settings.max_articles,
            last_request: Mutex::new(None),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.finnhub_api_key.clone(),
            config.finnhub_base_url.clone(),
            &config.refresh,
        )
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Fetch several categories one after another, merged newest first.
    /// Ids seen in an earlier category win over later duplicates.
    pub async fn fetch_all(&self, categories: &[&str]) -> Vec<Article> {
        if !self.is_configured() {
            debug!("News provider not configured, skipping fetch_all");
            return Vec::new();
        }

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for category in categories {
            for article in self.fetch(category).await {
                if seen.insert(article.id.clone()) {
                    merged.push(article);
                }
            }
        }

        sort_newest_first(&mut merged);
        merged
    }

    /// Block until the inter-request floor has passed, then claim the slot
    async fn wait_for_slot(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.rate_limit;
            if Instant::now() < ready_at {
                debug!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "Rate limit floor, waiting");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn news_url(&self, category: &str, api_key: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/api/v1/news", self.base_url.trim_end_matches('/')))
            .context("Invalid news provider base URL")?;
        url.query_pairs_mut()
            .append_pair("category", category)
            .append_pair("token", api_key);
        Ok(url)
    }

    /// `Ok(None)` means the provider throttled the request
    async fn try_fetch(&self, category: &str, api_key: &str) -> Result<Option<Vec<Article>>> {
        let url = self.news_url(category, api_key)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to fetch news from Finnhub")?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(None);
        }

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("unknown error"));
            anyhow::bail!("Finnhub API returned error: {} - {}", status, error_text);
        }

        let items = response
            .json::<Vec<FinnhubItem>>()
            .await
            .context("Failed to parse Finnhub API response")?;

        let articles: Vec<Article> = items
            .into_iter()
            .filter_map(|item| normalize(item, category))
            .take(self.max_articles)
            .collect();

        Ok(Some(articles))
    }
}

#[async_trait]
impl NewsSource for FinnhubClient {
    async fn fetch(&self, category: &str) -> Vec<Article> {
        let Some(api_key) = self.api_key.as_deref() else {
            debug!(category, "News provider not configured, skipping fetch");
            return Vec::new();
        };

        self.wait_for_slot().await;

        match self.try_fetch(category, api_key).await {
            Ok(Some(articles)) => {
                info!(category, count = articles.len(), "Fetched news");
                articles
            }
            Ok(None) => {
                warn!(category, "Finnhub rate limit hit, returning no articles");
                Vec::new()
            }
            Err(e) => {
                error!(category, "News fetch failed: {:#}", e);
                Vec::new()
            }
        }
    }
}

fn normalize(item: FinnhubItem, category: &str) -> Option<Article> {
    let headline = item.headline.map(|h| h.trim().to_string()).filter(|h| !h.is_empty())?;

    let Some(datetime) = item.datetime.and_then(epoch_to_utc) else {
        debug!(headline = %headline, "Dropping article without a usable timestamp");
        return None;
    };

    let id = match item.id {
        Some(id) => id.to_string(),
        None => synthesize_id(&headline, datetime),
    };

    let symbols = item
        .related
        .as_deref()
        .map(split_symbols)
        .unwrap_or_default();

    Some(Article {
        id,
        headline,
        summary: item.summary.unwrap_or_default(),
        source: item
            .source
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "Finnhub".to_string()),
        provider: PROVIDER.to_string(),
        category: category.to_string(),
        datetime,
        symbols,
        url: item.url.filter(|u| !u.trim().is_empty()),
        image: item.image.filter(|i| !i.trim().is_empty()),
        ai_summarized: false,
        created_at: None,
        updated_at: None,
    })
}

fn epoch_to_utc(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

fn split_symbols(related: &str) -> Vec<String> {
    related
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Stable id for items the provider sent without one
fn synthesize_id(headline: &str, datetime: DateTime<Utc>) -> String {
    let digest = Sha256::digest(format!("{}|{}", headline, datetime.timestamp()).as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", PROVIDER, hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, MockServer};
    use serde_json::json;

    fn settings() -> RefreshSettings {
        RefreshSettings {
            rate_limit: Duration::ZERO,
            ..RefreshSettings::default()
        }
    }

    fn client(server: &MockServer, key: Option<&str>) -> FinnhubClient {
        FinnhubClient::new(key.map(str::to_string), server.base_url(), &settings()).unwrap()
    }

    fn item(id: i64, headline: &str, datetime: i64) -> serde_json::Value {
        json!({
            "category": "top news",
            "datetime": datetime,
            "headline": headline,
            "id": id,
            "image": "",
            "related": "",
            "source": "Reuters",
            "summary": "",
            "url": "https://example.com/story"
        })
    }

    #[tokio::test]
    async fn test_no_credential_makes_no_network_call() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/api/v1/news");
            then.status(200).json_body(json!([]));
        });

        let news = client(&server, None);
        assert!(!news.is_configured());
        assert!(news.fetch("general").await.is_empty());
        assert!(news.fetch_all(&["general", "forex"]).await.is_empty());
        mock.assert_calls(0);
    }

    #[tokio::test]
    async fn test_unreachable_provider_returns_empty() {
        let news = FinnhubClient::new(
            Some("secret".to_string()),
            "http://127.0.0.1:9",
            &settings(),
        )
        .unwrap();

        assert!(news.fetch("general").await.is_empty());
        assert!(news.fetch_all(&["general", "forex"]).await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_normalizes_provider_fields() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/news")
                .query_param("category", "general")
                .query_param("token", "secret");
            then.status(200).json_body(json!([{
                "category": "top news",
                "datetime": 1735689600,
                "headline": "Stocks rally into the new year",
                "id": 7421,
                "image": "https://img.example.com/1.jpg",
                "related": "AAPL, MSFT,,NVDA",
                "source": "",
                "url": "https://example.com/rally"
            }]));
        });

        let articles = client(&server, Some("secret")).fetch("general").await;
        mock.assert();

        assert_eq!(articles.len(), 1);
        let a = &articles[0];
        assert_eq!(a.id, "7421");
        assert_eq!(a.summary, "");
        assert_eq!(a.source, "Finnhub");
        assert_eq!(a.provider, "finnhub");
        assert_eq!(a.category, "general");
        assert_eq!(a.symbols, vec!["AAPL", "MSFT", "NVDA"]);
        assert_eq!(a.datetime.to_rfc3339(), "2025-01-01T00:00:00+00:00");
        assert_eq!(a.image.as_deref(), Some("https://img.example.com/1.jpg"));
        assert!(!a.ai_summarized);
    }

    #[tokio::test]
    async fn test_fetch_drops_items_without_headline_or_time() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/news");
            then.status(200).json_body(json!([
                {"id": 1, "headline": "", "datetime": 1735689600},
                {"id": 2, "headline": "No time"},
                {"id": 3, "headline": "Kept", "datetime": 1735689600}
            ]));
        });

        let articles = client(&server, Some("k")).fetch("general").await;
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].id, "3");
    }

    #[tokio::test]
    async fn test_missing_id_is_synthesized_stably() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/news");
            then.status(200)
                .json_body(json!([{"headline": "Oil jumps", "datetime": 1735689600}]));
        });

        let news = client(&server, Some("k"));
        let first = news.fetch("general").await;
        let second = news.fetch("general").await;

        assert_eq!(first.len(), 1);
        assert!(first[0].id.starts_with("finnhub-"));
        assert_eq!(first[0].id, second[0].id);
    }

    #[tokio::test]
    async fn test_fetch_caps_article_count() {
        let server = MockServer::start();
        let items: Vec<_> = (0..40).map(|i| item(i, &format!("Story {}", i), 1735689600 + i)).collect();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/news");
            then.status(200).json_body(serde_json::Value::Array(items));
        });

        let articles = client(&server, Some("k")).fetch("general").await;
        assert_eq!(articles.len(), 25);
    }

    #[tokio::test]
    async fn test_rate_limited_response_is_empty_without_retry() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/api/v1/news");
            then.status(429).body("Too Many Requests");
        });

        let articles = client(&server, Some("k")).fetch("general").await;
        assert!(articles.is_empty());
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn test_server_error_is_empty() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/news");
            then.status(500).body("boom");
        });

        assert!(client(&server, Some("k")).fetch("general").await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_empty() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/news");
            then.status(200).body("{\"error\": \"not a list\"}");
        });

        assert!(client(&server, Some("k")).fetch("general").await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_all_merges_dedups_and_sorts() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/news").query_param("category", "general");
            then.status(200).json_body(json!([
                item(1, "Older general", 1735689600),
                item(2, "Shared story", 1735776000)
            ]));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/news").query_param("category", "crypto");
            then.status(200).json_body(json!([
                item(2, "Shared story", 1735776000),
                item(3, "Newest crypto", 1735862400)
            ]));
        });

        let articles = client(&server, Some("k")).fetch_all(&["general", "crypto"]).await;
        let ids: Vec<&str> = articles.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2", "1"]);
        assert_eq!(articles[1].category, "general");
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_calls_respect_rate_floor() {
        let settings = RefreshSettings {
            rate_limit: Duration::from_millis(1000),
            ..RefreshSettings::default()
        };
        let news = FinnhubClient::new(Some("k".to_string()), "http://127.0.0.1:9", &settings).unwrap();

        let start = Instant::now();
        news.wait_for_slot().await;
        assert!(start.elapsed() < Duration::from_millis(1000));

        news.wait_for_slot().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));

        news.wait_for_slot().await;
        assert!(start.elapsed() >= Duration::from_millis(2000));
    }

    #[test]
    fn test_news_url_encodes_query() {
        let news = FinnhubClient::new(None, "https://finnhub.io/", &settings()).unwrap();
        let url = news.news_url("general", "a&b").unwrap();
        assert_eq!(url.as_str(), "https://finnhub.io/api/v1/news?category=general&token=a%26b");
    }
}
