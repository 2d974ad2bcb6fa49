use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::models::Article;

/// Summaries shorter than this (in characters) get rewritten
pub const MIN_SUMMARY_CHARS: usize = 50;

const MAX_IN_FLIGHT: usize = 4;

const MARKET_KEYWORDS: [&str; 5] = ["market", "stock", "price", "trading", "investment"];

/// Rewrites weak article summaries.
///
/// Output has the same length and order as the input, and every returned
/// article carries a non-empty summary.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enhance(&self, articles: Vec<Article>) -> Vec<Article>;
}

pub fn needs_enrichment(article: &Article) -> bool {
    article.summary.trim().chars().count() < MIN_SUMMARY_CHARS
}

#[derive(Debug, Clone, PartialEq)]
pub enum Summary {
    Generated(String),
    Fallback(String),
}

impl Summary {
    pub fn is_generated(&self) -> bool {
        matches!(self, Summary::Generated(_))
    }

    /// Both outcomes count as a rewrite and mark the article
    fn apply(self, article: &mut Article) {
        article.summary = match self {
            Summary::Generated(text) | Summary::Fallback(text) => text,
        };
        article.ai_summarized = true;
    }
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

pub struct GeminiEnricher {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl GeminiEnricher {
    pub fn new(
        api_key: Option<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.into(),
            model: model.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.gemini_api_key.clone(),
            config.gemini_base_url.clone(),
            config.gemini_model.clone(),
        )
    }

    pub async fn summarize_article(&self, headline: &str, content: &str) -> Summary {
        let Some(api_key) = self.api_key.as_deref() else {
            debug!("Gemini API key not configured, using fallback summary");
            return Summary::Fallback(fallback_summary(headline));
        };

        match self.try_summarize(api_key, headline, content).await {
            Ok(text) => Summary::Generated(text),
            Err(e) => {
                warn!("AI summarization failed, using fallback: {:#}", e);
                Summary::Fallback(fallback_summary(headline))
            }
        }
    }

    fn generate_url(&self, api_key: &str) -> Result<Url> {
        let mut url = Url::parse(&format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        ))
        .context("Invalid generative API base URL")?;
        url.query_pairs_mut().append_pair("key", api_key);
        Ok(url)
    }

    async fn try_summarize(&self, api_key: &str, headline: &str, content: &str) -> Result<String> {
        let content = if content.trim().is_empty() {
            headline
        } else {
            content
        };

        let prompt = format!(
            "Summarize this financial news article in exactly 2-3 concise lines that capture the key market impact and main points:\n\n\
            Headline: {}\n\
            Content: {}\n\n\
            Provide a clear, professional summary suitable for financial dashboard display.",
            headline, content
        );

        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
        };

        let response = self
            .client
            .post(self.generate_url(api_key)?)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Gemini API")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Gemini API error: {}", status);
        }

        let generated = response
            .json::<GenerateResponse>()
            .await
            .context("Failed to parse Gemini API response")?;

        let text = generated
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .map(|p| p.text.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            anyhow::bail!("Gemini API returned no summary text");
        }

        Ok(text)
    }
}

#[async_trait]
impl Enricher for GeminiEnricher {
    async fn enhance(&self, articles: Vec<Article>) -> Vec<Article> {
        let eligible = articles.iter().filter(|a| needs_enrichment(a)).count();
        if eligible == 0 {
            return articles;
        }

        info!(eligible, total = articles.len(), "Enriching article summaries");

        // `buffered` keeps results in input order
        stream::iter(articles)
            .map(|mut article| async move {
                if needs_enrichment(&article) {
                    self.summarize_article(&article.headline, &article.summary)
                        .await
                        .apply(&mut article);
                }
                article
            })
            .buffered(MAX_IN_FLIGHT)
            .collect()
            .await
    }
}

/// Deterministic templated summary used when the AI service is unavailable
pub fn fallback_summary(headline: &str) -> String {
    let has_market_terms = headline
        .to_lowercase()
        .split_whitespace()
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()))
        .any(|word| MARKET_KEYWORDS.contains(&word));

    if has_market_terms {
        "Market development with potential impact on trading activity and investor sentiment. Key financial indicators may be affected by this news.".to_string()
    } else {
        "Important financial news update with relevance to current market conditions and investment decisions.".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    const ADEQUATE: &str =
        "Federal Reserve officials held rates steady and signalled two cuts before year end.";

    fn article(id: &str, headline: &str, summary: &str) -> Article {
        let mut a = Article::new(id, headline, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        a.summary = summary.to_string();
        a
    }

    fn enricher(server: &MockServer, key: Option<&str>) -> GeminiEnricher {
        GeminiEnricher::new(key.map(str::to_string), server.base_url(), "gemini-test").unwrap()
    }

    fn mock_generate<'a>(server: &'a MockServer, text: &str) -> httpmock::Mock<'a> {
        server.mock(|when, then| {
            when.method(POST)
                .path("/models/gemini-test:generateContent")
                .query_param("key", "k");
            then.status(200).json_body(json!({
                "candidates": [{"content": {"parts": [{"text": text}]}}]
            }));
        })
    }

    #[test]
    fn test_needs_enrichment_threshold() {
        assert!(needs_enrichment(&article("a", "h", "")));
        assert!(needs_enrichment(&article("a", "h", "Too short to keep.")));
        assert!(!needs_enrichment(&article("a", "h", ADEQUATE)));
    }

    #[test]
    fn test_fallback_summary_keywords() {
        let market = fallback_summary("Stock prices slide as trading volume spikes");
        assert!(market.starts_with("Market development"));

        let general = fallback_summary("Central bank appoints new governor");
        assert!(general.starts_with("Important financial news"));

        assert!(market.chars().count() >= MIN_SUMMARY_CHARS);
        assert!(general.chars().count() >= MIN_SUMMARY_CHARS);
    }

    #[tokio::test]
    async fn test_adequate_summaries_pass_through_unchanged() {
        let server = MockServer::start();
        let mock = mock_generate(&server, "unused");
        let enricher = enricher(&server, Some("k"));

        let input = vec![article("a", "Fed holds", ADEQUATE)];
        let once = enricher.enhance(input.clone()).await;
        let twice = enricher.enhance(once.clone()).await;

        assert_eq!(once, input);
        assert_eq!(twice, once);
        mock.assert_calls(0);
    }

    #[tokio::test]
    async fn test_short_summary_rewritten_by_ai() {
        let server = MockServer::start();
        let mock = mock_generate(&server, "  Oil rose 4% on supply cuts.\nEnergy stocks led gains.  ");

        let out = enricher(&server, Some("k"))
            .enhance(vec![article("a", "Oil jumps", "")])
            .await;

        mock.assert();
        assert_eq!(out[0].summary, "Oil rose 4% on supply cuts.\nEnergy stocks led gains.");
        assert!(out[0].ai_summarized);
    }

    #[tokio::test]
    async fn test_endpoint_failure_falls_back() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/models/gemini-test:generateContent");
            then.status(503).body("unavailable");
        });

        let out = enricher(&server, Some("k"))
            .enhance(vec![article("a", "Stock market opens flat", "")])
            .await;

        assert_eq!(out[0].summary, fallback_summary("Stock market opens flat"));
        assert!(out[0].ai_summarized);
    }

    #[tokio::test]
    async fn test_empty_candidates_fall_back() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/models/gemini-test:generateContent");
            then.status(200).json_body(json!({"candidates": []}));
        });

        let out = enricher(&server, Some("k"))
            .enhance(vec![article("a", "Gold steady", "short")])
            .await;

        assert!(!out[0].summary.is_empty());
        assert!(out[0].ai_summarized);
    }

    #[tokio::test]
    async fn test_missing_key_uses_fallback_without_calls() {
        let server = MockServer::start();
        let mock = mock_generate(&server, "unused");

        let out = enricher(&server, None)
            .enhance(vec![article("a", "Gold steady", "")])
            .await;

        mock.assert_calls(0);
        assert_eq!(out[0].summary, fallback_summary("Gold steady"));
        assert!(out[0].ai_summarized);
    }

    #[tokio::test]
    async fn test_summarize_article_reports_fallback_source() {
        let server = MockServer::start();
        let _mock = mock_generate(&server, "Copper climbs on China demand.");

        let generated = enricher(&server, Some("k"))
            .summarize_article("Copper climbs", "")
            .await;
        let fallback = enricher(&server, None).summarize_article("Copper climbs", "").await;

        assert!(generated.is_generated());
        assert!(!fallback.is_generated());
        assert_eq!(fallback, Summary::Fallback(fallback_summary("Copper climbs")));
    }

    #[tokio::test]
    async fn test_enhance_preserves_order_and_count() {
        let server = MockServer::start();
        let _mock = mock_generate(&server, "Generated summary text.");

        let input: Vec<Article> = (0..10)
            .map(|i| {
                let summary = if i % 3 == 0 { ADEQUATE } else { "" };
                article(&format!("id-{}", i), &format!("Headline {}", i), summary)
            })
            .collect();

        let out = enricher(&server, Some("k")).enhance(input.clone()).await;

        assert_eq!(out.len(), input.len());
        for (before, after) in input.iter().zip(&out) {
            assert_eq!(before.id, after.id);
            if needs_enrichment(before) {
                assert_eq!(after.summary, "Generated summary text.");
                assert!(after.ai_summarized);
            } else {
                assert_eq!(before, after);
            }
        }
    }
}
