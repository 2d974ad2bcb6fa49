use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One news item as the dashboard sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: String,
    pub headline: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub datetime: DateTime<Utc>,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub ai_summarized: bool,
    /// Set by the store on first insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Set by the store on every write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_category() -> String {
    Category::General.as_str().to_string()
}

impl Article {
    pub fn new(
        id: impl Into<String>,
        headline: impl Into<String>,
        datetime: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            headline: headline.into(),
            summary: String::new(),
            source: String::new(),
            provider: String::new(),
            category: default_category(),
            datetime,
            symbols: Vec::new(),
            url: None,
            image: None,
            ai_summarized: false,
            created_at: None,
            updated_at: None,
        }
    }

    /// The outbound link, treating `#` as "no link"
    pub fn link(&self) -> Option<&str> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty() && *url != "#")
    }

    /// Category used for display. The stored string is never rewritten.
    pub fn display_category(&self) -> Category {
        Category::from_label(&self.category)
    }
}

/// Partial article document used for upsert-merge writes.
///
/// Only `id` is required; every field left as `None` keeps whatever the
/// store already holds for that article.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticlePatch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_summarized: Option<bool>,
}

impl ArticlePatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

impl From<&Article> for ArticlePatch {
    fn from(article: &Article) -> Self {
        Self {
            id: article.id.clone(),
            headline: Some(article.headline.clone()),
            summary: Some(article.summary.clone()),
            source: Some(article.source.clone()),
            provider: Some(article.provider.clone()),
            category: Some(article.category.clone()),
            datetime: Some(article.datetime),
            symbols: Some(article.symbols.clone()),
            url: article.url.clone(),
            image: article.image.clone(),
            ai_summarized: Some(article.ai_summarized),
        }
    }
}

/// Known article categories. Anything else displays as `General`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Market,
    Ipo,
    Earnings,
    Crypto,
    Commodities,
    Monetary,
    General,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Market,
        Category::Ipo,
        Category::Earnings,
        Category::Crypto,
        Category::Commodities,
        Category::Monetary,
        Category::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Market => "market",
            Category::Ipo => "ipo",
            Category::Earnings => "earnings",
            Category::Crypto => "crypto",
            Category::Commodities => "commodities",
            Category::Monetary => "monetary",
            Category::General => "general",
        }
    }

    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == label)
            .unwrap_or(Category::General)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The orchestrator's working set: articles keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArticleSet {
    articles: HashMap<String, Article>,
}

impl ArticleSet {
    /// Build a set from a sequence. When an id repeats, the first
    /// occurrence wins.
    pub fn from_articles(articles: impl IntoIterator<Item = Article>) -> Self {
        let mut map = HashMap::new();
        for article in articles {
            map.entry(article.id.clone()).or_insert(article);
        }
        Self { articles: map }
    }

    pub fn len(&self) -> usize {
        self.articles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Article> {
        self.articles.get(id)
    }

    /// Articles ordered most recent first, ties broken by id
    pub fn sorted(&self) -> Vec<Article> {
        let mut list: Vec<Article> = self.articles.values().cloned().collect();
        sort_newest_first(&mut list);
        list
    }
}

pub fn sort_newest_first(articles: &mut [Article]) {
    articles.sort_by(|a, b| b.datetime.cmp(&a.datetime).then_with(|| a.id.cmp(&b.id)));
}
