//! Read-only helpers for whatever renders the article set: staleness
//! labels, relative times, search/category filtering and chart counts.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::models::Article;

/// Severity of the "updated Xm ago" indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StalenessTier {
    Live,
    Recent,
    Normal,
    Old,
    VeryOld,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staleness {
    pub text: String,
    pub tier: StalenessTier,
}

impl Staleness {
    fn new(text: impl Into<String>, tier: StalenessTier) -> Self {
        Self {
            text: text.into(),
            tier,
        }
    }
}

/// Describe how long ago the last fresh fetch happened.
///
/// No fetch yet reads as live, the same as a fetch that just finished.
pub fn staleness(last_update: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Staleness {
    let Some(last_update) = last_update else {
        return Staleness::new("Just now", StalenessTier::Live);
    };

    let elapsed = now.signed_duration_since(last_update);
    let seconds = elapsed.num_seconds().max(0);
    let minutes = elapsed.num_minutes().max(0);
    let hours = elapsed.num_hours().max(0);

    if seconds < 30 {
        Staleness::new("Just now", StalenessTier::Live)
    } else if minutes < 1 {
        Staleness::new(format!("{}s ago", seconds), StalenessTier::Live)
    } else if minutes < 5 {
        Staleness::new(format!("{}m ago", minutes), StalenessTier::Recent)
    } else if minutes < 60 {
        Staleness::new(format!("{}m ago", minutes), StalenessTier::Normal)
    } else if hours < 24 {
        Staleness::new(format!("{}h ago", hours), StalenessTier::Old)
    } else {
        Staleness::new(
            last_update.format("%-d %b %Y").to_string(),
            StalenessTier::VeryOld,
        )
    }
}

/// Relative age of an article for card display
pub fn time_ago(datetime: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let hours = now.signed_duration_since(datetime).num_hours();
    if hours < 1 {
        "Just now".to_string()
    } else if hours < 24 {
        format!("{}h ago", hours)
    } else {
        format!("{}d ago", hours / 24)
    }
}

/// Case-insensitive match on headline, summary or source. An empty term
/// matches everything.
pub fn matches_term(article: &Article, term: &str) -> bool {
    let term = term.trim().to_lowercase();
    if term.is_empty() {
        return true;
    }

    [&article.headline, &article.summary, &article.source]
        .iter()
        .any(|field| field.to_lowercase().contains(&term))
}

/// Apply the category filter (`all` or empty disables it), then the search term
pub fn filter_articles<'a>(articles: &'a [Article], term: &str, category: &str) -> Vec<&'a Article> {
    let category = category.trim();
    let any_category = category.is_empty() || category.eq_ignore_ascii_case("all");

    articles
        .iter()
        .filter(|a| any_category || a.category.eq_ignore_ascii_case(category))
        .filter(|a| matches_term(a, term))
        .collect()
}

/// Article count per stored category, largest first
pub fn category_counts(articles: &[Article]) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for article in articles {
        let category = if article.category.is_empty() {
            "general"
        } else {
            article.category.as_str()
        };
        *counts.entry(category.to_string()).or_default() += 1;
    }
    sorted_counts(counts)
}

/// Most mentioned ticker symbols, largest first
pub fn top_symbols(articles: &[Article], limit: usize) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for symbol in articles.iter().flat_map(|a| &a.symbols) {
        *counts.entry(symbol.clone()).or_default() += 1;
    }
    let mut sorted = sorted_counts(counts);
    sorted.truncate(limit);
    sorted
}

fn sorted_counts(counts: HashMap<String, usize>) -> Vec<(String, usize)> {
    let mut sorted: Vec<(String, usize)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted
}
