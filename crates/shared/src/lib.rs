// Public modules
pub mod config;
pub mod enricher;
pub mod logging;
pub mod models;
pub mod news;
pub mod orchestrator;
pub mod store;
pub mod view;

// Re-export commonly used types
pub use config::{Config, RefreshSettings};
pub use enricher::{fallback_summary, Enricher, GeminiEnricher, Summary};
pub use models::{Article, ArticlePatch, ArticleSet, Category};
pub use news::{FinnhubClient, NewsSource};
pub use orchestrator::{AutoRefresh, RefreshOrchestrator, RefreshOutcome, RefreshState, Snapshot, Startup};
pub use store::{ArticleStore, Listener, SqliteStore, Subscription};
pub use view::{category_counts, filter_articles, staleness, time_ago, top_symbols, Staleness, StalenessTier};
