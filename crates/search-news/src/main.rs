use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use shared::store::DEFAULT_SEARCH_LIMIT;
use shared::{category_counts, staleness, time_ago, top_symbols, ArticleStore, Config, SqliteStore};

#[derive(Parser)]
#[command(name = "search-news")]
#[command(about = "Search cached financial news without touching the network")]
struct Args {
    /// Text to look for in headline, summary or source
    #[arg(default_value = "")]
    term: String,

    /// Category to filter by (market, ipo, earnings, crypto, ...; "all" for every category)
    #[arg(short, long, default_value = "all")]
    category: String,

    /// Maximum number of stored articles to scan
    #[arg(short, long, default_value_t = DEFAULT_SEARCH_LIMIT)]
    limit: usize,

    /// Print category and ticker breakdowns
    #[arg(short, long)]
    stats: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    shared::logging::init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let store = SqliteStore::open(config.store_path.as_deref());
    if !store.is_available() {
        anyhow::bail!(
            "Article store is not available. Set TRENDBOARD_STORE_PATH or run refresh-news first."
        );
    }

    println!("🔍 Searching stored articles...");
    let articles = store
        .search(&args.term, Some(&args.category), args.limit)
        .await;

    if articles.is_empty() {
        println!("No articles match.");
        return Ok(());
    }

    let now = Utc::now();
    let newest = articles.iter().filter_map(|a| a.updated_at).max();
    println!(
        "✓ {} articles (store updated {})",
        articles.len(),
        staleness(newest, now).text
    );

    for article in &articles {
        println!(
            "\n[{}] {}",
            article.display_category().as_str().to_uppercase(),
            article.headline
        );
        println!("   {} · {}", article.source, time_ago(article.datetime, now));
        if let Some(link) = article.link() {
            println!("   {}", link);
        }
    }

    if args.stats {
        println!("\n📊 Categories:");
        for (category, count) in category_counts(&articles) {
            let share = count as f64 * 100.0 / articles.len() as f64;
            println!("  {:<12} {:>3} ({:.1}%)", category, count, share);
        }

        println!("\n📈 Top symbols:");
        for (symbol, count) in top_symbols(&articles, 10) {
            println!("  {:<8} {:>3}", symbol, count);
        }
    }

    Ok(())
}
