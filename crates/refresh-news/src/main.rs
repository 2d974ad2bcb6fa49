use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use shared::{
    staleness, time_ago, Article, Config, FinnhubClient, GeminiEnricher, RefreshOrchestrator,
    RefreshOutcome, Snapshot, SqliteStore, Startup,
};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "refresh-news")]
#[command(about = "Fetch, enrich and cache financial news for the Trendboard dashboard")]
struct Args {
    /// Keep running: refresh on the polling timer and print each update
    #[arg(short, long)]
    watch: bool,

    /// Skip the cache on startup and fetch fresh articles immediately
    #[arg(short, long)]
    force: bool,

    /// Maximum number of articles to print
    #[arg(short, long, default_value = "25")]
    limit: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    shared::logging::init();

    let args = Args::parse();
    let config = Config::from_env()?;

    if config.finnhub_api_key.is_none() {
        println!("⚠ FINNHUB_API_KEY not set: fresh news is switched off, showing cache only");
    }
    if config.gemini_api_key.is_none() {
        println!("⚠ GEMINI_API_KEY not set: short summaries get template text");
    }

    let news = Arc::new(FinnhubClient::from_config(&config)?);
    let enricher = Arc::new(GeminiEnricher::from_config(&config)?);
    let store = Arc::new(SqliteStore::open(config.store_path.as_deref()));

    let orchestrator = Arc::new(RefreshOrchestrator::new(
        news,
        enricher,
        store,
        config.refresh.clone(),
    ));

    println!("\n📚 Loading articles...");
    if args.force {
        let outcome = orchestrator.refresh_now().await;
        report_refresh(outcome);
    } else {
        match orchestrator.initialize().await {
            Startup::Cache(count) => println!("✓ Loaded {} cached articles", count),
            Startup::Fresh(outcome) => report_refresh(outcome),
        }
    }

    print_snapshot(&orchestrator.snapshot(), args.limit);

    if !args.watch {
        return Ok(());
    }

    println!(
        "\n🔁 Watching for updates every {}s (Ctrl-C to stop)...",
        config.refresh.poll_interval.as_secs()
    );

    let mut updates = orchestrator.watch();
    let _auto_refresh = orchestrator.spawn_auto_refresh();
    let _follow = orchestrator.follow_store();
    let mut last_printed = orchestrator.last_update_time();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n✅ Stopped.");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.is_refreshing {
                    tracing::debug!("Refresh in progress");
                    continue;
                }
                if snapshot.last_update_time != last_printed {
                    last_printed = snapshot.last_update_time;
                    print_snapshot(&snapshot, args.limit);
                }
            }
        }
    }

    Ok(())
}

fn report_refresh(outcome: RefreshOutcome) {
    match outcome {
        RefreshOutcome::Updated(count) => println!("✓ Fetched {} fresh articles", count),
        RefreshOutcome::Unchanged => println!("⚠ No fresh articles available"),
        RefreshOutcome::Skipped | RefreshOutcome::NotDue => {}
    }
}

fn print_snapshot(snapshot: &Snapshot, limit: usize) {
    let now = Utc::now();
    let updated = staleness(snapshot.last_update_time, now);

    println!(
        "\n📰 {} articles (updated {})",
        snapshot.articles.len(),
        updated.text
    );

    for article in snapshot.articles.iter().take(limit) {
        print_article(article, now);
    }
}

fn print_article(article: &Article, now: chrono::DateTime<Utc>) {
    let marker = if article.ai_summarized { "✨" } else { "  " };
    println!(
        "\n{} [{}] {}",
        marker,
        article.display_category().as_str().to_uppercase(),
        article.headline
    );
    println!(
        "   {} · {}",
        article.source,
        time_ago(article.datetime, now)
    );
    if !article.symbols.is_empty() {
        println!("   {}", article.symbols.join(", "));
    }
    if !article.summary.is_empty() {
        println!("   {}", article.summary);
    }
    if let Some(link) = article.link() {
        println!("   {}", link);
    }
}
