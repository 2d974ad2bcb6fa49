use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::RefreshSettings;
use crate::enricher::Enricher;
use crate::models::{Article, ArticleSet};
use crate::news::NewsSource;
use crate::store::{ArticleStore, Subscription};

pub const DEFAULT_CATEGORY: &str = "general";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Initializing,
    Refreshing,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The working set was replaced with this many fresh articles
    Updated(usize),
    /// The fetch came back empty or failed; the working set is untouched
    Unchanged,
    /// Another refresh was already running
    Skipped,
    /// Periodic check only: the minimum refresh interval has not passed
    NotDue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    /// Adopted this many cached articles without touching the network
    Cache(usize),
    /// The cache was empty, so a fresh fetch ran
    Fresh(RefreshOutcome),
}

/// What consumers see. Articles are ordered newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: RefreshState,
    pub articles: Vec<Article>,
    pub is_refreshing: bool,
    pub last_update_time: Option<DateTime<Utc>>,
}

struct Inner {
    state: RefreshState,
    articles: ArticleSet,
    /// Wall-clock time of the last fresh fetch, for display
    last_update_time: Option<DateTime<Utc>>,
    /// Monotonic time of the last fresh fetch, for scheduling
    last_refresh_at: Option<Instant>,
}

/// Keeps the displayed article set current.
///
/// Loads the cache once on startup, then refreshes from the news source on
/// demand or on a timer. At most one refresh runs at a time, and a refresh
/// that produces nothing leaves the current set in place.
pub struct RefreshOrchestrator {
    news: Arc<dyn NewsSource>,
    enricher: Arc<dyn Enricher>,
    store: Arc<dyn ArticleStore>,
    settings: RefreshSettings,
    category: String,
    refreshing: AtomicBool,
    inner: Mutex<Inner>,
    updates: watch::Sender<Snapshot>,
}

impl RefreshOrchestrator {
    pub fn new(
        news: Arc<dyn NewsSource>,
        enricher: Arc<dyn Enricher>,
        store: Arc<dyn ArticleStore>,
        settings: RefreshSettings,
    ) -> Self {
        let (updates, _) = watch::channel(Snapshot {
            state: RefreshState::Idle,
            articles: Vec::new(),
            is_refreshing: false,
            last_update_time: None,
        });

        Self {
            news,
            enricher,
            store,
            settings,
            category: DEFAULT_CATEGORY.to_string(),
            refreshing: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                state: RefreshState::Idle,
                articles: ArticleSet::default(),
                last_update_time: None,
                last_refresh_at: None,
            }),
            updates,
        }
    }

    /// Cold start. A non-empty cache is trusted as-is; only an empty one
    /// triggers a fresh fetch.
    pub async fn initialize(&self) -> Startup {
        self.set_state(RefreshState::Initializing);

        let cached = self.store.load(self.settings.cache_limit).await;
        if cached.is_empty() {
            info!("No cached articles, fetching fresh data");
            return Startup::Fresh(self.refresh_now().await);
        }

        let count = {
            let mut inner = self.inner();
            inner.articles = ArticleSet::from_articles(cached);
            inner.state = RefreshState::Ready;
            inner.articles.len()
        };
        self.publish();

        info!(count, "Loaded articles from cache");
        Startup::Cache(count)
    }

    /// Manual trigger. Dropped, not queued, when a refresh is already running.
    pub async fn refresh_now(&self) -> RefreshOutcome {
        // Claimed before the first await so two triggers in the same tick
        // cannot both get through
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Refresh already in progress, skipping");
            return RefreshOutcome::Skipped;
        }

        let _guard = RefreshGuard { orchestrator: self };
        self.set_state(RefreshState::Refreshing);

        match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("Refresh cycle panicked, keeping current articles");
                RefreshOutcome::Unchanged
            }
        }
    }

    /// One periodic check: refresh only when idle and the minimum interval
    /// since the last fresh fetch has passed.
    pub async fn tick(&self) -> RefreshOutcome {
        if self.is_refreshing() {
            return RefreshOutcome::Skipped;
        }
        if !self.is_refresh_due() {
            debug!("Periodic check: refresh not due yet");
            return RefreshOutcome::NotDue;
        }
        self.refresh_now().await
    }

    pub fn is_refresh_due(&self) -> bool {
        match self.inner().last_refresh_at {
            Some(at) => at.elapsed() > self.settings.min_refresh_interval,
            None => true,
        }
    }

    /// Run `tick` every poll interval until the handle is dropped
    pub fn spawn_auto_refresh(self: &Arc<Self>) -> AutoRefresh {
        let orchestrator = Arc::downgrade(self);
        let period = self.settings.poll_interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                let outcome = orchestrator.tick().await;
                debug!(?outcome, "Periodic refresh check");
            }
        });

        AutoRefresh { task }
    }

    /// Adopt article sets pushed by the store while no refresh is running
    pub fn follow_store(self: &Arc<Self>) -> Subscription {
        let orchestrator = Arc::downgrade(self);
        self.store.subscribe(
            self.settings.cache_limit,
            Arc::new(move |articles: Vec<Article>| {
                if let Some(orchestrator) = orchestrator.upgrade() {
                    orchestrator.adopt_pushed(articles);
                }
            }),
        )
    }

    fn adopt_pushed(&self, articles: Vec<Article>) {
        if self.is_refreshing() {
            debug!("Ignoring store push during refresh");
            return;
        }
        if articles.is_empty() {
            return;
        }

        {
            let mut inner = self.inner();
            inner.articles = ArticleSet::from_articles(articles);
        }
        self.publish();
    }

    async fn run_cycle(&self) -> RefreshOutcome {
        let fetched = self.news.fetch(&self.category).await;
        if fetched.is_empty() {
            warn!(
                kept = self.inner().articles.len(),
                "No fresh articles, keeping current set"
            );
            return RefreshOutcome::Unchanged;
        }

        let fetched_count = fetched.len();
        let enhanced = self.enricher.enhance(fetched.clone()).await;
        let articles = if enhanced.len() == fetched_count {
            enhanced
        } else {
            error!(
                fetched = fetched_count,
                enhanced = enhanced.len(),
                "Enricher changed the article count, using unenriched articles"
            );
            fetched
        };

        // Persist exactly what will be displayed, one record per id
        let set = ArticleSet::from_articles(articles);
        self.store.save(&set.sorted()).await;

        let count = {
            let mut inner = self.inner();
            inner.articles = set;
            inner.last_update_time = Some(Utc::now());
            inner.last_refresh_at = Some(Instant::now());
            inner.articles.len()
        };

        info!(count, "Refreshed articles");
        RefreshOutcome::Updated(count)
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner();
        Snapshot {
            state: inner.state,
            articles: inner.articles.sorted(),
            is_refreshing: self.is_refreshing(),
            last_update_time: inner.last_update_time,
        }
    }

    /// Receiver that sees every published snapshot
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.updates.subscribe()
    }

    pub fn articles(&self) -> Vec<Article> {
        self.inner().articles.sorted()
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.inner().last_update_time
    }

    pub fn state(&self) -> RefreshState {
        self.inner().state
    }

    fn set_state(&self, state: RefreshState) {
        self.inner().state = state;
        self.publish();
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.updates.send_replace(snapshot);
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the refresh flag on every exit path, including panics and
/// cancellation.
struct RefreshGuard<'a> {
    orchestrator: &'a RefreshOrchestrator,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.refreshing.store(false, Ordering::Release);
        self.orchestrator.set_state(RefreshState::Ready);
    }
}

/// Handle for the periodic refresh task. Dropping it stops the timer.
pub struct AutoRefresh {
    task: JoinHandle<()>,
}

impl AutoRefresh {
    pub fn stop(self) {}
}

impl Drop for AutoRefresh {
    fn drop(&mut self) {
        self.task.abort();
    }
}
