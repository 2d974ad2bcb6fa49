use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

use crate::models::{Article, ArticlePatch};
use crate::view::matches_term;

pub const DEFAULT_LOAD_LIMIT: usize = 50;
pub const DEFAULT_SEARCH_LIMIT: usize = 100;

/// Callback receiving the newest `limit` articles after each write
pub type Listener = Arc<dyn Fn(Vec<Article>) + Send + Sync>;

/// Persistent article cache.
///
/// When the store is unavailable every operation is a no-op: `save` does
/// nothing and `load` returns nothing. Write failures are logged, never
/// returned.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    fn is_available(&self) -> bool;

    /// Field-level merge of each patch into the stored document with that id
    async fn upsert(&self, patches: Vec<ArticlePatch>);

    async fn save(&self, articles: &[Article]) {
        self.upsert(articles.iter().map(ArticlePatch::from).collect())
            .await
    }

    /// Up to `limit` articles, most recent first
    async fn load(&self, limit: usize) -> Vec<Article>;

    /// Push the newest `limit` articles to `listener` after every write,
    /// until the returned handle is dropped.
    fn subscribe(&self, limit: usize, listener: Listener) -> Subscription;
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: HashMap<u64, (usize, Listener)>,
}

/// Observer list shared between a store and its subscription handles
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<Mutex<Registry>>,
}

impl Listeners {
    pub fn register(&self, limit: usize, listener: Listener) -> Subscription {
        let Ok(mut registry) = self.inner.lock() else {
            return Subscription::detached();
        };
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.insert(id, (limit, listener));

        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn active(&self) -> Vec<(usize, Listener)> {
        self.inner
            .lock()
            .map(|registry| registry.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().map(|r| r.entries.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unsubscribe handle. Dropping it deregisters the listener.
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// A handle that is not attached to any store
    pub fn detached() -> Self {
        Self {
            id: 0,
            registry: Weak::new(),
        }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut registry) = registry.lock() {
                registry.entries.remove(&self.id);
            }
        }
    }
}

/// SQLite-backed document store. Each article is a JSON document keyed by
/// id, with the sort and filter columns pulled out alongside it.
pub struct SqliteStore {
    conn: Option<Arc<Mutex<Connection>>>,
    listeners: Listeners,
}

impl SqliteStore {
    /// Open the store at `path`. Availability is decided here, once: a
    /// missing path or a database that cannot be opened yields an
    /// unavailable store rather than an error.
    pub fn open(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            info!("Article store not configured, running without cache");
            return Self::unavailable();
        };

        match Self::try_open(path) {
            Ok(store) => {
                info!(path = %path.display(), "Article store ready");
                store
            }
            Err(e) => {
                warn!(path = %path.display(), "Article store unavailable: {:#}", e);
                Self::unavailable()
            }
        }
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory article store")?;
        Self::from_connection(conn)
    }

    pub fn unavailable() -> Self {
        Self {
            conn: None,
            listeners: Listeners::default(),
        }
    }

    fn try_open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create article store directory")?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open article store: {}", path.display()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS articles (
                 id TEXT PRIMARY KEY,
                 doc TEXT NOT NULL,
                 category TEXT,
                 datetime_ms INTEGER,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_articles_datetime ON articles (datetime_ms DESC);",
        )
        .context("Failed to initialize article store schema")?;

        Ok(Self {
            conn: Some(Arc::new(Mutex::new(conn))),
            listeners: Listeners::default(),
        })
    }

    /// Articles matching `term` (headline, summary or source) within
    /// `category`, newest first. `None` or `all` means every category.
    pub async fn search(&self, term: &str, category: Option<&str>, limit: usize) -> Vec<Article> {
        if !self.is_available() {
            return Vec::new();
        }

        let category = category
            .map(str::trim)
            .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case("all"))
            .map(str::to_string);

        let candidates = match self
            .with_conn(move |conn| query_articles(conn, category.as_deref(), limit))
            .await
        {
            Ok(articles) => articles,
            Err(e) => {
                error!("Article search failed: {:#}", e);
                return Vec::new();
            }
        };

        candidates
            .into_iter()
            .filter(|article| matches_term(article, term))
            .collect()
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone().context("Article store unavailable")?;
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("Article store connection poisoned"))?;
            op(&mut *guard)
        })
        .await
        .context("Article store task failed")?
    }

    async fn notify_listeners(&self) {
        for (limit, listener) in self.listeners.active() {
            let snapshot = self.load(limit).await;
            listener(snapshot);
        }
    }
}

#[async_trait]
impl ArticleStore for SqliteStore {
    fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    async fn upsert(&self, patches: Vec<ArticlePatch>) {
        if !self.is_available() {
            debug!("Article store unavailable, skipping save");
            return;
        }
        if patches.is_empty() {
            return;
        }

        let total = patches.len();
        let now = Utc::now();
        match self
            .with_conn(move |conn| upsert_documents(conn, &patches, now))
            .await
        {
            Ok(saved) => {
                info!(saved, total, "Saved articles to store");
                if saved > 0 {
                    self.notify_listeners().await;
                }
            }
            Err(e) => error!("Error saving articles: {:#}", e),
        }
    }

    async fn load(&self, limit: usize) -> Vec<Article> {
        if !self.is_available() {
            return Vec::new();
        }

        match self.with_conn(move |conn| query_articles(conn, None, limit)).await {
            Ok(articles) => articles,
            Err(e) => {
                error!("Error loading articles: {:#}", e);
                Vec::new()
            }
        }
    }

    fn subscribe(&self, limit: usize, listener: Listener) -> Subscription {
        if !self.is_available() {
            return Subscription::detached();
        }
        self.listeners.register(limit, listener)
    }
}

/// Merge every patch inside one transaction. Rejected patches are logged
/// and skipped; the rest commit.
fn upsert_documents(conn: &mut Connection, patches: &[ArticlePatch], now: DateTime<Utc>) -> Result<usize> {
    let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    let tx = conn.transaction().context("Failed to start article store transaction")?;

    let mut saved = 0;
    for patch in patches {
        match upsert_one(&tx, patch, &timestamp) {
            Ok(()) => saved += 1,
            Err(e) => warn!(id = %patch.id, "Article write rejected: {:#}", e),
        }
    }

    tx.commit().context("Failed to commit article store transaction")?;
    Ok(saved)
}

fn upsert_one(tx: &rusqlite::Transaction<'_>, patch: &ArticlePatch, timestamp: &str) -> Result<()> {
    if patch.id.trim().is_empty() {
        anyhow::bail!("article id is empty");
    }

    let existing: Option<String> = tx
        .query_row("SELECT doc FROM articles WHERE id = ?1", params![patch.id], |row| row.get(0))
        .optional()
        .context("Failed to read stored article")?;

    let mut doc = match existing {
        Some(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        None => Map::new(),
    };

    let Value::Object(incoming) = serde_json::to_value(patch).context("Failed to encode article")? else {
        anyhow::bail!("article did not encode to an object");
    };
    // Last write wins per field; fields absent from the patch are kept
    doc.extend(incoming);

    let datetime_ms = doc
        .get("datetime")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis());
    let category = doc.get("category").and_then(Value::as_str).map(str::to_string);
    let body = Value::Object(doc).to_string();

    tx.execute(
        "INSERT INTO articles (id, doc, category, datetime_ms, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(id) DO UPDATE SET
             doc = excluded.doc,
             category = excluded.category,
             datetime_ms = excluded.datetime_ms,
             updated_at = excluded.updated_at",
        params![patch.id, body, category, datetime_ms, timestamp],
    )
    .context("Failed to write article")?;

    Ok(())
}

fn query_articles(conn: &mut Connection, category: Option<&str>, limit: usize) -> Result<Vec<Article>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn
        .prepare(
            "SELECT id, doc, created_at, updated_at FROM articles
             WHERE datetime_ms IS NOT NULL
               AND (?1 IS NULL OR lower(category) = lower(?1))
             ORDER BY datetime_ms DESC, id ASC
             LIMIT ?2",
        )
        .context("Failed to prepare article query")?;

    let rows = stmt
        .query_map(params![category, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .context("Failed to query articles")?;

    let mut articles = Vec::new();
    for row in rows {
        let (id, doc, created_at, updated_at) = row.context("Failed to read article row")?;
        match decode_document(&doc, &created_at, &updated_at) {
            Ok(article) => articles.push(article),
            Err(e) => warn!(id = %id, "Skipping unreadable stored article: {:#}", e),
        }
    }

    Ok(articles)
}

fn decode_document(doc: &str, created_at: &str, updated_at: &str) -> Result<Article> {
    let mut value: Value = serde_json::from_str(doc).context("Stored document is not JSON")?;
    if let Value::Object(map) = &mut value {
        map.insert("createdAt".to_string(), Value::String(created_at.to_string()));
        map.insert("updatedAt".to_string(), Value::String(updated_at.to_string()));
    }
    serde_json::from_value(value).context("Stored document is not a complete article")
}
