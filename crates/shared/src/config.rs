use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_FINNHUB_BASE_URL: &str = "https://finnhub.io";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Timing and sizing knobs for the refresh pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshSettings {
    /// Minimum gap between two calls to the news provider
    pub rate_limit: Duration,
    /// Cap on articles returned by one provider call
    pub max_articles: usize,
    /// How often the periodic timer checks whether a refresh is due
    pub poll_interval: Duration,
    /// A periodic refresh only happens once this much time has passed
    pub min_refresh_interval: Duration,
    /// How many cached articles to load on cold start
    pub cache_limit: usize,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            rate_limit: Duration::from_millis(1000),
            max_articles: 25,
            poll_interval: Duration::from_secs(15 * 60),
            min_refresh_interval: Duration::from_secs(10 * 60),
            cache_limit: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub finnhub_api_key: Option<String>,
    pub finnhub_base_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: String,
    pub gemini_model: String,
    /// `None` means the article store is switched off
    pub store_path: Option<PathBuf>,
    pub refresh: RefreshSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::try_load_dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Missing credentials are
    /// not an error: they switch the matching feature off.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).and_then(configured);

        let defaults = RefreshSettings::default();
        let refresh = RefreshSettings {
            rate_limit: Duration::from_millis(parse_or(
                value("NEWS_RATE_LIMIT_MS"),
                "NEWS_RATE_LIMIT_MS",
                defaults.rate_limit.as_millis() as u64,
            )?),
            max_articles: parse_or(
                value("NEWS_MAX_ARTICLES"),
                "NEWS_MAX_ARTICLES",
                defaults.max_articles,
            )?,
            poll_interval: Duration::from_secs(parse_or(
                value("REFRESH_POLL_SECS"),
                "REFRESH_POLL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            min_refresh_interval: Duration::from_secs(parse_or(
                value("MIN_REFRESH_SECS"),
                "MIN_REFRESH_SECS",
                defaults.min_refresh_interval.as_secs(),
            )?),
            cache_limit: parse_or(
                value("CACHE_LOAD_LIMIT"),
                "CACHE_LOAD_LIMIT",
                defaults.cache_limit,
            )?,
        };

        if refresh.poll_interval.is_zero() {
            anyhow::bail!("REFRESH_POLL_SECS must be greater than zero");
        }

        let store_path = match value("TRENDBOARD_STORE_PATH") {
            Some(path) if path.eq_ignore_ascii_case("off") => None,
            Some(path) => Some(PathBuf::from(path)),
            None => default_store_path(),
        };

        Ok(Self {
            finnhub_api_key: value("FINNHUB_API_KEY"),
            finnhub_base_url: value("FINNHUB_BASE_URL")
                .unwrap_or_else(|| DEFAULT_FINNHUB_BASE_URL.to_string()),
            gemini_api_key: value("GEMINI_API_KEY"),
            gemini_base_url: value("GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            gemini_model: value("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            store_path,
            refresh,
        })
    }

    /// Load the first `.env` found: working directory, then
    /// `<config dir>/trendboard/.env`, then `~/.env`. None is fine.
    fn try_load_dotenv() {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded environment file");
            return;
        }

        let candidates = [
            dirs::config_dir().map(|dir| dir.join("trendboard").join(".env")),
            dirs::home_dir().map(|dir| dir.join(".env")),
        ];

        if load_first_env_file(candidates.into_iter().flatten()).is_some() {
            return;
        }

        debug!("No .env file found, using process environment only");
    }
}

/// Load the first readable file among `candidates`, returning its path
fn load_first_env_file<I>(candidates: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    for path in candidates {
        if !path.is_file() {
            continue;
        }
        match dotenvy::from_path(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Loaded environment file");
                return Some(path);
            }
            Err(e) => warn!(path = %path.display(), "Ignoring unreadable environment file: {}", e),
        }
    }
    None
}

/// Treat empty and placeholder values the same as an unset variable
fn configured(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "undefined" || trimmed == "placeholder" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{} must be a non-negative integer, got {:?}", key, raw)),
        None => Ok(default),
    }
}

fn default_store_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("trendboard").join("articles.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_missing_credentials_switch_features_off() {
        let config = config_from(&[]).unwrap();
        assert!(config.finnhub_api_key.is_none());
        assert!(config.gemini_api_key.is_none());
        assert_eq!(config.finnhub_base_url, DEFAULT_FINNHUB_BASE_URL);
        assert_eq!(config.gemini_model, DEFAULT_GEMINI_MODEL);
        assert_eq!(config.refresh, RefreshSettings::default());
    }

    #[test]
    fn test_placeholder_values_count_as_missing() {
        let config = config_from(&[
            ("FINNHUB_API_KEY", "undefined"),
            ("GEMINI_API_KEY", "placeholder"),
            ("GEMINI_MODEL", "  "),
        ])
        .unwrap();
        assert!(config.finnhub_api_key.is_none());
        assert!(config.gemini_api_key.is_none());
        assert_eq!(config.gemini_model, DEFAULT_GEMINI_MODEL);
    }

    #[test]
    fn test_store_can_be_switched_off() {
        let config = config_from(&[("TRENDBOARD_STORE_PATH", "off")]).unwrap();
        assert!(config.store_path.is_none());

        let config = config_from(&[("TRENDBOARD_STORE_PATH", "/tmp/news.db")]).unwrap();
        assert_eq!(config.store_path, Some(PathBuf::from("/tmp/news.db")));
    }

    #[test]
    fn test_refresh_settings_from_env() {
        let config = config_from(&[
            ("NEWS_RATE_LIMIT_MS", "250"),
            ("NEWS_MAX_ARTICLES", "10"),
            ("REFRESH_POLL_SECS", "60"),
            ("MIN_REFRESH_SECS", "120"),
            ("CACHE_LOAD_LIMIT", "5"),
        ])
        .unwrap();
        assert_eq!(config.refresh.rate_limit, Duration::from_millis(250));
        assert_eq!(config.refresh.max_articles, 10);
        assert_eq!(config.refresh.poll_interval, Duration::from_secs(60));
        assert_eq!(config.refresh.min_refresh_interval, Duration::from_secs(120));
        assert_eq!(config.refresh.cache_limit, 5);
    }

    #[test]
    fn test_malformed_number_names_the_variable() {
        let err = config_from(&[("NEWS_MAX_ARTICLES", "lots")]).unwrap_err();
        assert!(err.to_string().contains("NEWS_MAX_ARTICLES"));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        assert!(config_from(&[("REFRESH_POLL_SECS", "0")]).is_err());
    }

    #[test]
    fn test_first_existing_env_file_wins() {
        let dir = env::temp_dir().join(format!("trendboard-env-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let first = dir.join("first.env");
        let second = dir.join("second.env");
        std::fs::write(&first, "TRENDBOARD_TEST_ENV_ORIGIN=first\n").unwrap();
        std::fs::write(&second, "TRENDBOARD_TEST_ENV_ORIGIN=second\n").unwrap();

        let loaded = load_first_env_file(vec![dir.join("missing.env"), first.clone(), second]);

        assert_eq!(loaded, Some(first));
        assert_eq!(env::var("TRENDBOARD_TEST_ENV_ORIGIN").unwrap(), "first");
        assert_eq!(load_first_env_file(vec![dir.join("missing.env")]), None);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
