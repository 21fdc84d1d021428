//! Configuration for notecount.
//!
//! Settings are layered, later layers winning:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (`--config`, or `notecount.toml` in the working directory)
//! 3. Environment variables (a `.env` file is loaded by `main`)
//! 4. Command line flags, applied by the CLI

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::api::{AnnotationApi, ApiClient, ApiError};
use crate::fetcher::{AnnotationFetcher, BulkIndexConfig, BulkIndexFetcher, FetchError, PollingFetcher};
use crate::store::{CounterStore, InMemoryCounterStore, StoreError};

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "notecount.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Where counters are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    /// Process-local; for development and tests only.
    Memory,
}

/// Runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub store: StoreBackend,
    pub redis_url: String,
    /// Root of the annotation service API; routes are discovered from it.
    pub api_url: String,
    /// Root URL of the bulk search index.
    pub index_url: String,
    pub index_name: String,
    /// Sync from the bulk search index instead of polling the search API.
    pub fetch_from_index: bool,
    pub batch_size: usize,
    pub batch_delay: Duration,
    /// Pause between indexing cycles.
    pub index_interval: Duration,
    pub profile_ttl: Duration,
    pub request_timeout: Duration,
    /// Address the HTTP server listens on.
    pub bind: String,
    /// Config file the settings were read from, if any.
    pub source_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            api_url: "http://localhost:5000/api".to_string(),
            index_url: "http://localhost:9200".to_string(),
            index_name: "hypothesis".to_string(),
            fetch_from_index: true,
            batch_size: 1000,
            batch_delay: Duration::from_millis(5000),
            index_interval: Duration::from_secs(5),
            profile_ttl: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            bind: "0.0.0.0:8001".to_string(),
            source_path: None,
        }
    }
}

/// Contents of a config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub store: Option<StoreBackend>,
    pub redis_url: Option<String>,
    pub api_url: Option<String>,
    pub elasticsearch_url: Option<String>,
    pub elasticsearch_index: Option<String>,
    pub fetch_from_elasticsearch: Option<bool>,
    pub batch_size: Option<usize>,
    pub batch_fetch_delay_ms: Option<u64>,
    pub index_interval_secs: Option<u64>,
    pub profile_cache_ttl_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub bind: Option<String>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_to_settings(self, settings: &mut Settings) {
        if let Some(store) = self.store {
            settings.store = store;
        }
        if let Some(url) = self.redis_url {
            settings.redis_url = url;
        }
        if let Some(url) = self.api_url {
            settings.api_url = url;
        }
        if let Some(url) = self.elasticsearch_url {
            settings.index_url = url;
        }
        if let Some(index) = self.elasticsearch_index {
            settings.index_name = index;
        }
        if let Some(flag) = self.fetch_from_elasticsearch {
            settings.fetch_from_index = flag;
        }
        if let Some(size) = self.batch_size {
            settings.batch_size = size;
        }
        if let Some(ms) = self.batch_fetch_delay_ms {
            settings.batch_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = self.index_interval_secs {
            settings.index_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.profile_cache_ttl_secs {
            settings.profile_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = self.request_timeout_secs {
            settings.request_timeout = Duration::from_secs(secs);
        }
        if let Some(bind) = self.bind {
            settings.bind = bind;
        }
    }
}

impl Settings {
    /// Apply environment overrides read through `lookup`.
    ///
    /// Empty values are ignored. `REDIS_HOST`/`REDIS_PORT` are accepted when
    /// `REDIS_URL` is not set.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var("REDIS_URL") {
            debug!("Using REDIS_URL from environment");
            self.redis_url = url;
        } else if var("REDIS_HOST").is_some() || var("REDIS_PORT").is_some() {
            let host = var("REDIS_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
            let port: u16 = parse_env("REDIS_PORT", var("REDIS_PORT"))?.unwrap_or(6379);
            self.redis_url = format!("redis://{}:{}", host, port);
        }
        if let Some(url) = var("H_API_URL") {
            self.api_url = url;
        }
        if let Some(url) = var("ELASTICSEARCH_URL") {
            self.index_url = url;
        }
        if let Some(index) = var("ELASTICSEARCH_INDEX") {
            self.index_name = index;
        }
        if let Some(raw) = var("FETCH_FROM_ELASTICSEARCH") {
            self.fetch_from_index = parse_bool("FETCH_FROM_ELASTICSEARCH", &raw)?;
        }
        if let Some(ms) = parse_env("BATCH_FETCH_DELAY_MS", var("BATCH_FETCH_DELAY_MS"))? {
            self.batch_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_env("INDEX_INTERVAL_SECS", var("INDEX_INTERVAL_SECS"))? {
            self.index_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env("PROFILE_CACHE_TTL_SECS", var("PROFILE_CACHE_TTL_SECS"))? {
            self.profile_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env("REQUEST_TIMEOUT_SECS", var("REQUEST_TIMEOUT_SECS"))? {
            self.request_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }

    /// Open the configured counter store.
    pub async fn create_store(&self) -> Result<Arc<dyn CounterStore>, StoreError> {
        match self.store {
            StoreBackend::Memory => {
                info!("Using in-memory counter store");
                Ok(Arc::new(InMemoryCounterStore::new()))
            }
            #[cfg(feature = "redis-backend")]
            StoreBackend::Redis => {
                info!("Using Redis server {}", self.redis_url);
                let store = crate::store::RedisCounterStore::connect(
                    &self.redis_url,
                    self.request_timeout,
                )
                .await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "redis-backend"))]
            StoreBackend::Redis => Err(StoreError::Backend(
                "Redis support not compiled in (enable the redis-backend feature)".to_string(),
            )),
        }
    }

    /// Connect to the annotation service API.
    pub async fn create_api(&self) -> Result<Arc<dyn AnnotationApi>, ApiError> {
        info!("Using annotation service {}", self.api_url);
        let client = ApiClient::connect(&self.api_url, self.request_timeout).await?;
        Ok(Arc::new(client))
    }

    /// Build the change feed the indexer syncs from.
    ///
    /// The annotation service is only contacted when polling.
    pub async fn create_fetcher(&self) -> Result<Arc<dyn AnnotationFetcher>, FetchError> {
        if self.fetch_from_index {
            info!("Syncing from search index {}/{}", self.index_url, self.index_name);
            let fetcher = BulkIndexFetcher::new(BulkIndexConfig {
                url: self.index_url.clone(),
                index: self.index_name.clone(),
                batch_size: self.batch_size,
                batch_delay: self.batch_delay,
                request_timeout: self.request_timeout,
            })?;
            Ok(Arc::new(fetcher))
        } else {
            info!("Syncing by polling the search API");
            Ok(Arc::new(PollingFetcher::new(self.create_api().await?)))
        }
    }
}

fn parse_env<T: FromStr>(key: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
    raw.map(|value| {
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value })
    })
    .transpose()
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
        }),
    }
}

/// Load settings from defaults, the config file and the environment.
///
/// An explicit `config_path` must exist; the default file is optional.
pub fn load_settings(config_path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut settings = Settings::default();

    let path = match config_path {
        Some(path) => Some(path.to_path_buf()),
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()),
    };
    if let Some(path) = path {
        debug!("Loading config from {}", path.display());
        FileConfig::from_path(&path)?.apply_to_settings(&mut settings);
        settings.source_path = Some(path);
    }

    settings.apply_env(|key| std::env::var(key).ok())?;
    Ok(settings)
}
