//! Feed configuration: upstream endpoints, HTTP behaviour and cache location.
//!
//! Load from: env `ACTIVITY_FEED_CONFIG_PATH`, or `./config/activity_feed.json`, or
//! `./activity_feed.json`. Missing fields take their defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

const DEFAULT_TZKT_URL: &str = "https://api.tzkt.io";
const DEFAULT_TEZOS_CHAIN_ID: &str = "NetXdQprcVkpaWU";
const DEFAULT_ETHERLINK_EXPLORER: &str = "https://explorer.etherlink.com/api";
const ETHERLINK_CHAIN_ID: u64 = 42793;
const DEFAULT_PAGE_SIZE: usize = 50;
const DEFAULT_MAX_EMPTY_PAGES: usize = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid url {0}: {1}")]
    Url(String, url::ParseError),
    #[error("page_size must be at least 1")]
    PageSize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    /// Minimum spacing between two requests of one client.
    pub rate_limit_ms: u64,
    /// Retries inside one request; 0 leaves transient failures to the next load.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub offline: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            rate_limit_ms: 200,
            max_retries: 0,
            retry_backoff_ms: 500,
            offline: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TezosConfig {
    pub base_url: String,
    pub chain_id: String,
}

impl Default for TezosConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_TZKT_URL.to_string(),
            chain_id: DEFAULT_TEZOS_CHAIN_ID.to_string(),
        }
    }
}

/// Generic EVM indexer serving several chains from one endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EvmIndexerConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub chain_ids: Vec<u64>,
}

/// Block explorer for one EVM chain the generic indexer does not cover.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExplorerConfig {
    pub chain_id: u64,
    pub base_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub cache_path: PathBuf,
    pub page_size: usize,
    /// Consecutive fully-filtered pages an orchestrator walks through per request.
    pub max_empty_pages: usize,
    pub http: HttpConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tezos: Option<TezosConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evm_indexer: Option<EvmIndexerConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub explorers: Vec<ExplorerConfig>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from("./data/cache/activity.sqlite"),
            page_size: DEFAULT_PAGE_SIZE,
            max_empty_pages: DEFAULT_MAX_EMPTY_PAGES,
            http: HttpConfig::default(),
            tezos: Some(TezosConfig::default()),
            evm_indexer: None,
            explorers: vec![ExplorerConfig {
                chain_id: ETHERLINK_CHAIN_ID,
                base_url: DEFAULT_ETHERLINK_EXPLORER.to_string(),
            }],
        }
    }
}

impl FeedConfig {
    /// Load and validate config from path.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config: env ACTIVITY_FEED_CONFIG_PATH, then ./config/activity_feed.json,
    /// then ./activity_feed.json. Falls back to defaults when none is usable.
    pub fn load() -> Self {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(path) = std::env::var("ACTIVITY_FEED_CONFIG_PATH") {
            candidates.push(PathBuf::from(path));
        }
        candidates.push(PathBuf::from("./config/activity_feed.json"));
        candidates.push(PathBuf::from("./activity_feed.json"));
        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }
            match Self::load_from_path(&candidate) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %candidate.display(), error = %e, "ignoring config file");
                }
            }
        }
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::PageSize);
        }
        let mut urls: Vec<&str> = Vec::new();
        if let Some(t) = &self.tezos {
            urls.push(&t.base_url);
        }
        if let Some(e) = &self.evm_indexer {
            urls.push(&e.base_url);
        }
        urls.extend(self.explorers.iter().map(|e| e.base_url.as_str()));
        for u in urls {
            parse_base_url(u)?;
        }
        Ok(())
    }
}

pub(crate) fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::Url(raw.to_string(), e))
}
