//! Turns configuration plus the user's accounts into loader specs and a ready feed.

use crate::cache::{IntervalCache, IntervalStore, StoreError};
use crate::chain::{EvmIndexerSource, ExplorerSource, FetchError, HttpClient, TzktSource};
use crate::config::{parse_base_url, ConfigError, FeedConfig};
use crate::feed::aggregator::{ActivityFeed, LoaderSpec};
use crate::model::{AssetSlug, CacheKey, ChainKey};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("http client: {0}")]
    Http(#[from] FetchError),
    #[error("cache: {0}")]
    Store(#[from] StoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("no configured source serves {0}")]
    UnknownChain(ChainKey),
}

/// The user's addresses. EVM chains share one address.
#[derive(Clone, Debug, Default)]
pub struct Accounts {
    pub tezos: Option<String>,
    pub evm: Option<String>,
}

/// Restrict the feed to one asset on one chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetScope {
    pub chain: ChainKey,
    pub asset: AssetSlug,
}

/// One loader per configured chain the user has an account on. Chains served by the
/// generic indexer are not also served by an explorer.
pub fn loader_specs(
    config: &FeedConfig,
    accounts: &Accounts,
    scope: Option<&AssetScope>,
) -> Result<Vec<LoaderSpec>, BuildError> {
    config.validate()?;
    let mut specs = Vec::new();
    let wants = |chain: &ChainKey| !matches!(scope, Some(s) if &s.chain != chain);
    let asset_for = |chain: &ChainKey| {
        scope
            .filter(|s| &s.chain == chain)
            .map(|s| s.asset.clone())
    };

    if let (Some(tezos), Some(account)) = (&config.tezos, &accounts.tezos) {
        let chain = ChainKey::Tezos(tezos.chain_id.clone());
        if wants(&chain) {
            let http = Arc::new(HttpClient::new(config.http.clone())?);
            let base = parse_base_url(&tezos.base_url)?;
            let source = TzktSource::new(http, base, tezos.chain_id.clone(), config.page_size);
            specs.push(LoaderSpec {
                key: CacheKey::new(chain.clone(), account.as_str(), asset_for(&chain)),
                source: Arc::new(source),
            });
        }
    }

    if let Some(account) = &accounts.evm {
        let mut served = HashSet::new();
        if let Some(indexer) = &config.evm_indexer {
            let http = Arc::new(HttpClient::new(config.http.clone())?);
            let base = parse_base_url(&indexer.base_url)?;
            for chain_id in &indexer.chain_ids {
                let chain = ChainKey::Evm(*chain_id);
                if !served.insert(*chain_id) || !wants(&chain) {
                    continue;
                }
                let source = EvmIndexerSource::new(
                    http.clone(),
                    base.clone(),
                    indexer.api_key.clone(),
                    *chain_id,
                    config.page_size,
                );
                specs.push(LoaderSpec {
                    key: CacheKey::new(chain.clone(), account.as_str(), asset_for(&chain)),
                    source: Arc::new(source),
                });
            }
        }
        for explorer in &config.explorers {
            let chain = ChainKey::Evm(explorer.chain_id);
            if !served.insert(explorer.chain_id) {
                debug!(chain = %chain, "chain already served by the indexer; skipping explorer");
                continue;
            }
            if !wants(&chain) {
                continue;
            }
            let http = Arc::new(HttpClient::new(config.http.clone())?);
            let base = parse_base_url(&explorer.base_url)?;
            let source = ExplorerSource::new(http, base, explorer.chain_id, config.page_size);
            specs.push(LoaderSpec {
                key: CacheKey::new(chain.clone(), account.as_str(), asset_for(&chain)),
                source: Arc::new(source),
            });
        }
    }

    if let Some(scope) = scope {
        if specs.is_empty() {
            return Err(BuildError::UnknownChain(scope.chain.clone()));
        }
    }
    Ok(specs)
}

/// Open the interval cache at `config.cache_path`, creating parent directories.
pub fn open_cache(config: &FeedConfig) -> Result<Arc<IntervalCache>, BuildError> {
    if let Some(parent) = config.cache_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = IntervalStore::open(&config.cache_path)?;
    Ok(Arc::new(IntervalCache::new(Some(store))))
}

pub fn build_feed(
    config: &FeedConfig,
    accounts: &Accounts,
    scope: Option<&AssetScope>,
) -> Result<ActivityFeed, BuildError> {
    let specs = loader_specs(config, accounts, scope)?;
    let cache = open_cache(config)?;
    info!(chains = specs.len(), cache = %config.cache_path.display(), "feed ready");
    Ok(ActivityFeed::new(cache, specs, config.max_empty_pages))
}
