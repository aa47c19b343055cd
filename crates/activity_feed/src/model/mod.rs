//! Chain-agnostic activity model shared by every fetcher, the cache and the feed.

mod activity;
mod asset;

pub use activity::{Activity, ActivityStatus, AssetRef, ChainFamily, ChainKey, Operation, OperationKind};
pub use asset::{AssetSlug, AssetSlugError};

/// Cache and loader identity: one chain, one account, optionally one asset.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct CacheKey {
    pub chain: ChainKey,
    pub account: String,
    pub asset: Option<AssetSlug>,
}

impl CacheKey {
    pub fn new(chain: ChainKey, account: impl Into<String>, asset: Option<AssetSlug>) -> Self {
        let account = account.into();
        let account = match chain.family() {
            ChainFamily::Evm => account.to_lowercase(),
            ChainFamily::Tezos => account,
        };
        Self {
            chain,
            account,
            asset,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.chain, self.account)?;
        if let Some(asset) = &self.asset {
            write!(f, "/{}", asset)?;
        }
        Ok(())
    }
}
