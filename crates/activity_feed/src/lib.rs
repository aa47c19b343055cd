//! activity_feed: cached, gap-free transaction history across Tezos and EVM chains.
//!
//! Each (chain, account, asset) key pages older history from its indexer, records every
//! fetched range as a contiguous interval in a SQLite-backed cache, and serves repeat
//! requests from that cache. The feed merges all keys into one newest-first stream.
//! Read-only; no keys; no signing.

pub mod cache;
pub mod chain;
pub mod config;
pub mod digest;
pub mod feed;
pub mod model;
pub mod pointer;

pub use cache::{Interval, IntervalCache, IntervalStore};
pub use chain::{ActivityPage, ActivitySource, FetchError, HttpClient};
pub use config::FeedConfig;
pub use digest::{transcript_hash, FeedTranscript, VerificationResult};
pub use feed::{build_feed, Accounts, ActivityFeed, AssetScope, FeedBatch, LoaderSpec};
pub use model::{Activity, AssetSlug, CacheKey, ChainKey};
pub use pointer::Pointer;
