//! Upstream history sources: HTTP client, per-family fetchers and normalization.

pub mod evm_indexer;
pub mod explorer;
mod http;
pub mod normalize;
mod source;
pub mod tezos;

pub use evm_indexer::EvmIndexerSource;
pub use explorer::ExplorerSource;
pub use http::{FetchError, HttpClient};
pub use normalize::{NormalizeError, RawPage};
pub use source::{ActivityPage, ActivitySource};
pub use tezos::TzktSource;
