//! The paged feed: per-key orchestrators merged across chains.

mod aggregator;
mod builder;
mod orchestrator;
#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::{ActivityFeed, ChainFailure, FeedBatch, LoaderSpec, LoaderStatus};
pub use builder::{build_feed, loader_specs, open_cache, Accounts, AssetScope, BuildError};
pub use orchestrator::{Orchestrator, OrchestratorState};
