//! Cross-chain merge: one loader per cache key, released newest first behind a shared
//! timestamp edge so no later batch can hold anything newer than an earlier one.

use crate::cache::IntervalCache;
use crate::chain::{ActivitySource, FetchError};
use crate::feed::orchestrator::Orchestrator;
use crate::model::{Activity, CacheKey};
use crate::pointer::Pointer;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A cache key and the source that serves it.
#[derive(Clone)]
pub struct LoaderSpec {
    pub key: CacheKey,
    pub source: Arc<dyn ActivitySource>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChainFailure {
    pub key: String,
    pub message: String,
}

/// Result of one [`ActivityFeed::load_next`] call.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FeedBatch {
    /// Newest first; every entry is newer than anything a later batch returns.
    pub activities: Vec<Activity>,
    pub reached_end: bool,
    /// Chains currently in error.
    pub failures: Vec<ChainFailure>,
    /// Another call will re-attempt the failed chains.
    pub retryable: bool,
}

/// Per-chain progress, for status display.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoaderStatus {
    pub key: String,
    pub buffered: usize,
    pub released: usize,
    pub reached_end: bool,
    pub last_error: Option<String>,
}

struct Loader {
    orchestrator: Orchestrator,
    /// Fetched but not yet released, newest first.
    buffer: Vec<Activity>,
    seen: HashSet<String>,
    released: usize,
    resume: Option<Pointer>,
    reached_end: bool,
    last_error: Option<FetchError>,
}

impl Loader {
    fn new(spec: LoaderSpec, cache: Arc<IntervalCache>, max_empty_pages: usize) -> Self {
        Self {
            orchestrator: Orchestrator::new(spec.key, spec.source, cache, max_empty_pages),
            buffer: Vec::new(),
            seen: HashSet::new(),
            released: 0,
            resume: None,
            reached_end: false,
            last_error: None,
        }
    }

    fn live(&self) -> bool {
        !self.reached_end && self.last_error.is_none()
    }

    fn oldest_buffered(&self) -> Option<OffsetDateTime> {
        self.buffer.last().map(|a| a.added_at)
    }

    fn status(&self) -> LoaderStatus {
        LoaderStatus {
            key: self.orchestrator.key().to_string(),
            buffered: self.buffer.len(),
            released: self.released,
            reached_end: self.reached_end,
            last_error: self.last_error.as_ref().map(|e| e.to_string()),
        }
    }
}

struct Session {
    loaders: Vec<Loader>,
    released_any: bool,
}

impl Session {
    fn new(specs: &[LoaderSpec], cache: &Arc<IntervalCache>, max_empty_pages: usize) -> Self {
        Self {
            loaders: specs
                .iter()
                .cloned()
                .map(|spec| Loader::new(spec, cache.clone(), max_empty_pages))
                .collect(),
            released_any: false,
        }
    }
}

/// Paged, newest-first activity feed across every configured chain.
pub struct ActivityFeed {
    cache: Arc<IntervalCache>,
    max_empty_pages: usize,
    specs: Mutex<Vec<LoaderSpec>>,
    session: tokio::sync::Mutex<Session>,
    cancel: Mutex<CancellationToken>,
}

impl ActivityFeed {
    pub fn new(cache: Arc<IntervalCache>, specs: Vec<LoaderSpec>, max_empty_pages: usize) -> Self {
        let session = Session::new(&specs, &cache, max_empty_pages);
        Self {
            cache,
            max_empty_pages,
            specs: Mutex::new(specs),
            session: tokio::sync::Mutex::new(session),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn cache(&self) -> &Arc<IntervalCache> {
        &self.cache
    }

    fn token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Next batch, or `None` when a load is already running or the session was reset
    /// while this one was in flight.
    pub async fn load_next(&self) -> Option<FeedBatch> {
        let Ok(mut session) = self.session.try_lock() else {
            debug!("load already in flight; ignoring");
            return None;
        };
        let cancel = self.token();
        let batch = advance(&mut session, &cancel).await;
        if batch.is_none() {
            debug!("load cancelled by reset");
        }
        batch
    }

    /// Drop all in-memory progress and restart from the newest activity. Any in-flight
    /// load is cancelled and its results discarded. The persisted cache is kept.
    pub async fn reset(&self) {
        let specs = match self.specs.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        self.restart(specs).await;
    }

    /// Reset onto a different set of chains or accounts.
    pub async fn reset_with(&self, specs: Vec<LoaderSpec>) {
        match self.specs.lock() {
            Ok(mut guard) => *guard = specs.clone(),
            Err(poisoned) => *poisoned.into_inner() = specs.clone(),
        }
        self.restart(specs).await;
    }

    async fn restart(&self, specs: Vec<LoaderSpec>) {
        {
            let mut token = match self.cancel.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            token.cancel();
            *token = CancellationToken::new();
        }
        let mut session = self.session.lock().await;
        *session = Session::new(&specs, &self.cache, self.max_empty_pages);
        info!(chains = specs.len(), "feed reset");
    }

    /// Per-chain progress; `None` while a load is running.
    pub fn statuses(&self) -> Option<Vec<LoaderStatus>> {
        let session = self.session.try_lock().ok()?;
        Some(session.loaders.iter().map(Loader::status).collect())
    }
}

async fn advance(session: &mut Session, cancel: &CancellationToken) -> Option<FeedBatch> {
    if !session.released_any {
        for loader in &mut session.loaders {
            if let Some(e) = loader.last_error.take() {
                debug!(key = %loader.orchestrator.key(), error = %e, "retrying failed chain");
            }
        }
    }

    let edge_before = session
        .loaders
        .iter()
        .filter(|l| l.live())
        .filter_map(Loader::oldest_buffered)
        .max();
    let wanted: Vec<bool> = session
        .loaders
        .iter()
        .map(|l| l.live() && (l.buffer.is_empty() || l.oldest_buffered() == edge_before))
        .collect();

    let fetches = session
        .loaders
        .iter_mut()
        .zip(wanted)
        .filter(|(_, wanted)| *wanted)
        .map(|(loader, _)| async move {
            let result = loader
                .orchestrator
                .next_page(loader.resume.as_ref(), cancel)
                .await;
            (loader, result)
        });
    let results = join_all(fetches).await;
    if cancel.is_cancelled() {
        return None;
    }

    for (loader, result) in results {
        match result {
            Ok(page) => {
                for activity in page.activities {
                    if loader.seen.insert(activity.hash.clone()) {
                        loader.buffer.push(activity);
                    }
                }
                loader.reached_end = page.reached_end || page.next_pointer.is_none();
                if page.next_pointer.is_some() {
                    loader.resume = page.next_pointer;
                }
            }
            Err(FetchError::Cancelled) => return None,
            Err(e) => {
                warn!(key = %loader.orchestrator.key(), error = %e, "chain failed; continuing with the rest");
                loader.last_error = Some(e);
            }
        }
    }

    let mut edge: Option<OffsetDateTime> = None;
    let mut waiting = false;
    for loader in session.loaders.iter().filter(|l| l.live()) {
        match loader.oldest_buffered() {
            Some(t) => edge = edge.max(Some(t)),
            None => waiting = true,
        }
    }

    let mut activities = Vec::new();
    if !waiting {
        for loader in &mut session.loaders {
            let take = match edge {
                Some(edge) => loader
                    .buffer
                    .iter()
                    .take_while(|a| a.added_at > edge)
                    .count(),
                None => loader.buffer.len(),
            };
            loader.released += take;
            activities.extend(loader.buffer.drain(..take));
        }
    }
    activities.sort_by(|a, b| b.added_at.cmp(&a.added_at));
    if !activities.is_empty() {
        session.released_any = true;
    }

    let failures: Vec<ChainFailure> = session
        .loaders
        .iter()
        .filter_map(|l| {
            l.last_error.as_ref().map(|e| ChainFailure {
                key: l.orchestrator.key().to_string(),
                message: e.to_string(),
            })
        })
        .collect();
    let retryable = !failures.is_empty() && !session.released_any;
    let reached_end = !retryable
        && session
            .loaders
            .iter()
            .all(|l| !l.live() && l.buffer.is_empty());

    info!(
        released = activities.len(),
        failed = failures.len(),
        reached_end,
        "feed batch"
    );
    Some(FeedBatch {
        activities,
        reached_end,
        failures,
        retryable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::testing::ScriptedSource;
    use crate::model::ChainKey;
    use std::time::Duration;

    fn spec(chain: ChainKey, source: Arc<ScriptedSource>) -> LoaderSpec {
        LoaderSpec {
            key: CacheKey::new(chain, "0xaa", None),
            source,
        }
    }

    fn stamps(batch: &FeedBatch) -> Vec<i64> {
        batch
            .activities
            .iter()
            .map(|a| a.added_at.unix_timestamp())
            .collect()
    }

    #[tokio::test]
    async fn merges_chains_behind_the_edge() {
        let a = Arc::new(ScriptedSource::chain(ChainKey::Evm(1), vec![vec![10, 8, 6], vec![2]]));
        let b = Arc::new(ScriptedSource::chain(ChainKey::Evm(2), vec![vec![9, 7], vec![3]]));
        let feed = ActivityFeed::new(
            Arc::new(IntervalCache::ephemeral()),
            vec![spec(ChainKey::Evm(1), a.clone()), spec(ChainKey::Evm(2), b.clone())],
            3,
        );

        let first = feed.load_next().await.unwrap();
        assert_eq!(stamps(&first), vec![10, 9, 8]);
        assert!(!first.reached_end);

        // Only chain B (oldest buffered 7) limits the edge.
        let second = feed.load_next().await.unwrap();
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 2);
        assert_eq!(stamps(&second), vec![7]);

        let third = feed.load_next().await.unwrap();
        assert_eq!(stamps(&third), vec![6, 3, 2]);
        assert!(third.reached_end);
    }

    #[tokio::test]
    async fn no_chains_reports_end() {
        let feed = ActivityFeed::new(Arc::new(IntervalCache::ephemeral()), Vec::new(), 3);
        let batch = feed.load_next().await.unwrap();
        assert!(batch.activities.is_empty());
        assert!(batch.reached_end);
    }

    #[tokio::test]
    async fn failing_chain_does_not_block_the_others() {
        let a = Arc::new(ScriptedSource::chain(ChainKey::Evm(1), vec![vec![10, 8], vec![5]]));
        let b = Arc::new(ScriptedSource::failing());
        let feed = ActivityFeed::new(
            Arc::new(IntervalCache::ephemeral()),
            vec![spec(ChainKey::Evm(1), a), spec(ChainKey::Evm(2), b.clone())],
            3,
        );
        let first = feed.load_next().await.unwrap();
        assert_eq!(stamps(&first), vec![10]);
        assert_eq!(first.failures.len(), 1);
        assert!(!first.retryable);
        assert!(!first.reached_end);

        let second = feed.load_next().await.unwrap();
        assert_eq!(stamps(&second), vec![8, 5]);
        assert!(second.reached_end);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn total_failure_is_retryable_until_something_loads() {
        let a = Arc::new(ScriptedSource::flaky(ChainKey::Evm(1), vec![vec![4, 3]]));
        let feed = ActivityFeed::new(
            Arc::new(IntervalCache::ephemeral()),
            vec![spec(ChainKey::Evm(1), a.clone())],
            3,
        );
        let first = feed.load_next().await.unwrap();
        assert!(first.activities.is_empty());
        assert!(first.retryable);
        assert!(!first.reached_end);

        let second = feed.load_next().await.unwrap();
        assert_eq!(stamps(&second), vec![4, 3]);
        assert!(second.failures.is_empty());
        assert!(second.reached_end);
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_load_is_a_no_op() {
        let a = Arc::new(
            ScriptedSource::chain(ChainKey::Evm(1), vec![vec![2, 1]])
                .with_delay(Duration::from_millis(20)),
        );
        let feed = ActivityFeed::new(
            Arc::new(IntervalCache::ephemeral()),
            vec![spec(ChainKey::Evm(1), a.clone())],
            3,
        );
        let (first, second) = tokio::join!(feed.load_next(), feed.load_next());
        assert_eq!(stamps(&first.unwrap()), vec![2, 1]);
        assert!(second.is_none());
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn reset_cancels_in_flight_load_without_caching() {
        let cache = Arc::new(IntervalCache::ephemeral());
        let a = Arc::new(
            ScriptedSource::chain(ChainKey::Evm(1), vec![vec![2, 1]])
                .with_delay(Duration::from_secs(30)),
        );
        let key = CacheKey::new(ChainKey::Evm(1), "0xaa", None);
        let feed = Arc::new(ActivityFeed::new(
            cache.clone(),
            vec![spec(ChainKey::Evm(1), a)],
            3,
        ));
        let in_flight = tokio::spawn({
            let feed = feed.clone();
            async move { feed.load_next().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        feed.reset().await;
        assert!(in_flight.await.unwrap().is_none());
        assert!(cache.intervals(&key).is_empty());
    }

    #[tokio::test]
    async fn reset_restarts_from_newest_using_the_cache() {
        let cache = Arc::new(IntervalCache::ephemeral());
        let a = Arc::new(ScriptedSource::chain(ChainKey::Evm(1), vec![vec![9, 8], vec![4]]));
        let feed = ActivityFeed::new(cache, vec![spec(ChainKey::Evm(1), a.clone())], 3);
        assert_eq!(stamps(&feed.load_next().await.unwrap()), vec![9]);
        assert_eq!(stamps(&feed.load_next().await.unwrap()), vec![8, 4]);
        assert_eq!(a.calls(), 2);

        // The head page is requested again; everything older comes from the cache.
        let fresh = Arc::new(ScriptedSource::chain(ChainKey::Evm(1), vec![vec![9, 8], vec![4]]));
        feed.reset_with(vec![spec(ChainKey::Evm(1), fresh.clone())]).await;
        assert_eq!(stamps(&feed.load_next().await.unwrap()), vec![9]);
        let rest = feed.load_next().await.unwrap();
        assert_eq!(stamps(&rest), vec![8, 4]);
        assert!(rest.reached_end);
        assert_eq!(fresh.calls(), 1);
    }
}
