//! Cache-aware paging for one cache key: serve contiguous cached history, otherwise
//! fetch upstream and record the fetched interval.

use crate::cache::{Interval, IntervalCache};
use crate::chain::{ActivityPage, ActivitySource, FetchError};
use crate::model::CacheKey;
use crate::pointer::Pointer;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Fetching,
    Error,
}

pub struct Orchestrator {
    key: CacheKey,
    source: Arc<dyn ActivitySource>,
    cache: Arc<IntervalCache>,
    state: OrchestratorState,
    max_empty_pages: usize,
}

impl Orchestrator {
    /// Reads the key's persisted intervals into the cache.
    pub fn new(
        key: CacheKey,
        source: Arc<dyn ActivitySource>,
        cache: Arc<IntervalCache>,
        max_empty_pages: usize,
    ) -> Self {
        cache.load_key(&key);
        Self {
            key,
            source,
            cache,
            state: OrchestratorState::Idle,
            max_empty_pages: max_empty_pages.max(1),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// The page strictly below `resume` (the newest page when `None`).
    ///
    /// On error nothing is recorded; the caller keeps its pointer and retries from it.
    pub async fn next_page(
        &mut self,
        resume: Option<&Pointer>,
        cancel: &CancellationToken,
    ) -> Result<ActivityPage, FetchError> {
        let genesis = self.source.genesis();
        let mut cursor = resume.cloned();

        if let Some(mut p) = cursor.take() {
            let mut served = Vec::new();
            loop {
                if p == genesis {
                    return Ok(ActivityPage {
                        activities: served,
                        next_pointer: None,
                        reached_end: true,
                    });
                }
                let Some(interval) = self.cache.find_closest_interval(&self.key, Some(&p)) else {
                    break;
                };
                if !IntervalCache::can_resume_from_cache(&interval, &p) {
                    debug!(key = %self.key, pointer = %p, upper = %interval.upper, "cached interval not contiguous");
                    break;
                }
                served.extend(interval.older_than(&p));
                p = interval.lower;
            }
            if !served.is_empty() {
                debug!(key = %self.key, count = served.len(), "served from cache");
                self.state = OrchestratorState::Idle;
                return Ok(ActivityPage {
                    activities: served,
                    next_pointer: Some(p),
                    reached_end: false,
                });
            }
            cursor = Some(p);
        }

        self.state = OrchestratorState::Fetching;
        let mut empty_pages = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(FetchError::Cancelled),
                r = self.source.fetch_page(
                    &self.key.account,
                    self.key.asset.as_ref(),
                    cursor.as_ref(),
                    cancel,
                ) => r,
            };
            let page = match result {
                Ok(page) if cancel.is_cancelled() => {
                    debug!(key = %self.key, count = page.activities.len(), "dropping page fetched after cancellation");
                    self.state = OrchestratorState::Idle;
                    return Err(FetchError::Cancelled);
                }
                Ok(page) => page,
                Err(FetchError::Cancelled) => {
                    self.state = OrchestratorState::Idle;
                    return Err(FetchError::Cancelled);
                }
                Err(FetchError::Offline) if cursor.is_none() => {
                    if let Some(page) = self.cached_head(&genesis) {
                        debug!(key = %self.key, count = page.activities.len(), "offline; serving newest cached interval");
                        self.state = OrchestratorState::Idle;
                        return Ok(page);
                    }
                    self.state = OrchestratorState::Error;
                    return Err(FetchError::Offline);
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "fetch failed");
                    self.state = OrchestratorState::Error;
                    return Err(e);
                }
            };
            self.record(cursor.as_ref(), &page, &genesis);
            empty_pages += 1;
            let exhausted = page.reached_end || page.next_pointer.is_none();
            if !page.activities.is_empty() || exhausted || empty_pages >= self.max_empty_pages {
                self.state = OrchestratorState::Idle;
                return Ok(page);
            }
            debug!(key = %self.key, pointer = ?page.next_pointer, "empty page; continuing");
            cursor = page.next_pointer;
        }
    }

    /// The newest cached interval as a head page.
    fn cached_head(&self, genesis: &Pointer) -> Option<ActivityPage> {
        let newest = self.cache.find_closest_interval(&self.key, None)?;
        let reached_end = newest.lower == *genesis;
        Some(ActivityPage {
            activities: newest.activities,
            next_pointer: (!reached_end).then_some(newest.lower),
            reached_end,
        })
    }

    fn record(&self, requested: Option<&Pointer>, page: &ActivityPage, genesis: &Pointer) {
        let upper = match (requested, page.activities.first()) {
            (Some(p), _) => p.clone(),
            (None, Some(newest)) => newest.pointer.clone(),
            (None, None) => return,
        };
        let lower = match (&page.next_pointer, page.reached_end) {
            (Some(next), false) => next.clone(),
            _ => genesis.clone(),
        };
        self.cache.extend(
            &self.key,
            Interval {
                upper,
                lower,
                activities: page.activities.clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::testing::{act, ScriptedSource};
    use crate::model::ChainKey;

    fn key() -> CacheKey {
        CacheKey::new(ChainKey::Evm(1), "0xaa", None)
    }

    #[tokio::test]
    async fn network_page_is_recorded_and_replayed_without_fetching() {
        let cache = Arc::new(IntervalCache::ephemeral());
        let cancel = CancellationToken::new();
        let source = Arc::new(ScriptedSource::evm(vec![vec![50, 40, 30], vec![20, 10]]));
        let mut orch = Orchestrator::new(key(), source.clone(), cache.clone(), 3);

        let head = orch.next_page(None, &cancel).await.unwrap();
        assert_eq!(head.activities.len(), 3);
        let second = orch.next_page(head.next_pointer.as_ref(), &cancel).await.unwrap();
        assert!(second.reached_end);
        assert_eq!(source.calls(), 2);

        // Resume from the head page's pointer on a second instance: cache only.
        let replay_source = Arc::new(ScriptedSource::evm(vec![]));
        let mut replay = Orchestrator::new(key(), replay_source.clone(), cache.clone(), 3);
        let page = replay.next_page(head.next_pointer.as_ref(), &cancel).await.unwrap();
        assert_eq!(page.activities, second.activities);
        assert!(page.reached_end);
        assert_eq!(replay_source.calls(), 0);
    }

    #[tokio::test]
    async fn gap_forces_network_fetch() {
        let cache = Arc::new(IntervalCache::ephemeral());
        cache.extend(
            &key(),
            Interval {
                upper: Pointer::EvmBlock { height: 20 },
                lower: Pointer::EvmBlock { height: 10 },
                activities: vec![act(15), act(10)],
            },
        );
        let source = Arc::new(ScriptedSource::evm(vec![vec![28, 25]]));
        let mut orch = Orchestrator::new(key(), source.clone(), cache, 3);
        let page = orch
            .next_page(Some(&Pointer::EvmBlock { height: 30 }), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(source.calls(), 1);
        let heights: Vec<u64> = page.activities.iter().map(|a| a.block_height).collect();
        assert_eq!(heights, vec![28, 25]);
    }

    #[tokio::test]
    async fn genesis_pointer_skips_network() {
        let source = Arc::new(ScriptedSource::evm(vec![vec![1]]));
        let mut orch = Orchestrator::new(key(), source.clone(), Arc::new(IntervalCache::ephemeral()), 1);
        let page = orch
            .next_page(Some(&Pointer::EvmBlock { height: 0 }), &CancellationToken::new())
            .await
            .unwrap();
        assert!(page.reached_end);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn failure_records_nothing_and_sets_error_state() {
        let cache = Arc::new(IntervalCache::ephemeral());
        let source = Arc::new(ScriptedSource::failing());
        let mut orch = Orchestrator::new(key(), source, cache.clone(), 1);
        assert!(orch.next_page(None, &CancellationToken::new()).await.is_err());
        assert_eq!(orch.state(), OrchestratorState::Error);
        assert!(cache.intervals(&key()).is_empty());
    }

    #[tokio::test]
    async fn cancelled_fetch_does_not_touch_cache() {
        let cache = Arc::new(IntervalCache::ephemeral());
        let source = Arc::new(ScriptedSource::evm(vec![vec![5, 4]]));
        let mut orch = Orchestrator::new(key(), source, cache.clone(), 1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            orch.next_page(None, &cancel).await,
            Err(FetchError::Cancelled)
        ));
        assert!(cache.intervals(&key()).is_empty());
    }

    #[tokio::test]
    async fn offline_head_falls_back_to_newest_interval() {
        let cache = Arc::new(IntervalCache::ephemeral());
        cache.extend(
            &key(),
            Interval {
                upper: Pointer::EvmBlock { height: 9 },
                lower: Pointer::EvmBlock { height: 4 },
                activities: vec![act(9), act(6)],
            },
        );
        let mut orch = Orchestrator::new(key(), Arc::new(ScriptedSource::offline()), cache, 1);
        let cancel = CancellationToken::new();
        let head = orch.next_page(None, &cancel).await.unwrap();
        assert_eq!(head.activities.len(), 2);
        assert_eq!(head.next_pointer, Some(Pointer::EvmBlock { height: 4 }));
        assert!(matches!(
            orch.next_page(head.next_pointer.as_ref(), &cancel).await,
            Err(FetchError::Offline)
        ));

        let mut cold = Orchestrator::new(
            key(),
            Arc::new(ScriptedSource::offline()),
            Arc::new(IntervalCache::ephemeral()),
            1,
        );
        assert!(matches!(cold.next_page(None, &cancel).await, Err(FetchError::Offline)));
    }

    #[tokio::test]
    async fn empty_pages_are_walked_through() {
        let source = Arc::new(ScriptedSource::evm(vec![vec![], vec![], vec![7, 6]]));
        let mut orch = Orchestrator::new(key(), source.clone(), Arc::new(IntervalCache::ephemeral()), 5);
        let page = orch.next_page(None, &CancellationToken::new()).await.unwrap();
        assert_eq!(page.activities.len(), 2);
        assert_eq!(source.calls(), 3);
    }
}
