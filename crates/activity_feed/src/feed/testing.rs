//! Scripted activity source for feed tests.

use crate::chain::{ActivityPage, ActivitySource, FetchError};
use crate::model::{Activity, ActivityStatus, AssetSlug, ChainKey};
use crate::pointer::Pointer;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Activity at block `height` on `chain`, timestamped `height` seconds after the epoch.
pub fn act_on(chain: &ChainKey, height: u64) -> Activity {
    Activity {
        chain: chain.clone(),
        hash: format!("{}-{}", chain, height),
        added_at: OffsetDateTime::from_unix_timestamp(height as i64).unwrap(),
        status: ActivityStatus::Applied,
        block_height: height,
        index: 0,
        pointer: Pointer::EvmBlock { height },
        operations: Vec::new(),
    }
}

pub fn act(height: u64) -> Activity {
    act_on(&ChainKey::Evm(1), height)
}

enum Step {
    Page(ActivityPage),
    Fail,
    Offline,
}

/// Replays a fixed list of pages in order regardless of the requested pointer, then
/// reports the end. Each non-final page points just above the next non-empty page.
pub struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedSource {
    pub fn chain(chain: ChainKey, pages: Vec<Vec<u64>>) -> Self {
        let count = pages.len();
        let mut steps = VecDeque::new();
        for (i, heights) in pages.iter().enumerate() {
            let activities: Vec<Activity> = heights.iter().map(|h| act_on(&chain, *h)).collect();
            let last = i + 1 == count;
            let next_pointer = if last {
                None
            } else {
                let below = pages[i + 1..]
                    .iter()
                    .flatten()
                    .max()
                    .copied()
                    .unwrap_or(0);
                Some(Pointer::EvmBlock { height: below + 1 })
            };
            steps.push_back(Step::Page(ActivityPage {
                activities,
                next_pointer,
                reached_end: last,
            }));
        }
        Self {
            steps: Mutex::new(steps),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn evm(pages: Vec<Vec<u64>>) -> Self {
        Self::chain(ChainKey::Evm(1), pages)
    }

    /// Fails on every call.
    pub fn failing() -> Self {
        Self {
            steps: Mutex::new(VecDeque::from([Step::Fail])),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Behaves like a source whose HTTP client is in offline mode.
    pub fn offline() -> Self {
        Self {
            steps: Mutex::new(VecDeque::from([Step::Offline])),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Fails once, then serves `pages`.
    pub fn flaky(chain: ChainKey, pages: Vec<Vec<u64>>) -> Self {
        let source = Self::chain(chain, pages);
        source.steps.lock().unwrap().push_front(Step::Fail);
        source
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActivitySource for ScriptedSource {
    fn genesis(&self) -> Pointer {
        Pointer::EvmBlock { height: 0 }
    }

    async fn fetch_page(
        &self,
        _account: &str,
        _asset: Option<&AssetSlug>,
        _older_than: Option<&Pointer>,
        _cancel: &CancellationToken,
    ) -> Result<ActivityPage, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut steps = self.steps.lock().unwrap();
        match steps.front() {
            Some(Step::Offline) => return Err(FetchError::Offline),
            Some(Step::Fail) if steps.len() == 1 => {
                return Err(FetchError::Api(503, "scripted failure".into()))
            }
            _ => {}
        }
        match steps.pop_front() {
            Some(Step::Page(page)) => Ok(page),
            Some(Step::Fail) => Err(FetchError::Api(503, "scripted failure".into())),
            Some(Step::Offline) => Err(FetchError::Offline),
            None => Ok(ActivityPage::end()),
        }
    }
}
