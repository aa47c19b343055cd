//! Interval cache: per-key lists of contiguous fetched history, persisted in SQLite.

mod interval;
mod store;

pub use interval::Interval;
pub use store::{IntervalStore, StoreError, StoredKey};

use crate::model::CacheKey;
use crate::pointer::Pointer;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// In-memory view of the interval lists with optional durable backing.
///
/// Intervals for one key never overlap and are kept newest first. All mutation goes
/// through [`IntervalCache::extend`], which performs the read-merge-write for a key
/// under one lock.
pub struct IntervalCache {
    store: Option<IntervalStore>,
    entries: Mutex<HashMap<CacheKey, Vec<Interval>>>,
}

impl IntervalCache {
    pub fn new(store: Option<IntervalStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Memory-only cache; nothing survives the process.
    pub fn ephemeral() -> Self {
        Self::new(None)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, Vec<Interval>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Read the persisted intervals for `key` unless already loaded. Read failures
    /// leave the key cold.
    pub fn load_key(&self, key: &CacheKey) {
        let mut entries = self.entries();
        if entries.contains_key(key) {
            return;
        }
        let loaded = match &self.store {
            Some(store) => match store.load(key) {
                Ok(found) => found.unwrap_or_default(),
                Err(e) => {
                    warn!(key = %key, error = %e, "interval cache read failed; starting cold");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        debug!(key = %key, intervals = loaded.len(), "interval cache loaded");
        entries.insert(key.clone(), loaded);
    }

    pub fn intervals(&self, key: &CacheKey) -> Vec<Interval> {
        self.entries().get(key).cloned().unwrap_or_default()
    }

    /// Closest interval reaching below `at_or_below` (the newest one when absent).
    pub fn find_closest_interval(
        &self,
        key: &CacheKey,
        at_or_below: Option<&Pointer>,
    ) -> Option<Interval> {
        let entries = self.entries();
        let list = entries.get(key)?;
        match at_or_below {
            None => list.first().cloned(),
            Some(p) => list
                .iter()
                .find(|i| matches!(i.lower.compare(p), Ok(Ordering::Less)))
                .cloned(),
        }
    }

    /// True only when `interval` continues history right below `requested`, no gap.
    pub fn can_resume_from_cache(interval: &Interval, requested: &Pointer) -> bool {
        interval.covers(requested)
    }

    /// Merge a freshly fetched page into the key's intervals and persist the result.
    pub fn extend(&self, key: &CacheKey, fresh: Interval) {
        let snapshot = {
            let mut entries = self.entries();
            let list = entries.entry(key.clone()).or_default();
            let mut merged = fresh;
            let mut kept = Vec::with_capacity(list.len() + 1);
            for existing in list.drain(..) {
                if existing.touches(&merged) {
                    merged = Interval::merge(existing, merged);
                } else {
                    kept.push(existing);
                }
            }
            kept.push(merged);
            kept.sort_by(|a, b| b.upper.partial_cmp(&a.upper).unwrap_or(Ordering::Equal));
            *list = kept;
            list.clone()
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.save(key, &snapshot) {
                warn!(key = %key, error = %e, "interval cache write failed");
            }
        }
    }

    /// Forget `key` in memory and on disk.
    pub fn clear_key(&self, key: &CacheKey) {
        self.entries().remove(key);
        if let Some(store) = &self.store {
            if let Err(e) = store.clear_key(key) {
                warn!(key = %key, error = %e, "interval cache clear failed");
            }
        }
    }

    pub fn clear_all(&self) {
        self.entries().clear();
        if let Some(store) = &self.store {
            if let Err(e) = store.clear_matching("") {
                warn!(error = %e, "interval cache clear failed");
            }
        }
    }

    pub fn store(&self) -> Option<&IntervalStore> {
        self.store.as_ref()
    }
}
