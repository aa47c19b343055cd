//! Contiguous, gap-free slices of already-fetched history.

use crate::model::Activity;
use crate::pointer::Pointer;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Every upstream activity positioned in `[lower, upper]` is present in `activities`,
/// newest first. `upper` may be the exclusive bound the page was requested with; the
/// record sitting exactly on it then belongs to the neighbouring interval above.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub upper: Pointer,
    pub lower: Pointer,
    pub activities: Vec<Activity>,
}

impl Interval {
    /// True when `self` and `other` overlap or share a bound.
    pub fn touches(&self, other: &Interval) -> bool {
        let below = self.lower.compare(&other.upper);
        let above = other.lower.compare(&self.upper);
        matches!(
            (below, above),
            (Ok(Ordering::Less | Ordering::Equal), Ok(Ordering::Less | Ordering::Equal))
        )
    }

    /// Whether the interval holds the history right below `requested` without a gap.
    pub fn covers(&self, requested: &Pointer) -> bool {
        matches!(
            self.upper.compare(requested),
            Ok(Ordering::Greater | Ordering::Equal)
        ) && matches!(self.lower.compare(requested), Ok(Ordering::Less))
    }

    /// Activities positioned strictly below `pointer`, newest first.
    pub fn older_than(&self, pointer: &Pointer) -> Vec<Activity> {
        self.activities
            .iter()
            .filter(|a| matches!(a.pointer.compare(pointer), Ok(Ordering::Less)))
            .cloned()
            .collect()
    }

    /// Union of two touching intervals. Records from `newer` win on duplicate hashes.
    pub fn merge(older: Interval, newer: Interval) -> Interval {
        let upper = max_pointer(older.upper, newer.upper);
        let lower = min_pointer(older.lower, newer.lower);
        let mut seen = HashSet::new();
        let mut activities: Vec<Activity> = newer
            .activities
            .into_iter()
            .chain(older.activities)
            .filter(|a| seen.insert(a.hash.clone()))
            .collect();
        Activity::sort_newest_first(&mut activities);
        Interval {
            upper,
            lower,
            activities,
        }
    }
}

fn max_pointer(a: Pointer, b: Pointer) -> Pointer {
    match a.compare(&b) {
        Ok(Ordering::Less) => b,
        _ => a,
    }
}

fn min_pointer(a: Pointer, b: Pointer) -> Pointer {
    match a.compare(&b) {
        Ok(Ordering::Greater) => b,
        _ => a,
    }
}
