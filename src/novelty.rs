//! Deduplication and state-update engine
//!
//! Given a freshly fetched item batch and the persisted state of one target,
//! decide which items are new and what state to persist next. Pure: no I/O,
//! no failure modes on well-formed input. Everything the scheduler commits
//! and fans out derives from this one function.

use crate::fetch::Item;
use crate::store::TargetState;
use std::collections::HashSet;

/// Bounds applied by [`compute_novelty`]
#[derive(Debug, Clone, Copy)]
pub struct NoveltyCaps {
    /// Maximum items reported on the first-ever poll of a target
    pub first_poll_cap: usize,
    /// Bound on the persisted last-seen id set
    pub max_seen_ids: usize,
}

impl Default for NoveltyCaps {
    fn default() -> Self {
        Self {
            first_poll_cap: 3,
            max_seen_ids: 200,
        }
    }
}

/// Result of one novelty computation
#[derive(Debug, Clone)]
pub struct Novelty {
    /// New items in ascending publication order (stable on input order)
    pub new_items: Vec<Item>,
    /// The state to persist for the next cycle
    pub state: TargetState,
}

/// Compute the new-item subset of `fetched` relative to `prior`, and the
/// updated state to persist.
///
/// An item is new when its id is unseen and its timestamp is not older than
/// `prior.last_ts`. Remote timestamps can be zero (unknown) or coarse enough
/// that several items share one value, so id membership decides at the
/// boundary: items at exactly `last_ts` are new iff unseen, and zero-timestamp
/// items are judged by id alone. Ids recorded for the next cycle are those at
/// the updated `last_ts` plus all zero-timestamp ids; the list is bounded by
/// evicting oldest-inserted ids first, never ids recorded this cycle.
pub fn compute_novelty(fetched: &[Item], prior: &TargetState, caps: &NoveltyCaps) -> Novelty {
    let prior_ids: HashSet<&str> = prior.last_ids.iter().map(String::as_str).collect();

    let mut candidates: Vec<(usize, &Item)> = fetched
        .iter()
        .enumerate()
        .filter(|(_, item)| {
            if prior_ids.contains(item.id.as_str()) {
                return false;
            }
            item.created_at == 0 || item.created_at >= prior.last_ts
        })
        .collect();

    // First-ever poll: report only the most recent few instead of the
    // target's entire visible history.
    if prior.is_first_poll() && candidates.len() > caps.first_poll_cap {
        candidates.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at).then(a.0.cmp(&b.0)));
        candidates.truncate(caps.first_poll_cap);
    }

    // Deliver in publication order; input order breaks ties.
    candidates.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at).then(a.0.cmp(&b.0)));
    let new_items: Vec<Item> = candidates.into_iter().map(|(_, item)| item.clone()).collect();

    let max_fetched_ts = fetched
        .iter()
        .map(|item| item.created_at)
        .max()
        .unwrap_or(prior.last_ts);
    let last_ts = prior.last_ts.max(max_fetched_ts);

    let mut last_ids = prior.last_ids.clone();
    let mut known: HashSet<String> = last_ids.iter().cloned().collect();
    let mut protected: HashSet<String> = HashSet::new();
    for item in fetched {
        if item.created_at == last_ts || item.created_at == 0 {
            protected.insert(item.id.clone());
            if known.insert(item.id.clone()) {
                last_ids.push(item.id.clone());
            }
        }
    }

    if last_ids.len() > caps.max_seen_ids {
        let overflow = last_ids.len() - caps.max_seen_ids;
        let mut evicted = 0;
        last_ids.retain(|id| {
            if evicted < overflow && !protected.contains(id) {
                evicted += 1;
                false
            } else {
                true
            }
        });
    }

    Novelty {
        new_items,
        state: TargetState { last_ts, last_ids },
    }
}
