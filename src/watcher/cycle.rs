use crate::error::WatchError;
use crate::models::ListingRecord;
use crate::scraper::ListingSource;
use crate::seen::{SeenSet, TtlPolicy};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Inputs for one fetch-diff-emit pass over a scope.
#[derive(Debug, Clone)]
pub struct CycleParams<'a> {
    pub url: &'a str,
    pub scan_limit: usize,
    pub take_limit: usize,
    pub ttl: TtlPolicy,
    /// Unix seconds used for pruning and for every timestamp recorded this cycle.
    pub now: f64,
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    /// New listings, most recent first.
    pub emitted: Vec<ListingRecord>,
    /// Pruned and updated seen-set.
    pub seen: SeenSet,
    pub total_found: usize,
    /// New candidates whose detail fetch failed; left unmarked.
    pub skipped: usize,
    /// New candidates beyond `take_limit`; left unmarked.
    pub deferred: usize,
}

/// Counters reported after every completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub total_found: usize,
    pub emitted: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub delivery_failures: usize,
    pub seen_size: usize,
}

impl CycleOutcome {
    pub fn summary(&self) -> CycleSummary {
        CycleSummary {
            total_found: self.total_found,
            emitted: self.emitted.len(),
            skipped: self.skipped,
            deferred: self.deferred,
            delivery_failures: 0,
            seen_size: self.seen.len(),
        }
    }
}

/// One poll cycle. A failed search-page fetch returns `Err` and the caller keeps
/// `seen` as it was; per-listing detail failures only skip that listing.
pub async fn run_cycle(
    source: &dyn ListingSource,
    seen: &SeenSet,
    params: &CycleParams<'_>,
) -> Result<CycleOutcome, WatchError> {
    let mut mapping = seen.pruned(params.ttl, params.now);
    let page = source.candidates(params.url, params.scan_limit).await?;

    let mut on_page = HashSet::new();
    let mut fresh = Vec::new();
    for candidate in page.candidates {
        if !on_page.insert(candidate.identity.key()) {
            continue;
        }
        if mapping.is_new(&candidate.identity) {
            fresh.push(candidate);
        } else {
            mapping.record(&candidate.identity, params.now);
        }
    }

    let deferred = fresh.len().saturating_sub(params.take_limit);
    fresh.truncate(params.take_limit);
    if deferred > 0 {
        debug!("{}: {} new listings deferred to the next cycle", params.url, deferred);
    }

    let mut emitted = Vec::with_capacity(fresh.len());
    let mut skipped = 0;
    for candidate in &fresh {
        match source.detail(candidate).await {
            Ok(record) => {
                mapping.record(&candidate.identity, params.now);
                emitted.push(record);
            }
            Err(e) => {
                warn!("Skipping {} for now: {}", candidate.url, e);
                skipped += 1;
            }
        }
    }

    Ok(CycleOutcome {
        emitted,
        seen: mapping,
        total_found: page.total_found,
        skipped,
        deferred,
    })
}
