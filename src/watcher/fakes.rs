//! In-memory collaborators for watcher and registry tests.

use crate::delivery::{Delivery, DeliveryTarget};
use crate::error::{FetchErrorKind, WatchError};
use crate::models::{Candidate, CandidatePage, ListingIdentity, ListingRecord};
use crate::scraper::ListingSource;
use crate::watcher::cycle::CycleSummary;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, Semaphore};

pub(crate) fn cand(id: &str, price: Option<i64>) -> Candidate {
    Candidate {
        identity: ListingIdentity::new(id, price).unwrap(),
        url: format!("https://www.sreality.cz/detail/pronajem/byt/{}", id),
        title: format!("Byt {}", id),
    }
}

/// Scripted search page; optionally parks inside `candidates` until released.
#[derive(Default)]
pub(crate) struct FakeSource {
    page: Mutex<Vec<Candidate>>,
    search_failure: Mutex<Option<FetchErrorKind>>,
    failing_details: Mutex<HashSet<String>>,
    details: Mutex<Vec<String>>,
    searches: AtomicUsize,
    gate: Option<(Notify, Semaphore)>,
}

impl FakeSource {
    pub(crate) fn with_page(page: Vec<Candidate>) -> Self {
        Self {
            page: Mutex::new(page),
            ..Self::default()
        }
    }

    /// Every search blocks until `release()` hands out a permit.
    pub(crate) fn gated(page: Vec<Candidate>) -> Self {
        Self {
            page: Mutex::new(page),
            gate: Some((Notify::new(), Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub(crate) fn set_page(&self, page: Vec<Candidate>) {
        *self.page.lock().unwrap() = page;
    }

    pub(crate) fn fail_search(&self, kind: FetchErrorKind) {
        *self.search_failure.lock().unwrap() = Some(kind);
    }

    pub(crate) fn fail_detail(&self, id: &str) {
        self.failing_details.lock().unwrap().insert(id.to_string());
    }

    pub(crate) fn heal_detail(&self, id: &str) {
        self.failing_details.lock().unwrap().remove(id);
    }

    pub(crate) fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    pub(crate) fn detail_calls(&self) -> Vec<String> {
        self.details.lock().unwrap().clone()
    }

    /// Resolves once a gated search has started.
    pub(crate) async fn entered(&self) {
        if let Some((entered, _)) = &self.gate {
            entered.notified().await;
        }
    }

    pub(crate) fn release(&self) {
        if let Some((_, permits)) = &self.gate {
            permits.add_permits(1);
        }
    }
}

#[async_trait]
impl ListingSource for FakeSource {
    async fn candidates(&self, url: &str, scan_limit: usize) -> Result<CandidatePage, WatchError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if let Some((entered, permits)) = &self.gate {
            entered.notify_one();
            permits.acquire().await.unwrap().forget();
        }
        match *self.search_failure.lock().unwrap() {
            Some(FetchErrorKind::Transient) => {
                return Err(WatchError::transient_fetch(url, "connection reset"));
            }
            Some(FetchErrorKind::Permanent) => {
                return Err(WatchError::permanent_fetch(url, "HTTP 404 Not Found"));
            }
            None => {}
        }
        let page = self.page.lock().unwrap().clone();
        Ok(CandidatePage {
            total_found: page.len(),
            candidates: page.into_iter().take(scan_limit).collect(),
        })
    }

    async fn detail(&self, candidate: &Candidate) -> Result<ListingRecord, WatchError> {
        let id = candidate.identity.external_id().to_string();
        self.details.lock().unwrap().push(id.clone());
        if self.failing_details.lock().unwrap().contains(&id) {
            return Err(WatchError::transient_fetch(&candidate.url, "timed out"));
        }
        Ok(ListingRecord::from_candidate(candidate))
    }
}

/// Records what reached it; fails for listing ids in `failing`.
#[derive(Default)]
pub(crate) struct RecordingDelivery {
    pub(crate) failing: Mutex<HashSet<String>>,
    pub(crate) delivered: Mutex<Vec<(String, String)>>,
    pub(crate) summaries: Mutex<Vec<CycleSummary>>,
    pub(crate) notices: Mutex<Vec<String>>,
}

impl RecordingDelivery {
    pub(crate) fn delivered_keys(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(_, key)| key.clone())
            .collect()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn deliver(
        &self,
        target: &DeliveryTarget,
        record: &ListingRecord,
    ) -> Result<(), WatchError> {
        if self.failing.lock().unwrap().contains(record.id()) {
            return Err(WatchError::Delivery("webhook returned 500".into()));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((target.watcher.clone(), record.identity.key()));
        Ok(())
    }

    async fn deliver_summary(
        &self,
        _target: &DeliveryTarget,
        summary: &CycleSummary,
    ) -> Result<(), WatchError> {
        self.summaries.lock().unwrap().push(summary.clone());
        Ok(())
    }

    async fn notice(&self, target: &DeliveryTarget, text: &str) -> Result<(), WatchError> {
        self.notices
            .lock()
            .unwrap()
            .push(format!("{}: {}", target.watcher, text));
        Ok(())
    }
}
