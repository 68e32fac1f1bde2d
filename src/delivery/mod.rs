//! Delivery collaborators: where new listings go once a cycle has marked them seen.

pub mod tsv;
pub mod webhook;

use crate::error::WatchError;
use crate::models::{ListingRecord, ScopeId};
use crate::utils::fmt_number;
use crate::watcher::cycle::CycleSummary;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub use self::tsv::TsvLogDelivery;
pub use self::webhook::WebhookDelivery;

/// Who a delivery is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub watcher: String,
    pub scope: ScopeId,
}

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, target: &DeliveryTarget, record: &ListingRecord)
    -> Result<(), WatchError>;

    async fn deliver_summary(
        &self,
        _target: &DeliveryTarget,
        _summary: &CycleSummary,
    ) -> Result<(), WatchError> {
        Ok(())
    }

    /// Free-form status text (start announcement, fatal watcher error).
    async fn notice(&self, _target: &DeliveryTarget, _text: &str) -> Result<(), WatchError> {
        Ok(())
    }
}

/// One-line human summary of a listing.
pub fn format_listing(record: &ListingRecord) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(d) = &record.dispo {
        parts.push(d.clone());
    }
    if let Some(a) = record.area_m2 {
        parts.push(format!("{} m²", a));
    }
    if let Some(l) = &record.locality {
        parts.push(l.clone());
    }
    if let Some(p) = record.price_czk {
        parts.push(format!("{} Kč", fmt_number(p)));
    }
    if let Some(ppm) = record.price_per_m2 {
        parts.push(format!("{} Kč/m²", fmt_number(ppm)));
    }

    if parts.is_empty() {
        format!("{} <{}>", record.title, record.url)
    } else {
        format!("{} · {} <{}>", parts.join(" · "), record.title, record.url)
    }
}

// ── Log sink ──────────────────────────────────────────────────────────────────

pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn deliver(
        &self,
        target: &DeliveryTarget,
        record: &ListingRecord,
    ) -> Result<(), WatchError> {
        info!("[{}] NEW {}", target.watcher, format_listing(record));
        Ok(())
    }

    async fn deliver_summary(
        &self,
        target: &DeliveryTarget,
        summary: &CycleSummary,
    ) -> Result<(), WatchError> {
        info!(
            "[{}] cycle: {} on page, {} new, {} skipped, {} deferred, {} seen",
            target.watcher,
            summary.total_found,
            summary.emitted,
            summary.skipped,
            summary.deferred,
            summary.seen_size
        );
        Ok(())
    }

    async fn notice(&self, target: &DeliveryTarget, text: &str) -> Result<(), WatchError> {
        info!("[{}] {}", target.watcher, text);
        Ok(())
    }
}

// ── Fan-out ───────────────────────────────────────────────────────────────────

/// Tries every sink; fails if any of them failed.
pub struct FanoutDelivery {
    sinks: Vec<Arc<dyn Delivery>>,
}

impl FanoutDelivery {
    pub fn new(sinks: Vec<Arc<dyn Delivery>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    fn collect(failures: Vec<String>) -> Result<(), WatchError> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(WatchError::Delivery(failures.join("; ")))
        }
    }
}

#[async_trait]
impl Delivery for FanoutDelivery {
    async fn deliver(
        &self,
        target: &DeliveryTarget,
        record: &ListingRecord,
    ) -> Result<(), WatchError> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(target, record).await {
                failures.push(e.to_string());
            }
        }
        Self::collect(failures)
    }

    async fn deliver_summary(
        &self,
        target: &DeliveryTarget,
        summary: &CycleSummary,
    ) -> Result<(), WatchError> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.deliver_summary(target, summary).await {
                failures.push(e.to_string());
            }
        }
        Self::collect(failures)
    }

    async fn notice(&self, target: &DeliveryTarget, text: &str) -> Result<(), WatchError> {
        for sink in &self.sinks {
            if let Err(e) = sink.notice(target, text).await {
                warn!("[{}] notice not delivered: {}", target.watcher, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Candidate, ListingIdentity};
    use std::sync::Mutex;

    pub(crate) fn record(id: &str, price: Option<i64>) -> ListingRecord {
        ListingRecord::from_candidate(&Candidate {
            identity: ListingIdentity::new(id, price).unwrap(),
            url: format!("https://www.sreality.cz/detail/pronajem/byt/{}", id),
            title: format!("Byt {}", id),
        })
    }

    pub(crate) fn target() -> DeliveryTarget {
        DeliveryTarget {
            watcher: "byty".into(),
            scope: ScopeId::new("byty").unwrap(),
        }
    }

    struct Failing;

    #[async_trait]
    impl Delivery for Failing {
        async fn deliver(&self, _t: &DeliveryTarget, _r: &ListingRecord) -> Result<(), WatchError> {
            Err(WatchError::Delivery("channel archived".into()))
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    #[async_trait]
    impl Delivery for Recording {
        async fn deliver(&self, _t: &DeliveryTarget, r: &ListingRecord) -> Result<(), WatchError> {
            self.0.lock().unwrap().push(r.identity.key());
            Ok(())
        }
    }

    #[test]
    fn test_format_listing() {
        let mut r = record("3713540940", Some(25_000));
        r.dispo = Some("2+kk".into());
        r.area_m2 = Some(54.0);
        r.locality = Some("Praha 9".into());
        r.price_per_m2 = Some(463);
        assert_eq!(
            format_listing(&r),
            "2+kk · 54 m² · Praha 9 · 25,000 Kč · 463 Kč/m² · Byt 3713540940 \
             <https://www.sreality.cz/detail/pronajem/byt/3713540940>"
        );
    }

    #[tokio::test]
    async fn test_fanout_tries_every_sink() {
        let recording = Arc::new(Recording::default());
        let fanout = FanoutDelivery::new(vec![Arc::new(Failing), recording.clone()]);

        let err = fanout.deliver(&target(), &record("1", Some(1))).await;
        assert!(matches!(err, Err(WatchError::Delivery(_))));
        assert_eq!(*recording.0.lock().unwrap(), vec!["1:1".to_string()]);
        assert_eq!(fanout.len(), 2);
    }
}
