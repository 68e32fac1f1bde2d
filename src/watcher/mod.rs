//! Watchers: one background task per tracked search, each running poll cycles on its
//! own schedule and owning its scope's seen-set exclusively.

pub mod catalog;
pub mod cycle;
pub mod registry;

#[cfg(test)]
pub(crate) mod fakes;

use crate::config::WatcherDefaults;
use crate::delivery::{Delivery, DeliveryTarget};
use crate::error::WatchError;
use crate::models::{ScopeId, WatcherConfig};
use crate::scraper::ListingSource;
use crate::seen::{SeenSet, SeenStore};
use crate::utils::unix_now;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use self::cycle::{CycleParams, CycleSummary, run_cycle};

// ── Shared collaborators ──────────────────────────────────────────────────────

/// Everything a watcher needs besides its own config.
#[derive(Clone)]
pub struct WatcherContext {
    pub source: Arc<dyn ListingSource>,
    pub delivery: Arc<dyn Delivery>,
    pub store: SeenStore,
    pub defaults: WatcherDefaults,
}

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WatcherState {
    Running,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatcherStatus {
    pub state: WatcherState,
    pub last_error: Option<String>,
    pub cycles: u64,
    pub last_cycle: Option<CycleSummary>,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl WatcherStatus {
    fn running() -> Self {
        Self {
            state: WatcherState::Running,
            last_error: None,
            cycles: 0,
            last_cycle: None,
            last_cycle_at: None,
        }
    }
}

/// A watcher that stopped on a fatal error.
#[derive(Debug)]
pub struct WatcherFailure {
    pub name: String,
    pub scope: ScopeId,
    pub error: WatchError,
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Settings the task re-reads at every cycle boundary.
#[derive(Debug, Clone)]
struct WatcherSettings {
    name: String,
    interval: Duration,
    stop: bool,
}

pub struct WatcherHandle {
    settings: watch::Sender<WatcherSettings>,
    status: watch::Receiver<WatcherStatus>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn status(&self) -> WatcherStatus {
        self.status.borrow().clone()
    }

    #[cfg(test)]
    pub fn status_updates(&self) -> watch::Receiver<WatcherStatus> {
        self.status.clone()
    }

    /// Applied at the next sleep boundary, or immediately if sleeping.
    pub fn set_interval(&self, interval: Duration) {
        self.settings.send_modify(|s| s.interval = interval);
    }

    /// Applied from the next cycle on.
    pub fn rename(&self, name: &str) {
        self.settings.send_modify(|s| s.name = name.to_string());
    }

    /// Signal a stop without waiting for it.
    pub fn request_stop(&self) {
        self.settings.send_modify(|s| s.stop = true);
    }

    /// Signal a stop and wait for the task to exit. An in-flight cycle finishes first.
    pub async fn stop(self) -> WatcherStatus {
        self.request_stop();
        if let Err(e) = self.task.await {
            error!("Watcher task panicked: {}", e);
        }
        self.status.borrow().clone()
    }
}

// ── Driver ────────────────────────────────────────────────────────────────────

struct Watcher {
    url: String,
    scope: ScopeId,
    scan_limit: usize,
    take_limit: usize,
    announce: bool,
    ctx: WatcherContext,
    settings: watch::Receiver<WatcherSettings>,
    status: watch::Sender<WatcherStatus>,
    failures: mpsc::UnboundedSender<WatcherFailure>,
}

/// Start the watcher task for `config`. Fatal errors are sent to `failures`.
pub fn spawn(
    config: &WatcherConfig,
    ctx: WatcherContext,
    failures: mpsc::UnboundedSender<WatcherFailure>,
) -> WatcherHandle {
    let (settings_tx, settings_rx) = watch::channel(WatcherSettings {
        name: config.name.clone(),
        interval: config.interval,
        stop: false,
    });
    let (status_tx, status_rx) = watch::channel(WatcherStatus::running());

    let watcher = Watcher {
        url: config.url.clone(),
        scope: config.scope.clone(),
        scan_limit: config.options.scan_limit.unwrap_or(ctx.defaults.scan_limit),
        take_limit: config.options.take_limit.unwrap_or(ctx.defaults.take_limit),
        announce: config.options.announce.unwrap_or(ctx.defaults.announce),
        ctx,
        settings: settings_rx,
        status: status_tx,
        failures,
    };
    let task = tokio::spawn(watcher.run());

    WatcherHandle {
        settings: settings_tx,
        status: status_rx,
        task,
    }
}

impl Watcher {
    async fn run(mut self) {
        let name = self.settings.borrow().name.clone();
        let mut seen = match self.ctx.store.load(&self.scope) {
            Ok(seen) => seen,
            Err(e) => return self.fail(&name, e).await,
        };
        info!(
            "[{}] watching {} every {:?} (scope {}, {} seen)",
            name,
            self.url,
            self.settings.borrow().interval,
            self.scope,
            seen.len()
        );

        if self.announce {
            let interval = self.settings.borrow().interval;
            let text = format!("Watching {} every {}s", self.url, interval.as_secs());
            self.notify(&name, &text).await;
        }

        loop {
            let snapshot = self.settings.borrow_and_update().clone();
            if snapshot.stop {
                break;
            }

            match self.cycle(&snapshot, &mut seen).await {
                Ok(summary) => self.status.send_modify(|s| {
                    s.cycles += 1;
                    s.last_error = None;
                    s.last_cycle = Some(summary);
                    s.last_cycle_at = Some(Utc::now());
                }),
                Err(e) if e.is_transient() => {
                    warn!("[{}] cycle aborted: {}", snapshot.name, e);
                    self.status.send_modify(|s| s.last_error = Some(e.to_string()));
                }
                Err(e) => return self.fail(&snapshot.name, e).await,
            }

            if !self.pause(Instant::now()).await {
                break;
            }
        }

        self.status.send_modify(|s| s.state = WatcherState::Stopped);
        info!("[{}] stopped", self.settings.borrow().name);
    }

    /// Sleep until `from + interval`. Returns `false` when a stop arrived instead.
    async fn pause(&mut self, from: Instant) -> bool {
        loop {
            let (stop, interval) = {
                let s = self.settings.borrow_and_update();
                (s.stop, s.interval)
            };
            if stop {
                self.status.send_modify(|s| s.state = WatcherState::Stopping);
                return false;
            }
            tokio::select! {
                _ = sleep_until(from + interval) => return true,
                changed = self.settings.changed() => {
                    if changed.is_err() {
                        // handle dropped
                        return false;
                    }
                }
            }
        }
    }

    async fn cycle(
        &self,
        settings: &WatcherSettings,
        seen: &mut SeenSet,
    ) -> Result<CycleSummary, WatchError> {
        let params = CycleParams {
            url: &self.url,
            scan_limit: self.scan_limit,
            take_limit: self.take_limit,
            ttl: self.ctx.defaults.ttl_policy(),
            now: unix_now(),
        };
        let outcome = run_cycle(self.ctx.source.as_ref(), seen, &params).await?;

        if outcome.seen != *seen {
            self.ctx.store.persist(&self.scope, &outcome.seen)?;
            *seen = outcome.seen.clone();
        }

        let target = DeliveryTarget {
            watcher: settings.name.clone(),
            scope: self.scope.clone(),
        };
        let limit = self.ctx.defaults.delivery_timeout();
        let mut summary = outcome.summary();

        for record in &outcome.emitted {
            let delivered = timeout(limit, self.ctx.delivery.deliver(&target, record)).await;
            let failure = match delivered {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some(WatchError::Timeout(limit)),
            };
            if let Some(e) = failure {
                warn!("[{}] could not deliver {}: {}", settings.name, record.identity, e);
                summary.delivery_failures += 1;
            }
        }

        match timeout(limit, self.ctx.delivery.deliver_summary(&target, &summary)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[{}] cycle summary not delivered: {}", settings.name, e),
            Err(_) => warn!("[{}] cycle summary timed out", settings.name),
        }

        debug!(
            "[{}] {} new, {} skipped, {} deferred",
            settings.name, summary.emitted, summary.skipped, summary.deferred
        );
        Ok(summary)
    }

    async fn fail(self, name: &str, e: WatchError) {
        error!("[{}] stopping on fatal error: {}", name, e);
        let message = e.to_string();
        self.status.send_modify(|s| {
            s.state = WatcherState::Failed;
            s.last_error = Some(message.clone());
        });
        self.notify(name, &format!("Watcher stopped: {}", message)).await;

        let failure = WatcherFailure {
            name: name.to_string(),
            scope: self.scope.clone(),
            error: e,
        };
        if self.failures.send(failure).is_err() {
            debug!("[{}] nobody is listening for failures", name);
        }
    }

    async fn notify(&self, name: &str, text: &str) {
        let target = DeliveryTarget {
            watcher: name.to_string(),
            scope: self.scope.clone(),
        };
        let limit = self.ctx.defaults.delivery_timeout();
        match timeout(limit, self.ctx.delivery.notice(&target, text)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[{}] notice not delivered: {}", name, e),
            Err(_) => warn!("[{}] notice timed out", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchErrorKind;
    use crate::models::{ListingIdentity, WatcherOptions};
    use crate::watcher::fakes::{FakeSource, RecordingDelivery, cand};

    const URL: &str = "https://www.sreality.cz/hledani/pronajem/byty";

    struct Rig {
        _dir: tempfile::TempDir,
        source: Arc<FakeSource>,
        delivery: Arc<RecordingDelivery>,
        ctx: WatcherContext,
        failures_tx: mpsc::UnboundedSender<WatcherFailure>,
        failures_rx: mpsc::UnboundedReceiver<WatcherFailure>,
    }

    fn rig(source: FakeSource) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(source);
        let delivery = Arc::new(RecordingDelivery::default());
        let ctx = WatcherContext {
            source: source.clone(),
            delivery: delivery.clone(),
            store: SeenStore::new(dir.path()),
            defaults: WatcherDefaults {
                announce: false,
                ..WatcherDefaults::default()
            },
        };
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Rig {
            _dir: dir,
            source,
            delivery,
            ctx,
            failures_tx,
            failures_rx,
        }
    }

    impl Rig {
        fn spawn(&self, name: &str, scope: &str, interval: Duration) -> WatcherHandle {
            spawn(
                &config(name, scope, interval),
                self.ctx.clone(),
                self.failures_tx.clone(),
            )
        }
    }

    fn config(name: &str, scope: &str, interval: Duration) -> WatcherConfig {
        WatcherConfig {
            name: name.to_string(),
            url: URL.to_string(),
            interval,
            scope: ScopeId::new(scope).unwrap(),
            options: WatcherOptions::default(),
            created_at: Utc::now(),
        }
    }

    async fn wait_for_cycles(handle: &WatcherHandle, n: u64) {
        let mut rx = handle.status_updates();
        timeout(Duration::from_secs(5), rx.wait_for(|s| s.cycles >= n))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_while_sleeping_starts_no_new_cycle() {
        let r = rig(FakeSource::with_page(vec![cand("1", Some(1))]));
        let handle = r.spawn("byty", "a", Duration::from_secs(3600));
        wait_for_cycles(&handle, 1).await;

        let status = timeout(Duration::from_secs(2), handle.stop()).await.unwrap();
        assert_eq!(status.state, WatcherState::Stopped);
        assert_eq!(status.cycles, 1);
        assert_eq!(r.source.searches(), 1);
        assert_eq!(r.delivery.delivered_keys(), vec!["1:1"]);
    }

    #[tokio::test]
    async fn test_stop_mid_cycle_waits_for_the_cycle() {
        let r = rig(FakeSource::gated(vec![cand("1", Some(1))]));
        let handle = r.spawn("byty", "a", Duration::from_secs(3600));
        r.source.entered().await;

        let stopping = tokio::spawn(handle.stop());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());

        r.source.release();
        let status = timeout(Duration::from_secs(2), stopping).await.unwrap().unwrap();
        assert_eq!(status.state, WatcherState::Stopped);
        assert_eq!(status.cycles, 1);
        assert_eq!(r.source.searches(), 1);
        // the in-flight cycle completed and persisted before the stop took effect
        let seen = r.ctx.store.load(&ScopeId::new("a").unwrap()).unwrap();
        assert!(!seen.is_new(&ListingIdentity::new("1", Some(1)).unwrap()));
    }

    #[tokio::test]
    async fn test_corrupt_scope_fails_alone() {
        let mut r = rig(FakeSource::with_page(vec![cand("1", Some(1))]));
        std::fs::write(r.ctx.store.path_for(&ScopeId::new("broken").unwrap()), "{oops").unwrap();

        let broken = r.spawn("broken", "broken", Duration::from_millis(20));
        let healthy = r.spawn("healthy", "healthy", Duration::from_millis(20));

        let failure = timeout(Duration::from_secs(2), r.failures_rx.recv()).await.unwrap().unwrap();
        assert_eq!(failure.name, "broken");
        assert!(matches!(failure.error, WatchError::StoreCorrupt { .. }));
        assert_eq!(broken.status().state, WatcherState::Failed);

        wait_for_cycles(&healthy, 3).await;
        assert_eq!(healthy.status().state, WatcherState::Running);
        // the corrupt file is never reset behind the operator's back
        let broken_path = r.ctx.store.path_for(&ScopeId::new("broken").unwrap());
        let raw = std::fs::read_to_string(broken_path).unwrap();
        assert_eq!(raw, "{oops");
        healthy.stop().await;
    }

    #[tokio::test]
    async fn test_delivery_failure_does_not_block_the_batch() {
        let r = rig(FakeSource::with_page(vec![
            cand("1", Some(1)),
            cand("2", Some(2)),
            cand("3", Some(3)),
        ]));
        r.delivery.failing.lock().unwrap().insert("2".to_string());

        let handle = r.spawn("byty", "a", Duration::from_millis(20));
        wait_for_cycles(&handle, 2).await;
        let status = handle.stop().await;

        assert_eq!(r.delivery.delivered_keys(), vec!["1:1", "3:3"]);
        assert_eq!(status.last_cycle.map(|c| c.emitted), Some(0));
        let first = r.delivery.summaries.lock().unwrap()[0].clone();
        assert_eq!(first.delivery_failures, 1);
        // marked seen regardless, so it is not retried
        let seen = r.ctx.store.load(&ScopeId::new("a").unwrap()).unwrap();
        assert!(seen.contains_key("2:2"));
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_running() {
        let r = rig(FakeSource::with_page(vec![cand("1", Some(1))]));
        r.source.fail_search(FetchErrorKind::Transient);

        let handle = r.spawn("byty", "a", Duration::from_millis(20));
        let mut rx = handle.status_updates();
        timeout(Duration::from_secs(2), rx.wait_for(|s| s.last_error.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.status().state, WatcherState::Running);
        assert!(!r.ctx.store.path_for(&ScopeId::new("a").unwrap()).exists());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_permanent_search_failure_is_fatal() {
        let mut r = rig(FakeSource::with_page(vec![]));
        r.source.fail_search(FetchErrorKind::Permanent);

        let handle = r.spawn("byty", "a", Duration::from_millis(20));
        let failure = timeout(Duration::from_secs(2), r.failures_rx.recv()).await.unwrap().unwrap();
        assert_eq!(failure.scope.as_str(), "a");
        let status = handle.stop().await;
        assert_eq!(status.state, WatcherState::Failed);
        assert_eq!(r.source.searches(), 1);
        assert_eq!(r.delivery.notices.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rename_applies_to_next_cycle() {
        let r = rig(FakeSource::with_page(vec![cand("1", Some(1))]));
        let handle = r.spawn("old", "a", Duration::from_millis(20));
        wait_for_cycles(&handle, 1).await;

        handle.rename("new");
        r.source.set_page(vec![cand("2", Some(2))]);
        wait_for_cycles(&handle, 3).await;
        handle.stop().await;

        let delivered = r.delivery.delivered.lock().unwrap().clone();
        assert_eq!(delivered[0], ("old".to_string(), "1:1".to_string()));
        assert_eq!(delivered[1], ("new".to_string(), "2:2".to_string()));
    }
}
