// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background reconciliation loop.
//!
//! Periodically re-queries the release manager for every release believed
//! to be DEPLOYED or FAILED and refreshes the stored status, so status
//! queries never need a synchronous backend call. Two cadences: most ticks
//! only touch recently deployed releases; a coarser interval escalates to
//! a full poll of everything. The very first tick after process start is
//! always a full poll - there is no prior state to trust.
//!
//! Per-release errors are logged and skipped; they never interrupt the
//! sweep of other releases and never escape the scheduled tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::manager::ManagerRegistry;
use crate::release::{AppDeployerData, StatusCode};
use crate::store::{ReleaseRecord, ReleaseStore, update_with_retry};

/// Clock abstraction so poll-window election is unit-testable.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Configuration for the reconciliation loop.
///
/// The windows are not load-bearing for correctness; they only trade
/// backend call volume against staleness for large fleets of stable
/// releases.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Tick period.
    pub tick_interval: Duration,
    /// Elapsed time after which a tick escalates to a full poll.
    pub full_poll_interval: Duration,
    /// Non-full ticks only refresh releases deployed within this window.
    pub recent_window: Duration,
    /// Bound on concurrent per-release status queries within one tick.
    pub max_concurrent_status_checks: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            full_poll_interval: Duration::from_secs(600),
            recent_window: Duration::from_secs(120),
            max_concurrent_status_checks: 8,
        }
    }
}

/// Background worker refreshing stored release status from the backends.
pub struct Reconciler {
    store: Arc<dyn ReleaseStore>,
    registry: Arc<ManagerRegistry>,
    config: ReconcilerConfig,
    clock: Arc<dyn Clock>,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a reconciler using the system clock.
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        registry: Arc<ManagerRegistry>,
        config: ReconcilerConfig,
    ) -> Self {
        Self::with_clock(store, registry, config, Arc::new(SystemClock))
    }

    /// Create a reconciler with an injected clock.
    pub fn with_clock(
        store: Arc<dyn ReleaseStore>,
        registry: Arc<ManagerRegistry>,
        config: ReconcilerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            clock,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconciliation loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            tick_interval_secs = self.config.tick_interval.as_secs(),
            full_poll_interval_secs = self.config.full_poll_interval.as_secs(),
            recent_window_secs = self.config.recent_window.as_secs(),
            "Reconciler started"
        );

        // Next-full-poll bookkeeping is owned here, not ambient state.
        let mut last_full_poll: Option<DateTime<Utc>> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.tick_interval) => {
                    let now = self.clock.now();
                    let full_poll = self.elect_full_poll(&mut last_full_poll, now);
                    if let Err(e) = self.tick(full_poll).await {
                        // Never let an error stop future scheduling.
                        error!(error = %e, "Reconciliation tick failed");
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Whether this tick is a full poll. The first tick always is.
    fn elect_full_poll(
        &self,
        last_full_poll: &mut Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let full = match *last_full_poll {
            None => true,
            Some(last) => {
                now.signed_duration_since(last)
                    >= chrono::Duration::from_std(self.config.full_poll_interval)
                        .unwrap_or(chrono::Duration::MAX)
            }
        };
        if full {
            *last_full_poll = Some(now);
        }
        full
    }

    /// One reconciliation sweep. Public so embedders and tests can drive
    /// ticks directly.
    pub async fn tick(&self, full_poll: bool) -> Result<()> {
        let candidates = self
            .store
            .list_latest(&[StatusCode::Deployed, StatusCode::Failed])
            .await?;
        if candidates.is_empty() {
            debug!("No releases to reconcile");
            return Ok(());
        }

        let now = self.clock.now();
        let recent_cutoff = chrono::Duration::from_std(self.config.recent_window)
            .map_err(|e| Error::Other(format!("invalid recent window: {}", e)))?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_status_checks));
        let mut sweep = JoinSet::new();
        let mut refreshed = 0usize;

        for record in candidates {
            let name = record.release.name.clone();

            // Defensive: malformed records must not block reconciliation
            // of the rest of the fleet.
            let Some(info) = record.release.info.as_ref() else {
                error!(release = %name, "Release has no info block; skipping status refresh");
                continue;
            };
            let Some(last_deployed) = info.last_deployed else {
                error!(release = %name, "Release has no last-deployed timestamp; skipping status refresh");
                continue;
            };

            if !full_poll && now.signed_duration_since(last_deployed) > recent_cutoff {
                continue;
            }

            refreshed += 1;
            let store = self.store.clone();
            let registry = self.registry.clone();
            let semaphore = semaphore.clone();
            sweep.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if let Err(e) = refresh_release(store, registry, record).await {
                    warn!(release = %name, error = %e, "Status refresh failed; skipping");
                }
            });
        }

        // Join barrier: the tick waits for every in-flight query so sweeps
        // never overlap and race on the same release.
        while sweep.join_next().await.is_some() {}

        debug!(full_poll, refreshed, "Reconciliation tick complete");
        Ok(())
    }
}

/// Refresh one release's stored status from its backend.
async fn refresh_release(
    store: Arc<dyn ReleaseStore>,
    registry: Arc<ManagerRegistry>,
    record: ReleaseRecord,
) -> Result<()> {
    let release = record.release;
    let name = release.name.clone();
    let version = release.version;

    let manager = registry.resolve_for(&release)?;
    let data = store
        .get_app_deployer_data(&name, version)
        .await?
        .unwrap_or_else(|| AppDeployerData::empty(&name, version));

    let refreshed = manager.status(release, &data).await?;
    let Some(fresh_info) = refreshed.info else {
        return Ok(());
    };
    let fresh_status = fresh_info.status;

    // Optimistic write: a state-machine action may land on the same
    // record mid-refresh; update_with_retry re-reads once, then the
    // conflict surfaces into the per-release log-and-skip path.
    update_with_retry(store.as_ref(), &name, version, move |r| {
        r.merge_status(&fresh_status);
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{MockReleaseManager, ReleaseManager};
    use crate::release::{AppHealth, PackageRef, Release};
    use crate::store::MemoryReleaseStore;
    use std::sync::Mutex;

    const V1: &str = r#"{
        "kind": "mock",
        "apps": {
            "api": {"image": "registry/api:1.0"}
        }
    }"#;

    /// Clock returning a programmable instant.
    struct TestClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl TestClock {
        fn new(now: DateTime<Utc>) -> Self {
            Self { now: Mutex::new(now) }
        }

        fn advance(&self, by: chrono::Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    fn release(name: &str) -> Release {
        Release::new(
            name,
            1,
            V1,
            PackageRef {
                name: format!("{name}-pkg"),
                version: "1.0.0".to_string(),
            },
            serde_json::json!({}),
            "default",
            Utc::now(),
        )
    }

    struct Fixture {
        store: Arc<MemoryReleaseStore>,
        manager: Arc<MockReleaseManager>,
        clock: Arc<TestClock>,
        reconciler: Reconciler,
    }

    fn fixture(config: ReconcilerConfig) -> Fixture {
        let store = Arc::new(MemoryReleaseStore::new());
        let manager = Arc::new(MockReleaseManager::new());
        let mut registry = ManagerRegistry::new();
        registry.register(manager.clone());
        let clock = Arc::new(TestClock::new(Utc::now()));
        let reconciler = Reconciler::with_clock(
            store.clone(),
            Arc::new(registry),
            config,
            clock.clone(),
        );
        Fixture {
            store,
            manager,
            clock,
            reconciler,
        }
    }

    async fn seed_deployed(f: &Fixture, name: &str) {
        let (installed, data) = f.manager.install(release(name)).await.unwrap();
        f.store.insert_release(&installed).await.unwrap();
        f.store.save_app_deployer_data(&data).await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_refreshes_app_statuses() {
        let f = fixture(ReconcilerConfig::default());
        seed_deployed(&f, "orders").await;
        f.manager.set_app_health("api", AppHealth::Failed).await;

        f.reconciler.tick(true).await.unwrap();

        let record = f.store.get_release("orders", 1).await.unwrap().unwrap();
        let statuses = &record.release.info.as_ref().unwrap().status.app_statuses;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].health, AppHealth::Failed);
        // The refresh bumped the revision through the optimistic path.
        assert!(record.revision > 1);
    }

    #[tokio::test]
    async fn test_malformed_records_do_not_abort_sweep() {
        let f = fixture(ReconcilerConfig::default());
        seed_deployed(&f, "alpha").await;
        seed_deployed(&f, "omega").await;

        // A malformed record in the middle of the batch: deployed status
        // but no last-deployed timestamp.
        let mut broken = release("middle");
        broken.mark_deployed("Install complete", Utc::now());
        f.store.insert_release(&broken).await.unwrap();
        let mut malformed = broken.clone();
        malformed.info.as_mut().unwrap().last_deployed = None;
        f.store.put_raw(malformed).await;

        f.reconciler.tick(true).await.unwrap();

        // The malformed record was skipped: never written to.
        let middle = f.store.get_release("middle", 1).await.unwrap().unwrap();
        assert_eq!(middle.revision, 1);

        // Both well-formed releases were still refreshed.
        for name in ["alpha", "omega"] {
            let record = f.store.get_release(name, 1).await.unwrap().unwrap();
            assert!(
                !record.release.info.as_ref().unwrap().status.app_statuses.is_empty(),
                "{name} was not refreshed"
            );
        }
    }

    #[tokio::test]
    async fn test_backend_errors_do_not_abort_sweep() {
        let f = fixture(ReconcilerConfig::default());
        seed_deployed(&f, "orders").await;
        f.manager.set_fail_status(true);

        // The tick itself succeeds; the failure is logged per release.
        f.reconciler.tick(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_recent_window_limits_non_full_ticks() {
        let config = ReconcilerConfig {
            recent_window: Duration::from_secs(120),
            ..ReconcilerConfig::default()
        };
        let f = fixture(config);
        seed_deployed(&f, "stale").await;
        seed_deployed(&f, "fresh").await;

        // Age the stale release beyond the recent window.
        let record = f.store.get_release("stale", 1).await.unwrap().unwrap();
        let mut aged = record.release.clone();
        aged.info.as_mut().unwrap().last_deployed =
            Some(f.clock.now() - chrono::Duration::seconds(600));
        f.store.put_raw(aged).await;

        f.manager.set_app_health("api", AppHealth::Starting).await;
        f.reconciler.tick(false).await.unwrap();

        // Only the fresh release was polled.
        let fresh = f.store.get_release("fresh", 1).await.unwrap().unwrap();
        assert!(!fresh.release.info.as_ref().unwrap().status.app_statuses.is_empty());
        let stale = f.store.get_release("stale", 1).await.unwrap().unwrap();
        assert!(stale.release.info.as_ref().unwrap().status.app_statuses.is_empty());

        // A full poll picks it up again.
        f.reconciler.tick(true).await.unwrap();
        let stale = f.store.get_release("stale", 1).await.unwrap().unwrap();
        assert!(!stale.release.info.as_ref().unwrap().status.app_statuses.is_empty());
    }

    #[tokio::test]
    async fn test_full_poll_election() {
        let config = ReconcilerConfig {
            full_poll_interval: Duration::from_secs(600),
            ..ReconcilerConfig::default()
        };
        let f = fixture(config);
        let mut last_full_poll = None;

        // First tick is always a full poll.
        assert!(f.reconciler.elect_full_poll(&mut last_full_poll, f.clock.now()));
        // Immediately after, it is not.
        assert!(!f.reconciler.elect_full_poll(&mut last_full_poll, f.clock.now()));

        // After the interval elapses it is again.
        f.clock.advance(chrono::Duration::seconds(601));
        assert!(f.reconciler.elect_full_poll(&mut last_full_poll, f.clock.now()));
    }

    #[tokio::test]
    async fn test_only_deployed_and_failed_are_polled() {
        let f = fixture(ReconcilerConfig::default());
        seed_deployed(&f, "orders").await;

        let mut deleted = release("gone");
        deleted.mark_deleted("Delete complete", Utc::now());
        f.store.insert_release(&deleted).await.unwrap();

        f.reconciler.tick(true).await.unwrap();

        let polled = f.manager.calls().await;
        // install of "orders" recorded one deploy call; no status-driven
        // activity exists for "gone" because it was never queried.
        assert!(polled.iter().all(|c| !c.contains("gone")));
        let gone = f.store.get_release("gone", 1).await.unwrap().unwrap();
        assert_eq!(gone.revision, 1);
    }

    #[tokio::test]
    async fn test_run_loop_shutdown() {
        let config = ReconcilerConfig {
            tick_interval: Duration::from_millis(10),
            ..ReconcilerConfig::default()
        };
        let f = fixture(config);
        seed_deployed(&f, "orders").await;

        let shutdown = f.reconciler.shutdown_handle();
        let reconciler = f.reconciler;
        let task = tokio::spawn(async move { reconciler.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("reconciler did not stop")
            .unwrap();
    }
}
