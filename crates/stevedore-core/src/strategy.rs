// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Red-black upgrade strategy.
//!
//! Orchestrates a zero-downtime upgrade: diff the existing and replacing
//! releases, deploy only the changed applications, health-check them, then
//! either commit (delete the superseded old applications) or cancel
//! (delete the new ones, leaving the existing release untouched).
//!
//! The strategy drives the low-level manager primitives; the state machine
//! owns the timer-driven wait loop between deploy and check.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::diff::ReleaseAnalysisReport;
use crate::error::Result;
use crate::manager::ManagerRegistry;
use crate::release::{AppDeployerData, AppHealth, Release};
use crate::store::{ReleaseStore, update_with_retry};

/// Aggregate health of the newly deployed target applications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHealth {
    /// Not all applications are healthy yet; keep polling.
    Pending,
    /// Every target application reports healthy.
    Healthy,
    /// At least one target application reported a terminal failure.
    Failed(String),
}

/// Why an in-flight upgrade is being cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The health-check deadline expired.
    TimedOut(u64),
    /// An explicit cancel event arrived.
    Requested,
    /// A target application reported a terminal failure.
    HealthCheckFailed(String),
}

impl CancelReason {
    /// Human description recorded on the failed release. Timeout, explicit
    /// cancellation and health-check failure are distinguished only by
    /// this text.
    pub fn describe(&self) -> String {
        match self {
            Self::TimedOut(ms) => format!("Upgrade timed out after {}ms", ms),
            Self::Requested => "Upgrade cancelled".to_string(),
            Self::HealthCheckFailed(detail) => format!("Upgrade failed: {}", detail),
        }
    }

    /// Compact encoding for the machine snapshot.
    pub fn encode(&self) -> String {
        match self {
            Self::TimedOut(ms) => format!("timeout:{}", ms),
            Self::Requested => "requested".to_string(),
            Self::HealthCheckFailed(detail) => format!("failed:{}", detail),
        }
    }

    /// Parse the snapshot encoding; unknown input means an explicit cancel.
    pub fn parse(s: &str) -> Self {
        if let Some(ms) = s.strip_prefix("timeout:") {
            return ms.parse().map(Self::TimedOut).unwrap_or(Self::Requested);
        }
        if let Some(detail) = s.strip_prefix("failed:") {
            return Self::HealthCheckFailed(detail.to_string());
        }
        Self::Requested
    }
}

/// Red-black upgrade strategy.
pub struct RedBlackStrategy {
    store: Arc<dyn ReleaseStore>,
    registry: Arc<ManagerRegistry>,
}

impl RedBlackStrategy {
    /// Create a strategy over the given store and manager registry.
    pub fn new(store: Arc<dyn ReleaseStore>, registry: Arc<ManagerRegistry>) -> Self {
        Self { store, registry }
    }

    /// Analyze the existing release against the replacing release.
    ///
    /// With `initial` the replacing release is persisted immediately, so a
    /// crash mid-upgrade leaves a durable record to resume from. An empty
    /// changed set with no force flag means the whole upgrade is a no-op
    /// commit: nothing deployed, nothing deleted.
    pub async fn analyze(
        &self,
        existing: &Release,
        replacing: &Release,
        initial: bool,
        force_update: bool,
        names_override: Option<&[String]>,
    ) -> Result<ReleaseAnalysisReport> {
        let manager = self.registry.resolve_for(replacing)?;
        let report = manager.create_report(existing, replacing, force_update, names_override)?;

        if initial {
            self.store.insert_release(replacing).await?;
        }

        info!(
            release = %replacing.name,
            existing_version = existing.version,
            replacing_version = replacing.version,
            apps_to_upgrade = ?report.apps_to_upgrade,
            force_update,
            "Upgrade analysis complete"
        );
        Ok(report)
    }

    /// Deploy the changed applications of the replacing release and record
    /// their backend ids. Applications outside the changed set are left
    /// untouched on the existing deployment.
    pub async fn deploy_targets(&self, report: &ReleaseAnalysisReport) -> Result<AppDeployerData> {
        let replacing = &report.replacing;
        if report.apps_to_upgrade.is_empty() {
            debug!(release = %replacing.name, "No applications changed; nothing to deploy");
            return Ok(AppDeployerData::empty(&replacing.name, replacing.version));
        }

        let manager = self.registry.resolve_for(replacing)?;
        let data = manager
            .deploy_apps(replacing, &report.apps_to_upgrade)
            .await?;
        self.store.save_app_deployer_data(&data).await?;

        info!(
            release = %replacing.name,
            version = replacing.version,
            apps = ?report.apps_to_upgrade,
            "Target applications deployed"
        );
        Ok(data)
    }

    /// Poll the health of the newly deployed target applications once.
    ///
    /// Transient backend errors are treated as still-pending; bounding the
    /// wait is the caller's job via its timeout.
    pub async fn check_targets(
        &self,
        report: &ReleaseAnalysisReport,
        target_data: &AppDeployerData,
    ) -> Result<TargetHealth> {
        if report.apps_to_upgrade.is_empty() {
            return Ok(TargetHealth::Healthy);
        }

        let manager = self.registry.resolve_for(&report.replacing)?;
        let statuses = match manager
            .app_statuses(&report.replacing, target_data, &report.apps_to_upgrade)
            .await
        {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(
                    release = %report.replacing.name,
                    error = %e,
                    "Health poll failed; treating target applications as pending"
                );
                return Ok(TargetHealth::Pending);
            }
        };

        for status in &statuses {
            if status.health == AppHealth::Failed {
                return Ok(TargetHealth::Failed(format!(
                    "application '{}' failed: {}",
                    status.app, status.detail
                )));
            }
        }
        if statuses.iter().all(|s| s.health == AppHealth::Healthy) {
            Ok(TargetHealth::Healthy)
        } else {
            Ok(TargetHealth::Pending)
        }
    }

    /// Commit the upgrade: mark the replacing release DEPLOYED and carry
    /// the untouched applications' backend ids forward so the new version
    /// logically owns them without any backend action.
    pub async fn commit(
        &self,
        report: &ReleaseAnalysisReport,
        target_data: &AppDeployerData,
    ) -> Result<Release> {
        let existing = &report.existing;
        let replacing = &report.replacing;

        let mut merged = AppDeployerData::empty(&replacing.name, replacing.version);
        merged.deployment_ids = target_data.deployment_ids.clone();
        if let Some(existing_data) = self
            .store
            .get_app_deployer_data(&existing.name, existing.version)
            .await?
        {
            for (app, id) in existing_data.deployment_ids {
                if !report.apps_to_upgrade.contains(&app) {
                    merged.deployment_ids.entry(app).or_insert(id);
                }
            }
        }
        self.store.save_app_deployer_data(&merged).await?;

        let description = if report.apps_to_upgrade.is_empty() {
            "Upgrade complete: no applications changed".to_string()
        } else {
            "Upgrade complete".to_string()
        };
        let committed = update_with_retry(
            self.store.as_ref(),
            &replacing.name,
            replacing.version,
            move |r| r.mark_deployed(description.clone(), Utc::now()),
        )
        .await?;

        info!(
            release = %replacing.name,
            version = replacing.version,
            "Upgrade committed"
        );
        Ok(committed)
    }

    /// Delete the old versions of only the replaced applications and mark
    /// the superseded release DELETED.
    ///
    /// Storage errors are re-thrown unchanged; any other delete failure is
    /// caught, the superseded release is marked FAILED with a manual
    /// intervention description, and the error is not propagated so the
    /// state machine still reaches its exit transition.
    pub async fn delete_source_apps(&self, report: &ReleaseAnalysisReport) -> Result<()> {
        let existing = &report.existing;
        let replacing = &report.replacing;
        let superseded = format!("Superseded by version {}", replacing.version);

        if report.apps_to_upgrade.is_empty() {
            update_with_retry(
                self.store.as_ref(),
                &existing.name,
                existing.version,
                move |r| r.mark_deleted(superseded.clone(), Utc::now()),
            )
            .await?;
            return Ok(());
        }

        let manager = self.registry.resolve_for(existing)?;
        let existing_data = self
            .store
            .get_app_deployer_data(&existing.name, existing.version)
            .await?
            .unwrap_or_else(|| AppDeployerData::empty(&existing.name, existing.version));

        match manager
            .delete_apps(existing, &existing_data, &report.apps_to_upgrade)
            .await
        {
            Ok(()) => {
                update_with_retry(
                    self.store.as_ref(),
                    &existing.name,
                    existing.version,
                    move |r| r.mark_deleted(superseded.clone(), Utc::now()),
                )
                .await?;
                info!(
                    release = %existing.name,
                    version = existing.version,
                    apps = ?report.apps_to_upgrade,
                    "Superseded source applications deleted"
                );
                Ok(())
            }
            Err(e) if e.is_storage() => Err(e),
            Err(e) => {
                warn!(
                    release = %existing.name,
                    version = existing.version,
                    error = %e,
                    "Delete of superseded applications failed"
                );
                let description = format!(
                    "Delete of superseded applications failed: {}; manual intervention needed",
                    e
                );
                update_with_retry(
                    self.store.as_ref(),
                    &existing.name,
                    existing.version,
                    move |r| r.mark_failed(description.clone(), Utc::now()),
                )
                .await?;
                Ok(())
            }
        }
    }

    /// Cancel the upgrade: delete the newly deployed target applications
    /// and mark the replacing release FAILED. The existing release and its
    /// applications are left untouched and still DEPLOYED.
    pub async fn cancel(
        &self,
        report: &ReleaseAnalysisReport,
        target_data: Option<&AppDeployerData>,
        reason: &CancelReason,
    ) -> Result<Release> {
        let replacing = &report.replacing;

        if let Some(data) = target_data
            && !report.apps_to_upgrade.is_empty()
        {
            let manager = self.registry.resolve_for(replacing)?;
            match manager
                .delete_apps(replacing, data, &report.apps_to_upgrade)
                .await
            {
                Ok(()) => {
                    info!(
                        release = %replacing.name,
                        version = replacing.version,
                        apps = ?report.apps_to_upgrade,
                        "Cancelled target applications deleted"
                    );
                }
                Err(e) if e.is_storage() => return Err(e),
                Err(e) => {
                    warn!(
                        release = %replacing.name,
                        version = replacing.version,
                        error = %e,
                        "Delete of cancelled target applications failed"
                    );
                    let description = format!(
                        "{}; delete of target applications failed: {}; manual intervention needed",
                        reason.describe(),
                        e
                    );
                    return update_with_retry(
                        self.store.as_ref(),
                        &replacing.name,
                        replacing.version,
                        move |r| r.mark_failed(description.clone(), Utc::now()),
                    )
                    .await;
                }
            }
        }

        let description = reason.describe();
        update_with_retry(
            self.store.as_ref(),
            &replacing.name,
            replacing.version,
            move |r| r.mark_failed(description.clone(), Utc::now()),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{MockReleaseManager, ReleaseManager};
    use crate::release::{PackageRef, StatusCode};
    use crate::store::MemoryReleaseStore;

    const V1: &str = r#"{
        "kind": "mock",
        "apps": {
            "api": {"image": "registry/api:1.0"},
            "worker": {"image": "registry/worker:1.0"}
        }
    }"#;

    const V2_WORKER_ONLY: &str = r#"{
        "kind": "mock",
        "apps": {
            "api": {"image": "registry/api:1.0"},
            "worker": {"image": "registry/worker:1.1"}
        }
    }"#;

    fn release(version: i64, manifest: &str) -> Release {
        Release::new(
            "orders",
            version,
            manifest,
            PackageRef {
                name: "orders-pkg".to_string(),
                version: format!("1.0.{}", version - 1),
            },
            serde_json::json!({}),
            "default",
            Utc::now(),
        )
    }

    struct Fixture {
        store: Arc<MemoryReleaseStore>,
        manager: Arc<MockReleaseManager>,
        strategy: RedBlackStrategy,
        existing: Release,
    }

    /// Seed a deployed v1 through the mock manager so its deployer data
    /// and live deployments exist, like after a real install.
    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryReleaseStore::new());
        let manager = Arc::new(MockReleaseManager::new());
        let mut registry = ManagerRegistry::new();
        registry.register(manager.clone());
        let registry = Arc::new(registry);

        let (existing, data) = manager.install(release(1, V1)).await.unwrap();
        store.insert_release(&existing).await.unwrap();
        store.save_app_deployer_data(&data).await.unwrap();

        let strategy = RedBlackStrategy::new(store.clone(), registry);
        Fixture {
            store,
            manager,
            strategy,
            existing,
        }
    }

    #[tokio::test]
    async fn test_minimal_diff_upgrade_commit() {
        let f = fixture().await;
        let v1_data = f
            .store
            .get_app_deployer_data("orders", 1)
            .await
            .unwrap()
            .unwrap();
        let api_v1_id = v1_data.id_for("api").unwrap().to_string();
        let worker_v1_id = v1_data.id_for("worker").unwrap().to_string();

        let replacing = release(2, V2_WORKER_ONLY);
        let report = f
            .strategy
            .analyze(&f.existing, &replacing, true, false, None)
            .await
            .unwrap();
        assert_eq!(report.apps_to_upgrade, vec!["worker".to_string()]);

        let target_data = f.strategy.deploy_targets(&report).await.unwrap();
        assert_eq!(target_data.deployment_ids.len(), 1);

        assert_eq!(
            f.strategy.check_targets(&report, &target_data).await.unwrap(),
            TargetHealth::Healthy
        );

        f.strategy.commit(&report, &target_data).await.unwrap();
        f.strategy.delete_source_apps(&report).await.unwrap();

        // v2 is deployed, v1 superseded.
        let v2 = f.store.get_release("orders", 2).await.unwrap().unwrap();
        assert_eq!(v2.release.status_code(), StatusCode::Deployed);
        let v1 = f.store.get_release("orders", 1).await.unwrap().unwrap();
        assert_eq!(v1.release.status_code(), StatusCode::Deleted);

        // api kept its original backend deployment id across v1 -> v2.
        let v2_data = f
            .store
            .get_app_deployer_data("orders", 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v2_data.id_for("api"), Some(api_v1_id.as_str()));
        assert!(f.manager.has_deployment(&api_v1_id).await);

        // The old worker instance is gone; the new one is live.
        assert!(!f.manager.has_deployment(&worker_v1_id).await);
        assert_ne!(v2_data.id_for("worker"), Some(worker_v1_id.as_str()));

        // api was never redeployed.
        let deploys = f.manager.calls_with_prefix("deploy:orders/2").await;
        assert_eq!(deploys, vec!["deploy:orders/2:worker".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_diff_is_noop_commit() {
        let f = fixture().await;
        let calls_before = f.manager.calls().await.len();

        let replacing = release(2, V1);
        let report = f
            .strategy
            .analyze(&f.existing, &replacing, true, false, None)
            .await
            .unwrap();
        assert!(report.apps_to_upgrade.is_empty());

        let target_data = f.strategy.deploy_targets(&report).await.unwrap();
        assert_eq!(
            f.strategy.check_targets(&report, &target_data).await.unwrap(),
            TargetHealth::Healthy
        );
        f.strategy.commit(&report, &target_data).await.unwrap();
        f.strategy.delete_source_apps(&report).await.unwrap();

        // No backend deploy/delete happened, yet v2 is the DEPLOYED latest.
        assert_eq!(f.manager.calls().await.len(), calls_before);
        let v2 = f.store.latest_release("orders").await.unwrap().unwrap();
        assert_eq!(v2.release.version, 2);
        assert_eq!(v2.release.status_code(), StatusCode::Deployed);

        // Every app id carried forward.
        let v2_data = f
            .store
            .get_app_deployer_data("orders", 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v2_data.deployment_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_health_check_detected() {
        let f = fixture().await;
        let replacing = release(2, V2_WORKER_ONLY);
        let report = f
            .strategy
            .analyze(&f.existing, &replacing, true, false, None)
            .await
            .unwrap();
        let target_data = f.strategy.deploy_targets(&report).await.unwrap();

        f.manager
            .set_app_health("worker", AppHealth::Failed)
            .await;
        let health = f.strategy.check_targets(&report, &target_data).await.unwrap();
        assert!(matches!(health, TargetHealth::Failed(ref d) if d.contains("worker")));
    }

    #[tokio::test]
    async fn test_pending_while_starting() {
        let f = fixture().await;
        let replacing = release(2, V2_WORKER_ONLY);
        let report = f
            .strategy
            .analyze(&f.existing, &replacing, true, false, None)
            .await
            .unwrap();
        let target_data = f.strategy.deploy_targets(&report).await.unwrap();

        f.manager
            .set_app_health("worker", AppHealth::Starting)
            .await;
        assert_eq!(
            f.strategy.check_targets(&report, &target_data).await.unwrap(),
            TargetHealth::Pending
        );

        // Transient poll errors also read as pending, never as failure.
        f.manager.set_fail_status(true);
        assert_eq!(
            f.strategy.check_targets(&report, &target_data).await.unwrap(),
            TargetHealth::Pending
        );
    }

    #[tokio::test]
    async fn test_cancel_on_timeout_deletes_targets_and_keeps_existing() {
        let f = fixture().await;
        let replacing = release(2, V2_WORKER_ONLY);
        let report = f
            .strategy
            .analyze(&f.existing, &replacing, true, false, None)
            .await
            .unwrap();
        let target_data = f.strategy.deploy_targets(&report).await.unwrap();
        let new_worker_id = target_data.id_for("worker").unwrap().to_string();

        let failed = f
            .strategy
            .cancel(&report, Some(&target_data), &CancelReason::TimedOut(30_000))
            .await
            .unwrap();

        assert_eq!(failed.status_code(), StatusCode::Failed);
        let description = &failed.info.as_ref().unwrap().status.description;
        assert!(description.contains("30000ms"), "got: {description}");

        // New worker deleted, old deployment untouched, v1 still DEPLOYED.
        assert!(!f.manager.has_deployment(&new_worker_id).await);
        let v1 = f.store.get_release("orders", 1).await.unwrap().unwrap();
        assert_eq!(v1.release.status_code(), StatusCode::Deployed);
        assert_eq!(
            f.manager.deployed_apps("orders", 1).await,
            vec!["api".to_string(), "worker".to_string()]
        );
    }

    #[tokio::test]
    async fn test_cancel_requested_description() {
        let f = fixture().await;
        let replacing = release(2, V2_WORKER_ONLY);
        let report = f
            .strategy
            .analyze(&f.existing, &replacing, true, false, None)
            .await
            .unwrap();
        let target_data = f.strategy.deploy_targets(&report).await.unwrap();

        let failed = f
            .strategy
            .cancel(&report, Some(&target_data), &CancelReason::Requested)
            .await
            .unwrap();
        let description = &failed.info.as_ref().unwrap().status.description;
        assert!(description.contains("cancelled"), "got: {description}");
        assert!(!description.contains("timed out"));
    }

    #[tokio::test]
    async fn test_delete_failure_marks_manual_intervention() {
        let f = fixture().await;
        let replacing = release(2, V2_WORKER_ONLY);
        let report = f
            .strategy
            .analyze(&f.existing, &replacing, true, false, None)
            .await
            .unwrap();
        let target_data = f.strategy.deploy_targets(&report).await.unwrap();
        f.strategy.commit(&report, &target_data).await.unwrap();

        f.manager.set_fail_deletes(true);
        // Swallowed: the machine must still reach its exit transition.
        f.strategy.delete_source_apps(&report).await.unwrap();

        let v1 = f.store.get_release("orders", 1).await.unwrap().unwrap();
        assert_eq!(v1.release.status_code(), StatusCode::Failed);
        assert!(
            v1.release
                .info
                .as_ref()
                .unwrap()
                .status
                .description
                .contains("manual intervention needed")
        );
    }

    #[tokio::test]
    async fn test_storage_errors_are_rethrown() {
        let f = fixture().await;
        let replacing = release(2, V2_WORKER_ONLY);
        let report = f
            .strategy
            .analyze(&f.existing, &replacing, true, false, None)
            .await
            .unwrap();
        let target_data = f.strategy.deploy_targets(&report).await.unwrap();

        f.store.set_fail_all(true);
        let err = f.strategy.commit(&report, &target_data).await.unwrap_err();
        assert!(err.is_storage());
    }

    #[test]
    fn test_cancel_reason_roundtrip() {
        for reason in [
            CancelReason::TimedOut(30_000),
            CancelReason::Requested,
            CancelReason::HealthCheckFailed("application 'worker' failed".to_string()),
        ] {
            assert_eq!(CancelReason::parse(&reason.encode()), reason);
        }
        assert_eq!(CancelReason::parse("garbage"), CancelReason::Requested);
    }
}
