// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entry actions of the release state machine.
//!
//! Every action follows one discipline: on success it returns the event
//! advancing the protocol; on a non-storage failure it marks the affected
//! release FAILED, records the error marker and returns `Exit` so the
//! normal exit transition carries the machine to the error junction.
//! Storage errors are re-thrown unchanged.

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::release::{AppDeployerData, Release};
use crate::requests::{
    DeleteRequest, InstallRequest, RollbackRequest, ScaleRequest, UpgradeRequest,
};
use crate::store::update_with_retry;
use crate::strategy::{CancelReason, TargetHealth};

use super::{Machine, MachineEvent, StateId};

impl Machine {
    pub(super) async fn dispatch_entry(
        &mut self,
        event: MachineEvent,
    ) -> Result<Option<MachineEvent>> {
        match self.state {
            StateId::Initial => {
                self.clear_transients();
                self.persist_snapshot().await?;
                Ok(None)
            }
            StateId::Install => self.enter_install(event).await,
            StateId::Delete => self.enter_delete(event).await,
            StateId::Scale => self.enter_scale(event).await,
            StateId::Rollback => self.enter_rollback(event).await,
            StateId::UpgradeStart => self.enter_upgrade_start(event).await,
            StateId::UpgradeDeployTargetApps => self.enter_deploy_targets().await,
            StateId::UpgradeWaitTargetApps => Ok(Some(self.enter_wait().await)),
            StateId::UpgradeCheckTargetApps => self.enter_check().await,
            StateId::UpgradeDeploySucceeded => self.enter_succeeded().await,
            StateId::UpgradeDeleteSourceApps => self.enter_delete_source().await,
            StateId::UpgradeDeployFailed => Ok(self.enter_deploy_failed()),
            StateId::UpgradeCancel => self.enter_cancel().await,
            StateId::ErrorJunction => Ok(None),
            StateId::Error => {
                self.enter_error();
                Ok(None)
            }
        }
    }

    pub(super) fn clear_transients(&mut self) {
        self.vars.persisted = Default::default();
        self.vars.existing = None;
        self.vars.replacing = None;
        self.vars.report = None;
        self.vars.target_data = None;
        self.vars.failure_detail = None;
    }

    /// Uniform failure handling for entry actions: storage errors bubble;
    /// anything else marks the affected release FAILED (validation errors
    /// excepted - they have no release to blame), records the marker and
    /// lets the exit transition run the funnel.
    async fn absorb_action_error(&mut self, e: Error) -> Result<Option<MachineEvent>> {
        if e.is_storage() {
            return Err(e);
        }
        if !e.is_validation() {
            self.mark_current_failed(&e.to_string()).await?;
        }
        self.vars.error = Some(e);
        Ok(Some(MachineEvent::Exit))
    }

    /// Set FAILED on the release the in-flight operation concerns: the
    /// version it created when one exists, else the latest.
    async fn mark_current_failed(&self, description: &str) -> Result<()> {
        let version = match self.vars.persisted.replacing_version {
            Some(version) => Some(version),
            None => self
                .deps
                .store
                .latest_release(&self.name)
                .await?
                .map(|r| r.release.version),
        };
        let Some(version) = version else {
            return Ok(());
        };
        let text = description.to_string();
        match update_with_retry(self.deps.store.as_ref(), &self.name, version, move |r| {
            r.mark_failed(text.clone(), Utc::now())
        })
        .await
        {
            Ok(_) => Ok(()),
            Err(Error::VersionNotFound { .. }) => Ok(()),
            Err(e) if e.is_storage() => Err(e),
            Err(e) => {
                warn!(release = %self.name, error = %e, "Failed to record FAILED status");
                Ok(())
            }
        }
    }

    // =========================================================================
    // Install / Delete / Scale / Rollback
    // =========================================================================

    async fn enter_install(&mut self, event: MachineEvent) -> Result<Option<MachineEvent>> {
        let MachineEvent::Install(request) = event else {
            return Err(Error::Other("install state entered without a request".to_string()));
        };
        match self.do_install(request).await {
            Ok(()) => Ok(Some(MachineEvent::Exit)),
            Err(e) => self.absorb_action_error(e).await,
        }
    }

    async fn do_install(&mut self, request: InstallRequest) -> Result<()> {
        let now = Utc::now();
        let version = self.deps.store.next_version(&self.name).await?;
        let release = Release::new(
            &self.name,
            version,
            request.manifest,
            request.package,
            request.config_values,
            request.platform_name,
            now,
        );

        // Record the version before any side effect so a crash can still
        // attribute the failure to the right record.
        self.vars.persisted.replacing_version = Some(version);
        self.persist_snapshot().await?;

        self.deps.store.insert_release(&release).await?;

        let manager = self.deps.registry.resolve_for(&release)?;
        let (installed, data) = manager.install(release).await?;
        self.deps.store.save_app_deployer_data(&data).await?;

        let info = installed.info.clone();
        update_with_retry(self.deps.store.as_ref(), &self.name, version, move |r| {
            r.info = info.clone();
        })
        .await?;

        info!(release = %self.name, version, "Install complete");
        Ok(())
    }

    async fn enter_delete(&mut self, event: MachineEvent) -> Result<Option<MachineEvent>> {
        let MachineEvent::Delete(request) = event else {
            return Err(Error::Other("delete state entered without a request".to_string()));
        };
        match self.do_delete(request).await {
            Ok(()) => Ok(Some(MachineEvent::Exit)),
            Err(e) => self.absorb_action_error(e).await,
        }
    }

    async fn do_delete(&mut self, request: DeleteRequest) -> Result<()> {
        let record = self
            .deps
            .store
            .latest_release(&self.name)
            .await?
            .ok_or_else(|| Error::ReleaseNotFound(self.name.clone()))?;
        let version = record.release.version;

        let data = self
            .deps
            .store
            .get_app_deployer_data(&self.name, version)
            .await?
            .unwrap_or_else(|| AppDeployerData::empty(&self.name, version));

        let manager = self.deps.registry.resolve_for(&record.release)?;
        let mut deleted = manager.delete(record.release.clone(), &data).await?;

        if request.delete_package {
            let others = self
                .deps
                .store
                .count_releases_using_package(&deleted.package, &self.name)
                .await?;
            if others == 0 {
                info!(
                    release = %self.name,
                    package = %deleted.package,
                    "Package no longer referenced by any release"
                );
                if let Some(info) = deleted.info.as_mut() {
                    info.status.description.push_str("; package unreferenced");
                }
            } else {
                debug!(
                    release = %self.name,
                    package = %deleted.package,
                    references = others,
                    "Package still referenced; not released"
                );
            }
        }

        let info = deleted.info.clone();
        update_with_retry(self.deps.store.as_ref(), &self.name, version, move |r| {
            r.info = info.clone();
        })
        .await?;

        info!(release = %self.name, version, "Delete complete");
        Ok(())
    }

    async fn enter_scale(&mut self, event: MachineEvent) -> Result<Option<MachineEvent>> {
        let MachineEvent::Scale(request) = event else {
            return Err(Error::Other("scale state entered without a request".to_string()));
        };
        match self.do_scale(request).await {
            Ok(()) => Ok(Some(MachineEvent::Exit)),
            Err(e) => self.absorb_action_error(e).await,
        }
    }

    async fn do_scale(&mut self, request: ScaleRequest) -> Result<()> {
        let record = self
            .deps
            .store
            .latest_release(&self.name)
            .await?
            .ok_or_else(|| Error::ReleaseNotFound(self.name.clone()))?;
        let version = record.release.version;

        let data = self
            .deps
            .store
            .get_app_deployer_data(&self.name, version)
            .await?
            .unwrap_or_else(|| AppDeployerData::empty(&self.name, version));

        let manager = self.deps.registry.resolve_for(&record.release)?;
        let scaled = manager.scale(&record.release, &data, &request).await?;

        let info = scaled.info.clone();
        update_with_retry(self.deps.store.as_ref(), &self.name, version, move |r| {
            r.info = info.clone();
        })
        .await?;

        info!(release = %self.name, version, apps = request.apps.len(), "Scale complete");
        Ok(())
    }

    async fn enter_rollback(&mut self, event: MachineEvent) -> Result<Option<MachineEvent>> {
        let MachineEvent::Rollback(request) = event else {
            return Err(Error::Other("rollback state entered without a request".to_string()));
        };
        match self.build_rollback(request).await {
            Ok(next) => Ok(Some(next)),
            Err(e) => self.absorb_action_error(e).await,
        }
    }

    /// Rollback builds an install or upgrade request from the target
    /// version and re-dispatches; it is not a separate execution path.
    async fn build_rollback(&mut self, request: RollbackRequest) -> Result<MachineEvent> {
        // The service validated synchronously; re-resolving here is
        // authoritative because the machine runs serialized per name.
        let (latest, target) = crate::service::resolve_rollback_target(
            self.deps.store.as_ref(),
            &self.name,
            request.version,
        )
        .await?;

        info!(
            release = %self.name,
            from = latest.release.version,
            to = target.release.version,
            "Rolling back"
        );

        let target = target.release;
        if latest.release.status_code() == crate::release::StatusCode::Deleted {
            // Everything is torn down; rolling back is a fresh install of
            // the target version's content at a new version number.
            Ok(MachineEvent::Install(InstallRequest {
                name: self.name.clone(),
                platform_name: target.platform_name,
                package: target.package,
                config_values: target.config_values,
                manifest: target.manifest,
            }))
        } else {
            Ok(MachineEvent::Upgrade(UpgradeRequest {
                name: self.name.clone(),
                package: target.package,
                config_values: target.config_values,
                manifest: target.manifest,
                timeout: request.timeout,
                force_update: false,
                app_names: None,
            }))
        }
    }

    // =========================================================================
    // Red-black upgrade sub-machine
    // =========================================================================

    async fn enter_upgrade_start(&mut self, event: MachineEvent) -> Result<Option<MachineEvent>> {
        let MachineEvent::Upgrade(request) = event else {
            return Err(Error::Other("upgrade state entered without a request".to_string()));
        };
        match self.do_upgrade_start(request).await {
            Ok(()) => Ok(Some(MachineEvent::Proceed)),
            Err(e) => self.absorb_action_error(e).await,
        }
    }

    async fn do_upgrade_start(&mut self, request: UpgradeRequest) -> Result<()> {
        let existing = self
            .deps
            .store
            .latest_release(&self.name)
            .await?
            .ok_or_else(|| Error::ReleaseNotFound(self.name.clone()))?;
        if existing.release.status_code() != crate::release::StatusCode::Deployed {
            return Err(Error::InvalidReleaseState {
                name: self.name.clone(),
                expected: "DEPLOYED".to_string(),
                actual: existing.release.status_code().as_str().to_uppercase(),
            });
        }

        let now = Utc::now();
        let version = existing.release.version + 1;
        let replacing = Release::new(
            &self.name,
            version,
            request.manifest,
            request.package,
            request.config_values,
            existing.release.platform_name.clone(),
            now,
        );

        let timeout = request.timeout.unwrap_or(self.deps.default_upgrade_timeout);
        let timeout_ms = timeout.as_millis() as u64;

        // Record the version pair before any side effect so a failure here
        // is attributed to the new version, never the deployed one.
        self.vars.persisted.existing_version = Some(existing.release.version);
        self.vars.persisted.replacing_version = Some(version);

        let report = self
            .deps
            .strategy
            .analyze(
                &existing.release,
                &replacing,
                true,
                request.force_update,
                request.app_names.as_deref(),
            )
            .await?;

        self.vars.persisted.apps_to_upgrade = Some(report.apps_to_upgrade.clone());
        self.vars.persisted.force_update = request.force_update;
        self.vars.persisted.timeout_ms = Some(timeout_ms);
        self.vars.persisted.deadline = Some(now + chrono::Duration::milliseconds(timeout_ms as i64));
        self.persist_snapshot().await?;

        self.vars.existing = Some(existing.release);
        self.vars.replacing = Some(replacing);
        self.vars.report = Some(report);
        Ok(())
    }

    async fn enter_deploy_targets(&mut self) -> Result<Option<MachineEvent>> {
        let outcome = match self.vars.report.as_ref() {
            Some(report) => self.deps.strategy.deploy_targets(report).await,
            None => Err(Error::Other("upgrade analysis report missing".to_string())),
        };
        match outcome {
            Ok(data) => {
                self.vars.target_data = Some(data);
                Ok(Some(MachineEvent::Proceed))
            }
            Err(e) => self.absorb_action_error(e).await,
        }
    }

    /// The machine's only suspension point: sleep one health-check period
    /// or wake early on an explicit cancel.
    async fn enter_wait(&mut self) -> MachineEvent {
        let sleep = self.deps.health_check_sleep;
        let cancel = self.deps.cancel.clone();
        tokio::select! {
            biased;

            _ = cancel.notified() => {
                self.vars.persisted.cancel_reason = Some(CancelReason::Requested.encode());
                MachineEvent::Cancel
            }

            _ = tokio::time::sleep(sleep) => {
                if self.deadline_expired() {
                    let ms = self.vars.persisted.timeout_ms.unwrap_or(0);
                    self.vars.persisted.cancel_reason = Some(CancelReason::TimedOut(ms).encode());
                    MachineEvent::Cancel
                } else {
                    MachineEvent::Timer
                }
            }
        }
    }

    fn deadline_expired(&self) -> bool {
        self.vars
            .persisted
            .deadline
            .map(|deadline| Utc::now() >= deadline)
            .unwrap_or(false)
    }

    async fn enter_check(&mut self) -> Result<Option<MachineEvent>> {
        let outcome = match self.vars.report.as_ref() {
            Some(report) => {
                let empty;
                let data = match self.vars.target_data.as_ref() {
                    Some(data) => data,
                    None => {
                        empty = AppDeployerData::empty(&self.name, report.replacing.version);
                        &empty
                    }
                };
                self.deps.strategy.check_targets(report, data).await
            }
            None => Err(Error::Other("upgrade analysis report missing".to_string())),
        };

        match outcome {
            Ok(TargetHealth::Healthy) => Ok(Some(MachineEvent::TargetAppsHealthy)),
            Ok(TargetHealth::Failed(detail)) => {
                self.vars.failure_detail = Some(detail);
                Ok(Some(MachineEvent::TargetAppsFailed))
            }
            Ok(TargetHealth::Pending) => {
                if self.deadline_expired() {
                    let ms = self.vars.persisted.timeout_ms.unwrap_or(0);
                    self.vars.persisted.cancel_reason =
                        Some(CancelReason::TimedOut(ms).encode());
                    Ok(Some(MachineEvent::Cancel))
                } else {
                    Ok(Some(MachineEvent::Proceed))
                }
            }
            Err(e) => self.absorb_action_error(e).await,
        }
    }

    async fn enter_succeeded(&mut self) -> Result<Option<MachineEvent>> {
        let outcome = match self.vars.report.as_ref() {
            Some(report) => {
                let empty;
                let data = match self.vars.target_data.as_ref() {
                    Some(data) => data,
                    None => {
                        empty = AppDeployerData::empty(&self.name, report.replacing.version);
                        &empty
                    }
                };
                self.deps.strategy.commit(report, data).await
            }
            None => Err(Error::Other("upgrade analysis report missing".to_string())),
        };
        match outcome {
            Ok(committed) => {
                self.vars.replacing = Some(committed);
                Ok(Some(MachineEvent::TargetAppsAccepted))
            }
            Err(e) => self.absorb_action_error(e).await,
        }
    }

    async fn enter_delete_source(&mut self) -> Result<Option<MachineEvent>> {
        let outcome = match self.vars.report.as_ref() {
            Some(report) => self.deps.strategy.delete_source_apps(report).await,
            None => Err(Error::Other("upgrade analysis report missing".to_string())),
        };
        match outcome {
            Ok(()) => Ok(Some(MachineEvent::Exit)),
            Err(e) => self.absorb_action_error(e).await,
        }
    }

    fn enter_deploy_failed(&mut self) -> Option<MachineEvent> {
        let detail = self
            .vars
            .failure_detail
            .take()
            .unwrap_or_else(|| "target applications failed".to_string());
        warn!(release = %self.name, detail = %detail, "Target applications failed health check");
        self.vars.persisted.cancel_reason =
            Some(CancelReason::HealthCheckFailed(detail).encode());
        Some(MachineEvent::Proceed)
    }

    async fn enter_cancel(&mut self) -> Result<Option<MachineEvent>> {
        let reason = self
            .vars
            .persisted
            .cancel_reason
            .take()
            .map(|s| CancelReason::parse(&s))
            .unwrap_or(CancelReason::Requested);

        let outcome = match self.vars.report.as_ref() {
            Some(report) => {
                self.deps
                    .strategy
                    .cancel(report, self.vars.target_data.as_ref(), &reason)
                    .await
            }
            None => Err(Error::Other("upgrade analysis report missing".to_string())),
        };
        match outcome {
            Ok(failed) => {
                self.vars.replacing = Some(failed);
                Ok(Some(MachineEvent::Exit))
            }
            Err(e) => self.absorb_action_error(e).await,
        }
    }

    fn enter_error(&mut self) {
        if let Some(e) = self.vars.error.take() {
            error!(release = %self.name, error = %e, "Lifecycle operation failed");
        }
    }

    // =========================================================================
    // Crash recovery
    // =========================================================================

    /// Reattach transient upgrade context from the store: reload both
    /// releases and the deployed target data, and recompute the analysis
    /// report pinned to the persisted changed-app set.
    pub(super) async fn reattach(&mut self) -> Result<()> {
        if self.vars.report.is_some() {
            return Ok(());
        }
        let (Some(existing_version), Some(replacing_version)) = (
            self.vars.persisted.existing_version,
            self.vars.persisted.replacing_version,
        ) else {
            return Err(Error::Other(format!(
                "snapshot for '{}' is missing upgrade context",
                self.name
            )));
        };

        let existing = self
            .deps
            .store
            .get_release(&self.name, existing_version)
            .await?
            .ok_or_else(|| Error::VersionNotFound {
                name: self.name.clone(),
                version: existing_version,
            })?;
        let replacing = self
            .deps
            .store
            .get_release(&self.name, replacing_version)
            .await?
            .ok_or_else(|| Error::VersionNotFound {
                name: self.name.clone(),
                version: replacing_version,
            })?;

        // Force + override pins the recomputed set to the persisted one.
        let apps = self.vars.persisted.apps_to_upgrade.clone().unwrap_or_default();
        let report = self
            .deps
            .strategy
            .analyze(&existing.release, &replacing.release, false, true, Some(&apps))
            .await?;

        self.vars.target_data = self
            .deps
            .store
            .get_app_deployer_data(&self.name, replacing_version)
            .await?;
        self.vars.existing = Some(existing.release);
        self.vars.replacing = Some(replacing.release);
        self.vars.report = Some(report);
        Ok(())
    }
}
