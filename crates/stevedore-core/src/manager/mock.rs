// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock release manager for testing.
//!
//! A simple manager implementation that simulates platform deployments
//! without touching any real backend. Health outcomes are controllable so
//! tests can drive the upgrade strategy down its success, failure and
//! timeout paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::release::{AppDeployerData, AppHealth, AppStatus, Release, Status};
use crate::requests::ScaleRequest;

use super::ReleaseManager;

#[derive(Debug, Clone)]
struct Deployment {
    release_name: String,
    release_version: i64,
    app: String,
}

#[derive(Default)]
struct MockState {
    // deployment id -> deployment
    deployments: HashMap<String, Deployment>,
    health_overrides: HashMap<String, AppHealth>,
    logs: HashMap<String, String>,
    calls: Vec<String>,
}

/// Mock release manager for testing.
pub struct MockReleaseManager {
    state: Arc<Mutex<MockState>>,
    default_health: std::sync::Mutex<AppHealth>,
    fail_deploys: AtomicBool,
    fail_deletes: AtomicBool,
    fail_status: AtomicBool,
}

impl Default for MockReleaseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MockReleaseManager {
    /// Create a new mock manager; deployed apps report healthy.
    pub fn new() -> Self {
        Self::with_default_health(AppHealth::Healthy)
    }

    /// Create a mock manager whose deploy calls fail.
    pub fn failing() -> Self {
        let manager = Self::new();
        manager.fail_deploys.store(true, Ordering::SeqCst);
        manager
    }

    /// Create a mock manager whose deployed apps never become healthy.
    /// Useful for driving the upgrade timeout path.
    pub fn never_healthy() -> Self {
        Self::with_default_health(AppHealth::Starting)
    }

    fn with_default_health(health: AppHealth) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            default_health: std::sync::Mutex::new(health),
            fail_deploys: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            fail_status: AtomicBool::new(false),
        }
    }

    /// Override the reported health of a single application.
    pub async fn set_app_health(&self, app: &str, health: AppHealth) {
        self.state
            .lock()
            .await
            .health_overrides
            .insert(app.to_string(), health);
    }

    /// Set the health newly deployed apps report by default.
    pub fn set_default_health(&self, health: AppHealth) {
        *self.default_health.lock().unwrap_or_else(|e| e.into_inner()) = health;
    }

    /// Toggle failing delete calls.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Toggle failing status calls.
    pub fn set_fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    /// Record a log line for an application.
    pub async fn set_log(&self, app: &str, text: &str) {
        self.state
            .lock()
            .await
            .logs
            .insert(app.to_string(), text.to_string());
    }

    /// Recorded backend calls, in order.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    /// Recorded backend calls whose label starts with the given prefix.
    pub async fn calls_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Total live deployments across all releases.
    pub async fn deployment_count(&self) -> usize {
        self.state.lock().await.deployments.len()
    }

    /// Whether the given deployment id is still live.
    pub async fn has_deployment(&self, deployment_id: &str) -> bool {
        self.state.lock().await.deployments.contains_key(deployment_id)
    }

    /// App names with live deployments for a release version.
    pub async fn deployed_apps(&self, name: &str, version: i64) -> Vec<String> {
        let state = self.state.lock().await;
        let mut apps: Vec<String> = state
            .deployments
            .values()
            .filter(|d| d.release_name == name && d.release_version == version)
            .map(|d| d.app.clone())
            .collect();
        apps.sort_unstable();
        apps
    }

    fn health_for(&self, state: &MockState, app: &str, deployed: bool) -> AppHealth {
        if !deployed {
            return AppHealth::Absent;
        }
        match state.health_overrides.get(app) {
            Some(health) => *health,
            None => *self.default_health.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

#[async_trait]
impl ReleaseManager for MockReleaseManager {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn install(&self, release: Release) -> Result<(Release, AppDeployerData)> {
        let apps = release.parsed_manifest()?.app_names();
        let data = self.deploy_apps(&release, &apps).await?;
        let mut release = release;
        release.mark_deployed("Install complete", Utc::now());
        Ok((release, data))
    }

    async fn delete(&self, release: Release, data: &AppDeployerData) -> Result<Release> {
        let apps: Vec<String> = data.deployment_ids.keys().cloned().collect();
        self.delete_apps(&release, data, &apps).await?;
        let mut release = release;
        release.mark_deleted("Delete complete", Utc::now());
        Ok(release)
    }

    async fn status(&self, release: Release, data: &AppDeployerData) -> Result<Release> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(Error::manager("status", "backend unreachable"));
        }
        let apps: Vec<String> = data.deployment_ids.keys().cloned().collect();
        let app_statuses = self.app_statuses(&release, data, &apps).await?;
        let mut release = release;
        let code = release.status_code();
        release.merge_status(&Status {
            code,
            description: String::new(),
            app_statuses,
        });
        Ok(release)
    }

    async fn get_log(
        &self,
        _release: &Release,
        data: &AppDeployerData,
        app: Option<&str>,
    ) -> Result<String> {
        let state = self.state.lock().await;
        match app {
            Some(app) => Ok(state.logs.get(app).cloned().unwrap_or_default()),
            None => {
                let mut out = String::new();
                for app in data.deployment_ids.keys() {
                    if let Some(log) = state.logs.get(app) {
                        out.push_str(log);
                        out.push('\n');
                    }
                }
                Ok(out)
            }
        }
    }

    async fn scale(
        &self,
        release: &Release,
        data: &AppDeployerData,
        request: &ScaleRequest,
    ) -> Result<Release> {
        let mut state = self.state.lock().await;
        for scale in &request.apps {
            if data.id_for(&scale.app).is_none() {
                // Fire-and-forget per application: unknown apps are logged
                // and skipped, the batch continues.
                tracing::warn!(
                    release = %release.name,
                    app = %scale.app,
                    "Scale skipped: no deployment recorded for application"
                );
                continue;
            }
            state
                .calls
                .push(format!("scale:{}:{}", scale.app, scale.instances));
        }
        let mut release = release.clone();
        if let Some(info) = release.info.as_mut() {
            info.status.description = "Scale complete".to_string();
        }
        Ok(release)
    }

    async fn deploy_apps(&self, release: &Release, apps: &[String]) -> Result<AppDeployerData> {
        if self.fail_deploys.load(Ordering::SeqCst) {
            return Err(Error::manager("deploy", "backend rejected deployment"));
        }
        let mut state = self.state.lock().await;
        let mut data = AppDeployerData::empty(&release.name, release.version);
        for app in apps {
            let deployment_id = format!(
                "{}-v{}-{}-{}",
                release.name,
                release.version,
                app,
                &Uuid::new_v4().to_string()[..8]
            );
            state.deployments.insert(
                deployment_id.clone(),
                Deployment {
                    release_name: release.name.clone(),
                    release_version: release.version,
                    app: app.clone(),
                },
            );
            state
                .calls
                .push(format!("deploy:{}/{}:{}", release.name, release.version, app));
            data.deployment_ids.insert(app.clone(), deployment_id);
        }
        Ok(data)
    }

    async fn delete_apps(
        &self,
        release: &Release,
        data: &AppDeployerData,
        apps: &[String],
    ) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::manager("delete", "backend rejected delete"));
        }
        let mut state = self.state.lock().await;
        for app in apps {
            // An app without a recorded id was never deployed; absent is
            // not an error.
            if let Some(id) = data.id_for(app) {
                state.deployments.remove(id);
            }
            state
                .calls
                .push(format!("delete:{}/{}:{}", release.name, release.version, app));
        }
        Ok(())
    }

    async fn app_statuses(
        &self,
        _release: &Release,
        data: &AppDeployerData,
        apps: &[String],
    ) -> Result<Vec<AppStatus>> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(Error::manager("status", "backend unreachable"));
        }
        let state = self.state.lock().await;
        let mut statuses = Vec::with_capacity(apps.len());
        for app in apps {
            let deployed = data
                .id_for(app)
                .map(|id| state.deployments.contains_key(id))
                .unwrap_or(false);
            let health = self.health_for(&state, app, deployed);
            statuses.push(AppStatus {
                app: app.clone(),
                health,
                detail: String::new(),
            });
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::PackageRef;

    fn release(version: i64) -> Release {
        Release::new(
            "orders",
            version,
            r#"{
                "kind": "mock",
                "apps": {
                    "api": {"image": "registry/api:1.0"},
                    "worker": {"image": "registry/worker:1.0"}
                }
            }"#,
            PackageRef {
                name: "orders-pkg".to_string(),
                version: "1.0.0".to_string(),
            },
            serde_json::json!({}),
            "default",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_install_deploys_all_apps() {
        let manager = MockReleaseManager::new();
        let (installed, data) = manager.install(release(1)).await.unwrap();

        assert_eq!(
            installed.status_code(),
            crate::release::StatusCode::Deployed
        );
        assert_eq!(data.deployment_ids.len(), 2);
        assert_eq!(manager.deployment_count().await, 2);
        assert_eq!(
            manager.deployed_apps("orders", 1).await,
            vec!["api".to_string(), "worker".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_tears_down() {
        let manager = MockReleaseManager::new();
        let (installed, data) = manager.install(release(1)).await.unwrap();

        let deleted = manager.delete(installed, &data).await.unwrap();
        assert_eq!(deleted.status_code(), crate::release::StatusCode::Deleted);
        assert_eq!(manager.deployment_count().await, 0);
    }

    #[tokio::test]
    async fn test_status_reports_per_app_health() {
        let manager = MockReleaseManager::new();
        let (installed, data) = manager.install(release(1)).await.unwrap();
        manager.set_app_health("worker", AppHealth::Failed).await;

        let refreshed = manager.status(installed, &data).await.unwrap();
        let statuses = &refreshed.info.as_ref().unwrap().status.app_statuses;
        assert_eq!(statuses.len(), 2);
        let worker = statuses.iter().find(|s| s.app == "worker").unwrap();
        assert_eq!(worker.health, AppHealth::Failed);
    }

    #[tokio::test]
    async fn test_app_statuses_absent_for_undeployed() {
        let manager = MockReleaseManager::new();
        let rel = release(1);
        let data = AppDeployerData::empty("orders", 1);
        let statuses = manager
            .app_statuses(&rel, &data, &["ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(statuses[0].health, AppHealth::Absent);
    }

    #[tokio::test]
    async fn test_failing_manager_rejects_deploys() {
        let manager = MockReleaseManager::failing();
        let err = manager.install(release(1)).await.unwrap_err();
        assert!(matches!(err, Error::Manager { .. }));
    }

    #[tokio::test]
    async fn test_get_log_absent_app_is_empty() {
        let manager = MockReleaseManager::new();
        let (installed, data) = manager.install(release(1)).await.unwrap();
        manager.set_log("api", "api started").await;

        let log = manager
            .get_log(&installed, &data, Some("api"))
            .await
            .unwrap();
        assert_eq!(log, "api started");

        let absent = manager
            .get_log(&installed, &data, Some("ghost"))
            .await
            .unwrap();
        assert!(absent.is_empty());
    }

    #[tokio::test]
    async fn test_scale_skips_unknown_apps() {
        let manager = MockReleaseManager::new();
        let (installed, data) = manager.install(release(1)).await.unwrap();

        let request = ScaleRequest {
            name: "orders".to_string(),
            apps: vec![
                crate::requests::AppScale {
                    app: "api".to_string(),
                    instances: 3,
                    properties: Default::default(),
                },
                crate::requests::AppScale {
                    app: "ghost".to_string(),
                    instances: 1,
                    properties: Default::default(),
                },
            ],
        };
        manager.scale(&installed, &data, &request).await.unwrap();

        let calls = manager.calls_with_prefix("scale:").await;
        assert_eq!(calls, vec!["scale:api:3".to_string()]);
    }
}
