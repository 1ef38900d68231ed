// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Release manager trait definitions.
//!
//! Defines the abstract interface every platform backend implements, plus
//! the registry that maps a manifest's platform kind to an implementation.
//!
//! Release managers are PURE deployment engines - they do NOT access the
//! release store. Durable bookkeeping (release records, deployer data,
//! snapshots) is handled by the caller.

pub mod mock;

pub use self::mock::MockReleaseManager;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::diff::{self, ReleaseAnalysisReport};
use crate::error::{Error, Result};
use crate::release::{AppDeployerData, AppStatus, Release};
use crate::requests::ScaleRequest;

/// Trait for platform release managers.
///
/// One implementation exists per supported platform kind; the registry
/// selects it by the `kind` field of a release's rendered manifest.
#[async_trait]
pub trait ReleaseManager: Send + Sync {
    /// Platform kind identifier this manager serves (e.g. "local",
    /// "cloudfoundry", "kubernetes").
    fn kind(&self) -> &'static str;

    /// Deploy every application described by the release and return the
    /// release with status DEPLOYED plus the recorded backend deployment
    /// ids. The state machine guarantees single dispatch per version.
    async fn install(&self, release: Release) -> Result<(Release, AppDeployerData)>;

    /// Tear down all backend resources of a release version and return it
    /// with status DELETED.
    async fn delete(&self, release: Release, data: &AppDeployerData) -> Result<Release>;

    /// Query live per-application health and merge it into the release's
    /// info block. A backend reporting "not found" for an application is
    /// healthy-absent, not an error; ordinary polling must not throw.
    async fn status(&self, release: Release, data: &AppDeployerData) -> Result<Release>;

    /// Best-effort application log retrieval. An absent application yields
    /// an empty result, not an error.
    async fn get_log(
        &self,
        release: &Release,
        data: &AppDeployerData,
        app: Option<&str>,
    ) -> Result<String>;

    /// Adjust instance counts per named application. Fire-and-forget per
    /// application: failures are logged per-application and do not abort
    /// the batch.
    async fn scale(
        &self,
        release: &Release,
        data: &AppDeployerData,
        request: &ScaleRequest,
    ) -> Result<Release>;

    /// Deploy only the named applications of a release. Used by the
    /// red-black upgrade to deploy the changed subset.
    async fn deploy_apps(&self, release: &Release, apps: &[String]) -> Result<AppDeployerData>;

    /// Delete only the named applications of a release.
    async fn delete_apps(
        &self,
        release: &Release,
        data: &AppDeployerData,
        apps: &[String],
    ) -> Result<()>;

    /// Live health of the named applications.
    async fn app_statuses(
        &self,
        release: &Release,
        data: &AppDeployerData,
        apps: &[String],
    ) -> Result<Vec<AppStatus>>;

    /// Analyze an existing release against a replacing release.
    ///
    /// Delegates to the release differencer; backends with richer
    /// change-detection can override. Persisting the replacing release for
    /// crash recovery is the caller's job, like all durable bookkeeping.
    fn create_report(
        &self,
        existing: &Release,
        replacing: &Release,
        force_update: bool,
        names_override: Option<&[String]>,
    ) -> Result<ReleaseAnalysisReport> {
        diff::analyze(existing, replacing, force_update, names_override)
    }

    /// Monolithic upgrade path, kept for backends that cannot express the
    /// red-black protocol through the primitives. The generic loop never
    /// calls this; the upgrade strategy drives deploy/delete/status
    /// primitives instead.
    async fn upgrade(
        &self,
        existing: &Release,
        existing_data: &AppDeployerData,
        replacing: Release,
    ) -> Result<(Release, AppDeployerData)> {
        let apps = replacing.parsed_manifest()?.app_names();
        let data = self.deploy_apps(&replacing, &apps).await?;
        let old_apps = existing.parsed_manifest()?.app_names();
        self.delete_apps(existing, existing_data, &old_apps).await?;
        let mut replacing = replacing;
        replacing.mark_deployed("Upgrade complete", chrono::Utc::now());
        Ok((replacing, data))
    }
}

/// Registry mapping platform kind to release manager implementation.
///
/// Dispatch by kind happens exactly once per operation through this
/// registry instead of stringly-typed branching at call sites.
#[derive(Default)]
pub struct ManagerRegistry {
    managers: HashMap<&'static str, Arc<dyn ReleaseManager>>,
}

impl ManagerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manager under its platform kind. Replaces any previous
    /// registration for the same kind.
    pub fn register(&mut self, manager: Arc<dyn ReleaseManager>) {
        self.managers.insert(manager.kind(), manager);
    }

    /// Resolve a manager by platform kind.
    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn ReleaseManager>> {
        self.managers
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownPlatformKind(kind.to_string()))
    }

    /// Resolve the manager for a release from its rendered manifest.
    pub fn resolve_for(&self, release: &Release) -> Result<Arc<dyn ReleaseManager>> {
        self.resolve(&release.kind()?)
    }

    /// Registered platform kinds.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = self.managers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}
