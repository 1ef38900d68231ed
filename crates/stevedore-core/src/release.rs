// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Release data model.
//!
//! A release is an immutable-once-created record identified by
//! `(name, version)`; version increases monotonically per name starting at
//! 1 and is never reused, also across delete/reinstall cycles. The mutable
//! part is the attached [`Info`] envelope, which only release managers and
//! the reconciliation loop update.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Release status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Release created, not yet confirmed deployed.
    Unknown,
    /// Release is deployed on the target platform.
    Deployed,
    /// Release failed to install, upgrade or delete.
    Failed,
    /// Release was deleted; the name can be re-installed at a higher version.
    Deleted,
}

impl StatusCode {
    /// Returns the string representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Deployed => "deployed",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }

    /// Parse a code from a string.
    pub fn parse(s: &str) -> Self {
        match s {
            "deployed" => Self::Deployed,
            "failed" => Self::Failed,
            "deleted" => Self::Deleted,
            _ => Self::Unknown,
        }
    }
}

/// Live health of one application instance as reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppHealth {
    /// Health not yet known.
    Unknown,
    /// Application is starting up.
    Starting,
    /// Application is running and healthy.
    Healthy,
    /// Application reported a terminal failure.
    Failed,
    /// Backend reports no such application. Treated as healthy-absent,
    /// never as an error (the app may simply not have been deployed yet or
    /// was already torn down).
    Absent,
}

/// Per-application platform status inside [`Status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStatus {
    /// Application name from the manifest.
    pub app: String,
    /// Reported health.
    pub health: AppHealth,
    /// Backend-specific detail text.
    #[serde(default)]
    pub detail: String,
}

/// Status envelope: code, human description and structured per-application
/// platform status.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    /// Overall status code.
    pub code: StatusCode,
    /// Human-readable description of how the release got here.
    pub description: String,
    /// Per-application platform status, refreshed by the reconciler.
    pub app_statuses: Vec<AppStatus>,
}

impl Status {
    /// New status with the given code and description, no app statuses yet.
    pub fn new(code: StatusCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            app_statuses: Vec::new(),
        }
    }
}

/// Mutable status envelope attached 1:1 to a release.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    /// Current status.
    pub status: Status,
    /// When the release name was first deployed.
    pub first_deployed: DateTime<Utc>,
    /// When this version was last deployed. `None` only on malformed
    /// records; the reconciler skips those defensively.
    pub last_deployed: Option<DateTime<Utc>>,
    /// When this version was deleted, if it was.
    pub deleted: Option<DateTime<Utc>>,
}

impl Info {
    /// New info block at creation time, status UNKNOWN.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: Status::new(StatusCode::Unknown, "Release created"),
            first_deployed: now,
            last_deployed: Some(now),
            deleted: None,
        }
    }

    /// Merge a freshly polled status into this info block.
    ///
    /// Must be safe to apply out of order relative to a concurrent
    /// deploy/delete: a poll result never resurrects a DELETED release and
    /// never downgrades a terminal code back to UNKNOWN with stale data.
    pub fn merge_status(&mut self, fresh: &Status) {
        if self.status.code == StatusCode::Deleted {
            return;
        }
        if fresh.code == StatusCode::Unknown && fresh.app_statuses.is_empty() {
            return;
        }
        if fresh.code != StatusCode::Unknown {
            self.status.code = fresh.code;
            if !fresh.description.is_empty() {
                self.status.description = fresh.description.clone();
            }
        }
        if !fresh.app_statuses.is_empty() {
            self.status.app_statuses = fresh.app_statuses.clone();
        }
    }
}

/// Reference to the source package a release was rendered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRef {
    /// Package name.
    pub name: String,
    /// Package version.
    pub version: String,
}

impl std::fmt::Display for PackageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// Flattened application manifest: canonical key/value properties.
pub type AppManifest = BTreeMap<String, String>;

/// Parsed rendered manifest.
///
/// Template rendering happens upstream; the rendered text reaching the
/// orchestrator is canonical JSON of this shape. The `kind` field selects
/// the release manager implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Target platform kind (selects the release manager).
    pub kind: String,
    /// Applications by name, each a flattened property map.
    pub apps: BTreeMap<String, AppManifest>,
}

impl Manifest {
    /// Parse a rendered manifest text blob.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Manifest(e.to_string()))
    }

    /// Render back to canonical text.
    pub fn render(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Application names in this manifest.
    pub fn app_names(&self) -> Vec<String> {
        self.apps.keys().cloned().collect()
    }
}

/// A versioned release of a packaged application set onto a platform.
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    /// Release name; the state machine serialization boundary.
    pub name: String,
    /// Version, strictly increasing per name starting at 1.
    pub version: i64,
    /// Rendered manifest text.
    pub manifest: String,
    /// Source package reference.
    pub package: PackageRef,
    /// Resolved configuration values used to render the manifest.
    pub config_values: serde_json::Value,
    /// Target platform name.
    pub platform_name: String,
    /// Mutable status envelope. `None` only on malformed records.
    pub info: Option<Info>,
}

impl Release {
    /// Create a new release record with an UNKNOWN status.
    pub fn new(
        name: impl Into<String>,
        version: i64,
        manifest: impl Into<String>,
        package: PackageRef,
        config_values: serde_json::Value,
        platform_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            manifest: manifest.into(),
            package,
            config_values,
            platform_name: platform_name.into(),
            info: Some(Info::new(now)),
        }
    }

    /// Parse the rendered manifest.
    pub fn parsed_manifest(&self) -> Result<Manifest> {
        Manifest::parse(&self.manifest)
    }

    /// Platform kind from the rendered manifest.
    pub fn kind(&self) -> Result<String> {
        Ok(self.parsed_manifest()?.kind)
    }

    /// Current status code, UNKNOWN when the info block is missing.
    pub fn status_code(&self) -> StatusCode {
        self.info
            .as_ref()
            .map(|i| i.status.code)
            .unwrap_or(StatusCode::Unknown)
    }

    /// Set status DEPLOYED with the given description and bump
    /// `last_deployed`.
    pub fn mark_deployed(&mut self, description: impl Into<String>, now: DateTime<Utc>) {
        let info = self.info.get_or_insert_with(|| Info::new(now));
        info.status = Status::new(StatusCode::Deployed, description);
        info.last_deployed = Some(now);
    }

    /// Set status FAILED with the given description.
    pub fn mark_failed(&mut self, description: impl Into<String>, now: DateTime<Utc>) {
        let info = self.info.get_or_insert_with(|| Info::new(now));
        info.status = Status::new(StatusCode::Failed, description);
    }

    /// Set status DELETED with the given description and record the
    /// deletion timestamp.
    pub fn mark_deleted(&mut self, description: impl Into<String>, now: DateTime<Utc>) {
        let info = self.info.get_or_insert_with(|| Info::new(now));
        info.status = Status::new(StatusCode::Deleted, description);
        info.deleted = Some(now);
    }

    /// Merge a freshly polled status into the info block. No-op on
    /// malformed records without info.
    pub fn merge_status(&mut self, fresh: &Status) {
        if let Some(info) = self.info.as_mut() {
            info.merge_status(fresh);
        }
    }
}

/// Backend deployment identifiers for each application a release version
/// owns. Later delete/status/scale calls address backend resources through
/// these ids instead of re-deriving them from the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDeployerData {
    /// Release name.
    pub release_name: String,
    /// Release version.
    pub release_version: i64,
    /// Backend deployment id per application name.
    pub deployment_ids: BTreeMap<String, String>,
}

impl AppDeployerData {
    /// Empty deployer data for a release version.
    pub fn empty(release_name: impl Into<String>, release_version: i64) -> Self {
        Self {
            release_name: release_name.into(),
            release_version,
            deployment_ids: BTreeMap::new(),
        }
    }

    /// Deployment id for an application, if recorded.
    pub fn id_for(&self, app: &str) -> Option<&str> {
        self.deployment_ids.get(app).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_text() -> String {
        r#"{
            "kind": "mock",
            "apps": {
                "api": {"image": "registry/api:1.0", "instances": "2"},
                "worker": {"image": "registry/worker:1.0", "instances": "1"}
            }
        }"#
        .to_string()
    }

    #[test]
    fn test_status_code_roundtrip() {
        for code in [
            StatusCode::Unknown,
            StatusCode::Deployed,
            StatusCode::Failed,
            StatusCode::Deleted,
        ] {
            assert_eq!(StatusCode::parse(code.as_str()), code);
        }
        assert_eq!(StatusCode::parse("bogus"), StatusCode::Unknown);
    }

    #[test]
    fn test_manifest_parse() {
        let manifest = Manifest::parse(&manifest_text()).unwrap();
        assert_eq!(manifest.kind, "mock");
        assert_eq!(manifest.app_names(), vec!["api", "worker"]);
        assert_eq!(
            manifest.apps["api"].get("instances"),
            Some(&"2".to_string())
        );

        // Rendering is canonical: parse(render(m)) == m.
        let rendered = manifest.render().unwrap();
        assert_eq!(Manifest::parse(&rendered).unwrap(), manifest);
    }

    #[test]
    fn test_manifest_parse_rejects_garbage() {
        assert!(matches!(
            Manifest::parse("not a manifest"),
            Err(Error::Manifest(_))
        ));
    }

    #[test]
    fn test_release_kind() {
        let release = Release::new(
            "orders",
            1,
            manifest_text(),
            PackageRef {
                name: "orders-pkg".to_string(),
                version: "1.0.0".to_string(),
            },
            serde_json::json!({}),
            "default",
            Utc::now(),
        );
        assert_eq!(release.kind().unwrap(), "mock");
        assert_eq!(release.status_code(), StatusCode::Unknown);
    }

    #[test]
    fn test_merge_status_never_resurrects_deleted() {
        let mut info = Info::new(Utc::now());
        info.status = Status::new(StatusCode::Deleted, "Delete complete");

        let fresh = Status {
            code: StatusCode::Deployed,
            description: "healthy".to_string(),
            app_statuses: vec![AppStatus {
                app: "api".to_string(),
                health: AppHealth::Healthy,
                detail: String::new(),
            }],
        };
        info.merge_status(&fresh);
        assert_eq!(info.status.code, StatusCode::Deleted);
    }

    #[test]
    fn test_merge_status_ignores_stale_unknown() {
        let mut info = Info::new(Utc::now());
        info.status = Status::new(StatusCode::Deployed, "Install complete");

        let stale = Status::new(StatusCode::Unknown, "");
        info.merge_status(&stale);
        assert_eq!(info.status.code, StatusCode::Deployed);
        assert_eq!(info.status.description, "Install complete");
    }

    #[test]
    fn test_merge_status_updates_app_statuses() {
        let mut info = Info::new(Utc::now());
        info.status = Status::new(StatusCode::Deployed, "Install complete");

        let fresh = Status {
            code: StatusCode::Deployed,
            description: "Install complete".to_string(),
            app_statuses: vec![AppStatus {
                app: "worker".to_string(),
                health: AppHealth::Failed,
                detail: "crash loop".to_string(),
            }],
        };
        info.merge_status(&fresh);
        assert_eq!(info.status.app_statuses.len(), 1);
        assert_eq!(info.status.app_statuses[0].health, AppHealth::Failed);
    }

    #[test]
    fn test_mark_transitions() {
        let now = Utc::now();
        let mut release = Release::new(
            "orders",
            1,
            manifest_text(),
            PackageRef {
                name: "orders-pkg".to_string(),
                version: "1.0.0".to_string(),
            },
            serde_json::json!({}),
            "default",
            now,
        );

        release.mark_deployed("Install complete", now);
        assert_eq!(release.status_code(), StatusCode::Deployed);

        release.mark_deleted("Delete complete", now);
        assert_eq!(release.status_code(), StatusCode::Deleted);
        assert!(release.info.as_ref().unwrap().deleted.is_some());
    }

    #[test]
    fn test_app_deployer_data_lookup() {
        let mut data = AppDeployerData::empty("orders", 1);
        data.deployment_ids
            .insert("api".to_string(), "dep-123".to_string());
        assert_eq!(data.id_for("api"), Some("dep-123"));
        assert_eq!(data.id_for("worker"), None);
    }
}
