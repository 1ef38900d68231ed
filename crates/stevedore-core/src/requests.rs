// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle request objects.
//!
//! The inbound REST layer translates HTTP calls into these structs; the
//! release service validates them synchronously and turns them into state
//! machine events. Validation failures never reach a backend.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::release::PackageRef;

/// Install a new release (version 1, or the next version after a DELETED
/// release of the same name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRequest {
    /// Release name.
    pub name: String,
    /// Target platform name.
    pub platform_name: String,
    /// Source package identifier.
    pub package: PackageRef,
    /// Resolved configuration values.
    pub config_values: serde_json::Value,
    /// Rendered manifest text, produced by the upstream template renderer.
    pub manifest: String,
}

impl InstallRequest {
    /// Validate request shape.
    pub fn validate(&self) -> Result<()> {
        require_name(&self.name)?;
        if self.platform_name.trim().is_empty() {
            return Err(Error::validation("platform_name", "must not be empty"));
        }
        require_manifest(&self.manifest)
    }
}

/// Upgrade an existing DEPLOYED release to a new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeRequest {
    /// Release name.
    pub name: String,
    /// Source package identifier for the replacing release.
    pub package: PackageRef,
    /// Resolved configuration values for the replacing release.
    pub config_values: serde_json::Value,
    /// Rendered manifest text for the replacing release.
    pub manifest: String,
    /// Health-check timeout; the orchestrator default applies when absent.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Redeploy every application regardless of the diff result.
    #[serde(default)]
    pub force_update: bool,
    /// Restrict the analysis to these application names.
    #[serde(default)]
    pub app_names: Option<Vec<String>>,
}

impl UpgradeRequest {
    /// Validate request shape.
    pub fn validate(&self) -> Result<()> {
        require_name(&self.name)?;
        require_manifest(&self.manifest)?;
        if let Some(names) = &self.app_names
            && names.iter().any(|n| n.trim().is_empty())
        {
            return Err(Error::validation("app_names", "must not contain empty names"));
        }
        Ok(())
    }
}

/// Delete a release and tear down its backend resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    /// Release name.
    pub name: String,
    /// Also release the source package when no other release uses it.
    #[serde(default)]
    pub delete_package: bool,
}

impl DeleteRequest {
    /// Validate request shape.
    pub fn validate(&self) -> Result<()> {
        require_name(&self.name)
    }
}

/// Roll a release back to a prior version.
///
/// Rollback is a request-builder, not a separate execution path: it creates
/// a NEW version whose manifest and package equal the target version's and
/// re-dispatches through the install or upgrade path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    /// Release name.
    pub name: String,
    /// Target version; 0 means the previous version.
    pub version: i64,
    /// Health-check timeout for the resulting upgrade, if any.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl RollbackRequest {
    /// Validate request shape. Negative target versions are rejected.
    pub fn validate(&self) -> Result<()> {
        require_name(&self.name)?;
        if self.version < 0 {
            return Err(Error::validation("version", "must not be negative"));
        }
        Ok(())
    }
}

/// Per-application scale instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppScale {
    /// Application name from the manifest.
    pub app: String,
    /// Desired instance count.
    pub instances: u32,
    /// Backend-specific scale properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Adjust instance counts per named application. Partial failure is
/// tolerated: per-application errors are logged and the batch continues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequest {
    /// Release name.
    pub name: String,
    /// Scale instructions, one per application.
    pub apps: Vec<AppScale>,
}

impl ScaleRequest {
    /// Validate request shape.
    pub fn validate(&self) -> Result<()> {
        require_name(&self.name)?;
        if self.apps.is_empty() {
            return Err(Error::validation("apps", "must not be empty"));
        }
        if self.apps.iter().any(|a| a.app.trim().is_empty()) {
            return Err(Error::validation("apps", "must not contain empty app names"));
        }
        Ok(())
    }
}

fn require_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("name", "must not be empty"));
    }
    Ok(())
}

fn require_manifest(manifest: &str) -> Result<()> {
    if manifest.trim().is_empty() {
        return Err(Error::validation("manifest", "must not be empty"));
    }
    Ok(())
}
