// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Release differencer.
//!
//! Computes a structural diff between the rendered manifests of an existing
//! release and a candidate replacing release. The diff is per-application,
//! not per-release: applications identical in both manifests stay out of
//! the changed set even when siblings changed, which is what enables the
//! minimal-redeploy property of the red-black upgrade.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use crate::release::{AppManifest, Release};

/// Structural diff of one application's flattened properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppDiff {
    /// Keys present only in the replacing manifest.
    pub added: BTreeMap<String, String>,
    /// Keys present only in the existing manifest.
    pub removed: BTreeMap<String, String>,
    /// Keys present in both with different values: key -> (existing, replacing).
    pub changed: BTreeMap<String, (String, String)>,
}

impl AppDiff {
    /// Whether the application is identical in both manifests.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Result of analyzing an existing release against a replacing release.
///
/// Transient: reports are never persisted and are recomputed on resume.
#[derive(Debug, Clone)]
pub struct ReleaseAnalysisReport {
    /// The currently deployed release.
    pub existing: Release,
    /// The candidate replacing release (existing.version + 1).
    pub replacing: Release,
    /// Per-application diffs, one entry per app present in either manifest.
    pub diffs: BTreeMap<String, AppDiff>,
    /// Application names whose effective configuration changed and must be
    /// redeployed. Empty with no force flag means a no-op commit.
    pub apps_to_upgrade: Vec<String>,
    /// Whether the changed set was widened by the force flag.
    pub force_update: bool,
}

/// Diff two application manifests.
pub fn diff_apps(existing: &AppManifest, replacing: &AppManifest) -> AppDiff {
    let mut diff = AppDiff::default();
    for (key, value) in existing {
        match replacing.get(key) {
            None => {
                diff.removed.insert(key.clone(), value.clone());
            }
            Some(other) if other != value => {
                diff.changed
                    .insert(key.clone(), (value.clone(), other.clone()));
            }
            Some(_) => {}
        }
    }
    for (key, value) in replacing {
        if !existing.contains_key(key) {
            diff.added.insert(key.clone(), value.clone());
        }
    }
    diff
}

/// Analyze an existing release against a replacing release.
///
/// The candidate universe is every application present in either manifest,
/// narrowed to `names_override` when given. With `force_update` the changed
/// set is widened to the whole candidate universe regardless of the diff
/// result.
pub fn analyze(
    existing: &Release,
    replacing: &Release,
    force_update: bool,
    names_override: Option<&[String]>,
) -> Result<ReleaseAnalysisReport> {
    let existing_manifest = existing.parsed_manifest()?;
    let replacing_manifest = replacing.parsed_manifest()?;

    let mut candidates: BTreeSet<String> = existing_manifest
        .apps
        .keys()
        .chain(replacing_manifest.apps.keys())
        .cloned()
        .collect();
    if let Some(names) = names_override {
        let allowed: BTreeSet<&String> = names.iter().collect();
        candidates.retain(|name| allowed.contains(name));
    }

    static EMPTY: AppManifest = AppManifest::new();
    let mut diffs = BTreeMap::new();
    let mut apps_to_upgrade = Vec::new();
    for app in candidates {
        let before = existing_manifest.apps.get(&app).unwrap_or(&EMPTY);
        let after = replacing_manifest.apps.get(&app).unwrap_or(&EMPTY);
        let diff = diff_apps(before, after);
        if force_update || !diff.is_empty() {
            apps_to_upgrade.push(app.clone());
        }
        diffs.insert(app, diff);
    }

    Ok(ReleaseAnalysisReport {
        existing: existing.clone(),
        replacing: replacing.clone(),
        diffs,
        apps_to_upgrade,
        force_update,
    })
}
