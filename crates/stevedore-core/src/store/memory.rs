// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory release store for tests and embedded experimentation.
//!
//! Keeps the full store contract, including optimistic versioning, plus
//! fault-injection knobs for exercising conflict and storage-error paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::release::{AppDeployerData, PackageRef, Release, StatusCode};

use super::{ReleaseRecord, ReleaseStore, SnapshotRecord};

#[derive(Default)]
struct Tables {
    // (name, version) -> (release, revision)
    releases: BTreeMap<(String, i64), (Release, i64)>,
    deployer_data: HashMap<(String, i64), AppDeployerData>,
    snapshots: HashMap<String, SnapshotRecord>,
}

/// In-memory release store.
#[derive(Default)]
pub struct MemoryReleaseStore {
    tables: RwLock<Tables>,
    /// When set, the next `update_release` fails with a write conflict.
    conflict_next: AtomicBool,
    /// When set, every operation fails with a storage error.
    fail_all: AtomicBool,
}

impl MemoryReleaseStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `update_release` call fail with a write conflict,
    /// as if a concurrent writer bumped the revision first.
    pub fn conflict_next_update(&self) {
        self.conflict_next.store(true, Ordering::SeqCst);
    }

    /// Toggle failing every operation with a storage error.
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Overwrite a stored release in place without touching its revision.
    /// Test hook for fabricating malformed records (e.g. a missing info
    /// block) that the normal write path would not produce.
    pub async fn put_raw(&self, release: Release) {
        let mut tables = self.tables.write().await;
        let key = (release.name.clone(), release.version);
        let revision = tables.releases.get(&key).map(|(_, r)| *r).unwrap_or(1);
        tables.releases.insert(key, (release, revision));
    }

    fn check_fault(&self, operation: &str) -> Result<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(Error::Storage {
                operation: operation.to_string(),
                details: "injected storage failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReleaseStore for MemoryReleaseStore {
    async fn insert_release(&self, release: &Release) -> Result<()> {
        self.check_fault("insert_release")?;
        let mut tables = self.tables.write().await;
        let key = (release.name.clone(), release.version);
        if tables.releases.contains_key(&key) {
            return Err(Error::Storage {
                operation: "insert_release".to_string(),
                details: format!(
                    "release '{}' version {} already exists",
                    release.name, release.version
                ),
            });
        }
        tables.releases.insert(key, (release.clone(), 1));
        Ok(())
    }

    async fn update_release(&self, release: &Release, expected_revision: i64) -> Result<i64> {
        self.check_fault("update_release")?;
        let mut tables = self.tables.write().await;
        let key = (release.name.clone(), release.version);
        let Some((stored, revision)) = tables.releases.get_mut(&key) else {
            return Err(Error::VersionNotFound {
                name: release.name.clone(),
                version: release.version,
            });
        };
        if self.conflict_next.swap(false, Ordering::SeqCst) || *revision != expected_revision {
            return Err(Error::Conflict {
                name: release.name.clone(),
                version: release.version,
            });
        }
        *stored = release.clone();
        *revision += 1;
        Ok(*revision)
    }

    async fn get_release(&self, name: &str, version: i64) -> Result<Option<ReleaseRecord>> {
        self.check_fault("get_release")?;
        let tables = self.tables.read().await;
        Ok(tables
            .releases
            .get(&(name.to_string(), version))
            .map(|(release, revision)| ReleaseRecord {
                release: release.clone(),
                revision: *revision,
            }))
    }

    async fn latest_release(&self, name: &str) -> Result<Option<ReleaseRecord>> {
        self.check_fault("latest_release")?;
        let tables = self.tables.read().await;
        Ok(tables
            .releases
            .range((name.to_string(), i64::MIN)..=(name.to_string(), i64::MAX))
            .next_back()
            .map(|(_, (release, revision))| ReleaseRecord {
                release: release.clone(),
                revision: *revision,
            }))
    }

    async fn history(&self, name: &str) -> Result<Vec<Release>> {
        self.check_fault("history")?;
        let tables = self.tables.read().await;
        Ok(tables
            .releases
            .range((name.to_string(), i64::MIN)..=(name.to_string(), i64::MAX))
            .rev()
            .map(|(_, (release, _))| release.clone())
            .collect())
    }

    async fn next_version(&self, name: &str) -> Result<i64> {
        Ok(self
            .latest_release(name)
            .await?
            .map(|r| r.release.version + 1)
            .unwrap_or(1))
    }

    async fn list_latest(&self, statuses: &[StatusCode]) -> Result<Vec<ReleaseRecord>> {
        self.check_fault("list_latest")?;
        let tables = self.tables.read().await;
        let mut latest: BTreeMap<&str, (&Release, i64)> = BTreeMap::new();
        for ((name, _), (release, revision)) in &tables.releases {
            latest.insert(name.as_str(), (release, *revision));
        }
        Ok(latest
            .into_values()
            .filter(|(release, _)| {
                statuses.is_empty() || statuses.contains(&release.status_code())
            })
            .map(|(release, revision)| ReleaseRecord {
                release: release.clone(),
                revision,
            })
            .collect())
    }

    async fn save_app_deployer_data(&self, data: &AppDeployerData) -> Result<()> {
        self.check_fault("save_app_deployer_data")?;
        let mut tables = self.tables.write().await;
        tables
            .deployer_data
            .insert((data.release_name.clone(), data.release_version), data.clone());
        Ok(())
    }

    async fn get_app_deployer_data(
        &self,
        name: &str,
        version: i64,
    ) -> Result<Option<AppDeployerData>> {
        self.check_fault("get_app_deployer_data")?;
        let tables = self.tables.read().await;
        Ok(tables
            .deployer_data
            .get(&(name.to_string(), version))
            .cloned())
    }

    async fn save_snapshot(&self, snapshot: &SnapshotRecord) -> Result<()> {
        self.check_fault("save_snapshot")?;
        let mut tables = self.tables.write().await;
        tables
            .snapshots
            .insert(snapshot.release_name.clone(), snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self, release_name: &str) -> Result<Option<SnapshotRecord>> {
        self.check_fault("load_snapshot")?;
        let tables = self.tables.read().await;
        Ok(tables.snapshots.get(release_name).cloned())
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>> {
        self.check_fault("list_snapshots")?;
        let tables = self.tables.read().await;
        Ok(tables.snapshots.values().cloned().collect())
    }

    async fn count_releases_using_package(
        &self,
        package: &PackageRef,
        exclude_name: &str,
    ) -> Result<i64> {
        self.check_fault("count_releases_using_package")?;
        let latest = self.list_latest(&[]).await?;
        Ok(latest
            .iter()
            .filter(|r| r.release.name != exclude_name && r.release.package == *package)
            .count() as i64)
    }

    async fn health_check(&self) -> Result<bool> {
        self.check_fault("health_check")?;
        Ok(true)
    }
}
