//! Release store interfaces and backends.
//!
//! This module defines the durable store abstraction and backend
//! implementations. The store is append-only by version per release name;
//! mutations to a stored release go through optimistic versioning so a
//! reconciliation refresh landing mid-upgrade is detected instead of
//! silently last-writer-winning.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryReleaseStore;
pub use self::sqlite::SqliteReleaseStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::release::{AppDeployerData, PackageRef, Release, StatusCode};

/// A stored release together with its optimistic-versioning revision.
#[derive(Debug, Clone)]
pub struct ReleaseRecord {
    /// The release.
    pub release: Release,
    /// Revision counter; passed back on update for conflict detection.
    pub revision: i64,
}

/// Persisted state machine snapshot, keyed by release name.
///
/// Holds the state id and the filtered persisted variables only; live
/// release objects, analysis reports and error objects are process-local
/// and reattached on resume, never serialized.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    /// Release name the machine belongs to.
    pub release_name: String,
    /// Current state id.
    pub state_id: String,
    /// Serialized persisted variables.
    pub vars: serde_json::Value,
    /// When the snapshot was last written.
    pub updated_at: DateTime<Utc>,
}

/// Durable release store used by the state machine, the upgrade strategy
/// and the reconciliation loop.
#[allow(missing_docs)]
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    async fn insert_release(&self, release: &Release) -> Result<()>;

    /// Update a release at its expected revision. Returns the new revision,
    /// or [`Error::Conflict`] when another writer got there first.
    async fn update_release(&self, release: &Release, expected_revision: i64) -> Result<i64>;

    async fn get_release(&self, name: &str, version: i64) -> Result<Option<ReleaseRecord>>;

    async fn latest_release(&self, name: &str) -> Result<Option<ReleaseRecord>>;

    /// Full version history for a name, newest first.
    async fn history(&self, name: &str) -> Result<Vec<Release>>;

    /// Next version number for a name: max + 1, or 1 for a fresh name.
    /// Versions are never reused, also across delete/reinstall cycles.
    async fn next_version(&self, name: &str) -> Result<i64>;

    /// Latest release per name, filtered to the given status codes.
    /// An empty filter returns every latest release.
    async fn list_latest(&self, statuses: &[StatusCode]) -> Result<Vec<ReleaseRecord>>;

    async fn save_app_deployer_data(&self, data: &AppDeployerData) -> Result<()>;

    async fn get_app_deployer_data(
        &self,
        name: &str,
        version: i64,
    ) -> Result<Option<AppDeployerData>>;

    async fn save_snapshot(&self, snapshot: &SnapshotRecord) -> Result<()>;

    async fn load_snapshot(&self, release_name: &str) -> Result<Option<SnapshotRecord>>;

    async fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>>;

    /// Count releases other than `exclude_name` whose latest version still
    /// references the given package. Backs the delete-package flag.
    async fn count_releases_using_package(
        &self,
        package: &PackageRef,
        exclude_name: &str,
    ) -> Result<i64>;

    async fn health_check(&self) -> Result<bool>;
}

/// Apply a mutation to a stored release under optimistic versioning.
///
/// Re-reads the record and retries once on a write conflict, then
/// surfaces the conflict to the caller. Used by both state-machine actions
/// and the reconciler so neither can clobber the other's write.
pub async fn update_with_retry<F>(
    store: &dyn ReleaseStore,
    name: &str,
    version: i64,
    mutate: F,
) -> Result<Release>
where
    F: Fn(&mut Release) + Send,
{
    for attempt in 0..2 {
        let record = store
            .get_release(name, version)
            .await?
            .ok_or_else(|| Error::VersionNotFound {
                name: name.to_string(),
                version,
            })?;
        let mut release = record.release;
        mutate(&mut release);
        match store.update_release(&release, record.revision).await {
            Ok(_) => return Ok(release),
            Err(Error::Conflict { .. }) if attempt == 0 => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflict {
        name: name.to_string(),
        version,
    })
}
