//! SQLite-backed release store implementation.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::{Error, Result};
use crate::release::{
    AppDeployerData, AppStatus, Info, PackageRef, Release, Status, StatusCode,
};

use super::{ReleaseRecord, ReleaseStore, SnapshotRecord};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed release store.
#[derive(Clone)]
pub struct SqliteReleaseStore {
    pool: SqlitePool,
}

impl SqliteReleaseStore {
    /// Create a new store from an existing pool. Migrations must already
    /// have been applied (see [`crate::migrations`]).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a database file path.
    ///
    /// Creates parent directories and the database file if missing,
    /// connects with sensible defaults and runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::Storage {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| Error::Storage {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Create an in-memory store, used by tests and throwaway embeddings.
    pub async fn in_memory() -> Result<Self> {
        // A single connection keeps the in-memory database alive and shared.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| Error::Storage {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        MIGRATOR.run(pool).await.map_err(|e| Error::Storage {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReleaseRow {
    name: String,
    version: i64,
    manifest: String,
    package_name: String,
    package_version: String,
    config_values: String,
    platform_name: String,
    status_code: Option<String>,
    status_description: Option<String>,
    app_statuses: Option<String>,
    first_deployed: Option<DateTime<Utc>>,
    last_deployed: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    revision: i64,
}

const RELEASE_COLUMNS: &str = "name, version, manifest, package_name, package_version, \
     config_values, platform_name, status_code, status_description, app_statuses, \
     first_deployed, last_deployed, deleted_at, revision";

impl ReleaseRow {
    fn into_record(self) -> Result<ReleaseRecord> {
        let info = match (self.status_code, self.first_deployed) {
            (Some(code), Some(first_deployed)) => {
                let app_statuses: Vec<AppStatus> = match self.app_statuses {
                    Some(raw) => serde_json::from_str(&raw)?,
                    None => Vec::new(),
                };
                Some(Info {
                    status: Status {
                        code: StatusCode::parse(&code),
                        description: self.status_description.unwrap_or_default(),
                        app_statuses,
                    },
                    first_deployed,
                    last_deployed: self.last_deployed,
                    deleted: self.deleted_at,
                })
            }
            _ => None,
        };

        Ok(ReleaseRecord {
            release: Release {
                name: self.name,
                version: self.version,
                manifest: self.manifest,
                package: PackageRef {
                    name: self.package_name,
                    version: self.package_version,
                },
                config_values: serde_json::from_str(&self.config_values)?,
                platform_name: self.platform_name,
                info,
            },
            revision: self.revision,
        })
    }
}

struct InfoColumns {
    status_code: Option<String>,
    status_description: Option<String>,
    app_statuses: Option<String>,
    first_deployed: Option<DateTime<Utc>>,
    last_deployed: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

fn info_columns(release: &Release) -> Result<InfoColumns> {
    Ok(match &release.info {
        Some(info) => InfoColumns {
            status_code: Some(info.status.code.as_str().to_string()),
            status_description: Some(info.status.description.clone()),
            app_statuses: Some(serde_json::to_string(&info.status.app_statuses)?),
            first_deployed: Some(info.first_deployed),
            last_deployed: info.last_deployed,
            deleted_at: info.deleted,
        },
        None => InfoColumns {
            status_code: None,
            status_description: None,
            app_statuses: None,
            first_deployed: None,
            last_deployed: None,
            deleted_at: None,
        },
    })
}

#[async_trait]
impl ReleaseStore for SqliteReleaseStore {
    async fn insert_release(&self, release: &Release) -> Result<()> {
        let info = info_columns(release)?;
        sqlx::query(
            r#"
            INSERT INTO releases (name, version, manifest, package_name, package_version,
                                  config_values, platform_name, status_code, status_description,
                                  app_statuses, first_deployed, last_deployed, deleted_at, revision)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(&release.name)
        .bind(release.version)
        .bind(&release.manifest)
        .bind(&release.package.name)
        .bind(&release.package.version)
        .bind(serde_json::to_string(&release.config_values)?)
        .bind(&release.platform_name)
        .bind(info.status_code)
        .bind(info.status_description)
        .bind(info.app_statuses)
        .bind(info.first_deployed)
        .bind(info.last_deployed)
        .bind(info.deleted_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_release(&self, release: &Release, expected_revision: i64) -> Result<i64> {
        // Only the info envelope is mutable; the release identity, manifest
        // and package reference never change after creation.
        let info = info_columns(release)?;
        let result = sqlx::query(
            r#"
            UPDATE releases
            SET status_code = ?, status_description = ?, app_statuses = ?,
                first_deployed = ?, last_deployed = ?, deleted_at = ?,
                revision = revision + 1
            WHERE name = ? AND version = ? AND revision = ?
            "#,
        )
        .bind(info.status_code)
        .bind(info.status_description)
        .bind(info.app_statuses)
        .bind(info.first_deployed)
        .bind(info.last_deployed)
        .bind(info.deleted_at)
        .bind(&release.name)
        .bind(release.version)
        .bind(expected_revision)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_release(&release.name, release.version).await? {
                Some(_) => Err(Error::Conflict {
                    name: release.name.clone(),
                    version: release.version,
                }),
                None => Err(Error::VersionNotFound {
                    name: release.name.clone(),
                    version: release.version,
                }),
            };
        }

        Ok(expected_revision + 1)
    }

    async fn get_release(&self, name: &str, version: i64) -> Result<Option<ReleaseRecord>> {
        let row = sqlx::query_as::<_, ReleaseRow>(&format!(
            "SELECT {RELEASE_COLUMNS} FROM releases WHERE name = ? AND version = ?"
        ))
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReleaseRow::into_record).transpose()
    }

    async fn latest_release(&self, name: &str) -> Result<Option<ReleaseRecord>> {
        let row = sqlx::query_as::<_, ReleaseRow>(&format!(
            "SELECT {RELEASE_COLUMNS} FROM releases WHERE name = ? \
             ORDER BY version DESC LIMIT 1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReleaseRow::into_record).transpose()
    }

    async fn history(&self, name: &str) -> Result<Vec<Release>> {
        let rows = sqlx::query_as::<_, ReleaseRow>(&format!(
            "SELECT {RELEASE_COLUMNS} FROM releases WHERE name = ? ORDER BY version DESC"
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_record().map(|r| r.release))
            .collect()
    }

    async fn next_version(&self, name: &str) -> Result<i64> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM releases WHERE name = ?")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0) + 1)
    }

    async fn list_latest(&self, statuses: &[StatusCode]) -> Result<Vec<ReleaseRecord>> {
        let rows = sqlx::query_as::<_, ReleaseRow>(&format!(
            "SELECT r.{} FROM releases r \
             JOIN (SELECT name, MAX(version) AS version FROM releases GROUP BY name) m \
               ON r.name = m.name AND r.version = m.version \
             ORDER BY r.name",
            RELEASE_COLUMNS.replace(", ", ", r.")
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = row.into_record()?;
            if statuses.is_empty() || statuses.contains(&record.release.status_code()) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn save_app_deployer_data(&self, data: &AppDeployerData) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app_deployer_data (release_name, release_version, deployment_ids)
            VALUES (?, ?, ?)
            ON CONFLICT (release_name, release_version)
            DO UPDATE SET deployment_ids = excluded.deployment_ids
            "#,
        )
        .bind(&data.release_name)
        .bind(data.release_version)
        .bind(serde_json::to_string(&data.deployment_ids)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_app_deployer_data(
        &self,
        name: &str,
        version: i64,
    ) -> Result<Option<AppDeployerData>> {
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT deployment_ids FROM app_deployer_data \
             WHERE release_name = ? AND release_version = ?",
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        match raw {
            Some(raw) => {
                let deployment_ids: BTreeMap<String, String> = serde_json::from_str(&raw)?;
                Ok(Some(AppDeployerData {
                    release_name: name.to_string(),
                    release_version: version,
                    deployment_ids,
                }))
            }
            None => Ok(None),
        }
    }

    async fn save_snapshot(&self, snapshot: &SnapshotRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO machine_snapshots (release_name, state_id, vars, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (release_name)
            DO UPDATE SET state_id = excluded.state_id,
                          vars = excluded.vars,
                          updated_at = excluded.updated_at
            "#,
        )
        .bind(&snapshot.release_name)
        .bind(&snapshot.state_id)
        .bind(serde_json::to_string(&snapshot.vars)?)
        .bind(snapshot.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_snapshot(&self, release_name: &str) -> Result<Option<SnapshotRecord>> {
        let row: Option<(String, String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT release_name, state_id, vars, updated_at \
             FROM machine_snapshots WHERE release_name = ?",
        )
        .bind(release_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(release_name, state_id, vars, updated_at)| {
            Ok(SnapshotRecord {
                release_name,
                state_id,
                vars: serde_json::from_str(&vars)?,
                updated_at,
            })
        })
        .transpose()
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>> {
        let rows: Vec<(String, String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT release_name, state_id, vars, updated_at \
             FROM machine_snapshots ORDER BY release_name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(release_name, state_id, vars, updated_at)| {
                Ok(SnapshotRecord {
                    release_name,
                    state_id,
                    vars: serde_json::from_str(&vars)?,
                    updated_at,
                })
            })
            .collect()
    }

    async fn count_releases_using_package(
        &self,
        package: &PackageRef,
        exclude_name: &str,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM releases r \
             JOIN (SELECT name, MAX(version) AS version FROM releases GROUP BY name) m \
               ON r.name = m.name AND r.version = m.version \
             WHERE r.package_name = ? AND r.package_version = ? AND r.name != ?",
        )
        .bind(&package.name)
        .bind(&package.version)
        .bind(exclude_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(true)
    }
}
