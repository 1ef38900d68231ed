// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Release service: command validation and per-release dispatch.
//!
//! The service is the boundary between the (out-of-scope) request layer
//! and the state machines. It validates every command synchronously -
//! user errors never enter a machine - then enqueues the event on the
//! release's machine task. One task exists per release name and processes
//! its queue strictly sequentially; that queue is the serialization
//! boundary guaranteeing no two operations interleave on one name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::machine::{Machine, MachineDeps, MachineEvent, PersistedVars, StateId};
use crate::manager::ManagerRegistry;
use crate::release::{AppDeployerData, Manifest, Release, StatusCode};
use crate::requests::{
    DeleteRequest, InstallRequest, RollbackRequest, ScaleRequest, UpgradeRequest,
};
use crate::store::{ReleaseRecord, ReleaseStore};
use crate::strategy::RedBlackStrategy;

/// Resolve and validate a rollback target.
///
/// Version 0 means the previous version. The target version's status must
/// be DEPLOYED or DELETED. Returns the latest record and the target record.
pub(crate) async fn resolve_rollback_target(
    store: &dyn ReleaseStore,
    name: &str,
    version: i64,
) -> Result<(ReleaseRecord, ReleaseRecord)> {
    let latest = store
        .latest_release(name)
        .await?
        .ok_or_else(|| Error::ReleaseNotFound(name.to_string()))?;

    let target_version = if version == 0 {
        latest.release.version - 1
    } else {
        version
    };
    if target_version < 1 {
        return Err(Error::validation(
            "version",
            "no previous version to roll back to",
        ));
    }

    let target = store
        .get_release(name, target_version)
        .await?
        .ok_or_else(|| Error::VersionNotFound {
            name: name.to_string(),
            version: target_version,
        })?;

    match target.release.status_code() {
        StatusCode::Deployed | StatusCode::Deleted => Ok((latest, target)),
        other => Err(Error::InvalidReleaseState {
            name: name.to_string(),
            expected: "DEPLOYED or DELETED".to_string(),
            actual: other.as_str().to_uppercase(),
        }),
    }
}

struct MachineHandle {
    tx: mpsc::Sender<MachineEvent>,
    cancel: Arc<Notify>,
    task: JoinHandle<()>,
}

struct ServiceInner {
    store: Arc<dyn ReleaseStore>,
    registry: Arc<ManagerRegistry>,
    config: Config,
    workers: Arc<Semaphore>,
    machines: Mutex<HashMap<String, MachineHandle>>,
}

/// Entry point for lifecycle commands. Cheap to clone.
#[derive(Clone)]
pub struct ReleaseService {
    inner: Arc<ServiceInner>,
}

impl ReleaseService {
    /// Create a service over the given store and manager registry.
    pub fn new(store: Arc<dyn ReleaseStore>, registry: Arc<ManagerRegistry>, config: Config) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_pool_size));
        Self {
            inner: Arc::new(ServiceInner {
                store,
                registry,
                config,
                workers,
                machines: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Install a new release: version 1, or the next version when the
    /// previous install was deleted or failed.
    pub async fn install(&self, request: InstallRequest) -> Result<()> {
        request.validate()?;
        self.check_manifest_kind(&request.manifest)?;

        if let Some(latest) = self.inner.store.latest_release(&request.name).await? {
            match latest.release.status_code() {
                StatusCode::Deleted | StatusCode::Failed => {}
                other => {
                    return Err(Error::InvalidReleaseState {
                        name: request.name.clone(),
                        expected: "DELETED, FAILED or absent".to_string(),
                        actual: other.as_str().to_uppercase(),
                    });
                }
            }
        }

        let name = request.name.clone();
        self.dispatch(&name, MachineEvent::Install(request)).await
    }

    /// Upgrade an existing DEPLOYED release to a new version.
    pub async fn upgrade(&self, request: UpgradeRequest) -> Result<()> {
        request.validate()?;
        self.check_manifest_kind(&request.manifest)?;
        self.require_status(&request.name, StatusCode::Deployed).await?;

        let name = request.name.clone();
        self.dispatch(&name, MachineEvent::Upgrade(request)).await
    }

    /// Delete a release and tear down its backend resources.
    pub async fn delete(&self, request: DeleteRequest) -> Result<()> {
        request.validate()?;
        let latest = self.require_latest(&request.name).await?;
        if latest.release.status_code() == StatusCode::Deleted {
            return Err(Error::InvalidReleaseState {
                name: request.name.clone(),
                expected: "not DELETED".to_string(),
                actual: "DELETED".to_string(),
            });
        }

        let name = request.name.clone();
        self.dispatch(&name, MachineEvent::Delete(request)).await
    }

    /// Roll a release back to a prior version.
    pub async fn rollback(&self, request: RollbackRequest) -> Result<()> {
        request.validate()?;
        resolve_rollback_target(self.inner.store.as_ref(), &request.name, request.version)
            .await?;

        let name = request.name.clone();
        self.dispatch(&name, MachineEvent::Rollback(request)).await
    }

    /// Scale applications of a DEPLOYED release.
    pub async fn scale(&self, request: ScaleRequest) -> Result<()> {
        request.validate()?;
        self.require_status(&request.name, StatusCode::Deployed).await?;

        let name = request.name.clone();
        self.dispatch(&name, MachineEvent::Scale(request)).await
    }

    /// Cancel an in-flight upgrade. Only meaningful while the upgrade is
    /// in its wait/check sub-states; anything else is rejected.
    pub async fn cancel(&self, name: &str) -> Result<()> {
        let snapshot = self.inner.store.load_snapshot(name).await?;
        let waiting = snapshot
            .as_ref()
            .and_then(|s| StateId::parse(&s.state_id))
            // Wait/check are exactly the cancellable states.
            .map(|s| s.is_resumable())
            .unwrap_or(false);
        if !waiting {
            return Err(Error::validation(
                "name",
                "no upgrade is awaiting health checks",
            ));
        }

        let machines = self.inner.machines.lock().await;
        match machines.get(name) {
            Some(handle) => {
                info!(release = %name, "Cancelling in-flight upgrade");
                handle.cancel.notify_one();
                Ok(())
            }
            None => Err(Error::ReleaseNotFound(name.to_string())),
        }
    }

    /// Stored status of the latest release version. Never queries the
    /// backend; the reconciliation loop keeps the stored record fresh.
    pub async fn status(&self, name: &str) -> Result<Release> {
        Ok(self.require_latest(name).await?.release)
    }

    /// Full version history of a release name, newest first.
    pub async fn history(&self, name: &str) -> Result<Vec<Release>> {
        let history = self.inner.store.history(name).await?;
        if history.is_empty() {
            return Err(Error::ReleaseNotFound(name.to_string()));
        }
        Ok(history)
    }

    /// Retrieve application logs from the latest release's backend.
    pub async fn get_log(&self, name: &str, app: Option<&str>) -> Result<String> {
        let latest = self.require_latest(name).await?;
        let data = self
            .inner
            .store
            .get_app_deployer_data(name, latest.release.version)
            .await?
            .unwrap_or_else(|| AppDeployerData::empty(name, latest.release.version));
        let manager = self.inner.registry.resolve_for(&latest.release)?;
        manager.get_log(&latest.release, &data, app).await
    }

    /// Recover in-flight operations from persisted snapshots after a
    /// process restart. Wait/check snapshots resume polling; anything else
    /// fails forward so the release is FAILED, never stuck.
    pub async fn recover(&self) -> Result<()> {
        let snapshots = self.inner.store.list_snapshots().await?;
        let mut machines = self.inner.machines.lock().await;
        for snapshot in snapshots {
            let Some(state) = StateId::parse(&snapshot.state_id) else {
                warn!(
                    release = %snapshot.release_name,
                    state = %snapshot.state_id,
                    "Snapshot has unknown state id; skipping"
                );
                continue;
            };
            if state == StateId::Initial {
                continue;
            }
            let vars: PersistedVars =
                serde_json::from_value(snapshot.vars.clone()).unwrap_or_default();
            info!(
                release = %snapshot.release_name,
                state = snapshot.state_id,
                "Recovering in-flight operation"
            );
            let handle = self.spawn_machine(&snapshot.release_name, Some((state, vars)));
            machines.insert(snapshot.release_name.clone(), handle);
        }
        Ok(())
    }

    /// Drain all machine tasks: close their queues and wait for each to
    /// finish its in-flight operation.
    pub async fn shutdown(&self) {
        let handles: Vec<MachineHandle> = {
            let mut machines = self.inner.machines.lock().await;
            machines.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            drop(handle.tx);
            if let Err(e) = handle.task.await {
                error!(error = %e, "State machine task panicked");
            }
        }
    }

    /// Poll the stored release until its status matches. Operational and
    /// test helper; commands are asynchronous so callers that need a
    /// settled outcome wait through this.
    pub async fn wait_for_status(
        &self,
        name: &str,
        code: StatusCode,
        timeout: Duration,
    ) -> Result<Release> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.inner.store.latest_release(name).await?
                && record.release.status_code() == code
            {
                return Ok(record.release);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Other(format!(
                    "timed out waiting for release '{}' to reach {}",
                    name,
                    code.as_str()
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn check_manifest_kind(&self, manifest: &str) -> Result<()> {
        let manifest = Manifest::parse(manifest)?;
        self.inner.registry.resolve(&manifest.kind).map(|_| ())
    }

    async fn require_latest(&self, name: &str) -> Result<ReleaseRecord> {
        self.inner
            .store
            .latest_release(name)
            .await?
            .ok_or_else(|| Error::ReleaseNotFound(name.to_string()))
    }

    async fn require_status(&self, name: &str, expected: StatusCode) -> Result<ReleaseRecord> {
        let latest = self.require_latest(name).await?;
        let actual = latest.release.status_code();
        if actual != expected {
            return Err(Error::InvalidReleaseState {
                name: name.to_string(),
                expected: expected.as_str().to_uppercase(),
                actual: actual.as_str().to_uppercase(),
            });
        }
        Ok(latest)
    }

    async fn dispatch(&self, name: &str, event: MachineEvent) -> Result<()> {
        let mut machines = self.inner.machines.lock().await;

        // A halted machine (storage error) is replaced; its snapshot
        // carries whatever progress was durably recorded.
        if machines
            .get(name)
            .map(|handle| handle.task.is_finished())
            .unwrap_or(false)
        {
            machines.remove(name);
        }

        let handle = machines
            .entry(name.to_string())
            .or_insert_with(|| self.spawn_machine(name, None));

        handle.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::validation(
                "name",
                "too many queued operations for this release; retry later",
            ),
            mpsc::error::TrySendError::Closed(_) => {
                Error::Other("state machine task stopped".to_string())
            }
        })
    }

    fn spawn_machine(
        &self,
        name: &str,
        recovery: Option<(StateId, PersistedVars)>,
    ) -> MachineHandle {
        let (tx, mut rx) = mpsc::channel(self.inner.config.machine_queue_depth);
        let cancel = Arc::new(Notify::new());
        let deps = Arc::new(MachineDeps {
            store: self.inner.store.clone(),
            registry: self.inner.registry.clone(),
            strategy: RedBlackStrategy::new(
                self.inner.store.clone(),
                self.inner.registry.clone(),
            ),
            health_check_sleep: self.inner.config.health_check_sleep,
            default_upgrade_timeout: self.inner.config.upgrade_timeout,
            cancel: cancel.clone(),
            workers: self.inner.workers.clone(),
        });

        let name = name.to_string();
        let task = tokio::spawn(async move {
            let mut machine = match recovery {
                Some((state, vars)) => {
                    let mut machine = Machine::restore(&name, state, vars, deps);
                    if let Err(e) = machine.resume().await {
                        error!(
                            release = %name,
                            error = %e,
                            "Crash recovery failed; state machine halted"
                        );
                        return;
                    }
                    machine
                }
                None => Machine::new(&name, deps),
            };

            while let Some(event) = rx.recv().await {
                if let Err(e) = machine.handle_event(event).await {
                    // Storage errors mean durability is gone; stop this
                    // machine rather than act on unknown state. A later
                    // command respawns from the snapshot.
                    error!(
                        release = %machine.name(),
                        error = %e,
                        "State machine halted on storage error"
                    );
                    break;
                }
            }
        });

        MachineHandle { tx, cancel, task }
    }
}
