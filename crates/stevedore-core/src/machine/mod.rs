// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Release state machine.
//!
//! One logical machine exists per release name and sequences every
//! multi-step lifecycle operation. The machine is an explicit tagged-state
//! graph: an enum of states, a transition table of
//! (source, trigger, guard, target) rows and a small interpreter that runs
//! entry actions and persists a snapshot after every transition. Actions
//! never re-enter the interpreter; they return an optional follow-up event
//! which the interpreter enqueues.
//!
//! ```text
//!                        ┌─────────┐
//!        ┌───────────────│ INITIAL │──────────────────┐
//!        │install        └────┬────┘                  │rollback
//!        ▼                    │upgrade                ▼
//!   ┌─────────┐               ▼                 ┌──────────┐
//!   │ INSTALL │        ┌───────────────┐        │ ROLLBACK │──┐
//!   └────┬────┘        │ UPGRADE_START │◄───────└──────────┘  │install
//!        │             └───────┬───────┘   upgrade            │
//!        │                     ▼                              ▼
//!        │         ┌─────────────────────────┐          (re-dispatch)
//!        │         │ UPGRADE_DEPLOY_TARGET_  │
//!        │         │          APPS           │
//!        │         └────────────┬────────────┘
//!        │                      ▼
//!        │         ┌─────────────────────────┐  timer  ┌─────────────────┐
//!        │         │ UPGRADE_WAIT_TARGET_APPS│────────►│ UPGRADE_CHECK_  │
//!        │         └────────────┬────────────┘◄────────│  TARGET_APPS    │
//!        │                      │cancel        pending └───┬─────────┬───┘
//!        │                      ▼                   healthy│         │failed
//!        │              ┌──────────────┐                   ▼         ▼
//!        │              │UPGRADE_CANCEL│◄──────┐   ┌──────────┐ ┌─────────┐
//!        │              └──────┬───────┘       └───│ SUCCEED  │ │ FAILED  │
//!        │                     │            accept └────┬─────┘ └─────────┘
//!        │                     │                        ▼
//!        │                     │              ┌───────────────────┐
//!        │                     │              │ UPGRADE_DELETE_   │
//!        │                     │              │   SOURCE_APPS     │
//!        │                     │              └─────────┬─────────┘
//!        ▼                     ▼                        ▼
//!   ┌──────────────────────────────────────────────────────┐
//!   │                    ERROR_JUNCTION                     │
//!   └────────────┬─────────────────────────────┬───────────┘
//!                │error marker                 │no error
//!                ▼                             ▼
//!            ┌───────┐                    ┌─────────┐
//!            │ ERROR │───────────────────►│ INITIAL │
//!            └───────┘                    └─────────┘
//! ```
//!
//! Every operation funnels through ERROR_JUNCTION on exit; its single
//! guard ("does extended state contain an error marker?") routes to
//! ERROR or straight back to INITIAL, so no action needs its own
//! try/catch-to-state logic.

mod actions;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

use crate::diff::ReleaseAnalysisReport;
use crate::error::{Error, Result};
use crate::manager::ManagerRegistry;
use crate::release::{AppDeployerData, Release};
use crate::requests::{
    DeleteRequest, InstallRequest, RollbackRequest, ScaleRequest, UpgradeRequest,
};
use crate::store::{ReleaseStore, SnapshotRecord};
use crate::strategy::RedBlackStrategy;

/// State identifiers. UPGRADE sub-states are flattened into the same enum;
/// the transition table keeps the sub-machine structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateId {
    /// Idle; terminal per operation cycle.
    Initial,
    /// Install in progress.
    Install,
    /// Delete in progress.
    Delete,
    /// Scale in progress.
    Scale,
    /// Rollback request-building in progress.
    Rollback,
    /// Upgrade: analyzing and persisting the replacing release.
    UpgradeStart,
    /// Upgrade: deploying the changed target applications.
    UpgradeDeployTargetApps,
    /// Upgrade: suspended awaiting the next health-check timer tick or a
    /// cancel event. The only blocking state in the workflow sense.
    UpgradeWaitTargetApps,
    /// Upgrade: polling target application health once.
    UpgradeCheckTargetApps,
    /// Upgrade: committing the replacing release.
    UpgradeDeploySucceeded,
    /// Upgrade: deleting the superseded source applications.
    UpgradeDeleteSourceApps,
    /// Upgrade: a target application failed its health check.
    UpgradeDeployFailed,
    /// Upgrade: tearing down target applications after cancel/failure.
    UpgradeCancel,
    /// Routing pseudo-state evaluating the error marker guard.
    ErrorJunction,
    /// Records and clears the error marker.
    Error,
}

impl StateId {
    /// Returns the string representation of the state id.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Install => "install",
            Self::Delete => "delete",
            Self::Scale => "scale",
            Self::Rollback => "rollback",
            Self::UpgradeStart => "upgrade_start",
            Self::UpgradeDeployTargetApps => "upgrade_deploy_target_apps",
            Self::UpgradeWaitTargetApps => "upgrade_wait_target_apps",
            Self::UpgradeCheckTargetApps => "upgrade_check_target_apps",
            Self::UpgradeDeploySucceeded => "upgrade_deploy_succeeded",
            Self::UpgradeDeleteSourceApps => "upgrade_delete_source_apps",
            Self::UpgradeDeployFailed => "upgrade_deploy_failed",
            Self::UpgradeCancel => "upgrade_cancel",
            Self::ErrorJunction => "error_junction",
            Self::Error => "error",
        }
    }

    /// Parse a state id from its string representation.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "initial" => Self::Initial,
            "install" => Self::Install,
            "delete" => Self::Delete,
            "scale" => Self::Scale,
            "rollback" => Self::Rollback,
            "upgrade_start" => Self::UpgradeStart,
            "upgrade_deploy_target_apps" => Self::UpgradeDeployTargetApps,
            "upgrade_wait_target_apps" => Self::UpgradeWaitTargetApps,
            "upgrade_check_target_apps" => Self::UpgradeCheckTargetApps,
            "upgrade_deploy_succeeded" => Self::UpgradeDeploySucceeded,
            "upgrade_delete_source_apps" => Self::UpgradeDeleteSourceApps,
            "upgrade_deploy_failed" => Self::UpgradeDeployFailed,
            "upgrade_cancel" => Self::UpgradeCancel,
            "error_junction" => Self::ErrorJunction,
            "error" => Self::Error,
            _ => return None,
        })
    }

    /// Whether a crashed machine can safely re-enter this state. Only the
    /// wait/check pair is pure polling; every other mid-operation state has
    /// already started side effects and fails forward instead.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::UpgradeWaitTargetApps | Self::UpgradeCheckTargetApps
        )
    }
}

/// Events driving the machine. External commands carry their request
/// payloads; the remaining variants are produced by entry actions.
#[derive(Debug)]
pub enum MachineEvent {
    /// Install command.
    Install(InstallRequest),
    /// Upgrade command.
    Upgrade(UpgradeRequest),
    /// Delete command.
    Delete(DeleteRequest),
    /// Rollback command.
    Rollback(RollbackRequest),
    /// Scale command.
    Scale(ScaleRequest),
    /// Cancel the in-flight upgrade.
    Cancel,
    /// The wait-state timer elapsed.
    Timer,
    /// All target applications are healthy.
    TargetAppsHealthy,
    /// A target application failed its health check.
    TargetAppsFailed,
    /// Self-sent accept advancing commit to source-app deletion.
    TargetAppsAccepted,
    /// Linear advancement to the next sub-state.
    Proceed,
    /// Operation finished; head for the error junction.
    Exit,
}

impl MachineEvent {
    fn kind(&self) -> EventKind {
        match self {
            Self::Install(_) => EventKind::Install,
            Self::Upgrade(_) => EventKind::Upgrade,
            Self::Delete(_) => EventKind::Delete,
            Self::Rollback(_) => EventKind::Rollback,
            Self::Scale(_) => EventKind::Scale,
            Self::Cancel => EventKind::Cancel,
            Self::Timer => EventKind::Timer,
            Self::TargetAppsHealthy => EventKind::TargetAppsHealthy,
            Self::TargetAppsFailed => EventKind::TargetAppsFailed,
            Self::TargetAppsAccepted => EventKind::TargetAppsAccepted,
            Self::Proceed => EventKind::Proceed,
            Self::Exit => EventKind::Exit,
        }
    }
}

/// Payload-free event discriminant used by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum EventKind {
    Install,
    Upgrade,
    Delete,
    Rollback,
    Scale,
    Cancel,
    Timer,
    TargetAppsHealthy,
    TargetAppsFailed,
    TargetAppsAccepted,
    Proceed,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    On(EventKind),
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardId {
    Always,
    HasError,
    NoError,
}

struct Transition {
    source: StateId,
    trigger: Trigger,
    guard: GuardId,
    target: StateId,
}

/// The transition table. Anonymous completion transitions are modeled as
/// `Exit` events produced by entry actions; every operation state routes
/// `Exit` to the error junction.
static TRANSITIONS: &[Transition] = &[
    // Command dispatch out of idle.
    t(StateId::Initial, Trigger::On(EventKind::Install), GuardId::Always, StateId::Install),
    t(StateId::Initial, Trigger::On(EventKind::Upgrade), GuardId::Always, StateId::UpgradeStart),
    t(StateId::Initial, Trigger::On(EventKind::Delete), GuardId::Always, StateId::Delete),
    t(StateId::Initial, Trigger::On(EventKind::Scale), GuardId::Always, StateId::Scale),
    t(StateId::Initial, Trigger::On(EventKind::Rollback), GuardId::Always, StateId::Rollback),
    // Single-action operations.
    t(StateId::Install, Trigger::On(EventKind::Exit), GuardId::Always, StateId::ErrorJunction),
    t(StateId::Delete, Trigger::On(EventKind::Exit), GuardId::Always, StateId::ErrorJunction),
    t(StateId::Scale, Trigger::On(EventKind::Exit), GuardId::Always, StateId::ErrorJunction),
    // Rollback re-dispatches into install or upgrade; the populated
    // request type picks the branch.
    t(StateId::Rollback, Trigger::On(EventKind::Install), GuardId::Always, StateId::Install),
    t(StateId::Rollback, Trigger::On(EventKind::Upgrade), GuardId::Always, StateId::UpgradeStart),
    t(StateId::Rollback, Trigger::On(EventKind::Exit), GuardId::Always, StateId::ErrorJunction),
    // Red-black upgrade protocol.
    t(StateId::UpgradeStart, Trigger::On(EventKind::Proceed), GuardId::Always, StateId::UpgradeDeployTargetApps),
    t(StateId::UpgradeStart, Trigger::On(EventKind::Exit), GuardId::Always, StateId::ErrorJunction),
    t(StateId::UpgradeDeployTargetApps, Trigger::On(EventKind::Proceed), GuardId::Always, StateId::UpgradeWaitTargetApps),
    t(StateId::UpgradeDeployTargetApps, Trigger::On(EventKind::Exit), GuardId::Always, StateId::ErrorJunction),
    t(StateId::UpgradeWaitTargetApps, Trigger::On(EventKind::Timer), GuardId::Always, StateId::UpgradeCheckTargetApps),
    t(StateId::UpgradeWaitTargetApps, Trigger::On(EventKind::Cancel), GuardId::Always, StateId::UpgradeCancel),
    t(StateId::UpgradeWaitTargetApps, Trigger::On(EventKind::Exit), GuardId::Always, StateId::ErrorJunction),
    t(StateId::UpgradeCheckTargetApps, Trigger::On(EventKind::TargetAppsHealthy), GuardId::Always, StateId::UpgradeDeploySucceeded),
    t(StateId::UpgradeCheckTargetApps, Trigger::On(EventKind::TargetAppsFailed), GuardId::Always, StateId::UpgradeDeployFailed),
    t(StateId::UpgradeCheckTargetApps, Trigger::On(EventKind::Proceed), GuardId::Always, StateId::UpgradeWaitTargetApps),
    t(StateId::UpgradeCheckTargetApps, Trigger::On(EventKind::Cancel), GuardId::Always, StateId::UpgradeCancel),
    t(StateId::UpgradeCheckTargetApps, Trigger::On(EventKind::Exit), GuardId::Always, StateId::ErrorJunction),
    t(StateId::UpgradeDeploySucceeded, Trigger::On(EventKind::TargetAppsAccepted), GuardId::Always, StateId::UpgradeDeleteSourceApps),
    t(StateId::UpgradeDeploySucceeded, Trigger::On(EventKind::Exit), GuardId::Always, StateId::ErrorJunction),
    t(StateId::UpgradeDeleteSourceApps, Trigger::On(EventKind::Exit), GuardId::Always, StateId::ErrorJunction),
    t(StateId::UpgradeDeployFailed, Trigger::On(EventKind::Proceed), GuardId::Always, StateId::UpgradeCancel),
    t(StateId::UpgradeDeployFailed, Trigger::On(EventKind::Exit), GuardId::Always, StateId::ErrorJunction),
    t(StateId::UpgradeCancel, Trigger::On(EventKind::Exit), GuardId::Always, StateId::ErrorJunction),
    // The uniform error funnel.
    t(StateId::ErrorJunction, Trigger::Auto, GuardId::HasError, StateId::Error),
    t(StateId::ErrorJunction, Trigger::Auto, GuardId::NoError, StateId::Initial),
    t(StateId::Error, Trigger::Auto, GuardId::Always, StateId::Initial),
];

const fn t(source: StateId, trigger: Trigger, guard: GuardId, target: StateId) -> Transition {
    Transition {
        source,
        trigger,
        guard,
        target,
    }
}

/// Snapshot-persisted subset of the extended state. Live release objects,
/// analysis reports and error objects are process-local and reattached on
/// resume, never serialized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedVars {
    /// Version of the release being upgraded away from.
    #[serde(default)]
    pub existing_version: Option<i64>,
    /// Version created by the in-flight install/upgrade.
    #[serde(default)]
    pub replacing_version: Option<i64>,
    /// Changed-app set computed by the analysis.
    #[serde(default)]
    pub apps_to_upgrade: Option<Vec<String>>,
    /// Whether the analysis was force-widened.
    #[serde(default)]
    pub force_update: bool,
    /// Upgrade timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Wall-clock deadline for the health-check wait.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Encoded cancel reason, set before routing into UPGRADE_CANCEL.
    #[serde(default)]
    pub cancel_reason: Option<String>,
}

/// Extended state: the persisted subset plus process-local transients.
#[derive(Debug, Default)]
pub struct Vars {
    /// Snapshot-persisted variables.
    pub persisted: PersistedVars,
    /// The release being upgraded away from (transient).
    pub existing: Option<Release>,
    /// The release the in-flight operation creates (transient).
    pub replacing: Option<Release>,
    /// Current analysis report (transient, recomputed on resume).
    pub report: Option<ReleaseAnalysisReport>,
    /// Deployer data of the newly deployed target apps (transient,
    /// reloaded from the store on resume).
    pub target_data: Option<AppDeployerData>,
    /// Detail of the most recent health-check failure (transient).
    pub failure_detail: Option<String>,
    /// The error marker evaluated by the junction guard (transient).
    pub error: Option<Error>,
}

/// Shared dependencies of every machine instance.
pub struct MachineDeps {
    /// Durable release store.
    pub store: Arc<dyn ReleaseStore>,
    /// Platform kind registry.
    pub registry: Arc<ManagerRegistry>,
    /// Red-black upgrade strategy.
    pub strategy: RedBlackStrategy,
    /// Sleep between health-check polls (minimum enforced positive).
    pub health_check_sleep: Duration,
    /// Default upgrade timeout applied when a request carries none.
    pub default_upgrade_timeout: Duration,
    /// Cancel signal; interrupts the upgrade wait state.
    pub cancel: Arc<Notify>,
    /// Worker pool bounding concurrently executing actions.
    pub workers: Arc<Semaphore>,
}

/// One release state machine instance.
pub struct Machine {
    name: String,
    state: StateId,
    vars: Vars,
    deps: Arc<MachineDeps>,
}

impl Machine {
    /// Create an idle machine for a release name.
    pub fn new(name: impl Into<String>, deps: Arc<MachineDeps>) -> Self {
        Self {
            name: name.into(),
            state: StateId::Initial,
            vars: Vars::default(),
            deps,
        }
    }

    /// Restore a machine from a persisted snapshot.
    pub fn restore(
        name: impl Into<String>,
        state: StateId,
        persisted: PersistedVars,
        deps: Arc<MachineDeps>,
    ) -> Self {
        Self {
            name: name.into(),
            state,
            vars: Vars {
                persisted,
                ..Vars::default()
            },
            deps,
        }
    }

    /// The release name this machine serializes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> StateId {
        self.state
    }

    /// Feed one external event through the interpreter until the machine
    /// settles. Storage errors abort the run and surface; everything else
    /// funnels through the error junction.
    pub async fn handle_event(&mut self, event: MachineEvent) -> Result<()> {
        self.drive(VecDeque::from([event])).await
    }

    /// Resume after process restart. The wait/check states are pure
    /// polling and re-enter directly; any other mid-operation state has
    /// already started side effects and fails forward through the funnel.
    pub async fn resume(&mut self) -> Result<()> {
        match self.state {
            StateId::Initial => Ok(()),
            StateId::UpgradeWaitTargetApps | StateId::UpgradeCheckTargetApps => {
                debug!(
                    release = %self.name,
                    state = self.state.as_str(),
                    "Resuming in-flight upgrade from snapshot"
                );
                self.reattach().await?;
                let mut queue = VecDeque::new();
                if let Some(next) = self.run_entry(MachineEvent::Proceed).await? {
                    queue.push_back(next);
                }
                self.drive(queue).await
            }
            StateId::ErrorJunction | StateId::Error => {
                // The operation already funneled; just finish the chain.
                self.vars.error = None;
                self.transition(StateId::Initial).await?;
                self.clear_transients();
                self.persist_snapshot().await
            }
            _ => self.fail_forward("Operation interrupted by restart").await,
        }
    }

    /// Record an error marker and route the machine through the uniform
    /// error funnel from its current state.
    pub async fn fail_forward(&mut self, description: &str) -> Result<()> {
        warn!(
            release = %self.name,
            state = self.state.as_str(),
            description,
            "Failing operation forward"
        );
        if let Some(version) = self.vars.persisted.replacing_version {
            let text = description.to_string();
            match crate::store::update_with_retry(
                self.deps.store.as_ref(),
                &self.name,
                version,
                move |r| r.mark_failed(text.clone(), Utc::now()),
            )
            .await
            {
                Ok(_) => {}
                // The crash may have hit before the release was inserted.
                Err(Error::VersionNotFound { .. }) => {}
                Err(e) if e.is_storage() => return Err(e),
                Err(e) => warn!(release = %self.name, error = %e, "Failed to record FAILED status"),
            }
        }
        self.vars.error = Some(Error::Other(description.to_string()));
        self.drive(VecDeque::from([MachineEvent::Exit])).await
    }

    async fn drive(&mut self, mut queue: VecDeque<MachineEvent>) -> Result<()> {
        while let Some(event) = queue.pop_front() {
            let kind = event.kind();
            let Some(target) = self.route(kind) else {
                warn!(
                    release = %self.name,
                    state = self.state.as_str(),
                    event = ?kind,
                    "Event not handled in current state"
                );
                continue;
            };
            self.transition(target).await?;

            let mut follow_up = self.run_entry(event).await?;
            while follow_up.is_none() {
                match self.route_auto() {
                    Some(target) => {
                        self.transition(target).await?;
                        follow_up = self.run_entry(MachineEvent::Proceed).await?;
                    }
                    None => break,
                }
            }
            if let Some(next) = follow_up {
                queue.push_back(next);
            }
        }
        Ok(())
    }

    async fn transition(&mut self, target: StateId) -> Result<()> {
        debug!(
            release = %self.name,
            from = self.state.as_str(),
            to = target.as_str(),
            "State transition"
        );
        self.state = target;
        self.persist_snapshot().await
    }

    async fn run_entry(&mut self, event: MachineEvent) -> Result<Option<MachineEvent>> {
        // The wait state is a suspension, not work; it must not hold a
        // worker permit while sleeping. Pseudo/idle states carry no action.
        let needs_worker = !matches!(
            self.state,
            StateId::Initial
                | StateId::ErrorJunction
                | StateId::Error
                | StateId::UpgradeWaitTargetApps
        );
        let _permit = if needs_worker {
            Some(
                self.deps
                    .workers
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Other("worker pool closed".to_string()))?,
            )
        } else {
            None
        };
        self.dispatch_entry(event).await
    }

    fn route(&self, kind: EventKind) -> Option<StateId> {
        TRANSITIONS
            .iter()
            .find(|t| {
                t.source == self.state
                    && t.trigger == Trigger::On(kind)
                    && self.guard_holds(t.guard)
            })
            .map(|t| t.target)
    }

    fn route_auto(&self) -> Option<StateId> {
        TRANSITIONS
            .iter()
            .find(|t| {
                t.source == self.state && t.trigger == Trigger::Auto && self.guard_holds(t.guard)
            })
            .map(|t| t.target)
    }

    fn guard_holds(&self, guard: GuardId) -> bool {
        match guard {
            GuardId::Always => true,
            GuardId::HasError => self.vars.error.is_some(),
            GuardId::NoError => self.vars.error.is_none(),
        }
    }

    pub(crate) async fn persist_snapshot(&self) -> Result<()> {
        let record = SnapshotRecord {
            release_name: self.name.clone(),
            state_id: self.state.as_str().to_string(),
            vars: serde_json::to_value(&self.vars.persisted)?,
            updated_at: Utc::now(),
        };
        self.deps.store.save_snapshot(&record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MockReleaseManager;
    use crate::release::{PackageRef, StatusCode};
    use crate::store::MemoryReleaseStore;

    const V1: &str = r#"{
        "kind": "mock",
        "apps": {
            "api": {"image": "registry/api:1.0"},
            "worker": {"image": "registry/worker:1.0"}
        }
    }"#;

    fn deps_with(
        manager: Arc<MockReleaseManager>,
    ) -> (Arc<MemoryReleaseStore>, Arc<MachineDeps>) {
        let store = Arc::new(MemoryReleaseStore::new());
        let mut registry = ManagerRegistry::new();
        registry.register(manager);
        let registry = Arc::new(registry);
        let deps = Arc::new(MachineDeps {
            store: store.clone(),
            registry: registry.clone(),
            strategy: RedBlackStrategy::new(store.clone(), registry),
            health_check_sleep: Duration::from_millis(1),
            default_upgrade_timeout: Duration::from_secs(5),
            cancel: Arc::new(Notify::new()),
            workers: Arc::new(Semaphore::new(4)),
        });
        (store, deps)
    }

    fn install_request(manifest: &str) -> InstallRequest {
        InstallRequest {
            name: "orders".to_string(),
            platform_name: "default".to_string(),
            package: PackageRef {
                name: "orders-pkg".to_string(),
                version: "1.0.0".to_string(),
            },
            config_values: serde_json::json!({}),
            manifest: manifest.to_string(),
        }
    }

    #[test]
    fn test_state_id_roundtrip() {
        for state in [
            StateId::Initial,
            StateId::Install,
            StateId::Delete,
            StateId::Scale,
            StateId::Rollback,
            StateId::UpgradeStart,
            StateId::UpgradeDeployTargetApps,
            StateId::UpgradeWaitTargetApps,
            StateId::UpgradeCheckTargetApps,
            StateId::UpgradeDeploySucceeded,
            StateId::UpgradeDeleteSourceApps,
            StateId::UpgradeDeployFailed,
            StateId::UpgradeCancel,
            StateId::ErrorJunction,
            StateId::Error,
        ] {
            assert_eq!(StateId::parse(state.as_str()), Some(state));
        }
        assert_eq!(StateId::parse("bogus"), None);
    }

    #[test]
    fn test_only_wait_and_check_are_resumable() {
        assert!(StateId::UpgradeWaitTargetApps.is_resumable());
        assert!(StateId::UpgradeCheckTargetApps.is_resumable());
        assert!(!StateId::Install.is_resumable());
        assert!(!StateId::UpgradeDeployTargetApps.is_resumable());
        assert!(!StateId::UpgradeDeleteSourceApps.is_resumable());
    }

    #[test]
    fn test_routing_table() {
        let (_, deps) = deps_with(Arc::new(MockReleaseManager::new()));
        let mut machine = Machine::new("orders", deps);

        assert_eq!(machine.route(EventKind::Install), Some(StateId::Install));
        assert_eq!(machine.route(EventKind::Upgrade), Some(StateId::UpgradeStart));
        // A cancel in idle has no route.
        assert_eq!(machine.route(EventKind::Cancel), None);

        machine.state = StateId::UpgradeWaitTargetApps;
        assert_eq!(
            machine.route(EventKind::Timer),
            Some(StateId::UpgradeCheckTargetApps)
        );
        assert_eq!(machine.route(EventKind::Cancel), Some(StateId::UpgradeCancel));

        // Junction guard: error marker present routes to ERROR.
        machine.state = StateId::ErrorJunction;
        assert_eq!(machine.route_auto(), Some(StateId::Initial));
        machine.vars.error = Some(Error::Other("boom".to_string()));
        assert_eq!(machine.route_auto(), Some(StateId::Error));
    }

    #[tokio::test]
    async fn test_install_event_reaches_deployed_and_idle() {
        let manager = Arc::new(MockReleaseManager::new());
        let (store, deps) = deps_with(manager.clone());
        let mut machine = Machine::new("orders", deps);

        machine
            .handle_event(MachineEvent::Install(install_request(V1)))
            .await
            .unwrap();

        assert_eq!(machine.state(), StateId::Initial);
        let latest = store.latest_release("orders").await.unwrap().unwrap();
        assert_eq!(latest.release.version, 1);
        assert_eq!(latest.release.status_code(), StatusCode::Deployed);
        assert_eq!(manager.deployment_count().await, 2);

        // Snapshot row remains at INITIAL for the next command.
        let snapshot = store.load_snapshot("orders").await.unwrap().unwrap();
        assert_eq!(snapshot.state_id, "initial");
    }

    #[tokio::test]
    async fn test_failed_install_funnels_through_error() {
        let manager = Arc::new(MockReleaseManager::failing());
        let (store, deps) = deps_with(manager);
        let mut machine = Machine::new("orders", deps);

        machine
            .handle_event(MachineEvent::Install(install_request(V1)))
            .await
            .unwrap();

        // Machine settled back to idle with the marker cleared.
        assert_eq!(machine.state(), StateId::Initial);
        assert!(machine.vars.error.is_none());

        // The release record is FAILED, not stuck mid-operation.
        let latest = store.latest_release("orders").await.unwrap().unwrap();
        assert_eq!(latest.release.status_code(), StatusCode::Failed);
    }

    #[tokio::test]
    async fn test_upgrade_happy_path_through_wait_loop() {
        let manager = Arc::new(MockReleaseManager::new());
        let (store, deps) = deps_with(manager.clone());
        let mut machine = Machine::new("orders", deps);

        machine
            .handle_event(MachineEvent::Install(install_request(V1)))
            .await
            .unwrap();

        let v2 = V1.replace("registry/worker:1.0", "registry/worker:1.1");
        machine
            .handle_event(MachineEvent::Upgrade(UpgradeRequest {
                name: "orders".to_string(),
                package: PackageRef {
                    name: "orders-pkg".to_string(),
                    version: "1.0.1".to_string(),
                },
                config_values: serde_json::json!({}),
                manifest: v2,
                timeout: Some(Duration::from_secs(5)),
                force_update: false,
                app_names: None,
            }))
            .await
            .unwrap();

        assert_eq!(machine.state(), StateId::Initial);
        let latest = store.latest_release("orders").await.unwrap().unwrap();
        assert_eq!(latest.release.version, 2);
        assert_eq!(latest.release.status_code(), StatusCode::Deployed);

        let v1 = store.get_release("orders", 1).await.unwrap().unwrap();
        assert_eq!(v1.release.status_code(), StatusCode::Deleted);

        // Only the worker was redeployed for v2.
        let deploys = manager.calls_with_prefix("deploy:orders/2").await;
        assert_eq!(deploys, vec!["deploy:orders/2:worker".to_string()]);
    }

    #[tokio::test]
    async fn test_upgrade_timeout_cancels() {
        let manager = Arc::new(MockReleaseManager::never_healthy());
        let (store, deps) = deps_with(manager.clone());
        let mut machine = Machine::new("orders", deps);

        // Install succeeds regardless of health defaults.
        machine
            .handle_event(MachineEvent::Install(install_request(V1)))
            .await
            .unwrap();

        let v2 = V1.replace("registry/worker:1.0", "registry/worker:1.1");
        machine
            .handle_event(MachineEvent::Upgrade(UpgradeRequest {
                name: "orders".to_string(),
                package: PackageRef {
                    name: "orders-pkg".to_string(),
                    version: "1.0.1".to_string(),
                },
                config_values: serde_json::json!({}),
                manifest: v2,
                timeout: Some(Duration::from_millis(20)),
                force_update: false,
                app_names: None,
            }))
            .await
            .unwrap();

        assert_eq!(machine.state(), StateId::Initial);
        let v2 = store.get_release("orders", 2).await.unwrap().unwrap();
        assert_eq!(v2.release.status_code(), StatusCode::Failed);
        let description = &v2.release.info.as_ref().unwrap().status.description;
        assert!(description.contains("timed out after 20ms"), "got: {description}");

        // The existing release is untouched and still deployed.
        let v1 = store.get_release("orders", 1).await.unwrap().unwrap();
        assert_eq!(v1.release.status_code(), StatusCode::Deployed);
        assert_eq!(
            manager.deployed_apps("orders", 1).await,
            vec!["api".to_string(), "worker".to_string()]
        );
        assert!(manager.deployed_apps("orders", 2).await.is_empty());
    }

    #[tokio::test]
    async fn test_explicit_cancel_interrupts_wait() {
        let manager = Arc::new(MockReleaseManager::never_healthy());
        let (store, deps) = deps_with(manager);
        let mut machine = Machine::new("orders", deps.clone());

        machine
            .handle_event(MachineEvent::Install(install_request(V1)))
            .await
            .unwrap();

        // Park the cancel permit before the upgrade enters its wait state.
        deps.cancel.notify_one();

        let v2 = V1.replace("registry/worker:1.0", "registry/worker:1.1");
        machine
            .handle_event(MachineEvent::Upgrade(UpgradeRequest {
                name: "orders".to_string(),
                package: PackageRef {
                    name: "orders-pkg".to_string(),
                    version: "1.0.1".to_string(),
                },
                config_values: serde_json::json!({}),
                manifest: v2,
                timeout: Some(Duration::from_secs(30)),
                force_update: false,
                app_names: None,
            }))
            .await
            .unwrap();

        let v2 = store.get_release("orders", 2).await.unwrap().unwrap();
        assert_eq!(v2.release.status_code(), StatusCode::Failed);
        let description = &v2.release.info.as_ref().unwrap().status.description;
        assert!(description.contains("cancelled"), "got: {description}");
        assert!(!description.contains("timed out"));
    }

    #[tokio::test]
    async fn test_fail_forward_marks_release_and_settles() {
        let manager = Arc::new(MockReleaseManager::new());
        let (store, deps) = deps_with(manager);

        // Simulate a machine restored mid-install after a crash.
        let release = Release::new(
            "orders",
            1,
            V1,
            PackageRef {
                name: "orders-pkg".to_string(),
                version: "1.0.0".to_string(),
            },
            serde_json::json!({}),
            "default",
            Utc::now(),
        );
        store.insert_release(&release).await.unwrap();

        let persisted = PersistedVars {
            replacing_version: Some(1),
            ..PersistedVars::default()
        };
        let mut machine = Machine::restore("orders", StateId::Install, persisted, deps);
        machine.resume().await.unwrap();

        assert_eq!(machine.state(), StateId::Initial);
        let latest = store.latest_release("orders").await.unwrap().unwrap();
        assert_eq!(latest.release.status_code(), StatusCode::Failed);
        assert!(
            latest
                .release
                .info
                .as_ref()
                .unwrap()
                .status
                .description
                .contains("interrupted by restart")
        );
    }

    #[tokio::test]
    async fn test_storage_error_aborts_run() {
        let manager = Arc::new(MockReleaseManager::new());
        let (store, deps) = deps_with(manager);
        let mut machine = Machine::new("orders", deps);

        store.set_fail_all(true);
        let err = machine
            .handle_event(MachineEvent::Install(install_request(V1)))
            .await
            .unwrap_err();
        assert!(err.is_storage());
    }
}
