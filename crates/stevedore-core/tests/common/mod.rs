// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared test harness: in-memory SQLite store, mock release manager and
//! a wired release service.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use stevedore_core::config::Config;
use stevedore_core::manager::{ManagerRegistry, MockReleaseManager};
use stevedore_core::release::{PackageRef, Release, StatusCode};
use stevedore_core::requests::{InstallRequest, UpgradeRequest};
use stevedore_core::service::ReleaseService;
use stevedore_core::store::SqliteReleaseStore;

pub const MANIFEST_V1: &str = r#"{
    "kind": "mock",
    "apps": {
        "api": {"image": "registry/api:1.0", "instances": "2"},
        "worker": {"image": "registry/worker:1.0", "instances": "1"}
    }
}"#;

pub const MANIFEST_V2_WORKER_ONLY: &str = r#"{
    "kind": "mock",
    "apps": {
        "api": {"image": "registry/api:1.0", "instances": "2"},
        "worker": {"image": "registry/worker:1.1", "instances": "1"}
    }
}"#;

/// Route orchestrator tracing into the test harness, filtered by
/// `RUST_LOG`. Ignores the error when another test already installed it.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestContext {
    pub store: Arc<SqliteReleaseStore>,
    pub manager: Arc<MockReleaseManager>,
    pub service: ReleaseService,
}

impl TestContext {
    pub async fn new() -> Self {
        init_tracing();

        let store = Arc::new(
            SqliteReleaseStore::in_memory()
                .await
                .expect("failed to open in-memory store"),
        );
        let manager = Arc::new(MockReleaseManager::new());
        let mut registry = ManagerRegistry::new();
        registry.register(manager.clone());

        let config = Config {
            health_check_sleep: Duration::from_millis(1),
            ..Config::default()
        };
        let service = ReleaseService::new(store.clone(), Arc::new(registry), config);

        Self {
            store,
            manager,
            service,
        }
    }

    pub fn install_request(&self, name: &str, manifest: &str) -> InstallRequest {
        InstallRequest {
            name: name.to_string(),
            platform_name: "default".to_string(),
            package: PackageRef {
                name: format!("{name}-pkg"),
                version: "1.0.0".to_string(),
            },
            config_values: serde_json::json!({}),
            manifest: manifest.to_string(),
        }
    }

    pub fn upgrade_request(
        &self,
        name: &str,
        manifest: &str,
        timeout: Option<Duration>,
    ) -> UpgradeRequest {
        UpgradeRequest {
            name: name.to_string(),
            package: PackageRef {
                name: format!("{name}-pkg"),
                version: "1.0.1".to_string(),
            },
            config_values: serde_json::json!({}),
            manifest: manifest.to_string(),
            timeout,
            force_update: false,
            app_names: None,
        }
    }

    /// Install a release and wait until it is DEPLOYED.
    pub async fn install_deployed(&self, name: &str, manifest: &str) -> Release {
        self.service
            .install(self.install_request(name, manifest))
            .await
            .expect("install rejected");
        self.wait_for(name, StatusCode::Deployed).await
    }

    /// Wait until the latest release of `name` reaches the given status.
    pub async fn wait_for(&self, name: &str, code: StatusCode) -> Release {
        self.service
            .wait_for_status(name, code, Duration::from_secs(5))
            .await
            .expect("release did not reach expected status")
    }
}
