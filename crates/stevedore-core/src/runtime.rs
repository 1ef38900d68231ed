// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for stevedore-core.
//!
//! This module provides [`OrchestratorRuntime`] which wires the release
//! service, crash recovery and the reconciliation loop into an existing
//! tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stevedore_core::config::Config;
//! use stevedore_core::manager::ManagerRegistry;
//! use stevedore_core::runtime::OrchestratorRuntime;
//! use stevedore_core::store::SqliteReleaseStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(SqliteReleaseStore::from_path(&config.database_path).await?);
//!
//!     let mut registry = ManagerRegistry::new();
//!     registry.register(Arc::new(my_platform::LocalReleaseManager::new()));
//!
//!     let runtime = OrchestratorRuntime::builder()
//!         .store(store)
//!         .registry(Arc::new(registry))
//!         .config(config)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... drive runtime.service() from your request layer ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::manager::ManagerRegistry;
use crate::reconciler::{Clock, Reconciler, ReconcilerConfig, SystemClock};
use crate::service::ReleaseService;
use crate::store::ReleaseStore;

/// Builder for creating an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeBuilder {
    store: Option<Arc<dyn ReleaseStore>>,
    registry: Option<Arc<ManagerRegistry>>,
    config: Config,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for OrchestratorRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("registry", &self.registry.as_ref().map(|_| "..."))
            .field("config", &self.config)
            .finish()
    }
}

impl Default for OrchestratorRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            registry: None,
            config: Config::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the release store (required).
    pub fn store(mut self, store: Arc<dyn ReleaseStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the manager registry (required).
    pub fn registry(mut self, registry: Arc<ManagerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the orchestrator configuration.
    ///
    /// Default: [`Config::default()`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Inject a clock for the reconciler's poll-window election.
    ///
    /// Default: the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let store = self.store.ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;

        Ok(OrchestratorRuntimeConfig {
            store,
            registry,
            config: self.config,
            clock: self.clock,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    store: Arc<dyn ReleaseStore>,
    registry: Arc<ManagerRegistry>,
    config: Config,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for OrchestratorRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorRuntimeConfig")
            .field("store", &"...")
            .field("registry", &"...")
            .field("config", &self.config)
            .finish()
    }
}

impl OrchestratorRuntimeConfig {
    /// Start the runtime: recover in-flight operations from snapshots and
    /// spawn the reconciliation loop.
    pub async fn start(self) -> Result<OrchestratorRuntime> {
        let service = ReleaseService::new(
            self.store.clone(),
            self.registry.clone(),
            self.config.clone(),
        );
        service.recover().await?;

        let reconciler = Reconciler::with_clock(
            self.store,
            self.registry,
            ReconcilerConfig {
                tick_interval: self.config.reconcile_interval,
                full_poll_interval: self.config.full_poll_interval,
                recent_window: self.config.recent_window,
                max_concurrent_status_checks: self.config.max_concurrent_status_checks,
            },
            self.clock,
        );
        let reconciler_shutdown = reconciler.shutdown_handle();
        let reconciler_handle = tokio::spawn(async move { reconciler.run().await });

        info!("OrchestratorRuntime started");

        Ok(OrchestratorRuntime {
            service,
            reconciler_shutdown,
            reconciler_handle,
        })
    }
}

/// A running stevedore orchestrator that can be embedded in an application.
///
/// The runtime owns:
/// - the release service and its per-release state machine tasks
/// - the background reconciliation loop
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OrchestratorRuntime {
    service: ReleaseService,
    reconciler_shutdown: Arc<Notify>,
    reconciler_handle: JoinHandle<()>,
}

impl OrchestratorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// The release service; clone it into your request layer.
    pub fn service(&self) -> &ReleaseService {
        &self.service
    }

    /// Check if the reconciliation loop is still running.
    pub fn is_running(&self) -> bool {
        !self.reconciler_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the reconciliation loop, then drains every state machine
    /// task so in-flight operations finish their current step.
    pub async fn shutdown(self) -> Result<()> {
        info!("OrchestratorRuntime shutting down...");

        self.reconciler_shutdown.notify_one();
        match self.reconciler_handle.await {
            Ok(()) => {}
            Err(e) => {
                error!("Reconciler task panicked: {}", e);
                return Err(anyhow::anyhow!("reconciler task panicked: {}", e));
            }
        }

        self.service.shutdown().await;
        info!("OrchestratorRuntime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MockReleaseManager;
    use crate::store::MemoryReleaseStore;

    fn mock_registry() -> Arc<ManagerRegistry> {
        let mut registry = ManagerRegistry::new();
        registry.register(Arc::new(MockReleaseManager::new()));
        Arc::new(registry)
    }

    #[test]
    fn test_builder_default() {
        let builder = OrchestratorRuntimeBuilder::default();
        assert!(builder.store.is_none());
        assert!(builder.registry.is_none());
    }

    #[test]
    fn test_builder_build_missing_store() {
        let result = OrchestratorRuntimeBuilder::new().build();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("store is required"));
    }

    #[test]
    fn test_builder_build_missing_registry() {
        let result = OrchestratorRuntimeBuilder::new()
            .store(Arc::new(MemoryReleaseStore::new()))
            .build();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("registry is required")
        );
    }

    #[test]
    fn test_builder_build_success() {
        let result = OrchestratorRuntimeBuilder::new()
            .store(Arc::new(MemoryReleaseStore::new()))
            .registry(mock_registry())
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_builder_debug_hides_trait_objects() {
        let builder = OrchestratorRuntimeBuilder::new()
            .store(Arc::new(MemoryReleaseStore::new()));
        let debug_str = format!("{:?}", builder);
        assert!(debug_str.contains("OrchestratorRuntimeBuilder"));
        assert!(debug_str.contains("..."));
    }

    #[tokio::test]
    async fn test_runtime_start_and_shutdown() {
        let runtime = OrchestratorRuntime::builder()
            .store(Arc::new(MemoryReleaseStore::new()))
            .registry(mock_registry())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        let _service = runtime.service();

        runtime.shutdown().await.unwrap();
    }
}
