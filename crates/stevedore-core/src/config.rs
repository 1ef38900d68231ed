// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.
//!
//! All polling windows are configuration rather than hard-coded behavior;
//! none of the defaults is load-bearing for correctness.

use std::path::PathBuf;
use std::time::Duration;

/// Smallest health-check sleep the state machine will accept. The upgrade
/// wait state is timer-driven; a zero period would busy-loop it.
pub const MIN_HEALTH_CHECK_SLEEP: Duration = Duration::from_millis(1);

/// Stevedore orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
    /// Number of workers executing state-machine actions.
    pub worker_pool_size: usize,
    /// Sleep between health-check polls of newly deployed target apps.
    pub health_check_sleep: Duration,
    /// Default upgrade timeout applied when a request carries none.
    pub upgrade_timeout: Duration,
    /// Reconciliation tick period.
    pub reconcile_interval: Duration,
    /// How often a tick escalates to a full poll of every release.
    pub full_poll_interval: Duration,
    /// Non-full ticks only refresh releases deployed within this window.
    pub recent_window: Duration,
    /// Bound on concurrent per-release status queries within one tick.
    pub max_concurrent_status_checks: usize,
    /// Depth of each release's command queue; a full queue rejects the
    /// command synchronously instead of interleaving operations.
    pub machine_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".data/stevedore.db"),
            worker_pool_size: 4,
            health_check_sleep: Duration::from_millis(1000),
            upgrade_timeout: Duration::from_secs(300),
            reconcile_interval: Duration::from_secs(5),
            full_poll_interval: Duration::from_secs(600),
            recent_window: Duration::from_secs(120),
            max_concurrent_status_checks: 8,
            machine_queue_depth: 16,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `STEVEDORE_DATABASE_PATH`: SQLite database file (default: `.data/stevedore.db`)
    /// - `STEVEDORE_WORKER_POOL_SIZE`: state-machine workers (default: 4)
    /// - `STEVEDORE_HEALTH_CHECK_SLEEP_MS`: health-check poll sleep (default: 1000, minimum 1)
    /// - `STEVEDORE_UPGRADE_TIMEOUT_MS`: default upgrade timeout (default: 300000)
    /// - `STEVEDORE_RECONCILE_INTERVAL_SECS`: reconciler tick (default: 5)
    /// - `STEVEDORE_FULL_POLL_INTERVAL_SECS`: full-poll escalation (default: 600)
    /// - `STEVEDORE_RECENT_WINDOW_SECS`: recent-release window (default: 120)
    /// - `STEVEDORE_MAX_CONCURRENT_STATUS_CHECKS`: status fan-out bound (default: 8)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let database_path = std::env::var("STEVEDORE_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let worker_pool_size = parse_var(
            "STEVEDORE_WORKER_POOL_SIZE",
            defaults.worker_pool_size,
            "must be a positive integer",
        )?;
        if worker_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "STEVEDORE_WORKER_POOL_SIZE",
                "must be a positive integer",
            ));
        }

        let health_check_sleep_ms: u64 = parse_var(
            "STEVEDORE_HEALTH_CHECK_SLEEP_MS",
            1000,
            "must be a duration in milliseconds",
        )?;
        // Minimum enforced positive; a zero sleep would busy-loop the wait state.
        let health_check_sleep =
            Duration::from_millis(health_check_sleep_ms).max(MIN_HEALTH_CHECK_SLEEP);

        let upgrade_timeout_ms: u64 = parse_var(
            "STEVEDORE_UPGRADE_TIMEOUT_MS",
            300_000,
            "must be a duration in milliseconds",
        )?;

        let reconcile_secs: u64 = parse_var(
            "STEVEDORE_RECONCILE_INTERVAL_SECS",
            5,
            "must be a duration in seconds",
        )?;
        let full_poll_secs: u64 = parse_var(
            "STEVEDORE_FULL_POLL_INTERVAL_SECS",
            600,
            "must be a duration in seconds",
        )?;
        let recent_secs: u64 = parse_var(
            "STEVEDORE_RECENT_WINDOW_SECS",
            120,
            "must be a duration in seconds",
        )?;

        let max_concurrent_status_checks = parse_var(
            "STEVEDORE_MAX_CONCURRENT_STATUS_CHECKS",
            defaults.max_concurrent_status_checks,
            "must be a positive integer",
        )?;
        if max_concurrent_status_checks == 0 {
            return Err(ConfigError::Invalid(
                "STEVEDORE_MAX_CONCURRENT_STATUS_CHECKS",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            database_path,
            worker_pool_size,
            health_check_sleep,
            upgrade_timeout: Duration::from_millis(upgrade_timeout_ms),
            reconcile_interval: Duration::from_secs(reconcile_secs),
            full_poll_interval: Duration::from_secs(full_poll_secs),
            recent_window: Duration::from_secs(recent_secs),
            max_concurrent_status_checks,
            machine_queue_depth: defaults.machine_queue_depth,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: T,
    message: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(name, message)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
