// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stevedore Core - Release Lifecycle Engine
//!
//! This crate drives versioned releases (named deployments of packaged
//! application sets) through install, upgrade, rollback, scale and delete
//! on pluggable platform backends, persisting all state to SQLite for
//! crash resilience.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         External Request Layer                           │
//! │                  (REST API, CLI - out of scope here)                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ lifecycle commands
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     stevedore-core (This Crate)                          │
//! │  ┌─────────────┐  ┌──────────────┐  ┌────────────┐  ┌──────────────┐    │
//! │  │   Release   │  │    State     │  │ Red-Black  │  │ Reconciler   │    │
//! │  │   Service   │─►│   Machines   │─►│  Strategy  │  │    Loop      │    │
//! │  └─────────────┘  └──────────────┘  └──────┬─────┘  └──────┬───────┘    │
//! └────────────────────────│───────────────────│───────────────│────────────┘
//!                          │ snapshots         │ deploy/delete │ status
//!                          ▼                   ▼               ▼
//!               ┌───────────────────┐  ┌─────────────────────────────┐
//!               │      SQLite       │  │      Release Managers       │
//!               │ (Durable Storage) │  │  (one per platform kind)    │
//!               └───────────────────┘  └─────────────────────────────┘
//! ```
//!
//! # Lifecycle Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `install` | Deploy a rendered manifest as version 1 (or next after a DELETED release) |
//! | `upgrade` | Red-black upgrade to version N+1, redeploying only changed applications |
//! | `delete` | Tear down backend resources, optionally releasing the source package |
//! | `rollback` | Re-dispatch an older version's content as a new install/upgrade |
//! | `scale` | Per-application instance-count adjustment, partial failure tolerated |
//! | `cancel` | Interrupt an upgrade while it awaits health checks |
//!
//! Commands are validated synchronously and then processed by one state
//! machine per release name; operations on the same name never interleave,
//! operations on different names run independently.
//!
//! # Release Status State Machine
//!
//! ```text
//!                     ┌─────────┐
//!                     │ UNKNOWN │
//!                     └────┬────┘
//!              install/upgrade confirmed
//!                          ▼
//!                     ┌──────────┐
//!          ┌──────────│ DEPLOYED │──────────┐
//!          │          └────┬─────┘          │
//!          │               │                │
//!     delete│       upgrade│           fail │
//!          │               │                │
//!          ▼               ▼                ▼
//!     ┌─────────┐   ┌───────────┐      ┌────────┐
//!     │ DELETED │   │ DEPLOYED  │      │ FAILED │
//!     └────┬────┘   │ (new ver) │      └───┬────┘
//!          │        └───────────┘          │
//!          │ re-install                    │ re-install / rollback
//!          ▼                               ▼
//!     (next version, number never reused)
//! ```
//!
//! The upgrade path itself is a sub-machine (deploy targets, timer-driven
//! health-check wait, commit or cancel) documented in [`machine`].
//!
//! # Reconciliation
//!
//! A background loop re-polls backend status for every DEPLOYED or FAILED
//! release so status queries never block on a backend call. Most ticks
//! refresh only recently deployed releases; a coarser interval (and always
//! the first tick after start) escalates to a full poll. See
//! [`reconciler`].
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STEVEDORE_DATABASE_PATH` | No | `.data/stevedore.db` | SQLite database file |
//! | `STEVEDORE_WORKER_POOL_SIZE` | No | `4` | State-machine action workers |
//! | `STEVEDORE_HEALTH_CHECK_SLEEP_MS` | No | `1000` | Upgrade health-check poll sleep |
//! | `STEVEDORE_UPGRADE_TIMEOUT_MS` | No | `300000` | Default upgrade timeout |
//! | `STEVEDORE_RECONCILE_INTERVAL_SECS` | No | `5` | Reconciler tick period |
//! | `STEVEDORE_FULL_POLL_INTERVAL_SECS` | No | `600` | Full-poll escalation interval |
//! | `STEVEDORE_RECENT_WINDOW_SECS` | No | `120` | Recent-release refresh window |
//! | `STEVEDORE_MAX_CONCURRENT_STATUS_CHECKS` | No | `8` | Status query fan-out bound |
//!
//! # Modules
//!
//! - [`config`]: Orchestrator configuration from environment variables
//! - [`diff`]: Per-application manifest differencer
//! - [`error`]: Error types for lifecycle operations
//! - [`machine`]: Release state machine (states, transition table, interpreter)
//! - [`manager`]: Release manager contract and platform-kind registry
//! - [`reconciler`]: Background status reconciliation loop
//! - [`release`]: Release, info and deployer-data model
//! - [`requests`]: Lifecycle request objects
//! - [`runtime`]: Embeddable runtime wiring service + reconciler
//! - [`service`]: Command validation and per-release dispatch
//! - [`store`]: Durable release store (SQLite, in-memory)
//! - [`strategy`]: Red-black upgrade strategy

#![deny(missing_docs)]

/// Orchestrator configuration from environment variables.
pub mod config;

/// Per-application manifest differencer.
pub mod diff;

/// Error types for lifecycle operations.
pub mod error;

/// Release state machine: states, transition table, interpreter.
pub mod machine;

/// Release manager contract and platform-kind registry.
pub mod manager;

/// Database migrations for stevedore-core.
pub mod migrations;

/// Background status reconciliation loop.
pub mod reconciler;

/// Release, info and deployer-data model.
pub mod release;

/// Lifecycle request objects.
pub mod requests;

/// Embeddable runtime wiring service and reconciler.
pub mod runtime;

/// Command validation and per-release dispatch.
pub mod service;

/// Durable release store backends.
pub mod store;

/// Red-black upgrade strategy.
pub mod strategy;

pub use config::Config;
pub use error::{Error, Result};
pub use release::{Release, StatusCode};
pub use service::ReleaseService;
