// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stevedore-core.
//!
//! One unified error enum covers the whole lifecycle taxonomy: validation
//! errors are surfaced synchronously to callers and never enter the state
//! machine's error path; manager errors are recorded as the machine's error
//! marker; storage errors are re-thrown rather than absorbed into a FAILED
//! release record.

use thiserror::Error;

/// Result type using stevedore Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Stevedore errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Request validation failed before any backend call.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Release was not found in the store.
    #[error("Release '{0}' not found")]
    ReleaseNotFound(String),

    /// A specific release version was not found.
    #[error("Release '{name}' version {version} not found")]
    VersionNotFound {
        /// Release name.
        name: String,
        /// Version that was not found.
        version: i64,
    },

    /// Release is in an invalid status for the requested operation.
    #[error("Release '{name}' is in invalid state: expected {expected}, got {actual}")]
    InvalidReleaseState {
        /// Release name.
        name: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// No release manager is registered for the manifest's platform kind.
    #[error("No release manager registered for platform kind '{0}'")]
    UnknownPlatformKind(String),

    /// A release manager (backend) operation failed.
    #[error("Release manager error during '{operation}': {details}")]
    Manager {
        /// The operation that failed (install, delete, status, ...).
        operation: String,
        /// Error details from the backend.
        details: String,
    },

    /// Rendered manifest text could not be parsed.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Optimistic-versioning write conflict on a release record.
    ///
    /// Both a state-machine action and the reconciliation loop can race on
    /// the same `(name, version)`; writers retry or surface this, never
    /// silently last-writer-win.
    #[error("Write conflict on release '{name}' version {version}")]
    Conflict {
        /// Release name.
        name: String,
        /// Release version.
        version: i64,
    },

    /// Storage operation failed.
    #[error("Storage error during '{operation}': {details}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a manager error for the given backend operation.
    pub fn manager(operation: impl Into<String>, details: impl std::fmt::Display) -> Self {
        Error::Manager {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Build a validation error for the given field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether this is a storage-layer (data-access) error.
    ///
    /// Storage errors mean the durable record is in an unknown state; they
    /// must stop automated progress and surface, never be converted into a
    /// FAILED-but-otherwise-normal release record.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage { .. } | Error::Conflict { .. })
    }

    /// Whether this is a user/validation error detected before any backend
    /// call. These are surfaced synchronously and never enter the state
    /// machine's error funnel.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Validation { .. }
                | Error::ReleaseNotFound(_)
                | Error::VersionNotFound { .. }
                | Error::InvalidReleaseState { .. }
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}
