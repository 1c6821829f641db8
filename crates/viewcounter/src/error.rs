//! Error types for viewcounter.
//!
//! This module defines all error types used throughout the viewcounter crate.
//! The synchronizer swallows every one of these at its boundary after logging;
//! they surface to callers of the store, session and config APIs directly.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for viewcounter operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Counter Store Errors ===
    /// The counter store could not be reached or rejected the operation.
    #[error("counter store unreachable during {operation}: {message}")]
    StoreUnreachable {
        /// The store operation that failed (`fetch`, `increment`, ...).
        operation: &'static str,
        /// Description of what went wrong.
        message: String,
    },

    /// The change-notification channel was closed by the store.
    #[error("subscription to '{page_id}' closed")]
    SubscriptionClosed {
        /// Page whose subscription closed.
        page_id: String,
    },

    // === Session Errors ===
    /// Session-scoped storage is blocked or broken.
    #[error("session storage unavailable: {message}")]
    StorageUnavailable {
        /// Description of what went wrong.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for viewcounter operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a store-unreachable error for the given operation.
    #[must_use]
    pub fn store_unreachable(operation: &'static str, message: impl Into<String>) -> Self {
        Self::StoreUnreachable {
            operation,
            message: message.into(),
        }
    }

    /// Create a session storage error.
    #[must_use]
    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            message: message.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error means the store could not serve the request.
    #[must_use]
    pub fn is_store_unreachable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnreachable { .. } | Self::DatabaseQuery(_) | Self::DatabaseOpen { .. }
        )
    }

    /// Check if this error comes from session-scoped storage.
    #[must_use]
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }
}
