//! Unified error handling for the backend.

use crate::config::ConfigError;
use tracing::debug;

/// SQLSTATE codes Postgres reports when a transaction lost a race.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// Map a driver error into an engine error.
///
/// Serialization failures and deadlocks become [`kindstore_engine::Error::Conflict`]
/// so the engine retries them; everything else is a backend failure.
pub fn backend_error(err: sqlx::Error) -> kindstore_engine::Error {
    if let sqlx::Error::Database(db) = &err {
        if let Some(code) = db.code() {
            if code == SERIALIZATION_FAILURE || code == DEADLOCK_DETECTED {
                debug!(code = %code, "serialization failure");
                return kindstore_engine::Error::Conflict(db.message().to_string());
            }
        }
    }
    kindstore_engine::Error::Backend(err.to_string())
}

/// Application error type for the maintenance binary.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] kindstore_engine::Error),

    #[error("Usage: {0}")]
    Usage(String),
}

/// Result type alias for the binary.
pub type Result<T> = std::result::Result<T, AppError>;
