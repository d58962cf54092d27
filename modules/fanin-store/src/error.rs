//! Typed errors for barrier stores.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Postgres query or transaction failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Filesystem operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted run state could not be decoded
    #[error("corrupt run state at {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Run state could not be encoded
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// The run already holds `width` contributions
    #[error("run {run_id} already complete ({width} of {width})")]
    RunClosed { run_id: String, width: i64 },

    /// The run was started with a different width
    #[error("run {run_id} has width {expected}, got {got}")]
    WidthMismatch {
        run_id: String,
        expected: i64,
        got: i64,
    },

    /// Run id not usable as a storage key
    #[error("invalid run id: {0:?}")]
    InvalidRunId(String),

    /// Another writer held the run lock for too long
    #[error("timed out waiting for lock on run {run_id}")]
    LockTimeout { run_id: String },
}

impl StoreError {
    /// Errors that mean the store itself can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
