//! Engine-level errors.

use thiserror::Error;

use crate::migration::MigrationError;
use crate::storage::StorageError;

/// Errors surfaced by [`JobManager`](crate::manager::JobManager).
///
/// Failures of individual jobs never show up here; they are reported through
/// job state listeners.
#[derive(Debug, Error)]
pub enum JobManagerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("migration failed: {0}")]
    Migration(#[from] MigrationError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The controller thread has stopped and no longer accepts commands.
    #[error("job manager is shut down")]
    ShutDown,

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}
