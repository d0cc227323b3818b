//! `jobmanager`: a persistent background job engine.
//!
//! Jobs are persisted before they run, survive restarts, and are dispatched
//! once they are due, their constraints are met, every job they depend on
//! has finished, and they are first in their queue.
//!
//! - [`JobManager`] is the threaded entry point.
//! - [`JobController`] holds every scheduling decision and can be driven
//!   directly with explicit timestamps.
//! - [`storage`] has the in-memory index and the durable backends.

pub mod config;
pub mod constraint;
pub mod controller;
pub mod error;
pub mod job;
pub mod manager;
pub mod migration;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod tracker;


pub use config::JobManagerConfig;
pub use constraint::{
    Constraint, ConstraintCheck, ConstraintObserver, ConstraintRegistry, FlagConstraint, Notifier,
};
pub use controller::{Dispatch, DrainOutcome, JobController, RunnerSlots};
pub use error::JobManagerError;
pub use job::{Job, JobContext, JobParameters, JobParametersBuilder, JobResult};
pub use manager::{EmptyQueueListenerId, JobChain, JobManager, JobManagerBuilder, JobPredicate};
pub use migration::{JobData, JobMigration, JobMigrator, MigrationError};
pub use registry::{FAILING_JOB_KEY, FailingJob, JobRegistry};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scheduler::{CompositeScheduler, NoopScheduler, Scheduler};
pub use storage::{CachedJobStorage, InMemoryJobDatabase, JobDatabase, JobStorage, StorageError};
#[cfg(feature = "sqlite")]
pub use storage::SqliteJobDatabase;
pub use tracker::{JobFilter, JobState, JobTracker, JobUpdate, ListenerId};

pub use jobmanager_core::{
    ConstraintSpec, DependencySpec, EpochMillis, FullSpec, JobId, JobSpec, MIGRATION_QUEUE_KEY,
};
