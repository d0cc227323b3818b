//! Job storage.
//!
//! [`JobStorage`] is the persistence boundary the controller talks to.
//! [`CachedJobStorage`] implements it as an in-memory index over a
//! write-through [`JobDatabase`]; the database only has to persist rows, every
//! query is answered from memory.

use jobmanager_core::{
    ConstraintSpec, DependencySpec, EpochMillis, FullSpec, JobId, JobSpec, SpecError,
};

pub mod cached;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use cached::CachedJobStorage;
pub use memory::InMemoryJobDatabase;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobDatabase;

/// Storage error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("storage used before init()")]
    NotInitialized,
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid job: {0}")]
    Invalid(#[from] SpecError),
    #[error("database error: {0}")]
    Database(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable job storage.
///
/// Mutations are all-or-nothing: when one returns an error, storage is left
/// exactly as it was.
pub trait JobStorage: Send {
    /// Load persisted state. Must be called once before anything else.
    fn init(&mut self) -> StorageResult<()>;

    /// Atomically insert one or more jobs with their constraint and
    /// dependency rows.
    fn insert_jobs(&mut self, specs: Vec<FullSpec>) -> StorageResult<()>;

    fn get_job_spec(&self, id: &JobId) -> Option<JobSpec>;

    /// All jobs in created order.
    fn get_all_job_specs(&self) -> Vec<JobSpec>;

    fn get_constraint_specs(&self, id: &JobId) -> Vec<ConstraintSpec>;

    fn get_all_dependency_specs(&self) -> Vec<DependencySpec>;

    /// Jobs that may be dispatched at `now`, ignoring constraints.
    ///
    /// A job qualifies when it is not running, is due, has no dependency that
    /// is still in storage, and is the earliest remaining job of its queue.
    /// While any migration-queue job exists, only the earliest of those can
    /// qualify.
    fn get_pending_jobs_with_no_dependencies_in_created_order(
        &self,
        now: EpochMillis,
    ) -> Vec<JobSpec>;

    /// Jobs in `queue_key`, in created order.
    fn get_jobs_in_queue(&self, queue_key: &str) -> Vec<JobSpec>;

    fn get_eligible_job_count(&self, now: EpochMillis) -> usize;

    /// True when no job in storage uses any of `queue_keys`.
    fn are_queues_empty(&self, queue_keys: &[String]) -> bool;

    fn get_job_count_for_factory(&self, factory_key: &str) -> usize;

    fn update_job_running_state(&mut self, id: &JobId, is_running: bool) -> StorageResult<()>;

    fn update_job_after_retry(
        &mut self,
        id: &JobId,
        is_running: bool,
        run_attempt: u32,
        next_run_attempt_time: EpochMillis,
    ) -> StorageResult<()>;

    /// Clear `is_running` on every job. Called once at startup.
    fn update_all_jobs_to_be_pending(&mut self) -> StorageResult<()>;

    /// Rewrite every job through `transform`, persisting the ones that
    /// changed. Returns the number of changed jobs. A transform may not
    /// change a job's id.
    fn transform_jobs(
        &mut self,
        transform: &mut dyn FnMut(&JobSpec) -> JobSpec,
    ) -> StorageResult<usize>;

    fn delete_job(&mut self, id: &JobId) -> StorageResult<()> {
        self.delete_jobs(std::slice::from_ref(id))
    }

    /// Delete jobs with their constraint rows and their own dependency rows.
    /// Unknown ids are ignored.
    fn delete_jobs(&mut self, ids: &[JobId]) -> StorageResult<()>;

    /// Dependency rows whose `depends_on_job_id` is `id`.
    fn get_dependency_specs_that_depend_on_job(&self, id: &JobId) -> Vec<DependencySpec>;

    fn schema_version(&self) -> StorageResult<u32>;

    fn set_schema_version(&mut self, version: u32) -> StorageResult<()>;
}

impl<S: JobStorage + ?Sized> JobStorage for Box<S> {
    fn init(&mut self) -> StorageResult<()> {
        (**self).init()
    }

    fn insert_jobs(&mut self, specs: Vec<FullSpec>) -> StorageResult<()> {
        (**self).insert_jobs(specs)
    }

    fn get_job_spec(&self, id: &JobId) -> Option<JobSpec> {
        (**self).get_job_spec(id)
    }

    fn get_all_job_specs(&self) -> Vec<JobSpec> {
        (**self).get_all_job_specs()
    }

    fn get_constraint_specs(&self, id: &JobId) -> Vec<ConstraintSpec> {
        (**self).get_constraint_specs(id)
    }

    fn get_all_dependency_specs(&self) -> Vec<DependencySpec> {
        (**self).get_all_dependency_specs()
    }

    fn get_pending_jobs_with_no_dependencies_in_created_order(
        &self,
        now: EpochMillis,
    ) -> Vec<JobSpec> {
        (**self).get_pending_jobs_with_no_dependencies_in_created_order(now)
    }

    fn get_jobs_in_queue(&self, queue_key: &str) -> Vec<JobSpec> {
        (**self).get_jobs_in_queue(queue_key)
    }

    fn get_eligible_job_count(&self, now: EpochMillis) -> usize {
        (**self).get_eligible_job_count(now)
    }

    fn are_queues_empty(&self, queue_keys: &[String]) -> bool {
        (**self).are_queues_empty(queue_keys)
    }

    fn get_job_count_for_factory(&self, factory_key: &str) -> usize {
        (**self).get_job_count_for_factory(factory_key)
    }

    fn update_job_running_state(&mut self, id: &JobId, is_running: bool) -> StorageResult<()> {
        (**self).update_job_running_state(id, is_running)
    }

    fn update_job_after_retry(
        &mut self,
        id: &JobId,
        is_running: bool,
        run_attempt: u32,
        next_run_attempt_time: EpochMillis,
    ) -> StorageResult<()> {
        (**self).update_job_after_retry(id, is_running, run_attempt, next_run_attempt_time)
    }

    fn update_all_jobs_to_be_pending(&mut self) -> StorageResult<()> {
        (**self).update_all_jobs_to_be_pending()
    }

    fn transform_jobs(
        &mut self,
        transform: &mut dyn FnMut(&JobSpec) -> JobSpec,
    ) -> StorageResult<usize> {
        (**self).transform_jobs(transform)
    }

    fn delete_jobs(&mut self, ids: &[JobId]) -> StorageResult<()> {
        (**self).delete_jobs(ids)
    }

    fn get_dependency_specs_that_depend_on_job(&self, id: &JobId) -> Vec<DependencySpec> {
        (**self).get_dependency_specs_that_depend_on_job(id)
    }

    fn schema_version(&self) -> StorageResult<u32> {
        (**self).schema_version()
    }

    fn set_schema_version(&mut self, version: u32) -> StorageResult<()> {
        (**self).set_schema_version(version)
    }
}

/// Row-level persistence behind [`CachedJobStorage`].
///
/// Implementations only write and bulk-load rows; they never see memory-only
/// jobs. Every method is atomic.
pub trait JobDatabase: Send {
    /// Every persisted job with its rows, in insertion order.
    fn load(&mut self) -> StorageResult<Vec<FullSpec>>;

    fn insert_jobs(&mut self, specs: &[FullSpec]) -> StorageResult<()>;

    fn update_job_running_state(&mut self, id: &JobId, is_running: bool) -> StorageResult<()>;

    fn update_job_after_retry(
        &mut self,
        id: &JobId,
        is_running: bool,
        run_attempt: u32,
        next_run_attempt_time: EpochMillis,
    ) -> StorageResult<()>;

    fn update_all_jobs_to_be_pending(&mut self) -> StorageResult<()>;

    /// Overwrite the stored job rows with the same ids.
    fn update_jobs(&mut self, specs: &[JobSpec]) -> StorageResult<()>;

    /// Delete job rows, their constraint rows and their own dependency rows.
    fn delete_jobs(&mut self, ids: &[JobId]) -> StorageResult<()>;

    fn delete_dependency_specs(&mut self, specs: &[DependencySpec]) -> StorageResult<()>;

    /// Stored schema version, `1` for a fresh database.
    fn schema_version(&mut self) -> StorageResult<u32>;

    fn set_schema_version(&mut self, version: u32) -> StorageResult<()>;
}
