//! Persisted job rows.
//!
//! A durable job is stored as three kinds of rows:
//!
//! - `JobSpec`: the job itself (identity, factory key, payload, retry state)
//! - `ConstraintSpec`: one row per constraint the job requires
//! - `DependencySpec`: one row per job that must leave storage first
//!
//! `FullSpec` bundles the three so they can be inserted atomically.

use serde::{Deserialize, Serialize};

use crate::error::{SpecError, SpecResult};
use crate::id::JobId;
use crate::time::EpochMillis;

/// Reserved queue key for data-migration jobs.
///
/// While any job in this queue exists, only the earliest of them is eligible
/// and every other job is held back.
pub const MIGRATION_QUEUE_KEY: &str = "MIGRATION";

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    /// Identifies which job implementation reconstructs this row.
    pub factory_key: String,
    /// Jobs sharing a queue key run strictly in insertion order.
    pub queue_key: Option<String>,
    pub create_time: EpochMillis,
    /// The job is not eligible before this time.
    pub next_run_attempt_time: EpochMillis,
    /// Number of failed attempts so far (starts at 0).
    pub run_attempt: u32,
    /// `None` means unlimited.
    pub max_attempts: Option<u32>,
    /// Maximum age (millis after `create_time`); `None` means unlimited.
    pub lifespan_ms: Option<i64>,
    /// Delay after `create_time` before the first run.
    pub initial_delay_ms: i64,
    /// Opaque payload, only interpreted by the job implementation.
    pub serialized_data: serde_json::Value,
    pub is_running: bool,
    /// Memory-only jobs never reach the database.
    pub is_memory_only: bool,
}

impl JobSpec {
    /// A pending job with no retry history, unlimited attempts and lifespan.
    pub fn new(id: JobId, factory_key: impl Into<String>, create_time: EpochMillis) -> Self {
        Self {
            id,
            factory_key: factory_key.into(),
            queue_key: None,
            create_time,
            next_run_attempt_time: create_time,
            run_attempt: 0,
            max_attempts: None,
            lifespan_ms: None,
            initial_delay_ms: 0,
            serialized_data: serde_json::Value::Null,
            is_running: false,
            is_memory_only: false,
        }
    }

    pub fn with_queue(mut self, queue_key: impl Into<String>) -> Self {
        self.queue_key = Some(queue_key.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.serialized_data = data;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_lifespan_ms(mut self, lifespan_ms: Option<i64>) -> Self {
        self.lifespan_ms = lifespan_ms;
        self
    }

    pub fn with_initial_delay_ms(mut self, delay_ms: i64) -> Self {
        self.initial_delay_ms = delay_ms.max(0);
        self
    }

    pub fn with_memory_only(mut self, memory_only: bool) -> Self {
        self.is_memory_only = memory_only;
        self
    }

    /// Earliest time the job may be dispatched.
    pub fn earliest_run_time(&self) -> EpochMillis {
        self.next_run_attempt_time
            .max(self.create_time.saturating_add(self.initial_delay_ms))
    }

    /// Not running and due at `now`.
    pub fn is_due(&self, now: EpochMillis) -> bool {
        !self.is_running && self.earliest_run_time() <= now
    }

    /// Whether the lifespan has elapsed at `now`.
    pub fn is_expired(&self, now: EpochMillis) -> bool {
        match self.lifespan_ms {
            Some(lifespan) => now >= self.create_time.saturating_add(lifespan),
            None => false,
        }
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn has_attempts_left(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts < max,
            None => true,
        }
    }

    pub fn is_in_migration_queue(&self) -> bool {
        self.queue_key.as_deref() == Some(MIGRATION_QUEUE_KEY)
    }

    pub fn validate(&self) -> SpecResult<()> {
        if self.id.as_str().is_empty() {
            return Err(SpecError::EmptyId);
        }
        if self.factory_key.is_empty() {
            return Err(SpecError::EmptyFactoryKey(self.id.clone()));
        }
        if let Some(lifespan) = self.lifespan_ms {
            if lifespan < 0 {
                return Err(SpecError::invalid_field(&self.id, "lifespan_ms", "must be >= 0"));
            }
        }
        if self.max_attempts == Some(0) {
            return Err(SpecError::invalid_field(&self.id, "max_attempts", "must be >= 1"));
        }
        Ok(())
    }
}

/// A constraint a job requires before it may run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub job_id: JobId,
    /// Key of the constraint in the constraint registry (e.g. `"Network"`).
    pub factory_key: String,
    pub is_memory_only: bool,
}

impl ConstraintSpec {
    pub fn new(job_id: JobId, factory_key: impl Into<String>) -> Self {
        Self {
            job_id,
            factory_key: factory_key.into(),
            is_memory_only: false,
        }
    }
}

/// `job_id` may not run while `depends_on_job_id` is still in storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencySpec {
    pub job_id: JobId,
    pub depends_on_job_id: JobId,
    pub is_memory_only: bool,
}

impl DependencySpec {
    pub fn new(job_id: JobId, depends_on_job_id: JobId) -> Self {
        Self {
            job_id,
            depends_on_job_id,
            is_memory_only: false,
        }
    }
}

/// A job plus all of its constraint and dependency rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSpec {
    pub job_spec: JobSpec,
    pub constraint_specs: Vec<ConstraintSpec>,
    pub dependency_specs: Vec<DependencySpec>,
}

impl FullSpec {
    pub fn new(
        job_spec: JobSpec,
        constraint_specs: Vec<ConstraintSpec>,
        dependency_specs: Vec<DependencySpec>,
    ) -> Self {
        Self {
            job_spec,
            constraint_specs,
            dependency_specs,
        }
    }

    /// A job with no constraints or dependencies.
    pub fn job_only(job_spec: JobSpec) -> Self {
        Self::new(job_spec, Vec::new(), Vec::new())
    }

    pub fn id(&self) -> &JobId {
        &self.job_spec.id
    }

    /// Validate the bundle: rows must belong to the job and a job cannot
    /// depend on itself.
    pub fn validate(&self) -> SpecResult<()> {
        self.job_spec.validate()?;
        let id = &self.job_spec.id;

        for constraint in &self.constraint_specs {
            if &constraint.job_id != id {
                return Err(SpecError::MismatchedJobId {
                    expected: id.clone(),
                    found: constraint.job_id.clone(),
                });
            }
            if constraint.factory_key.is_empty() {
                return Err(SpecError::EmptyFactoryKey(id.clone()));
            }
        }

        for dependency in &self.dependency_specs {
            if &dependency.job_id != id {
                return Err(SpecError::MismatchedJobId {
                    expected: id.clone(),
                    found: dependency.job_id.clone(),
                });
            }
            if &dependency.depends_on_job_id == id {
                return Err(SpecError::SelfDependency(id.clone()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> JobSpec {
        JobSpec::new(JobId::from(id), "TestJob", 1_000)
    }

    #[test]
    fn new_spec_is_due_at_create_time() {
        let job = spec("a");
        assert!(!job.is_due(999));
        assert!(job.is_due(1_000));
    }

    #[test]
    fn initial_delay_pushes_back_first_run() {
        let job = spec("a").with_initial_delay_ms(500);
        assert_eq!(job.earliest_run_time(), 1_500);
        assert!(!job.is_due(1_499));
        assert!(job.is_due(1_500));
    }

    #[test]
    fn running_job_is_never_due() {
        let mut job = spec("a");
        job.is_running = true;
        assert!(!job.is_due(i64::MAX));
    }

    #[test]
    fn lifespan_expiry() {
        let job = spec("a").with_lifespan_ms(Some(100));
        assert!(!job.is_expired(1_099));
        assert!(job.is_expired(1_100));
        assert!(!spec("b").is_expired(i64::MAX));
    }

    #[test]
    fn attempts_left() {
        let job = spec("a").with_max_attempts(Some(2));
        assert!(job.has_attempts_left(1));
        assert!(!job.has_attempts_left(2));
        assert!(spec("b").has_attempts_left(u32::MAX));
    }

    #[test]
    fn validate_rejects_foreign_rows() {
        let full = FullSpec::new(
            spec("a"),
            vec![ConstraintSpec::new(JobId::from("b"), "Network")],
            Vec::new(),
        );
        assert!(matches!(
            full.validate(),
            Err(SpecError::MismatchedJobId { .. })
        ));
    }

    #[test]
    fn validate_rejects_self_dependency() {
        let full = FullSpec::new(
            spec("a"),
            Vec::new(),
            vec![DependencySpec::new(JobId::from("a"), JobId::from("a"))],
        );
        assert_eq!(full.validate(), Err(SpecError::SelfDependency(JobId::from("a"))));
    }

    #[test]
    fn validate_rejects_zero_max_attempts() {
        let full = FullSpec::job_only(spec("a").with_max_attempts(Some(0)));
        assert!(matches!(full.validate(), Err(SpecError::InvalidField { .. })));
    }

    #[test]
    fn spec_round_trips_through_json() {
        let job = spec("a")
            .with_queue("q")
            .with_data(serde_json::json!({"thread": 7}));
        let json = serde_json::to_string(&job).unwrap();
        let back: JobSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
