//! The job implementation contract.
//!
//! The engine never inspects a job's payload. A job implementation provides
//! its factory key (used to rebuild it from storage), its parameters, a
//! serialized payload, and a `run()` body that reports one of three outcomes.

use std::time::Duration;

use jobmanager_core::{ConstraintSpec, DependencySpec, EpochMillis, FullSpec, JobId, JobSpec};

/// Outcome of a single `run()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job finished; it is deleted and its dependents may run.
    Success,
    /// Transient failure. `backoff` overrides the configured retry policy.
    Retry { backoff: Option<Duration> },
    /// Non-retryable failure; the job and every transitive dependent are failed.
    Failure { reason: String },
}

impl JobResult {
    pub fn retry() -> Self {
        Self::Retry { backoff: None }
    }

    pub fn retry_after(backoff: Duration) -> Self {
        Self::Retry {
            backoff: Some(backoff),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success)
    }
}

/// Information handed to a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub id: JobId,
    /// Failed attempts before this one.
    pub run_attempt: u32,
}

/// Scheduling parameters of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobParameters {
    pub id: JobId,
    pub queue_key: Option<String>,
    pub constraint_keys: Vec<String>,
    /// `None` means unlimited.
    pub max_attempts: Option<u32>,
    /// `None` means unlimited.
    pub lifespan: Option<Duration>,
    pub initial_delay: Duration,
    pub memory_only: bool,
}

impl Default for JobParameters {
    fn default() -> Self {
        Self {
            id: JobId::new(),
            queue_key: None,
            constraint_keys: Vec::new(),
            max_attempts: Some(1),
            lifespan: None,
            initial_delay: Duration::ZERO,
            memory_only: false,
        }
    }
}

impl JobParameters {
    pub fn builder() -> JobParametersBuilder {
        JobParametersBuilder::default()
    }

    /// Rebuild parameters from persisted rows.
    pub fn from_spec(spec: &JobSpec, constraints: &[ConstraintSpec]) -> Self {
        Self {
            id: spec.id.clone(),
            queue_key: spec.queue_key.clone(),
            constraint_keys: constraints.iter().map(|c| c.factory_key.clone()).collect(),
            max_attempts: spec.max_attempts,
            lifespan: spec
                .lifespan_ms
                .map(|ms| Duration::from_millis(ms.max(0) as u64)),
            initial_delay: Duration::from_millis(spec.initial_delay_ms.max(0) as u64),
            memory_only: spec.is_memory_only,
        }
    }
}

/// Builder for [`JobParameters`]. Defaults: generated id, no queue, no
/// constraints, a single attempt, unlimited lifespan.
#[derive(Debug, Clone, Default)]
pub struct JobParametersBuilder {
    params: JobParameters,
}

impl JobParametersBuilder {
    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.params.id = id.into();
        self
    }

    pub fn queue(mut self, queue_key: impl Into<String>) -> Self {
        self.params.queue_key = Some(queue_key.into());
        self
    }

    pub fn constraint(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.params.constraint_keys.contains(&key) {
            self.params.constraint_keys.push(key);
        }
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.params.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn unlimited_attempts(mut self) -> Self {
        self.params.max_attempts = None;
        self
    }

    pub fn lifespan(mut self, lifespan: Duration) -> Self {
        self.params.lifespan = Some(lifespan);
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.params.initial_delay = delay;
        self
    }

    pub fn memory_only(mut self, memory_only: bool) -> Self {
        self.params.memory_only = memory_only;
        self
    }

    pub fn build(self) -> JobParameters {
        self.params
    }
}

/// A runnable unit of background work.
///
/// Implementations are rebuilt from storage through the
/// [`JobRegistry`](crate::registry::JobRegistry) using `factory_key()` and the
/// value returned by `serialize()`, so everything a job needs to run again
/// after a restart must live in that value.
pub trait Job: Send {
    fn factory_key(&self) -> &str;

    fn parameters(&self) -> &JobParameters;

    fn serialize(&self) -> serde_json::Value;

    /// Runs on a worker thread. Blocking I/O is fine here; the job owns its
    /// own timeouts.
    fn run(&mut self, ctx: &JobContext) -> JobResult;

    /// Called once the job has been persisted.
    fn on_added(&mut self) {}

    /// Called when the job is permanently failed, including when a job it
    /// depends on failed.
    fn on_failure(&mut self) {}
}

/// Persisted rows for `job`, depending on `depends_on`.
pub(crate) fn full_spec_for(job: &dyn Job, depends_on: &[JobId], now: EpochMillis) -> FullSpec {
    let params = job.parameters();
    let memory_only = params.memory_only;

    let mut job_spec = JobSpec::new(params.id.clone(), job.factory_key(), now)
        .with_data(job.serialize())
        .with_max_attempts(params.max_attempts)
        .with_lifespan_ms(params.lifespan.map(duration_millis))
        .with_initial_delay_ms(duration_millis(params.initial_delay))
        .with_memory_only(memory_only);
    job_spec.queue_key = params.queue_key.clone();

    let constraint_specs = params
        .constraint_keys
        .iter()
        .map(|key| ConstraintSpec {
            job_id: params.id.clone(),
            factory_key: key.clone(),
            is_memory_only: memory_only,
        })
        .collect();

    let mut dependency_specs: Vec<DependencySpec> = Vec::with_capacity(depends_on.len());
    for dep in depends_on {
        if dep == &params.id || dependency_specs.iter().any(|d| &d.depends_on_job_id == dep) {
            continue;
        }
        dependency_specs.push(DependencySpec {
            job_id: params.id.clone(),
            depends_on_job_id: dep.clone(),
            is_memory_only: memory_only,
        });
    }

    FullSpec::new(job_spec, constraint_specs, dependency_specs)
}

pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
