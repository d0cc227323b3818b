//! Factory-key → constructor registry used to rebuild jobs from storage.
//!
//! Persisted jobs outlive the process that created them, so the engine looks
//! implementations up by string key. Anything that cannot be rebuilt turns into
//! a [`FailingJob`], which fails permanently on its first run and is deleted
//! cleanly instead of stalling the engine.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::warn;

use jobmanager_core::{ConstraintSpec, JobSpec};

use crate::job::{Job, JobContext, JobParameters, JobResult};

/// Factory key of the sentinel job.
pub const FAILING_JOB_KEY: &str = "FailingJob";

/// Constructor stored in the registry.
pub type JobConstructor =
    Box<dyn Fn(JobParameters, serde_json::Value) -> Result<Box<dyn Job>, String> + Send + Sync>;

/// Explicit registry of job constructors, built at startup.
pub struct JobRegistry {
    constructors: HashMap<String, JobConstructor>,
}

impl JobRegistry {
    /// A registry that already knows the [`FailingJob`] sentinel.
    pub fn new() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register(FAILING_JOB_KEY, |params, data| {
            let reason = data
                .get("reason")
                .and_then(|r| r.as_str())
                .unwrap_or("job could not be restored")
                .to_string();
            Ok(Box::new(FailingJob::new(params, reason)))
        });
        registry
    }

    /// Register a constructor under `factory_key`, replacing any previous one.
    pub fn register<F>(&mut self, factory_key: impl Into<String>, constructor: F)
    where
        F: Fn(JobParameters, serde_json::Value) -> Result<Box<dyn Job>, String>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(factory_key.into(), Box::new(constructor));
    }

    pub fn contains(&self, factory_key: &str) -> bool {
        self.constructors.contains_key(factory_key)
    }

    /// Rebuild the job for `spec`.
    ///
    /// Never fails: unknown keys, constructor errors and constructor panics
    /// all yield a [`FailingJob`].
    pub fn instantiate(&self, spec: &JobSpec, constraints: &[ConstraintSpec]) -> Box<dyn Job> {
        let params = JobParameters::from_spec(spec, constraints);

        let Some(constructor) = self.constructors.get(&spec.factory_key) else {
            warn!(
                job_id = %spec.id,
                factory_key = %spec.factory_key,
                "no constructor registered for factory key"
            );
            return Box::new(FailingJob::new(
                params,
                format!("unknown factory key: {}", spec.factory_key),
            ));
        };

        let data = spec.serialized_data.clone();
        let built = catch_unwind(AssertUnwindSafe(|| constructor(params.clone(), data)));

        match built {
            Ok(Ok(job)) => job,
            Ok(Err(reason)) => {
                warn!(job_id = %spec.id, factory_key = %spec.factory_key, error = %reason, "failed to restore job");
                Box::new(FailingJob::new(params, reason))
            }
            Err(_) => {
                warn!(job_id = %spec.id, factory_key = %spec.factory_key, "job constructor panicked");
                Box::new(FailingJob::new(params, "job constructor panicked".to_string()))
            }
        }
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.constructors.keys().collect();
        keys.sort();
        f.debug_struct("JobRegistry").field("keys", &keys).finish()
    }
}

/// Sentinel job that always fails permanently.
#[derive(Debug, Clone)]
pub struct FailingJob {
    params: JobParameters,
    reason: String,
}

impl FailingJob {
    pub fn new(params: JobParameters, reason: impl Into<String>) -> Self {
        Self {
            params,
            reason: reason.into(),
        }
    }
}

impl Job for FailingJob {
    fn factory_key(&self) -> &str {
        FAILING_JOB_KEY
    }

    fn parameters(&self) -> &JobParameters {
        &self.params
    }

    fn serialize(&self) -> serde_json::Value {
        serde_json::json!({ "reason": self.reason })
    }

    fn run(&mut self, _ctx: &JobContext) -> JobResult {
        JobResult::failure(self.reason.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmanager_core::JobId;

    #[derive(Debug)]
    struct Echo {
        params: JobParameters,
        text: String,
    }

    impl Job for Echo {
        fn factory_key(&self) -> &str {
            "Echo"
        }

        fn parameters(&self) -> &JobParameters {
            &self.params
        }

        fn serialize(&self) -> serde_json::Value {
            serde_json::json!({ "text": self.text })
        }

        fn run(&mut self, _ctx: &JobContext) -> JobResult {
            JobResult::Success
        }
    }

    fn registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register("Echo", |params, data| {
            let text = data
                .get("text")
                .and_then(|t| t.as_str())
                .ok_or_else(|| "missing text".to_string())?
                .to_string();
            Ok(Box::new(Echo { params, text }))
        });
        registry.register("Panics", |_params, _data| panic!("boom"));
        registry
    }

    fn ctx() -> JobContext {
        JobContext {
            id: JobId::from("a"),
            run_attempt: 0,
        }
    }

    #[test]
    fn restores_registered_job() {
        let spec = JobSpec::new(JobId::from("a"), "Echo", 0)
            .with_data(serde_json::json!({ "text": "hi" }));
        let mut job = registry().instantiate(&spec, &[]);
        assert_eq!(job.factory_key(), "Echo");
        assert_eq!(job.serialize(), serde_json::json!({ "text": "hi" }));
        assert_eq!(job.run(&ctx()), JobResult::Success);
    }

    #[test]
    fn unknown_key_becomes_failing_job() {
        let spec = JobSpec::new(JobId::from("a"), "Gone", 0);
        let mut job = registry().instantiate(&spec, &[]);
        assert_eq!(job.factory_key(), FAILING_JOB_KEY);
        assert!(matches!(job.run(&ctx()), JobResult::Failure { .. }));
    }

    #[test]
    fn bad_payload_becomes_failing_job() {
        let spec = JobSpec::new(JobId::from("a"), "Echo", 0).with_data(serde_json::json!({}));
        let mut job = registry().instantiate(&spec, &[]);
        assert_eq!(job.factory_key(), FAILING_JOB_KEY);
        assert_eq!(job.run(&ctx()), JobResult::failure("missing text"));
    }

    #[test]
    fn panicking_constructor_becomes_failing_job() {
        let spec = JobSpec::new(JobId::from("a"), "Panics", 0);
        let job = registry().instantiate(&spec, &[]);
        assert_eq!(job.factory_key(), FAILING_JOB_KEY);
    }

    #[test]
    fn failing_job_survives_its_own_round_trip() {
        let registry = registry();
        let spec = JobSpec::new(JobId::from("a"), FAILING_JOB_KEY, 0)
            .with_data(serde_json::json!({ "reason": "migrated away" }));
        let mut job = registry.instantiate(&spec, &[]);
        assert_eq!(job.run(&ctx()), JobResult::failure("migrated away"));
    }
}
