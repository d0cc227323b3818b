//! Engine configuration.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::JobManagerError;
use crate::retry::{BackoffStrategy, RetryPolicy};

pub const ENV_WORKERS: &str = "JOBMANAGER_WORKERS";
pub const ENV_RETRY_BASE_MS: &str = "JOBMANAGER_RETRY_BASE_MS";
pub const ENV_RETRY_MAX_MS: &str = "JOBMANAGER_RETRY_MAX_MS";
pub const ENV_RETRY_STRATEGY: &str = "JOBMANAGER_RETRY_STRATEGY";
pub const ENV_FACTORY_LIMITS: &str = "JOBMANAGER_FACTORY_LIMITS";

/// Job manager configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct JobManagerConfig {
    /// Worker threads running job bodies
    pub worker_count: usize,
    /// Per-factory-key cap on concurrently running jobs
    pub factory_concurrency: HashMap<String, usize>,
    pub retry_policy: RetryPolicy,
    /// Name for logging
    pub name: String,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            worker_count: parallelism.saturating_sub(1).clamp(2, 4),
            factory_concurrency: HashMap::new(),
            retry_policy: RetryPolicy::default(),
            name: "jobmanager".to_string(),
        }
    }
}

impl JobManagerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers.max(1);
        self
    }

    pub fn with_factory_limit(mut self, factory_key: impl Into<String>, limit: usize) -> Self {
        self.factory_concurrency
            .insert(factory_key.into(), limit.max(1));
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Defaults overlaid with `JOBMANAGER_*` environment variables.
    pub fn from_env() -> Result<Self, JobManagerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, JobManagerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(workers) = lookup(ENV_WORKERS) {
            let workers: usize = parse(ENV_WORKERS, &workers)?;
            if workers == 0 {
                return Err(JobManagerError::Config(format!(
                    "{ENV_WORKERS} must be at least 1"
                )));
            }
            config.worker_count = workers;
        }

        if let Some(strategy) = lookup(ENV_RETRY_STRATEGY) {
            config.retry_policy.strategy = strategy
                .parse::<BackoffStrategy>()
                .map_err(|err| JobManagerError::Config(format!("{ENV_RETRY_STRATEGY}: {err}")))?;
        }
        if let Some(base) = lookup(ENV_RETRY_BASE_MS) {
            config.retry_policy.base_delay = Duration::from_millis(parse(ENV_RETRY_BASE_MS, &base)?);
        }
        if let Some(max) = lookup(ENV_RETRY_MAX_MS) {
            config.retry_policy.max_delay = Duration::from_millis(parse(ENV_RETRY_MAX_MS, &max)?);
        }
        if config.retry_policy.max_delay < config.retry_policy.base_delay {
            return Err(JobManagerError::Config(format!(
                "{ENV_RETRY_MAX_MS} must not be below {ENV_RETRY_BASE_MS}"
            )));
        }

        if let Some(limits) = lookup(ENV_FACTORY_LIMITS) {
            config.factory_concurrency = parse_factory_limits(&limits)?;
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, JobManagerError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| JobManagerError::Config(format!("{key}={value:?}: {err}")))
}

/// Parse `Key=N,Other=M`.
fn parse_factory_limits(value: &str) -> Result<HashMap<String, usize>, JobManagerError> {
    let mut limits = HashMap::new();
    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, limit)) = pair.split_once('=') else {
            return Err(JobManagerError::Config(format!(
                "{ENV_FACTORY_LIMITS}: expected Key=N, got {pair:?}"
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(JobManagerError::Config(format!(
                "{ENV_FACTORY_LIMITS}: empty factory key in {pair:?}"
            )));
        }
        let limit: usize = parse(ENV_FACTORY_LIMITS, limit)?;
        limits.insert(key.to_string(), limit.max(1));
    }
    Ok(limits)
}
