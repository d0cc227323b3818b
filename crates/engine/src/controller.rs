//! The engine's synchronous state machine.
//!
//! [`JobController`] owns storage and makes every scheduling decision. It has
//! no threads of its own: callers pass the current time into every method, and
//! [`JobManager`](crate::manager::JobManager) drives it from a single
//! controller thread. Job bodies run elsewhere; a [`Dispatch`] carries a job out
//! and comes back through [`JobController::on_job_finished`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use jobmanager_core::{ConstraintSpec, EpochMillis, FullSpec, JobId, JobSpec};

use crate::constraint::{ConstraintCheck, ConstraintRegistry};
use crate::job::{Job, JobResult, duration_millis, full_spec_for};
use crate::registry::JobRegistry;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::storage::{JobStorage, StorageResult};
use crate::tracker::{JobState, JobTracker, JobUpdate};

/// A job handed out for execution.
pub struct Dispatch {
    pub id: JobId,
    /// Failed attempts before this run.
    pub run_attempt: u32,
    /// The runner slot claimed for this job.
    pub runner: usize,
    pub job: Box<dyn Job>,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("id", &self.id)
            .field("run_attempt", &self.run_attempt)
            .field("runner", &self.runner)
            .field("factory_key", &self.job.factory_key())
            .finish()
    }
}

/// Result of one drain.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    pub dispatched: Vec<Dispatch>,
    /// When the next job becomes due or expires, if any job is waiting on
    /// time.
    pub next_wake: Option<Duration>,
    /// Storage just went from having runnable or running work to having
    /// none.
    pub became_empty: bool,
}

/// Runner capacity offered to a drain.
pub trait RunnerSlots {
    /// Claim a free runner that may take `spec`.
    fn claim(&mut self, spec: &JobSpec) -> Option<usize>;

    /// Give back a runner claimed for a job that could not be dispatched.
    fn release(&mut self, runner: usize);
}

/// A plain count of interchangeable runners, all reported as runner 0.
impl RunnerSlots for usize {
    fn claim(&mut self, _spec: &JobSpec) -> Option<usize> {
        if *self == 0 {
            return None;
        }
        *self -= 1;
        Some(0)
    }

    fn release(&mut self, _runner: usize) {
        *self += 1;
    }
}

#[derive(Debug, Clone)]
struct RunningJob {
    factory_key: String,
}

pub struct JobController<S> {
    storage: S,
    jobs: JobRegistry,
    constraints: ConstraintRegistry,
    scheduler: Arc<dyn Scheduler>,
    tracker: JobTracker,
    retry_policy: RetryPolicy,
    factory_limits: HashMap<String, usize>,
    running: HashMap<JobId, RunningJob>,
    running_per_factory: HashMap<String, usize>,
    /// (wake-up time, constraint keys) of the last scheduler request; no
    /// time means "as soon as possible"
    last_schedule: Option<(Option<EpochMillis>, Vec<String>)>,
    idle: bool,
}

impl<S: JobStorage> JobController<S> {
    pub fn new(
        storage: S,
        jobs: JobRegistry,
        constraints: ConstraintRegistry,
        scheduler: Arc<dyn Scheduler>,
        tracker: JobTracker,
    ) -> Self {
        Self {
            storage,
            jobs,
            constraints,
            scheduler,
            tracker,
            retry_policy: RetryPolicy::default(),
            factory_limits: HashMap::new(),
            running: HashMap::new(),
            running_per_factory: HashMap::new(),
            last_schedule: None,
            idle: false,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Cap concurrently running jobs of `factory_key`. A limit of zero is
    /// treated as one.
    pub fn with_factory_limit(mut self, factory_key: impl Into<String>, limit: usize) -> Self {
        self.factory_limits.insert(factory_key.into(), limit.max(1));
        self
    }

    pub fn with_factory_limits(mut self, limits: HashMap<String, usize>) -> Self {
        for (key, limit) in limits {
            self.factory_limits.insert(key, limit.max(1));
        }
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Forget in-flight state from a previous process. Call once before the
    /// first drain.
    pub fn init(&mut self) -> StorageResult<()> {
        self.running.clear();
        self.running_per_factory.clear();
        self.storage.update_all_jobs_to_be_pending()
    }

    /// Insert `stages` atomically; every job of a stage depends on every job
    /// of the previous non-empty stage.
    pub fn submit_chain(
        &mut self,
        stages: Vec<Vec<Box<dyn Job>>>,
        now: EpochMillis,
    ) -> StorageResult<Vec<JobId>> {
        let mut specs = Vec::new();
        let mut previous: Vec<JobId> = Vec::new();
        for stage in &stages {
            let ids: Vec<JobId> = stage.iter().map(|job| job.parameters().id.clone()).collect();
            for job in stage {
                specs.push(full_spec_for(job.as_ref(), &previous, now));
            }
            if !ids.is_empty() {
                previous = ids;
            }
        }

        self.insert_and_announce(stages.into_iter().flatten().collect(), specs)
    }

    /// Insert one job depending on `depends_on` and on every job currently in
    /// `depends_on_queue`. Dependencies that are no longer in storage are
    /// dropped.
    pub fn submit_with_dependencies(
        &mut self,
        job: Box<dyn Job>,
        depends_on: Vec<JobId>,
        depends_on_queue: Option<&str>,
        now: EpochMillis,
    ) -> StorageResult<JobId> {
        let mut dependencies: Vec<JobId> = depends_on
            .into_iter()
            .filter(|id| self.storage.get_job_spec(id).is_some())
            .collect();
        if let Some(queue) = depends_on_queue {
            dependencies.extend(
                self.storage
                    .get_jobs_in_queue(queue)
                    .into_iter()
                    .map(|spec| spec.id),
            );
        }

        let spec = full_spec_for(job.as_ref(), &dependencies, now);
        let id = spec.job_spec.id.clone();
        self.insert_and_announce(vec![job], vec![spec])?;
        Ok(id)
    }

    /// Insert prepared rows. Each job is rebuilt through the registry for its
    /// hooks and again when it is dispatched.
    pub fn enqueue(&mut self, specs: Vec<FullSpec>) -> StorageResult<Vec<JobId>> {
        let jobs = specs
            .iter()
            .map(|spec| self.jobs.instantiate(&spec.job_spec, &spec.constraint_specs))
            .collect();
        self.insert_and_announce(jobs, specs)
    }

    fn insert_and_announce(
        &mut self,
        jobs: Vec<Box<dyn Job>>,
        specs: Vec<FullSpec>,
    ) -> StorageResult<Vec<JobId>> {
        let ids: Vec<JobId> = specs.iter().map(|spec| spec.id().clone()).collect();
        let updates: Vec<JobUpdate> = specs
            .iter()
            .map(|spec| update_for(&spec.job_spec, JobState::Pending))
            .collect();

        if let Err(err) = self.storage.insert_jobs(specs) {
            error!(jobs = ids.len(), error = %err, "failed to insert jobs");
            for (mut job, update) in jobs.into_iter().zip(updates) {
                run_hook(job.as_mut(), "on_failure", |job| job.on_failure());
                self.tracker.on_state_change(JobUpdate {
                    state: JobState::Failure,
                    ..update
                });
            }
            return Err(err);
        }

        for (mut job, update) in jobs.into_iter().zip(updates) {
            debug!(job_id = %update.id, factory_key = %update.factory_key, queue_key = ?update.queue_key, "job added");
            run_hook(job.as_mut(), "on_added", |job| job.on_added());
            self.tracker.on_state_change(update);
        }
        self.idle = false;
        Ok(ids)
    }

    /// One drain: abandon expired jobs, then dispatch up to `capacity`
    /// eligible jobs whose constraints are met, then re-arm the scheduler.
    pub fn drain(&mut self, now: EpochMillis, mut capacity: usize) -> DrainOutcome {
        self.drain_into(now, &mut capacity)
    }

    /// [`drain`](Self::drain) over runners that may each accept only some
    /// jobs.
    pub fn drain_into(&mut self, now: EpochMillis, slots: &mut dyn RunnerSlots) -> DrainOutcome {
        let mut dispatched = Vec::new();

        loop {
            // A failure can unblock a queue or a dependent, so keep going
            // until a pass fails nothing.
            let mut failed_any = self.abandon_expired(now);

            for spec in self
                .storage
                .get_pending_jobs_with_no_dependencies_in_created_order(now)
            {
                if self.storage.get_job_spec(&spec.id).is_none() {
                    continue;
                }
                if self.at_factory_limit(&spec.factory_key) {
                    continue;
                }

                let constraints = self.storage.get_constraint_specs(&spec.id);
                match self
                    .constraints
                    .check(constraints.iter().map(|c| c.factory_key.as_str()))
                {
                    ConstraintCheck::Met => {}
                    ConstraintCheck::Unmet => continue,
                    ConstraintCheck::Unknown(key) => {
                        warn!(job_id = %spec.id, constraint = %key, "job requires an unregistered constraint");
                        self.fail_permanently(&spec.id, None);
                        failed_any = true;
                        continue;
                    }
                }

                let Some(runner) = slots.claim(&spec) else {
                    continue;
                };
                match self.dispatch(&spec, &constraints, runner) {
                    Ok(dispatch) => dispatched.push(dispatch),
                    Err(err) => {
                        error!(job_id = %spec.id, error = %err, "failed to mark job running");
                        slots.release(runner);
                    }
                }
            }

            if !failed_any {
                break;
            }
        }

        let next_wake = self.rearm(now);
        let became_empty = self.update_idle(now);

        DrainOutcome {
            dispatched,
            next_wake,
            became_empty,
        }
    }

    /// Record the result of a dispatched job.
    pub fn on_job_finished(&mut self, dispatch: Dispatch, result: JobResult, now: EpochMillis) {
        let Dispatch { id, job, .. } = dispatch;

        if let Some(running) = self.running.remove(&id) {
            if let Some(count) = self.running_per_factory.get_mut(&running.factory_key) {
                *count = count.saturating_sub(1);
            }
        }

        let Some(spec) = self.storage.get_job_spec(&id) else {
            debug!(job_id = %id, "finished job is no longer in storage");
            return;
        };

        match result {
            JobResult::Success => match self.storage.delete_job(&id) {
                Ok(()) => {
                    debug!(job_id = %id, factory_key = %spec.factory_key, "job succeeded");
                    self.tracker
                        .on_state_change(update_for(&spec, JobState::Success));
                }
                Err(err) => {
                    error!(job_id = %id, error = %err, "failed to delete finished job");
                    self.release(&id);
                }
            },
            JobResult::Retry { backoff } => {
                let next_attempt = spec.run_attempt.saturating_add(1);
                if spec.has_attempts_left(next_attempt) && !spec.is_expired(now) {
                    let delay =
                        backoff.unwrap_or_else(|| self.retry_policy.delay_for_job(&id, next_attempt));
                    let next_time = now.saturating_add(duration_millis(delay));
                    match self
                        .storage
                        .update_job_after_retry(&id, false, next_attempt, next_time)
                    {
                        Ok(()) => {
                            debug!(
                                job_id = %id,
                                run_attempt = next_attempt,
                                delay_ms = duration_millis(delay),
                                "job will retry"
                            );
                            self.tracker
                                .on_state_change(update_for(&spec, JobState::Pending));
                        }
                        Err(err) => {
                            error!(job_id = %id, error = %err, "failed to persist retry");
                            self.release(&id);
                        }
                    }
                } else {
                    info!(
                        job_id = %id,
                        run_attempt = next_attempt,
                        max_attempts = ?spec.max_attempts,
                        expired = spec.is_expired(now),
                        "job out of attempts"
                    );
                    self.fail_permanently(&id, Some(job));
                }
            }
            JobResult::Failure { reason } => {
                warn!(job_id = %id, factory_key = %spec.factory_key, reason = %reason, "job failed");
                self.fail_permanently(&id, Some(job));
            }
        }
    }

    /// Jobs in storage matching `predicate`, in created order.
    pub fn find(&self, predicate: &dyn Fn(&JobSpec) -> bool) -> Vec<JobSpec> {
        self.storage
            .get_all_job_specs()
            .into_iter()
            .filter(|spec| predicate(spec))
            .collect()
    }

    pub fn are_queues_empty(&self, queue_keys: &[String]) -> bool {
        self.storage.are_queues_empty(queue_keys)
    }

    /// Rewrite jobs that are not running through `updater`. Returns how many
    /// changed. The running flag is kept as stored.
    pub fn update(&mut self, updater: &mut dyn FnMut(&JobSpec) -> JobSpec) -> StorageResult<usize> {
        let changed = self.storage.transform_jobs(&mut |spec: &JobSpec| {
            if spec.is_running {
                return spec.clone();
            }
            let mut updated = updater(spec);
            updated.is_running = false;
            updated
        })?;
        if changed > 0 {
            info!(jobs = changed, "updated pending jobs");
        }
        Ok(changed)
    }

    /// Human-readable dump of every job in storage with its constraints and
    /// dependencies.
    pub fn debug_info(&self) -> String {
        let jobs = self.storage.get_all_job_specs();
        let dependencies = self.storage.get_all_dependency_specs();

        let mut out = format!(
            "-- Jobs ({} stored, {} running)\n",
            jobs.len(),
            self.running.len()
        );
        for spec in &jobs {
            let constraints: Vec<String> = self
                .storage
                .get_constraint_specs(&spec.id)
                .into_iter()
                .map(|c| c.factory_key)
                .collect();
            let depends_on: Vec<&str> = dependencies
                .iter()
                .filter(|dep| dep.job_id == spec.id)
                .map(|dep| dep.depends_on_job_id.as_str())
                .collect();
            out.push_str(&format!(
                "{} factory={} queue={} attempt={}/{} running={} next_run={} constraints={:?} depends_on={:?}\n",
                spec.id,
                spec.factory_key,
                spec.queue_key.as_deref().unwrap_or("-"),
                spec.run_attempt,
                spec.max_attempts.map_or_else(|| "unlimited".to_string(), |max| max.to_string()),
                spec.is_running,
                spec.earliest_run_time(),
                constraints,
                depends_on,
            ));
        }
        out
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// No job is running and none is eligible, as of the last drain.
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    fn at_factory_limit(&self, factory_key: &str) -> bool {
        match self.factory_limits.get(factory_key) {
            Some(limit) => self.running_per_factory.get(factory_key).copied().unwrap_or(0) >= *limit,
            None => false,
        }
    }

    fn dispatch(
        &mut self,
        spec: &JobSpec,
        constraints: &[ConstraintSpec],
        runner: usize,
    ) -> StorageResult<Dispatch> {
        self.storage.update_job_running_state(&spec.id, true)?;
        let job = self.jobs.instantiate(spec, constraints);

        self.running.insert(spec.id.clone(), RunningJob {
            factory_key: spec.factory_key.clone(),
        });
        *self
            .running_per_factory
            .entry(spec.factory_key.clone())
            .or_default() += 1;

        debug!(job_id = %spec.id, factory_key = %spec.factory_key, run_attempt = spec.run_attempt, "dispatching job");
        self.tracker
            .on_state_change(update_for(spec, JobState::Running));

        Ok(Dispatch {
            id: spec.id.clone(),
            run_attempt: spec.run_attempt,
            runner,
            job,
        })
    }

    /// Put a job whose result could not be persisted back to pending so it
    /// runs again instead of staying marked running.
    fn release(&mut self, id: &JobId) {
        if let Err(err) = self.storage.update_job_running_state(id, false) {
            error!(job_id = %id, error = %err, "failed to release job");
        }
    }

    fn abandon_expired(&mut self, now: EpochMillis) -> bool {
        let expired: Vec<JobId> = self
            .storage
            .get_all_job_specs()
            .into_iter()
            .filter(|spec| !spec.is_running && spec.is_expired(now))
            .map(|spec| spec.id)
            .collect();

        let mut failed_any = false;
        for id in expired {
            // may already be gone through an earlier cascade
            if self.storage.get_job_spec(&id).is_some() {
                info!(job_id = %id, "job lifespan elapsed");
                self.fail_permanently(&id, None);
                failed_any = true;
            }
        }
        failed_any
    }

    /// Delete `root` and every job that transitively depends on it, then run
    /// their `on_failure` hooks.
    fn fail_permanently(&mut self, root: &JobId, mut root_job: Option<Box<dyn Job>>) {
        let mut failed: Vec<(JobSpec, Vec<ConstraintSpec>)> = Vec::new();
        let mut seen: HashSet<JobId> = HashSet::new();
        let mut worklist = vec![root.clone()];

        while let Some(id) = worklist.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(spec) = self.storage.get_job_spec(&id) else {
                continue;
            };
            worklist.extend(
                self.storage
                    .get_dependency_specs_that_depend_on_job(&id)
                    .into_iter()
                    .map(|dep| dep.job_id),
            );
            let constraints = self.storage.get_constraint_specs(&id);
            failed.push((spec, constraints));
        }

        if failed.is_empty() {
            return;
        }

        let ids: Vec<JobId> = failed.iter().map(|(spec, _)| spec.id.clone()).collect();
        if let Err(err) = self.storage.delete_jobs(&ids) {
            error!(job_id = %root, error = %err, "failed to delete permanently failed jobs");
            if self.storage.get_job_spec(root).is_some_and(|spec| spec.is_running) {
                self.release(root);
            }
            return;
        }

        if failed.len() > 1 {
            warn!(job_id = %root, dependents = failed.len() - 1, "cascading failure to dependent jobs");
        }

        for (spec, constraints) in failed {
            let job = if &spec.id == root { root_job.take() } else { None };
            let mut job = job.unwrap_or_else(|| self.jobs.instantiate(&spec, &constraints));
            run_hook(job.as_mut(), "on_failure", |job| job.on_failure());
            self.tracker
                .on_state_change(update_for(&spec, JobState::Failure));
        }
    }

    /// Ask the scheduler to come back for jobs still waiting and return the
    /// delay until the next time-based change.
    fn rearm(&mut self, now: EpochMillis) -> Option<Duration> {
        let waiting: Vec<JobSpec> = self
            .storage
            .get_all_job_specs()
            .into_iter()
            .filter(|spec| !spec.is_running)
            .collect();

        if waiting.is_empty() {
            self.last_schedule = None;
            return None;
        }

        let mut next_due: Option<EpochMillis> = None;
        let mut next_change: Option<EpochMillis> = None;
        let mut keys: BTreeSet<String> = BTreeSet::new();
        for spec in &waiting {
            let due = spec.earliest_run_time();
            if due > now {
                next_due = Some(next_due.map_or(due, |t| t.min(due)));
            }

            let expiry = spec
                .lifespan_ms
                .map(|lifespan| spec.create_time.saturating_add(lifespan));
            for time in [Some(due), expiry].into_iter().flatten() {
                if time > now {
                    next_change = Some(next_change.map_or(time, |t| t.min(time)));
                }
            }

            keys.extend(
                self.storage
                    .get_constraint_specs(&spec.id)
                    .into_iter()
                    .map(|c| c.factory_key),
            );
        }

        // With nothing due in the future, every waiting job is held back only
        // by a constraint, a dependency or a busy queue: ask for an immediate
        // wake-up. A request for the same future time is already armed.
        let request = (next_due, keys.into_iter().collect::<Vec<String>>());
        let armed = next_due.is_some() && self.last_schedule.as_ref() == Some(&request);
        if !armed {
            let delay = next_due.map_or(Duration::ZERO, |time| millis_to_duration(time - now));
            debug!(delay_ms = duration_millis(delay), constraints = ?request.1, "scheduling wake-up");
            self.scheduler.schedule(delay, &request.1);
            self.last_schedule = Some(request);
        }

        next_change.map(|time| millis_to_duration(time - now))
    }

    fn update_idle(&mut self, now: EpochMillis) -> bool {
        let idle = self.running.is_empty() && self.storage.get_eligible_job_count(now) == 0;
        let became_empty = idle && !self.idle;
        self.idle = idle;
        became_empty
    }
}

fn millis_to_duration(millis: i64) -> Duration {
    Duration::from_millis(millis.max(0) as u64)
}

fn update_for(spec: &JobSpec, state: JobState) -> JobUpdate {
    JobUpdate {
        id: spec.id.clone(),
        factory_key: spec.factory_key.clone(),
        queue_key: spec.queue_key.clone(),
        state,
    }
}

fn run_hook(job: &mut dyn Job, hook: &str, f: impl FnOnce(&mut dyn Job)) {
    if catch_unwind(AssertUnwindSafe(|| f(&mut *job))).is_err() {
        warn!(job_id = %job.parameters().id, hook, "job hook panicked");
    }
}
