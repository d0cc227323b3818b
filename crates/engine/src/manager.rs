//! Threaded front end of the engine.
//!
//! A [`JobManager`] owns one controller thread and a fixed pool of worker
//! threads. Every storage read and write happens on the controller thread;
//! producers, workers and constraint observers talk to it through a command
//! channel. Workers only run job bodies and send the result back.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use jobmanager_core::{FullSpec, JobId, JobSpec, now_millis};

use crate::config::JobManagerConfig;
use crate::constraint::{Constraint, ConstraintObserver, ConstraintRegistry, FlagConstraint, Notifier};
use crate::controller::{Dispatch, JobController, RunnerSlots};
use crate::error::JobManagerError;
use crate::job::{Job, JobContext, JobParameters, JobResult};
use crate::migration::JobMigrator;
use crate::registry::JobRegistry;
use crate::scheduler::{CompositeScheduler, NoopScheduler, Scheduler};
use crate::storage::{CachedJobStorage, InMemoryJobDatabase, JobStorage, StorageResult};
use crate::tracker::{JobFilter, JobState, JobTracker, JobUpdate, ListenerId};

/// Selects the jobs a reserved runner may take.
pub type JobPredicate = Arc<dyn Fn(&JobSpec) -> bool + Send + Sync>;

type EmptyQueueListener = Arc<dyn Fn() + Send + Sync>;
type FindPredicate = Box<dyn Fn(&JobSpec) -> bool + Send>;
type JobUpdater = Box<dyn FnMut(&JobSpec) -> JobSpec + Send>;

/// Handle for removing an empty-queue listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmptyQueueListenerId(u64);

#[derive(Default)]
struct EmptyQueueListeners {
    next_id: u64,
    listeners: Vec<(EmptyQueueListenerId, EmptyQueueListener)>,
}

enum Command {
    Submit {
        stages: Vec<Vec<Box<dyn Job>>>,
        reply: Sender<StorageResult<Vec<JobId>>>,
    },
    Enqueue {
        specs: Vec<FullSpec>,
        reply: Sender<StorageResult<Vec<JobId>>>,
    },
    SubmitWithDependencies {
        job: Box<dyn Job>,
        depends_on: Vec<JobId>,
        depends_on_queue: Option<String>,
        reply: Sender<StorageResult<JobId>>,
    },
    Update {
        updater: JobUpdater,
        reply: Sender<StorageResult<usize>>,
    },
    DebugInfo {
        reply: Sender<String>,
    },
    Finished {
        dispatch: Dispatch,
        result: JobResult,
    },
    Wake {
        reason: String,
    },
    Find {
        predicate: FindPredicate,
        reply: Sender<Vec<JobSpec>>,
    },
    AreQueuesEmpty {
        queue_keys: Vec<String>,
        reply: Sender<bool>,
    },
    Flush {
        reply: Sender<()>,
    },
    Shutdown,
}

/// Handle to a running job engine.
///
/// Dropping the handle stops the controller without waiting for running jobs;
/// call [`shutdown`](Self::shutdown) to wait for them.
///
/// Calls that return a result wait for the controller thread. Job state and
/// empty-queue listeners run on that thread and must not make them.
pub struct JobManager {
    name: String,
    commands: Sender<Command>,
    tracker: JobTracker,
    empty_listeners: Arc<Mutex<EmptyQueueListeners>>,
    stopping: Arc<AtomicBool>,
    controller: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl JobManager {
    pub fn builder() -> JobManagerBuilder {
        JobManagerBuilder::default()
    }

    /// Enqueue a job. Returns its id once it is stored.
    pub fn add(&self, job: impl Job + 'static) -> Result<JobId, JobManagerError> {
        self.add_boxed(Box::new(job))
    }

    pub fn add_boxed(&self, job: Box<dyn Job>) -> Result<JobId, JobManagerError> {
        let mut ids = self.submit(vec![vec![job]])?;
        ids.pop().ok_or(JobManagerError::ShutDown)
    }

    /// Enqueue prepared rows, e.g. produced by another process. The job is
    /// rebuilt from its factory key when it runs.
    pub fn enqueue(&self, spec: FullSpec) -> Result<JobId, JobManagerError> {
        let mut ids = self.request(|reply| Command::Enqueue {
            specs: vec![spec],
            reply,
        })??;
        ids.pop().ok_or(JobManagerError::ShutDown)
    }

    /// Enqueue a job that may not run while any of `depends_on`, or any job
    /// currently in `depends_on_queue`, is still in storage.
    pub fn add_with_dependencies(
        &self,
        job: impl Job + 'static,
        depends_on: impl IntoIterator<Item = JobId>,
        depends_on_queue: Option<&str>,
    ) -> Result<JobId, JobManagerError> {
        let job: Box<dyn Job> = Box::new(job);
        let depends_on = depends_on.into_iter().collect();
        let depends_on_queue = depends_on_queue.map(str::to_string);
        Ok(self.request(|reply| Command::SubmitWithDependencies {
            job,
            depends_on,
            depends_on_queue,
            reply,
        })??)
    }

    /// Enqueue several independent jobs in one atomic insert.
    pub fn add_all(&self, jobs: Vec<Box<dyn Job>>) -> Result<Vec<JobId>, JobManagerError> {
        self.submit(vec![jobs])
    }

    /// Start a chain: each later stage depends on every job of the stage
    /// before it. Nothing is enqueued until [`JobChain::enqueue`].
    pub fn start_chain(&self, job: impl Job + 'static) -> JobChain<'_> {
        self.start_chain_all(vec![Box::new(job)])
    }

    /// Start a chain whose first stage is several jobs that run in parallel.
    pub fn start_chain_all(&self, jobs: Vec<Box<dyn Job>>) -> JobChain<'_> {
        JobChain {
            manager: self,
            stages: vec![jobs],
        }
    }

    /// Rewrite every job that is not running through `updater`, e.g. to move
    /// jobs to another queue. Returns how many jobs changed.
    pub fn update<F>(&self, updater: F) -> Result<usize, JobManagerError>
    where
        F: FnMut(&JobSpec) -> JobSpec + Send + 'static,
    {
        Ok(self.request(|reply| Command::Update {
            updater: Box::new(updater),
            reply,
        })??)
    }

    /// Every stored job with its constraints and dependencies, one per line.
    pub fn debug_info(&self) -> Result<String, JobManagerError> {
        self.request(|reply| Command::DebugInfo { reply })
    }

    pub fn add_listener<F>(&self, filter: JobFilter, listener: F) -> ListenerId
    where
        F: Fn(&JobUpdate) + Send + Sync + 'static,
    {
        self.tracker.add_listener(filter, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.tracker.remove_listener(id);
    }

    /// Called on the controller thread each time the engine runs out of
    /// eligible and running jobs.
    pub fn add_empty_queue_listener<F>(&self, listener: F) -> EmptyQueueListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut state = self
            .empty_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = EmptyQueueListenerId(state.next_id);
        state.next_id += 1;
        state.listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn remove_empty_queue_listener(&self, id: EmptyQueueListenerId) {
        self.empty_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .retain(|(listener, _)| *listener != id);
    }

    /// Jobs in storage matching `predicate`, in created order.
    pub fn find<F>(&self, predicate: F) -> Result<Vec<JobSpec>, JobManagerError>
    where
        F: Fn(&JobSpec) -> bool + Send + 'static,
    {
        self.request(|reply| Command::Find {
            predicate: Box::new(predicate),
            reply,
        })
    }

    pub fn are_queues_empty(&self, queue_keys: &[&str]) -> Result<bool, JobManagerError> {
        let queue_keys = queue_keys.iter().map(|key| key.to_string()).collect();
        self.request(|reply| Command::AreQueuesEmpty { queue_keys, reply })
    }

    pub fn is_queue_empty(&self, queue_key: &str) -> Result<bool, JobManagerError> {
        self.are_queues_empty(&[queue_key])
    }

    /// Block until every command sent before this call has been processed
    /// and the resulting drain has dispatched.
    pub fn flush(&self) -> Result<(), JobManagerError> {
        self.request(|reply| Command::Flush { reply })
    }

    /// Re-check every job now, e.g. after the host scheduler woke the process.
    pub fn wake_up(&self) {
        if self
            .send(Command::Wake {
                reason: "wake_up".to_string(),
            })
            .is_err()
        {
            debug!(manager = %self.name, "wake-up after shutdown ignored");
        }
    }

    /// A notifier that wakes this manager, for constraint observers
    /// registered after build.
    pub fn notifier(&self) -> Notifier {
        notifier_for(self.commands.clone())
    }

    /// Enqueue `job` and wait for it to finish.
    ///
    /// Returns the terminal state, or `None` if the job had not finished
    /// within `timeout`. The job keeps going in the background after a
    /// timeout.
    pub fn run_synchronously(
        &self,
        job: impl Job + 'static,
        timeout: Duration,
    ) -> Result<Option<JobState>, JobManagerError> {
        let id = job.parameters().id.clone();
        let (done, finished) = mpsc::channel();
        let listener = self.tracker.add_listener(JobFilter::Id(id), move |update| {
            if update.state.is_complete() {
                let _ = done.send(update.state);
            }
        });

        let result = self.add(job).map(|_| finished.recv_timeout(timeout).ok());
        self.tracker.remove_listener(listener);
        result
    }

    /// Stop the controller, let running jobs finish and join every thread.
    ///
    /// Jobs whose result arrives after the controller stopped stay marked
    /// running in storage and are reset on the next start.
    pub fn shutdown(mut self) {
        self.stop();
        if let Some(controller) = self.controller.take() {
            if controller.join().is_err() {
                error!(manager = %self.name, "controller thread panicked");
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!(manager = %self.name, "worker thread panicked");
            }
        }
        info!(manager = %self.name, "job manager stopped");
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<(), JobManagerError> {
        self.commands
            .send(command)
            .map_err(|_| JobManagerError::ShutDown)
    }

    /// Send a command carrying a reply channel and wait for the answer.
    fn request<T>(&self, command: impl FnOnce(Sender<T>) -> Command) -> Result<T, JobManagerError> {
        let (reply, response) = mpsc::channel();
        self.send(command(reply))?;
        response.recv().map_err(|_| JobManagerError::ShutDown)
    }

    fn submit(&self, stages: Vec<Vec<Box<dyn Job>>>) -> Result<Vec<JobId>, JobManagerError> {
        Ok(self.request(|reply| Command::Submit { stages, reply })??)
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        if self.controller.is_some() {
            self.stop();
        }
    }
}

/// Stages of jobs waiting to be enqueued together.
pub struct JobChain<'a> {
    manager: &'a JobManager,
    stages: Vec<Vec<Box<dyn Job>>>,
}

impl<'a> JobChain<'a> {
    pub fn then(mut self, job: impl Job + 'static) -> Self {
        self.stages.push(vec![Box::new(job)]);
        self
    }

    /// Add a stage of jobs that run in parallel with each other.
    pub fn then_all(mut self, jobs: Vec<Box<dyn Job>>) -> Self {
        self.stages.push(jobs);
        self
    }

    /// Insert every stage atomically. Returns the ids in stage order.
    pub fn enqueue(self) -> Result<Vec<JobId>, JobManagerError> {
        self.manager.submit(self.stages)
    }
}

/// Builder for [`JobManager`].
#[derive(Default)]
pub struct JobManagerBuilder {
    config: JobManagerConfig,
    jobs: JobRegistry,
    constraints: ConstraintRegistry,
    observers: Vec<Arc<dyn ConstraintObserver>>,
    storage: Option<Box<dyn JobStorage>>,
    migrator: JobMigrator,
    schedulers: Vec<Arc<dyn Scheduler>>,
    reserved_runners: Vec<JobPredicate>,
}

impl JobManagerBuilder {
    pub fn config(mut self, config: JobManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register how to rebuild jobs stored under `factory_key`.
    pub fn register_job<F>(mut self, factory_key: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(JobParameters, serde_json::Value) -> Result<Box<dyn Job>, String>
            + Send
            + Sync
            + 'static,
    {
        self.jobs.register(factory_key, constructor);
        self
    }

    pub fn register_constraint(mut self, constraint: Arc<dyn Constraint>) -> Self {
        self.constraints.register(constraint);
        self
    }

    pub fn constraint_observer(mut self, observer: Arc<dyn ConstraintObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Register a flag as both constraint and observer.
    pub fn flag_constraint(self, flag: Arc<FlagConstraint>) -> Self {
        self.register_constraint(flag.clone())
            .constraint_observer(flag)
    }

    /// Storage to use. Defaults to [`CachedJobStorage`] over an
    /// [`InMemoryJobDatabase`].
    pub fn storage(mut self, storage: impl JobStorage + 'static) -> Self {
        self.storage = Some(Box::new(storage));
        self
    }

    pub fn migrator(mut self, migrator: JobMigrator) -> Self {
        self.migrator = migrator;
        self
    }

    /// Add a runner that only takes jobs matching `predicate`, on top of the
    /// configured worker count. Matching jobs go to an idle reserved runner
    /// first and to the general workers otherwise.
    pub fn reserved_runner<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&JobSpec) -> bool + Send + Sync + 'static,
    {
        self.reserved_runners.push(Arc::new(predicate));
        self
    }

    /// Add a reserved runner for jobs of the given factory keys.
    pub fn reserved_runner_for<I, K>(self, factory_keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: Vec<String> = factory_keys.into_iter().map(Into::into).collect();
        self.reserved_runner(move |spec: &JobSpec| keys.contains(&spec.factory_key))
    }

    /// Add a host scheduler. Several are combined with
    /// [`CompositeScheduler`].
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.schedulers.push(scheduler);
        self
    }

    /// Load storage, run migrations, reset jobs left running, and start the
    /// controller and worker threads.
    pub fn build(self) -> Result<JobManager, JobManagerError> {
        let Self {
            config,
            jobs,
            constraints,
            observers,
            storage,
            migrator,
            mut schedulers,
            reserved_runners,
        } = self;

        let mut storage = storage
            .unwrap_or_else(|| Box::new(CachedJobStorage::new(InMemoryJobDatabase::new())));
        storage.init()?;
        let schema_version = migrator.migrate(storage.as_mut())?;

        let scheduler: Arc<dyn Scheduler> = match schedulers.len() {
            0 => Arc::new(NoopScheduler),
            1 => schedulers.remove(0),
            _ => Arc::new(CompositeScheduler::new(schedulers)),
        };

        let tracker = JobTracker::new();
        let mut controller = JobController::new(storage, jobs, constraints, scheduler, tracker.clone())
            .with_retry_policy(config.retry_policy.clone())
            .with_factory_limits(config.factory_concurrency.clone());
        controller.init()?;

        let (command_tx, command_rx) = mpsc::channel::<Command>();
        let stopping = Arc::new(AtomicBool::new(false));
        let empty_listeners: Arc<Mutex<EmptyQueueListeners>> = Arc::default();

        // Runner 0 is the shared general pool; runner n > 0 is reserved
        // runner n - 1 with a channel of its own.
        let worker_count = config.worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count + reserved_runners.len());
        let mut routes = Vec::with_capacity(reserved_runners.len() + 1);

        let (general_tx, general_rx) = mpsc::channel::<Dispatch>();
        let general_rx = Arc::new(Mutex::new(general_rx));
        routes.push(general_tx);
        for index in 0..worker_count {
            workers.push(spawn_worker(
                format!("jobmanager-worker-{index}"),
                general_rx.clone(),
                command_tx.clone(),
                stopping.clone(),
            )?);
        }
        for index in 0..reserved_runners.len() {
            let (reserved_tx, reserved_rx) = mpsc::channel::<Dispatch>();
            routes.push(reserved_tx);
            workers.push(spawn_worker(
                format!("jobmanager-reserved-{index}"),
                Arc::new(Mutex::new(reserved_rx)),
                command_tx.clone(),
                stopping.clone(),
            )?);
        }

        let notifier = notifier_for(command_tx.clone());
        for observer in &observers {
            observer.register(notifier.clone());
        }

        let reserved_count = reserved_runners.len();
        let loop_state = ControllerLoop {
            name: config.name.clone(),
            commands: command_rx,
            routes,
            runners: RunnerPool::new(worker_count, reserved_runners),
            empty_listeners: empty_listeners.clone(),
        };
        let controller = thread::Builder::new()
            .name("jobmanager-controller".to_string())
            .spawn(move || loop_state.run(controller))?;

        let _ = command_tx.send(Command::Wake {
            reason: "startup".to_string(),
        });

        info!(
            manager = %config.name,
            workers = worker_count,
            reserved = reserved_count,
            schema_version,
            "job manager started"
        );

        Ok(JobManager {
            name: config.name,
            commands: command_tx,
            tracker,
            empty_listeners,
            stopping,
            controller: Some(controller),
            workers,
        })
    }
}

fn notifier_for(commands: Sender<Command>) -> Notifier {
    Notifier::from_fn(move |reason| {
        let _ = commands.send(Command::Wake {
            reason: reason.to_string(),
        });
    })
}

fn spawn_worker(
    name: String,
    jobs: Arc<Mutex<Receiver<Dispatch>>>,
    commands: Sender<Command>,
    stopping: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, JobManagerError> {
    Ok(thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(jobs, commands, stopping))?)
}

/// Idle runners as seen by the controller thread.
struct RunnerPool {
    idle_general: usize,
    reserved: Vec<(JobPredicate, bool)>,
}

impl RunnerPool {
    fn new(general: usize, reserved: Vec<JobPredicate>) -> Self {
        Self {
            idle_general: general,
            reserved: reserved.into_iter().map(|predicate| (predicate, true)).collect(),
        }
    }
}

impl RunnerSlots for RunnerPool {
    fn claim(&mut self, spec: &JobSpec) -> Option<usize> {
        if let Some(index) = self
            .reserved
            .iter()
            .position(|(accepts, idle)| *idle && accepts(spec))
        {
            self.reserved[index].1 = false;
            return Some(index + 1);
        }
        if self.idle_general == 0 {
            return None;
        }
        self.idle_general -= 1;
        Some(0)
    }

    fn release(&mut self, runner: usize) {
        match runner {
            0 => self.idle_general += 1,
            n => {
                if let Some((_, idle)) = self.reserved.get_mut(n - 1) {
                    *idle = true;
                }
            }
        }
    }
}

struct ControllerLoop {
    name: String,
    commands: Receiver<Command>,
    /// Dispatch channel per runner slot, indexed like [`RunnerPool`].
    routes: Vec<Sender<Dispatch>>,
    runners: RunnerPool,
    empty_listeners: Arc<Mutex<EmptyQueueListeners>>,
}

impl ControllerLoop {
    fn run<S: JobStorage>(mut self, mut controller: JobController<S>) {
        info!(manager = %self.name, "job controller started");
        let mut deadline: Option<Instant> = None;
        let mut flushes: Vec<Sender<()>> = Vec::new();

        'control: loop {
            let first = match deadline {
                Some(deadline) => {
                    match self
                        .commands
                        .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                    {
                        Ok(command) => Some(command),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };

            // Apply everything already queued before draining once.
            let batch: Vec<Command> = first
                .into_iter()
                .chain(std::iter::from_fn(|| self.commands.try_recv().ok()))
                .collect();

            for command in batch {
                let now = now_millis();
                match command {
                    Command::Shutdown => break 'control,
                    Command::Submit { stages, reply } => {
                        let _ = reply.send(controller.submit_chain(stages, now));
                    }
                    Command::Enqueue { specs, reply } => {
                        let _ = reply.send(controller.enqueue(specs));
                    }
                    Command::SubmitWithDependencies {
                        job,
                        depends_on,
                        depends_on_queue,
                        reply,
                    } => {
                        let _ = reply.send(controller.submit_with_dependencies(
                            job,
                            depends_on,
                            depends_on_queue.as_deref(),
                            now,
                        ));
                    }
                    Command::Update { mut updater, reply } => {
                        let _ = reply.send(controller.update(&mut *updater));
                    }
                    Command::DebugInfo { reply } => {
                        let _ = reply.send(controller.debug_info());
                    }
                    Command::Finished { dispatch, result } => {
                        self.runners.release(dispatch.runner);
                        controller.on_job_finished(dispatch, result, now);
                    }
                    Command::Wake { reason } => {
                        debug!(manager = %self.name, reason = %reason, "woken up");
                    }
                    Command::Find { predicate, reply } => {
                        let _ = reply.send(controller.find(&*predicate));
                    }
                    Command::AreQueuesEmpty { queue_keys, reply } => {
                        let _ = reply.send(controller.are_queues_empty(&queue_keys));
                    }
                    Command::Flush { reply } => flushes.push(reply),
                }
            }

            let outcome = controller.drain_into(now_millis(), &mut self.runners);

            for dispatch in outcome.dispatched {
                let id = dispatch.id.clone();
                let sent = self
                    .routes
                    .get(dispatch.runner)
                    .is_some_and(|route| route.send(dispatch).is_ok());
                if !sent {
                    error!(manager = %self.name, job_id = %id, "worker pool is gone");
                    break 'control;
                }
            }

            if outcome.became_empty {
                let listeners: Vec<EmptyQueueListener> = self
                    .empty_listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .listeners
                    .iter()
                    .map(|(_, listener)| listener.clone())
                    .collect();
                for listener in listeners {
                    if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                        warn!(manager = %self.name, "empty queue listener panicked");
                    }
                }
            }

            deadline = outcome.next_wake.map(|delay| Instant::now() + delay);

            for reply in flushes.drain(..) {
                let _ = reply.send(());
            }
        }

        info!(manager = %self.name, running = controller.running_count(), "job controller stopped");
    }
}

fn worker_loop(
    jobs: Arc<Mutex<Receiver<Dispatch>>>,
    commands: Sender<Command>,
    stopping: Arc<AtomicBool>,
) {
    loop {
        let next = jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(mut dispatch) = next else {
            break;
        };
        if stopping.load(Ordering::SeqCst) {
            debug!(job_id = %dispatch.id, "skipping job dispatched before shutdown");
            continue;
        }

        let ctx = JobContext {
            id: dispatch.id.clone(),
            run_attempt: dispatch.run_attempt,
        };
        debug!(job_id = %ctx.id, run_attempt = ctx.run_attempt, "running job");

        let result = match catch_unwind(AssertUnwindSafe(|| dispatch.job.run(&ctx))) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(job_id = %ctx.id, panic = %message, "job panicked");
                JobResult::failure(format!("job panicked: {message}"))
            }
        };

        if commands
            .send(Command::Finished { dispatch, result })
            .is_err()
        {
            debug!(job_id = %ctx.id, "controller stopped before the job finished");
            break;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
