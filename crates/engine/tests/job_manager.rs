use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jobmanager::{
    CachedJobStorage, FlagConstraint, FullSpec, InMemoryJobDatabase, Job, JobContext, JobData,
    JobFilter, JobId, JobManager, JobManagerConfig, JobManagerError, JobMigration, JobMigrator,
    JobParameters, JobResult, JobSpec, JobState, JobStorage, RetryPolicy, StorageError,
};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(10);
const SCRIPTED: &str = "Scripted";

/// Runs the outcome scripted for its current attempt and records its name.
struct ScriptedJob {
    params: JobParameters,
    name: String,
    outcomes: Vec<String>,
    runs: Arc<Mutex<Vec<String>>>,
}

impl ScriptedJob {
    fn new(runs: &Arc<Mutex<Vec<String>>>, name: &str, outcomes: &[&str]) -> Self {
        Self::with_params(runs, name, outcomes, JobParameters::builder().build())
    }

    fn with_params(
        runs: &Arc<Mutex<Vec<String>>>,
        name: &str,
        outcomes: &[&str],
        params: JobParameters,
    ) -> Self {
        Self {
            params,
            name: name.to_string(),
            outcomes: outcomes.iter().map(|o| o.to_string()).collect(),
            runs: runs.clone(),
        }
    }
}

impl Job for ScriptedJob {
    fn factory_key(&self) -> &str {
        SCRIPTED
    }

    fn parameters(&self) -> &JobParameters {
        &self.params
    }

    fn serialize(&self) -> serde_json::Value {
        json!({ "name": self.name, "outcomes": self.outcomes })
    }

    fn run(&mut self, ctx: &JobContext) -> JobResult {
        self.runs.lock().unwrap().push(self.name.clone());
        let outcome = self
            .outcomes
            .get(ctx.run_attempt as usize)
            .map(String::as_str)
            .unwrap_or("success");
        match outcome {
            "retry" => JobResult::retry(),
            "fail" => JobResult::failure("scripted failure"),
            "panic" => panic!("scripted panic"),
            _ => JobResult::Success,
        }
    }
}

const GATE: &str = "Gate";

/// Signals that it started, then blocks until released.
struct GateJob {
    params: JobParameters,
    started: mpsc::Sender<()>,
    release: Arc<Mutex<mpsc::Receiver<()>>>,
}

impl Job for GateJob {
    fn factory_key(&self) -> &str {
        GATE
    }

    fn parameters(&self) -> &JobParameters {
        &self.params
    }

    fn serialize(&self) -> serde_json::Value {
        json!({})
    }

    fn run(&mut self, _ctx: &JobContext) -> JobResult {
        let _ = self.started.send(());
        let _ = self.release.lock().unwrap().recv_timeout(WAIT);
        JobResult::Success
    }
}

fn manager(runs: &Arc<Mutex<Vec<String>>>) -> jobmanager::JobManagerBuilder {
    jobmanager_observability::init_pretty();
    let runs = runs.clone();
    JobManager::builder()
        .config(
            JobManagerConfig::default()
                .with_name("test")
                .with_worker_count(2)
                .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(10))),
        )
        .register_job(SCRIPTED, move |params, data| {
            let name = data["name"].as_str().ok_or("missing name")?.to_string();
            let outcomes: Vec<String> = data["outcomes"]
                .as_array()
                .map(|o| o.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
                .unwrap_or_default();
            Ok(Box::new(ScriptedJob {
                params,
                name,
                outcomes,
                runs: runs.clone(),
            }) as Box<dyn Job>)
        })
}

fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in {WAIT:?}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn run_synchronously_reports_success() {
    let runs = Arc::default();
    let manager = manager(&runs).build().unwrap();

    let state = manager
        .run_synchronously(ScriptedJob::new(&runs, "once", &[]), WAIT)
        .unwrap();

    assert_eq!(state, Some(JobState::Success));
    assert_eq!(*runs.lock().unwrap(), vec!["once"]);
    manager.shutdown();
}

#[test]
fn retried_job_eventually_succeeds() {
    let runs = Arc::default();
    let manager = manager(&runs).build().unwrap();

    let params = JobParameters::builder().max_attempts(3).build();
    let job = ScriptedJob::with_params(&runs, "flaky", &["retry", "retry", "success"], params);
    let state = manager.run_synchronously(job, WAIT).unwrap();

    assert_eq!(state, Some(JobState::Success));
    assert_eq!(runs.lock().unwrap().len(), 3);
    manager.shutdown();
}

#[test]
fn panicking_job_fails_without_killing_workers() {
    let runs = Arc::default();
    let manager = manager(&runs).build().unwrap();

    let state = manager
        .run_synchronously(ScriptedJob::new(&runs, "boom", &["panic"]), WAIT)
        .unwrap();
    assert_eq!(state, Some(JobState::Failure));

    let state = manager
        .run_synchronously(ScriptedJob::new(&runs, "after", &[]), WAIT)
        .unwrap();
    assert_eq!(state, Some(JobState::Success));
    manager.shutdown();
}

#[test]
fn constrained_job_waits_for_flag() {
    let runs = Arc::default();
    let network = FlagConstraint::new("Network", false);
    let manager = manager(&runs).flag_constraint(network.clone()).build().unwrap();

    let (tx, rx) = mpsc::channel();
    manager.add_listener(JobFilter::FactoryKey(SCRIPTED.to_string()), move |update| {
        if update.state.is_complete() {
            let _ = tx.send(update.state);
        }
    });

    let params = JobParameters::builder().constraint("Network").build();
    let id = manager
        .add(ScriptedJob::with_params(&runs, "upload", &[], params))
        .unwrap();
    manager.flush().unwrap();

    assert!(runs.lock().unwrap().is_empty());
    let found = manager.find(|spec: &JobSpec| spec.factory_key == SCRIPTED).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, id);

    network.set(true);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), JobState::Success);
    manager.flush().unwrap();
    assert!(manager.find(|_| true).unwrap().is_empty());
    manager.shutdown();
}

#[test]
fn chain_runs_in_order_and_empty_listener_fires() {
    let runs: Arc<Mutex<Vec<String>>> = Arc::default();
    let manager = manager(&runs).build().unwrap();

    let (tx, rx) = mpsc::channel();
    manager.add_empty_queue_listener(move || {
        let _ = tx.send(());
    });
    // the listener may fire once for the empty startup state
    manager.flush().unwrap();
    while rx.try_recv().is_ok() {}

    manager
        .start_chain(ScriptedJob::new(&runs, "first", &[]))
        .then_all(vec![
            Box::new(ScriptedJob::new(&runs, "second-a", &[])) as Box<dyn Job>,
            Box::new(ScriptedJob::new(&runs, "second-b", &[])),
        ])
        .then(ScriptedJob::new(&runs, "third", &[]))
        .enqueue()
        .unwrap();

    rx.recv_timeout(WAIT).unwrap();
    let runs = runs.lock().unwrap().clone();
    assert_eq!(runs.len(), 4);
    assert_eq!(runs[0], "first");
    assert_eq!(runs[3], "third");
    manager.shutdown();
}

#[test]
fn failed_dependency_fails_dependents() {
    let runs = Arc::default();
    let manager = manager(&runs).build().unwrap();

    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let (tx, rx) = mpsc::channel();
    manager.add_listener(JobFilter::All, move |update| {
        if update.state == JobState::Failure && counter.fetch_add(1, Ordering::SeqCst) == 1 {
            let _ = tx.send(());
        }
    });

    manager
        .start_chain(ScriptedJob::new(&runs, "parent", &["fail"]))
        .then(ScriptedJob::new(&runs, "child", &[]))
        .enqueue()
        .unwrap();

    rx.recv_timeout(WAIT).unwrap();
    assert_eq!(failures.load(Ordering::SeqCst), 2);
    assert_eq!(*runs.lock().unwrap(), vec!["parent"]);
    manager.shutdown();
}

#[test]
fn queue_queries_see_pending_jobs() {
    let runs = Arc::default();
    let manager = manager(&runs).build().unwrap();

    let params = JobParameters::builder()
        .queue("sync")
        .initial_delay(Duration::from_secs(3600))
        .build();
    manager
        .add(ScriptedJob::with_params(&runs, "later", &[], params))
        .unwrap();

    assert!(!manager.is_queue_empty("sync").unwrap());
    assert!(manager.are_queues_empty(&["other", "another"]).unwrap());
    manager.shutdown();
}

#[test]
fn migrations_run_before_jobs_start() {
    let runs: Arc<Mutex<Vec<String>>> = Arc::default();
    let db = InMemoryJobDatabase::new();
    {
        let mut storage = CachedJobStorage::new(db.clone());
        storage.init().unwrap();
        let spec = JobSpec::new("old-job".into(), "LegacyUpload", 0)
            .with_data(json!({ "label": "legacy" }));
        storage.insert_jobs(vec![FullSpec::job_only(spec)]).unwrap();
    }

    let migrator = JobMigrator::new(vec![JobMigration::new(2, |data: JobData| {
        if data.factory_key != "LegacyUpload" {
            return data;
        }
        let label = data.data["label"].as_str().unwrap_or_default().to_string();
        JobData {
            factory_key: SCRIPTED.to_string(),
            queue_key: data.queue_key,
            data: json!({ "name": label, "outcomes": [] }),
        }
    })])
    .unwrap();

    let manager = manager(&runs)
        .storage(CachedJobStorage::new(db))
        .migrator(migrator)
        .build()
        .unwrap();

    wait_until(|| {
        manager.flush().unwrap();
        manager.find(|_| true).unwrap().is_empty()
    });
    assert_eq!(*runs.lock().unwrap(), vec!["legacy"]);
    manager.shutdown();
}

#[test]
fn rejected_inserts_are_reported_to_the_caller() {
    let runs = Arc::default();
    let manager = manager(&runs).build().unwrap();

    let params = || {
        JobParameters::builder()
            .id("dup")
            .initial_delay(Duration::from_secs(3600))
            .build()
    };
    manager
        .add(ScriptedJob::with_params(&runs, "first", &[], params()))
        .unwrap();

    let second = manager.add(ScriptedJob::with_params(&runs, "second", &[], params()));
    assert!(matches!(
        second,
        Err(JobManagerError::Storage(StorageError::AlreadyExists(id))) if id == JobId::from("dup")
    ));

    let chained = manager
        .start_chain(ScriptedJob::new(&runs, "fresh", &[]))
        .then(ScriptedJob::with_params(&runs, "again", &[], params()))
        .enqueue();
    assert!(matches!(
        chained,
        Err(JobManagerError::Storage(StorageError::AlreadyExists(_)))
    ));

    let invalid = manager.enqueue(FullSpec::job_only(JobSpec::new("blank".into(), "", 0)));
    assert!(matches!(
        invalid,
        Err(JobManagerError::Storage(StorageError::Invalid(_)))
    ));

    assert_eq!(manager.find(|_| true).unwrap().len(), 1);
    manager.shutdown();
}

#[test]
fn reserved_runner_takes_matching_jobs_while_workers_are_busy() {
    let runs: Arc<Mutex<Vec<String>>> = Arc::default();
    let (started_tx, started) = mpsc::channel();
    let (release, release_rx) = mpsc::channel();
    let release_rx = Arc::new(Mutex::new(release_rx));

    let gate_started = started_tx.clone();
    let gate_release = release_rx.clone();
    let manager = manager(&runs)
        .config(JobManagerConfig::default().with_worker_count(1))
        .register_job(GATE, move |params, _data| {
            Ok(Box::new(GateJob {
                params,
                started: gate_started.clone(),
                release: gate_release.clone(),
            }) as Box<dyn Job>)
        })
        .reserved_runner_for([SCRIPTED])
        .build()
        .unwrap();

    manager
        .add(GateJob {
            params: JobParameters::builder().build(),
            started: started_tx,
            release: release_rx,
        })
        .unwrap();
    started.recv_timeout(WAIT).unwrap();

    let state = manager
        .run_synchronously(ScriptedJob::new(&runs, "urgent", &[]), WAIT)
        .unwrap();
    assert_eq!(state, Some(JobState::Success));
    assert_eq!(*runs.lock().unwrap(), vec!["urgent"]);

    release.send(()).unwrap();
    manager.shutdown();
}

#[test]
fn update_rewrites_pending_jobs() {
    let runs: Arc<Mutex<Vec<String>>> = Arc::default();
    let manager = manager(&runs).build().unwrap();

    let params = JobParameters::builder()
        .queue("slow")
        .initial_delay(Duration::from_secs(3600))
        .build();
    manager
        .add(ScriptedJob::with_params(&runs, "parked", &[], params))
        .unwrap();

    let info = manager.debug_info().unwrap();
    assert!(info.contains("factory=Scripted"), "{info}");
    assert!(info.contains("queue=slow"), "{info}");

    let changed = manager
        .update(|spec: &JobSpec| spec.clone().with_initial_delay_ms(0))
        .unwrap();
    assert_eq!(changed, 1);

    wait_until(|| runs.lock().unwrap().len() == 1);
    assert_eq!(*runs.lock().unwrap(), vec!["parked"]);
    manager.shutdown();
}

#[test]
fn chain_can_start_with_parallel_jobs() {
    let runs: Arc<Mutex<Vec<String>>> = Arc::default();
    let manager = manager(&runs).build().unwrap();

    let (tx, rx) = mpsc::channel();
    manager.add_listener(JobFilter::All, move |update| {
        if update.state == JobState::Success {
            let _ = tx.send(());
        }
    });

    let ids = manager
        .start_chain_all(vec![
            Box::new(ScriptedJob::new(&runs, "left", &[])) as Box<dyn Job>,
            Box::new(ScriptedJob::new(&runs, "right", &[])),
        ])
        .then(ScriptedJob::new(&runs, "join", &[]))
        .enqueue()
        .unwrap();
    assert_eq!(ids.len(), 3);

    for _ in 0..3 {
        rx.recv_timeout(WAIT).unwrap();
    }
    let runs = runs.lock().unwrap().clone();
    assert_eq!(runs.len(), 3);
    assert_eq!(runs[2], "join");
    manager.shutdown();
}

#[test]
fn removed_empty_queue_listener_is_not_called() {
    let runs = Arc::default();
    let manager = manager(&runs).build().unwrap();
    // let the startup drain and its empty notification pass first
    manager.flush().unwrap();

    let removed = Arc::new(AtomicUsize::new(0));
    let kept = Arc::new(AtomicUsize::new(0));
    let counter = removed.clone();
    let id = manager.add_empty_queue_listener(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = kept.clone();
    manager.add_empty_queue_listener(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    manager.remove_empty_queue_listener(id);

    let state = manager
        .run_synchronously(ScriptedJob::new(&runs, "once", &[]), WAIT)
        .unwrap();
    assert_eq!(state, Some(JobState::Success));

    wait_until(|| {
        manager.flush().unwrap();
        kept.load(Ordering::SeqCst) > 0
    });
    assert_eq!(removed.load(Ordering::SeqCst), 0);
    manager.shutdown();
}

#[cfg(feature = "sqlite")]
#[test]
fn jobs_survive_restart_with_sqlite() {
    use jobmanager::SqliteJobDatabase;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let runs = Arc::default();

    let params = JobParameters::builder()
        .initial_delay(Duration::from_secs(3600))
        .build();
    let id = {
        let manager = manager(&runs)
            .storage(CachedJobStorage::new(SqliteJobDatabase::open(&path).unwrap()))
            .build()
            .unwrap();
        let id = manager
            .add(ScriptedJob::with_params(&runs, "durable", &[], params))
            .unwrap();
        manager.flush().unwrap();
        manager.shutdown();
        id
    };

    let manager = manager(&runs)
        .storage(CachedJobStorage::new(SqliteJobDatabase::open(&path).unwrap()))
        .build()
        .unwrap();
    let found = manager.find(|_| true).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, id);
    assert_eq!(found[0].serialized_data["name"], "durable");
    manager.shutdown();
}
