//! In-memory job database for tests and hosts without durable storage.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use jobmanager_core::{ConstraintSpec, DependencySpec, EpochMillis, FullSpec, JobId, JobSpec};

use super::{JobDatabase, StorageError, StorageResult};
use crate::migration::INITIAL_SCHEMA_VERSION;

#[derive(Debug, Default)]
struct Tables {
    jobs: Vec<JobSpec>,
    constraints: Vec<ConstraintSpec>,
    dependencies: Vec<DependencySpec>,
    schema_version: Option<u32>,
    failing_writes: usize,
}

impl Tables {
    fn begin_write(&mut self) -> StorageResult<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StorageError::Database("injected write failure".to_string()));
        }
        Ok(())
    }

    fn job_mut(&mut self, id: &JobId) -> StorageResult<&mut JobSpec> {
        self.jobs
            .iter_mut()
            .find(|job| &job.id == id)
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }
}

/// Job database kept in process memory.
///
/// Clones share the same tables, so dropping a `CachedJobStorage` and building
/// a new one over a clone behaves like a process restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobDatabase {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryJobDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with [`StorageError::Database`].
    pub fn fail_next_writes(&self, count: usize) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.failing_writes = count;
        }
    }

    pub fn job_count(&self) -> usize {
        self.tables.lock().map(|t| t.jobs.len()).unwrap_or(0)
    }

    /// Every stored job with its rows, in insertion order.
    pub fn snapshot(&self) -> StorageResult<Vec<FullSpec>> {
        let tables = self.lock()?;
        Ok(assemble(&tables))
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Database("lock poisoned".to_string()))
    }
}

fn assemble(tables: &Tables) -> Vec<FullSpec> {
    tables
        .jobs
        .iter()
        .map(|job| {
            FullSpec::new(
                job.clone(),
                tables
                    .constraints
                    .iter()
                    .filter(|c| c.job_id == job.id)
                    .cloned()
                    .collect(),
                tables
                    .dependencies
                    .iter()
                    .filter(|d| d.job_id == job.id)
                    .cloned()
                    .collect(),
            )
        })
        .collect()
}

impl JobDatabase for InMemoryJobDatabase {
    fn load(&mut self) -> StorageResult<Vec<FullSpec>> {
        self.snapshot()
    }

    fn insert_jobs(&mut self, specs: &[FullSpec]) -> StorageResult<()> {
        let mut tables = self.lock()?;
        tables.begin_write()?;

        let mut ids: HashSet<&JobId> = tables.jobs.iter().map(|job| &job.id).collect();
        for full in specs {
            if !ids.insert(full.id()) {
                return Err(StorageError::AlreadyExists(full.id().clone()));
            }
        }

        for full in specs {
            tables.jobs.push(full.job_spec.clone());
            for constraint in &full.constraint_specs {
                if !tables.constraints.contains(constraint) {
                    tables.constraints.push(constraint.clone());
                }
            }
            for dependency in &full.dependency_specs {
                if !tables.dependencies.contains(dependency) {
                    tables.dependencies.push(dependency.clone());
                }
            }
        }
        Ok(())
    }

    fn update_job_running_state(&mut self, id: &JobId, is_running: bool) -> StorageResult<()> {
        let mut tables = self.lock()?;
        tables.begin_write()?;
        tables.job_mut(id)?.is_running = is_running;
        Ok(())
    }

    fn update_job_after_retry(
        &mut self,
        id: &JobId,
        is_running: bool,
        run_attempt: u32,
        next_run_attempt_time: EpochMillis,
    ) -> StorageResult<()> {
        let mut tables = self.lock()?;
        tables.begin_write()?;
        let job = tables.job_mut(id)?;
        job.is_running = is_running;
        job.run_attempt = run_attempt;
        job.next_run_attempt_time = next_run_attempt_time;
        Ok(())
    }

    fn update_all_jobs_to_be_pending(&mut self) -> StorageResult<()> {
        let mut tables = self.lock()?;
        tables.begin_write()?;
        for job in &mut tables.jobs {
            job.is_running = false;
        }
        Ok(())
    }

    fn update_jobs(&mut self, specs: &[JobSpec]) -> StorageResult<()> {
        let mut tables = self.lock()?;
        tables.begin_write()?;
        for spec in specs {
            if !tables.jobs.iter().any(|job| job.id == spec.id) {
                return Err(StorageError::NotFound(spec.id.clone()));
            }
        }
        for spec in specs {
            *tables.job_mut(&spec.id)? = spec.clone();
        }
        Ok(())
    }

    fn delete_jobs(&mut self, ids: &[JobId]) -> StorageResult<()> {
        let mut tables = self.lock()?;
        tables.begin_write()?;
        let ids: HashSet<&JobId> = ids.iter().collect();
        tables.jobs.retain(|job| !ids.contains(&job.id));
        tables.constraints.retain(|c| !ids.contains(&c.job_id));
        tables.dependencies.retain(|d| !ids.contains(&d.job_id));
        Ok(())
    }

    fn delete_dependency_specs(&mut self, specs: &[DependencySpec]) -> StorageResult<()> {
        let mut tables = self.lock()?;
        tables.begin_write()?;
        tables
            .dependencies
            .retain(|d| !specs.iter().any(|s| s.job_id == d.job_id && s.depends_on_job_id == d.depends_on_job_id));
        Ok(())
    }

    fn schema_version(&mut self) -> StorageResult<u32> {
        Ok(self.lock()?.schema_version.unwrap_or(INITIAL_SCHEMA_VERSION))
    }

    fn set_schema_version(&mut self, version: u32) -> StorageResult<()> {
        let mut tables = self.lock()?;
        tables.begin_write()?;
        tables.schema_version = Some(version);
        Ok(())
    }
}
