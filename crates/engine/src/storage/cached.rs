//! In-memory index over a write-through database.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, info, warn};

use jobmanager_core::{
    ConstraintSpec, DependencySpec, EpochMillis, FullSpec, JobId, JobSpec, MIGRATION_QUEUE_KEY,
    SpecError,
};

use super::{JobDatabase, JobStorage, StorageError, StorageResult};

#[derive(Debug)]
struct Entry {
    spec: JobSpec,
    seq: u64,
}

/// [`JobStorage`] that keeps every job in memory and writes through to `D`.
///
/// Each mutation is written to the database first; memory is only touched
/// once the database accepted the change.
#[derive(Debug)]
pub struct CachedJobStorage<D> {
    db: D,
    initialized: bool,
    schema_version: u32,
    next_seq: u64,
    jobs: HashMap<JobId, Entry>,
    /// (create_time, insertion sequence, id)
    order: BTreeSet<(EpochMillis, u64, JobId)>,
    constraints: HashMap<JobId, Vec<ConstraintSpec>>,
    /// Dependency rows keyed by the job that owns them.
    dependencies: HashMap<JobId, Vec<DependencySpec>>,
    /// depends_on_job_id → owning jobs
    dependents: HashMap<JobId, Vec<JobId>>,
    queue_counts: HashMap<String, usize>,
    factory_counts: HashMap<String, usize>,
}

impl<D: JobDatabase> CachedJobStorage<D> {
    pub fn new(db: D) -> Self {
        Self {
            db,
            initialized: false,
            schema_version: 0,
            next_seq: 0,
            jobs: HashMap::new(),
            order: BTreeSet::new(),
            constraints: HashMap::new(),
            dependencies: HashMap::new(),
            dependents: HashMap::new(),
            queue_counts: HashMap::new(),
            factory_counts: HashMap::new(),
        }
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    pub fn into_database(self) -> D {
        self.db
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    fn ensure_initialized(&self) -> StorageResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(StorageError::NotInitialized)
        }
    }

    fn clear(&mut self) {
        self.jobs.clear();
        self.order.clear();
        self.constraints.clear();
        self.dependencies.clear();
        self.dependents.clear();
        self.queue_counts.clear();
        self.factory_counts.clear();
        self.next_seq = 0;
    }

    fn ordered(&self) -> impl Iterator<Item = &JobSpec> + '_ {
        self.order
            .iter()
            .filter_map(|(_, _, id)| self.jobs.get(id).map(|entry| &entry.spec))
    }

    fn has_unresolved_dependency(&self, id: &JobId) -> bool {
        self.dependencies.get(id).is_some_and(|deps| {
            deps.iter()
                .any(|dep| self.jobs.contains_key(&dep.depends_on_job_id))
        })
    }

    fn eligible(&self, now: EpochMillis) -> Vec<&JobSpec> {
        if self.queue_counts.contains_key(MIGRATION_QUEUE_KEY) {
            return self
                .ordered()
                .find(|spec| spec.is_in_migration_queue())
                .filter(|spec| spec.is_due(now) && !self.has_unresolved_dependency(&spec.id))
                .into_iter()
                .collect();
        }

        let mut seen_queues: HashSet<&str> = HashSet::new();
        let mut eligible = Vec::new();
        for spec in self.ordered() {
            if let Some(queue) = spec.queue_key.as_deref() {
                if !seen_queues.insert(queue) {
                    continue;
                }
            }
            if !spec.is_due(now) || self.has_unresolved_dependency(&spec.id) {
                continue;
            }
            eligible.push(spec);
        }
        eligible
    }

    fn index(&mut self, full: FullSpec) {
        let FullSpec {
            job_spec,
            constraint_specs,
            dependency_specs,
        } = full;
        let id = job_spec.id.clone();
        let seq = self.next_seq;
        self.next_seq += 1;

        self.order.insert((job_spec.create_time, seq, id.clone()));
        if let Some(queue) = &job_spec.queue_key {
            *self.queue_counts.entry(queue.clone()).or_default() += 1;
        }
        *self
            .factory_counts
            .entry(job_spec.factory_key.clone())
            .or_default() += 1;

        if !constraint_specs.is_empty() {
            self.constraints.insert(id.clone(), constraint_specs);
        }
        if !dependency_specs.is_empty() {
            for dep in &dependency_specs {
                self.dependents
                    .entry(dep.depends_on_job_id.clone())
                    .or_default()
                    .push(id.clone());
            }
            self.dependencies.insert(id.clone(), dependency_specs);
        }

        self.jobs.insert(id, Entry {
            spec: job_spec,
            seq,
        });
    }

    fn unindex(&mut self, id: &JobId) {
        let Some(entry) = self.jobs.remove(id) else {
            return;
        };
        self.order
            .remove(&(entry.spec.create_time, entry.seq, id.clone()));
        if let Some(queue) = &entry.spec.queue_key {
            decrement(&mut self.queue_counts, queue);
        }
        decrement(&mut self.factory_counts, &entry.spec.factory_key);
        self.constraints.remove(id);
        if let Some(deps) = self.dependencies.remove(id) {
            for dep in deps {
                self.unlink_dependent(&dep.depends_on_job_id, id);
            }
        }
        // Rows of other jobs pointing at `id` stay; they are now satisfied.
    }

    fn unlink_dependent(&mut self, depends_on: &JobId, job_id: &JobId) {
        if let Some(owners) = self.dependents.get_mut(depends_on) {
            owners.retain(|owner| owner != job_id);
            if owners.is_empty() {
                self.dependents.remove(depends_on);
            }
        }
    }

    fn remove_dependency_row(&mut self, spec: &DependencySpec) {
        if let Some(deps) = self.dependencies.get_mut(&spec.job_id) {
            deps.retain(|d| d.depends_on_job_id != spec.depends_on_job_id);
            if deps.is_empty() {
                self.dependencies.remove(&spec.job_id);
            }
        }
        self.unlink_dependent(&spec.depends_on_job_id, &spec.job_id);
    }

    /// Dependency edges that close a cycle among jobs in storage.
    ///
    /// Iterative depth-first search from every job in created order; each back
    /// edge found is reported once. Removing all of them leaves a DAG.
    fn find_cycle_edges(&self) -> Vec<DependencySpec> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            InProgress,
            Done,
        }

        let mut marks: HashMap<&JobId, Mark> = HashMap::new();
        let mut back_edges = Vec::new();

        for (_, _, root) in &self.order {
            if marks.contains_key(root) {
                continue;
            }
            marks.insert(root, Mark::InProgress);
            let mut stack: Vec<(&JobId, usize)> = vec![(root, 0)];

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let edges = self
                    .dependencies
                    .get(node)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                if top.1 >= edges.len() {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                }
                let edge = &edges[top.1];
                top.1 += 1;

                let next = &edge.depends_on_job_id;
                if !self.jobs.contains_key(next) {
                    continue;
                }
                match marks.get(next) {
                    Some(Mark::InProgress) => back_edges.push(edge.clone()),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next, Mark::InProgress);
                        stack.push((next, 0));
                    }
                }
            }
        }

        back_edges
    }

    /// A deleted job whose id is still named by another job's dependency row.
    /// Taking that id again would turn the satisfied row back into a live edge.
    fn is_retired(&self, id: &JobId) -> bool {
        !self.jobs.contains_key(id) && self.dependents.contains_key(id)
    }

    fn entry_mut(&mut self, id: &JobId) -> StorageResult<&mut Entry> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    fn is_memory_only(&self, id: &JobId) -> StorageResult<bool> {
        self.jobs
            .get(id)
            .map(|entry| entry.spec.is_memory_only)
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }
}

fn decrement(counts: &mut HashMap<String, usize>, key: &str) {
    if let Some(count) = counts.get_mut(key) {
        *count -= 1;
        if *count == 0 {
            counts.remove(key);
        }
    }
}

/// The rows of `full` that belong in the database.
fn persisted_rows(full: &FullSpec) -> Option<FullSpec> {
    if full.job_spec.is_memory_only {
        return None;
    }
    Some(FullSpec::new(
        full.job_spec.clone(),
        full.constraint_specs
            .iter()
            .filter(|c| !c.is_memory_only)
            .cloned()
            .collect(),
        full.dependency_specs
            .iter()
            .filter(|d| !d.is_memory_only)
            .cloned()
            .collect(),
    ))
}

impl<D: JobDatabase> JobStorage for CachedJobStorage<D> {
    fn init(&mut self) -> StorageResult<()> {
        self.clear();
        self.initialized = false;

        let loaded = self.db.load()?;
        let schema_version = self.db.schema_version()?;
        let loaded_count = loaded.len();
        for full in loaded {
            self.index(full);
        }

        let cycles = self.find_cycle_edges();
        if !cycles.is_empty() {
            warn!(edges = cycles.len(), "removing circular job dependencies");
            self.db.delete_dependency_specs(&cycles)?;
            for edge in &cycles {
                debug!(job_id = %edge.job_id, depends_on = %edge.depends_on_job_id, "dropped dependency edge");
                self.remove_dependency_row(edge);
            }
        }

        self.schema_version = schema_version;
        self.initialized = true;
        info!(jobs = loaded_count, schema_version, "job storage initialized");
        Ok(())
    }

    fn insert_jobs(&mut self, specs: Vec<FullSpec>) -> StorageResult<()> {
        self.ensure_initialized()?;
        if specs.is_empty() {
            return Ok(());
        }

        let mut batch_ids = HashSet::with_capacity(specs.len());
        for full in &specs {
            full.validate()?;
            let id = full.id();
            if self.jobs.contains_key(id) || self.is_retired(id) || !batch_ids.insert(id) {
                return Err(StorageError::AlreadyExists(id.clone()));
            }
        }

        let persisted: Vec<FullSpec> = specs.iter().filter_map(persisted_rows).collect();
        if !persisted.is_empty() {
            self.db.insert_jobs(&persisted)?;
        }

        for full in specs {
            self.index(full);
        }
        Ok(())
    }

    fn get_job_spec(&self, id: &JobId) -> Option<JobSpec> {
        self.jobs.get(id).map(|entry| entry.spec.clone())
    }

    fn get_all_job_specs(&self) -> Vec<JobSpec> {
        self.ordered().cloned().collect()
    }

    fn get_constraint_specs(&self, id: &JobId) -> Vec<ConstraintSpec> {
        self.constraints.get(id).cloned().unwrap_or_default()
    }

    fn get_all_dependency_specs(&self) -> Vec<DependencySpec> {
        self.order
            .iter()
            .filter_map(|(_, _, id)| self.dependencies.get(id))
            .flatten()
            .cloned()
            .collect()
    }

    fn get_pending_jobs_with_no_dependencies_in_created_order(
        &self,
        now: EpochMillis,
    ) -> Vec<JobSpec> {
        self.eligible(now).into_iter().cloned().collect()
    }

    fn get_jobs_in_queue(&self, queue_key: &str) -> Vec<JobSpec> {
        self.ordered()
            .filter(|spec| spec.queue_key.as_deref() == Some(queue_key))
            .cloned()
            .collect()
    }

    fn get_eligible_job_count(&self, now: EpochMillis) -> usize {
        self.eligible(now).len()
    }

    fn are_queues_empty(&self, queue_keys: &[String]) -> bool {
        queue_keys
            .iter()
            .all(|key| !self.queue_counts.contains_key(key))
    }

    fn get_job_count_for_factory(&self, factory_key: &str) -> usize {
        self.factory_counts.get(factory_key).copied().unwrap_or(0)
    }

    fn update_job_running_state(&mut self, id: &JobId, is_running: bool) -> StorageResult<()> {
        self.ensure_initialized()?;
        if !self.is_memory_only(id)? {
            self.db.update_job_running_state(id, is_running)?;
        }
        self.entry_mut(id)?.spec.is_running = is_running;
        Ok(())
    }

    fn update_job_after_retry(
        &mut self,
        id: &JobId,
        is_running: bool,
        run_attempt: u32,
        next_run_attempt_time: EpochMillis,
    ) -> StorageResult<()> {
        self.ensure_initialized()?;
        if !self.is_memory_only(id)? {
            self.db
                .update_job_after_retry(id, is_running, run_attempt, next_run_attempt_time)?;
        }
        let spec = &mut self.entry_mut(id)?.spec;
        spec.is_running = is_running;
        spec.run_attempt = run_attempt;
        spec.next_run_attempt_time = next_run_attempt_time;
        Ok(())
    }

    fn update_all_jobs_to_be_pending(&mut self) -> StorageResult<()> {
        self.ensure_initialized()?;
        self.db.update_all_jobs_to_be_pending()?;
        let mut reset = 0usize;
        for entry in self.jobs.values_mut() {
            if entry.spec.is_running {
                entry.spec.is_running = false;
                reset += 1;
            }
        }
        if reset > 0 {
            info!(jobs = reset, "reset jobs left running by a previous process");
        }
        Ok(())
    }

    fn transform_jobs(
        &mut self,
        transform: &mut dyn FnMut(&JobSpec) -> JobSpec,
    ) -> StorageResult<usize> {
        self.ensure_initialized()?;

        let mut changed = Vec::new();
        for spec in self.ordered() {
            let updated = transform(spec);
            if &updated == spec {
                continue;
            }
            if updated.id != spec.id {
                return Err(SpecError::MismatchedJobId {
                    expected: spec.id.clone(),
                    found: updated.id,
                }
                .into());
            }
            updated.validate()?;
            changed.push(updated);
        }
        if changed.is_empty() {
            return Ok(0);
        }

        let persisted: Vec<JobSpec> = changed
            .iter()
            .filter(|spec| !spec.is_memory_only)
            .cloned()
            .collect();
        if !persisted.is_empty() {
            self.db.update_jobs(&persisted)?;
        }

        let count = changed.len();
        for updated in changed {
            let id = updated.id.clone();
            let Some(entry) = self.jobs.get_mut(&id) else {
                continue;
            };
            let old = std::mem::replace(&mut entry.spec, updated);
            let seq = entry.seq;
            let (new_queue, new_factory, new_time) = (
                entry.spec.queue_key.clone(),
                entry.spec.factory_key.clone(),
                entry.spec.create_time,
            );

            if old.create_time != new_time {
                self.order.remove(&(old.create_time, seq, id.clone()));
                self.order.insert((new_time, seq, id.clone()));
            }
            if old.queue_key != new_queue {
                if let Some(queue) = &old.queue_key {
                    decrement(&mut self.queue_counts, queue);
                }
                if let Some(queue) = new_queue {
                    *self.queue_counts.entry(queue).or_default() += 1;
                }
            }
            if old.factory_key != new_factory {
                decrement(&mut self.factory_counts, &old.factory_key);
                *self.factory_counts.entry(new_factory).or_default() += 1;
            }
        }
        Ok(count)
    }

    fn delete_jobs(&mut self, ids: &[JobId]) -> StorageResult<()> {
        self.ensure_initialized()?;
        let present: Vec<JobId> = ids
            .iter()
            .filter(|id| self.jobs.contains_key(*id))
            .cloned()
            .collect();
        if present.is_empty() {
            return Ok(());
        }

        let persisted: Vec<JobId> = present
            .iter()
            .filter(|id| self.jobs.get(*id).is_some_and(|e| !e.spec.is_memory_only))
            .cloned()
            .collect();
        if !persisted.is_empty() {
            self.db.delete_jobs(&persisted)?;
        }

        for id in &present {
            self.unindex(id);
        }
        Ok(())
    }

    fn get_dependency_specs_that_depend_on_job(&self, id: &JobId) -> Vec<DependencySpec> {
        let Some(owners) = self.dependents.get(id) else {
            return Vec::new();
        };
        owners
            .iter()
            .filter_map(|owner| self.dependencies.get(owner))
            .flatten()
            .filter(|dep| &dep.depends_on_job_id == id)
            .cloned()
            .collect()
    }

    fn schema_version(&self) -> StorageResult<u32> {
        self.ensure_initialized()?;
        Ok(self.schema_version)
    }

    fn set_schema_version(&mut self, version: u32) -> StorageResult<()> {
        self.ensure_initialized()?;
        self.db.set_schema_version(version)?;
        self.schema_version = version;
        Ok(())
    }
}
