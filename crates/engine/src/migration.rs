//! Versioned migrations of persisted jobs.
//!
//! A migration is a plain function tagged with the schema version it produces.
//! At startup every migration newer than the stored schema version is applied,
//! in order, to every stored job, and the stored version is bumped after each
//! step. Re-running the chain over migrated storage is a no-op.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, info, warn};

use jobmanager_core::JobSpec;

use crate::registry::FAILING_JOB_KEY;
use crate::storage::{JobStorage, StorageError};

/// Schema version of storage that has never been migrated.
pub const INITIAL_SCHEMA_VERSION: u32 = 1;

/// The parts of a job a migration may rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct JobData {
    pub factory_key: String,
    pub queue_key: Option<String>,
    pub data: serde_json::Value,
}

impl JobData {
    pub fn from_spec(spec: &JobSpec) -> Self {
        Self {
            factory_key: spec.factory_key.clone(),
            queue_key: spec.queue_key.clone(),
            data: spec.serialized_data.clone(),
        }
    }

    /// `spec` with this data written over it.
    pub fn apply_to(self, spec: &JobSpec) -> JobSpec {
        let mut spec = spec.clone();
        spec.factory_key = self.factory_key;
        spec.queue_key = self.queue_key;
        spec.serialized_data = self.data;
        spec
    }

    /// Turn the job into one that fails on its first run, keeping its queue
    /// so queue order is preserved.
    pub fn failing(self) -> Self {
        let reason = format!("job of type {} could not be migrated", self.factory_key);
        Self {
            factory_key: FAILING_JOB_KEY.to_string(),
            queue_key: self.queue_key,
            data: serde_json::json!({ "reason": reason }),
        }
    }
}

pub type MigrateFn = Box<dyn Fn(JobData) -> JobData + Send + Sync>;

/// One step of the migration chain.
pub struct JobMigration {
    end_version: u32,
    migrate: MigrateFn,
}

impl JobMigration {
    pub fn new<F>(end_version: u32, migrate: F) -> Self
    where
        F: Fn(JobData) -> JobData + Send + Sync + 'static,
    {
        Self {
            end_version,
            migrate: Box::new(migrate),
        }
    }

    pub fn end_version(&self) -> u32 {
        self.end_version
    }

    /// Apply to one job. A panicking or malformed result becomes
    /// [`JobData::failing`].
    fn apply(&self, data: JobData) -> JobData {
        match catch_unwind(AssertUnwindSafe(|| (self.migrate)(data.clone()))) {
            Ok(migrated) if !migrated.factory_key.is_empty() => migrated,
            Ok(_) => {
                warn!(factory_key = %data.factory_key, end_version = self.end_version, "migration produced an empty factory key");
                data.failing()
            }
            Err(_) => {
                warn!(factory_key = %data.factory_key, end_version = self.end_version, "migration panicked");
                data.failing()
            }
        }
    }
}

impl fmt::Debug for JobMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobMigration")
            .field("end_version", &self.end_version)
            .finish_non_exhaustive()
    }
}

/// Migration error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MigrationError {
    #[error("migration versions must be contiguous: expected {expected}, found {found}")]
    NonContiguous { expected: u32, found: u32 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Ordered chain of migrations.
#[derive(Debug, Default)]
pub struct JobMigrator {
    migrations: Vec<JobMigration>,
}

impl JobMigrator {
    /// Build a chain. End versions must run 2, 3, 4, ... without gaps.
    pub fn new(mut migrations: Vec<JobMigration>) -> Result<Self, MigrationError> {
        migrations.sort_by_key(|m| m.end_version);
        for (index, migration) in migrations.iter().enumerate() {
            let expected = INITIAL_SCHEMA_VERSION + 1 + index as u32;
            if migration.end_version != expected {
                return Err(MigrationError::NonContiguous {
                    expected,
                    found: migration.end_version,
                });
            }
        }
        Ok(Self { migrations })
    }

    pub fn latest_version(&self) -> u32 {
        self.migrations
            .last()
            .map_or(INITIAL_SCHEMA_VERSION, |m| m.end_version)
    }

    /// Bring `storage` up to [`latest_version`](Self::latest_version).
    ///
    /// Returns the schema version storage ends up at.
    pub fn migrate<S: JobStorage + ?Sized>(&self, storage: &mut S) -> Result<u32, MigrationError> {
        let current = storage.schema_version()?;
        let latest = self.latest_version();

        if current > latest {
            warn!(current, latest, "stored job schema is newer than this build; leaving it untouched");
            return Ok(current);
        }
        if current == latest {
            debug!(version = current, "job schema up to date");
            return Ok(current);
        }

        for migration in self.migrations.iter().filter(|m| m.end_version > current) {
            let changed = storage.transform_jobs(&mut |spec| {
                let migrated = migration.apply(JobData::from_spec(spec));
                if migrated.factory_key == FAILING_JOB_KEY && spec.factory_key != FAILING_JOB_KEY {
                    warn!(job_id = %spec.id, factory_key = %spec.factory_key, "job replaced by failing job during migration");
                }
                migrated.apply_to(spec)
            })?;
            storage.set_schema_version(migration.end_version)?;
            info!(version = migration.end_version, changed, "applied job migration");
        }

        Ok(latest)
    }
}
