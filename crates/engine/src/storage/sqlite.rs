//! SQLite-backed job database.
//!
//! Rows live in four tables:
//!
//! - `job_spec`: one row per durable job, `seq` preserves insertion order
//! - `constraint_spec`: `(job_id, factory_key)`
//! - `dependency_spec`: `(job_id, depends_on_job_id)`
//! - `job_meta`: scalar metadata, currently only the schema version
//!
//! The engine calls storage from plain threads, so this adapter owns a
//! single-threaded tokio runtime and blocks on each query. It must not be
//! used from inside another tokio runtime.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

use jobmanager_core::{ConstraintSpec, DependencySpec, EpochMillis, FullSpec, JobId, JobSpec};

use super::{JobDatabase, StorageError, StorageResult};
use crate::migration::INITIAL_SCHEMA_VERSION;
use crate::registry::FAILING_JOB_KEY;

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS job_spec (
        seq                   INTEGER PRIMARY KEY AUTOINCREMENT,
        id                    TEXT NOT NULL UNIQUE,
        factory_key           TEXT NOT NULL,
        queue_key             TEXT NULL,
        create_time           INTEGER NOT NULL,
        next_run_attempt_time INTEGER NOT NULL,
        run_attempt           INTEGER NOT NULL,
        max_attempts          INTEGER NULL,
        lifespan_ms           INTEGER NULL,
        initial_delay_ms      INTEGER NOT NULL,
        serialized_data       TEXT NOT NULL,
        is_running            INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS constraint_spec (
        job_id      TEXT NOT NULL,
        factory_key TEXT NOT NULL,
        UNIQUE (job_id, factory_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dependency_spec (
        job_id            TEXT NOT NULL,
        depends_on_job_id TEXT NOT NULL,
        UNIQUE (job_id, depends_on_job_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_meta (
        key   TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    )
    "#,
];

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// SQLite job database.
#[derive(Debug)]
pub struct SqliteJobDatabase {
    runtime: Runtime,
    pool: SqlitePool,
}

impl SqliteJobDatabase {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        debug!(path = %path.display(), "opening job database");
        Self::connect(options)
    }

    /// A private in-memory database, gone when this value is dropped.
    pub fn open_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        Self::connect(options)
    }

    fn connect(options: SqliteConnectOptions) -> StorageResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| StorageError::Database(format!("failed to create runtime: {err}")))?;

        // One long-lived connection: keeps an in-memory database alive and
        // serializes writers.
        let pool = runtime
            .block_on(async {
                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options)
                    .await
                    .context("failed to open job database")?;

                for statement in SCHEMA {
                    sqlx::query(statement)
                        .execute(&pool)
                        .await
                        .context("failed to create job tables")?;
                }
                Ok::<_, anyhow::Error>(pool)
            })
            .map_err(database_error)?;

        Ok(Self { runtime, pool })
    }

    fn run<T>(&self, op: impl Future<Output = anyhow::Result<T>>) -> StorageResult<T> {
        self.runtime.block_on(op).map_err(database_error)
    }
}

fn database_error(err: anyhow::Error) -> StorageError {
    StorageError::Database(format!("{err:#}"))
}

fn row_to_job_spec(row: &SqliteRow) -> anyhow::Result<JobSpec> {
    let id: String = row.try_get("id")?;
    let serialized: String = row.try_get("serialized_data")?;
    let run_attempt: i64 = row.try_get("run_attempt")?;
    let max_attempts: Option<i64> = row.try_get("max_attempts")?;

    Ok(JobSpec {
        serialized_data: serde_json::from_str(&serialized)
            .with_context(|| format!("corrupt payload for job {id}"))?,
        run_attempt: u32::try_from(run_attempt).context("run_attempt out of range")?,
        max_attempts: max_attempts
            .map(u32::try_from)
            .transpose()
            .context("max_attempts out of range")?,
        factory_key: row.try_get("factory_key")?,
        queue_key: row.try_get("queue_key")?,
        create_time: row.try_get("create_time")?,
        next_run_attempt_time: row.try_get("next_run_attempt_time")?,
        lifespan_ms: row.try_get("lifespan_ms")?,
        initial_delay_ms: row.try_get("initial_delay_ms")?,
        is_running: row.try_get("is_running")?,
        is_memory_only: false,
        id: JobId::from(id),
    })
}

/// Decode one `job_spec` row. A row that does not decode comes back as a
/// failing job with the same id and queue, so one bad row cannot keep the
/// others from loading. Rows without a readable id are skipped.
fn decode_job_row(row: &SqliteRow) -> Option<JobSpec> {
    let reason = match row_to_job_spec(row) {
        Ok(spec) => return Some(spec),
        Err(err) => format!("{err:#}"),
    };

    let Ok(id) = row.try_get::<String, _>("id") else {
        warn!(error = %reason, "skipping job row without a readable id");
        return None;
    };
    warn!(job_id = %id, error = %reason, "replacing undecodable job row with a failing job");

    let create_time = row.try_get::<EpochMillis, _>("create_time").unwrap_or(0);
    let mut spec = JobSpec::new(JobId::from(id), FAILING_JOB_KEY, create_time)
        .with_data(serde_json::json!({ "reason": reason }));
    if let Ok(Some(queue)) = row.try_get::<Option<String>, _>("queue_key") {
        spec = spec.with_queue(queue);
    }
    Some(spec)
}

impl JobDatabase for SqliteJobDatabase {
    fn load(&mut self) -> StorageResult<Vec<FullSpec>> {
        self.run(async {
            let job_rows = sqlx::query("SELECT * FROM job_spec ORDER BY seq")
                .fetch_all(&self.pool)
                .await
                .context("failed to load job_spec")?;
            let constraint_rows =
                sqlx::query("SELECT job_id, factory_key FROM constraint_spec ORDER BY rowid")
                    .fetch_all(&self.pool)
                    .await
                    .context("failed to load constraint_spec")?;
            let dependency_rows = sqlx::query(
                "SELECT job_id, depends_on_job_id FROM dependency_spec ORDER BY rowid",
            )
            .fetch_all(&self.pool)
            .await
            .context("failed to load dependency_spec")?;

            let mut constraints: HashMap<String, Vec<ConstraintSpec>> = HashMap::new();
            for row in &constraint_rows {
                let job_id: String = row.try_get("job_id")?;
                let key: String = row.try_get("factory_key")?;
                constraints
                    .entry(job_id.clone())
                    .or_default()
                    .push(ConstraintSpec::new(JobId::from(job_id), key));
            }

            let mut dependencies: HashMap<String, Vec<DependencySpec>> = HashMap::new();
            for row in &dependency_rows {
                let job_id: String = row.try_get("job_id")?;
                let depends_on: String = row.try_get("depends_on_job_id")?;
                dependencies
                    .entry(job_id.clone())
                    .or_default()
                    .push(DependencySpec::new(JobId::from(job_id), JobId::from(depends_on)));
            }

            let specs: Vec<FullSpec> = job_rows
                .iter()
                .filter_map(decode_job_row)
                .map(|spec| {
                    let constraint_specs = constraints.remove(spec.id.as_str()).unwrap_or_default();
                    let dependency_specs = dependencies.remove(spec.id.as_str()).unwrap_or_default();
                    FullSpec::new(spec, constraint_specs, dependency_specs)
                })
                .collect();
            Ok::<_, anyhow::Error>(specs)
        })
    }

    fn insert_jobs(&mut self, specs: &[FullSpec]) -> StorageResult<()> {
        self.run(async {
            let mut tx = self.pool.begin().await.context("failed to begin insert")?;

            for full in specs {
                let job = &full.job_spec;
                let payload = serde_json::to_string(&job.serialized_data)
                    .context("failed to serialize payload")?;
                sqlx::query(
                    r#"
                    INSERT INTO job_spec (
                        id,
                        factory_key,
                        queue_key,
                        create_time,
                        next_run_attempt_time,
                        run_attempt,
                        max_attempts,
                        lifespan_ms,
                        initial_delay_ms,
                        serialized_data,
                        is_running
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                    "#,
                )
                .bind(job.id.as_str())
                .bind(&job.factory_key)
                .bind(job.queue_key.as_deref())
                .bind(job.create_time)
                .bind(job.next_run_attempt_time)
                .bind(i64::from(job.run_attempt))
                .bind(job.max_attempts.map(i64::from))
                .bind(job.lifespan_ms)
                .bind(job.initial_delay_ms)
                .bind(payload)
                .bind(job.is_running)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to insert job {}", job.id))?;

                for constraint in &full.constraint_specs {
                    sqlx::query(
                        "INSERT OR IGNORE INTO constraint_spec (job_id, factory_key) VALUES (?1, ?2)",
                    )
                    .bind(constraint.job_id.as_str())
                    .bind(&constraint.factory_key)
                    .execute(&mut *tx)
                    .await
                    .context("failed to insert constraint_spec")?;
                }

                for dependency in &full.dependency_specs {
                    sqlx::query(
                        "INSERT OR IGNORE INTO dependency_spec (job_id, depends_on_job_id) VALUES (?1, ?2)",
                    )
                    .bind(dependency.job_id.as_str())
                    .bind(dependency.depends_on_job_id.as_str())
                    .execute(&mut *tx)
                    .await
                    .context("failed to insert dependency_spec")?;
                }
            }

            tx.commit().await.context("failed to commit insert")?;
            Ok::<_, anyhow::Error>(())
        })
    }

    fn update_job_running_state(&mut self, id: &JobId, is_running: bool) -> StorageResult<()> {
        let affected = self.run(async {
            let result = sqlx::query("UPDATE job_spec SET is_running = ?1 WHERE id = ?2")
                .bind(is_running)
                .bind(id.as_str())
                .execute(&self.pool)
                .await
                .context("failed to update running state")?;
            Ok::<_, anyhow::Error>(result.rows_affected())
        })?;
        if affected == 0 {
            return Err(StorageError::NotFound(id.clone()));
        }
        Ok(())
    }

    fn update_job_after_retry(
        &mut self,
        id: &JobId,
        is_running: bool,
        run_attempt: u32,
        next_run_attempt_time: EpochMillis,
    ) -> StorageResult<()> {
        let affected = self.run(async {
            let result = sqlx::query(
                r#"
                UPDATE job_spec
                SET is_running = ?1, run_attempt = ?2, next_run_attempt_time = ?3
                WHERE id = ?4
                "#,
            )
            .bind(is_running)
            .bind(i64::from(run_attempt))
            .bind(next_run_attempt_time)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .context("failed to update retry state")?;
            Ok::<_, anyhow::Error>(result.rows_affected())
        })?;
        if affected == 0 {
            return Err(StorageError::NotFound(id.clone()));
        }
        Ok(())
    }

    fn update_all_jobs_to_be_pending(&mut self) -> StorageResult<()> {
        self.run(async {
            sqlx::query("UPDATE job_spec SET is_running = 0 WHERE is_running != 0")
                .execute(&self.pool)
                .await
                .context("failed to reset running jobs")?;
            Ok::<_, anyhow::Error>(())
        })
    }

    fn update_jobs(&mut self, specs: &[JobSpec]) -> StorageResult<()> {
        self.run(async {
            let mut tx = self.pool.begin().await.context("failed to begin update")?;

            for job in specs {
                let payload = serde_json::to_string(&job.serialized_data)
                    .context("failed to serialize payload")?;
                let result = sqlx::query(
                    r#"
                    UPDATE job_spec
                    SET factory_key = ?1,
                        queue_key = ?2,
                        create_time = ?3,
                        next_run_attempt_time = ?4,
                        run_attempt = ?5,
                        max_attempts = ?6,
                        lifespan_ms = ?7,
                        initial_delay_ms = ?8,
                        serialized_data = ?9,
                        is_running = ?10
                    WHERE id = ?11
                    "#,
                )
                .bind(&job.factory_key)
                .bind(job.queue_key.as_deref())
                .bind(job.create_time)
                .bind(job.next_run_attempt_time)
                .bind(i64::from(job.run_attempt))
                .bind(job.max_attempts.map(i64::from))
                .bind(job.lifespan_ms)
                .bind(job.initial_delay_ms)
                .bind(payload)
                .bind(job.is_running)
                .bind(job.id.as_str())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to update job {}", job.id))?;

                if result.rows_affected() == 0 {
                    anyhow::bail!("job {} not found", job.id);
                }
            }

            tx.commit().await.context("failed to commit update")?;
            Ok::<_, anyhow::Error>(())
        })
    }

    fn delete_jobs(&mut self, ids: &[JobId]) -> StorageResult<()> {
        self.run(async {
            let mut tx = self.pool.begin().await.context("failed to begin delete")?;

            for id in ids {
                for statement in [
                    "DELETE FROM job_spec WHERE id = ?1",
                    "DELETE FROM constraint_spec WHERE job_id = ?1",
                    "DELETE FROM dependency_spec WHERE job_id = ?1",
                ] {
                    sqlx::query(statement)
                        .bind(id.as_str())
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("failed to delete job {id}"))?;
                }
            }

            tx.commit().await.context("failed to commit delete")?;
            Ok::<_, anyhow::Error>(())
        })
    }

    fn delete_dependency_specs(&mut self, specs: &[DependencySpec]) -> StorageResult<()> {
        self.run(async {
            let mut tx = self.pool.begin().await.context("failed to begin delete")?;

            for spec in specs {
                sqlx::query(
                    "DELETE FROM dependency_spec WHERE job_id = ?1 AND depends_on_job_id = ?2",
                )
                .bind(spec.job_id.as_str())
                .bind(spec.depends_on_job_id.as_str())
                .execute(&mut *tx)
                .await
                .context("failed to delete dependency_spec")?;
            }

            tx.commit().await.context("failed to commit delete")?;
            Ok::<_, anyhow::Error>(())
        })
    }

    fn schema_version(&mut self) -> StorageResult<u32> {
        self.run(async {
            let row = sqlx::query("SELECT value FROM job_meta WHERE key = ?1")
                .bind(SCHEMA_VERSION_KEY)
                .fetch_optional(&self.pool)
                .await
                .context("failed to read schema version")?;

            let version = match row {
                Some(row) => {
                    let value: i64 = row.try_get("value")?;
                    u32::try_from(value).context("schema version out of range")?
                }
                None => INITIAL_SCHEMA_VERSION,
            };
            Ok::<_, anyhow::Error>(version)
        })
    }

    fn set_schema_version(&mut self, version: u32) -> StorageResult<()> {
        self.run(async {
            sqlx::query(
                r#"
                INSERT INTO job_meta (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(SCHEMA_VERSION_KEY)
            .bind(i64::from(version))
            .execute(&self.pool)
            .await
            .context("failed to write schema version")?;
            Ok::<_, anyhow::Error>(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(id: &str, create_time: EpochMillis) -> FullSpec {
        FullSpec::new(
            JobSpec::new(JobId::from(id), "TestJob", create_time)
                .with_queue("q")
                .with_max_attempts(Some(3))
                .with_lifespan_ms(Some(60_000))
                .with_data(serde_json::json!({ "thread": 7 })),
            vec![ConstraintSpec::new(JobId::from(id), "Network")],
            Vec::new(),
        )
    }

    #[test]
    fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");

        {
            let mut db = SqliteJobDatabase::open(&path).unwrap();
            let mut b = full("b", 2);
            b.dependency_specs
                .push(DependencySpec::new(JobId::from("b"), JobId::from("a")));
            db.insert_jobs(&[full("a", 1), b]).unwrap();
            db.update_job_after_retry(&JobId::from("a"), true, 2, 900)
                .unwrap();
            db.set_schema_version(4).unwrap();
        }

        let mut db = SqliteJobDatabase::open(&path).unwrap();
        let rows = db.load().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].job_spec.id, JobId::from("a"));
        assert_eq!(rows[0].job_spec.run_attempt, 2);
        assert!(rows[0].job_spec.is_running);
        assert_eq!(rows[0].job_spec.serialized_data, serde_json::json!({ "thread": 7 }));
        assert_eq!(rows[0].job_spec.max_attempts, Some(3));
        assert_eq!(rows[0].constraint_specs.len(), 1);
        assert_eq!(rows[1].dependency_specs.len(), 1);
        assert_eq!(db.schema_version().unwrap(), 4);
    }

    #[test]
    fn failed_insert_rolls_back() {
        let mut db = SqliteJobDatabase::open_in_memory().unwrap();
        db.insert_jobs(&[full("a", 1)]).unwrap();

        let result = db.insert_jobs(&[full("b", 2), full("a", 3)]);
        assert!(matches!(result, Err(StorageError::Database(_))));
        assert_eq!(db.load().unwrap().len(), 1);
    }

    #[test]
    fn delete_removes_owned_rows_only() {
        let mut db = SqliteJobDatabase::open_in_memory().unwrap();
        let mut b = full("b", 2);
        b.dependency_specs
            .push(DependencySpec::new(JobId::from("b"), JobId::from("a")));
        db.insert_jobs(&[full("a", 1), b]).unwrap();

        db.delete_jobs(&[JobId::from("a")]).unwrap();

        let rows = db.load().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].dependency_specs.len(), 1);
    }

    #[test]
    fn update_of_missing_job_is_not_found() {
        let mut db = SqliteJobDatabase::open_in_memory().unwrap();
        assert_eq!(
            db.update_job_running_state(&JobId::from("nope"), true),
            Err(StorageError::NotFound(JobId::from("nope")))
        );
    }

    #[test]
    fn undecodable_rows_load_as_failing_jobs() {
        let mut db = SqliteJobDatabase::open_in_memory().unwrap();
        db.insert_jobs(&[full("good", 1), full("bad", 2), full("negative", 3)])
            .unwrap();
        db.run(async {
            sqlx::query("UPDATE job_spec SET serialized_data = '{not json' WHERE id = 'bad'")
                .execute(&db.pool)
                .await?;
            sqlx::query("UPDATE job_spec SET run_attempt = -1 WHERE id = 'negative'")
                .execute(&db.pool)
                .await?;
            Ok::<_, anyhow::Error>(())
        })
        .unwrap();

        let rows = db.load().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].job_spec.factory_key, "TestJob");

        for row in &rows[1..] {
            assert_eq!(row.job_spec.factory_key, FAILING_JOB_KEY);
            assert_eq!(row.job_spec.queue_key.as_deref(), Some("q"));
            assert!(row.job_spec.serialized_data["reason"].is_string());
        }
        assert_eq!(rows[1].job_spec.id, JobId::from("bad"));
        assert_eq!(rows[2].job_spec.id, JobId::from("negative"));
        assert_eq!(rows[1].constraint_specs.len(), 1);
    }

    #[test]
    fn cached_storage_starts_over_a_corrupt_row() {
        let mut db = SqliteJobDatabase::open_in_memory().unwrap();
        db.insert_jobs(&[full("good", 1), full("bad", 2)]).unwrap();
        db.run(async {
            sqlx::query("UPDATE job_spec SET serialized_data = '{not json' WHERE id = 'bad'")
                .execute(&db.pool)
                .await?;
            Ok::<_, anyhow::Error>(())
        })
        .unwrap();

        use crate::storage::{CachedJobStorage, JobStorage};

        let mut storage = CachedJobStorage::new(db);
        storage.init().unwrap();

        let bad = storage.get_job_spec(&JobId::from("bad")).unwrap();
        assert_eq!(bad.factory_key, FAILING_JOB_KEY);
        assert_eq!(storage.job_count(), 2);
    }

    #[test]
    fn fresh_database_is_at_initial_version() {
        let mut db = SqliteJobDatabase::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), INITIAL_SCHEMA_VERSION);
    }
}
