//! Postgres-backed metadata store.
//!
//! ## Atomic conditional updates
//!
//! `conditional_update` runs in a transaction that locks the row
//! (`SELECT … FOR UPDATE`), evaluates the update with the same domain code the
//! in-memory store uses, and writes the result back. Concurrent updates of one
//! job serialize on the row lock; the loser re-reads the committed row and
//! sees its condition fail.
//!
//! ## Error mapping
//!
//! | SQLx error | Postgres code | StoreError |
//! |------------|---------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert only) |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / other | n/a | `Storage` |

use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{Span, instrument};

use annoflow_core::{ArchiveId, ConditionalUpdate, Job, JobId, JobStatus, ObjectRef, UserId};

use super::{MetadataStore, StoreError};

/// Schema for the job table and its user index.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id                  TEXT PRIMARY KEY,
    user_id                 TEXT NOT NULL,
    input_file_name         TEXT NOT NULL,
    s3_inputs_bucket        TEXT NOT NULL,
    s3_key_input_file       TEXT NOT NULL,
    submit_time             BIGINT NOT NULL,
    job_status              TEXT NOT NULL CHECK (job_status IN ('PENDING', 'RUNNING', 'COMPLETED')),
    s3_results_bucket       TEXT,
    s3_key_result_file      TEXT,
    s3_log_bucket           TEXT,
    s3_key_log_file         TEXT,
    complete_time           BIGINT,
    archived                BOOLEAN NOT NULL DEFAULT FALSE,
    results_file_archive_id TEXT,
    CHECK (archived = (results_file_archive_id IS NOT NULL))
);
CREATE INDEX IF NOT EXISTS jobs_user_id_idx ON jobs (user_id);
CREATE INDEX IF NOT EXISTS jobs_status_submit_idx ON jobs (job_status, submit_time);
"#;

const SELECT_COLUMNS: &str = r#"
    job_id, user_id, input_file_name, s3_inputs_bucket, s3_key_input_file,
    submit_time, job_status, s3_results_bucket, s3_key_result_file,
    s3_log_bucket, s3_key_log_file, complete_time, archived, results_file_archive_id
"#;

/// Postgres-backed job table.
///
/// The trait is synchronous; calls are driven on the captured runtime handle,
/// so they must come from threads outside that runtime (the worker threads).
#[derive(Debug, Clone)]
pub struct PostgresMetadataStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresMetadataStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Connect a small pool on `handle`.
    pub fn connect(database_url: &str, handle: Handle) -> Result<Self, StoreError> {
        let pool = handle
            .block_on(
                PgPoolOptions::new()
                    .max_connections(8)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, handle))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and indexes if missing.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.handle.block_on(async {
            sqlx::raw_sql(SCHEMA)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            Ok(())
        })
    }

    /// Fail unless the job table exists.
    pub fn verify_schema(&self) -> Result<(), StoreError> {
        self.handle.block_on(async {
            let row = sqlx::query("SELECT to_regclass('jobs') IS NOT NULL AS present")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("verify_schema", e))?;
            let present: bool = row
                .try_get("present")
                .map_err(|e| map_sqlx_error("verify_schema", e))?;
            if present {
                Ok(())
            } else {
                Err(StoreError::Storage("table `jobs` does not exist".to_string()))
            }
        })
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id, user_id = %job.user_id), err)]
    pub async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        job.check_invariants()
            .map_err(|e| StoreError::from_domain(&job.job_id, e))?;

        let row = JobRow::from(job);
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, user_id, input_file_name, s3_inputs_bucket, s3_key_input_file,
                submit_time, job_status, s3_results_bucket, s3_key_result_file,
                s3_log_bucket, s3_key_log_file, complete_time, archived, results_file_archive_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&row.job_id)
        .bind(&row.user_id)
        .bind(&row.input_file_name)
        .bind(&row.s3_inputs_bucket)
        .bind(&row.s3_key_input_file)
        .bind(row.submit_time)
        .bind(&row.job_status)
        .bind(&row.s3_results_bucket)
        .bind(&row.s3_key_result_file)
        .bind(&row.s3_log_bucket)
        .bind(&row.s3_key_log_file)
        .bind(row.complete_time)
        .bind(row.archived)
        .bind(&row.results_file_archive_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(job.job_id.clone())
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn load_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE job_id = $1"))
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_job", e))?;
        row.map(|r| decode_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(user_id = %user_id, job_count = tracing::field::Empty), err)]
    pub async fn load_user_jobs(&self, user_id: &UserId) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM jobs WHERE user_id = $1 ORDER BY job_id"
        ))
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_user_jobs", e))?;

        let jobs = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("job_count", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self, update), fields(job_id = %job_id), err)]
    pub async fn update_job(&self, job_id: &JobId, update: &ConditionalUpdate) -> Result<Job, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut job = match lock_job(&mut tx, job_id).await? {
            Some(job) => job,
            None => {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(StoreError::NotFound(job_id.clone()));
            }
        };

        if let Err(e) = update.apply(&mut job) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::from_domain(job_id, e));
        }

        let row = JobRow::from(&job);
        sqlx::query(
            r#"
            UPDATE jobs SET
                job_status = $2,
                s3_results_bucket = $3,
                s3_key_result_file = $4,
                s3_log_bucket = $5,
                s3_key_log_file = $6,
                complete_time = $7,
                archived = $8,
                results_file_archive_id = $9
            WHERE job_id = $1
            "#,
        )
        .bind(&row.job_id)
        .bind(&row.job_status)
        .bind(&row.s3_results_bucket)
        .bind(&row.s3_key_result_file)
        .bind(&row.s3_log_bucket)
        .bind(&row.s3_key_log_file)
        .bind(row.complete_time)
        .bind(row.archived)
        .bind(&row.results_file_archive_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self), fields(status = %status), err)]
    pub async fn load_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM jobs WHERE job_status = $1 ORDER BY submit_time, job_id LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_by_status", e))?;
        rows.iter().map(decode_row).collect()
    }
}

impl MetadataStore for PostgresMetadataStore {
    fn create(&self, job: &Job) -> Result<(), StoreError> {
        self.handle.block_on(self.insert_job(job))
    }

    fn get(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        self.handle.block_on(self.load_job(job_id))
    }

    fn jobs_for_user(&self, user_id: &UserId) -> Result<Vec<Job>, StoreError> {
        self.handle.block_on(self.load_user_jobs(user_id))
    }

    fn conditional_update(&self, job_id: &JobId, update: &ConditionalUpdate) -> Result<Job, StoreError> {
        self.handle.block_on(self.update_job(job_id, update))
    }

    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.handle.block_on(self.load_by_status(status, limit))
    }
}

async fn lock_job(tx: &mut Transaction<'_, Postgres>, job_id: &JobId) -> Result<Option<Job>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM jobs WHERE job_id = $1 FOR UPDATE"
    ))
    .bind(job_id.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_job", e))?;
    row.map(|r| decode_row(&r)).transpose()
}

fn decode_row(row: &PgRow) -> Result<Job, StoreError> {
    let raw = JobRow::from_row(row)
        .map_err(|e| StoreError::Storage(format!("failed to deserialize job row: {e}")))?;
    raw.into_job()
}

#[derive(Debug)]
struct JobRow {
    job_id: String,
    user_id: String,
    input_file_name: String,
    s3_inputs_bucket: String,
    s3_key_input_file: String,
    submit_time: i64,
    job_status: String,
    s3_results_bucket: Option<String>,
    s3_key_result_file: Option<String>,
    s3_log_bucket: Option<String>,
    s3_key_log_file: Option<String>,
    complete_time: Option<i64>,
    archived: bool,
    results_file_archive_id: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            job_id: row.try_get("job_id")?,
            user_id: row.try_get("user_id")?,
            input_file_name: row.try_get("input_file_name")?,
            s3_inputs_bucket: row.try_get("s3_inputs_bucket")?,
            s3_key_input_file: row.try_get("s3_key_input_file")?,
            submit_time: row.try_get("submit_time")?,
            job_status: row.try_get("job_status")?,
            s3_results_bucket: row.try_get("s3_results_bucket")?,
            s3_key_result_file: row.try_get("s3_key_result_file")?,
            s3_log_bucket: row.try_get("s3_log_bucket")?,
            s3_key_log_file: row.try_get("s3_key_log_file")?,
            complete_time: row.try_get("complete_time")?,
            archived: row.try_get("archived")?,
            results_file_archive_id: row.try_get("results_file_archive_id")?,
        })
    }
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        JobRow {
            job_id: job.job_id.to_string(),
            user_id: job.user_id.to_string(),
            input_file_name: job.input_file_name.clone(),
            s3_inputs_bucket: job.input.bucket.clone(),
            s3_key_input_file: job.input.key.clone(),
            submit_time: job.submit_time,
            job_status: job.status.as_str().to_string(),
            s3_results_bucket: job.result.as_ref().map(|r| r.bucket.clone()),
            s3_key_result_file: job.result.as_ref().map(|r| r.key.clone()),
            s3_log_bucket: job.log.as_ref().map(|r| r.bucket.clone()),
            s3_key_log_file: job.log.as_ref().map(|r| r.key.clone()),
            complete_time: job.complete_time,
            archived: job.archived,
            results_file_archive_id: job.result_archive_id.as_ref().map(|a| a.to_string()),
        }
    }
}

impl JobRow {
    fn into_job(self) -> Result<Job, StoreError> {
        let corrupt = |what: &str, e: annoflow_core::DomainError| {
            StoreError::Storage(format!("corrupt job row {}: {what}: {e}", self.job_id))
        };
        let job_id = JobId::parse(self.job_id.clone()).map_err(|e| corrupt("job_id", e))?;
        let user_id = UserId::parse(self.user_id.clone()).map_err(|e| corrupt("user_id", e))?;
        let status: JobStatus = self.job_status.parse().map_err(|e| corrupt("job_status", e))?;
        let result_archive_id = self
            .results_file_archive_id
            .clone()
            .map(ArchiveId::parse)
            .transpose()
            .map_err(|e| corrupt("results_file_archive_id", e))?;

        Ok(Job {
            job_id,
            user_id,
            input_file_name: self.input_file_name,
            input: ObjectRef::new(self.s3_inputs_bucket, self.s3_key_input_file),
            submit_time: self.submit_time,
            status,
            result: object_ref(self.s3_results_bucket, self.s3_key_result_file),
            log: object_ref(self.s3_log_bucket, self.s3_key_log_file),
            complete_time: self.complete_time,
            archived: self.archived,
            result_archive_id,
        })
    }
}

fn object_ref(bucket: Option<String>, key: Option<String>) -> Option<ObjectRef> {
    match (bucket, key) {
        (Some(bucket), Some(key)) => Some(ObjectRef::new(bucket, key)),
        _ => None,
    }
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {operation}")),
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
