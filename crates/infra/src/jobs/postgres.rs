//! Postgres-backed job store.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use pulse_core::{ExpectedVersion, JobId, UserId};

use super::store::{JobFilter, JobStore, JobStoreError};
use super::types::{Job, JobUsage};
use crate::db::{UNIQUE_VIOLATION, from_db_int, sqlstate, to_db_int};

const JOB_COLUMNS: &str = "id, user_id, kind, status, params, estimate, model_name, result_url, \
     result_text, error_message, usage, created_at, updated_at, started_at, completed_at, \
     deleted_at, version";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind), err)]
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, user_id, kind, status, params, estimate, model_name, result_url,
                result_text, error_message, usage, created_at, updated_at, started_at,
                completed_at, deleted_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(&job.params)
        .bind(to_db_int(job.estimate))
        .bind(&job.model_name)
        .bind(&job.result_url)
        .bind(&job.result_text)
        .bind(&job.error_message)
        .bind(job.usage.as_ref().map(Json))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.deleted_at)
        .bind(to_db_int(job.version))
        .execute(&self.pool)
        .await
        .map_err(|e| match sqlstate(&e).as_deref() {
            Some(UNIQUE_VIOLATION) => JobStoreError::AlreadyExists(job.id),
            _ => map_sqlx_error("insert_job", e),
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, status = %job.status, expected_version = ?expected),
        err
    )]
    async fn update(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        let expected_version = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(to_db_int(v)),
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs SET
                status = $2, model_name = $3, result_url = $4, result_text = $5,
                error_message = $6, usage = $7, updated_at = $8, started_at = $9,
                completed_at = $10, deleted_at = $11, version = version + 1
            WHERE id = $1 AND ($12::BIGINT IS NULL OR version = $12)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(&job.model_name)
        .bind(&job.result_url)
        .bind(&job.result_text)
        .bind(&job.error_message)
        .bind(job.usage.as_ref().map(Json))
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.deleted_at)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => match self.get(job.id).await? {
                Some(stored) => Err(JobStoreError::Concurrency(format!(
                    "job {} expected {:?}, found version {}",
                    job.id, expected, stored.version
                ))),
                None => Err(JobStoreError::NotFound(job.id)),
            },
        }
    }

    #[instrument(skip(self, filter), fields(user_id = %user_id, limit = filter.limit), err)]
    async fn list(&self, user_id: UserId, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE user_id = $1
              AND ($2::TEXT IS NULL OR kind = $2)
              AND ($3::TEXT IS NULL OR status = $3)
              AND ($4 OR deleted_at IS NULL)
            ORDER BY created_at DESC, id DESC
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(user_id.as_uuid())
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.include_deleted)
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(filter.offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));
    let parse = |e: pulse_core::DomainError| JobStoreError::Storage(e.to_string());

    let kind: String = row.try_get("kind").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let usage: Option<Json<JobUsage>> = row.try_get("usage").map_err(decode)?;
    let estimate: i64 = row.try_get("estimate").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(decode)?),
        kind: kind.parse().map_err(parse)?,
        status: status.parse().map_err(parse)?,
        params: row.try_get("params").map_err(decode)?,
        estimate: from_db_int(estimate),
        model_name: row.try_get("model_name").map_err(decode)?,
        result_url: row.try_get("result_url").map_err(decode)?,
        result_text: row.try_get("result_text").map_err(decode)?,
        error_message: row.try_get("error_message").map_err(decode)?,
        usage: usage.map(|u| u.0),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(decode)?,
        started_at: row.try_get("started_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        deleted_at: row.try_get("deleted_at").map_err(decode)?,
        version: from_db_int(version),
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
