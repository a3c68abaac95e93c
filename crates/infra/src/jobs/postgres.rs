//! Postgres-backed job record store.
//!
//! Records are stored whole as JSONB next to the columns used for filtering.
//! Progress rows live in their own append-only table.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) on insert | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use bulkops_core::{JobId, JobStatus};

use super::store::{JobRecordStore, JobStats, JobStoreError, RecordFilter};
use super::types::{JobExecutionRecord, ProgressLogEntry};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bulk_job_records (
    job_id      TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    status      TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL,
    record      JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS bulk_job_records_status_idx ON bulk_job_records (status, created_at);

CREATE TABLE IF NOT EXISTS bulk_job_progress_logs (
    job_id               TEXT NOT NULL REFERENCES bulk_job_records (job_id) ON DELETE CASCADE,
    sequence             BIGINT NOT NULL,
    attempt              INTEGER NOT NULL,
    current_batch_number BIGINT NOT NULL,
    broadcasted          BOOLEAN NOT NULL DEFAULT FALSE,
    broadcasted_at       TIMESTAMPTZ,
    entry                JSONB NOT NULL,
    PRIMARY KEY (job_id, sequence)
);
"#;

/// Durable [`JobRecordStore`] over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PostgresJobRecordStore {
    pool: Arc<PgPool>,
}

impl PostgresJobRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url` with a small pool.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobRecordStore for PostgresJobRecordStore {
    #[instrument(skip(self, record), fields(job_id = %record.version), err)]
    async fn insert(&self, record: &JobExecutionRecord) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO bulk_job_records (job_id, kind, status, created_at, updated_at, record)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.version.as_str())
        .bind(&record.kind)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(to_json(record)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(record.version.clone())
            } else {
                map_sqlx_error("insert_record", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: &JobId) -> Result<Option<JobExecutionRecord>, JobStoreError> {
        let row = sqlx::query("SELECT record FROM bulk_job_records WHERE job_id = $1")
            .bind(job_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_record", e))?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    #[instrument(skip(self, record), fields(job_id = %record.version, status = %record.status), err)]
    async fn update(&self, record: &JobExecutionRecord) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE bulk_job_records
            SET status = $2, updated_at = $3, record = $4
            WHERE job_id = $1
            "#,
        )
        .bind(record.version.as_str())
        .bind(record.status.as_str())
        .bind(record.updated_at)
        .bind(to_json(record)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_record", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(record.version.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<JobExecutionRecord>, JobStoreError> {
        let limit = (filter.limit > 0).then_some(filter.limit as i64);
        let rows = sqlx::query(
            r#"
            SELECT record
            FROM bulk_job_records
            WHERE ($1::text IS NULL OR status = $1)
                AND ($2::text IS NULL OR kind = $2)
                AND ($3::timestamptz IS NULL OR updated_at < $3)
            ORDER BY created_at ASC, job_id ASC
            LIMIT $4
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.kind.as_deref())
        .bind(filter.updated_before)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_records", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self, entry), fields(job_id = %entry.job_id, batch = entry.current_batch_number), err)]
    async fn append_log(&self, mut entry: ProgressLogEntry) -> Result<ProgressLogEntry, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Serialize appenders for the job on its record row.
        sqlx::query("SELECT 1 FROM bulk_job_records WHERE job_id = $1 FOR UPDATE")
            .bind(entry.job_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_record", e))?
            .ok_or_else(|| JobStoreError::NotFound(entry.job_id.clone()))?;

        let last = sqlx::query(
            r#"
            SELECT sequence, attempt, current_batch_number
            FROM bulk_job_progress_logs
            WHERE job_id = $1
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(entry.job_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("last_log", e))?;

        let next_sequence = match &last {
            Some(row) => {
                let sequence: i64 = row.try_get("sequence").map_err(|e| map_sqlx_error("last_log", e))?;
                let attempt: i32 = row.try_get("attempt").map_err(|e| map_sqlx_error("last_log", e))?;
                let batch: i64 = row
                    .try_get("current_batch_number")
                    .map_err(|e| map_sqlx_error("last_log", e))?;
                let attempt = attempt as u32;
                let batch = batch as u64;
                if entry.attempt < attempt
                    || (entry.attempt == attempt && entry.current_batch_number < batch)
                {
                    return Err(JobStoreError::OutOfOrder {
                        job_id: entry.job_id,
                        last: batch,
                        got: entry.current_batch_number,
                    });
                }
                sequence as u64 + 1
            }
            None => 0,
        };
        entry.sequence = next_sequence;

        sqlx::query(
            r#"
            INSERT INTO bulk_job_progress_logs
                (job_id, sequence, attempt, current_batch_number, broadcasted, broadcasted_at, entry)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.job_id.as_str())
        .bind(entry.sequence as i64)
        .bind(entry.attempt as i32)
        .bind(entry.current_batch_number as i64)
        .bind(entry.broadcasted)
        .bind(entry.broadcasted_at)
        .bind(to_json(&entry)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_log", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(entry)
    }

    #[instrument(skip(self), err)]
    async fn mark_broadcasted(
        &self,
        job_id: &JobId,
        sequence: u64,
        at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE bulk_job_progress_logs
            SET broadcasted = TRUE,
                broadcasted_at = $3,
                entry = jsonb_set(jsonb_set(entry, '{broadcasted}', 'true'), '{broadcasted_at}', to_jsonb($3::timestamptz))
            WHERE job_id = $1 AND sequence = $2
            "#,
        )
        .bind(job_id.as_str())
        .bind(sequence as i64)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_broadcasted", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn recent_logs(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<ProgressLogEntry>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entry FROM (
                SELECT sequence, entry
                FROM bulk_job_progress_logs
                WHERE job_id = $1
                ORDER BY sequence DESC
                LIMIT $2
            ) recent
            ORDER BY sequence ASC
            "#,
        )
        .bind(job_id.as_str())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_logs", e))?;

        rows.iter()
            .map(|row| {
                let entry: serde_json::Value =
                    row.try_get("entry").map_err(|e| map_sqlx_error("recent_logs", e))?;
                serde_json::from_value(entry)
                    .map_err(|e| JobStoreError::Storage(format!("failed to deserialize log row: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM bulk_job_records GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("stats", e))?;
            let Some(status) = JobStatus::parse(&status) else {
                return Err(JobStoreError::Storage(format!("unknown status in store: {status}")));
            };
            stats.add(status, total as usize);
        }
        Ok(stats)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(value).map_err(|e| JobStoreError::Storage(format!("failed to serialize: {e}")))
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<JobExecutionRecord, JobStoreError> {
    let record: serde_json::Value = row
        .try_get("record")
        .map_err(|e| map_sqlx_error("read_record", e))?;
    serde_json::from_value(record)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job record: {e}")))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => JobStoreError::Timeout,
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
