use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Connection, PgConnection};
use uuid::Uuid;

use super::{BatchRange, ClaimMode, Driver, IndexStatus, NewJob};
use crate::background::{BackgroundJob, DEFAULT_LOCK_TIMEOUT, JobCounts, JobStatus};
use crate::error::{Error, Result};
use crate::migration::{MigrationId, MigrationRecord};
use crate::operation::Operation;
use crate::sql::{self, quote_ident};

const LOCK_NOT_AVAILABLE: &str = "55P03";
const UNDEFINED_TABLE: &str = "42P01";
const UNDEFINED_COLUMN: &str = "42703";
const UNDEFINED_OBJECT: &str = "42704";

/// Translates the SQLSTATEs the runner reacts to into typed errors.
fn map_error(err: sqlx::Error) -> Error {
    let Some(db_error) = err.as_database_error() else {
        return Error::Database(err);
    };
    let message = db_error.message().to_string();
    match db_error.code().as_deref() {
        Some(LOCK_NOT_AVAILABLE) => Error::LockNotAvailable(message),
        Some(UNDEFINED_TABLE | UNDEFINED_COLUMN | UNDEFINED_OBJECT) => {
            Error::MissingSchemaObject { object: message }
        }
        _ => Error::Database(err),
    }
}

fn millis(timeout: Option<Duration>) -> u128 {
    timeout.map_or(0, |t| t.as_millis())
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_name: String,
    table_name: String,
    batch_column: String,
    start_id: i64,
    end_id: i64,
    arguments: serde_json::Value,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    run_at: DateTime<Utc>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for BackgroundJob {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            job_name: row.job_name,
            table_name: row.table_name,
            batch_column: row.batch_column,
            range: BatchRange::new(row.start_id, row.end_id),
            arguments: row.arguments,
            status: row.status.parse()?,
            attempts: row.attempts,
            last_error: row.last_error,
            run_at: row.run_at,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            created_at: row.created_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, job_name, table_name, batch_column, start_id, end_id, arguments, \
     status, attempts, last_error, run_at, locked_by, locked_at, created_at";

/// A driver over one dedicated connection. Advisory locks and `SET LOCAL`
/// are session scoped, so the runner must not hop between pooled
/// connections.
#[derive(Debug)]
pub struct PgDriver {
    conn: PgConnection,
    transaction_open: bool,
}

impl PgDriver {
    pub fn new(conn: PgConnection) -> Self {
        Self {
            conn,
            transaction_open: false,
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let conn = PgConnection::connect(database_url).await?;
        Ok(Self::new(conn))
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    pub async fn close(self) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }

    async fn execute(&mut self, statement: &str) -> Result<u64> {
        tracing::trace!(statement, "Executing statement");
        sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(statement))
            .await
            .map(|result| result.rows_affected())
            .map_err(map_error)
    }
}

#[async_trait]
impl Driver for PgDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN").await?;
        self.transaction_open = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let result = self.execute("COMMIT").await;
        self.transaction_open = false;
        result.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<()> {
        let result = self.execute("ROLLBACK").await;
        self.transaction_open = false;
        result.map(|_| ())
    }

    fn transaction_open(&self) -> bool {
        self.transaction_open
    }

    async fn set_lock_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.execute(&format!(
            "SET LOCAL lock_timeout TO '{}ms'",
            millis(timeout)
        ))
        .await
        .map(|_| ())
    }

    async fn set_statement_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.execute(&format!("SET statement_timeout TO {}", millis(timeout)))
            .await
            .map(|_| ())
    }

    async fn reset_statement_timeout(&mut self) -> Result<()> {
        self.execute("RESET statement_timeout").await.map(|_| ())
    }

    async fn apply(&mut self, operation: &Operation) -> Result<u64> {
        let statement = sql::render(operation)?;
        self.execute(&statement).await
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        sqlx::query_scalar(
            "
            SELECT EXISTS (
                SELECT 1
                FROM pg_class c
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE c.relname = $1
                  AND c.relkind IN ('r', 'p')
                  AND n.nspname = current_schema()
            )
            ",
        )
        .bind(table)
        .fetch_one(&mut self.conn)
        .await
        .map_err(map_error)
    }

    async fn column_exists(&mut self, table: &str, column: &str) -> Result<bool> {
        sqlx::query_scalar(
            "
            SELECT EXISTS (
                SELECT 1
                FROM information_schema.columns
                WHERE table_schema = current_schema()
                  AND table_name = $1
                  AND column_name = $2
            )
            ",
        )
        .bind(table)
        .bind(column)
        .fetch_one(&mut self.conn)
        .await
        .map_err(map_error)
    }

    async fn column_is_nullable(&mut self, table: &str, column: &str) -> Result<bool> {
        let nullable: Option<bool> = sqlx::query_scalar(
            "
            SELECT is_nullable = 'YES'
            FROM information_schema.columns
            WHERE table_schema = current_schema()
              AND table_name = $1
              AND column_name = $2
            ",
        )
        .bind(table)
        .bind(column)
        .fetch_optional(&mut self.conn)
        .await
        .map_err(map_error)?;

        nullable.ok_or_else(|| Error::missing("column", table, column))
    }

    async fn index_status(&mut self, table: &str, index: &str) -> Result<Option<IndexStatus>> {
        let valid: Option<bool> = sqlx::query_scalar(
            "
            SELECT i.indisvalid
            FROM pg_index i
            JOIN pg_class ic ON ic.oid = i.indexrelid
            JOIN pg_class tc ON tc.oid = i.indrelid
            JOIN pg_namespace n ON n.oid = ic.relnamespace
            WHERE tc.relname = $1
              AND ic.relname = $2
              AND n.nspname = current_schema()
            ",
        )
        .bind(table)
        .bind(index)
        .fetch_optional(&mut self.conn)
        .await
        .map_err(map_error)?;

        Ok(valid.map(|valid| {
            if valid {
                IndexStatus::Valid
            } else {
                IndexStatus::Invalid
            }
        }))
    }

    async fn constraint_exists(&mut self, table: &str, name: &str) -> Result<bool> {
        sqlx::query_scalar(
            "
            SELECT EXISTS (
                SELECT 1
                FROM pg_constraint con
                JOIN pg_class c ON c.oid = con.conrelid
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE c.relname = $1
                  AND con.conname = $2
                  AND n.nspname = current_schema()
            )
            ",
        )
        .bind(table)
        .bind(name)
        .fetch_one(&mut self.conn)
        .await
        .map_err(map_error)
    }

    async fn row_count(&mut self, table: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
            .fetch_one(&mut self.conn)
            .await
            .map_err(map_error)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn key_batches(
        &mut self,
        table: &str,
        column: &str,
        batch_size: u64,
    ) -> Result<Vec<BatchRange>> {
        let column = quote_ident(column);
        let query = format!(
            "
            SELECT MIN(key) AS start_id, MAX(key) AS end_id
            FROM (
                SELECT {column}::bigint AS key,
                       (ROW_NUMBER() OVER (ORDER BY {column}) - 1) / $1 AS batch
                FROM {table}
                WHERE {column} IS NOT NULL
            ) keyed
            GROUP BY batch
            ORDER BY batch
            ",
            table = quote_ident(table),
        );

        let rows: Vec<(i64, i64)> = sqlx::query_as(&query)
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .fetch_all(&mut self.conn)
            .await
            .map_err(map_error)?;

        Ok(rows
            .into_iter()
            .map(|(start, end)| BatchRange::new(start, end))
            .collect())
    }

    async fn ensure_ledger(&mut self) -> Result<()> {
        self.execute(
            "
            CREATE TABLE IF NOT EXISTS _pgshift_migrations (
                version BIGINT NOT NULL,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (version, name)
            )
            ",
        )
        .await
        .map(|_| ())
    }

    async fn applied_migrations(&mut self) -> Result<Vec<MigrationRecord>> {
        let rows: Vec<(i64, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT version, name, applied_at FROM _pgshift_migrations ORDER BY version, name",
        )
        .fetch_all(&mut self.conn)
        .await
        .map_err(map_error)?;

        Ok(rows
            .into_iter()
            .map(|(version, name, applied_at)| MigrationRecord {
                id: MigrationId::new(version, name),
                applied_at,
            })
            .collect())
    }

    async fn insert_ledger_row(&mut self, id: &MigrationId) -> Result<()> {
        sqlx::query("INSERT INTO _pgshift_migrations (version, name) VALUES ($1, $2)")
            .bind(id.version)
            .bind(&id.name)
            .execute(&mut self.conn)
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn delete_ledger_row(&mut self, id: &MigrationId) -> Result<()> {
        sqlx::query("DELETE FROM _pgshift_migrations WHERE version = $1 AND name = $2")
            .bind(id.version)
            .bind(&id.name)
            .execute(&mut self.conn)
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn try_advisory_lock(&mut self, key: i64) -> Result<bool> {
        sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await
            .map_err(map_error)
    }

    async fn advisory_unlock(&mut self, key: i64) -> Result<bool> {
        sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await
            .map_err(map_error)
    }

    async fn ensure_job_queue(&mut self) -> Result<()> {
        self.execute(
            "
            CREATE TABLE IF NOT EXISTS _pgshift_background_jobs (
                id UUID PRIMARY KEY,
                job_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                batch_column TEXT NOT NULL,
                start_id BIGINT NOT NULL,
                end_id BIGINT NOT NULL,
                arguments JSONB NOT NULL DEFAULT 'null'::jsonb,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                locked_by TEXT,
                locked_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS index_pgshift_background_jobs_on_job_name_and_status
                ON _pgshift_background_jobs (job_name, status);
            ",
        )
        .await
        .map(|_| ())
    }

    async fn enqueue_jobs(&mut self, jobs: &[NewJob]) -> Result<Vec<Uuid>> {
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            let id = Uuid::new_v4();
            sqlx::query(
                "
                INSERT INTO _pgshift_background_jobs
                    (id, job_name, table_name, batch_column, start_id, end_id, arguments, run_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(id)
            .bind(&job.job_name)
            .bind(&job.table_name)
            .bind(&job.batch_column)
            .bind(job.range.start)
            .bind(job.range.end)
            .bind(&job.arguments)
            .bind(job.run_at)
            .execute(&mut self.conn)
            .await
            .map_err(map_error)?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn jobs_queued(
        &mut self,
        job_name: &str,
        table: &str,
        arguments: &serde_json::Value,
    ) -> Result<bool> {
        sqlx::query_scalar(
            "
            SELECT EXISTS (
                SELECT 1 FROM _pgshift_background_jobs
                WHERE job_name = $1 AND table_name = $2 AND arguments = $3
            )
            ",
        )
        .bind(job_name)
        .bind(table)
        .bind(arguments)
        .fetch_one(&mut self.conn)
        .await
        .map_err(map_error)
    }

    async fn claim_job(
        &mut self,
        job_name: Option<&str>,
        worker_id: &str,
        mode: ClaimMode,
    ) -> Result<Option<BackgroundJob>> {
        let claimable = match mode {
            ClaimMode::Worker => {
                "(status = 'pending' AND run_at <= NOW())
                 OR (status = 'running' AND locked_at < NOW() - make_interval(secs => $3))"
            }
            ClaimMode::Steal => "status IN ('pending', 'failed')",
        };
        let query = format!(
            "
            UPDATE _pgshift_background_jobs
            SET status = 'running', locked_by = $1, locked_at = NOW(), attempts = attempts + 1
            WHERE id = (
                SELECT id
                FROM _pgshift_background_jobs
                WHERE ($2::text IS NULL OR job_name = $2)
                  AND ({claimable})
                ORDER BY run_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "
        );

        let mut claim = sqlx::query_as::<_, JobRow>(&query)
            .bind(worker_id)
            .bind(job_name);
        if mode == ClaimMode::Worker {
            claim = claim.bind(DEFAULT_LOCK_TIMEOUT.as_secs_f64());
        }

        let row = claim
            .fetch_optional(&mut self.conn)
            .await
            .map_err(map_error)?;

        row.map(BackgroundJob::try_from).transpose()
    }

    async fn complete_job(&mut self, job_id: Uuid, worker_id: &str) -> Result<()> {
        sqlx::query(
            "
            UPDATE _pgshift_background_jobs
            SET status = 'succeeded', locked_by = NULL, locked_at = NULL
            WHERE id = $1 AND locked_by = $2
            ",
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&mut self.conn)
        .await
        .map_err(map_error)?;
        Ok(())
    }

    async fn fail_job(
        &mut self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        max_retries: i32,
    ) -> Result<JobStatus> {
        let status: Option<String> = sqlx::query_scalar(
            "
            UPDATE _pgshift_background_jobs
            SET locked_by = NULL,
                locked_at = NULL,
                last_error = $3,
                status = CASE WHEN attempts >= $4 THEN 'failed' ELSE 'pending' END,
                run_at = CASE
                    WHEN attempts >= $4 THEN run_at
                    ELSE NOW() + POWER(2, attempts) * interval '1 second'
                END
            WHERE id = $1 AND locked_by = $2
            RETURNING status
            ",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(error)
        .bind(max_retries)
        .fetch_optional(&mut self.conn)
        .await
        .map_err(map_error)?;

        status
            .ok_or_else(|| Error::Statement(format!("job {job_id} is not locked by {worker_id}")))?
            .parse()
    }

    async fn job_counts(&mut self, job_name: &str) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "
            SELECT status, COUNT(*)
            FROM _pgshift_background_jobs
            WHERE job_name = $1
            GROUP BY status
            ",
        )
        .bind(job_name)
        .fetch_all(&mut self.conn)
        .await
        .map_err(map_error)?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            counts.record(status.parse()?, count);
        }
        Ok(counts)
    }
}
