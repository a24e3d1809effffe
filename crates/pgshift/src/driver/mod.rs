//! The database seam.
//!
//! Everything the runner does to a database goes through [`Driver`]: schema
//! changes, introspection for operation guards, the version ledger, advisory
//! locks and the background job queue.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::background::{BackgroundJob, JobCounts, JobStatus};
use crate::error::Result;
use crate::migration::{MigrationId, MigrationRecord};
use crate::operation::Operation;

mod memory;
mod postgres;

pub use memory::{MemoryDriver, Row, SchemaShape};
pub use postgres::PgDriver;

/// An inclusive range of batch keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRange {
    pub start: i64,
    pub end: i64,
}

impl BatchRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, key: i64) -> bool {
        self.start <= key && key <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Valid,
    /// Left behind by a failed `CREATE INDEX CONCURRENTLY`; maintained on
    /// writes but never used by the planner.
    Invalid,
}

impl IndexStatus {
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// Pending jobs whose `run_at` has passed, plus running jobs whose worker
    /// stopped heartbeating.
    Worker,
    /// Every unfinished job, including failed ones and those scheduled for
    /// later.
    Steal,
}

/// A job row to insert into the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_name: String,
    pub table_name: String,
    pub batch_column: String,
    pub range: BatchRange,
    pub arguments: serde_json::Value,
    pub run_at: DateTime<Utc>,
}

#[async_trait]
pub trait Driver: Send {
    /// Short name used in logs and [`crate::Error::Unsupported`].
    fn name(&self) -> &'static str;

    async fn begin(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;
    fn transaction_open(&self) -> bool;

    /// `SET LOCAL lock_timeout`; only meaningful inside a transaction.
    async fn set_lock_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;
    /// `None` disables the timeout for the session (`SET statement_timeout TO 0`).
    async fn set_statement_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;
    async fn reset_statement_timeout(&mut self) -> Result<()>;

    /// Runs a single operation and returns the affected row count.
    async fn apply(&mut self, operation: &Operation) -> Result<u64>;

    async fn table_exists(&mut self, table: &str) -> Result<bool>;
    async fn column_exists(&mut self, table: &str, column: &str) -> Result<bool>;
    async fn column_is_nullable(&mut self, table: &str, column: &str) -> Result<bool>;
    async fn index_status(&mut self, table: &str, index: &str) -> Result<Option<IndexStatus>>;
    async fn constraint_exists(&mut self, table: &str, name: &str) -> Result<bool>;
    async fn row_count(&mut self, table: &str) -> Result<u64>;
    /// Splits the key space of `table.column` into consecutive ranges of at
    /// most `batch_size` rows each, in ascending key order.
    async fn key_batches(
        &mut self,
        table: &str,
        column: &str,
        batch_size: u64,
    ) -> Result<Vec<BatchRange>>;

    async fn ensure_ledger(&mut self) -> Result<()>;
    async fn applied_migrations(&mut self) -> Result<Vec<MigrationRecord>>;
    async fn insert_ledger_row(&mut self, id: &MigrationId) -> Result<()>;
    async fn delete_ledger_row(&mut self, id: &MigrationId) -> Result<()>;

    async fn try_advisory_lock(&mut self, key: i64) -> Result<bool>;
    async fn advisory_unlock(&mut self, key: i64) -> Result<bool>;

    async fn ensure_job_queue(&mut self) -> Result<()>;
    async fn enqueue_jobs(&mut self, jobs: &[NewJob]) -> Result<Vec<Uuid>>;
    /// Whether any job, in any status, was queued for this job name, table
    /// and arguments.
    async fn jobs_queued(
        &mut self,
        job_name: &str,
        table: &str,
        arguments: &serde_json::Value,
    ) -> Result<bool>;
    async fn claim_job(
        &mut self,
        job_name: Option<&str>,
        worker_id: &str,
        mode: ClaimMode,
    ) -> Result<Option<BackgroundJob>>;
    async fn complete_job(&mut self, job_id: Uuid, worker_id: &str) -> Result<()>;
    /// Requeues the job with exponential backoff, or marks it failed once it
    /// has been attempted `max_retries` times. Returns the new status.
    async fn fail_job(
        &mut self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        max_retries: i32,
    ) -> Result<JobStatus>;
    async fn job_counts(&mut self, job_name: &str) -> Result<JobCounts>;
}

/// Seconds to wait before the next attempt of a job that has failed
/// `attempts` times.
pub(crate) fn retry_backoff(attempts: i32) -> chrono::Duration {
    chrono::Duration::seconds(2_i64.saturating_pow(attempts.clamp(0, 20).unsigned_abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_range_is_inclusive() {
        let range = BatchRange::new(10, 20);
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(21));
    }

    #[test]
    fn retry_backoff_doubles() {
        assert_eq!(retry_backoff(1), chrono::Duration::seconds(2));
        assert_eq!(retry_backoff(2), chrono::Duration::seconds(4));
        assert_eq!(retry_backoff(5), chrono::Duration::seconds(32));
    }
}
