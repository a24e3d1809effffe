//! Batched data migrations that run outside of the deploy.
//!
//! A step queues a [`BackgroundMigration`]; the table's key space is sliced
//! into ranges of `batch_size` keys and one job row is inserted per range.
//! Workers ([`worker::Worker`]) perform the jobs asynchronously. A later step
//! that depends on the data being migrated finalizes it, optionally stealing
//! (performing inline) whatever is still pending.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::instrument;
use uuid::Uuid;

use crate::driver::{BatchRange, ClaimMode, Driver, NewJob};
use crate::error::{Error, Result};
use crate::operation::{BackfillValue, Operation};

pub mod worker;

pub const DEFAULT_BATCH_SIZE: u64 = 1000;
pub const DEFAULT_MAX_RETRIES: i32 = 20;
/// How long a job may stay `running` before another worker reclaims it.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Statement(format!("unknown job status {other}"))),
        }
    }
}

/// One queued batch of a background migration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundJob {
    pub id: Uuid,
    pub job_name: String,
    pub table_name: String,
    pub batch_column: String,
    pub range: BatchRange,
    pub arguments: serde_json::Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

impl JobCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.succeeded + self.failed
    }

    pub fn unfinished(&self) -> i64 {
        self.pending + self.running + self.failed
    }

    pub(crate) fn record(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}

/// Handed back when a background migration is queued; a dependent step
/// awaits or finalizes it by job name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionToken {
    pub job: String,
    pub batches: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundMigration {
    pub job: String,
    pub table: String,
    pub batch_column: String,
    pub batch_size: u64,
    /// Delay between the scheduled start of consecutive batches.
    pub interval: Option<Duration>,
    pub arguments: serde_json::Value,
}

impl BackgroundMigration {
    pub fn new(job: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            table: table.into(),
            batch_column: "id".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            interval: None,
            arguments: serde_json::Value::Null,
        }
    }

    /// Queues the built-in [`UpdateColumnBackfill`].
    pub fn update_column(
        table: impl Into<String>,
        column: impl Into<String>,
        value: BackfillValue,
    ) -> Result<Self> {
        let arguments = serde_json::to_value(UpdateColumnBackfill {
            column: column.into(),
            value,
        })?;
        Ok(Self::new(UpdateColumnBackfill::NAME, table).arguments(arguments))
    }

    #[must_use]
    pub fn batch_column(mut self, column: impl Into<String>) -> Self {
        self.batch_column = column.into();
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    #[must_use]
    pub fn arguments(mut self, arguments: serde_json::Value) -> Self {
        self.arguments = arguments;
        self
    }
}

/// A batch data migration. The implementing type is the job's arguments,
/// deserialized from the queued row.
#[async_trait::async_trait]
pub trait Backfill: DeserializeOwned + Send + Sync + fmt::Debug + 'static {
    const NAME: &'static str;

    /// Migrates the rows in `job.range` and returns how many were touched.
    async fn perform(&self, driver: &mut dyn Driver, job: &BackgroundJob) -> Result<u64>;

    async fn perform_from_value(driver: &mut dyn Driver, job: &BackgroundJob) -> Result<u64> {
        let backfill: Self = serde_json::from_value(job.arguments.clone())?;
        backfill.perform(driver, job).await
    }
}

/// Sets a column over the job's key range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateColumnBackfill {
    pub column: String,
    pub value: BackfillValue,
}

#[async_trait::async_trait]
impl Backfill for UpdateColumnBackfill {
    const NAME: &'static str = "UpdateColumn";

    async fn perform(&self, driver: &mut dyn Driver, job: &BackgroundJob) -> Result<u64> {
        driver
            .apply(&Operation::UpdateColumn {
                table: job.table_name.clone(),
                column: self.column.clone(),
                value: self.value.clone(),
                batch_column: job.batch_column.clone(),
                range: Some(job.range),
            })
            .await
    }
}

#[async_trait::async_trait]
trait BackfillFn: Send + Sync {
    async fn perform(&self, driver: &mut dyn Driver, job: &BackgroundJob) -> Result<u64>;
}

struct BackfillAdapter<B>(PhantomData<fn() -> B>);

#[async_trait::async_trait]
impl<B: Backfill> BackfillFn for BackfillAdapter<B> {
    async fn perform(&self, driver: &mut dyn Driver, job: &BackgroundJob) -> Result<u64> {
        B::perform_from_value(driver, job).await
    }
}

/// Maps job names to [`Backfill`] implementations.
pub struct BackfillRegistry {
    backfills: HashMap<&'static str, Box<dyn BackfillFn>>,
}

impl fmt::Debug for BackfillRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.backfills.keys().collect();
        names.sort();
        f.debug_struct("BackfillRegistry")
            .field("backfills", &names)
            .finish()
    }
}

impl Default for BackfillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackfillRegistry {
    /// A registry with [`UpdateColumnBackfill`] registered.
    pub fn new() -> Self {
        let mut registry = Self {
            backfills: HashMap::new(),
        };
        registry.register::<UpdateColumnBackfill>();
        registry
    }

    pub fn register<B: Backfill>(&mut self) -> &mut Self {
        self.backfills
            .insert(B::NAME, Box::new(BackfillAdapter::<B>(PhantomData)));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backfills.contains_key(name)
    }

    pub async fn perform(&self, driver: &mut dyn Driver, job: &BackgroundJob) -> Result<u64> {
        let backfill = self
            .backfills
            .get(job.job_name.as_str())
            .ok_or_else(|| Error::UnknownBackfill(job.job_name.clone()))?;
        backfill.perform(driver, job).await
    }
}

/// Queues, steals and finalizes background migrations on behalf of the
/// executor.
#[derive(Debug, Clone)]
pub struct BackgroundJobBridge {
    registry: Arc<BackfillRegistry>,
    worker_id: String,
}

impl Default for BackgroundJobBridge {
    fn default() -> Self {
        Self::new(Arc::new(BackfillRegistry::new()))
    }
}

impl BackgroundJobBridge {
    pub fn new(registry: Arc<BackfillRegistry>) -> Self {
        Self {
            registry,
            worker_id: format!("migration-{}", Uuid::new_v4()),
        }
    }

    pub fn registry(&self) -> &Arc<BackfillRegistry> {
        &self.registry
    }

    #[instrument(
        name = "background.queue",
        skip(self, driver, migration),
        fields(job = %migration.job, table = %migration.table),
        err,
    )]
    pub async fn queue(
        &self,
        driver: &mut dyn Driver,
        migration: &BackgroundMigration,
    ) -> Result<CompletionToken> {
        if !self.registry.contains(&migration.job) {
            return Err(Error::UnknownBackfill(migration.job.clone()));
        }
        if !driver.table_exists(&migration.table).await? {
            return Err(Error::missing_table(&migration.table));
        }
        if !driver
            .column_exists(&migration.table, &migration.batch_column)
            .await?
        {
            return Err(Error::missing(
                "column",
                &migration.table,
                &migration.batch_column,
            ));
        }

        driver.ensure_job_queue().await?;

        let ranges = driver
            .key_batches(
                &migration.table,
                &migration.batch_column,
                migration.batch_size.max(1),
            )
            .await?;

        let now = Utc::now();
        let interval = migration
            .interval
            .and_then(|interval| chrono::Duration::from_std(interval).ok())
            .unwrap_or_else(chrono::Duration::zero);

        let jobs: Vec<NewJob> = ranges
            .into_iter()
            .zip(0_i32..)
            .map(|(range, index)| NewJob {
                job_name: migration.job.clone(),
                table_name: migration.table.clone(),
                batch_column: migration.batch_column.clone(),
                range,
                arguments: migration.arguments.clone(),
                run_at: now + interval * index,
            })
            .collect();

        let ids = driver.enqueue_jobs(&jobs).await?;
        tracing::info!(batches = ids.len(), "Queued background migration");

        Ok(CompletionToken {
            job: migration.job.clone(),
            batches: ids.len(),
        })
    }

    pub async fn counts(&self, driver: &mut dyn Driver, job: &str) -> Result<JobCounts> {
        driver.ensure_job_queue().await?;
        driver.job_counts(job).await
    }

    /// Performs every unfinished job of `job` inline, including failed ones.
    /// A job that fails again is marked failed and the error is returned.
    #[instrument(name = "background.steal", skip(self, driver), err)]
    pub async fn steal(&self, driver: &mut dyn Driver, job: &str) -> Result<usize> {
        driver.ensure_job_queue().await?;

        let mut performed = 0;
        while let Some(claimed) = driver
            .claim_job(Some(job), &self.worker_id, ClaimMode::Steal)
            .await?
        {
            match self.registry.perform(driver, &claimed).await {
                Ok(rows) => {
                    driver.complete_job(claimed.id, &self.worker_id).await?;
                    tracing::debug!(job.id = %claimed.id, rows, "Stole background job");
                    performed += 1;
                }
                Err(err) => {
                    driver
                        .fail_job(claimed.id, &self.worker_id, &err.to_string(), 0)
                        .await?;
                    return Err(err);
                }
            }
        }

        if performed > 0 {
            tracing::info!(performed, "Stole pending background jobs");
        }
        Ok(performed)
    }

    /// Ensures every batch of `job` has succeeded, stealing first when asked.
    #[instrument(name = "background.finalize", skip(self, driver), err)]
    pub async fn finalize(&self, driver: &mut dyn Driver, job: &str, steal: bool) -> Result<()> {
        if steal {
            self.steal(driver, job).await?;
        }

        let counts = self.counts(driver, job).await?;
        if counts.unfinished() > 0 {
            return Err(partial(job, counts));
        }
        Ok(())
    }

    /// Polls until every batch of the token's job has finished. Fails with
    /// [`Error::PartialBackfill`] once jobs have failed permanently or
    /// `timeout` elapses.
    pub async fn wait_for(
        &self,
        driver: &mut dyn Driver,
        token: &CompletionToken,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<JobCounts> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let counts = self.counts(driver, &token.job).await?;
            if counts.unfinished() == 0 {
                return Ok(counts);
            }
            let in_flight = counts.pending + counts.running;
            if in_flight == 0 || tokio::time::Instant::now() >= deadline {
                return Err(partial(&token.job, counts));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

fn partial(job: &str, counts: JobCounts) -> Error {
    Error::PartialBackfill {
        job: job.to_string(),
        pending: counts.pending + counts.running,
        failed: counts.failed,
    }
}
