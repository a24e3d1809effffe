use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::driver::{ClaimMode, Driver};
use crate::error::Result;

use super::{BackfillRegistry, DEFAULT_MAX_RETRIES, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Succeeded,
    Failed(JobStatus),
}

/// Claims and performs background migration jobs.
///
/// Failed jobs are requeued with exponential backoff (`2^attempts` seconds)
/// and marked `failed` once they have been attempted `max_retries` times, so
/// a later finalize can report or steal them.
pub struct Worker<D: Driver> {
    id: String,
    driver: D,
    registry: Arc<BackfillRegistry>,
    sleep_duration: Duration,
    max_retries: i32,
}

impl<D: Driver> Worker<D> {
    pub fn new(driver: D, registry: Arc<BackfillRegistry>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            driver,
            registry,
            sleep_duration: Duration::from_secs(5),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    #[must_use]
    pub fn sleep_duration(mut self, sleep_duration: Duration) -> Self {
        self.sleep_duration = sleep_duration;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Runs at most one job. Does not sleep when the queue is empty.
    #[tracing::instrument(name = "worker.tick", skip(self), fields(worker.id = %self.id), err)]
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let Some(job) = self
            .driver
            .claim_job(None, &self.id, ClaimMode::Worker)
            .await?
        else {
            return Ok(TickOutcome::Idle);
        };

        let span = tracing::info_span!(
            "worker.run_job",
            job.id = %job.id,
            job.name = %job.job_name,
            job.table = %job.table_name,
            job.start = job.range.start,
            job.end = job.range.end,
            job.attempts = job.attempts,
        );

        match self
            .registry
            .perform(&mut self.driver, &job)
            .instrument(span)
            .await
        {
            Ok(rows) => {
                self.driver.complete_job(job.id, &self.id).await?;
                tracing::info!(worker.id = %self.id, job_id = %job.id, rows, "Job Ran");
                Ok(TickOutcome::Succeeded)
            }
            Err(err) => {
                let status = self
                    .driver
                    .fail_job(job.id, &self.id, &err.to_string(), self.max_retries)
                    .await?;

                if status == JobStatus::Failed {
                    tracing::error!(
                        worker.id = %self.id,
                        job_id = %job.id,
                        attempts = job.attempts,
                        max_retries = self.max_retries,
                        error_msg = %err,
                        "Job permanently failed - max retries exceeded"
                    );
                } else {
                    tracing::warn!(
                        worker.id = %self.id,
                        job_id = %job.id,
                        attempts = job.attempts,
                        error_msg = %err,
                        "Job Errored"
                    );
                }
                Ok(TickOutcome::Failed(status))
            }
        }
    }

    /// Polls the queue until `cancellation` fires. Stops between jobs, never
    /// in the middle of one.
    pub async fn run(mut self, cancellation: CancellationToken) -> Result<()> {
        self.driver.ensure_job_queue().await?;
        tracing::info!(worker.id = %self.id, "Background migration worker started");

        while !cancellation.is_cancelled() {
            let outcome = match self.tick().await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(worker.id = %self.id, error_msg = %err, "Worker tick failed");
                    TickOutcome::Idle
                }
            };

            if outcome == TickOutcome::Idle {
                let duration = self.sleep_duration;
                tracing::debug!(worker.id = %self.id, ?duration, "No Job to Run, sleeping for requested duration");
                tokio::select! {
                    () = cancellation.cancelled() => break,
                    () = tokio::time::sleep(duration) => {}
                }
            }
        }

        tracing::info!(worker.id = %self.id, "Background migration worker stopped");
        Ok(())
    }
}
