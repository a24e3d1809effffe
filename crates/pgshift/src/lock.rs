//! Runner-level mutual exclusion and table lock retries.
//!
//! Only one runner may migrate a database at a time; this is enforced with a
//! session advisory lock held for the whole batch. Individual schema changes
//! that need a brief `ACCESS EXCLUSIVE` lock on a busy table run in
//! [`LockCoordinator::with_lock_retries`]: each attempt is its own
//! transaction with a short `lock_timeout`, and contention rolls back, sleeps
//! and tries again instead of queueing behind long-running queries (and
//! blocking every query queued behind us).

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::driver::Driver;
use crate::error::{Error, Result};

pub const DEFAULT_ADVISORY_LOCK_ID: i64 = 0xDB_DB_DB_DB_DB_DB_DB;

const MAX_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// `(lock_timeout, sleep)` pairs in milliseconds. Short timeouts first; the
/// longer waits assume a high-traffic table.
const DEFAULT_TIMINGS: [(u64, u64); 11] = [
    (100, 50),
    (100, 50),
    (200, 50),
    (300, 100),
    (400, 150),
    (500, 2_000),
    (500, 2_000),
    (500, 2_000),
    (500, 2_000),
    (1_000, 5_000),
    (1_000, 60_000),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTiming {
    pub lock_timeout: Duration,
    /// Sleep after this attempt fails.
    pub sleep: Duration,
}

/// The attempt schedule for [`LockCoordinator::with_lock_retries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRetryConfig {
    timings: Vec<LockTiming>,
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self::from_timings(DEFAULT_TIMINGS.iter().map(|&(timeout, sleep)| {
            (Duration::from_millis(timeout), Duration::from_millis(sleep))
        }))
    }
}

impl LockRetryConfig {
    /// `max_attempts` attempts starting at `lock_timeout`, doubling both the
    /// lock timeout and the sleep between attempts.
    pub fn new(lock_timeout: Duration, max_attempts: usize) -> Self {
        let mut timings = Vec::with_capacity(max_attempts.max(1));
        let mut timeout = lock_timeout;
        let mut sleep = lock_timeout / 2;
        for _ in 0..max_attempts.max(1) {
            timings.push(LockTiming {
                lock_timeout: timeout.min(MAX_LOCK_TIMEOUT),
                sleep: sleep.min(MAX_SLEEP),
            });
            timeout = timeout.saturating_mul(2);
            sleep = sleep.saturating_mul(2);
        }
        Self { timings }
    }

    pub fn from_timings(timings: impl IntoIterator<Item = (Duration, Duration)>) -> Self {
        let timings: Vec<_> = timings
            .into_iter()
            .map(|(lock_timeout, sleep)| LockTiming {
                lock_timeout,
                sleep,
            })
            .collect();
        if timings.is_empty() {
            return Self::default();
        }
        Self { timings }
    }

    pub fn single_attempt(lock_timeout: Duration) -> Self {
        Self {
            timings: vec![LockTiming {
                lock_timeout,
                sleep: Duration::ZERO,
            }],
        }
    }

    pub fn timings(&self) -> &[LockTiming] {
        &self.timings
    }

    pub fn max_attempts(&self) -> usize {
        self.timings.len()
    }

    /// The schedule to actually run: only the first attempt when retries are
    /// disabled (`DISABLE_LOCK_RETRIES`).
    #[must_use]
    pub fn effective(&self, retries_disabled: bool) -> Self {
        if retries_disabled {
            Self {
                timings: self.timings.iter().take(1).copied().collect(),
            }
        } else {
            self.clone()
        }
    }
}

/// Work run inside one lock-retry attempt. Called again from scratch on every
/// attempt, in a fresh transaction.
#[async_trait]
pub trait LockedSection: Send {
    async fn run(&mut self, driver: &mut dyn Driver) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct LockCoordinator {
    advisory_lock_id: i64,
    lock_wait: Duration,
    poll_interval: Duration,
    retries_disabled: bool,
}

impl Default for LockCoordinator {
    fn default() -> Self {
        Self {
            advisory_lock_id: DEFAULT_ADVISORY_LOCK_ID,
            lock_wait: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            retries_disabled: false,
        }
    }
}

impl LockCoordinator {
    #[must_use]
    pub fn advisory_lock_id(mut self, id: i64) -> Self {
        self.advisory_lock_id = id;
        self
    }

    /// How long to wait for another runner to release the migration lock.
    #[must_use]
    pub fn lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn disable_lock_retries(mut self, disabled: bool) -> Self {
        self.retries_disabled = disabled;
        self
    }

    pub fn lock_id(&self) -> i64 {
        self.advisory_lock_id
    }

    pub fn retries_disabled(&self) -> bool {
        self.retries_disabled
    }

    #[tracing::instrument(
        name = "lock.acquire_migration_lock",
        skip(self, driver),
        fields(lock_id = self.advisory_lock_id),
        err,
    )]
    pub async fn acquire_migration_lock(&self, driver: &mut dyn Driver) -> Result<()> {
        let deadline = Instant::now() + self.lock_wait;
        let mut attempts = 0;
        loop {
            attempts += 1;
            if driver.try_advisory_lock(self.advisory_lock_id).await? {
                tracing::debug!(attempts, "Acquired migration lock");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout {
                    resource: format!("migration lock {}", self.advisory_lock_id),
                    attempts,
                });
            }
            tracing::info!("Another runner holds the migration lock, waiting");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn release_migration_lock(&self, driver: &mut dyn Driver) {
        match driver.advisory_unlock(self.advisory_lock_id).await {
            Ok(true) => tracing::debug!("Released migration lock"),
            Ok(false) => tracing::warn!("Migration lock was not held by this session"),
            Err(e) => tracing::warn!("Failed to unlock migration lock: {e}"),
        }
    }

    /// Runs `section` in a transaction with a short `lock_timeout`, retrying
    /// the whole transaction on lock contention according to `config`.
    /// Errors other than lock contention are returned immediately.
    pub async fn with_lock_retries(
        &self,
        driver: &mut dyn Driver,
        config: &LockRetryConfig,
        section: &mut dyn LockedSection,
    ) -> Result<()> {
        if driver.transaction_open() {
            return Err(Error::TransactionOpen("with_lock_retries"));
        }

        let config = config.effective(self.retries_disabled);
        let max_attempts = config.max_attempts();

        for (attempt, timing) in (1..).zip(config.timings()) {
            let result = attempt_section(driver, timing, section).await;
            match result {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "Lock acquired after retrying");
                    }
                    return Ok(());
                }
                Err(err) if err.is_lock_contention() => {
                    if attempt == max_attempts {
                        break;
                    }
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        lock_timeout = ?timing.lock_timeout,
                        sleep = ?timing.sleep,
                        error_msg = %err,
                        "Lock not acquired, retrying"
                    );
                    tokio::time::sleep(timing.sleep).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::LockTimeout {
            resource: "table lock".to_string(),
            attempts: max_attempts,
        })
    }

    /// Runs `section` in a plain transaction, rolling back on error.
    pub async fn in_transaction(
        &self,
        driver: &mut dyn Driver,
        section: &mut dyn LockedSection,
    ) -> Result<()> {
        driver.begin().await?;
        let result = section.run(driver).await;
        finish_transaction(driver, result).await
    }
}

async fn attempt_section(
    driver: &mut dyn Driver,
    timing: &LockTiming,
    section: &mut dyn LockedSection,
) -> Result<()> {
    driver.begin().await?;
    let result = match driver.set_lock_timeout(Some(timing.lock_timeout)).await {
        Ok(()) => section.run(driver).await,
        Err(err) => Err(err),
    };
    finish_transaction(driver, result).await
}

async fn finish_transaction(driver: &mut dyn Driver, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => driver.commit().await,
        Err(err) => {
            if let Err(rollback_error) = driver.rollback().await {
                tracing::warn!(error_msg = %rollback_error, "Rollback failed");
            }
            Err(err)
        }
    }
}
