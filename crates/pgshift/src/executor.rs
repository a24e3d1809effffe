//! Applies and reverts migration steps.
//!
//! A batch runs under the runner's advisory lock. Steps run strictly in
//! order, each in its own transaction unless it disables the DDL
//! transaction, and the first failure halts the batch: a later step may
//! depend on schema an earlier one was supposed to create.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::background::{BackfillRegistry, BackgroundJobBridge};
use crate::concurrent::{ConcurrentIndexGuard, IndexOutcome, without_statement_timeout};
use crate::config::Config;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::ledger::VersionLedger;
use crate::lock::{LockCoordinator, LockRetryConfig, LockedSection};
use crate::migration::{Down, Migration, MigrationId};
use crate::operation::{Operation, not_null_constraint_name, text_limit_name};
use crate::registry::{MigrationRegistry, StatusEntry};

/// Lifecycle of one step within a run.
///
/// `Pending → Running → {Applied, Failed}` when applying and
/// `Applied → RevertRunning → {Pending, RevertFailed}` when reverting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Running,
    Applied,
    Failed,
    RevertRunning,
    RevertFailed,
}

impl StepState {
    pub fn can_transition_to(self, next: StepState) -> bool {
        use StepState::{Applied, Failed, Pending, RevertFailed, RevertRunning, Running};
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Applied | Failed)
                | (Applied, RevertRunning)
                | (RevertRunning, Pending | RevertFailed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub id: MigrationId,
    pub state: StepState,
    /// Every state the step passed through, starting with the initial one.
    pub history: Vec<StepState>,
    /// Operations skipped because their guard did not hold.
    pub skipped: Vec<String>,
    pub duration: Duration,
    pub error: Option<String>,
}

impl StepReport {
    fn new(id: MigrationId, state: StepState) -> Self {
        Self {
            id,
            state,
            history: vec![state],
            skipped: Vec::new(),
            duration: Duration::ZERO,
            error: None,
        }
    }

    fn advance(&mut self, next: StepState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid step transition {:?} -> {next:?}",
            self.state
        );
        self.state = next;
        self.history.push(next);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
}

impl RunReport {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn ids_in(&self, state: StepState) -> Vec<&MigrationId> {
        self.steps
            .iter()
            .filter(|step| step.state == state)
            .map(|step| &step.id)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LedgerChange {
    None,
    Apply,
    Revert,
}

/// A list of operations plus the matching ledger write, run as one unit.
struct StepSection<'a> {
    executor: &'a Executor,
    id: Option<&'a MigrationId>,
    operations: &'a [Operation],
    ledger: LedgerChange,
    skipped: Vec<String>,
}

#[async_trait]
impl LockedSection for StepSection<'_> {
    async fn run(&mut self, driver: &mut dyn Driver) -> Result<()> {
        // Lock retries run the section again from the start.
        self.skipped.clear();

        for operation in self.operations {
            let skipped = self.executor.apply_operation(driver, operation).await?;
            self.skipped.extend(skipped);
        }

        if let Some(id) = self.id {
            let mut ledger = VersionLedger::new(driver);
            match self.ledger {
                LedgerChange::Apply => ledger.record_applied(id).await?,
                LedgerChange::Revert => ledger.record_reverted(id).await?,
                LedgerChange::None => {}
            }
        }
        Ok(())
    }
}

struct ApplySection<'a> {
    operation: &'a Operation,
}

#[async_trait]
impl LockedSection for ApplySection<'_> {
    async fn run(&mut self, driver: &mut dyn Driver) -> Result<()> {
        driver.apply(self.operation).await.map(|_| ())
    }
}

#[derive(Debug)]
pub struct Executor {
    registry: MigrationRegistry,
    coordinator: LockCoordinator,
    indexes: ConcurrentIndexGuard,
    bridge: BackgroundJobBridge,
}

impl Executor {
    pub fn new(registry: MigrationRegistry) -> Self {
        Self {
            registry,
            coordinator: LockCoordinator::default(),
            indexes: ConcurrentIndexGuard,
            bridge: BackgroundJobBridge::default(),
        }
    }

    /// Loads migrations from `config.migrations_path`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = MigrationRegistry::from_path(&config.migrations_path)?;
        Ok(Self::new(registry).with_coordinator(config.coordinator()))
    }

    #[must_use]
    pub fn with_coordinator(mut self, coordinator: LockCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    #[must_use]
    pub fn with_backfills(mut self, backfills: Arc<BackfillRegistry>) -> Self {
        self.bridge = BackgroundJobBridge::new(backfills);
        self
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &LockCoordinator {
        &self.coordinator
    }

    pub fn bridge(&self) -> &BackgroundJobBridge {
        &self.bridge
    }

    /// Applies every pending migration up to and including `target`.
    #[tracing::instrument(name = "executor.up", skip(self, driver), err)]
    pub async fn up(&self, driver: &mut dyn Driver, target: Option<i64>) -> Result<RunReport> {
        self.coordinator.acquire_migration_lock(driver).await?;
        let result = self.up_locked(driver, target).await;
        self.coordinator.release_migration_lock(driver).await;
        result
    }

    async fn up_locked(&self, driver: &mut dyn Driver, target: Option<i64>) -> Result<RunReport> {
        let applied = {
            let mut ledger = VersionLedger::new(driver);
            ledger.ensure().await?;
            ledger.applied().await?
        };

        let pending: Vec<&Migration> = self
            .registry
            .pending(&applied)
            .into_iter()
            .filter(|migration| target.is_none_or(|target| migration.version() <= target))
            .collect();

        if pending.is_empty() {
            tracing::info!("No pending migrations");
        }

        let mut report = RunReport::default();
        for migration in pending {
            match self.run_up(driver, migration).await {
                Ok(step) => report.steps.push(step),
                Err(err) if !err.is_fatal() => {
                    tracing::info!(
                        version = migration.version(),
                        name = %migration.name(),
                        "Migration already applied, skipping"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }

    /// Applies a single migration by version, regardless of pending order.
    #[tracing::instrument(name = "executor.apply_version", skip(self, driver), err)]
    pub async fn apply_version(&self, driver: &mut dyn Driver, version: i64) -> Result<StepReport> {
        let migration = self.registry.by_version(version)?;

        self.coordinator.acquire_migration_lock(driver).await?;
        let result = async {
            VersionLedger::new(driver).ensure().await?;
            self.run_up(driver, migration).await
        }
        .await;
        self.coordinator.release_migration_lock(driver).await;
        result
    }

    /// Reverts applied migrations newer than `target`, newest first. Without a
    /// target only the most recent migration is reverted.
    #[tracing::instrument(name = "executor.down", skip(self, driver), err)]
    pub async fn down(&self, driver: &mut dyn Driver, target: Option<i64>) -> Result<RunReport> {
        self.coordinator.acquire_migration_lock(driver).await?;
        let result = self.down_locked(driver, target).await;
        self.coordinator.release_migration_lock(driver).await;
        result
    }

    async fn down_locked(&self, driver: &mut dyn Driver, target: Option<i64>) -> Result<RunReport> {
        let applied = {
            let mut ledger = VersionLedger::new(driver);
            ledger.ensure().await?;
            ledger.applied().await?
        };

        let to_revert: Vec<MigrationId> = match target {
            None => applied.last().map(|r| r.id.clone()).into_iter().collect(),
            Some(target) => applied
                .iter()
                .rev()
                .filter(|r| r.id.version > target)
                .map(|r| r.id.clone())
                .collect(),
        };

        if to_revert.is_empty() {
            tracing::info!("No migrations to rollback");
        }

        let mut report = RunReport::default();
        for id in to_revert {
            let migration = self
                .registry
                .get(&id)
                .ok_or_else(|| Error::MissingDefinition(id.clone()))?;
            report.steps.push(self.run_down(driver, migration).await?);
        }
        Ok(report)
    }

    pub async fn status(&self, driver: &mut dyn Driver) -> Result<Vec<StatusEntry>> {
        let mut ledger = VersionLedger::new(driver);
        ledger.ensure().await?;
        let applied = ledger.applied().await?;
        Ok(self.registry.status(&applied))
    }

    #[tracing::instrument(
        name = "executor.run_step",
        skip(self, driver, migration),
        fields(version = migration.version(), name = %migration.name()),
    )]
    async fn run_up(&self, driver: &mut dyn Driver, migration: &Migration) -> Result<StepReport> {
        if VersionLedger::new(driver).has_applied(&migration.id).await? {
            return Err(Error::AlreadyApplied(migration.id.clone()));
        }

        let mut step = StepReport::new(migration.id.clone(), StepState::Pending);
        step.advance(StepState::Running);
        tracing::info!("Running migration");

        let started = Instant::now();
        let result = self
            .run_operations(driver, migration, &migration.up, LedgerChange::Apply)
            .await;
        step.duration = started.elapsed();

        match result {
            Ok(skipped) => {
                step.skipped = skipped;
                step.advance(StepState::Applied);
                tracing::info!(duration = ?step.duration, "Migration completed");
                Ok(step)
            }
            Err(err) => {
                step.advance(StepState::Failed);
                tracing::error!(error_msg = %err, "Migration failed, halting");
                Err(Error::StepFailed {
                    id: migration.id.clone(),
                    source: Box::new(err),
                })
            }
        }
    }

    #[tracing::instrument(
        name = "executor.revert_step",
        skip(self, driver, migration),
        fields(version = migration.version(), name = %migration.name()),
    )]
    async fn run_down(&self, driver: &mut dyn Driver, migration: &Migration) -> Result<StepReport> {
        let mut step = StepReport::new(migration.id.clone(), StepState::Applied);
        step.advance(StepState::RevertRunning);
        tracing::info!("Rolling back migration");

        if let Down::NoOp { reason } = &migration.down {
            tracing::warn!(%reason, "Migration has no down operations, only removing it from the ledger");
        }

        let started = Instant::now();
        let result = match migration.down_operations() {
            Ok(operations) => {
                self.run_operations(driver, migration, &operations, LedgerChange::Revert)
                    .await
            }
            Err(err) => Err(err),
        };
        step.duration = started.elapsed();

        match result {
            Ok(skipped) => {
                step.skipped = skipped;
                step.advance(StepState::Pending);
                tracing::info!(duration = ?step.duration, "Migration rolled back");
                Ok(step)
            }
            Err(err) => {
                step.advance(StepState::RevertFailed);
                tracing::error!(error_msg = %err, "Rollback failed, halting");
                Err(Error::StepFailed {
                    id: migration.id.clone(),
                    source: Box::new(err),
                })
            }
        }
    }

    async fn run_operations(
        &self,
        driver: &mut dyn Driver,
        migration: &Migration,
        operations: &[Operation],
        ledger: LedgerChange,
    ) -> Result<Vec<String>> {
        let mut section = StepSection {
            executor: self,
            id: Some(&migration.id),
            operations,
            ledger,
            skipped: Vec::new(),
        };

        if migration.options.disable_ddl_transaction {
            section.run(driver).await?;
        } else if let Some(config) = &migration.options.lock_retries {
            self.coordinator
                .with_lock_retries(driver, config, &mut section)
                .await?;
        } else {
            self.coordinator.in_transaction(driver, &mut section).await?;
        }

        Ok(section.skipped)
    }

    /// Applies one operation, returning a description of every part that was
    /// skipped because its guard did not hold.
    fn apply_operation<'a>(
        &'a self,
        driver: &'a mut dyn Driver,
        operation: &'a Operation,
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            if let Some(guard) = operation.guard() {
                if !guard.holds(driver).await? {
                    tracing::warn!(
                        "{} not applied because {guard} (this may be due to an aborted migration or similar)",
                        operation.kind()
                    );
                    return Ok(vec![format!("{}: {guard}", operation.kind())]);
                }
            }

            match operation {
                Operation::AddIndex(index) if index.concurrently => {
                    match self.indexes.add_index(driver, index).await? {
                        IndexOutcome::AlreadyExists => Ok(vec![format!(
                            "{}: index {} already exists",
                            operation.kind(),
                            index.name()
                        )]),
                        IndexOutcome::Created | IndexOutcome::Rebuilt => Ok(Vec::new()),
                    }
                }
                Operation::RemoveIndex(index) if index.concurrently => {
                    if self.indexes.remove_index(driver, index).await? {
                        Ok(Vec::new())
                    } else {
                        Ok(vec![format!(
                            "{}: index {} does not exist",
                            operation.kind(),
                            index.name()
                        )])
                    }
                }
                Operation::AddForeignKey(fk) => {
                    self.add_constraint(driver, operation, &fk.table, &fk.name(), fk.validate)
                        .await
                }
                Operation::AddCheckConstraint {
                    table,
                    name,
                    validate,
                    ..
                } => {
                    self.add_constraint(driver, operation, table, name, *validate)
                        .await
                }
                Operation::AddNotNullConstraint {
                    table,
                    column,
                    name,
                    validate,
                } => {
                    let name = name
                        .clone()
                        .unwrap_or_else(|| not_null_constraint_name(table, column));
                    self.add_constraint(driver, operation, table, &name, *validate)
                        .await
                }
                Operation::AddTextLimit {
                    table,
                    column,
                    name,
                    validate,
                    ..
                } => {
                    let name = name.clone().unwrap_or_else(|| text_limit_name(table, column));
                    self.add_constraint(driver, operation, table, &name, *validate)
                        .await
                }
                Operation::ValidateConstraint { .. } => {
                    if driver.transaction_open() {
                        return Err(Error::TransactionOpen("validate_constraint"));
                    }
                    without_statement_timeout(driver, operation).await?;
                    Ok(Vec::new())
                }
                Operation::UpdateColumnInBatches {
                    table,
                    column,
                    value,
                    batch_column,
                    batch_size,
                } => {
                    let updated = self
                        .indexes
                        .update_column_in_batches(
                            driver,
                            table,
                            column,
                            value,
                            batch_column,
                            *batch_size,
                        )
                        .await?;
                    tracing::info!(table = %table, column = %column, updated, "Updated column in batches");
                    Ok(Vec::new())
                }
                Operation::WithLockRetries { config, operations } => {
                    let config = config.clone().unwrap_or_default();
                    let mut section = StepSection {
                        executor: self,
                        id: None,
                        operations,
                        ledger: LedgerChange::None,
                        skipped: Vec::new(),
                    };
                    self.coordinator
                        .with_lock_retries(driver, &config, &mut section)
                        .await?;
                    Ok(section.skipped)
                }
                Operation::QueueBackgroundMigration(migration) => {
                    self.bridge.queue(driver, migration).await?;
                    Ok(Vec::new())
                }
                Operation::FinalizeBackgroundMigration { job, steal } => {
                    if *steal && driver.transaction_open() {
                        return Err(Error::TransactionOpen("finalize_background_migration"));
                    }
                    self.bridge.finalize(driver, job, *steal).await?;
                    Ok(Vec::new())
                }
                _ => {
                    driver.apply(operation).await?;
                    Ok(Vec::new())
                }
            }
        })
    }

    /// Adds a constraint `NOT VALID` under lock retries, then validates it
    /// without a statement timeout. An existing constraint is only validated.
    async fn add_constraint(
        &self,
        driver: &mut dyn Driver,
        operation: &Operation,
        table: &str,
        name: &str,
        validate: bool,
    ) -> Result<Vec<String>> {
        if driver.transaction_open() {
            return Err(Error::TransactionOpen(operation.kind()));
        }

        let mut skipped = Vec::new();
        if driver.constraint_exists(table, name).await? {
            tracing::warn!(
                "Constraint not created because it exists (this may be due to an aborted migration or similar): table_name: {table}, constraint_name: {name}"
            );
            skipped.push(format!("{}: constraint {name} already exists", operation.kind()));
        } else {
            let mut section = ApplySection { operation };
            self.coordinator
                .with_lock_retries(driver, &LockRetryConfig::default(), &mut section)
                .await?;
        }

        if validate {
            let validation = Operation::ValidateConstraint {
                table: table.to_string(),
                name: name.to_string(),
            };
            without_statement_timeout(driver, &validation).await?;
        }
        Ok(skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_path_transitions() {
        assert!(StepState::Pending.can_transition_to(StepState::Running));
        assert!(StepState::Running.can_transition_to(StepState::Applied));
        assert!(StepState::Running.can_transition_to(StepState::Failed));
        assert!(!StepState::Pending.can_transition_to(StepState::Applied));
        assert!(!StepState::Failed.can_transition_to(StepState::Running));
    }

    #[test]
    fn revert_path_transitions() {
        assert!(StepState::Applied.can_transition_to(StepState::RevertRunning));
        assert!(StepState::RevertRunning.can_transition_to(StepState::Pending));
        assert!(StepState::RevertRunning.can_transition_to(StepState::RevertFailed));
        assert!(!StepState::Applied.can_transition_to(StepState::Pending));
    }

    #[test]
    fn step_report_records_history() {
        let mut step = StepReport::new(MigrationId::new(1, "init"), StepState::Pending);
        step.advance(StepState::Running);
        step.advance(StepState::Applied);

        assert_eq!(
            step.history,
            vec![StepState::Pending, StepState::Running, StepState::Applied]
        );
    }
}
