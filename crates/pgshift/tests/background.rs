mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{applied, create_users, executor, seed_users};
use pgshift::background::worker::TickOutcome;
use pgshift::{
    Backfill, BackfillRegistry, BackfillValue, BackgroundJob, BackgroundJobBridge,
    BackgroundMigration, ColumnDef, Driver, Error, IndexDef, JobStatus, MemoryDriver, Migration,
    Operation, Worker,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

fn queue_name_backfill(version: i64) -> Migration {
    let backfill = BackgroundMigration::update_column(
        "users",
        "name",
        BackfillValue::Literal(json!("migrated")),
    )
    .unwrap()
    .batch_size(4);

    Migration::new(version, "queue_name_backfill")
        .op(Operation::QueueBackgroundMigration(backfill))
        .noop_down("jobs are left to finish")
}

fn finalize_name_backfill(version: i64, steal: bool) -> Migration {
    let migration = Migration::new(version, "finalize_name_backfill")
        .op(Operation::FinalizeBackgroundMigration {
            job: "UpdateColumn".to_string(),
            steal,
        })
        .noop_down("nothing to undo");
    if steal {
        migration.disable_ddl_transaction()
    } else {
        migration
    }
}

async fn seeded_driver() -> MemoryDriver {
    let mut driver = MemoryDriver::new();
    executor([create_users(1)])
        .up(&mut driver, None)
        .await
        .unwrap();
    seed_users(&driver, 10);
    driver
}

#[tokio::test]
async fn queues_one_job_per_key_range() {
    let mut driver = seeded_driver().await;
    executor([create_users(1), queue_name_backfill(2)])
        .up(&mut driver, None)
        .await
        .unwrap();

    let jobs = driver.jobs();
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|job| job.status == JobStatus::Pending));
    assert_eq!(jobs[2].range.start, 9);
    assert_eq!(jobs[2].range.end, 10);
}

#[tokio::test]
async fn workers_perform_queued_jobs_before_finalize() {
    let mut driver = seeded_driver().await;
    let executor = executor([
        create_users(1),
        queue_name_backfill(2),
        finalize_name_backfill(3, false),
    ]);
    executor.up(&mut driver, Some(2)).await.unwrap();

    let mut worker = Worker::new(driver.session(), Arc::new(BackfillRegistry::new()));
    while worker.tick().await.unwrap() != TickOutcome::Idle {}

    executor.up(&mut driver, None).await.unwrap();

    assert_eq!(applied(&mut driver).await.len(), 3);
    assert!(
        driver
            .rows("users")
            .iter()
            .all(|row| row["name"] == json!("migrated"))
    );
}

#[tokio::test]
async fn finalize_without_steal_fails_on_pending_jobs() {
    let mut driver = seeded_driver().await;
    let executor = executor([
        create_users(1),
        queue_name_backfill(2),
        finalize_name_backfill(3, false),
    ]);

    let err = executor.up(&mut driver, None).await.unwrap_err();

    assert!(matches!(
        err.root_cause(),
        Error::PartialBackfill { pending: 3, failed: 0, .. }
    ));
    assert_eq!(applied(&mut driver).await.len(), 2);
}

#[tokio::test]
async fn finalize_with_steal_performs_pending_jobs_inline() {
    let mut driver = seeded_driver().await;
    executor([
        create_users(1),
        queue_name_backfill(2),
        finalize_name_backfill(3, true),
    ])
    .up(&mut driver, None)
    .await
    .unwrap();

    assert!(
        driver
            .jobs()
            .iter()
            .all(|job| job.status == JobStatus::Succeeded)
    );
    assert!(
        driver
            .rows("users")
            .iter()
            .all(|row| row["name"] == json!("migrated"))
    );
}

#[tokio::test]
async fn rerunning_an_interrupted_step_does_not_queue_twice() {
    let mut driver = seeded_driver().await;
    let backfill = BackgroundMigration::update_column(
        "users",
        "name",
        BackfillValue::Literal(json!("migrated")),
    )
    .unwrap()
    .batch_size(4);
    let executor = executor([
        create_users(1),
        Migration::new(2, "queue_and_index")
            .disable_ddl_transaction()
            .ops([
                Operation::QueueBackgroundMigration(backfill),
                Operation::AddIndex(IndexDef::new("users", ["email"]).concurrently()),
            ])
            .noop_down("jobs are left to finish"),
    ]);

    executor.up(&mut driver, None).await.unwrap_err();
    assert_eq!(driver.jobs().len(), 3);

    driver
        .apply(&Operation::add_column("users", ColumnDef::new("email", "text")))
        .await
        .unwrap();
    let report = executor.up(&mut driver, None).await.unwrap();

    assert_eq!(driver.jobs().len(), 3);
    assert_eq!(report.steps[0].skipped.len(), 1);
    assert!(report.steps[0].skipped[0].starts_with("queue_background_migration"));
    assert_eq!(applied(&mut driver).await.len(), 2);
}

#[tokio::test]
async fn queueing_an_unregistered_backfill_fails() {
    let mut driver = seeded_driver().await;
    let err = BackgroundJobBridge::default()
        .queue(&mut driver, &BackgroundMigration::new("CopyEmails", "users"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnknownBackfill(name) if name == "CopyEmails"));
}

#[derive(Debug, Serialize, Deserialize)]
struct AlwaysFails {
    message: String,
}

#[async_trait::async_trait]
impl Backfill for AlwaysFails {
    const NAME: &'static str = "AlwaysFails";

    async fn perform(&self, _driver: &mut dyn Driver, _job: &BackgroundJob) -> pgshift::Result<u64> {
        Err(Error::Statement(self.message.clone()))
    }
}

#[tokio::test]
async fn failing_jobs_are_marked_failed_after_max_retries() {
    let mut driver = seeded_driver().await;
    let mut registry = BackfillRegistry::new();
    registry.register::<AlwaysFails>();
    let bridge = BackgroundJobBridge::new(Arc::new(registry));

    bridge
        .queue(
            &mut driver,
            &BackgroundMigration::new(AlwaysFails::NAME, "users")
                .batch_size(100)
                .arguments(json!({ "message": "boom" })),
        )
        .await
        .unwrap();

    let mut worker = Worker::new(driver.session(), Arc::clone(bridge.registry())).max_retries(1);
    assert_eq!(
        worker.tick().await.unwrap(),
        TickOutcome::Failed(JobStatus::Failed)
    );

    let counts = bridge.counts(&mut driver, AlwaysFails::NAME).await.unwrap();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.unfinished(), 1);
    assert_eq!(driver.jobs()[0].last_error.as_deref(), Some("Statement failed: boom"));

    let err = bridge
        .finalize(&mut driver, AlwaysFails::NAME, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PartialBackfill { failed: 1, .. }));
}

#[tokio::test]
async fn retried_jobs_are_rescheduled_with_backoff() {
    let mut driver = seeded_driver().await;
    let mut registry = BackfillRegistry::new();
    registry.register::<AlwaysFails>();
    let bridge = BackgroundJobBridge::new(Arc::new(registry));
    bridge
        .queue(
            &mut driver,
            &BackgroundMigration::new(AlwaysFails::NAME, "users")
                .batch_size(100)
                .arguments(json!({ "message": "boom" })),
        )
        .await
        .unwrap();

    let mut worker = Worker::new(driver.session(), Arc::clone(bridge.registry()));
    assert_eq!(
        worker.tick().await.unwrap(),
        TickOutcome::Failed(JobStatus::Pending)
    );

    // Backed off into the future, so nothing is claimable right now.
    assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    assert!(driver.jobs()[0].run_at > chrono::Utc::now());
}

#[tokio::test]
async fn wait_for_returns_once_every_batch_succeeded() {
    let mut driver = seeded_driver().await;
    let bridge = BackgroundJobBridge::default();
    let token = bridge
        .queue(
            &mut driver,
            &BackgroundMigration::update_column("users", "name", BackfillValue::Column("id".to_string()))
                .unwrap()
                .batch_size(5),
        )
        .await
        .unwrap();
    assert_eq!(token.batches, 2);

    let mut worker = Worker::new(driver.session(), Arc::clone(bridge.registry()));
    while worker.tick().await.unwrap() != TickOutcome::Idle {}

    let counts = bridge
        .wait_for(&mut driver, &token, Duration::from_millis(10), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(counts.succeeded, 2);
    assert_eq!(driver.rows("users")[0]["name"], json!(1));
}
