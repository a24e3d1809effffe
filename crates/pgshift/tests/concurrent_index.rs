mod common;

use common::{applied, count_statements, create_users, executor, seed_users};
use pgshift::{
    BackfillValue, ColumnDef, ConcurrentIndexGuard, Driver, Error, IndexDef, IndexOutcome,
    MemoryDriver, Migration, MigrationRegistry, Operation,
};
use serde_json::json;

fn concurrent_email_index() -> IndexDef {
    IndexDef::new("users", ["email"]).concurrently()
}

fn index_email_concurrently(version: i64) -> Migration {
    Migration::new(version, "index_users_on_email")
        .disable_ddl_transaction()
        .ops([
            Operation::add_column("users", ColumnDef::new("email", "text")),
            Operation::AddIndex(concurrent_email_index()),
        ])
}

#[tokio::test]
async fn builds_indexes_concurrently_outside_a_transaction() {
    let mut driver = MemoryDriver::new();
    executor([create_users(1), index_email_concurrently(2)])
        .up(&mut driver, None)
        .await
        .unwrap();

    let (table, columns, valid) = driver.shape().indexes["index_users_on_email"].clone();
    assert_eq!(table, "users");
    assert_eq!(columns, vec!["email".to_string()]);
    assert!(valid);

    let statements = driver.statements();
    let build = statements
        .iter()
        .position(|s| s.starts_with("CREATE INDEX CONCURRENTLY"))
        .unwrap();
    assert_eq!(statements[build - 1], "SET statement_timeout TO 0");
    assert_eq!(statements[build + 1], "RESET statement_timeout");
}

#[tokio::test]
async fn failed_build_leaves_no_invalid_index_behind() {
    let mut driver = MemoryDriver::new();
    let executor = executor([create_users(1), index_email_concurrently(2)]);
    driver.fail_concurrent_build("index_users_on_email");

    let err = executor.up(&mut driver, None).await.unwrap_err();

    assert!(matches!(
        err.root_cause(),
        Error::InvalidIndex { index, .. } if index == "index_users_on_email"
    ));
    assert!(!driver.shape().indexes.contains_key("index_users_on_email"));
    assert_eq!(applied(&mut driver).await.len(), 1);

    // The column from the interrupted step is kept and skipped on the rerun.
    let report = executor.up(&mut driver, None).await.unwrap();
    assert_eq!(report.steps[0].skipped.len(), 1);
    assert!(driver.shape().indexes["index_users_on_email"].2);
}

#[tokio::test]
async fn invalid_index_from_an_earlier_run_is_rebuilt() {
    let mut driver = MemoryDriver::new();
    executor([create_users(1)])
        .up(&mut driver, None)
        .await
        .unwrap();
    driver
        .apply(&Operation::add_column("users", ColumnDef::new("email", "text")))
        .await
        .unwrap();
    driver.insert_invalid_index("users", "index_users_on_email", &["email"]);

    let outcome = ConcurrentIndexGuard
        .add_index(&mut driver, &concurrent_email_index())
        .await
        .unwrap();

    assert_eq!(outcome, IndexOutcome::Rebuilt);
    assert!(driver.shape().indexes["index_users_on_email"].2);
    assert_eq!(
        count_statements(&driver, "DROP INDEX CONCURRENTLY IF EXISTS"),
        1
    );
}

#[tokio::test]
async fn existing_valid_index_is_left_alone() {
    let mut driver = MemoryDriver::new();
    executor([create_users(1), index_email_concurrently(2)])
        .up(&mut driver, None)
        .await
        .unwrap();

    let outcome = ConcurrentIndexGuard
        .add_index(&mut driver, &concurrent_email_index())
        .await
        .unwrap();

    assert_eq!(outcome, IndexOutcome::AlreadyExists);
    assert_eq!(count_statements(&driver, "CREATE INDEX CONCURRENTLY"), 1);
}

#[tokio::test]
async fn concurrent_builds_refuse_an_open_transaction() {
    let mut driver = MemoryDriver::new();
    driver.begin().await.unwrap();

    let err = ConcurrentIndexGuard
        .add_index(&mut driver, &concurrent_email_index())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TransactionOpen(_)));
}

#[tokio::test]
async fn transactional_migrations_can_not_build_concurrently() {
    let err = MigrationRegistry::from_migrations([Migration::new(1, "index_users")
        .op(Operation::AddIndex(concurrent_email_index()))])
    .unwrap_err();

    assert!(matches!(err, Error::InvalidMigration { .. }));
}

#[tokio::test]
async fn removing_a_missing_index_is_skipped() {
    let mut driver = MemoryDriver::new();
    executor([create_users(1)])
        .up(&mut driver, None)
        .await
        .unwrap();

    let removed = ConcurrentIndexGuard
        .remove_index(&mut driver, &concurrent_email_index())
        .await
        .unwrap();

    assert!(!removed);
}

#[tokio::test]
async fn updates_columns_one_batch_at_a_time() {
    let mut driver = MemoryDriver::new();
    executor([create_users(1)])
        .up(&mut driver, None)
        .await
        .unwrap();
    seed_users(&driver, 10);

    executor([
        create_users(1),
        Migration::new(2, "reset_names")
            .disable_ddl_transaction()
            .op(Operation::UpdateColumnInBatches {
                table: "users".to_string(),
                column: "name".to_string(),
                value: BackfillValue::Literal(json!("anonymous")),
                batch_column: "id".to_string(),
                batch_size: Some(3),
            })
            .noop_down("data change only"),
    ])
    .up(&mut driver, None)
    .await
    .unwrap();

    assert!(
        driver
            .rows("users")
            .iter()
            .all(|row| row["name"] == json!("anonymous"))
    );
    assert_eq!(count_statements(&driver, "UPDATE"), 4);
    assert!(
        driver
            .statements()
            .contains(&"UPDATE \"users\" SET \"name\" = 'anonymous' WHERE \"id\" BETWEEN 10 AND 10".to_string())
    );
}

#[tokio::test]
async fn batched_updates_report_missing_columns() {
    let mut driver = MemoryDriver::new();
    executor([create_users(1)])
        .up(&mut driver, None)
        .await
        .unwrap();

    let err = ConcurrentIndexGuard
        .update_column_in_batches(
            &mut driver,
            "users",
            "email",
            &BackfillValue::Column("name".to_string()),
            "id",
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MissingSchemaObject { object } if object.contains("email")));
}
