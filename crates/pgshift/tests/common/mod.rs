#![allow(dead_code)]

use std::time::Duration;

use pgshift::{
    ColumnDef, Executor, IndexDef, LockCoordinator, MemoryDriver, Migration, MigrationId,
    MigrationRegistry, Operation, VersionLedger,
};
use serde_json::json;

pub fn create_users(version: i64) -> Migration {
    Migration::new(version, "create_users").op(Operation::create_table(
        "users",
        [
            ColumnDef::new("id", "bigint").not_null(),
            ColumnDef::new("name", "text"),
        ],
    ))
}

pub fn add_email(version: i64) -> Migration {
    Migration::new(version, "add_email_to_users")
        .op(Operation::add_column("users", ColumnDef::new("email", "text")))
}

pub fn index_email(version: i64) -> Migration {
    Migration::new(version, "index_users_on_email")
        .op(Operation::AddIndex(IndexDef::new("users", ["email"])))
}

/// Polls the migration lock quickly so contended tests finish fast.
pub fn coordinator() -> LockCoordinator {
    LockCoordinator::default()
        .lock_wait(Duration::from_millis(50))
        .poll_interval(Duration::from_millis(10))
}

pub fn executor(migrations: impl IntoIterator<Item = Migration>) -> Executor {
    Executor::new(MigrationRegistry::from_migrations(migrations).unwrap())
        .with_coordinator(coordinator())
}

pub fn seed_users(driver: &MemoryDriver, count: i64) {
    driver
        .insert_rows(
            "users",
            (1..=count).map(|id| json!({ "id": id, "name": format!("user {id}") })),
        )
        .unwrap();
}

pub async fn applied(driver: &mut MemoryDriver) -> Vec<MigrationId> {
    let mut ledger = VersionLedger::new(driver);
    ledger.ensure().await.unwrap();
    ledger
        .applied()
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.id)
        .collect()
}

pub fn count_statements(driver: &MemoryDriver, prefix: &str) -> usize {
    driver
        .statements()
        .iter()
        .filter(|statement| statement.starts_with(prefix))
        .count()
}
