//! Runs against a real server. Needs `DATABASE_URL` pointing at a database
//! the user may create other databases from:
//!
//! `DATABASE_URL=postgres://localhost/postgres cargo test -- --ignored`

mod common;

use common::{create_users, executor};
use pgshift::sqlx::{Connection, PgConnection};
use pgshift::{
    BackfillValue, ColumnDef, Driver, Error, ForeignKeyDef, IndexDef, Migration, MigrationId,
    Operation, PgDriver, VersionLedger,
};
use uuid::Uuid;

fn base_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/postgres".to_string())
}

fn test_db_url(db_name: &str) -> String {
    let base_url = base_url();
    let base = base_url
        .rfind('/')
        .map_or(base_url.as_str(), |idx| &base_url[..idx]);
    format!("{base}/{db_name}")
}

struct TestDb {
    name: String,
}

impl TestDb {
    async fn create() -> Self {
        let name = format!("pgshift_test_{}", Uuid::new_v4().simple());
        let mut conn = PgConnection::connect(&base_url()).await.unwrap();
        pgshift::sqlx::raw_sql(&format!("CREATE DATABASE \"{name}\""))
            .execute(&mut conn)
            .await
            .unwrap();
        conn.close().await.unwrap();
        Self { name }
    }

    async fn driver(&self) -> PgDriver {
        PgDriver::connect(&test_db_url(&self.name)).await.unwrap()
    }

    async fn drop(self, driver: PgDriver) {
        driver.close().await.unwrap();
        let mut conn = PgConnection::connect(&base_url()).await.unwrap();
        pgshift::sqlx::raw_sql(&format!("DROP DATABASE IF EXISTS \"{}\"", self.name))
            .execute(&mut conn)
            .await
            .unwrap();
        conn.close().await.unwrap();
    }
}

#[tokio::test]
#[ignore = "requires a Postgres server"]
async fn applies_and_reverts_against_postgres() {
    let db = TestDb::create().await;
    let mut driver = db.driver().await;
    let executor = executor([
        create_users(1),
        Migration::new(2, "add_email_to_users")
            .disable_ddl_transaction()
            .ops([
                Operation::add_column("users", ColumnDef::new("email", "text")),
                Operation::AddIndex(IndexDef::new("users", ["email"]).concurrently()),
                Operation::add_text_limit("users", "email", 255),
            ]),
    ]);

    executor.up(&mut driver, None).await.unwrap();
    assert!(driver.column_exists("users", "email").await.unwrap());
    assert!(
        driver
            .index_status("users", "index_users_on_email")
            .await
            .unwrap()
            .is_some_and(|status| status.is_valid())
    );

    executor.down(&mut driver, None).await.unwrap();
    assert!(!driver.column_exists("users", "email").await.unwrap());
    assert!(
        driver
            .index_status("users", "index_users_on_email")
            .await
            .unwrap()
            .is_none()
    );

    db.drop(driver).await;
}

#[tokio::test]
#[ignore = "requires a Postgres server"]
async fn missing_columns_map_to_missing_schema_objects() {
    let db = TestDb::create().await;
    let mut driver = db.driver().await;
    let err = executor([
        create_users(1),
        Migration::new(2, "index_users_on_email")
            .op(Operation::AddIndex(IndexDef::new("users", ["email"]))),
    ])
    .up(&mut driver, None)
    .await
    .unwrap_err();

    assert!(matches!(err.root_cause(), Error::MissingSchemaObject { .. }));

    let applied = VersionLedger::new(&mut driver).applied().await.unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].id, MigrationId::new(1, "create_users"));

    db.drop(driver).await;
}

#[tokio::test]
#[ignore = "requires a Postgres server"]
async fn foreign_keys_and_batched_updates_against_postgres() {
    let db = TestDb::create().await;
    let mut driver = db.driver().await;
    let executor = executor([
        create_users(1),
        Migration::new(2, "create_posts").op(Operation::create_table(
            "posts",
            [
                ColumnDef::new("id", "bigint").not_null(),
                ColumnDef::new("user_id", "bigint"),
                ColumnDef::new("title", "text"),
            ],
        )),
        Migration::new(3, "add_posts_user_fk")
            .disable_ddl_transaction()
            .ops([
                Operation::AddIndex(IndexDef::new("users", ["id"]).unique().concurrently()),
                Operation::AddForeignKey(ForeignKeyDef::new("posts", "users", "user_id")),
                Operation::UpdateColumnInBatches {
                    table: "posts".to_string(),
                    column: "title".to_string(),
                    value: BackfillValue::Literal(serde_json::json!("untitled")),
                    batch_column: "id".to_string(),
                    batch_size: Some(2),
                },
            ])
            .noop_down("kept for the test"),
    ]);

    executor.up(&mut driver, Some(2)).await.unwrap();
    pgshift::sqlx::raw_sql(
        "INSERT INTO users (id) VALUES (1); \
         INSERT INTO posts (id, user_id) VALUES (1, 1), (2, 1), (3, NULL);",
    )
    .execute(driver.connection())
    .await
    .unwrap();

    executor.up(&mut driver, None).await.unwrap();

    let fk = pgshift::operation::concurrent_foreign_key_name("posts", "user_id");
    assert!(driver.constraint_exists("posts", &fk).await.unwrap());
    let untitled: i64 =
        pgshift::sqlx::query_scalar("SELECT count(*) FROM posts WHERE title = 'untitled'")
            .fetch_one(driver.connection())
            .await
            .unwrap();
    assert_eq!(untitled, 3);

    db.drop(driver).await;
}
