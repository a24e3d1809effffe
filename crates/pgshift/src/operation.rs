//! The typed operations a migration step is made of.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::background::BackgroundMigration;
use crate::driver::{BatchRange, Driver};
use crate::error::{Error, Result};
use crate::lock::LockRetryConfig;
use crate::sql;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    /// Raw SQL default expression.
    pub default: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: true,
            default: None,
        }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn default(mut self, expression: impl Into<String>) -> Self {
        self.default = Some(expression.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub table: String,
    pub columns: Vec<String>,
    pub name: Option<String>,
    pub unique: bool,
    pub concurrently: bool,
    pub predicate: Option<String>,
}

impl IndexDef {
    pub fn new<I, S>(table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            name: None,
            unique: false,
            concurrently: false,
            predicate: None,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub fn concurrently(mut self) -> Self {
        self.concurrently = true;
        self
    }

    #[must_use]
    pub fn where_clause(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    /// The explicit name, or `index_{table}_on_{a}_and_{b}`.
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            format!("index_{}_on_{}", self.table, self.columns.join("_and_"))
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnDelete {
    #[default]
    Cascade,
    Nullify,
    NoAction,
}

impl OnDelete {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
            Self::Nullify => "SET NULL",
            Self::NoAction => "NO ACTION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDef {
    pub table: String,
    pub column: String,
    pub target_table: String,
    pub target_column: String,
    pub on_delete: OnDelete,
    pub name: Option<String>,
    pub validate: bool,
}

impl ForeignKeyDef {
    pub fn new(
        table: impl Into<String>,
        target_table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            target_table: target_table.into(),
            target_column: "id".to_string(),
            on_delete: OnDelete::default(),
            name: None,
            validate: true,
        }
    }

    #[must_use]
    pub fn target_column(mut self, column: impl Into<String>) -> Self {
        self.target_column = column.into();
        self
    }

    #[must_use]
    pub fn on_delete(mut self, on_delete: OnDelete) -> Self {
        self.on_delete = on_delete;
        self
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Leave the constraint `NOT VALID`, to be validated by a later step.
    #[must_use]
    pub fn without_validation(mut self) -> Self {
        self.validate = false;
        self
    }

    pub fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| concurrent_foreign_key_name(&self.table, &self.column))
    }
}

/// The value written by column backfills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum BackfillValue {
    Literal(serde_json::Value),
    /// Copy from another column of the same row.
    Column(String),
    /// Raw SQL expression, evaluated per row.
    Sql(String),
}

fn short_digest(identifier: &str) -> String {
    let digest = hex::encode(Sha256::digest(identifier.as_bytes()));
    digest[..10].to_string()
}

/// `fk_` followed by the first 10 hex digits of `sha256("{table}_{column}_fk")`.
pub fn concurrent_foreign_key_name(table: &str, column: &str) -> String {
    format!("fk_{}", short_digest(&format!("{table}_{column}_fk")))
}

/// `check_` followed by the first 10 hex digits of
/// `sha256("{table}_{column}_check_{kind}")`.
pub fn check_constraint_name(table: &str, column: &str, kind: &str) -> String {
    format!(
        "check_{}",
        short_digest(&format!("{table}_{column}_check_{kind}"))
    )
}

pub fn not_null_constraint_name(table: &str, column: &str) -> String {
    check_constraint_name(table, column, "not_null")
}

pub fn text_limit_name(table: &str, column: &str) -> String {
    check_constraint_name(table, column, "max_length")
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    CreateTable {
        table: String,
        columns: Vec<ColumnDef>,
    },
    /// `columns` is the table definition to restore when reverting.
    DropTable {
        table: String,
        columns: Option<Vec<ColumnDef>>,
    },
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    RemoveColumn {
        table: String,
        column: String,
        definition: Option<ColumnDef>,
    },
    AddIndex(IndexDef),
    RemoveIndex(IndexDef),
    AddForeignKey(ForeignKeyDef),
    RemoveForeignKey(ForeignKeyDef),
    AddCheckConstraint {
        table: String,
        name: String,
        check: String,
        validate: bool,
    },
    AddNotNullConstraint {
        table: String,
        column: String,
        name: Option<String>,
        validate: bool,
    },
    AddTextLimit {
        table: String,
        column: String,
        limit: u32,
        name: Option<String>,
        validate: bool,
    },
    ValidateConstraint {
        table: String,
        name: String,
    },
    /// `check` is the check expression to restore when reverting.
    RemoveConstraint {
        table: String,
        name: String,
        check: Option<String>,
    },
    Execute {
        sql: String,
        reverse_sql: Option<String>,
    },
    /// A single `UPDATE`, optionally bounded to a key range.
    UpdateColumn {
        table: String,
        column: String,
        value: BackfillValue,
        batch_column: String,
        range: Option<BatchRange>,
    },
    UpdateColumnInBatches {
        table: String,
        column: String,
        value: BackfillValue,
        batch_column: String,
        /// Defaults to 5% of the table, capped at 1000 rows.
        batch_size: Option<u64>,
    },
    WithLockRetries {
        config: Option<LockRetryConfig>,
        operations: Vec<Operation>,
    },
    QueueBackgroundMigration(BackgroundMigration),
    FinalizeBackgroundMigration {
        job: String,
        steal: bool,
    },
}

/// What reverting an operation takes.
#[derive(Debug, Clone, PartialEq)]
pub enum Reversal {
    Apply(Operation),
    Nothing,
    Impossible(String),
}

impl Operation {
    pub fn create_table(
        table: impl Into<String>,
        columns: impl IntoIterator<Item = ColumnDef>,
    ) -> Self {
        Self::CreateTable {
            table: table.into(),
            columns: columns.into_iter().collect(),
        }
    }

    pub fn add_column(table: impl Into<String>, column: ColumnDef) -> Self {
        Self::AddColumn {
            table: table.into(),
            column,
        }
    }

    pub fn remove_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::RemoveColumn {
            table: table.into(),
            column: column.into(),
            definition: None,
        }
    }

    pub fn add_not_null_constraint(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::AddNotNullConstraint {
            table: table.into(),
            column: column.into(),
            name: None,
            validate: true,
        }
    }

    pub fn add_text_limit(table: impl Into<String>, column: impl Into<String>, limit: u32) -> Self {
        Self::AddTextLimit {
            table: table.into(),
            column: column.into(),
            limit,
            name: None,
            validate: true,
        }
    }

    pub fn execute(sql: impl Into<String>) -> Self {
        Self::Execute {
            sql: sql.into(),
            reverse_sql: None,
        }
    }

    pub fn reversible_execute(sql: impl Into<String>, reverse_sql: impl Into<String>) -> Self {
        Self::Execute {
            sql: sql.into(),
            reverse_sql: Some(reverse_sql.into()),
        }
    }

    pub fn update_column_in_batches(
        table: impl Into<String>,
        column: impl Into<String>,
        value: BackfillValue,
    ) -> Self {
        Self::UpdateColumnInBatches {
            table: table.into(),
            column: column.into(),
            value,
            batch_column: "id".to_string(),
            batch_size: None,
        }
    }

    pub fn with_lock_retries(operations: impl IntoIterator<Item = Operation>) -> Self {
        Self::WithLockRetries {
            config: None,
            operations: operations.into_iter().collect(),
        }
    }

    /// The helper name this operation is reported under.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateTable { .. } => "create_table",
            Self::DropTable { .. } => "drop_table",
            Self::AddColumn { .. } => "add_column",
            Self::RemoveColumn { .. } => "remove_column",
            Self::AddIndex(index) if index.concurrently => "add_concurrent_index",
            Self::AddIndex(_) => "add_index",
            Self::RemoveIndex(index) if index.concurrently => "remove_concurrent_index",
            Self::RemoveIndex(_) => "remove_index",
            Self::AddForeignKey(_) => "add_concurrent_foreign_key",
            Self::RemoveForeignKey(_) => "remove_foreign_key",
            Self::AddCheckConstraint { .. } => "add_check_constraint",
            Self::AddNotNullConstraint { .. } => "add_not_null_constraint",
            Self::AddTextLimit { .. } => "add_text_limit",
            Self::ValidateConstraint { .. } => "validate_constraint",
            Self::RemoveConstraint { .. } => "remove_constraint",
            Self::Execute { .. } => "execute",
            Self::UpdateColumn { .. } => "update_column",
            Self::UpdateColumnInBatches { .. } => "update_column_in_batches",
            Self::WithLockRetries { .. } => "with_lock_retries",
            Self::QueueBackgroundMigration(_) => "queue_background_migration",
            Self::FinalizeBackgroundMigration { .. } => "finalize_background_migration",
        }
    }

    /// The table this operation touches, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::CreateTable { table, .. }
            | Self::DropTable { table, .. }
            | Self::AddColumn { table, .. }
            | Self::RemoveColumn { table, .. }
            | Self::AddCheckConstraint { table, .. }
            | Self::AddNotNullConstraint { table, .. }
            | Self::AddTextLimit { table, .. }
            | Self::ValidateConstraint { table, .. }
            | Self::RemoveConstraint { table, .. }
            | Self::UpdateColumn { table, .. }
            | Self::UpdateColumnInBatches { table, .. } => Some(table),
            Self::AddIndex(index) | Self::RemoveIndex(index) => Some(&index.table),
            Self::AddForeignKey(fk) | Self::RemoveForeignKey(fk) => Some(&fk.table),
            Self::QueueBackgroundMigration(migration) => Some(&migration.table),
            Self::Execute { .. }
            | Self::WithLockRetries { .. }
            | Self::FinalizeBackgroundMigration { .. } => None,
        }
    }

    /// Operations that hold long locks or run for a long time refuse to run
    /// inside an open transaction.
    pub fn requires_no_transaction(&self) -> bool {
        match self {
            Self::AddIndex(index) | Self::RemoveIndex(index) => index.concurrently,
            Self::AddForeignKey(_)
            | Self::AddCheckConstraint { .. }
            | Self::AddNotNullConstraint { .. }
            | Self::AddTextLimit { .. }
            | Self::ValidateConstraint { .. }
            | Self::UpdateColumnInBatches { .. }
            | Self::WithLockRetries { .. } => true,
            Self::FinalizeBackgroundMigration { steal, .. } => *steal,
            _ => false,
        }
    }

    /// Statements Postgres itself rejects inside a transaction block. Narrower
    /// than [`Operation::requires_no_transaction`]: a `NOT VALID` constraint
    /// add is issued inside a lock-retry transaction even though its step
    /// must not be transactional.
    pub fn cannot_run_in_transaction_block(&self) -> bool {
        match self {
            Self::AddIndex(index) | Self::RemoveIndex(index) => index.concurrently,
            _ => false,
        }
    }

    /// The precondition checked before applying. When it does not hold the
    /// operation is skipped with a warning.
    pub fn guard(&self) -> Option<Guard> {
        match self {
            Self::CreateTable { table, .. } => Some(Guard::TableMissing(table.clone())),
            Self::DropTable { table, .. } => Some(Guard::TableExists(table.clone())),
            Self::AddColumn { table, column } => Some(Guard::ColumnMissing {
                table: table.clone(),
                column: column.name.clone(),
            }),
            Self::RemoveColumn { table, column, .. } => Some(Guard::ColumnExists {
                table: table.clone(),
                column: column.clone(),
            }),
            Self::AddIndex(index) if !index.concurrently => Some(Guard::IndexMissing {
                table: index.table.clone(),
                index: index.name(),
            }),
            Self::RemoveIndex(index) if !index.concurrently => Some(Guard::IndexExists {
                table: index.table.clone(),
                index: index.name(),
            }),
            Self::RemoveForeignKey(fk) => Some(Guard::ConstraintExists {
                table: fk.table.clone(),
                name: fk.name(),
            }),
            Self::RemoveConstraint { table, name, .. } => Some(Guard::ConstraintExists {
                table: table.clone(),
                name: name.clone(),
            }),
            Self::AddNotNullConstraint { table, column, .. } => Some(Guard::ColumnNullable {
                table: table.clone(),
                column: column.clone(),
            }),
            Self::QueueBackgroundMigration(migration) => Some(Guard::JobsNotQueued {
                job: migration.job.clone(),
                table: migration.table.clone(),
                arguments: migration.arguments.clone(),
            }),
            _ => None,
        }
    }

    pub fn reverse(&self) -> Reversal {
        match self {
            Self::CreateTable { table, columns } => Reversal::Apply(Self::DropTable {
                table: table.clone(),
                columns: Some(columns.clone()),
            }),
            Self::DropTable {
                table,
                columns: Some(columns),
            } => Reversal::Apply(Self::CreateTable {
                table: table.clone(),
                columns: columns.clone(),
            }),
            Self::DropTable { table, columns: None } => Reversal::Impossible(format!(
                "drop_table {table} has no table definition to restore"
            )),
            Self::AddColumn { table, column } => Reversal::Apply(Self::RemoveColumn {
                table: table.clone(),
                column: column.name.clone(),
                definition: Some(column.clone()),
            }),
            Self::RemoveColumn {
                table,
                definition: Some(definition),
                ..
            } => Reversal::Apply(Self::AddColumn {
                table: table.clone(),
                column: definition.clone(),
            }),
            Self::RemoveColumn {
                table,
                column,
                definition: None,
            } => Reversal::Impossible(format!(
                "remove_column {table}.{column} has no column definition to restore"
            )),
            Self::AddIndex(index) => Reversal::Apply(Self::RemoveIndex(index.clone())),
            Self::RemoveIndex(index) => Reversal::Apply(Self::AddIndex(index.clone())),
            Self::AddForeignKey(fk) => Reversal::Apply(Self::RemoveForeignKey(fk.clone())),
            Self::RemoveForeignKey(fk) => Reversal::Apply(Self::AddForeignKey(fk.clone())),
            Self::AddCheckConstraint {
                table, name, check, ..
            } => Reversal::Apply(Self::RemoveConstraint {
                table: table.clone(),
                name: name.clone(),
                check: Some(check.clone()),
            }),
            Self::AddNotNullConstraint {
                table,
                column,
                name,
                ..
            } => Reversal::Apply(Self::RemoveConstraint {
                table: table.clone(),
                name: name
                    .clone()
                    .unwrap_or_else(|| not_null_constraint_name(table, column)),
                check: Some(sql::not_null_check(column)),
            }),
            Self::AddTextLimit {
                table,
                column,
                limit,
                name,
                ..
            } => Reversal::Apply(Self::RemoveConstraint {
                table: table.clone(),
                name: name.clone().unwrap_or_else(|| text_limit_name(table, column)),
                check: Some(sql::text_limit_check(column, *limit)),
            }),
            Self::RemoveConstraint {
                table,
                name,
                check: Some(check),
            } => Reversal::Apply(Self::AddCheckConstraint {
                table: table.clone(),
                name: name.clone(),
                check: check.clone(),
                validate: true,
            }),
            Self::RemoveConstraint {
                table,
                name,
                check: None,
            } => Reversal::Impossible(format!(
                "remove_constraint {name} on {table} has no check expression to restore"
            )),
            Self::ValidateConstraint { .. } | Self::FinalizeBackgroundMigration { .. } => {
                Reversal::Nothing
            }
            Self::Execute {
                sql,
                reverse_sql: Some(reverse_sql),
            } => Reversal::Apply(Self::Execute {
                sql: reverse_sql.clone(),
                reverse_sql: Some(sql.clone()),
            }),
            Self::Execute {
                reverse_sql: None, ..
            } => Reversal::Impossible("execute has no reverse_sql".to_string()),
            Self::UpdateColumn { table, column, .. }
            | Self::UpdateColumnInBatches { table, column, .. } => Reversal::Impossible(
                format!("updating {table}.{column} is a data change"),
            ),
            Self::QueueBackgroundMigration(migration) => Reversal::Impossible(format!(
                "background migration {} can not be unqueued",
                migration.job
            )),
            Self::WithLockRetries { config, operations } => {
                let mut reversed = Vec::with_capacity(operations.len());
                for operation in operations.iter().rev() {
                    match operation.reverse() {
                        Reversal::Apply(reverse) => reversed.push(reverse),
                        Reversal::Nothing => {}
                        impossible @ Reversal::Impossible(_) => return impossible,
                    }
                }
                if reversed.is_empty() {
                    Reversal::Nothing
                } else {
                    Reversal::Apply(Self::WithLockRetries {
                        config: config.clone(),
                        operations: reversed,
                    })
                }
            }
        }
    }
}

/// A schema precondition evaluated through the driver's introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    TableMissing(String),
    TableExists(String),
    ColumnMissing { table: String, column: String },
    ColumnExists { table: String, column: String },
    IndexMissing { table: String, index: String },
    IndexExists { table: String, index: String },
    ConstraintExists { table: String, name: String },
    ColumnNullable { table: String, column: String },
    /// No batches of this job, table and arguments are in the queue yet.
    JobsNotQueued {
        job: String,
        table: String,
        arguments: serde_json::Value,
    },
}

impl Guard {
    /// Whether the guarded operation should run.
    ///
    /// Column guards against a table that does not exist fail with
    /// [`Error::MissingSchemaObject`] rather than skipping, since that means an
    /// earlier step never ran.
    pub async fn holds(&self, driver: &mut dyn Driver) -> Result<bool> {
        match self {
            Self::TableMissing(table) => Ok(!driver.table_exists(table).await?),
            Self::TableExists(table) => driver.table_exists(table).await,
            Self::ColumnMissing { table, column } => {
                require_table(driver, table).await?;
                Ok(!driver.column_exists(table, column).await?)
            }
            Self::ColumnExists { table, column } => {
                require_table(driver, table).await?;
                driver.column_exists(table, column).await
            }
            Self::IndexMissing { table, index } => {
                Ok(driver.index_status(table, index).await?.is_none())
            }
            Self::IndexExists { table, index } => {
                Ok(driver.index_status(table, index).await?.is_some())
            }
            Self::ConstraintExists { table, name } => driver.constraint_exists(table, name).await,
            Self::ColumnNullable { table, column } => {
                require_table(driver, table).await?;
                if !driver.column_exists(table, column).await? {
                    return Err(Error::missing("column", table, column));
                }
                driver.column_is_nullable(table, column).await
            }
            Self::JobsNotQueued {
                job,
                table,
                arguments,
            } => {
                driver.ensure_job_queue().await?;
                Ok(!driver.jobs_queued(job, table, arguments).await?)
            }
        }
    }
}

async fn require_table(driver: &mut dyn Driver, table: &str) -> Result<()> {
    if driver.table_exists(table).await? {
        Ok(())
    } else {
        Err(Error::missing_table(table))
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableMissing(table) => write!(f, "table {table} already exists"),
            Self::TableExists(table) => write!(f, "table {table} does not exist"),
            Self::ColumnMissing { table, column } => {
                write!(f, "column {table}.{column} already exists")
            }
            Self::ColumnExists { table, column } => {
                write!(f, "column {table}.{column} does not exist")
            }
            Self::IndexMissing { table, index } => {
                write!(f, "index {index} on {table} already exists")
            }
            Self::IndexExists { table, index } => {
                write!(f, "index {index} on {table} does not exist")
            }
            Self::ConstraintExists { table, name } => {
                write!(f, "constraint {name} on {table} does not exist")
            }
            Self::ColumnNullable { table, column } => {
                write!(f, "column {table}.{column} is already NOT NULL")
            }
            Self::JobsNotQueued { job, table, .. } => {
                write!(f, "{job} jobs for {table} are already queued")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_key_name_is_a_short_sha256_digest() {
        let name = concurrent_foreign_key_name("issues", "project_id");

        assert!(name.starts_with("fk_"));
        assert_eq!(name.len(), "fk_".len() + 10);
        assert!(name[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(name, concurrent_foreign_key_name("issues", "project_id"));
        assert_ne!(name, concurrent_foreign_key_name("issues", "author_id"));
    }

    #[test]
    fn check_constraint_names_differ_by_kind() {
        let not_null = not_null_constraint_name("users", "email");
        let limit = text_limit_name("users", "email");

        assert!(not_null.starts_with("check_"));
        assert_eq!(not_null.len(), "check_".len() + 10);
        assert_ne!(not_null, limit);
    }

    #[test]
    fn default_index_name_joins_columns() {
        let index = IndexDef::new("merge_requests", ["target_project_id", "iid"]);
        assert_eq!(
            index.name(),
            "index_merge_requests_on_target_project_id_and_iid"
        );
        assert_eq!(index.clone().named("custom").name(), "custom");
    }

    #[test]
    fn add_column_reverses_to_remove_with_definition() {
        let column = ColumnDef::new("email", "text").not_null().default("''");
        let op = Operation::add_column("users", column.clone());

        let Reversal::Apply(Operation::RemoveColumn { definition, .. }) = op.reverse() else {
            panic!("expected remove_column");
        };
        assert_eq!(definition, Some(column));
    }

    #[test]
    fn data_changes_do_not_reverse() {
        let op = Operation::update_column_in_batches(
            "users",
            "active",
            BackfillValue::Literal(serde_json::json!(true)),
        );
        assert!(matches!(op.reverse(), Reversal::Impossible(_)));
        assert!(op.requires_no_transaction());
    }

    #[test]
    fn lock_retry_block_reverses_its_body() {
        let op = Operation::with_lock_retries([
            Operation::add_column("users", ColumnDef::new("a", "int")),
            Operation::add_column("users", ColumnDef::new("b", "int")),
        ]);

        let Reversal::Apply(Operation::WithLockRetries { operations, .. }) = op.reverse() else {
            panic!("expected a lock retry block");
        };
        assert!(matches!(&operations[0], Operation::RemoveColumn { column, .. } if column == "b"));
        assert!(matches!(&operations[1], Operation::RemoveColumn { column, .. } if column == "a"));
    }

    #[test]
    fn only_concurrent_index_changes_need_no_transaction() {
        let plain = Operation::AddIndex(IndexDef::new("users", ["email"]));
        let concurrent = Operation::AddIndex(IndexDef::new("users", ["email"]).concurrently());

        assert!(!plain.requires_no_transaction());
        assert!(plain.guard().is_some());
        assert!(concurrent.requires_no_transaction());
        assert!(concurrent.guard().is_none());
        assert!(concurrent.cannot_run_in_transaction_block());
    }

    #[test]
    fn reversed_text_limits_quote_the_column() {
        let op = Operation::add_text_limit("users", "Name", 10);

        let Reversal::Apply(Operation::RemoveConstraint { check, .. }) = op.reverse() else {
            panic!("expected remove_constraint");
        };
        assert_eq!(check.as_deref(), Some("char_length(\"Name\") <= 10"));

        let Reversal::Apply(Operation::AddCheckConstraint { check, .. }) =
            Operation::RemoveConstraint {
                table: "users".to_string(),
                name: text_limit_name("users", "Name"),
                check: Some(check.unwrap_or_default()),
            }
            .reverse()
        else {
            panic!("expected add_check_constraint");
        };
        assert_eq!(check, "char_length(\"Name\") <= 10");
    }

    #[test]
    fn constraint_adds_may_run_inside_a_lock_retry_transaction() {
        let op = Operation::add_text_limit("users", "name", 255);

        assert!(op.requires_no_transaction());
        assert!(!op.cannot_run_in_transaction_block());
    }

    #[test]
    fn backfill_value_serializes_with_a_tag() {
        let value = BackfillValue::Column("legacy_name".to_string());
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "column", "value": "legacy_name"})
        );
    }
}
