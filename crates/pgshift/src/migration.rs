//! Migration definitions.
//!
//! A [`Migration`] is a versioned, statically defined list of [`Operation`]s
//! with an explicit down path. Definitions are validated when they are
//! registered, so an irreversible step or a transaction-unsafe operation is
//! reported at load time instead of halfway through a deploy.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::lock::LockRetryConfig;
use crate::operation::{Operation, Reversal};

/// Unique key of a migration: the timestamp version plus the name.
///
/// Two files may share a numeric prefix, so the name takes part in both
/// equality and ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MigrationId {
    pub version: i64,
    pub name: String,
}

impl MigrationId {
    pub fn new(version: i64, name: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
        }
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.version, self.name)
    }
}

/// A row of the version ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub id: MigrationId,
    pub applied_at: DateTime<Utc>,
}

/// How a migration is reverted.
#[derive(Debug, Clone, PartialEq)]
pub enum Down {
    /// Derived by reversing every up operation, last to first.
    Auto,
    /// Explicit down operations.
    Reversible(Vec<Operation>),
    /// Reverting fails with [`Error::Irreversible`].
    Irreversible { reason: String },
    /// Reverting only removes the ledger entry, e.g. for data backfills that
    /// leave nothing to undo.
    NoOp { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationOptions {
    /// Run each operation outside of a wrapping transaction. Required for
    /// concurrent index builds and batched updates.
    pub disable_ddl_transaction: bool,
    /// Retry the whole step transaction when a table lock can not be taken.
    pub lock_retries: Option<LockRetryConfig>,
}

/// A single migration step.
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    pub id: MigrationId,
    pub up: Vec<Operation>,
    pub down: Down,
    pub options: MigrationOptions,
}

impl Migration {
    pub fn new(version: i64, name: impl Into<String>) -> Self {
        Self {
            id: MigrationId::new(version, name),
            up: Vec::new(),
            down: Down::Auto,
            options: MigrationOptions::default(),
        }
    }

    #[must_use]
    pub fn op(mut self, operation: Operation) -> Self {
        self.up.push(operation);
        self
    }

    #[must_use]
    pub fn ops(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.up.extend(operations);
        self
    }

    #[must_use]
    pub fn down(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.down = Down::Reversible(operations.into_iter().collect());
        self
    }

    #[must_use]
    pub fn irreversible(mut self, reason: impl Into<String>) -> Self {
        self.down = Down::Irreversible {
            reason: reason.into(),
        };
        self
    }

    #[must_use]
    pub fn noop_down(mut self, reason: impl Into<String>) -> Self {
        self.down = Down::NoOp {
            reason: reason.into(),
        };
        self
    }

    #[must_use]
    pub fn disable_ddl_transaction(mut self) -> Self {
        self.options.disable_ddl_transaction = true;
        self
    }

    #[must_use]
    pub fn with_lock_retries(mut self, config: LockRetryConfig) -> Self {
        self.options.lock_retries = Some(config);
        self
    }

    pub fn version(&self) -> i64 {
        self.id.version
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn is_transactional(&self) -> bool {
        !self.options.disable_ddl_transaction
    }

    pub fn is_reversible(&self) -> bool {
        match &self.down {
            Down::Auto => self.auto_down().is_ok(),
            Down::Reversible(_) | Down::NoOp { .. } => true,
            Down::Irreversible { .. } => false,
        }
    }

    /// Checks the definition without touching a database.
    pub fn validate(&self) -> Result<()> {
        if self.options.disable_ddl_transaction && self.options.lock_retries.is_some() {
            return Err(self.invalid(
                "lock retries wrap the step in a transaction and can not be combined \
                 with a disabled DDL transaction",
            ));
        }

        check_transaction_safety(&self.up, self.is_transactional())
            .map_err(|message| self.invalid(message))?;

        match &self.down {
            Down::Auto => {
                let down = self.auto_down().map_err(|reason| {
                    self.invalid(format!(
                        "{reason}; provide down operations or mark the migration irreversible"
                    ))
                })?;
                check_transaction_safety(&down, self.is_transactional())
                    .map_err(|message| self.invalid(message))?;
            }
            Down::Reversible(operations) => {
                check_transaction_safety(operations, self.is_transactional())
                    .map_err(|message| self.invalid(message))?;
            }
            Down::Irreversible { .. } | Down::NoOp { .. } => {}
        }

        Ok(())
    }

    /// The operations that revert this migration.
    pub fn down_operations(&self) -> Result<Vec<Operation>> {
        match &self.down {
            Down::Auto => self.auto_down().map_err(|reason| Error::Irreversible {
                id: self.id.clone(),
                reason,
            }),
            Down::Reversible(operations) => Ok(operations.clone()),
            Down::NoOp { .. } => Ok(Vec::new()),
            Down::Irreversible { reason } => Err(Error::Irreversible {
                id: self.id.clone(),
                reason: reason.clone(),
            }),
        }
    }

    fn auto_down(&self) -> std::result::Result<Vec<Operation>, String> {
        let mut operations = Vec::with_capacity(self.up.len());
        for operation in self.up.iter().rev() {
            match operation.reverse() {
                Reversal::Apply(reverse) => operations.push(reverse),
                Reversal::Nothing => {}
                Reversal::Impossible(reason) => return Err(reason),
            }
        }
        Ok(operations)
    }

    fn invalid(&self, message: impl Into<String>) -> Error {
        Error::InvalidMigration {
            id: self.id.clone(),
            message: message.into(),
        }
    }
}

fn check_transaction_safety(
    operations: &[Operation],
    in_transaction: bool,
) -> std::result::Result<(), String> {
    for operation in operations {
        if in_transaction && operation.requires_no_transaction() {
            return Err(format!(
                "{} can not be run inside a transaction, disable the DDL transaction \
                 for this migration",
                operation.kind()
            ));
        }

        // The body of a lock-retry block always runs inside its own transaction.
        if let Operation::WithLockRetries { operations, .. } = operation {
            check_transaction_safety(operations, true)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ColumnDef, IndexDef};

    #[test]
    fn ids_order_by_version_then_name() {
        let mut ids = [
            MigrationId::new(20240102000000, "b"),
            MigrationId::new(20240101000000, "z"),
            MigrationId::new(20240102000000, "a"),
        ];
        ids.sort();

        assert_eq!(ids[0], MigrationId::new(20240101000000, "z"));
        assert_eq!(ids[1], MigrationId::new(20240102000000, "a"));
        assert_eq!(ids[2], MigrationId::new(20240102000000, "b"));
    }

    #[test]
    fn auto_down_reverses_operations_in_reverse_order() {
        let migration = Migration::new(1, "add_users")
            .op(Operation::create_table(
                "users",
                [ColumnDef::new("id", "bigserial").not_null()],
            ))
            .op(Operation::add_column("users", ColumnDef::new("email", "text")));

        let down = migration.down_operations().unwrap();

        assert_eq!(down.len(), 2);
        assert!(matches!(&down[0], Operation::RemoveColumn { column, .. } if column == "email"));
        assert!(matches!(&down[1], Operation::DropTable { table, .. } if table == "users"));
    }

    #[test]
    fn auto_down_with_irreversible_operation_is_rejected_at_validation() {
        let migration = Migration::new(1, "raw").op(Operation::execute("SELECT 1"));

        let err = migration.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidMigration { .. }));
        assert!(!migration.is_reversible());
    }

    #[test]
    fn concurrent_index_in_transactional_step_is_rejected() {
        let migration = Migration::new(1, "index_users")
            .op(Operation::AddIndex(IndexDef::new("users", ["email"]).concurrently()));

        let err = migration.validate().unwrap_err();
        assert!(err.to_string().contains("add_concurrent_index"));

        let migration = migration.disable_ddl_transaction();
        assert!(migration.validate().is_ok());
    }

    #[test]
    fn lock_retries_require_a_transaction() {
        let migration = Migration::new(1, "add_fk")
            .op(Operation::execute("SELECT 1"))
            .irreversible("raw sql")
            .disable_ddl_transaction()
            .with_lock_retries(LockRetryConfig::default());

        assert!(migration.validate().is_err());
    }

    #[test]
    fn irreversible_and_noop_down_paths() {
        let irreversible = Migration::new(1, "drop_legacy")
            .op(Operation::execute("DROP TABLE legacy"))
            .irreversible("legacy data is gone");
        assert!(matches!(
            irreversible.down_operations(),
            Err(Error::Irreversible { .. })
        ));

        let noop = Migration::new(2, "backfill")
            .op(Operation::execute("UPDATE users SET active = TRUE"))
            .noop_down("data change");
        assert!(noop.down_operations().unwrap().is_empty());
        assert!(noop.validate().is_ok());
    }
}
