use thiserror::Error;

use crate::migration::MigrationId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type for migration operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid migration filename: {0}")]
    InvalidFilename(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Statement failed: {0}")]
    Statement(String),

    #[error("SerdeJsonError: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Migration {0} is defined more than once")]
    DuplicateMigration(MigrationId),

    #[error("Migration {id} is invalid: {message}")]
    InvalidMigration { id: MigrationId, message: String },

    #[error("Migration {0} is already applied")]
    AlreadyApplied(MigrationId),

    #[error("No migration with version {0}")]
    UnknownVersion(i64),

    #[error("Version {0} matches more than one migration")]
    AmbiguousVersion(i64),

    #[error("Migration {0} is recorded as applied but has no definition")]
    MissingDefinition(MigrationId),

    /// A single statement gave up waiting for a table lock. Retried by
    /// [`crate::lock::LockCoordinator::with_lock_retries`].
    #[error("Lock not available: {0}")]
    LockNotAvailable(String),

    #[error("Timed out acquiring {resource} after {attempts} attempt(s)")]
    LockTimeout { resource: String, attempts: usize },

    #[error("Migration {id} cannot be reversed: {reason}")]
    Irreversible { id: MigrationId, reason: String },

    #[error(
        "Concurrent build of index {index} on {table} failed, the invalid index was dropped: {cause}"
    )]
    InvalidIndex {
        table: String,
        index: String,
        cause: String,
    },

    #[error(
        "Background migration {job} is not finished: {pending} batch(es) pending, {failed} failed"
    )]
    PartialBackfill {
        job: String,
        pending: i64,
        failed: i64,
    },

    #[error("No background migration registered as {0}")]
    UnknownBackfill(String),

    #[error(
        "Could not find {object} which was referenced during the migration. \
         The database schema may have strayed from the expected state, \
         verify that all previous migrations have completed"
    )]
    MissingSchemaObject { object: String },

    #[error(
        "{0} can not be run inside a transaction, disable the DDL transaction for this migration"
    )]
    TransactionOpen(&'static str),

    #[error("{feature} is not supported by the {driver} driver")]
    Unsupported {
        driver: &'static str,
        feature: String,
    },

    #[error("Migration {id} failed: {source}")]
    StepFailed {
        id: MigrationId,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn missing(kind: &str, table: &str, name: &str) -> Self {
        Self::MissingSchemaObject {
            object: format!("{kind} \"{name}\" on table \"{table}\""),
        }
    }

    pub(crate) fn missing_table(table: &str) -> Self {
        Self::MissingSchemaObject {
            object: format!("table \"{table}\""),
        }
    }

    /// True when the statement failed only because a lock could not be taken
    /// within the session's `lock_timeout`.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self.root_cause(), Self::LockNotAvailable(_))
    }

    /// Unwraps [`Error::StepFailed`] down to the error raised by the step.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::StepFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Everything aborts the batch except re-applying an applied migration.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.root_cause(), Self::AlreadyApplied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failure_exposes_root_cause() {
        let err = Error::StepFailed {
            id: MigrationId::new(20240101000000, "add_users"),
            source: Box::new(Error::LockNotAvailable("users".to_string())),
        };

        assert!(err.is_lock_contention());
        assert!(err.is_fatal());
        assert!(err.to_string().contains("20240101000000_add_users"));
    }

    #[test]
    fn already_applied_is_not_fatal() {
        let err = Error::AlreadyApplied(MigrationId::new(1, "init"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn missing_object_message_names_table_and_object() {
        let message = Error::missing("column", "users", "email").to_string();
        assert!(message.contains("column \"email\" on table \"users\""));
    }
}
