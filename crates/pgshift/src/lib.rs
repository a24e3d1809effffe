pub use chrono;
pub use sqlx;
pub use uuid;

pub mod background;
pub mod concurrent;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod lock;
pub mod migration;
pub mod operation;
pub mod registry;
pub mod source;
pub mod sql;

pub use background::{
    Backfill, BackfillRegistry, BackgroundJob, BackgroundJobBridge, BackgroundMigration,
    CompletionToken, JobCounts, JobStatus, worker::Worker,
};
pub use concurrent::{ConcurrentIndexGuard, IndexOutcome};
pub use config::Config;
pub use driver::{Driver, MemoryDriver, PgDriver};
pub use error::{Error, Result};
pub use executor::{Executor, RunReport, StepReport, StepState};
pub use ledger::VersionLedger;
pub use lock::{LockCoordinator, LockRetryConfig};
pub use migration::{Down, Migration, MigrationId, MigrationOptions, MigrationRecord};
pub use operation::{BackfillValue, ColumnDef, ForeignKeyDef, IndexDef, OnDelete, Operation};
pub use registry::{MigrationRegistry, MigrationStatus, StatusEntry};
