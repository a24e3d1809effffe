//! An in-process model of a Postgres schema.
//!
//! Tables, columns, rows, indexes (with validity), constraints, the ledger and
//! the job queue live behind one shared mutex, so several sessions created with
//! [`MemoryDriver::session`] see the same database and compete for the same
//! advisory locks. Each session snapshots the schema on `BEGIN` and restores it
//! on `ROLLBACK`.
//!
//! `Execute` statements are recorded but not interpreted.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{BatchRange, ClaimMode, Driver, IndexStatus, NewJob, retry_backoff};
use crate::background::{BackgroundJob, DEFAULT_LOCK_TIMEOUT, JobCounts, JobStatus};
use crate::error::{Error, Result};
use crate::migration::{MigrationId, MigrationRecord};
use crate::operation::{
    BackfillValue, ColumnDef, Operation, not_null_constraint_name, text_limit_name,
};
use crate::sql;

pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Column {
    name: String,
    sql_type: String,
    nullable: bool,
}

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<Column>,
    rows: Vec<Row>,
}

impl Table {
    fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone)]
struct Index {
    table: String,
    columns: Vec<String>,
    valid: bool,
}

#[derive(Debug, Clone)]
struct Constraint {
    validated: bool,
}

#[derive(Debug, Clone, Default)]
struct Schema {
    tables: BTreeMap<String, Table>,
    indexes: BTreeMap<String, Index>,
    constraints: BTreeMap<(String, String), Constraint>,
    ledger: Option<BTreeMap<MigrationId, DateTime<Utc>>>,
    jobs: Option<Vec<BackgroundJob>>,
}

#[derive(Debug, Default)]
struct Shared {
    schema: Schema,
    advisory_locks: HashMap<i64, u64>,
    contention: HashMap<String, usize>,
    failing_builds: HashSet<String>,
    statements: Vec<String>,
    next_session: u64,
}

/// The comparable shape of a schema: tables with their columns, indexes and
/// constraints. Rows, the ledger and the job queue are not part of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaShape {
    pub tables: BTreeMap<String, Vec<(String, String, bool)>>,
    pub indexes: BTreeMap<String, (String, Vec<String>, bool)>,
    pub constraints: BTreeSet<(String, String)>,
}

#[derive(Debug)]
pub struct MemoryDriver {
    session: u64,
    shared: Arc<Mutex<Shared>>,
    snapshot: Option<Schema>,
    lock_timeout: Option<Duration>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            session: 0,
            shared: Arc::new(Mutex::new(Shared {
                next_session: 1,
                ..Shared::default()
            })),
            snapshot: None,
            lock_timeout: None,
        }
    }

    /// Another connection to the same database.
    pub fn session(&self) -> Self {
        let mut shared = self.lock();
        let session = shared.next_session;
        shared.next_session += 1;
        Self {
            session,
            shared: Arc::clone(&self.shared),
            snapshot: None,
            lock_timeout: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        // A panic while holding the lock only happens in a failing test.
        self.shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn log(&self, statement: impl Into<String>) {
        self.lock().statements.push(statement.into());
    }

    /// Every statement issued so far, across sessions.
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    /// Inserts rows given as JSON objects.
    pub fn insert_rows(&self, table: &str, rows: impl IntoIterator<Item = Value>) -> Result<()> {
        let mut shared = self.lock();
        let table_state = shared
            .schema
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::missing_table(table))?;

        for value in rows {
            let Value::Object(object) = value else {
                return Err(Error::Statement(format!(
                    "rows for {table} must be JSON objects"
                )));
            };
            let mut row = Row::new();
            for column in &table_state.columns {
                row.insert(column.name.clone(), Value::Null);
            }
            for (key, value) in object {
                if table_state.column(&key).is_none() {
                    return Err(Error::missing("column", table, &key));
                }
                row.insert(key, value);
            }
            table_state.rows.push(row);
        }
        Ok(())
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .schema
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Another session holds a lock on `table`: the next `attempts` statements
    /// that need a table lock fail as if their `lock_timeout` expired.
    pub fn contend(&self, table: &str, attempts: usize) {
        self.lock().contention.insert(table.to_string(), attempts);
    }

    /// The next concurrent build of `index` fails halfway, leaving an invalid
    /// index behind.
    pub fn fail_concurrent_build(&self, index: &str) {
        self.lock().failing_builds.insert(index.to_string());
    }

    /// Simulates a crashed `CREATE INDEX CONCURRENTLY` from an earlier run.
    pub fn insert_invalid_index(&self, table: &str, index: &str, columns: &[&str]) {
        self.lock().schema.indexes.insert(
            index.to_string(),
            Index {
                table: table.to_string(),
                columns: columns.iter().map(ToString::to_string).collect(),
                valid: false,
            },
        );
    }

    pub fn jobs(&self) -> Vec<BackgroundJob> {
        self.lock().schema.jobs.clone().unwrap_or_default()
    }

    pub fn constraint_validated(&self, table: &str, name: &str) -> Option<bool> {
        self.lock()
            .schema
            .constraints
            .get(&(table.to_string(), name.to_string()))
            .map(|c| c.validated)
    }

    pub fn shape(&self) -> SchemaShape {
        let shared = self.lock();
        let schema = &shared.schema;
        SchemaShape {
            tables: schema
                .tables
                .iter()
                .map(|(name, table)| {
                    let columns = table
                        .columns
                        .iter()
                        .map(|c| (c.name.clone(), c.sql_type.clone(), c.nullable))
                        .collect();
                    (name.clone(), columns)
                })
                .collect(),
            indexes: schema
                .indexes
                .iter()
                .map(|(name, index)| {
                    (
                        name.clone(),
                        (index.table.clone(), index.columns.clone(), index.valid),
                    )
                })
                .collect(),
            constraints: schema.constraints.keys().cloned().collect(),
        }
    }

    fn take_contention(&self, operation: &Operation) -> Result<()> {
        let needs_table_lock = match operation {
            Operation::AddIndex(index) | Operation::RemoveIndex(index) => !index.concurrently,
            Operation::UpdateColumn { .. }
            | Operation::ValidateConstraint { .. }
            | Operation::Execute { .. } => false,
            _ => true,
        };
        let Some(table) = operation.table().filter(|_| needs_table_lock) else {
            return Ok(());
        };

        let mut shared = self.lock();
        if let Some(remaining) = shared.contention.get_mut(table) {
            if *remaining > 0 {
                *remaining -= 1;
                let waited = self.lock_timeout.map_or(0, |t| t.as_millis());
                return Err(Error::LockNotAvailable(format!(
                    "canceling statement due to lock timeout after {waited}ms on relation \"{table}\""
                )));
            }
        }
        Ok(())
    }

    fn with_schema<T>(&self, f: impl FnOnce(&mut Schema) -> Result<T>) -> Result<T> {
        let mut shared = self.lock();
        f(&mut shared.schema)
    }
}

fn table_mut<'a>(schema: &'a mut Schema, table: &str) -> Result<&'a mut Table> {
    schema
        .tables
        .get_mut(table)
        .ok_or_else(|| Error::missing_table(table))
}

fn parse_default(default: Option<&String>) -> Value {
    default.map_or(Value::Null, |expression| {
        serde_json::from_str(expression)
            .unwrap_or_else(|_| Value::String(expression.trim_matches('\'').to_string()))
    })
}

fn key_of(row: &Row, column: &str) -> Option<i64> {
    row.get(column).and_then(Value::as_i64)
}

fn add_constraint(schema: &mut Schema, table: &str, name: &str) -> Result<u64> {
    if !schema.tables.contains_key(table) {
        return Err(Error::missing_table(table));
    }
    let key = (table.to_string(), name.to_string());
    if schema.constraints.contains_key(&key) {
        return Err(Error::Statement(format!(
            "constraint \"{name}\" for relation \"{table}\" already exists"
        )));
    }
    schema
        .constraints
        .insert(key, Constraint { validated: false });
    Ok(0)
}

fn require_column(schema: &Schema, table: &str, column: &str) -> Result<()> {
    let table_state = schema
        .tables
        .get(table)
        .ok_or_else(|| Error::missing_table(table))?;
    if table_state.column(column).is_none() {
        return Err(Error::missing("column", table, column));
    }
    Ok(())
}

fn create_table(schema: &mut Schema, table: &str, columns: &[ColumnDef]) -> Result<u64> {
    if schema.tables.contains_key(table) {
        return Err(Error::Statement(format!(
            "relation \"{table}\" already exists"
        )));
    }
    schema.tables.insert(
        table.to_string(),
        Table {
            columns: columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    sql_type: c.sql_type.clone(),
                    nullable: c.nullable,
                })
                .collect(),
            rows: Vec::new(),
        },
    );
    Ok(0)
}

fn add_column(schema: &mut Schema, table: &str, column: &ColumnDef) -> Result<u64> {
    let table_state = table_mut(schema, table)?;
    if table_state.column(&column.name).is_some() {
        return Err(Error::Statement(format!(
            "column \"{}\" of relation \"{table}\" already exists",
            column.name
        )));
    }
    let value = parse_default(column.default.as_ref());
    if !column.nullable && value.is_null() && !table_state.rows.is_empty() {
        return Err(Error::Statement(format!(
            "column \"{}\" of relation \"{table}\" contains null values",
            column.name
        )));
    }
    table_state.columns.push(Column {
        name: column.name.clone(),
        sql_type: column.sql_type.clone(),
        nullable: column.nullable,
    });
    for row in &mut table_state.rows {
        row.insert(column.name.clone(), value.clone());
    }
    Ok(0)
}

fn remove_column(schema: &mut Schema, table: &str, column: &str) -> Result<u64> {
    let table_state = table_mut(schema, table)?;
    let before = table_state.columns.len();
    table_state.columns.retain(|c| c.name != column);
    if table_state.columns.len() == before {
        return Err(Error::missing("column", table, column));
    }
    for row in &mut table_state.rows {
        row.remove(column);
    }
    schema
        .indexes
        .retain(|_, index| !(index.table == table && index.columns.iter().any(|c| c == column)));
    Ok(0)
}

fn update_column(
    schema: &mut Schema,
    table: &str,
    column: &str,
    value: &BackfillValue,
    batch_column: &str,
    range: Option<BatchRange>,
) -> Result<u64> {
    require_column(schema, table, column)?;
    if range.is_some() {
        require_column(schema, table, batch_column)?;
    }
    if let BackfillValue::Column(source) = value {
        require_column(schema, table, source)?;
    }

    let table_state = table_mut(schema, table)?;
    let mut updated = 0;
    for row in &mut table_state.rows {
        if let Some(range) = range {
            if !key_of(row, batch_column).is_some_and(|key| range.contains(key)) {
                continue;
            }
        }
        let new_value = match value {
            BackfillValue::Literal(literal) => literal.clone(),
            BackfillValue::Column(source) => row.get(source).cloned().unwrap_or(Value::Null),
            BackfillValue::Sql(_) => {
                return Err(Error::Unsupported {
                    driver: "memory",
                    feature: "SQL expression backfills".to_string(),
                });
            }
        };
        row.insert(column.to_string(), new_value);
        updated += 1;
    }
    Ok(updated)
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            return Err(Error::Statement(
                "there is already a transaction in progress".to_string(),
            ));
        }
        self.log("BEGIN");
        let schema = self.lock().schema.clone();
        self.snapshot = Some(schema);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.log("COMMIT");
        self.snapshot = None;
        self.lock_timeout = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.log("ROLLBACK");
        if let Some(snapshot) = self.snapshot.take() {
            self.lock().schema = snapshot;
        }
        self.lock_timeout = None;
        Ok(())
    }

    fn transaction_open(&self) -> bool {
        self.snapshot.is_some()
    }

    async fn set_lock_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        let millis = timeout.map_or(0, |t| t.as_millis());
        self.log(format!("SET LOCAL lock_timeout TO '{millis}ms'"));
        self.lock_timeout = timeout;
        Ok(())
    }

    async fn set_statement_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        let millis = timeout.map_or(0, |t| t.as_millis());
        self.log(format!("SET statement_timeout TO {millis}"));
        Ok(())
    }

    async fn reset_statement_timeout(&mut self) -> Result<()> {
        self.log("RESET statement_timeout");
        Ok(())
    }

    async fn apply(&mut self, operation: &Operation) -> Result<u64> {
        self.log(sql::render(operation)?);
        self.take_contention(operation)?;

        let in_transaction = self.transaction_open();
        if in_transaction && operation.cannot_run_in_transaction_block() {
            return Err(Error::Statement(format!(
                "{} cannot run inside a transaction block",
                operation.kind()
            )));
        }

        let mut shared = self.lock();
        let Shared {
            schema,
            failing_builds,
            ..
        } = &mut *shared;

        match operation {
            Operation::CreateTable { table, columns } => create_table(schema, table, columns),
            Operation::DropTable { table, .. } => {
                if schema.tables.remove(table).is_none() {
                    return Err(Error::missing_table(table));
                }
                schema.indexes.retain(|_, index| index.table != *table);
                schema.constraints.retain(|(t, _), _| t != table);
                Ok(0)
            }
            Operation::AddColumn { table, column } => add_column(schema, table, column),
            Operation::RemoveColumn { table, column, .. } => remove_column(schema, table, column),
            Operation::AddIndex(index) => {
                for column in &index.columns {
                    require_column(schema, &index.table, column)?;
                }
                let name = index.name();
                if schema.indexes.contains_key(&name) {
                    return Err(Error::Statement(format!(
                        "relation \"{name}\" already exists"
                    )));
                }
                let failed = index.concurrently && failing_builds.remove(&name);
                schema.indexes.insert(
                    name.clone(),
                    Index {
                        table: index.table.clone(),
                        columns: index.columns.clone(),
                        valid: !failed,
                    },
                );
                if failed {
                    return Err(Error::Statement(format!(
                        "could not create index \"{name}\": build was interrupted"
                    )));
                }
                Ok(0)
            }
            Operation::RemoveIndex(index) => {
                let name = index.name();
                if schema.indexes.remove(&name).is_none() && !index.concurrently {
                    return Err(Error::missing("index", &index.table, &name));
                }
                Ok(0)
            }
            Operation::AddForeignKey(fk) => {
                require_column(schema, &fk.table, &fk.column)?;
                require_column(schema, &fk.target_table, &fk.target_column)?;
                add_constraint(schema, &fk.table, &fk.name())
            }
            Operation::AddCheckConstraint { table, name, .. } => {
                add_constraint(schema, table, name)
            }
            Operation::AddNotNullConstraint {
                table,
                column,
                name,
                ..
            } => {
                require_column(schema, table, column)?;
                let name = name
                    .clone()
                    .unwrap_or_else(|| not_null_constraint_name(table, column));
                add_constraint(schema, table, &name)
            }
            Operation::AddTextLimit {
                table,
                column,
                name,
                ..
            } => {
                require_column(schema, table, column)?;
                let name = name.clone().unwrap_or_else(|| text_limit_name(table, column));
                add_constraint(schema, table, &name)
            }
            Operation::ValidateConstraint { table, name } => {
                let constraint = schema
                    .constraints
                    .get_mut(&(table.clone(), name.clone()))
                    .ok_or_else(|| Error::missing("constraint", table, name))?;
                constraint.validated = true;
                Ok(0)
            }
            Operation::RemoveForeignKey(fk) => {
                schema
                    .constraints
                    .remove(&(fk.table.clone(), fk.name()));
                Ok(0)
            }
            Operation::RemoveConstraint { table, name, .. } => {
                schema.constraints.remove(&(table.clone(), name.clone()));
                Ok(0)
            }
            Operation::Execute { .. } => Ok(0),
            Operation::UpdateColumn {
                table,
                column,
                value,
                batch_column,
                range,
            } => update_column(schema, table, column, value, batch_column, *range),
            Operation::UpdateColumnInBatches { .. }
            | Operation::WithLockRetries { .. }
            | Operation::QueueBackgroundMigration(_)
            | Operation::FinalizeBackgroundMigration { .. } => Err(Error::Unsupported {
                driver: "memory",
                feature: operation.kind().to_string(),
            }),
        }
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(self.lock().schema.tables.contains_key(table))
    }

    async fn column_exists(&mut self, table: &str, column: &str) -> Result<bool> {
        Ok(self
            .lock()
            .schema
            .tables
            .get(table)
            .is_some_and(|t| t.column(column).is_some()))
    }

    async fn column_is_nullable(&mut self, table: &str, column: &str) -> Result<bool> {
        self.lock()
            .schema
            .tables
            .get(table)
            .and_then(|t| t.column(column))
            .map(|c| c.nullable)
            .ok_or_else(|| Error::missing("column", table, column))
    }

    async fn index_status(&mut self, table: &str, index: &str) -> Result<Option<IndexStatus>> {
        Ok(self
            .lock()
            .schema
            .indexes
            .get(index)
            .filter(|i| i.table == table)
            .map(|i| {
                if i.valid {
                    IndexStatus::Valid
                } else {
                    IndexStatus::Invalid
                }
            }))
    }

    async fn constraint_exists(&mut self, table: &str, name: &str) -> Result<bool> {
        Ok(self
            .lock()
            .schema
            .constraints
            .contains_key(&(table.to_string(), name.to_string())))
    }

    async fn row_count(&mut self, table: &str) -> Result<u64> {
        self.with_schema(|schema| {
            let table_state = table_mut(schema, table)?;
            Ok(table_state.rows.len() as u64)
        })
    }

    async fn key_batches(
        &mut self,
        table: &str,
        column: &str,
        batch_size: u64,
    ) -> Result<Vec<BatchRange>> {
        self.with_schema(|schema| {
            require_column(schema, table, column)?;
            let table_state = table_mut(schema, table)?;

            let mut keys: Vec<i64> = table_state
                .rows
                .iter()
                .filter_map(|row| key_of(row, column))
                .collect();
            keys.sort_unstable();

            let chunk = usize::try_from(batch_size.max(1)).unwrap_or(usize::MAX);
            Ok(keys
                .chunks(chunk)
                .filter_map(|chunk| Some(BatchRange::new(*chunk.first()?, *chunk.last()?)))
                .collect())
        })
    }

    async fn ensure_ledger(&mut self) -> Result<()> {
        self.with_schema(|schema| {
            schema.ledger.get_or_insert_with(BTreeMap::new);
            Ok(())
        })
    }

    async fn applied_migrations(&mut self) -> Result<Vec<MigrationRecord>> {
        self.with_schema(|schema| {
            let ledger = schema
                .ledger
                .as_ref()
                .ok_or_else(|| Error::missing_table("_pgshift_migrations"))?;
            Ok(ledger
                .iter()
                .map(|(id, applied_at)| MigrationRecord {
                    id: id.clone(),
                    applied_at: *applied_at,
                })
                .collect())
        })
    }

    async fn insert_ledger_row(&mut self, id: &MigrationId) -> Result<()> {
        self.log(format!("INSERT INTO _pgshift_migrations {id}"));
        self.with_schema(|schema| {
            let ledger = schema
                .ledger
                .as_mut()
                .ok_or_else(|| Error::missing_table("_pgshift_migrations"))?;
            if ledger.contains_key(id) {
                return Err(Error::Statement(format!(
                    "duplicate key value violates unique constraint for {id}"
                )));
            }
            ledger.insert(id.clone(), Utc::now());
            Ok(())
        })
    }

    async fn delete_ledger_row(&mut self, id: &MigrationId) -> Result<()> {
        self.log(format!("DELETE FROM _pgshift_migrations {id}"));
        self.with_schema(|schema| {
            let ledger = schema
                .ledger
                .as_mut()
                .ok_or_else(|| Error::missing_table("_pgshift_migrations"))?;
            ledger.remove(id);
            Ok(())
        })
    }

    async fn try_advisory_lock(&mut self, key: i64) -> Result<bool> {
        let session = self.session;
        let mut shared = self.lock();
        match shared.advisory_locks.get(&key) {
            Some(holder) => Ok(*holder == session),
            None => {
                shared.advisory_locks.insert(key, session);
                Ok(true)
            }
        }
    }

    async fn advisory_unlock(&mut self, key: i64) -> Result<bool> {
        let session = self.session;
        let mut shared = self.lock();
        if shared.advisory_locks.get(&key) == Some(&session) {
            shared.advisory_locks.remove(&key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn ensure_job_queue(&mut self) -> Result<()> {
        self.with_schema(|schema| {
            schema.jobs.get_or_insert_with(Vec::new);
            Ok(())
        })
    }

    async fn enqueue_jobs(&mut self, jobs: &[NewJob]) -> Result<Vec<Uuid>> {
        self.with_schema(|schema| {
            let queue = schema
                .jobs
                .as_mut()
                .ok_or_else(|| Error::missing_table("_pgshift_background_jobs"))?;
            let now = Utc::now();
            let mut ids = Vec::with_capacity(jobs.len());
            for job in jobs {
                let id = Uuid::new_v4();
                queue.push(BackgroundJob {
                    id,
                    job_name: job.job_name.clone(),
                    table_name: job.table_name.clone(),
                    batch_column: job.batch_column.clone(),
                    range: job.range,
                    arguments: job.arguments.clone(),
                    status: JobStatus::Pending,
                    attempts: 0,
                    last_error: None,
                    run_at: job.run_at,
                    locked_by: None,
                    locked_at: None,
                    created_at: now,
                });
                ids.push(id);
            }
            Ok(ids)
        })
    }

    async fn jobs_queued(
        &mut self,
        job_name: &str,
        table: &str,
        arguments: &serde_json::Value,
    ) -> Result<bool> {
        self.with_schema(|schema| {
            Ok(schema.jobs.iter().flatten().any(|job| {
                job.job_name == job_name && job.table_name == table && job.arguments == *arguments
            }))
        })
    }

    async fn claim_job(
        &mut self,
        job_name: Option<&str>,
        worker_id: &str,
        mode: ClaimMode,
    ) -> Result<Option<BackgroundJob>> {
        self.with_schema(|schema| {
            let Some(queue) = schema.jobs.as_mut() else {
                return Ok(None);
            };
            let now = Utc::now();
            let stale_before = now
                - chrono::Duration::from_std(DEFAULT_LOCK_TIMEOUT)
                    .unwrap_or_else(|_| chrono::Duration::zero());
            let claimable = |job: &BackgroundJob| {
                job_name.is_none_or(|name| job.job_name == name)
                    && match mode {
                        ClaimMode::Worker => match job.status {
                            JobStatus::Pending => job.run_at <= now,
                            JobStatus::Running => {
                                job.locked_at.is_some_and(|locked| locked < stale_before)
                            }
                            _ => false,
                        },
                        ClaimMode::Steal => {
                            matches!(job.status, JobStatus::Pending | JobStatus::Failed)
                        }
                    }
            };

            let Some(job) = queue
                .iter_mut()
                .filter(|job| claimable(job))
                .min_by_key(|job| (job.run_at, job.created_at))
            else {
                return Ok(None);
            };

            job.status = JobStatus::Running;
            job.locked_by = Some(worker_id.to_string());
            job.locked_at = Some(now);
            job.attempts += 1;
            Ok(Some(job.clone()))
        })
    }

    async fn complete_job(&mut self, job_id: Uuid, worker_id: &str) -> Result<()> {
        self.with_schema(|schema| {
            if let Some(job) = schema.jobs.as_mut().and_then(|queue| {
                queue
                    .iter_mut()
                    .find(|job| job.id == job_id && job.locked_by.as_deref() == Some(worker_id))
            }) {
                job.status = JobStatus::Succeeded;
                job.locked_by = None;
                job.locked_at = None;
            }
            Ok(())
        })
    }

    async fn fail_job(
        &mut self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        max_retries: i32,
    ) -> Result<JobStatus> {
        self.with_schema(|schema| {
            let job = schema
                .jobs
                .as_mut()
                .and_then(|queue| {
                    queue.iter_mut().find(|job| {
                        job.id == job_id && job.locked_by.as_deref() == Some(worker_id)
                    })
                })
                .ok_or_else(|| Error::Statement(format!("job {job_id} is not locked by {worker_id}")))?;

            job.last_error = Some(error.to_string());
            job.locked_by = None;
            job.locked_at = None;
            if job.attempts >= max_retries {
                job.status = JobStatus::Failed;
            } else {
                job.status = JobStatus::Pending;
                job.run_at = Utc::now() + retry_backoff(job.attempts);
            }
            Ok(job.status)
        })
    }

    async fn job_counts(&mut self, job_name: &str) -> Result<JobCounts> {
        self.with_schema(|schema| {
            let mut counts = JobCounts::default();
            for job in schema.jobs.iter().flatten() {
                if job.job_name == job_name {
                    counts.record(job.status, 1);
                }
            }
            Ok(counts)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::IndexDef;

    fn users() -> Operation {
        Operation::create_table(
            "users",
            [
                ColumnDef::new("id", "bigint").not_null(),
                ColumnDef::new("name", "text"),
            ],
        )
    }

    #[tokio::test]
    async fn rollback_restores_schema() {
        let mut driver = MemoryDriver::new();

        driver.begin().await.unwrap();
        driver.apply(&users()).await.unwrap();
        assert!(driver.table_exists("users").await.unwrap());
        driver.rollback().await.unwrap();

        assert!(!driver.table_exists("users").await.unwrap());
    }

    #[tokio::test]
    async fn advisory_locks_are_exclusive_between_sessions() {
        let mut first = MemoryDriver::new();
        let mut second = first.session();

        assert!(first.try_advisory_lock(42).await.unwrap());
        assert!(!second.try_advisory_lock(42).await.unwrap());
        assert!(!second.advisory_unlock(42).await.unwrap());

        assert!(first.advisory_unlock(42).await.unwrap());
        assert!(second.try_advisory_lock(42).await.unwrap());
    }

    #[tokio::test]
    async fn contention_fails_table_locking_statements() {
        let mut driver = MemoryDriver::new();
        driver.apply(&users()).await.unwrap();
        driver.contend("users", 1);

        let add = Operation::add_column("users", ColumnDef::new("email", "text"));
        let err = driver.apply(&add).await.unwrap_err();
        assert!(err.is_lock_contention());

        driver.apply(&add).await.unwrap();
        assert!(driver.column_exists("users", "email").await.unwrap());
    }

    #[tokio::test]
    async fn index_on_missing_column_is_a_missing_schema_object() {
        let mut driver = MemoryDriver::new();
        driver.apply(&users()).await.unwrap();

        let err = driver
            .apply(&Operation::AddIndex(IndexDef::new("users", ["email"])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingSchemaObject { .. }));
    }

    #[tokio::test]
    async fn key_batches_split_sorted_keys() {
        let mut driver = MemoryDriver::new();
        driver.apply(&users()).await.unwrap();
        driver
            .insert_rows(
                "users",
                [5, 1, 3, 2, 4].map(|id| serde_json::json!({ "id": id })),
            )
            .unwrap();

        let batches = driver.key_batches("users", "id", 2).await.unwrap();
        assert_eq!(
            batches,
            vec![
                BatchRange::new(1, 2),
                BatchRange::new(3, 4),
                BatchRange::new(5, 5)
            ]
        );
    }

    #[tokio::test]
    async fn not_null_column_without_default_needs_an_empty_table() {
        let mut driver = MemoryDriver::new();
        driver.apply(&users()).await.unwrap();
        driver
            .insert_rows("users", [serde_json::json!({ "id": 1 })])
            .unwrap();

        let add = Operation::add_column("users", ColumnDef::new("email", "text").not_null());
        assert!(driver.apply(&add).await.is_err());

        let add = Operation::add_column(
            "users",
            ColumnDef::new("active", "boolean").not_null().default("true"),
        );
        driver.apply(&add).await.unwrap();
        assert_eq!(driver.rows("users")[0]["active"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn workers_reclaim_jobs_whose_lock_went_stale() {
        let mut driver = MemoryDriver::new();
        driver.ensure_job_queue().await.unwrap();
        driver
            .enqueue_jobs(&[NewJob {
                job_name: "UpdateColumn".to_string(),
                table_name: "users".to_string(),
                batch_column: "id".to_string(),
                range: BatchRange::new(1, 10),
                arguments: Value::Null,
                run_at: Utc::now(),
            }])
            .await
            .unwrap();

        let claimed = driver
            .claim_job(None, "worker-a", ClaimMode::Worker)
            .await
            .unwrap()
            .unwrap();
        assert!(
            driver
                .claim_job(None, "worker-b", ClaimMode::Worker)
                .await
                .unwrap()
                .is_none()
        );

        let stale = Utc::now() - chrono::Duration::hours(3);
        for job in driver.lock().schema.jobs.iter_mut().flatten() {
            job.locked_at = Some(stale);
        }

        let reclaimed = driver
            .claim_job(None, "worker-b", ClaimMode::Worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, claimed.id);
        assert_eq!(reclaimed.locked_by.as_deref(), Some("worker-b"));
        assert_eq!(reclaimed.attempts, 2);
    }
}
