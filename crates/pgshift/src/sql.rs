//! Postgres DDL/DML rendering for [`Operation`]s.
//!
//! Constraints are always added `NOT VALID`; validation is issued as a
//! separate [`Operation::ValidateConstraint`] so the long scan runs without
//! the `ACCESS EXCLUSIVE` lock taken by `ADD CONSTRAINT`.

use std::fmt::Write as _;

use crate::driver::BatchRange;
use crate::error::{Error, Result};
use crate::operation::{
    BackfillValue, ColumnDef, IndexDef, Operation, not_null_constraint_name, text_limit_name,
};

pub fn quote_ident(identifier: &str) -> String {
    identifier
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Check expression backing `add_not_null_constraint`.
pub fn not_null_check(column: &str) -> String {
    format!("{} IS NOT NULL", quote_ident(column))
}

pub fn text_limit_check(column: &str, limit: u32) -> String {
    format!("char_length({}) <= {limit}", quote_ident(column))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn column_definition(column: &ColumnDef) -> String {
    let mut sql = format!("{} {}", quote_ident(&column.name), column.sql_type);
    if let Some(default) = &column.default {
        let _ = write!(sql, " DEFAULT {default}");
    }
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    sql
}

fn value_expression(value: &BackfillValue) -> String {
    match value {
        BackfillValue::Literal(serde_json::Value::Null) => "NULL".to_string(),
        BackfillValue::Literal(serde_json::Value::Bool(b)) => {
            if *b { "TRUE" } else { "FALSE" }.to_string()
        }
        BackfillValue::Literal(serde_json::Value::Number(n)) => n.to_string(),
        BackfillValue::Literal(serde_json::Value::String(s)) => quote_literal(s),
        BackfillValue::Literal(other) => format!("{}::jsonb", quote_literal(&other.to_string())),
        BackfillValue::Column(column) => quote_ident(column),
        BackfillValue::Sql(expression) => expression.clone(),
    }
}

fn create_index(index: &IndexDef) -> String {
    let columns = index
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!(
        "CREATE {}INDEX {}{} ON {} ({columns})",
        if index.unique { "UNIQUE " } else { "" },
        if index.concurrently { "CONCURRENTLY " } else { "" },
        quote_ident(&index.name()),
        quote_ident(&index.table),
    );
    if let Some(predicate) = &index.predicate {
        let _ = write!(sql, " WHERE {predicate}");
    }
    sql
}

fn add_check(table: &str, name: &str, check: &str) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({check}) NOT VALID",
        quote_ident(table),
        quote_ident(name),
    )
}

pub fn update_column(
    table: &str,
    column: &str,
    value: &BackfillValue,
    batch_column: &str,
    range: Option<BatchRange>,
) -> String {
    let mut sql = format!(
        "UPDATE {} SET {} = {}",
        quote_ident(table),
        quote_ident(column),
        value_expression(value),
    );
    if let Some(range) = range {
        let _ = write!(
            sql,
            " WHERE {} BETWEEN {} AND {}",
            quote_ident(batch_column),
            range.start,
            range.end
        );
    }
    sql
}

/// Renders a single statement. Operations that the executor breaks down
/// itself (batched updates, lock-retry blocks, background migrations) have no
/// single-statement form.
pub fn render(operation: &Operation) -> Result<String> {
    let sql = match operation {
        Operation::CreateTable { table, columns } => format!(
            "CREATE TABLE {} ({})",
            quote_ident(table),
            columns
                .iter()
                .map(column_definition)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Operation::DropTable { table, .. } => format!("DROP TABLE {}", quote_ident(table)),
        Operation::AddColumn { table, column } => format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(table),
            column_definition(column)
        ),
        Operation::RemoveColumn { table, column, .. } => format!(
            "ALTER TABLE {} DROP COLUMN {}",
            quote_ident(table),
            quote_ident(column)
        ),
        Operation::AddIndex(index) => create_index(index),
        Operation::RemoveIndex(index) if index.concurrently => {
            format!("DROP INDEX CONCURRENTLY IF EXISTS {}", quote_ident(&index.name()))
        }
        Operation::RemoveIndex(index) => format!("DROP INDEX {}", quote_ident(&index.name())),
        Operation::AddForeignKey(fk) => format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} NOT VALID",
            quote_ident(&fk.table),
            quote_ident(&fk.name()),
            quote_ident(&fk.column),
            quote_ident(&fk.target_table),
            quote_ident(&fk.target_column),
            fk.on_delete.as_sql(),
        ),
        Operation::RemoveForeignKey(fk) => format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
            quote_ident(&fk.table),
            quote_ident(&fk.name())
        ),
        Operation::AddCheckConstraint {
            table, name, check, ..
        } => add_check(table, name, check),
        Operation::AddNotNullConstraint {
            table,
            column,
            name,
            ..
        } => add_check(
            table,
            &name
                .clone()
                .unwrap_or_else(|| not_null_constraint_name(table, column)),
            &not_null_check(column),
        ),
        Operation::AddTextLimit {
            table,
            column,
            limit,
            name,
            ..
        } => add_check(
            table,
            &name.clone().unwrap_or_else(|| text_limit_name(table, column)),
            &text_limit_check(column, *limit),
        ),
        Operation::ValidateConstraint { table, name } => format!(
            "ALTER TABLE {} VALIDATE CONSTRAINT {}",
            quote_ident(table),
            quote_ident(name)
        ),
        Operation::RemoveConstraint { table, name, .. } => format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
            quote_ident(table),
            quote_ident(name)
        ),
        Operation::Execute { sql, .. } => sql.clone(),
        Operation::UpdateColumn {
            table,
            column,
            value,
            batch_column,
            range,
        } => update_column(table, column, value, batch_column, *range),
        Operation::UpdateColumnInBatches { .. }
        | Operation::WithLockRetries { .. }
        | Operation::QueueBackgroundMigration(_)
        | Operation::FinalizeBackgroundMigration { .. } => {
            return Err(Error::Unsupported {
                driver: "sql",
                feature: format!("rendering {} as a single statement", operation.kind()),
            });
        }
    };
    Ok(sql)
}
