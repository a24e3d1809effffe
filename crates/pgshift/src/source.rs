//! Loading migrations from a directory of SQL files.
//!
//! Looks for files matching the patterns:
//! - `YYYYMMDDHHMMSS_name.sql`
//! - `YYYYMMDDHHMMSS_name.up.sql` / `YYYYMMDDHHMMSS_name.down.sql`
//!
//! A migration without a down file is irreversible. Leading comment lines may
//! carry directives:
//! - `-- pgshift:disable-ddl-transaction`
//! - `-- pgshift:lock-retries`
//!
//! Each file becomes a single opaque `execute` operation. Operation guards and
//! the invalid-index cleanup of [`crate::ConcurrentIndexGuard`] do not apply to
//! it: a `CREATE INDEX CONCURRENTLY` that fails halfway leaves an invalid index
//! behind, and the file must drop it itself on rerun (for example with
//! `DROP INDEX CONCURRENTLY IF EXISTS` ahead of the build). Migrations that
//! need those guarantees should be written as typed operations.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::lock::LockRetryConfig;
use crate::migration::{Down, Migration, MigrationId, MigrationOptions};
use crate::operation::Operation;

pub const DISABLE_DDL_TRANSACTION: &str = "pgshift:disable-ddl-transaction";
pub const LOCK_RETRIES: &str = "pgshift:lock-retries";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Plain,
    Up,
    Down,
}

#[derive(Debug, Default)]
struct Files {
    plain: Option<String>,
    up: Option<String>,
    down: Option<String>,
}

/// Splits `20240101000000_create_users.up.sql` into its version, name and kind.
pub fn parse_migration_filename(filename: &str) -> Result<(i64, String, FileKind)> {
    let invalid = || Error::InvalidFilename(filename.to_string());

    let without_sql = filename.strip_suffix(".sql").ok_or_else(invalid)?;
    let (base, kind) = if let Some(base) = without_sql.strip_suffix(".up") {
        (base, FileKind::Up)
    } else if let Some(base) = without_sql.strip_suffix(".down") {
        (base, FileKind::Down)
    } else {
        (without_sql, FileKind::Plain)
    };

    let (version, name) = base.split_once('_').ok_or_else(invalid)?;
    if name.is_empty() || !version.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let version: i64 = version.parse().map_err(|_| invalid())?;

    Ok((version, name.to_string(), kind))
}

/// Options set by directives in the leading comment block.
pub fn parse_directives(sql: &str) -> MigrationOptions {
    let mut options = MigrationOptions::default();
    for line in sql.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        let Some(comment) = line.strip_prefix("--") else {
            break;
        };
        match comment.trim() {
            DISABLE_DDL_TRANSACTION => options.disable_ddl_transaction = true,
            LOCK_RETRIES => options.lock_retries = Some(LockRetryConfig::default()),
            _ => {}
        }
    }
    options
}

/// Loads every migration in `path`, ordered by version and name. A missing
/// directory has no migrations.
pub fn load_dir(path: impl AsRef<Path>) -> Result<Vec<Migration>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<_> = std::fs::read_dir(path)?.filter_map(Result::ok).collect();
    entries.sort_by_key(std::fs::DirEntry::file_name);

    let mut files: BTreeMap<MigrationId, Files> = BTreeMap::new();
    for entry in entries {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if !file_name.ends_with(".sql") {
            continue;
        }

        let (version, name, kind) = parse_migration_filename(&file_name)?;
        let sql = std::fs::read_to_string(entry.path())?;
        let slot = files.entry(MigrationId::new(version, name)).or_default();
        match kind {
            FileKind::Plain => slot.plain = Some(sql),
            FileKind::Up => slot.up = Some(sql),
            FileKind::Down => slot.down = Some(sql),
        }
    }

    files
        .into_iter()
        .map(|(id, files)| build(id, files))
        .collect()
}

fn build(id: MigrationId, files: Files) -> Result<Migration> {
    let up = match (files.plain, files.up) {
        (Some(_), Some(_)) => return Err(Error::DuplicateMigration(id)),
        (Some(sql), None) | (None, Some(sql)) => sql,
        (None, None) => {
            return Err(Error::InvalidMigration {
                id,
                message: "down file without an up file".to_string(),
            });
        }
    };

    let options = parse_directives(&up);
    let down = match files.down {
        Some(sql) => Down::Reversible(vec![Operation::execute(sql)]),
        None => Down::Irreversible {
            reason: "no down file".to_string(),
        },
    };

    Ok(Migration {
        id,
        up: vec![Operation::execute(up)],
        down,
        options,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_migration_filename_simple() {
        let (version, name, kind) =
            parse_migration_filename("20240101000000_create_users.sql").unwrap();
        assert_eq!(version, 20240101000000);
        assert_eq!(name, "create_users");
        assert_eq!(kind, FileKind::Plain);
    }

    #[test]
    fn test_parse_migration_filename_up_and_down() {
        let (_, name, kind) =
            parse_migration_filename("20240101000000_create_users.up.sql").unwrap();
        assert_eq!(name, "create_users");
        assert_eq!(kind, FileKind::Up);

        let (_, _, kind) =
            parse_migration_filename("20240101000000_create_users.down.sql").unwrap();
        assert_eq!(kind, FileKind::Down);
    }

    #[test]
    fn test_parse_migration_filename_invalid() {
        assert!(parse_migration_filename("invalid.sql").is_err());
        assert!(parse_migration_filename("nounderscore.sql").is_err());
        assert!(parse_migration_filename("2024_.sql").is_err());
        assert!(parse_migration_filename("20240101000000_users.txt").is_err());
    }

    #[test]
    fn directives_are_read_from_leading_comments_only() {
        let options = parse_directives(
            "-- pgshift:disable-ddl-transaction\n\nCREATE INDEX CONCURRENTLY i ON t (c);\n-- pgshift:lock-retries\n",
        );
        assert!(options.disable_ddl_transaction);
        assert!(options.lock_retries.is_none());

        let options = parse_directives("-- adds a column\n-- pgshift:lock-retries\nALTER TABLE t ADD c int;");
        assert!(options.lock_retries.is_some());
    }

    #[test]
    fn concurrent_index_files_run_as_one_unguarded_statement() {
        let sql = "-- pgshift:disable-ddl-transaction\n\
                   DROP INDEX CONCURRENTLY IF EXISTS index_users_on_email;\n\
                   CREATE INDEX CONCURRENTLY index_users_on_email ON users (email);";
        let migration = build(
            MigrationId::new(1, "index_users_on_email"),
            Files {
                plain: Some(sql.to_string()),
                ..Files::default()
            },
        )
        .unwrap();

        assert!(migration.options.disable_ddl_transaction);
        assert_eq!(migration.up, vec![Operation::execute(sql)]);
        assert!(migration.up[0].guard().is_none());
        assert!(!migration.up[0].cannot_run_in_transaction_block());
    }

    #[test]
    fn up_only_migration_is_irreversible() {
        let migration = build(
            MigrationId::new(1, "seed"),
            Files {
                plain: Some("INSERT INTO t VALUES (1)".to_string()),
                ..Files::default()
            },
        )
        .unwrap();
        assert!(!migration.is_reversible());
    }

    #[test]
    fn plain_and_up_files_for_the_same_migration_conflict() {
        let err = build(
            MigrationId::new(1, "seed"),
            Files {
                plain: Some(String::new()),
                up: Some(String::new()),
                down: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateMigration(_)));
    }
}
