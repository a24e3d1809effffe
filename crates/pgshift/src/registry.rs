use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::migration::{Migration, MigrationId, MigrationRecord};
use crate::source;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Up { applied_at: DateTime<Utc> },
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub id: MigrationId,
    pub status: MigrationStatus,
    /// `false` for ledger rows with no matching definition.
    pub defined: bool,
}

/// The known migrations, keyed and ordered by `(version, name)`.
///
/// Every migration is validated when registered, so a registry never holds a
/// step that would be rejected halfway through a run.
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    migrations: BTreeMap<MigrationId, Migration>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_migrations(source::load_dir(path)?)
    }

    pub fn from_migrations(migrations: impl IntoIterator<Item = Migration>) -> Result<Self> {
        let mut registry = Self::new();
        for migration in migrations {
            registry.register(migration)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, migration: Migration) -> Result<()> {
        migration.validate()?;
        if self.migrations.contains_key(&migration.id) {
            return Err(Error::DuplicateMigration(migration.id));
        }
        self.migrations.insert(migration.id.clone(), migration);
        Ok(())
    }

    pub fn with(mut self, migration: Migration) -> Result<Self> {
        self.register(migration)?;
        Ok(self)
    }

    /// All migrations in ascending order.
    pub fn migrations(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.values()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn get(&self, id: &MigrationId) -> Option<&Migration> {
        self.migrations.get(id)
    }

    /// Looks a migration up by its version alone, failing when two migrations
    /// share the version.
    pub fn by_version(&self, version: i64) -> Result<&Migration> {
        let mut matches = self.migrations.values().filter(|m| m.version() == version);
        let migration = matches.next().ok_or(Error::UnknownVersion(version))?;
        if matches.next().is_some() {
            return Err(Error::AmbiguousVersion(version));
        }
        Ok(migration)
    }

    /// Migrations not in `applied`, ascending.
    pub fn pending(&self, applied: &[MigrationRecord]) -> Vec<&Migration> {
        let applied: HashSet<&MigrationId> = applied.iter().map(|r| &r.id).collect();
        self.migrations
            .values()
            .filter(|m| !applied.contains(&m.id))
            .collect()
    }

    /// Every defined migration plus every ledger row without a definition.
    pub fn status(&self, applied: &[MigrationRecord]) -> Vec<StatusEntry> {
        let mut entries: BTreeMap<MigrationId, StatusEntry> = self
            .migrations
            .keys()
            .map(|id| {
                (
                    id.clone(),
                    StatusEntry {
                        id: id.clone(),
                        status: MigrationStatus::Down,
                        defined: true,
                    },
                )
            })
            .collect();

        for record in applied {
            entries
                .entry(record.id.clone())
                .and_modify(|entry| {
                    entry.status = MigrationStatus::Up {
                        applied_at: record.applied_at,
                    };
                })
                .or_insert_with(|| StatusEntry {
                    id: record.id.clone(),
                    status: MigrationStatus::Up {
                        applied_at: record.applied_at,
                    },
                    defined: false,
                });
        }

        entries.into_values().collect()
    }
}
