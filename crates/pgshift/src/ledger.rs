//! The durable record of applied migrations.
//!
//! Writes go through the driver's current session, so a ledger row inserted
//! inside a step's transaction commits or rolls back together with the
//! schema change.

use crate::driver::Driver;
use crate::error::Result;
use crate::migration::{MigrationId, MigrationRecord};

pub struct VersionLedger<'d> {
    driver: &'d mut dyn Driver,
}

impl<'d> VersionLedger<'d> {
    pub fn new(driver: &'d mut dyn Driver) -> Self {
        Self { driver }
    }

    pub async fn ensure(&mut self) -> Result<()> {
        self.driver.ensure_ledger().await
    }

    /// Applied migrations ordered by version and name.
    pub async fn applied(&mut self) -> Result<Vec<MigrationRecord>> {
        let mut records = self.driver.applied_migrations().await?;
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    pub async fn has_applied(&mut self, id: &MigrationId) -> Result<bool> {
        Ok(self.applied().await?.iter().any(|record| &record.id == id))
    }

    pub async fn has_applied_version(&mut self, version: i64) -> Result<bool> {
        Ok(self
            .applied()
            .await?
            .iter()
            .any(|record| record.id.version == version))
    }

    pub async fn record_applied(&mut self, id: &MigrationId) -> Result<()> {
        tracing::debug!(version = id.version, name = %id.name, "Recording migration as applied");
        self.driver.insert_ledger_row(id).await
    }

    pub async fn record_reverted(&mut self, id: &MigrationId) -> Result<()> {
        tracing::debug!(version = id.version, name = %id.name, "Removing migration from ledger");
        self.driver.delete_ledger_row(id).await
    }
}
