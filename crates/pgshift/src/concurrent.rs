//! Long-running, non-transactional schema work: concurrent index builds and
//! batched column updates.
//!
//! `CREATE INDEX CONCURRENTLY` can fail partway and leave an `INVALID` index
//! that is maintained on every write but never used. The guard never leaves
//! one behind: a failed build drops its invalid index and reports
//! [`Error::InvalidIndex`], and an invalid index found from an earlier crashed
//! run is dropped and rebuilt.

use crate::driver::{Driver, IndexStatus};
use crate::error::{Error, Result};
use crate::operation::{BackfillValue, IndexDef, Operation};

const MAX_UPDATE_BATCH_SIZE: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Created,
    /// A valid index with the same name already existed.
    AlreadyExists,
    /// An invalid index from an earlier failed build was dropped first.
    Rebuilt,
}

/// 5% of the table, between 1 and 1000 rows.
pub fn default_batch_size(row_count: u64) -> u64 {
    row_count
        .saturating_mul(5)
        .div_ceil(100)
        .clamp(1, MAX_UPDATE_BATCH_SIZE)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConcurrentIndexGuard;

impl ConcurrentIndexGuard {
    #[tracing::instrument(
        name = "concurrent.add_index",
        skip(self, driver, index),
        fields(table = %index.table, index = %index.name()),
        err,
    )]
    pub async fn add_index(&self, driver: &mut dyn Driver, index: &IndexDef) -> Result<IndexOutcome> {
        if driver.transaction_open() {
            return Err(Error::TransactionOpen("add_concurrent_index"));
        }

        let mut index = index.clone();
        index.concurrently = true;
        let name = index.name();

        let mut outcome = IndexOutcome::Created;
        match driver.index_status(&index.table, &name).await? {
            Some(IndexStatus::Valid) => {
                tracing::warn!(
                    "Index not created because it already exists (this may be due to an aborted migration or similar): table_name: {}, index_name: {}",
                    index.table,
                    name
                );
                return Ok(IndexOutcome::AlreadyExists);
            }
            Some(IndexStatus::Invalid) => {
                tracing::warn!(
                    table = %index.table,
                    index = %name,
                    "Dropping invalid index left by an earlier concurrent build"
                );
                without_statement_timeout(driver, &Operation::RemoveIndex(index.clone())).await?;
                outcome = IndexOutcome::Rebuilt;
            }
            None => {}
        }

        let result = without_statement_timeout(driver, &Operation::AddIndex(index.clone())).await;
        let Err(err) = result else {
            return Ok(outcome);
        };

        if driver.index_status(&index.table, &name).await? == Some(IndexStatus::Invalid) {
            tracing::error!(
                table = %index.table,
                index = %name,
                error_msg = %err,
                "Concurrent index build failed, dropping the invalid index"
            );
            without_statement_timeout(driver, &Operation::RemoveIndex(index.clone())).await?;
            return Err(Error::InvalidIndex {
                table: index.table.clone(),
                index: name,
                cause: err.to_string(),
            });
        }

        Err(err)
    }

    /// Returns `false` when the index did not exist.
    #[tracing::instrument(
        name = "concurrent.remove_index",
        skip(self, driver, index),
        fields(table = %index.table, index = %index.name()),
        err,
    )]
    pub async fn remove_index(&self, driver: &mut dyn Driver, index: &IndexDef) -> Result<bool> {
        if driver.transaction_open() {
            return Err(Error::TransactionOpen("remove_concurrent_index"));
        }

        let mut index = index.clone();
        index.concurrently = true;

        if driver.index_status(&index.table, &index.name()).await?.is_none() {
            tracing::warn!(
                "Index not removed because it does not exist (this may be due to an aborted migration or similar): table_name: {}, index_name: {}",
                index.table,
                index.name()
            );
            return Ok(false);
        }

        without_statement_timeout(driver, &Operation::RemoveIndex(index)).await?;
        Ok(true)
    }

    /// Updates `table.column` one key range at a time, each batch committed
    /// on its own. Returns the number of rows updated.
    #[tracing::instrument(
        name = "concurrent.update_column_in_batches",
        skip(self, driver, value),
        err,
    )]
    pub async fn update_column_in_batches(
        &self,
        driver: &mut dyn Driver,
        table: &str,
        column: &str,
        value: &BackfillValue,
        batch_column: &str,
        batch_size: Option<u64>,
    ) -> Result<u64> {
        if driver.transaction_open() {
            return Err(Error::TransactionOpen("update_column_in_batches"));
        }
        if !driver.table_exists(table).await? {
            return Err(Error::missing_table(table));
        }
        for required in [column, batch_column] {
            if !driver.column_exists(table, required).await? {
                return Err(Error::missing("column", table, required));
            }
        }

        let batch_size = match batch_size {
            Some(size) => size.max(1),
            None => default_batch_size(driver.row_count(table).await?),
        };
        let batches = driver.key_batches(table, batch_column, batch_size).await?;
        tracing::debug!(batch_size, batches = batches.len(), "Updating column in batches");

        driver.set_statement_timeout(None).await?;
        let mut updated = 0;
        let mut result = Ok(());
        for range in batches {
            let update = Operation::UpdateColumn {
                table: table.to_string(),
                column: column.to_string(),
                value: value.clone(),
                batch_column: batch_column.to_string(),
                range: Some(range),
            };
            match driver.apply(&update).await {
                Ok(rows) => updated += rows,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        driver.reset_statement_timeout().await?;

        result.map(|()| updated)
    }
}

/// Applies `operation` with `statement_timeout` disabled, restoring it
/// afterwards whether or not the operation succeeded.
pub(crate) async fn without_statement_timeout(
    driver: &mut dyn Driver,
    operation: &Operation,
) -> Result<u64> {
    driver.set_statement_timeout(None).await?;
    let result = driver.apply(operation).await;
    let reset = driver.reset_statement_timeout().await;
    let rows = result?;
    reset?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_batch_size_is_five_percent_capped() {
        assert_eq!(default_batch_size(0), 1);
        assert_eq!(default_batch_size(10), 1);
        assert_eq!(default_batch_size(100), 5);
        assert_eq!(default_batch_size(1_001), 51);
        assert_eq!(default_batch_size(10_000_000), 1000);
    }
}
