//! Migration operations.
//!
//! Each operation moves the migration from its precondition state to its
//! postcondition state and can be re-run from the precondition after a crash
//! without duplicating or losing rows.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, info, instrument};

use super::backup::{backup_database, backup_file_name};
use super::boundary::TableBoundary;
use super::context::MigrationContext;
use super::error::ShardingError;
use super::guard::ConstraintGuard;
use super::hash::ShardHashCalculator;
use super::mover::PaginatedMover;
use super::registry::{ShardRecord, ShardRegistry, ShardState};
use super::schema::{SchemaEvolver, SHARD_SCHEMA_V1, SHARD_SCHEMA_V2};
use super::state::{MigrateState, RecoveryStore};
use super::tables::{
    block_index_plan, copy_plan, delete_plan, relink_plan, transaction_index_plan, COPY_TABLES,
    DELETE_TABLES,
};
use crate::storage::schema::{
    main_lookup_indexes, secondary_index_constraints, BLOCK_INDEX_TABLE, BLOCK_TABLE,
    TRANSACTION_SHARD_INDEX_TABLE, TRANSACTION_TABLE,
};

/// One step of a shard migration.
pub trait DataMigrateOperation: Send + Sync {
    /// Operation name for logs and errors.
    fn name(&self) -> &'static str;

    /// State the recovery store must hold before this operation runs.
    fn precondition(&self) -> MigrateState;

    /// State reached when this operation succeeds.
    fn postcondition(&self) -> MigrateState;

    /// Run the operation and return the state it reached.
    fn execute(&self, ctx: &MigrationContext) -> Result<MigrateState, ShardingError>;
}

impl std::fmt::Debug for dyn DataMigrateOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({} -> {})", self.name(), self.precondition(), self.postcondition())
    }
}

fn note_table(main: &Connection, table: &str) -> Result<(), ShardingError> {
    RecoveryStore::new(main).record_object(table)
}

/// Snapshot the main database before anything is moved.
#[derive(Debug, Clone)]
pub struct BackupMainDatabase {
    shard_id: u64,
    height: u64,
}

impl BackupMainDatabase {
    /// Back up before creating `shard_id` at `height`.
    pub fn new(shard_id: u64, height: u64) -> Self {
        Self { shard_id, height }
    }
}

impl DataMigrateOperation for BackupMainDatabase {
    fn name(&self) -> &'static str {
        "BackupMainDatabase"
    }

    fn precondition(&self) -> MigrateState {
        MigrateState::Init
    }

    fn postcondition(&self) -> MigrateState {
        MigrateState::MainDbBackuped
    }

    #[instrument(skip(self, ctx), fields(shard_id = self.shard_id, height = self.height))]
    fn execute(&self, ctx: &MigrationContext) -> Result<MigrateState, ShardingError> {
        let config = ctx.config();
        let name = backup_file_name(&config.db_name, self.shard_id, self.height);

        let _lock = ctx.sync().write_lock();
        let main = ctx.databases().main();
        backup_database(&main, &config.backup_dir(), &name)?;
        Ok(self.postcondition())
    }
}

/// Create or complete the shard schema.
#[derive(Debug, Clone)]
pub struct CreateShardSchema {
    shard_id: u64,
    height: u64,
    version: u32,
}

impl CreateShardSchema {
    /// Apply shard schema `version` to `shard_id`.
    pub fn new(shard_id: u64, height: u64, version: u32) -> Self {
        Self {
            shard_id,
            height,
            version,
        }
    }
}

impl DataMigrateOperation for CreateShardSchema {
    fn name(&self) -> &'static str {
        "CreateShardSchema"
    }

    fn precondition(&self) -> MigrateState {
        if self.version == SHARD_SCHEMA_V1 {
            MigrateState::MainDbBackuped
        } else {
            MigrateState::DataCopiedToShard
        }
    }

    fn postcondition(&self) -> MigrateState {
        if self.version == SHARD_SCHEMA_V1 {
            MigrateState::ShardSchemaCreated
        } else {
            MigrateState::ShardSchemaFull
        }
    }

    #[instrument(skip(self, ctx), fields(shard_id = self.shard_id, version = self.version))]
    fn execute(&self, ctx: &MigrationContext) -> Result<MigrateState, ShardingError> {
        if self.version != SHARD_SCHEMA_V1 && self.version != SHARD_SCHEMA_V2 {
            return Err(ShardingError::UnsupportedSchemaVersion {
                version: self.version,
            });
        }

        let shard = ctx.databases().open_shard(self.shard_id)?;
        SchemaEvolver::new(&shard)
            .apply(self.version)
            .map_err(|e| ShardingError::StepFailed {
                operation: self.name(),
                message: e.to_string(),
            })?;

        if self.version == SHARD_SCHEMA_V1 {
            let main = ctx.databases().main();
            ShardRegistry::new(&main)
                .save_shard(&ShardRecord::in_progress(self.shard_id, self.height))?;
        }
        Ok(self.postcondition())
    }
}

/// Copy blocks and transactions below the archive height into the shard.
#[derive(Debug, Clone)]
pub struct CopyData {
    shard_id: u64,
    height: u64,
    excluded: Arc<HashSet<i64>>,
}

impl CopyData {
    /// Copy rows below `height` into `shard_id`, skipping `excluded`
    /// transaction row ids.
    pub fn new(shard_id: u64, height: u64, excluded: Arc<HashSet<i64>>) -> Self {
        Self {
            shard_id,
            height,
            excluded,
        }
    }
}

impl DataMigrateOperation for CopyData {
    fn name(&self) -> &'static str {
        "CopyData"
    }

    fn precondition(&self) -> MigrateState {
        MigrateState::ShardSchemaCreated
    }

    fn postcondition(&self) -> MigrateState {
        MigrateState::DataCopiedToShard
    }

    #[instrument(skip(self, ctx), fields(shard_id = self.shard_id, height = self.height))]
    fn execute(&self, ctx: &MigrationContext) -> Result<MigrateState, ShardingError> {
        let height = self.height as i64;
        let page_size = ctx.config().page_size;
        let shard = ctx.databases().open_shard(self.shard_id)?;
        let main = ctx.databases().open_main()?;

        for table in COPY_TABLES {
            let plan = copy_plan(table, height)?;
            let boundary = TableBoundary::below_height(&main, table, height)?;
            note_table(&main, table)?;

            // v1 shard tables carry no constraints to drop
            let guard = ConstraintGuard::none(&shard);
            let stats = PaginatedMover::new(&main, &shard, page_size)
                .excluding(&self.excluded)
                .run(&plan, boundary)?;
            guard.release()?;

            info!(
                table,
                lower = boundary.lower,
                upper = boundary.upper,
                rows = stats.rows_written,
                skipped = stats.rows_skipped,
                "table copied to shard"
            );
        }
        Ok(self.postcondition())
    }
}

/// Trim derived tables and relink their old rows to the archive height.
#[derive(Debug, Clone)]
pub struct RelinkData {
    height: u64,
}

impl RelinkData {
    /// Relink derived rows below `height`.
    pub fn new(height: u64) -> Self {
        Self { height }
    }
}

impl DataMigrateOperation for RelinkData {
    fn name(&self) -> &'static str {
        "RelinkData"
    }

    fn precondition(&self) -> MigrateState {
        MigrateState::ShardSchemaFull
    }

    fn postcondition(&self) -> MigrateState {
        MigrateState::DataRelinkedInMain
    }

    #[instrument(skip(self, ctx), fields(height = self.height))]
    fn execute(&self, ctx: &MigrationContext) -> Result<MigrateState, ShardingError> {
        let height = self.height as i64;
        let page_size = ctx.config().page_size;
        let main = ctx.databases().open_main()?;

        for table in ctx.derived_tables().tables() {
            let name = table.name();
            let plan = relink_plan(name, height)?;
            note_table(&main, name)?;

            let trimmed = table.trim(&main, height)?;
            let boundary = TableBoundary::whole_table(&main, name)?;
            let guard = ConstraintGuard::acquire(&main, table.bulk_update_indexes(), false)?;
            let stats = PaginatedMover::new(&main, &main, page_size).run(&plan, boundary)?;
            guard.release()?;

            info!(
                table = name,
                trimmed,
                relinked = stats.rows_written,
                "derived table relinked"
            );
        }
        Ok(self.postcondition())
    }
}

/// Rebuild the block and transaction index entries of the shard.
#[derive(Debug, Clone)]
pub struct UpdateSecondaryIndex {
    shard_id: u64,
    height: u64,
    excluded: Arc<HashSet<i64>>,
}

impl UpdateSecondaryIndex {
    /// Index rows below `height` under `shard_id`, skipping `excluded`
    /// transaction row ids.
    pub fn new(shard_id: u64, height: u64, excluded: Arc<HashSet<i64>>) -> Self {
        Self {
            shard_id,
            height,
            excluded,
        }
    }

    fn purge(&self, main: &Connection) -> Result<(), ShardingError> {
        let tx = main.unchecked_transaction()?;
        let mut transactions = tx.execute(
            "DELETE FROM transaction_shard_index WHERE shard_id = ?1",
            [self.shard_id as i64],
        )?;
        // entries for phased transactions left behind by an earlier shard
        transactions += tx.execute(
            "DELETE FROM transaction_shard_index WHERE transaction_id IN \
             (SELECT id FROM transactions WHERE height < ?1)",
            [self.height as i64],
        )?;
        let blocks = tx.execute(
            "DELETE FROM block_index WHERE shard_id = ?1",
            [self.shard_id as i64],
        )?;
        tx.commit()?;
        if blocks > 0 || transactions > 0 {
            debug!(blocks, transactions, "stale index entries removed");
        }
        Ok(())
    }
}

impl DataMigrateOperation for UpdateSecondaryIndex {
    fn name(&self) -> &'static str {
        "UpdateSecondaryIndex"
    }

    fn precondition(&self) -> MigrateState {
        MigrateState::DataRelinkedInMain
    }

    fn postcondition(&self) -> MigrateState {
        MigrateState::SecondaryIndexUpdated
    }

    #[instrument(skip(self, ctx), fields(shard_id = self.shard_id, height = self.height))]
    fn execute(&self, ctx: &MigrationContext) -> Result<MigrateState, ShardingError> {
        let height = self.height as i64;
        let page_size = ctx.config().page_size;
        let main = ctx.databases().open_main()?;

        self.purge(&main)?;

        let guard = ConstraintGuard::acquire(&main, secondary_index_constraints(), true)?;
        let mover = PaginatedMover::new(&main, &main, page_size).excluding(&self.excluded);

        note_table(&main, BLOCK_INDEX_TABLE)?;
        let blocks = mover.run(
            &block_index_plan(height, self.shard_id),
            TableBoundary::below_height(&main, BLOCK_TABLE, height)?,
        )?;

        note_table(&main, TRANSACTION_SHARD_INDEX_TABLE)?;
        let transactions = mover.run(
            &transaction_index_plan(height, self.shard_id),
            TableBoundary::below_height(&main, TRANSACTION_TABLE, height)?,
        )?;
        guard.release()?;

        info!(
            blocks = blocks.rows_written,
            transactions = transactions.rows_written,
            skipped = transactions.rows_skipped,
            "secondary index rebuilt"
        );
        Ok(self.postcondition())
    }
}

/// Delete archived rows from the main database.
#[derive(Debug, Clone)]
pub struct DeleteCopiedData {
    height: u64,
    excluded: Arc<HashSet<i64>>,
}

impl DeleteCopiedData {
    /// Delete rows below `height`, keeping `excluded` transaction row ids.
    pub fn new(height: u64, excluded: Arc<HashSet<i64>>) -> Self {
        Self { height, excluded }
    }
}

impl DataMigrateOperation for DeleteCopiedData {
    fn name(&self) -> &'static str {
        "DeleteCopiedData"
    }

    fn precondition(&self) -> MigrateState {
        MigrateState::SecondaryIndexUpdated
    }

    fn postcondition(&self) -> MigrateState {
        MigrateState::DataRemovedFromMain
    }

    #[instrument(skip(self, ctx), fields(height = self.height))]
    fn execute(&self, ctx: &MigrationContext) -> Result<MigrateState, ShardingError> {
        let height = self.height as i64;
        let page_size = ctx.config().page_size;
        let main = ctx.databases().open_main()?;

        let guard = ConstraintGuard::acquire(&main, main_lookup_indexes(), false)?;
        let mover = PaginatedMover::new(&main, &main, page_size).excluding(&self.excluded);
        for table in DELETE_TABLES {
            let plan = delete_plan(table, height)?;
            note_table(&main, table)?;
            let boundary = TableBoundary::below_height(&main, table, height)?;
            let stats = mover.run(&plan, boundary)?;
            info!(
                table,
                deleted = stats.rows_written,
                kept = stats.rows_skipped,
                "archived rows deleted from main"
            );
        }
        guard.release()?;
        Ok(self.postcondition())
    }
}

/// Hash the shard, complete its record and clear the checkpoint.
#[derive(Debug, Clone)]
pub struct FinishSharding {
    shard_id: u64,
    hash: Option<Vec<u8>>,
}

impl FinishSharding {
    /// Finish `shard_id`, computing its hash.
    pub fn new(shard_id: u64) -> Self {
        Self {
            shard_id,
            hash: None,
        }
    }

    /// Finish `shard_id` with a hash computed elsewhere.
    pub fn with_hash(shard_id: u64, hash: Vec<u8>) -> Self {
        Self {
            shard_id,
            hash: Some(hash),
        }
    }
}

impl DataMigrateOperation for FinishSharding {
    fn name(&self) -> &'static str {
        "FinishSharding"
    }

    fn precondition(&self) -> MigrateState {
        MigrateState::DataRemovedFromMain
    }

    fn postcondition(&self) -> MigrateState {
        MigrateState::Completed
    }

    #[instrument(skip(self, ctx), fields(shard_id = self.shard_id))]
    fn execute(&self, ctx: &MigrationContext) -> Result<MigrateState, ShardingError> {
        let hash = match &self.hash {
            Some(hash) => hash.clone(),
            None => {
                let shard = ctx.databases().open_shard(self.shard_id)?;
                ShardHashCalculator::new(&shard, ctx.config().height.digest).calculate()?
            }
        };

        let main = ctx.databases().main();
        let record = ShardRegistry::new(&main)
            .get_shard(self.shard_id)?
            .ok_or(ShardingError::ShardNotFound {
                shard_id: self.shard_id,
            })?;
        let completed = ShardRecord {
            content_hash: Some(hash),
            state: ShardState::Completed,
            ..record
        };

        let tx = main.unchecked_transaction()?;
        ShardRegistry::new(&tx).save_shard(&completed)?;
        RecoveryStore::new(&tx).clear_checkpoint()?;
        tx.commit()?;

        info!(
            archive_height = completed.archive_height,
            hash = %completed.content_hash.as_deref().map(hex::encode).unwrap_or_default(),
            "shard completed"
        );
        Ok(self.postcondition())
    }
}
