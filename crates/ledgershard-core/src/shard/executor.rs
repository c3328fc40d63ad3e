//! Shard migration orchestrator.
//!
//! Builds the ordered operation list for one shard, runs it step by step and
//! persists the reached state after every successful step. A run that was
//! interrupted resumes at the first operation whose precondition matches the
//! stored checkpoint.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use super::command::{
    BackupMainDatabase, CopyData, CreateShardSchema, DataMigrateOperation, DeleteCopiedData,
    FinishSharding, RelinkData, UpdateSecondaryIndex,
};
use super::context::MigrationContext;
use super::error::ShardingError;
use super::excluded::find_excluded_transactions;
use super::registry::{ShardRecord, ShardRegistry};
use super::schema::{SHARD_SCHEMA_V1, SHARD_SCHEMA_V2};
use super::state::{MigrateState, RecoveryCheckpoint, RecoveryStore};

/// The shard a command list was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationTarget {
    /// Shard id.
    pub shard_id: u64,
    /// Archive height.
    pub height: u64,
}

/// A migration found unfinished at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterruptedMigration {
    /// Stored checkpoint.
    pub checkpoint: RecoveryCheckpoint,
    /// Shard record, present once the shard schema was created.
    pub shard: Option<ShardRecord>,
}

/// Runs shard migrations one at a time.
pub struct ShardMigrationExecutor {
    ctx: Arc<MigrationContext>,
    commands: Mutex<Vec<Box<dyn DataMigrateOperation>>>,
    target: Mutex<Option<MigrationTarget>>,
    running: AtomicBool,
}

struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ShardMigrationExecutor {
    /// Create an executor over a migration context.
    pub fn new(ctx: Arc<MigrationContext>) -> Self {
        Self {
            ctx,
            commands: Mutex::new(Vec::new()),
            target: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// The shared context.
    pub fn context(&self) -> &Arc<MigrationContext> {
        &self.ctx
    }

    /// Shard and height of the current command list.
    pub fn target(&self) -> Option<MigrationTarget> {
        *self.target.lock()
    }

    /// Whether a migration call is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn enter(&self) -> Result<FlightGuard<'_>, ShardingError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ShardingError::MigrationInProgress)?;
        Ok(FlightGuard(&self.running))
    }

    /// Build the ordered operation list for a shard at `target_height`.
    ///
    /// When an earlier run left an in-progress shard, its id and archive
    /// height are reused so the same list is rebuilt. Returns the number of
    /// operations.
    pub fn create_all_commands(&self, target_height: u64) -> Result<usize, ShardingError> {
        let _flight = self.enter()?;

        let (target, excluded) = {
            let _lock = self.ctx.sync().write_lock();
            let main = self.ctx.databases().main();
            let registry = ShardRegistry::new(&main);
            let recovery = RecoveryStore::new(&main);

            let target = match registry.in_progress_shard()? {
                Some(shard) => {
                    if shard.archive_height != target_height {
                        warn!(
                            shard_id = shard.id,
                            archive_height = shard.archive_height,
                            requested = target_height,
                            "resuming interrupted shard at its original height"
                        );
                    }
                    MigrationTarget {
                        shard_id: shard.id,
                        height: shard.archive_height,
                    }
                }
                None => MigrationTarget {
                    shard_id: registry.next_shard_id()?,
                    height: target_height,
                },
            };

            if recovery.get_checkpoint()?.is_none() {
                recovery.save_checkpoint(MigrateState::Init, None)?;
            }
            let excluded = find_excluded_transactions(&main, target.height as i64)?;
            (target, Arc::new(excluded))
        };

        let commands = build_commands(target, excluded);
        let count = commands.len();
        *self.commands.lock() = commands;
        *self.target.lock() = Some(target);

        info!(
            shard_id = target.shard_id,
            height = target.height,
            commands = count,
            "shard migration commands created"
        );
        Ok(count)
    }

    /// Run one operation against the stored checkpoint.
    pub fn execute_operation(
        &self,
        operation: &dyn DataMigrateOperation,
    ) -> Result<MigrateState, ShardingError> {
        let _flight = self.enter()?;
        self.run_operation(operation)
    }

    fn run_operation(&self, operation: &dyn DataMigrateOperation) -> Result<MigrateState, ShardingError> {
        let current = self.current_state()?;
        if current != operation.precondition() {
            return Err(ShardingError::PreconditionViolation {
                operation: operation.name(),
                expected: operation.precondition(),
                actual: current,
            });
        }

        info!(operation = operation.name(), from = %current, "executing migration step");
        let state = match operation.execute(&self.ctx) {
            Ok(state) => state,
            Err(e) => {
                error!(
                    operation = operation.name(),
                    state = %MigrateState::Failed,
                    checkpoint = %current,
                    error = %e,
                    "migration step failed"
                );
                return Err(e);
            }
        };

        // FinishSharding clears the checkpoint in its own transaction
        if state != MigrateState::Completed {
            let main = self.ctx.databases().main();
            RecoveryStore::new(&main).save_checkpoint(state, None)?;
        }
        info!(operation = operation.name(), to = %state, "migration step completed");
        Ok(state)
    }

    /// Run every remaining operation of the current command list.
    ///
    /// Operations whose postcondition is already reached are skipped. Stops
    /// at the first failure, leaving the checkpoint at the last success.
    pub fn execute_all_operations(&self) -> Result<MigrateState, ShardingError> {
        let _flight = self.enter()?;

        let mut commands = self.commands.lock();
        if commands.is_empty() {
            return Err(ShardingError::NoCommands);
        }

        let mut state = self.current_state()?;
        for operation in commands.iter() {
            if operation.postcondition() <= state {
                continue;
            }
            state = self.run_operation(operation.as_ref())?;
        }

        if state == MigrateState::Completed {
            commands.clear();
            *self.target.lock() = None;
        }
        Ok(state)
    }

    /// Stored checkpoint state, `INIT` when none exists.
    pub fn current_state(&self) -> Result<MigrateState, ShardingError> {
        let main = self.ctx.databases().main();
        RecoveryStore::new(&main).current_state()
    }

    /// Report a migration left unfinished by an earlier process.
    pub fn recover(&self) -> Result<Option<InterruptedMigration>, ShardingError> {
        let main = self.ctx.databases().main();
        let Some(checkpoint) = RecoveryStore::new(&main).get_checkpoint()? else {
            return Ok(None);
        };
        let shard = ShardRegistry::new(&main).in_progress_shard()?;
        warn!(
            state = %checkpoint.state,
            object = checkpoint.object_name.as_deref().unwrap_or("-"),
            shard_id = shard.as_ref().map(|s| s.id),
            "interrupted shard migration found"
        );
        Ok(Some(InterruptedMigration { checkpoint, shard }))
    }

    /// Operator reset of the stored checkpoint.
    pub fn reset_checkpoint(&self, state: MigrateState) -> Result<(), ShardingError> {
        let _flight = self.enter()?;
        let main = self.ctx.databases().main();
        RecoveryStore::new(&main).reset_checkpoint(state)
    }

    /// Create commands for `target_height` and run them to the end.
    pub fn migrate(&self, target_height: u64) -> Result<MigrateState, ShardingError> {
        self.create_all_commands(target_height)?;
        self.execute_all_operations()
    }
}

fn build_commands(
    target: MigrationTarget,
    excluded: Arc<HashSet<i64>>,
) -> Vec<Box<dyn DataMigrateOperation>> {
    let MigrationTarget { shard_id, height } = target;
    vec![
        Box::new(BackupMainDatabase::new(shard_id, height)),
        Box::new(CreateShardSchema::new(shard_id, height, SHARD_SCHEMA_V1)),
        Box::new(CopyData::new(shard_id, height, Arc::clone(&excluded))),
        Box::new(CreateShardSchema::new(shard_id, height, SHARD_SCHEMA_V2)),
        Box::new(RelinkData::new(height)),
        Box::new(UpdateSecondaryIndex::new(shard_id, height, Arc::clone(&excluded))),
        Box::new(DeleteCopiedData::new(height, excluded)),
        Box::new(FinishSharding::new(shard_id)),
    ]
}
