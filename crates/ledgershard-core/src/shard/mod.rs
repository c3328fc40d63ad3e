//! Shard migration engine.
//!
//! Moves blocks and transactions below the rollback horizon out of the main
//! database into a per-shard archive, in eight crash-recoverable steps:
//!
//! | Step | From | To |
//! |------|------|----|
//! | BackupMainDatabase | INIT | MAIN_DB_BACKUPED |
//! | CreateShardSchema(1) | MAIN_DB_BACKUPED | SHARD_SCHEMA_CREATED |
//! | CopyData | SHARD_SCHEMA_CREATED | DATA_COPIED_TO_SHARD |
//! | CreateShardSchema(2) | DATA_COPIED_TO_SHARD | SHARD_SCHEMA_FULL |
//! | RelinkData | SHARD_SCHEMA_FULL | DATA_RELINKED_IN_MAIN |
//! | UpdateSecondaryIndex | DATA_RELINKED_IN_MAIN | SECONDARY_INDEX_UPDATED |
//! | DeleteCopiedData | SECONDARY_INDEX_UPDATED | DATA_REMOVED_FROM_MAIN |
//! | FinishSharding | DATA_REMOVED_FROM_MAIN | COMPLETED |
//!
//! # Example
//!
//! ```ignore
//! use ledgershard_core::shard::{MigrationContext, ShardMigrationExecutor};
//!
//! let ctx = MigrationContext::open(config)?;
//! let executor = ShardMigrationExecutor::new(Arc::new(ctx));
//! executor.create_all_commands(8000)?;
//! let state = executor.execute_all_operations()?;
//! ```

pub mod backup;
pub mod boundary;
pub mod command;
pub mod context;
pub mod error;
pub mod excluded;
pub mod executor;
pub mod guard;
pub mod hash;
pub mod mover;
pub mod registry;
pub mod schema;
pub mod state;
pub mod tables;
pub mod trigger;

pub use boundary::TableBoundary;
pub use command::{
    BackupMainDatabase, CopyData, CreateShardSchema, DataMigrateOperation, DeleteCopiedData,
    FinishSharding, RelinkData, UpdateSecondaryIndex,
};
pub use context::MigrationContext;
pub use error::ShardingError;
pub use executor::{InterruptedMigration, MigrationTarget, ShardMigrationExecutor};
pub use guard::ConstraintGuard;
pub use hash::{HashAlgorithm, ShardHashCalculator};
pub use mover::{Bind, MovePlan, MoveStats, PaginatedMover};
pub use registry::{ShardRecord, ShardRegistry, ShardState};
pub use schema::{SchemaEvolver, SHARD_SCHEMA_V1, SHARD_SCHEMA_V2};
pub use state::{MigrateState, RecoveryCheckpoint, RecoveryStore};
pub use trigger::{ChainView, MigrationRunner, ShardObserver};
