//! Ledgershard Core - main database storage and the shard migration engine.
//!
//! This crate keeps the node's working database small by archiving blocks
//! and transactions below the rollback horizon into per-shard databases.

pub mod config;
pub mod error;
pub mod shard;
pub mod storage;

pub use config::{HeightConfig, ShardingConfig};
pub use error::Error;
pub use shard::{
    DataMigrateOperation, HashAlgorithm, MigrateState, MigrationContext, ShardMigrationExecutor,
    ShardObserver, ShardRecord, ShardingError,
};
pub use storage::{DatabaseManager, DerivedTablesRegistry, GlobalSync};
