//! Shared state handed to every migration operation.

use std::sync::Arc;

use crate::config::ShardingConfig;
use crate::error::Error;
use crate::storage::{DatabaseManager, DerivedTablesRegistry, GlobalSync};

/// Everything an operation needs: databases, the global lock and the
/// derived tables to relink.
pub struct MigrationContext {
    databases: DatabaseManager,
    sync: Arc<GlobalSync>,
    derived: DerivedTablesRegistry,
}

impl MigrationContext {
    /// Build a context from its parts.
    pub fn new(
        databases: DatabaseManager,
        sync: Arc<GlobalSync>,
        derived: DerivedTablesRegistry,
    ) -> Self {
        Self {
            databases,
            sync,
            derived,
        }
    }

    /// Open the main database and use the standard derived tables.
    pub fn open(config: ShardingConfig) -> Result<Self, Error> {
        Ok(Self::new(
            DatabaseManager::open(config)?,
            Arc::new(GlobalSync::new()),
            DerivedTablesRegistry::with_defaults(),
        ))
    }

    /// Node configuration.
    pub fn config(&self) -> &ShardingConfig {
        self.databases.config()
    }

    /// Main and shard databases.
    pub fn databases(&self) -> &DatabaseManager {
        &self.databases
    }

    /// The blockchain's global lock.
    pub fn sync(&self) -> &GlobalSync {
        &self.sync
    }

    /// Derived tables relinked during migration.
    pub fn derived_tables(&self) -> &DerivedTablesRegistry {
        &self.derived
    }
}
