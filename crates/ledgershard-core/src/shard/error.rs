//! Shard migration errors.

use thiserror::Error;

use super::state::MigrateState;

/// Errors raised by the shard migration engine.
#[derive(Debug, Error)]
pub enum ShardingError {
    /// Another migration is already running.
    #[error("shard migration already in progress")]
    MigrationInProgress,

    /// An operation was run against a checkpoint it does not follow.
    #[error("{operation} requires state {expected}, found {actual}")]
    PreconditionViolation {
        /// Operation name.
        operation: &'static str,
        /// State the operation starts from.
        expected: MigrateState,
        /// State found in the recovery store.
        actual: MigrateState,
    },

    /// An operation was asked to process a table it has no plan for.
    #[error("{operation} does not support table {table}")]
    UnsupportedTable {
        /// Table name.
        table: String,
        /// Operation name.
        operation: &'static str,
    },

    /// No schema script exists for the requested shard schema version.
    #[error("unsupported shard schema version {version}")]
    UnsupportedSchemaVersion {
        /// Requested version.
        version: u32,
    },

    /// A completed shard record cannot be changed.
    #[error("shard {shard_id} is completed and immutable")]
    ShardImmutable {
        /// Shard id.
        shard_id: u64,
    },

    /// A shard record that should exist does not.
    #[error("shard {shard_id} not found")]
    ShardNotFound {
        /// Shard id.
        shard_id: u64,
    },

    /// Persisted migration state could not be interpreted.
    #[error("migration state corrupted: {message}")]
    StateCorrupted {
        /// Description of the corruption.
        message: String,
    },

    /// No commands were built before execution was requested.
    #[error("no migration commands; call create_all_commands first")]
    NoCommands,

    /// An operation failed its own consistency check.
    #[error("{operation} failed: {message}")]
    StepFailed {
        /// Operation name.
        operation: &'static str,
        /// Error message.
        message: String,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),
}

impl From<rusqlite::Error> for ShardingError {
    fn from(e: rusqlite::Error) -> Self {
        ShardingError::Storage(e.into())
    }
}

impl From<std::io::Error> for ShardingError {
    fn from(e: std::io::Error) -> Self {
        ShardingError::Storage(e.into())
    }
}

impl ShardingError {
    /// Whether re-invoking the migration may succeed without operator action.
    ///
    /// Storage and step failures leave the checkpoint at the last completed
    /// state, so a later run resumes from there. Unsupported operands,
    /// precondition violations and corrupted state need a code or operator fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShardingError::MigrationInProgress
                | ShardingError::StepFailed { .. }
                | ShardingError::Storage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(ShardingError::from(io).is_retryable());
        assert!(!ShardingError::UnsupportedTable {
            table: "account".into(),
            operation: "CopyData",
        }
        .is_retryable());
        assert!(!ShardingError::PreconditionViolation {
            operation: "RelinkData",
            expected: MigrateState::ShardSchemaFull,
            actual: MigrateState::Init,
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ShardingError::PreconditionViolation {
            operation: "CopyData",
            expected: MigrateState::ShardSchemaCreated,
            actual: MigrateState::MainDbBackuped,
        };
        assert_eq!(
            err.to_string(),
            "CopyData requires state SHARD_SCHEMA_CREATED, found MAIN_DB_BACKUPED"
        );
    }
}
