//! Migration state and the recovery checkpoint.
//!
//! The checkpoint is a single row in `shard_recovery` holding the last
//! completed [`MigrateState`]. It exists only while a migration is in flight
//! and is read at startup to resume an interrupted run.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::ShardingError;

/// Phase reached by a shard migration, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrateState {
    /// Nothing done yet.
    Init,
    /// Main database snapshot written.
    MainDbBackuped,
    /// Shard tables created without constraints.
    ShardSchemaCreated,
    /// Blocks and transactions copied into the shard.
    DataCopiedToShard,
    /// Shard constraints and indexes created.
    ShardSchemaFull,
    /// Derived tables trimmed and relinked.
    DataRelinkedInMain,
    /// Block and transaction index rebuilt.
    SecondaryIndexUpdated,
    /// Archived rows deleted from the main database.
    DataRemovedFromMain,
    /// Shard record completed with its hash.
    Completed,
    /// A step failed. Reported only, never persisted.
    Failed,
}

impl MigrateState {
    /// Stable name used in the recovery table.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrateState::Init => "INIT",
            MigrateState::MainDbBackuped => "MAIN_DB_BACKUPED",
            MigrateState::ShardSchemaCreated => "SHARD_SCHEMA_CREATED",
            MigrateState::DataCopiedToShard => "DATA_COPIED_TO_SHARD",
            MigrateState::ShardSchemaFull => "SHARD_SCHEMA_FULL",
            MigrateState::DataRelinkedInMain => "DATA_RELINKED_IN_MAIN",
            MigrateState::SecondaryIndexUpdated => "SECONDARY_INDEX_UPDATED",
            MigrateState::DataRemovedFromMain => "DATA_REMOVED_FROM_MAIN",
            MigrateState::Completed => "COMPLETED",
            MigrateState::Failed => "FAILED",
        }
    }

    /// Whether no further operation follows this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrateState::Completed | MigrateState::Failed)
    }
}

impl fmt::Display for MigrateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrateState {
    type Err = ShardingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s {
            "INIT" => MigrateState::Init,
            "MAIN_DB_BACKUPED" => MigrateState::MainDbBackuped,
            "SHARD_SCHEMA_CREATED" => MigrateState::ShardSchemaCreated,
            "DATA_COPIED_TO_SHARD" => MigrateState::DataCopiedToShard,
            "SHARD_SCHEMA_FULL" => MigrateState::ShardSchemaFull,
            "DATA_RELINKED_IN_MAIN" => MigrateState::DataRelinkedInMain,
            "SECONDARY_INDEX_UPDATED" => MigrateState::SecondaryIndexUpdated,
            "DATA_REMOVED_FROM_MAIN" => MigrateState::DataRemovedFromMain,
            "COMPLETED" => MigrateState::Completed,
            "FAILED" => MigrateState::Failed,
            other => {
                return Err(ShardingError::StateCorrupted {
                    message: format!("unknown migrate state {other:?}"),
                })
            }
        };
        Ok(state)
    }
}

/// The persisted checkpoint of the in-flight migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryCheckpoint {
    /// Last completed state.
    pub state: MigrateState,
    /// Table or step being processed when the checkpoint was written.
    pub object_name: Option<String>,
    /// When the migration started.
    pub created_at: DateTime<Utc>,
    /// When the checkpoint last moved.
    pub updated_at: DateTime<Utc>,
}

/// Persistence for the recovery checkpoint.
///
/// Borrows the main connection; every write is a single statement and
/// therefore its own durable transaction unless the caller wraps it in one.
pub struct RecoveryStore<'a> {
    conn: &'a Connection,
}

impl<'a> RecoveryStore<'a> {
    /// Wrap a main database connection.
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Record `state` as the last completed state.
    ///
    /// `FAILED` is never persisted; the checkpoint stays at the last success.
    /// A state below the stored one is rejected, use
    /// [`reset_checkpoint`](Self::reset_checkpoint) to move backwards.
    pub fn save_checkpoint(
        &self,
        state: MigrateState,
        object_name: Option<&str>,
    ) -> Result<(), ShardingError> {
        if state == MigrateState::Failed {
            warn!("refusing to persist FAILED state");
            return Ok(());
        }
        if let Some(current) = self.get_checkpoint()? {
            if state < current.state {
                return Err(ShardingError::StateCorrupted {
                    message: format!("checkpoint cannot move from {} back to {state}", current.state),
                });
            }
        }
        self.write(state, object_name)
    }

    /// Note the table an operation is working on, keeping the state.
    pub fn record_object(&self, object_name: &str) -> Result<(), ShardingError> {
        self.conn.execute(
            "UPDATE shard_recovery SET object_name = ?1, updated_at = ?2 WHERE shard_recovery_id = 1",
            params![object_name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Overwrite the checkpoint regardless of its current state.
    pub fn reset_checkpoint(&self, state: MigrateState) -> Result<(), ShardingError> {
        warn!(%state, "recovery checkpoint reset by operator");
        self.write(state, None)
    }

    fn write(&self, state: MigrateState, object_name: Option<&str>) -> Result<(), ShardingError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO shard_recovery (shard_recovery_id, state, object_name, created_at, updated_at)
             VALUES (1, ?1, ?2, ?3, ?3)
             ON CONFLICT (shard_recovery_id) DO UPDATE
             SET state = excluded.state, object_name = excluded.object_name,
                 updated_at = excluded.updated_at",
            params![state.as_str(), object_name, now],
        )?;
        debug!(%state, "recovery checkpoint saved");
        Ok(())
    }

    /// Read the checkpoint, if a migration is in flight.
    pub fn get_checkpoint(&self) -> Result<Option<RecoveryCheckpoint>, ShardingError> {
        let row = self
            .conn
            .query_row(
                "SELECT state, object_name, created_at, updated_at
                 FROM shard_recovery WHERE shard_recovery_id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((state, object_name, created_at, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(RecoveryCheckpoint {
            state: state.parse()?,
            object_name,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }

    /// Current state, `INIT` when no checkpoint exists.
    pub fn current_state(&self) -> Result<MigrateState, ShardingError> {
        Ok(self
            .get_checkpoint()?
            .map(|c| c.state)
            .unwrap_or(MigrateState::Init))
    }

    /// Remove the checkpoint after a completed migration.
    pub fn clear_checkpoint(&self) -> Result<(), ShardingError> {
        self.conn.execute("DELETE FROM shard_recovery", [])?;
        debug!("recovery checkpoint cleared");
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ShardingError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ShardingError::StateCorrupted {
            message: format!("bad checkpoint timestamp {raw:?}: {e}"),
        })
}
