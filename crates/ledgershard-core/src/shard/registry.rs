//! Persisted catalog of shards.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::debug;

use super::error::ShardingError;

/// Lifecycle of a shard record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShardState {
    /// Created by the schema step; migration still running.
    InProgress,
    /// Archive finished and hashed.
    Completed,
}

impl ShardState {
    fn code(&self) -> i64 {
        match self {
            ShardState::InProgress => 0,
            ShardState::Completed => 100,
        }
    }

    fn from_code(code: i64) -> Result<Self, ShardingError> {
        match code {
            0 => Ok(ShardState::InProgress),
            100 => Ok(ShardState::Completed),
            other => Err(ShardingError::StateCorrupted {
                message: format!("unknown shard state code {other}"),
            }),
        }
    }
}

/// A shard and the height it archives up to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardRecord {
    /// Shard id, starting at 1.
    pub id: u64,
    /// Rows below this height live in the shard.
    pub archive_height: u64,
    /// Content hash, set when the shard completes.
    #[serde(serialize_with = "serialize_hash")]
    pub content_hash: Option<Vec<u8>>,
    /// Lifecycle state.
    pub state: ShardState,
}

fn serialize_hash<S: serde::Serializer>(hash: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match hash {
        Some(bytes) => s.serialize_some(&hex::encode(bytes)),
        None => s.serialize_none(),
    }
}

impl ShardRecord {
    /// A record for a shard whose migration has just started.
    pub fn in_progress(id: u64, archive_height: u64) -> Self {
        Self {
            id,
            archive_height,
            content_hash: None,
            state: ShardState::InProgress,
        }
    }

    /// Whether the shard is completed.
    pub fn is_completed(&self) -> bool {
        self.state == ShardState::Completed
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(u64, u64, Option<Vec<u8>>, i64)> {
        Ok((
            row.get::<_, i64>(0)? as u64,
            row.get::<_, i64>(2)? as u64,
            row.get(1)?,
            row.get(3)?,
        ))
    }
}

fn into_record(raw: (u64, u64, Option<Vec<u8>>, i64)) -> Result<ShardRecord, ShardingError> {
    let (id, archive_height, content_hash, code) = raw;
    Ok(ShardRecord {
        id,
        archive_height,
        content_hash,
        state: ShardState::from_code(code)?,
    })
}

const SELECT_SHARD: &str = "SELECT shard_id, shard_hash, shard_height, shard_state FROM shard";

/// Read and write access to the `shard` table.
pub struct ShardRegistry<'a> {
    conn: &'a Connection,
}

impl<'a> ShardRegistry<'a> {
    /// Wrap a main database connection.
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert or update a shard record. Completed records are immutable.
    pub fn save_shard(&self, record: &ShardRecord) -> Result<(), ShardingError> {
        // joins the caller's transaction when one is open
        let tx = if self.conn.is_autocommit() {
            Some(self.conn.unchecked_transaction()?)
        } else {
            None
        };
        if let Some(existing) = self.get_shard(record.id)? {
            if existing.is_completed() {
                if existing == *record {
                    return Ok(());
                }
                return Err(ShardingError::ShardImmutable { shard_id: record.id });
            }
        }
        self.conn.execute(
            "INSERT INTO shard (shard_id, shard_hash, shard_height, shard_state)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (shard_id) DO UPDATE
             SET shard_hash = excluded.shard_hash, shard_height = excluded.shard_height,
                 shard_state = excluded.shard_state",
            params![
                record.id as i64,
                record.content_hash,
                record.archive_height as i64,
                record.state.code()
            ],
        )?;
        if let Some(tx) = tx {
            tx.commit()?;
        }
        debug!(shard_id = record.id, state = ?record.state, "shard record saved");
        Ok(())
    }

    /// Load a shard record.
    pub fn get_shard(&self, id: u64) -> Result<Option<ShardRecord>, ShardingError> {
        let raw = self
            .conn
            .query_row(
                &format!("{SELECT_SHARD} WHERE shard_id = ?1"),
                [id as i64],
                ShardRecord::from_row,
            )
            .optional()?;
        raw.map(into_record).transpose()
    }

    /// The record with the highest id.
    pub fn latest_shard(&self) -> Result<Option<ShardRecord>, ShardingError> {
        let raw = self
            .conn
            .query_row(
                &format!("{SELECT_SHARD} ORDER BY shard_id DESC LIMIT 1"),
                [],
                ShardRecord::from_row,
            )
            .optional()?;
        raw.map(into_record).transpose()
    }

    /// The in-progress record, if a migration has created one.
    pub fn in_progress_shard(&self) -> Result<Option<ShardRecord>, ShardingError> {
        Ok(self.latest_shard()?.filter(|s| !s.is_completed()))
    }

    /// Id the next shard will take.
    pub fn next_shard_id(&self) -> Result<u64, ShardingError> {
        let max: i64 =
            self.conn
                .query_row("SELECT IFNULL(MAX(shard_id), 0) FROM shard", [], |row| row.get(0))?;
        Ok(max as u64 + 1)
    }

    /// All records ordered by id.
    pub fn list_shards(&self) -> Result<Vec<ShardRecord>, ShardingError> {
        let mut stmt = self.conn.prepare(&format!("{SELECT_SHARD} ORDER BY shard_id"))?;
        let raw = stmt
            .query_map([], ShardRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(into_record).collect()
    }

    /// Number of completed shards.
    pub fn count_completed(&self) -> Result<u64, ShardingError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM shard WHERE shard_state = ?1",
            [ShardState::Completed.code()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::init_main_schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_main_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn test_save_and_get() {
        let conn = conn();
        let registry = ShardRegistry::new(&conn);
        assert_eq!(registry.next_shard_id().unwrap(), 1);
        assert!(registry.latest_shard().unwrap().is_none());

        registry.save_shard(&ShardRecord::in_progress(1, 5000)).unwrap();
        let record = registry.get_shard(1).unwrap().unwrap();
        assert_eq!(record.archive_height, 5000);
        assert_eq!(record.state, ShardState::InProgress);
        assert_eq!(registry.next_shard_id().unwrap(), 2);
        assert_eq!(registry.in_progress_shard().unwrap(), Some(record));
    }

    #[test]
    fn test_completed_record_is_immutable() {
        let conn = conn();
        let registry = ShardRegistry::new(&conn);
        let completed = ShardRecord {
            id: 1,
            archive_height: 5000,
            content_hash: Some(vec![1, 2, 3]),
            state: ShardState::Completed,
        };
        registry.save_shard(&completed).unwrap();
        registry.save_shard(&completed).unwrap();

        let err = registry
            .save_shard(&ShardRecord::in_progress(1, 6000))
            .unwrap_err();
        assert!(matches!(err, ShardingError::ShardImmutable { shard_id: 1 }));
        assert_eq!(registry.count_completed().unwrap(), 1);
        assert!(registry.in_progress_shard().unwrap().is_none());
    }

    #[test]
    fn test_save_joins_open_transaction() {
        let conn = conn();
        {
            let tx = conn.unchecked_transaction().unwrap();
            ShardRegistry::new(&tx)
                .save_shard(&ShardRecord::in_progress(1, 5000))
                .unwrap();
            // dropped without commit
        }
        assert!(ShardRegistry::new(&conn).get_shard(1).unwrap().is_none());

        let tx = conn.unchecked_transaction().unwrap();
        ShardRegistry::new(&tx)
            .save_shard(&ShardRecord::in_progress(1, 5000))
            .unwrap();
        tx.commit().unwrap();
        assert!(ShardRegistry::new(&conn).get_shard(1).unwrap().is_some());
        assert!(conn.is_autocommit());
    }

    #[test]
    fn test_failed_save_leaves_no_transaction_open() {
        let conn = conn();
        conn.execute_batch(
            "CREATE TRIGGER reject_shard BEFORE INSERT ON shard \
             BEGIN SELECT RAISE(ABORT, 'read only'); END;",
        )
        .unwrap();
        let registry = ShardRegistry::new(&conn);
        assert!(registry.save_shard(&ShardRecord::in_progress(1, 5000)).is_err());
        assert!(conn.is_autocommit());
        assert!(registry.get_shard(1).unwrap().is_none());
    }

    #[test]
    fn test_list_shards_in_order() {
        let conn = conn();
        let registry = ShardRegistry::new(&conn);
        registry.save_shard(&ShardRecord::in_progress(2, 10)).unwrap();
        registry.save_shard(&ShardRecord::in_progress(1, 5)).unwrap();

        let ids: Vec<u64> = registry.list_shards().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_corrupt_state_code() {
        let conn = conn();
        conn.execute(
            "INSERT INTO shard (shard_id, shard_height, shard_state) VALUES (1, 5, 7)",
            [],
        )
        .unwrap();
        let err = ShardRegistry::new(&conn).get_shard(1).unwrap_err();
        assert!(matches!(err, ShardingError::StateCorrupted { .. }));
    }
}
