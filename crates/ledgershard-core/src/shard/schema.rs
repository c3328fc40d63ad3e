//! Versioned shard database schema.
//!
//! Version 1 creates bare tables so the bulk copy writes without index
//! maintenance. Version 2 adds the unique and lookup indexes and verifies
//! that every archived transaction has its block.

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::Error;

/// Tables without constraints.
pub const SHARD_SCHEMA_V1: u32 = 1;

/// Constraints and indexes.
pub const SHARD_SCHEMA_V2: u32 = 2;

const LATEST_VERSION: u32 = SHARD_SCHEMA_V2;

const V1: &str = r#"
CREATE TABLE IF NOT EXISTS blocks (
    db_id INTEGER PRIMARY KEY,
    id INTEGER NOT NULL,
    version INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    previous_block_id INTEGER,
    height INTEGER NOT NULL,
    generator_id INTEGER NOT NULL,
    total_amount INTEGER NOT NULL,
    total_fee INTEGER NOT NULL,
    payload_hash BLOB NOT NULL,
    block_signature BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS transactions (
    db_id INTEGER PRIMARY KEY,
    id INTEGER NOT NULL,
    block_id INTEGER NOT NULL,
    height INTEGER NOT NULL,
    block_timestamp INTEGER NOT NULL,
    transaction_index INTEGER NOT NULL,
    type INTEGER NOT NULL,
    subtype INTEGER NOT NULL,
    sender_id INTEGER NOT NULL,
    recipient_id INTEGER,
    amount INTEGER NOT NULL,
    fee INTEGER NOT NULL,
    deadline INTEGER NOT NULL,
    full_hash BLOB NOT NULL,
    signature BLOB NOT NULL,
    phased INTEGER NOT NULL DEFAULT 0
);
"#;

const V2: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS blocks_id_idx ON blocks (id);
CREATE UNIQUE INDEX IF NOT EXISTS blocks_height_idx ON blocks (height);
CREATE INDEX IF NOT EXISTS blocks_generator_id_idx ON blocks (generator_id);
CREATE UNIQUE INDEX IF NOT EXISTS transactions_id_idx ON transactions (id);
CREATE INDEX IF NOT EXISTS transactions_block_id_idx ON transactions (block_id);
CREATE INDEX IF NOT EXISTS transactions_sender_id_idx ON transactions (sender_id);
"#;

/// Applies shard schema versions in order, each at most once.
pub struct SchemaEvolver<'a> {
    conn: &'a Connection,
}

impl<'a> SchemaEvolver<'a> {
    /// Wrap a shard connection.
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Highest applied version, zero for a fresh database.
    pub fn current_version(&self) -> Result<u32, Error> {
        self.conn
            .execute_batch("CREATE TABLE IF NOT EXISTS version (next_update INTEGER NOT NULL)")?;
        let version: Option<i64> = self
            .conn
            .query_row("SELECT MAX(next_update) FROM version", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(version.unwrap_or(0) as u32)
    }

    /// Bring the schema up to `target`, applying every missing version in
    /// order. Returns the versions applied by this call.
    pub fn apply(&self, target: u32) -> Result<Vec<u32>, Error> {
        if target == 0 || target > LATEST_VERSION {
            return Err(Error::InvalidData(format!(
                "unknown shard schema version {target}"
            )));
        }

        let current = self.current_version()?;
        let mut applied = Vec::new();
        for version in (current + 1)..=target {
            let tx = self.conn.unchecked_transaction()?;
            match version {
                SHARD_SCHEMA_V1 => tx.execute_batch(V1)?,
                SHARD_SCHEMA_V2 => {
                    check_transactions_have_blocks(&tx)?;
                    tx.execute_batch(V2)?;
                }
                other => {
                    return Err(Error::InvalidData(format!(
                        "no migration script for shard schema version {other}"
                    )))
                }
            }
            tx.execute("DELETE FROM version", [])?;
            tx.execute("INSERT INTO version (next_update) VALUES (?1)", [version])?;
            tx.commit()?;

            debug!(version, "shard schema version applied");
            applied.push(version);
        }

        if applied.is_empty() {
            debug!(current, target, "shard schema already up to date");
        } else {
            info!(from = current, to = target, "shard schema updated");
        }
        Ok(applied)
    }
}

// Transactions held back from an earlier shard by phasing arrive in a later
// one without their block, so only the shard's own height span is checked.
fn check_transactions_have_blocks(conn: &Connection) -> Result<(), Error> {
    let orphans: i64 = conn.query_row(
        "SELECT COUNT(*) FROM transactions t
         WHERE t.height >= (SELECT IFNULL(MIN(height), 0) FROM blocks)
         AND NOT EXISTS (SELECT 1 FROM blocks b WHERE b.id = t.block_id)",
        [],
        |row| row.get(0),
    )?;
    if orphans > 0 {
        return Err(Error::InvalidData(format!(
            "{orphans} shard transactions reference missing blocks"
        )));
    }
    Ok(())
}
