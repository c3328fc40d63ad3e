//! Main database schema.

use rusqlite::Connection;

use crate::error::Error;

/// Block table, present in both the main and shard databases.
pub const BLOCK_TABLE: &str = "blocks";

/// Transaction table, present in both the main and shard databases.
pub const TRANSACTION_TABLE: &str = "transactions";

/// Secondary index mapping archived blocks to shards.
pub const BLOCK_INDEX_TABLE: &str = "block_index";

/// Secondary index mapping archived transactions to shards.
pub const TRANSACTION_SHARD_INDEX_TABLE: &str = "transaction_shard_index";

/// Phasing polls that may keep a transaction alive past the archive height.
pub const PHASING_POLL_TABLE: &str = "phasing_poll";

/// Shard registry table.
pub const SHARD_TABLE: &str = "shard";

/// Recovery checkpoint table.
pub const SHARD_RECOVERY_TABLE: &str = "shard_recovery";

/// Schema version of the main database.
pub const MAIN_SCHEMA_VERSION: i64 = 1;

/// An index that can be dropped and later recreated from its DDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// `CREATE INDEX IF NOT EXISTS` statement restoring it.
    pub create_sql: String,
}

impl IndexDef {
    /// Describe an index by name and creation statement.
    pub fn new(name: impl Into<String>, create_sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            create_sql: create_sql.into(),
        }
    }

    /// `DROP INDEX IF EXISTS` statement for this index.
    pub fn drop_sql(&self) -> String {
        format!("DROP INDEX IF EXISTS {}", self.name)
    }

    /// Whether the index currently exists.
    pub fn exists(&self, conn: &Connection) -> Result<bool, Error> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [&self.name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

/// Indexes on `blocks` and `transactions` that only serve lookups and can be
/// dropped while archived rows are deleted.
pub fn main_lookup_indexes() -> Vec<IndexDef> {
    vec![
        IndexDef::new(
            "blocks_timestamp_idx",
            "CREATE INDEX IF NOT EXISTS blocks_timestamp_idx ON blocks (timestamp)",
        ),
        IndexDef::new(
            "blocks_generator_id_idx",
            "CREATE INDEX IF NOT EXISTS blocks_generator_id_idx ON blocks (generator_id)",
        ),
        IndexDef::new(
            "transactions_block_id_idx",
            "CREATE INDEX IF NOT EXISTS transactions_block_id_idx ON transactions (block_id)",
        ),
        IndexDef::new(
            "transactions_sender_id_idx",
            "CREATE INDEX IF NOT EXISTS transactions_sender_id_idx ON transactions (sender_id)",
        ),
    ]
}

/// Unique indexes of the secondary index tables.
pub fn secondary_index_constraints() -> Vec<IndexDef> {
    vec![
        IndexDef::new(
            "block_index_block_id_idx",
            "CREATE UNIQUE INDEX IF NOT EXISTS block_index_block_id_idx ON block_index (block_id)",
        ),
        IndexDef::new(
            "block_index_block_height_idx",
            "CREATE UNIQUE INDEX IF NOT EXISTS block_index_block_height_idx ON block_index (block_height)",
        ),
        IndexDef::new(
            "transaction_shard_index_transaction_id_idx",
            "CREATE UNIQUE INDEX IF NOT EXISTS transaction_shard_index_transaction_id_idx \
             ON transaction_shard_index (transaction_id)",
        ),
    ]
}

const MAIN_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blocks (
    db_id INTEGER PRIMARY KEY AUTOINCREMENT,
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
CREATE UNIQUE INDEX IF NOT EXISTS blocks_id_idx ON blocks (id);
CREATE UNIQUE INDEX IF NOT EXISTS blocks_height_idx ON blocks (height);
CREATE INDEX IF NOT EXISTS blocks_timestamp_idx ON blocks (timestamp);
CREATE INDEX IF NOT EXISTS blocks_generator_id_idx ON blocks (generator_id);

CREATE TABLE IF NOT EXISTS transactions (
    db_id INTEGER PRIMARY KEY AUTOINCREMENT,
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
CREATE UNIQUE INDEX IF NOT EXISTS transactions_id_idx ON transactions (id);
CREATE INDEX IF NOT EXISTS transactions_block_id_idx ON transactions (block_id);
CREATE INDEX IF NOT EXISTS transactions_sender_id_idx ON transactions (sender_id);

CREATE TABLE IF NOT EXISTS block_index (
    block_id INTEGER NOT NULL,
    block_height INTEGER NOT NULL,
    shard_id INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS block_index_block_id_idx ON block_index (block_id);
CREATE UNIQUE INDEX IF NOT EXISTS block_index_block_height_idx ON block_index (block_height);

CREATE TABLE IF NOT EXISTS transaction_shard_index (
    transaction_id INTEGER NOT NULL,
    block_id INTEGER NOT NULL REFERENCES block_index (block_id) ON DELETE CASCADE,
    height INTEGER NOT NULL,
    transaction_index INTEGER NOT NULL,
    shard_id INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS transaction_shard_index_transaction_id_idx
    ON transaction_shard_index (transaction_id);
CREATE INDEX IF NOT EXISTS transaction_shard_index_block_id_idx
    ON transaction_shard_index (block_id);
CREATE INDEX IF NOT EXISTS transaction_shard_index_shard_id_idx
    ON transaction_shard_index (shard_id);

CREATE TABLE IF NOT EXISTS phasing_poll (
    db_id INTEGER PRIMARY KEY AUTOINCREMENT,
    id INTEGER NOT NULL,
    account_id INTEGER NOT NULL,
    finish_height INTEGER NOT NULL,
    height INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS phasing_poll_id_idx ON phasing_poll (id);

CREATE TABLE IF NOT EXISTS public_key (
    db_id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    public_key BLOB,
    height INTEGER NOT NULL,
    latest INTEGER NOT NULL DEFAULT 1
);
CREATE UNIQUE INDEX IF NOT EXISTS public_key_account_id_height_idx ON public_key (account_id, height);
CREATE INDEX IF NOT EXISTS public_key_height_idx ON public_key (height);

CREATE TABLE IF NOT EXISTS genesis_public_key (
    db_id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    public_key BLOB,
    height INTEGER NOT NULL,
    latest INTEGER NOT NULL DEFAULT 1
);
CREATE UNIQUE INDEX IF NOT EXISTS genesis_public_key_account_id_height_idx
    ON genesis_public_key (account_id, height);
CREATE INDEX IF NOT EXISTS genesis_public_key_height_idx ON genesis_public_key (height);

CREATE TABLE IF NOT EXISTS shard (
    shard_id INTEGER PRIMARY KEY,
    shard_hash BLOB,
    shard_height INTEGER NOT NULL,
    shard_state INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS shard_recovery (
    shard_recovery_id INTEGER PRIMARY KEY CHECK (shard_recovery_id = 1),
    state TEXT NOT NULL,
    object_name TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Create the main database tables if they do not exist.
pub fn init_main_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(MAIN_SCHEMA)?;
    conn.pragma_update(None, "user_version", MAIN_SCHEMA_VERSION)?;
    Ok(())
}
