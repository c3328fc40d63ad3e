//! Block and transaction rows in the main and shard databases.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Error;

/// Block columns, in storage order, excluding `db_id`.
pub const BLOCK_COLUMNS: &[&str] = &[
    "id",
    "version",
    "timestamp",
    "previous_block_id",
    "height",
    "generator_id",
    "total_amount",
    "total_fee",
    "payload_hash",
    "block_signature",
];

/// Transaction columns, in storage order, excluding `db_id`.
pub const TRANSACTION_COLUMNS: &[&str] = &[
    "id",
    "block_id",
    "height",
    "block_timestamp",
    "transaction_index",
    "type",
    "subtype",
    "sender_id",
    "recipient_id",
    "amount",
    "fee",
    "deadline",
    "full_hash",
    "signature",
    "phased",
];

/// A stored block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRow {
    /// Block id.
    pub id: i64,
    /// Block format version.
    pub version: i32,
    /// Epoch timestamp in seconds.
    pub timestamp: i64,
    /// Id of the parent block.
    pub previous_block_id: Option<i64>,
    /// Chain height.
    pub height: i64,
    /// Account that forged the block.
    pub generator_id: i64,
    /// Sum of transferred amounts.
    pub total_amount: i64,
    /// Sum of fees.
    pub total_fee: i64,
    /// Hash of the block payload.
    pub payload_hash: Vec<u8>,
    /// Generator signature over the block.
    pub block_signature: Vec<u8>,
}

impl BlockRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            version: row.get("version")?,
            timestamp: row.get("timestamp")?,
            previous_block_id: row.get("previous_block_id")?,
            height: row.get("height")?,
            generator_id: row.get("generator_id")?,
            total_amount: row.get("total_amount")?,
            total_fee: row.get("total_fee")?,
            payload_hash: row.get("payload_hash")?,
            block_signature: row.get("block_signature")?,
        })
    }
}

/// A stored transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRow {
    /// Transaction id.
    pub id: i64,
    /// Id of the containing block.
    pub block_id: i64,
    /// Height of the containing block.
    pub height: i64,
    /// Timestamp of the containing block.
    pub block_timestamp: i64,
    /// Position inside the block.
    pub transaction_index: i32,
    /// Transaction type.
    pub tx_type: i32,
    /// Transaction subtype.
    pub subtype: i32,
    /// Sending account.
    pub sender_id: i64,
    /// Receiving account, if any.
    pub recipient_id: Option<i64>,
    /// Transferred amount.
    pub amount: i64,
    /// Fee paid.
    pub fee: i64,
    /// Deadline in minutes.
    pub deadline: i32,
    /// Full transaction hash.
    pub full_hash: Vec<u8>,
    /// Sender signature.
    pub signature: Vec<u8>,
    /// Whether the transaction is phased.
    pub phased: bool,
}

impl TransactionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            block_id: row.get("block_id")?,
            height: row.get("height")?,
            block_timestamp: row.get("block_timestamp")?,
            transaction_index: row.get("transaction_index")?,
            tx_type: row.get("type")?,
            subtype: row.get("subtype")?,
            sender_id: row.get("sender_id")?,
            recipient_id: row.get("recipient_id")?,
            amount: row.get("amount")?,
            fee: row.get("fee")?,
            deadline: row.get("deadline")?,
            full_hash: row.get("full_hash")?,
            signature: row.get("signature")?,
            phased: row.get("phased")?,
        })
    }
}

/// Insert a block, returning its row id.
pub fn insert_block(conn: &Connection, block: &BlockRow) -> Result<i64, Error> {
    conn.execute(
        "INSERT INTO blocks (id, version, timestamp, previous_block_id, height, generator_id,
             total_amount, total_fee, payload_hash, block_signature)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            block.id,
            block.version,
            block.timestamp,
            block.previous_block_id,
            block.height,
            block.generator_id,
            block.total_amount,
            block.total_fee,
            block.payload_hash,
            block.block_signature,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Insert a transaction, returning its row id.
pub fn insert_transaction(conn: &Connection, tx: &TransactionRow) -> Result<i64, Error> {
    conn.execute(
        "INSERT INTO transactions (id, block_id, height, block_timestamp, transaction_index, type,
             subtype, sender_id, recipient_id, amount, fee, deadline, full_hash, signature, phased)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            tx.id,
            tx.block_id,
            tx.height,
            tx.block_timestamp,
            tx.transaction_index,
            tx.tx_type,
            tx.subtype,
            tx.sender_id,
            tx.recipient_id,
            tx.amount,
            tx.fee,
            tx.deadline,
            tx.full_hash,
            tx.signature,
            tx.phased,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Register a phasing poll for a transaction.
pub fn insert_phasing_poll(
    conn: &Connection,
    transaction_id: i64,
    account_id: i64,
    finish_height: i64,
    height: i64,
) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO phasing_poll (id, account_id, finish_height, height) VALUES (?1, ?2, ?3, ?4)",
        params![transaction_id, account_id, finish_height, height],
    )?;
    Ok(())
}

/// Count blocks with `from_height <= height < to_height`.
pub fn count_blocks(conn: &Connection, from_height: i64, to_height: i64) -> Result<u64, Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM blocks WHERE height >= ?1 AND height < ?2",
        params![from_height, to_height],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Count transactions with `from_height <= height < to_height`.
pub fn count_transactions(
    conn: &Connection,
    from_height: i64,
    to_height: i64,
) -> Result<u64, Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM transactions WHERE height >= ?1 AND height < ?2",
        params![from_height, to_height],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Load a block by id.
pub fn get_block(conn: &Connection, id: i64) -> Result<Option<BlockRow>, Error> {
    let block = conn
        .query_row("SELECT * FROM blocks WHERE id = ?1", [id], BlockRow::from_row)
        .optional()?;
    Ok(block)
}

/// Load a transaction by id.
pub fn get_transaction(conn: &Connection, id: i64) -> Result<Option<TransactionRow>, Error> {
    let tx = conn
        .query_row(
            "SELECT * FROM transactions WHERE id = ?1",
            [id],
            TransactionRow::from_row,
        )
        .optional()?;
    Ok(tx)
}

/// Shard holding an archived block, resolved through the block index.
pub fn find_block_shard(conn: &Connection, block_id: i64) -> Result<Option<u64>, Error> {
    let shard: Option<i64> = conn
        .query_row(
            "SELECT shard_id FROM block_index WHERE block_id = ?1",
            [block_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(shard.map(|id| id as u64))
}

/// Shard holding an archived transaction.
///
/// A phased transaction can be archived by a later shard than its block, so
/// the shard is read from the transaction's own index row.
pub fn find_transaction_shard(conn: &Connection, transaction_id: i64) -> Result<Option<u64>, Error> {
    let shard: Option<i64> = conn
        .query_row(
            "SELECT shard_id FROM transaction_shard_index WHERE transaction_id = ?1",
            [transaction_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(shard.map(|id| id as u64))
}

/// Number of block index rows pointing at a shard.
pub fn count_block_index_by_shard(conn: &Connection, shard_id: u64) -> Result<u64, Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM block_index WHERE shard_id = ?1",
        [shard_id as i64],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Number of transaction index rows pointing at a shard.
pub fn count_transaction_index_by_shard(conn: &Connection, shard_id: u64) -> Result<u64, Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM transaction_shard_index WHERE shard_id = ?1",
        [shard_id as i64],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}
