//! Shared fixture: a main database with 13 blocks, 14 transactions, phasing
//! polls, derived rows and three completed shards.

#![allow(dead_code)]

use std::sync::Arc;

use ledgershard_core::shard::{ShardRecord, ShardRegistry, ShardState};
use ledgershard_core::storage::chain::{
    insert_block, insert_phasing_poll, insert_transaction, BlockRow, TransactionRow,
};
use ledgershard_core::storage::VersionedEntityTable;
use ledgershard_core::{HeightConfig, MigrationContext, ShardMigrationExecutor, ShardingConfig};
use rusqlite::Connection;
use tempfile::TempDir;

/// Archive height used by the scenarios.
pub const TARGET_HEIGHT: u64 = 8000;

/// Id the next shard takes after the three completed ones.
pub const NEXT_SHARD_ID: u64 = 4;

/// Heights of the fixture blocks; the first eight are below the target.
pub const BLOCK_HEIGHTS: [i64; 13] = [
    1, 1000, 2000, 3000, 4000, 5000, 6000, 7999, 8000, 8001, 10000, 50000, 104999,
];

/// Heights of the fixture transactions; the first eight are below the target.
pub const TRANSACTION_HEIGHTS: [i64; 14] = [
    1000, 2000, 2000, 3000, 5000, 6000, 7999, 7999, 8000, 8001, 8001, 10000, 50000, 104999,
];

/// Transaction ids whose phasing polls finish after the target height.
pub const EXCLUDED_TRANSACTION_IDS: [i64; 2] = [block_tx_id(2), block_tx_id(7)];

/// Id of the n-th fixture transaction.
pub const fn block_tx_id(n: usize) -> i64 {
    5_000 + n as i64
}

/// Id of the block at `height`.
pub fn block_id(height: i64) -> i64 {
    // mix signs like real block ids
    if height % 2 == 0 {
        height * 31 + 7
    } else {
        -(height * 31 + 7)
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub config: ShardingConfig,
    pub executor: ShardMigrationExecutor,
}

impl Fixture {
    pub fn ctx(&self) -> &Arc<MigrationContext> {
        self.executor.context()
    }

    /// Count rows of a main database table.
    pub fn main_count(&self, table: &str) -> i64 {
        let main = self.ctx().databases().main();
        count(&main, table)
    }

    /// Count rows of a table in the fixture's new shard.
    pub fn shard_count(&self, table: &str) -> i64 {
        let shard = self.ctx().databases().open_shard(NEXT_SHARD_ID).unwrap();
        count(&shard, table)
    }
}

pub fn count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .unwrap()
}

/// Build the fixture with a small page size so every phase spans pages.
pub fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = ShardingConfig::new(dir.path().join("data"))
        .with_db_name("testnet")
        .with_page_size(3)
        .with_height_config(HeightConfig::enabled(TARGET_HEIGHT));
    let ctx = MigrationContext::open(config.clone()).unwrap();

    {
        let main = ctx.databases().main();
        seed(&main);
    }

    Fixture {
        dir,
        config,
        executor: ShardMigrationExecutor::new(Arc::new(ctx)),
    }
}

/// A fixture transaction in the block at `height`.
pub fn transaction(id: i64, height: i64, n: usize, phased: bool) -> TransactionRow {
    TransactionRow {
        id,
        block_id: block_id(height),
        height,
        block_timestamp: 1_500_000_000 + height * 10,
        transaction_index: (n % 2) as i32,
        tx_type: 0,
        subtype: 0,
        sender_id: 200 + (n as i64 % 4),
        recipient_id: Some(300),
        amount: 1_000 * n as i64,
        fee: 100,
        deadline: 1440,
        full_hash: id.to_be_bytes().repeat(4),
        signature: id.to_le_bytes().repeat(8),
        phased,
    }
}

fn seed(main: &Connection) {
    let mut previous = None;
    for height in BLOCK_HEIGHTS {
        let block = BlockRow {
            id: block_id(height),
            version: 3,
            timestamp: 1_500_000_000 + height * 10,
            previous_block_id: previous,
            height,
            generator_id: 100 + height % 3,
            total_amount: height * 100,
            total_fee: height,
            payload_hash: height.to_be_bytes().repeat(4),
            block_signature: height.to_le_bytes().repeat(8),
        };
        insert_block(main, &block).unwrap();
        previous = Some(block.id);
    }

    for (n, height) in TRANSACTION_HEIGHTS.into_iter().enumerate() {
        let id = block_tx_id(n);
        let phased = EXCLUDED_TRANSACTION_IDS.contains(&id) || n == 4;
        insert_transaction(main, &transaction(id, height, n, phased)).unwrap();
    }

    // unresolved at the target height
    insert_phasing_poll(main, EXCLUDED_TRANSACTION_IDS[0], 200, 9000, 2000).unwrap();
    insert_phasing_poll(main, EXCLUDED_TRANSACTION_IDS[1], 201, 8000, 7999).unwrap();
    // resolved before the target height
    insert_phasing_poll(main, block_tx_id(4), 202, 6000, 5000).unwrap();

    let public_key = VersionedEntityTable::public_key();
    public_key.insert_version(main, 1, None, 100).unwrap();
    public_key.insert_version(main, 1, Some(&[1; 32]), 5000).unwrap();
    public_key.insert_version(main, 1, Some(&[2; 32]), 9000).unwrap();
    public_key.insert_version(main, 2, Some(&[3; 32]), 3000).unwrap();
    public_key.insert_version(main, 3, Some(&[4; 32]), 8500).unwrap();

    let genesis = VersionedEntityTable::genesis_public_key();
    genesis.insert_version(main, 10, Some(&[5; 32]), 1).unwrap();
    genesis.insert_version(main, 11, Some(&[6; 32]), 1).unwrap();

    let registry = ShardRegistry::new(main);
    for id in 1..NEXT_SHARD_ID {
        registry
            .save_shard(&ShardRecord {
                id,
                archive_height: 0,
                content_hash: Some(vec![id as u8; 64]),
                state: ShardState::Completed,
            })
            .unwrap();
    }
}
