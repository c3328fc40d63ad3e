//! End-to-end migration through the executor.

mod common;

use common::{
    count, fixture, transaction, EXCLUDED_TRANSACTION_IDS, NEXT_SHARD_ID, TARGET_HEIGHT,
};
use ledgershard_core::shard::{
    MigrateState, ShardHashCalculator, ShardRegistry, ShardState, ShardingError,
};
use ledgershard_core::storage::chain::{
    count_block_index_by_shard, count_blocks, count_transaction_index_by_shard,
    count_transactions, find_transaction_shard, get_block, get_transaction, insert_transaction,
};

#[test]
fn test_full_migration_completes() {
    let fx = fixture();
    let blocks_before = fx.main_count("blocks");
    let transactions_before = fx.main_count("transactions");

    assert_eq!(fx.executor.create_all_commands(TARGET_HEIGHT).unwrap(), 8);
    let state = fx.executor.execute_all_operations().unwrap();
    assert_eq!(state, MigrateState::Completed);
    assert!(fx.executor.recover().unwrap().is_none());

    // every row is in exactly one place
    let shard_blocks = fx.shard_count("blocks");
    let shard_transactions = fx.shard_count("transactions");
    assert_eq!(shard_blocks, 8);
    assert_eq!(shard_transactions, 6);
    assert_eq!(fx.main_count("blocks") + shard_blocks, blocks_before);
    assert_eq!(
        fx.main_count("transactions") + shard_transactions,
        transactions_before
    );

    let shard = fx.ctx().databases().open_shard_read_only(NEXT_SHARD_ID).unwrap();
    let expected_hash = ShardHashCalculator::new(&shard, fx.config.height.digest)
        .calculate()
        .unwrap();

    let main = fx.ctx().databases().main();
    let record = ShardRegistry::new(&main)
        .get_shard(NEXT_SHARD_ID)
        .unwrap()
        .unwrap();
    assert_eq!(record.state, ShardState::Completed);
    assert_eq!(record.archive_height, TARGET_HEIGHT);
    assert_eq!(record.content_hash, Some(expected_hash));
    assert_eq!(ShardRegistry::new(&main).next_shard_id().unwrap(), NEXT_SHARD_ID + 1);

    // index entries resolve to rows that live in the shard
    assert_eq!(count_block_index_by_shard(&main, NEXT_SHARD_ID).unwrap(), 8);
    assert_eq!(count_transaction_index_by_shard(&main, NEXT_SHARD_ID).unwrap(), 6);
    let mut stmt = main
        .prepare("SELECT block_id FROM block_index WHERE shard_id = ?1")
        .unwrap();
    let block_ids: Vec<i64> = stmt
        .query_map([NEXT_SHARD_ID as i64], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    for id in block_ids {
        assert!(get_block(&main, id).unwrap().is_none());
        assert!(get_block(&shard, id).unwrap().is_some());
    }
    let mut stmt = main
        .prepare("SELECT transaction_id FROM transaction_shard_index")
        .unwrap();
    let tx_ids: Vec<i64> = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(tx_ids.len(), 6);
    for id in tx_ids {
        assert!(get_transaction(&main, id).unwrap().is_none());
        assert!(get_transaction(&shard, id).unwrap().is_some());
    }
    assert_eq!(count(&shard, "version"), 1);
}

#[test]
fn test_commands_consumed_after_completion() {
    let fx = fixture();
    fx.executor.create_all_commands(TARGET_HEIGHT).unwrap();
    fx.executor.execute_all_operations().unwrap();

    assert!(fx.executor.target().is_none());
    assert!(matches!(
        fx.executor.execute_all_operations(),
        Err(ShardingError::NoCommands)
    ));
}

#[test]
fn test_migrate_with_nothing_below_height() {
    let fx = fixture();
    let state = fx.executor.migrate(1).unwrap();
    assert_eq!(state, MigrateState::Completed);

    assert_eq!(fx.shard_count("blocks"), 0);
    assert_eq!(fx.main_count("blocks"), 13);
    let main = fx.ctx().databases().main();
    let record = ShardRegistry::new(&main)
        .get_shard(NEXT_SHARD_ID)
        .unwrap()
        .unwrap();
    assert_eq!(record.state, ShardState::Completed);
    assert_eq!(
        record.content_hash.map(|h| h.len()),
        Some(fx.config.height.digest.digest_len())
    );
}

#[test]
fn test_second_shard_follows_first() {
    let fx = fixture();
    fx.executor.migrate(TARGET_HEIGHT).unwrap();
    fx.executor.migrate(10_000).unwrap();

    let main = fx.ctx().databases().main();
    let shards = ShardRegistry::new(&main).list_shards().unwrap();
    assert_eq!(shards.len(), 5);
    assert!(shards.iter().all(|s| s.state == ShardState::Completed));
    assert_eq!(shards[4].archive_height, 10_000);

    // blocks at 8000 and 8001 moved to shard 5
    assert_eq!(count_block_index_by_shard(&main, NEXT_SHARD_ID + 1).unwrap(), 2);
    assert_eq!(count(&main, "blocks"), 3);
    // phased transactions kept back at 8000 have resolved by 10000
    assert_eq!(count(&main, "transactions"), 3);
    assert_eq!(count(&main, "transaction_shard_index"), 11);
    assert_eq!(count_transaction_index_by_shard(&main, NEXT_SHARD_ID).unwrap(), 6);
    assert_eq!(count_transaction_index_by_shard(&main, NEXT_SHARD_ID + 1).unwrap(), 5);

    // the index points at the shard that holds the row, not at its block's shard
    let shard4 = fx.ctx().databases().open_shard_read_only(NEXT_SHARD_ID).unwrap();
    let shard5 = fx
        .ctx()
        .databases()
        .open_shard_read_only(NEXT_SHARD_ID + 1)
        .unwrap();
    for id in EXCLUDED_TRANSACTION_IDS {
        assert_eq!(find_transaction_shard(&main, id).unwrap(), Some(NEXT_SHARD_ID + 1));
        assert!(get_transaction(&shard4, id).unwrap().is_none());
        assert!(get_transaction(&shard5, id).unwrap().is_some());
    }
}

#[test]
fn test_rows_written_late_are_archived() {
    let fx = fixture();
    let late_id = 777_777;
    {
        // newest db_id, but below the target height
        let main = fx.ctx().databases().main();
        insert_transaction(&main, &transaction(late_id, 3000, 3, false)).unwrap();
        assert_eq!(count_transactions(&main, 0, TARGET_HEIGHT as i64).unwrap(), 9);
    }

    assert_eq!(fx.executor.migrate(TARGET_HEIGHT).unwrap(), MigrateState::Completed);

    assert_eq!(fx.shard_count("transactions"), 7);
    let main = fx.ctx().databases().main();
    // only the excluded transactions stay behind
    assert_eq!(count_transactions(&main, 0, TARGET_HEIGHT as i64).unwrap(), 2);
    assert_eq!(count_blocks(&main, 0, TARGET_HEIGHT as i64).unwrap(), 0);
    assert!(get_transaction(&main, late_id).unwrap().is_none());
    assert_eq!(find_transaction_shard(&main, late_id).unwrap(), Some(NEXT_SHARD_ID));
}
