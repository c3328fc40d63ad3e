//! Runs the migration one operation at a time and checks each phase.

mod common;

use std::collections::HashSet;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use common::{fixture, EXCLUDED_TRANSACTION_IDS, NEXT_SHARD_ID, TARGET_HEIGHT};
use ledgershard_core::shard::backup::backup_file_name;
use ledgershard_core::shard::excluded::find_excluded_transactions;
use ledgershard_core::shard::{
    BackupMainDatabase, CopyData, CreateShardSchema, DataMigrateOperation, DeleteCopiedData,
    FinishSharding,
    MigrateState, RecoveryStore, RelinkData, SchemaEvolver, ShardRegistry, ShardState,
    ShardingError, UpdateSecondaryIndex, SHARD_SCHEMA_V1, SHARD_SCHEMA_V2,
};
use ledgershard_core::storage::chain::{
    count_block_index_by_shard, count_blocks, count_transaction_index_by_shard, find_block_shard,
    find_transaction_shard,
};
use ledgershard_core::storage::VersionedEntityTable;

#[test]
fn test_step_by_step_migration() {
    let fx = fixture();
    let executor = &fx.executor;
    let shard_id = NEXT_SHARD_ID;
    let height = TARGET_HEIGHT;
    let h = height as i64;

    let excluded = {
        let main = fx.ctx().databases().main();
        Arc::new(find_excluded_transactions(&main, h).unwrap())
    };
    assert_eq!(excluded.len(), 2);

    let state = executor
        .execute_operation(&BackupMainDatabase::new(shard_id, height))
        .unwrap();
    assert_eq!(state, MigrateState::MainDbBackuped);
    let backup = fx
        .config
        .backup_dir()
        .join(backup_file_name("testnet", shard_id, height));
    assert!(backup.exists());

    let state = executor
        .execute_operation(&CreateShardSchema::new(shard_id, height, SHARD_SCHEMA_V1))
        .unwrap();
    assert_eq!(state, MigrateState::ShardSchemaCreated);
    {
        let main = fx.ctx().databases().main();
        let record = ShardRegistry::new(&main).get_shard(shard_id).unwrap().unwrap();
        assert_eq!(record.state, ShardState::InProgress);
        assert_eq!(record.archive_height, height);
        assert!(record.content_hash.is_none());
    }

    let state = executor
        .execute_operation(&CopyData::new(shard_id, height, Arc::clone(&excluded)))
        .unwrap();
    assert_eq!(state, MigrateState::DataCopiedToShard);
    assert_eq!(fx.shard_count("blocks"), 8);
    assert_eq!(fx.shard_count("transactions"), 6);

    let state = executor
        .execute_operation(&CreateShardSchema::new(shard_id, height, SHARD_SCHEMA_V2))
        .unwrap();
    assert_eq!(state, MigrateState::ShardSchemaFull);
    {
        let shard = fx.ctx().databases().open_shard(shard_id).unwrap();
        assert_eq!(SchemaEvolver::new(&shard).current_version().unwrap(), SHARD_SCHEMA_V2);
    }

    let state = executor.execute_operation(&RelinkData::new(height)).unwrap();
    assert_eq!(state, MigrateState::DataRelinkedInMain);
    {
        let main = fx.ctx().databases().main();
        let public_key = VersionedEntityTable::public_key();
        assert_eq!(public_key.count_below(&main, h).unwrap(), 0);
        // the height-100 version was superseded at 5000 and trimmed
        assert_eq!(public_key.count(&main).unwrap(), 4);
        assert_eq!(public_key.latest_height(&main, 2).unwrap(), Some(h));
        assert_eq!(public_key.latest_height(&main, 1).unwrap(), Some(9000));
        assert_eq!(
            VersionedEntityTable::genesis_public_key()
                .count_below(&main, h)
                .unwrap(),
            0
        );
    }

    let state = executor
        .execute_operation(&UpdateSecondaryIndex::new(
            shard_id,
            height,
            Arc::clone(&excluded),
        ))
        .unwrap();
    assert_eq!(state, MigrateState::SecondaryIndexUpdated);
    {
        let main = fx.ctx().databases().main();
        assert_eq!(count_block_index_by_shard(&main, shard_id).unwrap(), 8);
        assert_eq!(count_transaction_index_by_shard(&main, shard_id).unwrap(), 6);
        assert_eq!(find_block_shard(&main, common::block_id(3000)).unwrap(), Some(shard_id));
        assert_eq!(find_block_shard(&main, common::block_id(8000)).unwrap(), None);
        assert_eq!(find_transaction_shard(&main, common::block_tx_id(0)).unwrap(), Some(shard_id));
        for id in EXCLUDED_TRANSACTION_IDS {
            assert_eq!(find_transaction_shard(&main, id).unwrap(), None);
        }
    }

    let state = executor
        .execute_operation(&DeleteCopiedData::new(height, Arc::clone(&excluded)))
        .unwrap();
    assert_eq!(state, MigrateState::DataRemovedFromMain);
    {
        let main = fx.ctx().databases().main();
        assert_eq!(count_blocks(&main, 0, h).unwrap(), 0);
        assert_eq!(count_blocks(&main, h, 105_000).unwrap(), 5);
    }
    // six above the target plus the two excluded ones
    assert_eq!(fx.main_count("transactions"), 8);

    let hash = vec![0xAB; 64];
    let state = executor
        .execute_operation(&FinishSharding::with_hash(shard_id, hash.clone()))
        .unwrap();
    assert_eq!(state, MigrateState::Completed);

    let main = fx.ctx().databases().main();
    let record = ShardRegistry::new(&main).get_shard(shard_id).unwrap().unwrap();
    assert_eq!(record.state, ShardState::Completed);
    assert_eq!(record.content_hash, Some(hash));
    assert!(RecoveryStore::new(&main).get_checkpoint().unwrap().is_none());
}

#[test]
fn test_out_of_order_operation_rejected() {
    let fx = fixture();
    let excluded = Arc::new(HashSet::new());

    let err = fx
        .executor
        .execute_operation(&CopyData::new(NEXT_SHARD_ID, TARGET_HEIGHT, excluded))
        .unwrap_err();
    assert!(matches!(
        err,
        ShardingError::PreconditionViolation {
            operation: "CopyData",
            expected: MigrateState::ShardSchemaCreated,
            actual: MigrateState::Init,
        }
    ));
    assert!(!err.is_retryable());

    // nothing was touched
    assert!(!fx.ctx().databases().shard_exists(NEXT_SHARD_ID));
    assert_eq!(fx.main_count("blocks"), 13);
    assert_eq!(fx.executor.current_state().unwrap(), MigrateState::Init);
}

#[test]
fn test_repeated_step_is_rejected() {
    let fx = fixture();
    let backup = BackupMainDatabase::new(NEXT_SHARD_ID, TARGET_HEIGHT);
    fx.executor.execute_operation(&backup).unwrap();

    let err = fx.executor.execute_operation(&backup).unwrap_err();
    assert!(matches!(err, ShardingError::PreconditionViolation { .. }));
    assert_eq!(fx.executor.current_state().unwrap(), MigrateState::MainDbBackuped);
}

#[test]
fn test_finish_on_completed_shard_is_rejected() {
    let fx = fixture();
    {
        let main = fx.ctx().databases().main();
        RecoveryStore::new(&main)
            .reset_checkpoint(MigrateState::DataRemovedFromMain)
            .unwrap();
    }

    // shard 1 is already completed with a different hash
    let err = fx
        .executor
        .execute_operation(&FinishSharding::with_hash(1, vec![9; 64]))
        .unwrap_err();
    assert!(matches!(err, ShardingError::ShardImmutable { shard_id: 1 }));
    assert_eq!(
        fx.executor.current_state().unwrap(),
        MigrateState::DataRemovedFromMain
    );
}

#[test]
fn test_bulk_phases_do_not_hold_shared_connection() {
    let fx = fixture();
    let shard_id = NEXT_SHARD_ID;
    let height = TARGET_HEIGHT;
    fx.executor
        .execute_operation(&BackupMainDatabase::new(shard_id, height))
        .unwrap();
    fx.executor
        .execute_operation(&CreateShardSchema::new(shard_id, height, SHARD_SCHEMA_V1))
        .unwrap();

    let excluded = {
        let main = fx.ctx().databases().main();
        Arc::new(find_excluded_transactions(&main, height as i64).unwrap())
    };
    let ops: Vec<Box<dyn DataMigrateOperation>> = vec![
        Box::new(CopyData::new(shard_id, height, Arc::clone(&excluded))),
        Box::new(CreateShardSchema::new(shard_id, height, SHARD_SCHEMA_V2)),
        Box::new(RelinkData::new(height)),
        Box::new(UpdateSecondaryIndex::new(shard_id, height, Arc::clone(&excluded))),
        Box::new(DeleteCopiedData::new(height, excluded)),
    ];

    // block processing keeps the shared connection while the phases run
    let shared = fx.ctx().databases().main();
    let ctx = Arc::clone(fx.ctx());
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let states: Result<Vec<_>, _> = ops.iter().map(|op| op.execute(&ctx)).collect();
        let _ = done_tx.send(states.map_err(|e| e.to_string()));
    });
    let states = done_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("bulk phases blocked on the shared connection")
        .unwrap();
    assert_eq!(states.last(), Some(&MigrateState::DataRemovedFromMain));
    drop(shared);

    assert_eq!(fx.shard_count("transactions"), 6);
    assert_eq!(fx.main_count("transactions"), 8);
    let main = fx.ctx().databases().main();
    assert_eq!(count_block_index_by_shard(&main, shard_id).unwrap(), 8);
}
