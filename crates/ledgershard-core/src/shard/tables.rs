//! Per-table move plans for each migration phase.

use rusqlite::types::Value;

use super::boundary::check_identifier;
use super::error::ShardingError;
use super::mover::{Bind, MovePlan};
use crate::storage::chain::{BLOCK_COLUMNS, TRANSACTION_COLUMNS};
use crate::storage::schema::{BLOCK_TABLE, TRANSACTION_TABLE};

/// Tables copied into the shard, parents first.
pub const COPY_TABLES: [&str; 2] = [BLOCK_TABLE, TRANSACTION_TABLE];

/// Tables deleted from the main database, children first.
pub const DELETE_TABLES: [&str; 2] = [TRANSACTION_TABLE, BLOCK_TABLE];

fn page_filter(extra: &str) -> String {
    format!("WHERE db_id > ?1 AND db_id < ?2 {extra} ORDER BY db_id LIMIT ?3")
}

fn chain_columns(table: &str, operation: &'static str) -> Result<&'static [&'static str], ShardingError> {
    match table {
        BLOCK_TABLE => Ok(BLOCK_COLUMNS),
        TRANSACTION_TABLE => Ok(TRANSACTION_COLUMNS),
        other => Err(ShardingError::UnsupportedTable {
            table: other.to_string(),
            operation,
        }),
    }
}

/// Copy rows below `height` into the same table of the shard.
///
/// Writes keep the main `db_id` and ignore rows already present, so a page
/// replayed after a crash changes nothing.
pub fn copy_plan(table: &str, height: i64) -> Result<MovePlan, ShardingError> {
    let columns = chain_columns(table, "CopyData")?;
    let select_list = columns.join(", ");
    let placeholders = (1..=columns.len() + 1)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(MovePlan {
        table: table.to_string(),
        select_sql: format!(
            "SELECT {select_list}, db_id FROM {table} {}",
            page_filter("AND height < ?4")
        ),
        select_params: vec![Value::Integer(height)],
        write_sql: format!(
            "INSERT OR IGNORE INTO {table} ({select_list}, db_id) VALUES ({placeholders})"
        ),
        binds: (0..=columns.len()).map(Bind::Column).collect(),
        honor_exclusions: table == TRANSACTION_TABLE,
    })
}

/// Delete archived rows below `height` from the main database.
pub fn delete_plan(table: &str, height: i64) -> Result<MovePlan, ShardingError> {
    chain_columns(table, "DeleteCopiedData")?;
    Ok(MovePlan {
        table: table.to_string(),
        select_sql: format!("SELECT db_id FROM {table} {}", page_filter("AND height < ?4")),
        select_params: vec![Value::Integer(height)],
        write_sql: format!("DELETE FROM {table} WHERE db_id = ?1"),
        binds: vec![Bind::Column(0)],
        honor_exclusions: table == TRANSACTION_TABLE,
    })
}

/// Move derived rows written below `height` up to `height`.
pub fn relink_plan(table: &str, height: i64) -> Result<MovePlan, ShardingError> {
    check_identifier(table).map_err(|_| ShardingError::UnsupportedTable {
        table: table.to_string(),
        operation: "RelinkData",
    })?;
    Ok(MovePlan {
        table: table.to_string(),
        select_sql: format!("SELECT db_id FROM {table} {}", page_filter("AND height < ?4")),
        select_params: vec![Value::Integer(height)],
        write_sql: format!("UPDATE {table} SET height = ?1 WHERE db_id = ?2"),
        binds: vec![Bind::Const(Value::Integer(height)), Bind::Column(0)],
        honor_exclusions: false,
    })
}

/// Map every block below `height` to `shard_id`.
pub fn block_index_plan(height: i64, shard_id: u64) -> MovePlan {
    MovePlan {
        table: BLOCK_TABLE.to_string(),
        select_sql: format!(
            "SELECT id, height, db_id FROM {BLOCK_TABLE} {}",
            page_filter("AND height < ?4")
        ),
        select_params: vec![Value::Integer(height)],
        write_sql: "INSERT INTO block_index (block_id, block_height, shard_id) VALUES (?1, ?2, ?3)"
            .to_string(),
        binds: vec![
            Bind::Column(0),
            Bind::Column(1),
            Bind::Const(Value::Integer(shard_id as i64)),
        ],
        honor_exclusions: false,
    }
}

/// Map every archived transaction below `height` to its block and to
/// `shard_id`, the shard its row is copied into.
pub fn transaction_index_plan(height: i64, shard_id: u64) -> MovePlan {
    MovePlan {
        table: TRANSACTION_TABLE.to_string(),
        select_sql: format!(
            "SELECT id, block_id, height, transaction_index, db_id FROM {TRANSACTION_TABLE} {}",
            page_filter("AND height < ?4")
        ),
        select_params: vec![Value::Integer(height)],
        write_sql: "INSERT INTO transaction_shard_index \
                    (transaction_id, block_id, height, transaction_index, shard_id) \
                    VALUES (?1, ?2, ?3, ?4, ?5)"
            .to_string(),
        binds: (0..4)
            .map(Bind::Column)
            .chain([Bind::Const(Value::Integer(shard_id as i64))])
            .collect(),
        honor_exclusions: true,
    }
}
