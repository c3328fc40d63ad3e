//! Transactions that must stay in the main database.

use std::collections::HashSet;

use rusqlite::Connection;

use crate::error::Error;

/// Row ids of transactions below `height` whose phasing poll finishes at or
/// after `height`.
///
/// Such transactions can still be approved or rejected, so they are neither
/// copied to the shard, indexed, nor deleted from the main database.
pub fn find_excluded_transactions(conn: &Connection, height: i64) -> Result<HashSet<i64>, Error> {
    let mut stmt = conn.prepare(
        "SELECT t.db_id FROM transactions t
         JOIN phasing_poll p ON p.id = t.id
         WHERE p.finish_height >= ?1 AND t.height < ?1",
    )?;
    let ids = stmt
        .query_map([height], |row| row.get(0))?
        .collect::<Result<HashSet<i64>, _>>()?;
    Ok(ids)
}
