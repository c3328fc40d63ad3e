//! Paginated row mover.
//!
//! Reads pages of rows from a source connection in `db_id` order and writes
//! each page to a target connection inside one transaction. The source may
//! be the target: a page is fully read before the write transaction opens.

use std::collections::HashSet;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use tracing::trace;

use super::boundary::TableBoundary;
use crate::error::Error;

/// Where a write statement parameter comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Bind {
    /// A column of the selected row, by position.
    Column(usize),
    /// A fixed value.
    Const(Value),
}

/// How one table is moved.
///
/// `select_sql` takes `?1` = lower bound, `?2` = upper bound, `?3` = page
/// size, followed by `select_params`. Its last column must be the row's
/// `db_id`. `write_sql` is executed once per row with `binds`.
#[derive(Debug, Clone)]
pub struct MovePlan {
    /// Table the rows are read from.
    pub table: String,
    /// Page query.
    pub select_sql: String,
    /// Extra page query parameters, bound from `?4` on.
    pub select_params: Vec<Value>,
    /// Statement run for each row.
    pub write_sql: String,
    /// Parameters of `write_sql`.
    pub binds: Vec<Bind>,
    /// Skip rows whose `db_id` is in the mover's exclusion set.
    pub honor_exclusions: bool,
}

/// Counters for one completed move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveStats {
    /// Committed pages.
    pub pages: u64,
    /// Rows read from the source.
    pub rows_read: u64,
    /// Rows changed in the target.
    pub rows_written: u64,
    /// Rows skipped because they were excluded.
    pub rows_skipped: u64,
}

/// Moves rows page by page between two connections.
pub struct PaginatedMover<'a> {
    source: &'a Connection,
    target: &'a Connection,
    page_size: usize,
    excluded: Option<&'a HashSet<i64>>,
}

impl<'a> PaginatedMover<'a> {
    /// Create a mover. A page size of zero is treated as one.
    pub fn new(source: &'a Connection, target: &'a Connection, page_size: usize) -> Self {
        Self {
            source,
            target,
            page_size: page_size.max(1),
            excluded: None,
        }
    }

    /// Skip rows with these `db_id`s in plans that honor exclusions.
    pub fn excluding(mut self, excluded: &'a HashSet<i64>) -> Self {
        self.excluded = Some(excluded);
        self
    }

    /// Move every row of `plan` inside `boundary`.
    ///
    /// A failed row write rolls back its page and aborts; pages committed
    /// before it stay committed.
    pub fn run(&self, plan: &MovePlan, boundary: TableBoundary) -> Result<MoveStats, Error> {
        let mut stats = MoveStats::default();
        let mut lower = boundary.lower;

        loop {
            let page = self.read_page(plan, lower, boundary.upper)?;
            let Some(last) = page.last() else {
                break;
            };
            let last_id = row_id(last)?;

            let tx = self.target.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(&plan.write_sql)?;
                for row in &page {
                    if plan.honor_exclusions && self.is_excluded(row_id(row)?) {
                        stats.rows_skipped += 1;
                        continue;
                    }
                    let params = plan
                        .binds
                        .iter()
                        .map(|bind| match bind {
                            Bind::Column(i) => row.get(*i).ok_or_else(|| {
                                Error::InvalidData(format!(
                                    "{}: bind column {} out of range",
                                    plan.table, i
                                ))
                            }),
                            Bind::Const(value) => Ok(value),
                        })
                        .collect::<Result<Vec<&Value>, Error>>()?;
                    stats.rows_written += stmt.execute(params_from_iter(params))? as u64;
                }
            }
            tx.commit()?;

            stats.pages += 1;
            stats.rows_read += page.len() as u64;
            trace!(
                table = %plan.table,
                lower,
                last_id,
                rows = page.len(),
                "page committed"
            );

            if last_id <= lower {
                return Err(Error::InvalidData(format!(
                    "{}: page did not advance past row id {}",
                    plan.table, lower
                )));
            }
            lower = last_id;
        }

        Ok(stats)
    }

    fn is_excluded(&self, db_id: i64) -> bool {
        self.excluded.is_some_and(|set| set.contains(&db_id))
    }

    fn read_page(&self, plan: &MovePlan, lower: i64, upper: i64) -> Result<Vec<Vec<Value>>, Error> {
        let mut params = vec![
            Value::Integer(lower),
            Value::Integer(upper),
            Value::Integer(self.page_size as i64),
        ];
        params.extend(plan.select_params.iter().cloned());

        let mut stmt = self.source.prepare_cached(&plan.select_sql)?;
        let columns = stmt.column_count();
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                (0..columns)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<Value>>>()
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn row_id(row: &[Value]) -> Result<i64, Error> {
    match row.last() {
        Some(Value::Integer(id)) => Ok(*id),
        other => Err(Error::InvalidData(format!(
            "expected db_id as last column, got {other:?}"
        ))),
    }
}
