//! Row-id ranges for paginated phases.

use rusqlite::Connection;

use crate::error::Error;

/// A `db_id` range, exclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableBoundary {
    /// Rows with `db_id` above this value are in range.
    pub lower: i64,
    /// Rows with `db_id` below this value are in range.
    pub upper: i64,
}

impl TableBoundary {
    /// Range covering the rows written below `height`.
    ///
    /// The upper bound is one past the last row id below `height`. Row ids
    /// and heights are not ordered together, so rows at or above `height`
    /// may fall inside the range; page queries filter them by height.
    pub fn below_height(conn: &Connection, table: &str, height: i64) -> Result<Self, Error> {
        check_identifier(table)?;
        let (lower, upper) = conn.query_row(
            &format!(
                "SELECT IFNULL(MIN(db_id) - 1, 0), IFNULL(MAX(db_id) + 1, 1) \
                 FROM {table} WHERE height < ?1"
            ),
            [height],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(Self { lower, upper })
    }

    /// Range covering every row of the table.
    ///
    /// Used where rewritten rows change their height, so a height-derived
    /// cut-point would move between runs.
    pub fn whole_table(conn: &Connection, table: &str) -> Result<Self, Error> {
        check_identifier(table)?;
        Ok(Self {
            lower: lower_bound(conn, table)?,
            upper: past_last(conn, table)?,
        })
    }

    /// Whether no row id fits strictly between the bounds.
    pub fn is_empty(&self) -> bool {
        self.upper - self.lower <= 1
    }
}

fn lower_bound(conn: &Connection, table: &str) -> Result<i64, Error> {
    let lower = conn.query_row(
        &format!("SELECT IFNULL(MIN(db_id) - 1, 0) FROM {table}"),
        [],
        |row| row.get(0),
    )?;
    Ok(lower)
}

fn past_last(conn: &Connection, table: &str) -> Result<i64, Error> {
    let upper = conn.query_row(
        &format!("SELECT IFNULL(MAX(db_id) + 1, 1) FROM {table}"),
        [],
        |row| row.get(0),
    )?;
    Ok(upper)
}

/// Reject table names that are not plain identifiers before they reach SQL text.
pub(crate) fn check_identifier(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidData(format!("invalid table name: {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(heights: &[i64]) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (db_id INTEGER PRIMARY KEY, height INTEGER NOT NULL)")
            .unwrap();
        for (i, h) in heights.iter().enumerate() {
            conn.execute(
                "INSERT INTO t (db_id, height) VALUES (?1, ?2)",
                [(i as i64 + 10), *h],
            )
            .unwrap();
        }
        conn
    }

    #[test]
    fn test_cut_after_last_row_below_height() {
        let conn = table(&[1, 2, 3, 4, 5]);
        let b = TableBoundary::below_height(&conn, "t", 4).unwrap();
        assert_eq!(b, TableBoundary { lower: 9, upper: 13 });
    }

    #[test]
    fn test_late_row_below_height_is_in_range() {
        // db_id 14 was written after rows at heights 8 and 9
        let conn = table(&[1, 8, 2, 9, 3]);
        let b = TableBoundary::below_height(&conn, "t", 5).unwrap();
        assert_eq!(b, TableBoundary { lower: 9, upper: 15 });

        let b = TableBoundary::below_height(&conn, "t", 2).unwrap();
        assert_eq!(b, TableBoundary { lower: 9, upper: 11 });
    }

    #[test]
    fn test_nothing_below_height() {
        let conn = table(&[5, 6]);
        let b = TableBoundary::below_height(&conn, "t", 1).unwrap();
        assert!(b.is_empty());
    }

    #[test]
    fn test_all_rows_below_height() {
        let conn = table(&[1, 2]);
        let b = TableBoundary::below_height(&conn, "t", 100).unwrap();
        assert_eq!(b, TableBoundary { lower: 9, upper: 12 });
        assert!(!b.is_empty());
    }

    #[test]
    fn test_empty_table() {
        let conn = table(&[]);
        let b = TableBoundary::below_height(&conn, "t", 100).unwrap();
        assert_eq!(b, TableBoundary { lower: 0, upper: 1 });
        assert!(b.is_empty());
        assert_eq!(TableBoundary::whole_table(&conn, "t").unwrap(), b);
    }

    #[test]
    fn test_rejects_bad_identifier() {
        let conn = table(&[]);
        assert!(TableBoundary::below_height(&conn, "t; DROP TABLE t", 1).is_err());
        assert!(check_identifier("1abc").is_err());
        assert!(check_identifier("public_key").is_ok());
    }
}
