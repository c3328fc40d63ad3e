//! CSV export of derived tables.
//!
//! Rows written below a height are read page by page in `db_id` order and
//! written to `<dir>/<table>.csv`. The file is built under a `.partial` name
//! and renamed once complete.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use super::derived::{DerivedTable, DerivedTablesRegistry};
use crate::error::Error;

/// Column left out of every export unless configured otherwise.
pub const DEFAULT_EXCLUDED_COLUMN: &str = "db_id";

/// Counters for one exported table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportStats {
    /// Table name.
    pub table: String,
    /// Rows written to the file.
    pub rows: u64,
    /// Pages read.
    pub pages: u64,
    /// Written file, `None` when the table had nothing below the height.
    pub path: Option<PathBuf>,
}

/// Writes derived tables to CSV files.
#[derive(Debug, Clone)]
pub struct CsvExporter {
    dir: PathBuf,
    page_size: usize,
    excluded: HashSet<String>,
}

impl CsvExporter {
    /// Export into `dir`, reading `page_size` rows at a time.
    pub fn new(dir: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            dir: dir.into(),
            page_size: page_size.max(1),
            excluded: HashSet::from([DEFAULT_EXCLUDED_COLUMN.to_string()]),
        }
    }

    /// Replace the set of columns left out of the files.
    pub fn excluding<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.excluded = columns
            .into_iter()
            .map(|c| c.as_ref().to_ascii_lowercase())
            .collect();
        self
    }

    /// Target directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Export every registered table.
    pub fn export_all(
        &self,
        conn: &Connection,
        registry: &DerivedTablesRegistry,
        height: i64,
    ) -> Result<Vec<ExportStats>, Error> {
        registry
            .tables()
            .iter()
            .map(|table| self.export_table(conn, table.as_ref(), height))
            .collect()
    }

    /// Export the rows of one table written below `height`.
    pub fn export_table(
        &self,
        conn: &Connection,
        table: &dyn DerivedTable,
        height: i64,
    ) -> Result<ExportStats, Error> {
        let name = table.name();
        let range = table.min_max_db_id(conn, height)?;
        let mut stats = ExportStats {
            table: name.to_string(),
            rows: 0,
            pages: 0,
            path: None,
        };
        if range.count == 0 {
            debug!(table = %name, height, "nothing to export");
            return Ok(stats);
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{name}.csv"));
        let partial = self.dir.join(format!("{name}.csv.partial"));

        // db_id is selected again at the end as the page cursor
        let mut stmt = conn.prepare(&format!(
            "SELECT *, db_id FROM {name} WHERE db_id > ?1 AND db_id < ?2 AND height < ?3 \
             ORDER BY db_id LIMIT ?4"
        ))?;
        let cursor = stmt.column_count() - 1;
        let kept: Vec<usize> = (0..cursor)
            .filter(|&i| {
                stmt.column_name(i)
                    .map(|c| !self.excluded.contains(&c.to_ascii_lowercase()))
                    .unwrap_or(false)
            })
            .collect();
        let header = kept
            .iter()
            .map(|&i| stmt.column_name(i).map(str::to_string))
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut writer = csv::Writer::from_path(&partial)?;
        writer.write_record(&header)?;

        let mut lower = range.min;
        loop {
            let page = stmt
                .query_map(
                    params![lower, range.max, height, self.page_size as i64],
                    |row| {
                        (0..=cursor)
                            .map(|i| row.get::<_, Value>(i))
                            .collect::<rusqlite::Result<Vec<Value>>>()
                    },
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let Some(last) = page.last() else {
                break;
            };
            let last_id = match last[cursor] {
                Value::Integer(id) if id > lower => id,
                ref other => {
                    return Err(Error::InvalidData(format!(
                        "{name}: page did not advance past row id {lower}: {other:?}"
                    )))
                }
            };

            for row in &page {
                writer.write_record(kept.iter().map(|&i| field(&row[i])))?;
            }
            stats.pages += 1;
            stats.rows += page.len() as u64;
            lower = last_id;
        }

        let file = writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&partial, &path)?;

        info!(
            table = %name,
            height,
            rows = stats.rows,
            pages = stats.pages,
            path = %path.display(),
            "derived table exported"
        );
        stats.path = Some(path);
        Ok(stats)
    }
}

fn field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(v) => v.to_string(),
        Value::Real(v) => v.to_string(),
        Value::Text(v) => v.clone(),
        Value::Blob(v) => hex::encode(v),
    }
}
