//! Derived tables: versioned, height-indexed snapshots of entity state.
//!
//! Every row carries the height it was written at and a `latest` flag. A new
//! version of an entity clears `latest` on the previous one, so the table can
//! be rolled back to any height above the rollback horizon and trimmed of
//! versions nobody can roll back to anymore.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::schema::IndexDef;
use crate::error::Error;

/// A rollback- and trim-capable table derived from block processing.
pub trait DerivedTable: Send + Sync {
    /// Table name.
    fn name(&self) -> &str;

    /// Remove all versions written above `height` and restore the `latest`
    /// flag on what remains. Returns the number of deleted rows.
    fn rollback(&self, conn: &Connection, height: i64) -> Result<u64, Error>;

    /// Delete versions below `height` that have been superseded at or below
    /// `height`. Returns the number of deleted rows.
    fn trim(&self, conn: &Connection, height: i64) -> Result<u64, Error>;

    /// Delete every row.
    fn truncate(&self, conn: &Connection) -> Result<(), Error>;

    /// Indexes that can be dropped while many rows have their height rewritten.
    fn bulk_update_indexes(&self) -> Vec<IndexDef>;

    /// Exclusive `db_id` bounds and row count of the rows written below `height`.
    fn min_max_db_id(&self, conn: &Connection, height: i64) -> Result<MinMaxDbId, Error> {
        let range = conn.query_row(
            &format!(
                "SELECT IFNULL(MIN(db_id) - 1, 0), IFNULL(MAX(db_id) + 1, 1), COUNT(*) \
                 FROM {} WHERE height < ?1",
                self.name()
            ),
            [height],
            |row| {
                Ok(MinMaxDbId {
                    min: row.get(0)?,
                    max: row.get(1)?,
                    count: row.get::<_, i64>(2)? as u64,
                })
            },
        )?;
        Ok(range)
    }
}

/// Row id range of a derived table below some height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinMaxDbId {
    /// Exclusive lower `db_id` bound.
    pub min: i64,
    /// Exclusive upper `db_id` bound.
    pub max: i64,
    /// Rows inside the range.
    pub count: u64,
}

/// A derived table keyed by one entity column with `height` and `latest`.
#[derive(Debug, Clone)]
pub struct VersionedEntityTable {
    name: String,
    key_column: String,
    value_column: String,
}

impl VersionedEntityTable {
    /// Describe a versioned table.
    pub fn new(
        name: impl Into<String>,
        key_column: impl Into<String>,
        value_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            key_column: key_column.into(),
            value_column: value_column.into(),
        }
    }

    /// The `public_key` table.
    pub fn public_key() -> Self {
        Self::new("public_key", "account_id", "public_key")
    }

    /// The `genesis_public_key` table.
    pub fn genesis_public_key() -> Self {
        Self::new("genesis_public_key", "account_id", "public_key")
    }

    /// Write a new version of an entity at `height`.
    pub fn insert_version(
        &self,
        conn: &Connection,
        key: i64,
        value: Option<&[u8]>,
        height: i64,
    ) -> Result<i64, Error> {
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            &format!(
                "UPDATE {} SET latest = 0 WHERE {} = ?1 AND latest = 1",
                self.name, self.key_column
            ),
            [key],
        )?;
        tx.execute(
            &format!(
                "INSERT INTO {} ({}, {}, height, latest) VALUES (?1, ?2, ?3, 1)",
                self.name, self.key_column, self.value_column
            ),
            params![key, value, height],
        )?;
        let db_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(db_id)
    }

    /// Number of rows, all versions included.
    pub fn count(&self, conn: &Connection) -> Result<u64, Error> {
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.name), [], |row| {
                row.get(0)
            })?;
        Ok(count as u64)
    }

    /// Number of rows written below `height`.
    pub fn count_below(&self, conn: &Connection, height: i64) -> Result<u64, Error> {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE height < ?1", self.name),
            [height],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Height of the latest version of an entity.
    pub fn latest_height(&self, conn: &Connection, key: i64) -> Result<Option<i64>, Error> {
        let height = conn
            .query_row(
                &format!(
                    "SELECT height FROM {} WHERE {} = ?1 AND latest = 1",
                    self.name, self.key_column
                ),
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(height)
    }
}

impl DerivedTable for VersionedEntityTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn rollback(&self, conn: &Connection, height: i64) -> Result<u64, Error> {
        let tx = conn.unchecked_transaction()?;
        let deleted = tx.execute(
            &format!("DELETE FROM {} WHERE height > ?1", self.name),
            [height],
        )?;
        tx.execute(
            &format!(
                "UPDATE {t} SET latest = 1 WHERE latest = 0 AND db_id IN \
                 (SELECT MAX(db_id) FROM {t} GROUP BY {k})",
                t = self.name,
                k = self.key_column
            ),
            [],
        )?;
        tx.commit()?;
        debug!(table = %self.name, height, deleted, "derived table rolled back");
        Ok(deleted as u64)
    }

    fn trim(&self, conn: &Connection, height: i64) -> Result<u64, Error> {
        let deleted = conn.execute(
            &format!(
                "DELETE FROM {t} WHERE height < ?1 AND latest = 0 AND EXISTS \
                 (SELECT 1 FROM {t} newer WHERE newer.{k} = {t}.{k} \
                  AND newer.height > {t}.height AND newer.height <= ?1)",
                t = self.name,
                k = self.key_column
            ),
            [height],
        )?;
        debug!(table = %self.name, height, deleted, "derived table trimmed");
        Ok(deleted as u64)
    }

    fn truncate(&self, conn: &Connection) -> Result<(), Error> {
        conn.execute(&format!("DELETE FROM {}", self.name), [])?;
        Ok(())
    }

    fn bulk_update_indexes(&self) -> Vec<IndexDef> {
        let name = format!("{}_height_idx", self.name);
        let create_sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (height)",
            name, self.name
        );
        vec![IndexDef::new(name, create_sql)]
    }
}

/// The set of derived tables the node maintains.
#[derive(Clone, Default)]
pub struct DerivedTablesRegistry {
    tables: Vec<Arc<dyn DerivedTable>>,
}

impl DerivedTablesRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the node's standard derived tables.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(VersionedEntityTable::public_key()));
        registry.register(Arc::new(VersionedEntityTable::genesis_public_key()));
        registry
    }

    /// Add a table. A table registered twice under one name replaces the first.
    pub fn register(&mut self, table: Arc<dyn DerivedTable>) {
        self.tables.retain(|t| t.name() != table.name());
        self.tables.push(table);
    }

    /// Look up a table by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn DerivedTable>> {
        self.tables.iter().find(|t| t.name() == name).cloned()
    }

    /// Registered tables in registration order.
    pub fn tables(&self) -> &[Arc<dyn DerivedTable>] {
        &self.tables
    }

    /// Table names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name().to_string()).collect()
    }

    /// Roll every table back to `height`.
    pub fn rollback_all(&self, conn: &Connection, height: i64) -> Result<u64, Error> {
        let mut deleted = 0;
        for table in &self.tables {
            deleted += table.rollback(conn, height)?;
        }
        Ok(deleted)
    }

    /// Trim every table at `height`.
    pub fn trim_all(&self, conn: &Connection, height: i64) -> Result<u64, Error> {
        let mut deleted = 0;
        for table in &self.tables {
            deleted += table.trim(conn, height)?;
        }
        Ok(deleted)
    }
}

impl std::fmt::Debug for DerivedTablesRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedTablesRegistry")
            .field("tables", &self.names())
            .finish()
    }
}
