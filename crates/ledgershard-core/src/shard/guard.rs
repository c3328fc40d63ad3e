//! Scoped drop-and-restore of indexes and foreign keys around bulk writes.

use rusqlite::Connection;
use tracing::{debug, error};

use crate::error::Error;
use crate::storage::schema::IndexDef;

/// Drops indexes (and optionally foreign key enforcement) on acquire and
/// restores them when released or dropped.
///
/// Call [`release`](Self::release) on the success path to see restore errors;
/// on early returns the `Drop` impl restores and logs instead.
pub struct ConstraintGuard<'a> {
    conn: &'a Connection,
    indexes: Vec<IndexDef>,
    foreign_keys_off: bool,
    released: bool,
}

impl<'a> ConstraintGuard<'a> {
    /// A guard that changes nothing.
    pub fn none(conn: &'a Connection) -> Self {
        Self {
            conn,
            indexes: Vec::new(),
            foreign_keys_off: false,
            released: false,
        }
    }

    /// Drop `indexes` and, when `disable_foreign_keys` is set, turn off
    /// foreign key enforcement on `conn`.
    ///
    /// Must be called outside a transaction: SQLite ignores the
    /// `foreign_keys` pragma inside one.
    pub fn acquire(
        conn: &'a Connection,
        indexes: Vec<IndexDef>,
        disable_foreign_keys: bool,
    ) -> Result<Self, Error> {
        let mut guard = Self::none(conn);
        if disable_foreign_keys {
            conn.execute_batch("PRAGMA foreign_keys = OFF")?;
            guard.foreign_keys_off = true;
        }
        for index in indexes {
            conn.execute_batch(&index.drop_sql())?;
            debug!(index = %index.name, "index dropped");
            guard.indexes.push(index);
        }
        Ok(guard)
    }

    /// Restore everything this guard removed.
    pub fn release(mut self) -> Result<(), Error> {
        self.released = true;
        self.restore()
    }

    fn restore(&self) -> Result<(), Error> {
        let mut first_err = None;
        for index in &self.indexes {
            match self.conn.execute_batch(&index.create_sql) {
                Ok(()) => debug!(index = %index.name, "index restored"),
                Err(e) => {
                    first_err.get_or_insert(Error::from(e));
                }
            }
        }
        if self.foreign_keys_off {
            if let Err(e) = self.conn.execute_batch("PRAGMA foreign_keys = ON") {
                first_err.get_or_insert(Error::from(e));
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ConstraintGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.restore() {
            error!(error = %e, "failed to restore constraints");
        }
    }
}
