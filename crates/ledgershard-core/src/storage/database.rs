//! Database manager owning the main connection and opening shard databases.

use std::path::Path;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info};

use super::schema::init_main_schema;
use crate::config::ShardingConfig;
use crate::error::Error;

/// Owns the main database connection and knows where shard databases live.
///
/// The main connection is shared behind a mutex; shard connections are opened
/// on demand so that copy phases always read and write through two
/// independent connections.
pub struct DatabaseManager {
    config: ShardingConfig,
    main: Mutex<Connection>,
}

impl DatabaseManager {
    /// Open (or create) the main database described by the configuration.
    pub fn open(config: ShardingConfig) -> Result<Self, Error> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let path = config.main_db_path();
        let conn = open_connection(&path, config.busy_timeout_ms)?;
        init_main_schema(&conn)?;

        info!(path = %path.display(), "main database opened");

        Ok(Self {
            config,
            main: Mutex::new(conn),
        })
    }

    /// The configuration this manager was opened with.
    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    /// Lock the main connection.
    pub fn main(&self) -> MutexGuard<'_, Connection> {
        self.main.lock()
    }

    /// Open a separate connection to the main database.
    ///
    /// Long migration phases run on their own connection so the shared one
    /// stays available to block processing between pages.
    pub fn open_main(&self) -> Result<Connection, Error> {
        open_connection(&self.config.main_db_path(), self.config.busy_timeout_ms)
    }

    /// Open a connection to a shard database, creating the file if needed.
    pub fn open_shard(&self, shard_id: u64) -> Result<Connection, Error> {
        let path = self.config.shard_db_path(shard_id);
        debug!(shard_id, path = %path.display(), "opening shard database");
        open_connection(&path, self.config.busy_timeout_ms)
    }

    /// Open an existing shard database read-only.
    pub fn open_shard_read_only(&self, shard_id: u64) -> Result<Connection, Error> {
        let path = self.config.shard_db_path(shard_id);
        if !path.exists() {
            return Err(Error::NotFound(format!("shard database {}", path.display())));
        }
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        conn.busy_timeout(Duration::from_millis(self.config.busy_timeout_ms))?;
        Ok(conn)
    }

    /// Check whether the database file for a shard exists.
    pub fn shard_exists(&self, shard_id: u64) -> bool {
        self.config.shard_db_path(shard_id).exists()
    }
}

/// Open a read-write connection with the pragmas every node database uses.
fn open_connection(path: &Path, busy_timeout_ms: u64) -> Result<Connection, Error> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}
