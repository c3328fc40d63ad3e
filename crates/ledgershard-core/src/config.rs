//! Node and sharding configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Error;
use crate::shard::hash::HashAlgorithm;

/// Default number of rows moved per committed page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Default SQLite busy timeout in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default sharding frequency in blocks.
pub const DEFAULT_SHARDING_FREQUENCY: u64 = 5_000;

/// Default database name, used as the prefix for all database files.
pub const DEFAULT_DB_NAME: &str = "ledgershard";

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_db_name() -> String {
    DEFAULT_DB_NAME.to_string()
}

const fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

const fn default_sharding_frequency() -> u64 {
    DEFAULT_SHARDING_FREQUENCY
}

/// Chain parameters in effect at the current height.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeightConfig {
    /// Whether sharding is enabled at this height.
    #[serde(default)]
    pub sharding_enabled: bool,

    /// Shards are created only at minimum rollback heights that are a
    /// multiple of this value.
    #[serde(default = "default_sharding_frequency")]
    pub sharding_frequency: u64,

    /// Digest used for shard content hashes.
    #[serde(default)]
    pub digest: HashAlgorithm,
}

impl Default for HeightConfig {
    fn default() -> Self {
        Self {
            sharding_enabled: false,
            sharding_frequency: DEFAULT_SHARDING_FREQUENCY,
            digest: HashAlgorithm::default(),
        }
    }
}

impl HeightConfig {
    /// A config with sharding enabled at the given frequency.
    pub fn enabled(sharding_frequency: u64) -> Self {
        Self {
            sharding_enabled: true,
            sharding_frequency,
            ..Default::default()
        }
    }

    /// Set the shard digest.
    pub fn with_digest(mut self, digest: HashAlgorithm) -> Self {
        self.digest = digest;
        self
    }
}

/// Configuration for the main database and the shard migration engine.
#[derive(Debug, Clone, Deserialize)]
pub struct ShardingConfig {
    /// Directory holding the main and shard database files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Prefix for database file names.
    #[serde(default = "default_db_name")]
    pub db_name: String,

    /// Directory for pre-sharding backups. Defaults to `<data_dir>/backup`.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,

    /// Rows per committed page during bulk phases.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Chain parameters for the current height.
    #[serde(default)]
    pub height: HeightConfig,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_name: default_db_name(),
            backup_dir: None,
            page_size: DEFAULT_PAGE_SIZE,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            height: HeightConfig::default(),
        }
    }
}

impl ShardingConfig {
    /// Create a new configuration rooted at the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), Error> {
        if self.page_size == 0 {
            return Err(Error::InvalidData("page_size must be greater than zero".into()));
        }
        if self.db_name.is_empty() {
            return Err(Error::InvalidData("db_name must not be empty".into()));
        }
        Ok(())
    }

    /// Set the database name.
    pub fn with_db_name(mut self, name: impl Into<String>) -> Self {
        self.db_name = name.into();
        self
    }

    /// Set the backup directory.
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    /// Set the page size. Values below one are clamped to one.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Set the chain parameters.
    pub fn with_height_config(mut self, height: HeightConfig) -> Self {
        self.height = height;
        self
    }

    /// Path of the main database file.
    pub fn main_db_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.db", self.db_name))
    }

    /// Path of the database file for a shard.
    pub fn shard_db_path(&self, shard_id: u64) -> PathBuf {
        self.data_dir
            .join(format!("{}-shard-{:07}.db", self.db_name, shard_id))
    }

    /// Directory that receives pre-sharding backups.
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("backup"))
    }
}
