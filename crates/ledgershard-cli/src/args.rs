//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ledgershard_core::config::DEFAULT_PAGE_SIZE;
use ledgershard_core::{Error, HeightConfig, ShardingConfig};

/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = "./data";

#[derive(Parser, Debug)]
#[command(name = "ledgershard")]
#[command(version, about = "Shard migration operator tool", long_about = None)]
pub struct Args {
    /// Directory holding the main and shard databases.
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// JSON configuration file. Flags override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Database name used as the file prefix.
    #[arg(long)]
    pub db_name: Option<String>,

    /// Rows per committed page.
    #[arg(long)]
    pub page_size: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print completed shards and any interrupted migration as JSON.
    Status,

    /// Archive everything below a height into a new shard, resuming an
    /// interrupted migration first.
    Migrate {
        /// Archive height.
        #[arg(long)]
        height: u64,
    },

    /// Recompute a shard's content hash and compare it with the stored one.
    Verify {
        /// Shard id.
        #[arg(long)]
        shard: u64,
    },

    /// Write the rows of every derived table below a height to CSV files.
    Export {
        /// Export height.
        #[arg(long)]
        height: u64,

        /// Output directory. Defaults to `<data_dir>/export`.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Overwrite the recovery checkpoint.
    Reset {
        /// State to store, e.g. `MAIN_DB_BACKUPED`.
        #[arg(long, default_value = "INIT")]
        state: String,
    },
}

impl Args {
    /// Build the sharding configuration from the file and flags.
    ///
    /// Migrations started from the command line are always allowed, so
    /// sharding is enabled regardless of the file.
    pub fn to_config(&self) -> Result<ShardingConfig, Error> {
        let mut config = match &self.config {
            Some(path) => ShardingConfig::from_json_file(path)?,
            None => ShardingConfig::new(DEFAULT_DATA_DIR),
        };
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(name) = &self.db_name {
            config = config.with_db_name(name.clone());
        }
        if let Some(page_size) = self.page_size {
            config.page_size = page_size;
        }
        if !config.height.sharding_enabled {
            let height = HeightConfig {
                sharding_enabled: true,
                ..config.height.clone()
            };
            config = config.with_height_config(height);
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_migrate() {
        let args = Args::parse_from(["ledgershard", "-d", "/tmp/node", "migrate", "--height", "8000"]);
        assert_eq!(args.command, Command::Migrate { height: 8000 });

        let config = args.to_config().unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/node"));
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert!(config.height.sharding_enabled);
    }

    #[test]
    fn test_reset_defaults_to_init() {
        let args = Args::parse_from(["ledgershard", "reset"]);
        assert_eq!(
            args.command,
            Command::Reset {
                state: "INIT".to_string()
            }
        );
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{"data_dir": "/var/lib/node", "db_name": "mainnet", "page_size": 50}"#,
        )
        .unwrap();

        let args = Args::parse_from([
            "ledgershard",
            "--config",
            path.to_str().unwrap(),
            "--page-size",
            "10",
            "status",
        ]);
        let config = args.to_config().unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/node"));
        assert_eq!(config.db_name, "mainnet");
        assert_eq!(config.page_size, 10);
    }

    #[test]
    fn test_parse_export() {
        let args = Args::parse_from(["ledgershard", "export", "--height", "8000", "-o", "/tmp/csv"]);
        assert_eq!(
            args.command,
            Command::Export {
                height: 8000,
                out: Some(PathBuf::from("/tmp/csv")),
            }
        );

        let args = Args::parse_from(["ledgershard", "export", "--height", "8000"]);
        assert_eq!(args.command, Command::Export { height: 8000, out: None });
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let args = Args::parse_from(["ledgershard", "--page-size", "0", "status"]);
        assert!(args.to_config().is_err());
    }
}
