//! Shard content hashing.
//!
//! The hash covers the shard's canonical row ordering: blocks by height, then
//! transactions by `db_id`. Every column value is fed to the digest with a
//! type tag and, for variable-length values, a length prefix, so two shards
//! hash equal exactly when their rows are equal.

use std::fmt;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tracing::debug;

use crate::error::Error;
use crate::storage::chain::{BLOCK_COLUMNS, TRANSACTION_COLUMNS};
use crate::storage::schema::{BLOCK_TABLE, TRANSACTION_TABLE};

/// Digest used for shard content hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256.
    Sha256,
    /// SHA-512.
    #[default]
    Sha512,
    /// BLAKE3.
    Blake3,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
            HashAlgorithm::Blake3 => 32,
        }
    }

    fn hasher(&self) -> ShardHasher {
        match self {
            HashAlgorithm::Sha256 => ShardHasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => ShardHasher::Sha512(Sha512::new()),
            HashAlgorithm::Blake3 => ShardHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => write!(f, "sha256"),
            HashAlgorithm::Sha512 => write!(f, "sha512"),
            HashAlgorithm::Blake3 => write!(f, "blake3"),
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => Err(Error::InvalidData(format!("unknown hash algorithm: {other}"))),
        }
    }
}

enum ShardHasher {
    Sha256(Sha256),
    Sha512(Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl ShardHasher {
    fn update(&mut self, bytes: &[u8]) {
        match self {
            ShardHasher::Sha256(h) => h.update(bytes),
            ShardHasher::Sha512(h) => h.update(bytes),
            ShardHasher::Blake3(h) => {
                h.update(bytes);
            }
        }
    }

    fn update_value(&mut self, value: ValueRef<'_>) {
        match value {
            ValueRef::Null => self.update(&[0]),
            ValueRef::Integer(i) => {
                self.update(&[1]);
                self.update(&i.to_le_bytes());
            }
            ValueRef::Real(f) => {
                self.update(&[2]);
                self.update(&f.to_bits().to_le_bytes());
            }
            ValueRef::Text(t) => {
                self.update(&[3]);
                self.update(&(t.len() as u64).to_le_bytes());
                self.update(t);
            }
            ValueRef::Blob(b) => {
                self.update(&[4]);
                self.update(&(b.len() as u64).to_le_bytes());
                self.update(b);
            }
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            ShardHasher::Sha256(h) => h.finalize().to_vec(),
            ShardHasher::Sha512(h) => h.finalize().to_vec(),
            ShardHasher::Blake3(h) => h.finalize().as_bytes().to_vec(),
        }
    }
}

/// Computes the content hash of a shard database.
pub struct ShardHashCalculator<'a> {
    shard: &'a Connection,
    algorithm: HashAlgorithm,
}

impl<'a> ShardHashCalculator<'a> {
    /// Create a calculator over an open shard connection.
    pub fn new(shard: &'a Connection, algorithm: HashAlgorithm) -> Self {
        Self { shard, algorithm }
    }

    /// Hash every block and transaction in the shard.
    pub fn calculate(&self) -> Result<Vec<u8>, Error> {
        let mut hasher = self.algorithm.hasher();

        let blocks = self.feed(
            &mut hasher,
            BLOCK_TABLE,
            BLOCK_COLUMNS,
            "height",
        )?;
        let transactions = self.feed(
            &mut hasher,
            TRANSACTION_TABLE,
            TRANSACTION_COLUMNS,
            "db_id",
        )?;

        let digest = hasher.finalize();
        debug!(
            algorithm = %self.algorithm,
            blocks,
            transactions,
            hash = %hex::encode(&digest),
            "shard hash calculated"
        );
        Ok(digest)
    }

    fn feed(
        &self,
        hasher: &mut ShardHasher,
        table: &str,
        columns: &[&str],
        order_by: &str,
    ) -> Result<u64, Error> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            columns.join(", "),
            table,
            order_by
        );
        let mut stmt = self.shard.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut count = 0u64;
        while let Some(row) = rows.next()? {
            for i in 0..columns.len() {
                hasher.update_value(row.get_ref(i)?);
            }
            count += 1;
        }
        Ok(count)
    }
}
