//! Pre-sharding backup of the main database.
//!
//! The database is snapshotted with `VACUUM INTO`, gzipped and moved into
//! place with a rename, so an archive under the final name is always
//! complete.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::Error;

/// File name of the backup taken before creating a shard.
pub fn backup_file_name(db_name: &str, shard_id: u64, height: u64) -> String {
    format!("backup-before-{db_name}-shard-{shard_id:07}-height-{height}.db.gz")
}

/// Snapshot `conn` into `dir/file_name` as a gzip archive.
///
/// Returns the archive path. An existing archive is kept as is.
pub fn backup_database(conn: &Connection, dir: &Path, file_name: &str) -> Result<PathBuf, Error> {
    fs::create_dir_all(dir)?;
    let archive = dir.join(file_name);
    if archive.exists() {
        debug!(path = %archive.display(), "backup already present");
        return Ok(archive);
    }

    let snapshot = dir.join(format!("{file_name}.snapshot"));
    let partial = dir.join(format!("{file_name}.partial"));
    remove_if_exists(&snapshot)?;
    remove_if_exists(&partial)?;

    let snapshot_str = snapshot
        .to_str()
        .ok_or_else(|| Error::InvalidData(format!("non-utf8 path {}", snapshot.display())))?;
    conn.execute("VACUUM INTO ?1", [snapshot_str])?;

    {
        let mut input = BufReader::new(File::open(&snapshot)?);
        let mut encoder = GzEncoder::new(BufWriter::new(File::create(&partial)?), Compression::default());
        io::copy(&mut input, &mut encoder)?;
        let mut out = encoder.finish()?;
        out.flush()?;
        out.get_ref().sync_all()?;
    }
    fs::rename(&partial, &archive)?;
    fs::remove_file(&snapshot)?;

    let size = fs::metadata(&archive)?.len();
    info!(path = %archive.display(), size, "main database backed up");
    Ok(archive)
}

/// Decompress a backup archive into a database file at `dest`.
pub fn restore_backup(archive: &Path, dest: &Path) -> Result<(), Error> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
    let mut out = BufWriter::new(File::create(dest)?);
    io::copy(&mut decoder, &mut out)?;
    out.flush()?;
    info!(archive = %archive.display(), dest = %dest.display(), "backup restored");
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
