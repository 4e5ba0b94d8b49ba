//! On-disk layout of a database directory.
//!
//! ```text
//! <db_path>/
//! ├─ LOCK            # advisory lock, one writer process
//! ├─ mutations.log   # durable log frames
//! ├─ log.header      # compaction point, watermark, remote cursor
//! └─ snapshot.cbor   # store state folded in by compaction
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "mutations.log";
const HEADER_FILE: &str = "log.header";
const SNAPSHOT_FILE: &str = "snapshot.cbor";

/// A locked database directory.
///
/// The exclusive lock is held for as long as the value lives.
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens (and optionally creates) the directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseLocked`] if another process holds the
    /// lock, [`CoreError::InvalidFormat`] if the path is missing or not a
    /// directory, or an I/O error.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns `true` if `path` already holds a database log.
    #[must_use]
    pub fn exists(path: &Path) -> bool {
        path.join(LOG_FILE).exists()
    }

    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the durable log.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    /// Path of the log header.
    #[must_use]
    pub fn header_path(&self) -> PathBuf {
        self.path.join(HEADER_FILE)
    }

    /// Path of the compaction snapshot.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_and_locks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");

        let first = DatabaseDir::open(&path, true).unwrap();
        assert!(path.join(LOCK_FILE).exists());
        assert!(matches!(
            DatabaseDir::open(&path, true),
            Err(CoreError::DatabaseLocked)
        ));

        drop(first);
        assert!(DatabaseDir::open(&path, true).is_ok());
    }

    #[test]
    fn missing_without_create_fails() {
        let dir = tempdir().unwrap();
        let result = DatabaseDir::open(&dir.path().join("absent"), false);
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn file_layout() {
        let dir = tempdir().unwrap();
        let db = DatabaseDir::open(dir.path(), true).unwrap();
        assert_eq!(db.log_path(), dir.path().join("mutations.log"));
        assert_eq!(db.header_path(), dir.path().join("log.header"));
        assert_eq!(db.snapshot_path(), dir.path().join("snapshot.cbor"));
        assert!(!DatabaseDir::exists(dir.path()));
    }
}
