//! Environment directory layout and locking.
//!
//! A persistent environment lives in one directory:
//!
//! ```text
//! <location>/
//! ├─ LOCK               # advisory lock, one process at a time
//! ├─ stratum.data       # the append-only log
//! └─ exodus.properties  # optional per-location settings overlay
//! ```

use crate::config::PROPERTIES_FILE;
use crate::error::{EnvError, EnvResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const DATA_FILE: &str = "stratum.data";

/// An exclusively locked environment directory.
#[derive(Debug)]
pub(crate) struct EnvironmentLocation {
    path: PathBuf,
    _lock_file: File,
}

impl EnvironmentLocation {
    /// Opens (creating if needed) and locks the directory at `path`.
    pub fn open(path: &Path) -> EnvResult<Self> {
        std::fs::create_dir_all(path).map_err(io_err)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))
            .map_err(io_err)?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| EnvError::Locked)?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// The environment directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the log's data file.
    pub fn data_path(&self) -> PathBuf {
        self.path.join(DATA_FILE)
    }

    /// Path of the optional settings overlay.
    pub fn properties_path(&self) -> PathBuf {
        self.path.join(PROPERTIES_FILE)
    }
}

fn io_err(err: std::io::Error) -> EnvError {
    EnvError::Log(stratum_log::LogError::Io(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_directory_and_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env");
        let location = EnvironmentLocation::open(&path).unwrap();

        assert!(path.join(LOCK_FILE).is_file());
        assert_eq!(location.data_path(), path.join(DATA_FILE));
    }

    #[test]
    fn second_opener_is_rejected() {
        let dir = tempdir().unwrap();
        let _held = EnvironmentLocation::open(dir.path()).unwrap();
        assert!(matches!(
            EnvironmentLocation::open(dir.path()),
            Err(EnvError::Locked)
        ));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempdir().unwrap();
        drop(EnvironmentLocation::open(dir.path()).unwrap());
        assert!(EnvironmentLocation::open(dir.path()).is_ok());
    }
}
