//! File-backed storage for host builds.
//!
//! One file per key under a directory, `~/.lora-core/` by default.

use super::storage::{Storage, StorageError};
use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Storage rooted at `dir`, created if missing.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!("Record storage at {:?}", dir);
        Ok(Self { dir })
    }

    /// Returns `~/.lora-core`.
    pub fn default_dir() -> io::Result<PathBuf> {
        let home = std::env::var("HOME")
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
        Ok(PathBuf::from(home).join(".lora-core"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", key))
    }
}

impl Storage for FileStorage {
    fn exists(&self, key: &str) -> bool {
        self.path(key).is_file()
    }

    fn load(&self, key: &str, buf: &mut [u8]) -> Result<(), StorageError> {
        let data = match fs::read(self.path(key)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if data.len() != buf.len() {
            return Err(StorageError::SizeMismatch {
                expected: buf.len(),
                actual: data.len(),
            });
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn store(&mut self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path(key);
        fs::write(&path, data)?;

        // Verify write by reading back
        let read_back = fs::read(&path)?;
        if read_back != data {
            return Err(StorageError::Io(format!(
                "verification failed for {}: wrote {} bytes, read {} bytes",
                key,
                data.len(),
                read_back.len()
            )));
        }
        debug!("Stored {} ({} bytes)", key, data.len());
        Ok(())
    }

    fn clear(&mut self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}
