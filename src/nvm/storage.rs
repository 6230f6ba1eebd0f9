//! Opaque key/byte-blob storage backends.

use crate::lock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Errors from a storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No blob stored under the key.
    NotFound(String),
    /// Stored blob length differs from the requested length.
    SizeMismatch { expected: usize, actual: usize },
    /// Backend I/O failure.
    Io(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "no record stored under {}", key),
            Self::SizeMismatch { expected, actual } => {
                write!(f, "record size mismatch: expected {} bytes, found {}", expected, actual)
            }
            Self::Io(msg) => write!(f, "storage I/O error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Key/value blob storage.
pub trait Storage: Send {
    fn exists(&self, key: &str) -> bool;

    /// Fill `buf` with the blob stored under `key`. The stored length must
    /// equal `buf.len()`.
    fn load(&self, key: &str, buf: &mut [u8]) -> Result<(), StorageError>;

    fn store(&mut self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    fn clear(&mut self, key: &str) -> Result<(), StorageError>;

    /// Flush pending writes.
    fn sync(&mut self) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
struct MemInner {
    records: HashMap<String, Vec<u8>>,
    writes: usize,
}

/// In-memory storage.
///
/// Clones share the same backing map, so dropping a store and building a new
/// one over a clone behaves like a power cycle.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    inner: Arc<Mutex<MemInner>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `store` calls so far.
    pub fn writes(&self) -> usize {
        lock(&self.inner).writes
    }

    /// Raw copy of a stored blob.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.inner).records.get(key).cloned()
    }

    /// Mutate a stored blob in place, bypassing the write counter.
    pub fn tamper(&self, key: &str, f: impl FnOnce(&mut Vec<u8>)) {
        if let Some(blob) = lock(&self.inner).records.get_mut(key) {
            f(blob);
        }
    }
}

impl Storage for MemStorage {
    fn exists(&self, key: &str) -> bool {
        lock(&self.inner).records.contains_key(key)
    }

    fn load(&self, key: &str, buf: &mut [u8]) -> Result<(), StorageError> {
        let inner = lock(&self.inner);
        let blob = inner
            .records
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        if blob.len() != buf.len() {
            return Err(StorageError::SizeMismatch {
                expected: buf.len(),
                actual: blob.len(),
            });
        }
        buf.copy_from_slice(blob);
        Ok(())
    }

    fn store(&mut self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut inner = lock(&self.inner);
        inner.records.insert(key.to_string(), data.to_vec());
        inner.writes += 1;
        Ok(())
    }

    fn clear(&mut self, key: &str) -> Result<(), StorageError> {
        lock(&self.inner).records.remove(key);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}
