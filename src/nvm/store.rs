use super::storage::{Storage, StorageError};
use crate::lock;
use log::{debug, info, warn};
use std::fmt;
use std::sync::Mutex;

/// Integrity magic stamped at the start of every record tail.
pub const NVM_MAGIC: u32 = 0xA5A5_B5B5;

/// Tail length: magic then crc32, both little-endian.
pub const TAIL_LEN: usize = 8;

/// What [`NvmStore::handle_change`] did with the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmAction {
    /// Record was absent or corrupt; defaults were written.
    Init,
    /// In-memory image was replaced by the persisted copy.
    LoadSuccess,
    /// Content changed and was written through.
    Updated,
    /// Content unchanged; nothing written.
    Unchanged,
}

/// Record store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NvmError {
    Storage(StorageError),
}

impl fmt::Display for NvmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "record store: {}", e),
        }
    }
}

impl std::error::Error for NvmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
        }
    }
}

impl From<StorageError> for NvmError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Store that reconciles record images with a [`Storage`] backend.
pub struct NvmStore {
    storage: Mutex<Box<dyn Storage>>,
}

impl NvmStore {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Self {
            storage: Mutex::new(storage),
        }
    }

    /// Reconcile `mem` with the record persisted under `key`.
    ///
    /// `mem` is the full image including its trailing [`TAIL_LEN`] bytes.
    /// `defaults` fills the content part (everything before the tail) when the
    /// record has to be initialised.
    ///
    /// # Panics
    ///
    /// Panics if `mem` is shorter than the tail.
    pub fn handle_change(
        &self,
        key: &str,
        mem: &mut [u8],
        defaults: impl FnOnce(&mut [u8]),
    ) -> Result<NvmAction, NvmError> {
        assert!(
            mem.len() >= TAIL_LEN,
            "record {} smaller than its integrity tail",
            key
        );
        let mut storage = lock(&self.storage);

        if !storage.exists(key) {
            info!("nvm {}: no record, writing defaults", key);
            return init(&mut **storage, key, mem, defaults);
        }

        if magic(mem) != NVM_MAGIC {
            if let Err(e) = storage.load(key, mem) {
                warn!("nvm {}: load failed ({}), writing defaults", key, e);
                return init(&mut **storage, key, mem, defaults);
            }
            if magic(mem) != NVM_MAGIC {
                warn!("nvm {}: bad magic {:#010x}, writing defaults", key, magic(mem));
                return init(&mut **storage, key, mem, defaults);
            }
            if stored_crc(mem) != checksum(mem) {
                warn!("nvm {}: checksum mismatch, writing defaults", key);
                return init(&mut **storage, key, mem, defaults);
            }
            info!("nvm {}: load-success", key);
            return Ok(NvmAction::LoadSuccess);
        }

        let crc = checksum(mem);
        if crc == stored_crc(mem) {
            debug!("nvm {}: unchanged", key);
            return Ok(NvmAction::Unchanged);
        }
        set_crc(mem, crc);
        storage.store(key, mem)?;
        storage.sync()?;
        info!("nvm {}: updated (crc {:#010x})", key, crc);
        Ok(NvmAction::Updated)
    }

    /// Remove a persisted record.
    pub fn clear(&self, key: &str) -> Result<(), NvmError> {
        let mut storage = lock(&self.storage);
        storage.clear(key)?;
        storage.sync()?;
        info!("nvm {}: cleared", key);
        Ok(())
    }
}

fn init(
    storage: &mut dyn Storage,
    key: &str,
    mem: &mut [u8],
    defaults: impl FnOnce(&mut [u8]),
) -> Result<NvmAction, NvmError> {
    let content_len = mem.len() - TAIL_LEN;
    mem[content_len..content_len + 4].copy_from_slice(&NVM_MAGIC.to_le_bytes());
    defaults(&mut mem[..content_len]);
    let crc = checksum(mem);
    set_crc(mem, crc);
    storage.store(key, mem)?;
    storage.sync()?;
    Ok(NvmAction::Init)
}

fn magic(mem: &[u8]) -> u32 {
    let at = mem.len() - TAIL_LEN;
    u32::from_le_bytes([mem[at], mem[at + 1], mem[at + 2], mem[at + 3]])
}

fn stored_crc(mem: &[u8]) -> u32 {
    let at = mem.len() - 4;
    u32::from_le_bytes([mem[at], mem[at + 1], mem[at + 2], mem[at + 3]])
}

fn set_crc(mem: &mut [u8], crc: u32) {
    let at = mem.len() - 4;
    mem[at..].copy_from_slice(&crc.to_le_bytes());
}

/// CRC-32 over everything before the checksum field, magic included.
fn checksum(mem: &[u8]) -> u32 {
    crc32fast::hash(&mem[..mem.len() - 4])
}
