//! Durable key-record store.
//!
//! Records are byte images ending in a `{magic, crc32}` tail. The store
//! reconciles an in-memory image with its persisted copy, writing only when
//! the content changed.

mod record;
mod storage;
mod store;

#[cfg(feature = "esp32")]
mod esp;
mod file;

pub use record::{NvmRecord, Record};
pub use storage::{MemStorage, Storage, StorageError};
pub use store::{NvmAction, NvmError, NvmStore, NVM_MAGIC, TAIL_LEN};

#[cfg(feature = "esp32")]
pub use esp::EspStorage;
pub use file::FileStorage;
