//! ESP32 NVS-backed storage.
//!
//! Records are raw blobs in the `lora` namespace. Keys must stay within the
//! NVS 15-character limit.

use super::storage::{Storage, StorageError};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_sys::EspError;
use log::{debug, info};

/// NVS namespace for LoRa records.
const NVS_NAMESPACE: &str = "lora";

pub struct EspStorage {
    nvs: EspNvs<NvsDefault>,
}

impl EspStorage {
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self, EspError> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        info!("Record storage in NVS namespace {}", NVS_NAMESPACE);
        Ok(Self { nvs })
    }
}

fn io(e: EspError) -> StorageError {
    StorageError::Io(format!("{:?}", e))
}

impl Storage for EspStorage {
    fn exists(&self, key: &str) -> bool {
        self.nvs.contains(key).unwrap_or(false)
    }

    fn load(&self, key: &str, buf: &mut [u8]) -> Result<(), StorageError> {
        let expected = buf.len();
        let mut scratch = vec![0u8; expected + 1];
        let bytes = self
            .nvs
            .get_raw(key, &mut scratch)
            .map_err(io)?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        if bytes.len() != expected {
            return Err(StorageError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        buf.copy_from_slice(bytes);
        Ok(())
    }

    fn store(&mut self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.nvs.set_raw(key, data).map_err(io)?;

        // Read back to catch silent flash write failures
        let mut verify = vec![0u8; data.len()];
        self.load(key, &mut verify)?;
        if verify != data {
            return Err(StorageError::Io(format!("verification failed for {}", key)));
        }
        debug!("Stored {} ({} bytes) in NVS", key, data.len());
        Ok(())
    }

    fn clear(&mut self, key: &str) -> Result<(), StorageError> {
        self.nvs.remove(key).map_err(io)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        // set_raw commits on every write
        Ok(())
    }
}
