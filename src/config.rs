//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all)
//! yields a working stack.
//!
//! # Example
//!
//! ```
//! use lora_core::LoraConfig;
//!
//! let config: LoraConfig = serde_json::from_str(r#"{ "order_wait_ms": 250 }"#).unwrap();
//! assert_eq!(config.order_wait_ms, 250);
//! assert_eq!(config.tx_arena_bytes, 6144);
//! config.validate().unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables for one stack instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    /// Raw-mode order slots.
    pub order_pool_size: usize,
    /// How long a request may wait for a free order slot.
    pub order_wait_ms: u64,
    /// Rendezvous primitives shared by both modes.
    pub sync_pool_size: usize,
    /// WAN outgoing message arena.
    pub tx_arena_bytes: usize,
    /// WAN incoming and indication arena.
    pub rx_arena_bytes: usize,
    /// Arena allocation granule.
    pub arena_unit_bytes: usize,
    /// Open application ports before a warning is logged.
    pub max_app_ports: usize,
    /// Default application duty-cycle period.
    pub duty_cycle_ms: u64,
    /// Record storage directory on host builds (`~/.lora-core` if unset).
    pub storage_dir: Option<PathBuf>,
    /// HTTP stats port.
    pub stats_port: u16,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            order_pool_size: crate::raw::MAX_ORDERS,
            order_wait_ms: 1000,
            sync_pool_size: crate::sync_pool::SYNC_POOL_SIZE,
            tx_arena_bytes: 6 * 1024,
            rx_arena_bytes: 2 * 1024,
            arena_unit_bytes: 32,
            max_app_ports: 10,
            duty_cycle_ms: 30_000,
            storage_dir: None,
            stats_port: 8080,
        }
    }
}

impl LoraConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
        config.validate()?;
        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("order_pool_size", self.order_pool_size),
            ("tx_arena_bytes", self.tx_arena_bytes),
            ("rx_arena_bytes", self.rx_arena_bytes),
            ("arena_unit_bytes", self.arena_unit_bytes),
            ("max_app_ports", self.max_app_ports),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.sync_pool_size < 2 || self.sync_pool_size > u8::MAX as usize {
            return Err(ConfigError::OutOfRange {
                field: "sync_pool_size",
                value: self.sync_pool_size,
            });
        }
        let smallest_arena = self.tx_arena_bytes.min(self.rx_arena_bytes);
        if self.arena_unit_bytes > smallest_arena {
            return Err(ConfigError::OutOfRange {
                field: "arena_unit_bytes",
                value: self.arena_unit_bytes,
            });
        }
        Ok(())
    }

    pub fn order_wait(&self) -> Duration {
        Duration::from_millis(self.order_wait_ms)
    }

    pub fn duty_cycle(&self) -> Duration {
        Duration::from_millis(self.duty_cycle_ms)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io(String),
    InvalidFormat(String),
    /// Field must be non-zero.
    Zero(&'static str),
    OutOfRange { field: &'static str, value: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "cannot read config: {}", msg),
            Self::InvalidFormat(msg) => write!(f, "invalid config: {}", msg),
            Self::Zero(field) => write!(f, "{} must not be zero", field),
            Self::OutOfRange { field, value } => write!(f, "{} out of range: {}", field, value),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LoraConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.order_pool_size, 10);
        assert_eq!(config.sync_pool_size, 10);
        assert_eq!(config.rx_arena_bytes, 2048);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: LoraConfig = serde_json::from_str(r#"{"max_app_ports": 4}"#).unwrap();
        assert_eq!(config.max_app_ports, 4);
        assert_eq!(config.arena_unit_bytes, 32);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = LoraConfig {
            order_pool_size: 0,
            ..LoraConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("order_pool_size")));

        let config = LoraConfig {
            arena_unit_bytes: 4096,
            ..LoraConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "arena_unit_bytes", .. })
        ));

        let config = LoraConfig {
            sync_pool_size: 1,
            ..LoraConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("lora-core-config-{}.json", std::process::id()));
        fs::write(&path, r#"{"stats_port": 9000, "duty_cycle_ms": 5000}"#).unwrap();
        let config = LoraConfig::load(&path).unwrap();
        assert_eq!(config.stats_port, 9000);
        assert_eq!(config.duty_cycle(), Duration::from_secs(5));
        fs::remove_file(&path).unwrap();

        assert!(matches!(
            LoraConfig::load(Path::new("/nonexistent/lora.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
