//! Persisted WAN settings: region and device class.

use crate::codec::{Reader, Writer};
use crate::lora::Region;
use crate::nvm::Record;
use std::fmt;
use std::str::FromStr;

pub const WAN_SETTINGS_KEY: &str = "lora-wan";

/// LoRaWAN device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DeviceClass {
    #[default]
    A = 0,
    B = 1,
    C = 2,
}

impl DeviceClass {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::A),
            1 => Some(Self::B),
            2 => Some(Self::C),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        };
        write!(f, "class {}", c)
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            other => Err(format!("unknown device class: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WanSettings {
    pub region: Region,
    pub class: DeviceClass,
}

impl Record for WanSettings {
    const KEY: &'static str = WAN_SETTINGS_KEY;
    const SIZE: usize = 4;

    fn encode(&self, out: &mut [u8]) {
        Writer::new(out).u8(self.region as u8).u8(self.class as u8);
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut r = Reader::new(bytes);
        Self {
            region: Region::from_u8(r.u8()).unwrap_or_default(),
            class: DeviceClass::from_u8(r.u8()).unwrap_or_default(),
        }
    }

    fn defaults() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvm::{MemStorage, NvmRecord, NvmStore};

    #[test]
    fn test_class_parsing() {
        assert_eq!("c".parse::<DeviceClass>(), Ok(DeviceClass::C));
        assert!("D".parse::<DeviceClass>().is_err());
        assert_eq!(DeviceClass::B.to_string(), "class B");
    }

    #[test]
    fn test_settings_persist() {
        let storage = MemStorage::new();
        let store = NvmStore::new(Box::new(storage.clone()));
        let mut record = NvmRecord::<WanSettings>::load(&store).unwrap();
        record.get_mut().region = Region::Us915;
        record.get_mut().class = DeviceClass::C;
        record.sync(&store).unwrap();

        let store = NvmStore::new(Box::new(storage));
        let reloaded = NvmRecord::<WanSettings>::load(&store).unwrap();
        assert_eq!(reloaded.get().region, Region::Us915);
        assert_eq!(reloaded.get().class, DeviceClass::C);
    }
}
