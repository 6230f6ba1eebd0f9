//! Device commissioning credentials.
//!
//! Key material is wiped from memory when a credential set is dropped or
//! replaced. `Debug` output never contains keys.

use crate::codec::{Reader, Writer};
use crate::nvm::Record;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const COMMISSION_KEY: &str = "lora-commission";

/// LoRaWAN revision the credentials are meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LoraWanVersion {
    #[default]
    V1_0 = 0,
    V1_1 = 1,
}

/// Over-the-air activation keys.
#[derive(Clone, PartialEq, Eq, Default, Zeroize, ZeroizeOnDrop)]
pub struct OtaaKeys {
    pub dev_eui: [u8; 8],
    pub join_eui: [u8; 8],
    pub app_key: [u8; 16],
    /// Only distinct from `app_key` for 1.1.x.
    pub nwk_key: [u8; 16],
}

/// Activation-by-personalisation session.
#[derive(Clone, PartialEq, Eq, Default, Zeroize, ZeroizeOnDrop)]
pub struct AbpKeys {
    pub dev_addr: u32,
    pub dev_eui: [u8; 8],
    pub app_s_key: [u8; 16],
    pub nwk_s_key: [u8; 16],
}

#[derive(Clone, PartialEq, Eq)]
pub enum Activation {
    Otaa(OtaaKeys),
    Abp(AbpKeys),
}

#[derive(Clone, PartialEq, Eq)]
pub struct Commission {
    pub version: LoraWanVersion,
    pub activation: Activation,
}

impl Commission {
    pub fn otaa(version: LoraWanVersion, dev_eui: [u8; 8], join_eui: [u8; 8], app_key: [u8; 16], nwk_key: [u8; 16]) -> Self {
        let nwk_key = match version {
            LoraWanVersion::V1_0 => app_key,
            LoraWanVersion::V1_1 => nwk_key,
        };
        Self {
            version,
            activation: Activation::Otaa(OtaaKeys {
                dev_eui,
                join_eui,
                app_key,
                nwk_key,
            }),
        }
    }

    pub fn abp(version: LoraWanVersion, dev_addr: u32, dev_eui: [u8; 8], app_s_key: [u8; 16], nwk_s_key: [u8; 16]) -> Self {
        Self {
            version,
            activation: Activation::Abp(AbpKeys {
                dev_addr,
                dev_eui,
                app_s_key,
                nwk_s_key,
            }),
        }
    }

    /// ABP devices hold a session already and count as joined.
    pub fn is_abp(&self) -> bool {
        matches!(self.activation, Activation::Abp(_))
    }

    pub fn dev_eui(&self) -> [u8; 8] {
        match &self.activation {
            Activation::Otaa(k) => k.dev_eui,
            Activation::Abp(k) => k.dev_eui,
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl fmt::Debug for Commission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Commission");
        d.field("version", &self.version);
        match &self.activation {
            Activation::Otaa(k) => d
                .field("activation", &"otaa")
                .field("dev_eui", &hex(&k.dev_eui))
                .field("join_eui", &hex(&k.join_eui)),
            Activation::Abp(k) => d
                .field("activation", &"abp")
                .field("dev_addr", &format_args!("{:08x}", k.dev_addr))
                .field("dev_eui", &hex(&k.dev_eui)),
        };
        d.finish_non_exhaustive()
    }
}

const KIND_OTAA: u8 = 0;
const KIND_ABP: u8 = 1;

impl Record for Commission {
    const KEY: &'static str = COMMISSION_KEY;
    const SIZE: usize = 52;

    fn encode(&self, out: &mut [u8]) {
        let mut w = Writer::new(out);
        w.u8(self.version as u8);
        match &self.activation {
            Activation::Otaa(k) => {
                w.u8(KIND_OTAA)
                    .bytes(&k.dev_eui)
                    .bytes(&k.join_eui)
                    .bytes(&k.app_key)
                    .bytes(&k.nwk_key);
            }
            Activation::Abp(k) => {
                w.u8(KIND_ABP)
                    .u32(k.dev_addr)
                    .bytes(&k.dev_eui)
                    .bytes(&k.app_s_key)
                    .bytes(&k.nwk_s_key);
            }
        }
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut r = Reader::new(bytes);
        let version = match r.u8() {
            1 => LoraWanVersion::V1_1,
            _ => LoraWanVersion::V1_0,
        };
        let activation = match r.u8() {
            KIND_ABP => Activation::Abp(AbpKeys {
                dev_addr: r.u32(),
                dev_eui: r.array(),
                app_s_key: r.array(),
                nwk_s_key: r.array(),
            }),
            _ => Activation::Otaa(OtaaKeys {
                dev_eui: r.array(),
                join_eui: r.array(),
                app_key: r.array(),
                nwk_key: r.array(),
            }),
        };
        Self { version, activation }
    }

    fn defaults() -> Self {
        Self {
            version: LoraWanVersion::default(),
            activation: Activation::Otaa(OtaaKeys::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvm::{MemStorage, NvmRecord, NvmStore};

    #[test]
    fn test_v1_0_uses_app_key_for_network() {
        let c = Commission::otaa(LoraWanVersion::V1_0, [1; 8], [2; 8], [3; 16], [4; 16]);
        match &c.activation {
            Activation::Otaa(k) => assert_eq!(k.nwk_key, [3; 16]),
            Activation::Abp(_) => panic!("expected otaa"),
        }
        let c = Commission::otaa(LoraWanVersion::V1_1, [1; 8], [2; 8], [3; 16], [4; 16]);
        match &c.activation {
            Activation::Otaa(k) => assert_eq!(k.nwk_key, [4; 16]),
            Activation::Abp(_) => panic!("expected otaa"),
        }
    }

    #[test]
    fn test_debug_hides_keys() {
        let c = Commission::abp(LoraWanVersion::V1_0, 0x2601_1234, [0xab; 8], [0x55; 16], [0x66; 16]);
        let text = format!("{:?}", c);
        assert!(text.contains("26011234"));
        assert!(text.contains("abababab"));
        assert!(!text.contains("5555"));
        assert!(!text.contains("6666"));
    }

    #[test]
    fn test_zeroize_clears_keys() {
        let mut keys = OtaaKeys {
            dev_eui: [1; 8],
            join_eui: [2; 8],
            app_key: [3; 16],
            nwk_key: [4; 16],
        };
        keys.zeroize();
        assert_eq!(keys.app_key, [0; 16]);
        assert_eq!(keys.nwk_key, [0; 16]);
    }

    #[test]
    fn test_abp_record_survives_restart() {
        let storage = MemStorage::new();
        let store = NvmStore::new(Box::new(storage.clone()));
        let mut record = NvmRecord::<Commission>::load(&store).unwrap();
        assert!(!record.get().is_abp());

        let abp = Commission::abp(LoraWanVersion::V1_1, 7, [9; 8], [1; 16], [2; 16]);
        *record.get_mut() = abp.clone();
        record.sync(&store).unwrap();

        let store = NvmStore::new(Box::new(storage));
        let reloaded = NvmRecord::<Commission>::load(&store).unwrap();
        assert_eq!(*reloaded.get(), abp);
        assert_eq!(reloaded.get().dev_eui(), [9; 8]);
    }
}
