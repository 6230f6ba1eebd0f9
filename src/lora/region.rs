//! LoRa regional channel plans.
//!
//! Only the pieces the radio layer needs: default channel, legal band and
//! maximum EIRP. Full channel plans belong to the MAC stack.

use std::fmt;
use std::str::FromStr;

/// Regulatory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Region {
    As923 = 0,
    Au915 = 1,
    Cn470 = 2,
    Cn779 = 3,
    Eu433 = 4,
    Eu868 = 5,
    Kr920 = 6,
    In865 = 7,
    Us915 = 8,
    Ru864 = 9,
}

impl Region {
    /// Every supported region.
    pub const ALL: [Region; 10] = [
        Self::As923,
        Self::Au915,
        Self::Cn470,
        Self::Cn779,
        Self::Eu433,
        Self::Eu868,
        Self::Kr920,
        Self::In865,
        Self::Us915,
        Self::Ru864,
    ];

    /// Default raw-mode channel in Hz.
    pub fn frequency(self) -> u32 {
        match self {
            Self::As923 => 923_000_000,
            Self::Au915 => 915_000_000,
            Self::Cn470 => 470_000_000,
            Self::Cn779 => 779_000_000,
            Self::Eu433 => 433_000_000,
            Self::Eu868 => 868_000_000,
            Self::Kr920 => 920_000_000,
            Self::In865 => 865_000_000,
            Self::Us915 => 915_000_000,
            Self::Ru864 => 864_000_000,
        }
    }

    /// Legal band edges in Hz, inclusive.
    pub fn band(self) -> (u32, u32) {
        match self {
            Self::As923 => (915_000_000, 928_000_000),
            Self::Au915 => (915_000_000, 928_000_000),
            Self::Cn470 => (470_000_000, 510_000_000),
            Self::Cn779 => (779_000_000, 787_000_000),
            Self::Eu433 => (433_000_000, 434_790_000),
            Self::Eu868 => (863_000_000, 870_000_000),
            Self::Kr920 => (920_900_000, 923_300_000),
            Self::In865 => (865_000_000, 867_000_000),
            Self::Us915 => (902_000_000, 928_000_000),
            Self::Ru864 => (864_000_000, 870_000_000),
        }
    }

    /// Maximum EIRP in dBm.
    pub fn max_eirp(self) -> f32 {
        match self {
            Self::As923 => 16.0,
            Self::Au915 => 30.0,
            Self::Cn470 => 19.15,
            Self::Cn779 => 12.15,
            Self::Eu433 => 12.15,
            Self::Eu868 => 16.0,
            Self::Kr920 => 14.0,
            Self::In865 => 30.0,
            // Antenna gain is already folded into the US915 figure
            Self::Us915 => 30.0 - 2.15,
            Self::Ru864 => 16.0,
        }
    }

    pub fn contains(self, freq_hz: u32) -> bool {
        let (low, high) = self.band();
        (low..=high).contains(&freq_hz)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::As923 => "AS923",
            Self::Au915 => "AU915",
            Self::Cn470 => "CN470",
            Self::Cn779 => "CN779",
            Self::Eu433 => "EU433",
            Self::Eu868 => "EU868",
            Self::Kr920 => "KR920",
            Self::In865 => "IN865",
            Self::Us915 => "US915",
            Self::Ru864 => "RU864",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

impl Default for Region {
    fn default() -> Self {
        #[cfg(feature = "region-us915")]
        return Self::Us915;
        #[cfg(feature = "region-au915")]
        return Self::Au915;
        #[cfg(feature = "region-as923")]
        return Self::As923;
        #[cfg(not(any(
            feature = "region-us915",
            feature = "region-au915",
            feature = "region-as923"
        )))]
        Self::Eu868
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown region: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_frequency_inside_band() {
        for region in Region::ALL {
            assert!(region.contains(region.frequency()), "{}", region);
        }
    }

    #[test]
    fn test_region_frequencies() {
        assert_eq!(Region::Eu868.frequency(), 868_000_000);
        assert_eq!(Region::Us915.frequency(), 915_000_000);
        assert_eq!(Region::Cn470.frequency(), 470_000_000);
        assert_eq!(Region::Ru864.frequency(), 864_000_000);
    }

    #[test]
    fn test_u8_roundtrip_and_bounds() {
        for region in Region::ALL {
            assert_eq!(Region::from_u8(region as u8), Some(region));
        }
        assert_eq!(Region::from_u8(10), None);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("eu868".parse::<Region>(), Ok(Region::Eu868));
        assert_eq!("KR920".parse::<Region>(), Ok(Region::Kr920));
        assert!("XX000".parse::<Region>().is_err());
    }

    #[test]
    fn test_default_region() {
        assert_eq!(Region::default(), Region::Eu868);
    }
}
