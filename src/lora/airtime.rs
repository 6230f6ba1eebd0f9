//! LoRa time-on-air.
//!
//! Semtech formula (SX126x datasheet, section 6.1.4). The raw state machine
//! doubles this to bound the wait between a valid header and rx-done.
//!
//! # Example
//!
//! ```
//! use lora_core::lora::{airtime, Modulation};
//!
//! let m = Modulation::default();
//! let toa = airtime(64, &m);
//! assert!(toa.as_millis() > 100);
//! ```

use std::time::Duration;

/// Channel bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Bandwidth {
    Khz125 = 0,
    Khz250 = 1,
    Khz500 = 2,
}

impl Bandwidth {
    pub fn hz(self) -> u32 {
        match self {
            Self::Khz125 => 125_000,
            Self::Khz250 => 250_000,
            Self::Khz500 => 500_000,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Khz125),
            1 => Some(Self::Khz250),
            2 => Some(Self::Khz500),
            _ => None,
        }
    }
}

/// Forward error correction rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CodingRate {
    Cr4_5 = 1,
    Cr4_6 = 2,
    Cr4_7 = 3,
    Cr4_8 = 4,
}

impl CodingRate {
    /// Denominator of the 4/x rate.
    pub fn denominator(self) -> u8 {
        self as u8 + 4
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Cr4_5),
            2 => Some(Self::Cr4_6),
            3 => Some(Self::Cr4_7),
            4 => Some(Self::Cr4_8),
            _ => None,
        }
    }
}

/// Modulation settings that determine airtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Modulation {
    /// Spreading factor (6-12)
    pub spreading_factor: u8,
    pub bandwidth: Bandwidth,
    pub coding_rate: CodingRate,
    /// Preamble length in symbols
    pub preamble_symbols: u16,
    pub explicit_header: bool,
    pub crc_enabled: bool,
}

impl Default for Modulation {
    fn default() -> Self {
        Self {
            spreading_factor: 7,
            bandwidth: Bandwidth::Khz125,
            coding_rate: CodingRate::Cr4_5,
            preamble_symbols: 8,
            explicit_header: true,
            crc_enabled: true,
        }
    }
}

impl Modulation {
    /// Symbol duration in microseconds.
    pub fn symbol_duration_us(&self) -> u64 {
        (1u64 << self.spreading_factor) * 1_000_000 / self.bandwidth.hz() as u64
    }

    /// Required when a symbol lasts longer than 16 ms (SF11/SF12 at 125 kHz).
    pub fn low_data_rate_optimize(&self) -> bool {
        self.symbol_duration_us() > 16_000
    }
}

/// Packet airtime in microseconds.
pub fn airtime_us(payload_len: usize, m: &Modulation) -> u64 {
    let sf = m.spreading_factor as f64;
    let t_sym_us = (2.0_f64.powf(sf) / m.bandwidth.hz() as f64) * 1_000_000.0;

    let t_preamble_us = (m.preamble_symbols as f64 + 4.25) * t_sym_us;

    let de = if m.low_data_rate_optimize() { 1.0 } else { 0.0 };
    let h = if m.explicit_header { 0.0 } else { 1.0 };
    let crc_bits = if m.crc_enabled { 16.0 } else { 0.0 };

    // 8*PL - 4*SF + 28 + 16*CRC - 20*H over 4*(SF - 2*DE)
    let numerator = 8.0 * payload_len as f64 - 4.0 * sf + 28.0 + crc_bits - 20.0 * h;
    let denominator = 4.0 * (sf - 2.0 * de);
    let cr = m.coding_rate.denominator() as f64;
    let payload_symbols = if denominator > 0.0 {
        8.0 + (numerator / denominator).ceil().max(0.0) * cr
    } else {
        8.0
    };

    (t_preamble_us + payload_symbols * t_sym_us) as u64
}

/// Packet airtime rounded up to whole milliseconds.
pub fn airtime(payload_len: usize, m: &Modulation) -> Duration {
    Duration::from_millis(airtime_us(payload_len, m).div_ceil(1000))
}
