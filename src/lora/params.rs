//! Raw-mode radio parameters, their validation and their record layout.

use super::airtime::{airtime, Bandwidth, CodingRate, Modulation};
use super::region::Region;
use crate::codec::{Reader, Writer};
use crate::nvm::Record;
use std::fmt;
use std::time::Duration;

/// Record key for the raw radio parameters.
pub const RADIO_PARAMS_KEY: &str = "raw-radio-if";

/// Transceiver output range in dBm (SX126x high-power PA).
pub const CHIP_MIN_TX_POWER: i8 = -9;
pub const CHIP_MAX_TX_POWER: i8 = 22;

/// Default antenna gain in dBi.
pub const DEFAULT_ANTENNA_GAIN: f32 = 2.15;

const DEFAULT_TX_POWER: i8 = 14;
const DEFAULT_SF: u8 = 7;
const DEFAULT_PREAMBLE: u16 = 8;
const DEFAULT_PAYLOAD: u8 = 64;
const DEFAULT_SYMB_TIMEOUT: u16 = 5;
const DEFAULT_TX_TIMEOUT_MS: u32 = 6000;
const DEFAULT_RX_TIMEOUT_MS: u32 = 6000;

/// Full raw radio configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioParams {
    pub region: Region,
    pub freq_hz: u32,
    /// Radiated power in dBm, antenna gain included.
    pub tx_power: i8,
    pub antenna_gain: f32,
    pub sf: u8,
    pub cr: CodingRate,
    pub preamble: u16,
    pub bandwidth: Bandwidth,
    /// Maximum payload length, also used for the time-on-air bound.
    pub payload_len: u8,
    pub tx_inv_iq: bool,
    pub rx_inv_iq: bool,
    pub crc_on: bool,
    pub symb_timeout: u16,
    pub tx_timeout_ms: u32,
    pub rx_timeout_ms: u32,
}

impl RadioParams {
    /// Defaults for `region`.
    pub fn for_region(region: Region) -> Self {
        let mut params = Self {
            region,
            freq_hz: region.frequency(),
            tx_power: DEFAULT_TX_POWER,
            antenna_gain: DEFAULT_ANTENNA_GAIN,
            sf: DEFAULT_SF,
            cr: CodingRate::Cr4_5,
            preamble: DEFAULT_PREAMBLE,
            bandwidth: Bandwidth::Khz125,
            payload_len: DEFAULT_PAYLOAD,
            tx_inv_iq: false,
            rx_inv_iq: false,
            crc_on: true,
            symb_timeout: DEFAULT_SYMB_TIMEOUT,
            tx_timeout_ms: DEFAULT_TX_TIMEOUT_MS,
            rx_timeout_ms: DEFAULT_RX_TIMEOUT_MS,
        };
        params.tx_power = params.clamp_tx_power(params.tx_power);
        params
    }

    /// Power the chip has to produce for the configured radiated power.
    pub fn effective_tx_power(&self) -> i8 {
        (self.tx_power as f32 - self.antenna_gain).floor() as i8
    }

    pub fn modulation(&self) -> Modulation {
        Modulation {
            spreading_factor: self.sf,
            bandwidth: self.bandwidth,
            coding_rate: self.cr,
            preamble_symbols: self.preamble,
            explicit_header: true,
            crc_enabled: self.crc_on,
        }
    }

    /// Bound on the header-valid to rx-done window: twice the airtime of a
    /// full payload.
    pub fn time_on_air(&self) -> Duration {
        airtime(self.payload_len as usize, &self.modulation()) * 2
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_ms as u64)
    }

    pub fn rx_timeout(&self) -> Duration {
        Duration::from_millis(self.rx_timeout_ms as u64)
    }

    fn chip_tx_power_range(&self) -> (i8, i8) {
        (
            (CHIP_MIN_TX_POWER as f32 + self.antenna_gain).floor() as i8,
            (CHIP_MAX_TX_POWER as f32 + self.antenna_gain).floor() as i8,
        )
    }

    fn clamp_tx_power(&self, power: i8) -> i8 {
        let (min, max) = self.chip_tx_power_range();
        let region_max = self.region.max_eirp().floor() as i8;
        power.clamp(min, max).min(region_max)
    }

    /// Check `param` against `region` and the chip limits.
    pub fn verify(&self, region: Region, param: &RawParam) -> bool {
        match *param {
            RawParam::Region(_) => true,
            RawParam::Freq(hz) => region.contains(hz),
            RawParam::TxPower(dbm) => {
                let (min, max) = self.chip_tx_power_range();
                if dbm < min || dbm > max {
                    log::warn!(
                        "tx power {:+} dBm outside chip range {:+}..{:+} dBm (antenna gain {:.2} dBi)",
                        dbm, min, max, self.antenna_gain
                    );
                    return false;
                }
                let region_max = region.max_eirp().floor() as i8;
                if dbm > region_max {
                    log::warn!("tx power {:+} dBm above {} max {:+} dBm", dbm, region, region_max);
                    return false;
                }
                true
            }
            RawParam::AntennaGain(gain) => gain > -0.001 && gain <= 2.151,
            RawParam::Sf(sf) => (6..=12).contains(&sf),
            RawParam::Cr(_) | RawParam::Bandwidth(_) => true,
            RawParam::Preamble(_)
            | RawParam::PayloadLen(_)
            | RawParam::TxInvIq(_)
            | RawParam::RxInvIq(_)
            | RawParam::CrcOn(_)
            | RawParam::SymbTimeout(_)
            | RawParam::TxTimeoutMs(_)
            | RawParam::RxTimeoutMs(_) => true,
        }
    }

    pub fn get(&self, kind: RawParamKind) -> RawParam {
        match kind {
            RawParamKind::Region => RawParam::Region(self.region),
            RawParamKind::Freq => RawParam::Freq(self.freq_hz),
            RawParamKind::TxPower => RawParam::TxPower(self.tx_power),
            RawParamKind::AntennaGain => RawParam::AntennaGain(self.antenna_gain),
            RawParamKind::Sf => RawParam::Sf(self.sf),
            RawParamKind::Cr => RawParam::Cr(self.cr),
            RawParamKind::Preamble => RawParam::Preamble(self.preamble),
            RawParamKind::Bandwidth => RawParam::Bandwidth(self.bandwidth),
            RawParamKind::PayloadLen => RawParam::PayloadLen(self.payload_len),
            RawParamKind::TxInvIq => RawParam::TxInvIq(self.tx_inv_iq),
            RawParamKind::RxInvIq => RawParam::RxInvIq(self.rx_inv_iq),
            RawParamKind::CrcOn => RawParam::CrcOn(self.crc_on),
            RawParamKind::SymbTimeout => RawParam::SymbTimeout(self.symb_timeout),
            RawParamKind::TxTimeoutMs => RawParam::TxTimeoutMs(self.tx_timeout_ms),
            RawParamKind::RxTimeoutMs => RawParam::RxTimeoutMs(self.rx_timeout_ms),
        }
    }

    /// Verify and apply. Changing the region reloads that region's defaults.
    pub fn set(&mut self, param: RawParam) -> Result<(), ParamError> {
        if !self.verify(self.region, &param) {
            return Err(ParamError(param));
        }
        match param {
            RawParam::Region(region) => *self = Self::for_region(region),
            RawParam::Freq(v) => self.freq_hz = v,
            RawParam::TxPower(v) => self.tx_power = v,
            RawParam::AntennaGain(v) => {
                self.antenna_gain = v;
                self.tx_power = self.clamp_tx_power(self.tx_power);
            }
            RawParam::Sf(v) => self.sf = v,
            RawParam::Cr(v) => self.cr = v,
            RawParam::Preamble(v) => self.preamble = v,
            RawParam::Bandwidth(v) => self.bandwidth = v,
            RawParam::PayloadLen(v) => self.payload_len = v,
            RawParam::TxInvIq(v) => self.tx_inv_iq = v,
            RawParam::RxInvIq(v) => self.rx_inv_iq = v,
            RawParam::CrcOn(v) => self.crc_on = v,
            RawParam::SymbTimeout(v) => self.symb_timeout = v,
            RawParam::TxTimeoutMs(v) => self.tx_timeout_ms = v,
            RawParam::RxTimeoutMs(v) => self.rx_timeout_ms = v,
        }
        Ok(())
    }
}

impl Default for RadioParams {
    fn default() -> Self {
        Self::for_region(Region::default())
    }
}

impl Record for RadioParams {
    const KEY: &'static str = RADIO_PARAMS_KEY;
    const SIZE: usize = 32;

    fn encode(&self, out: &mut [u8]) {
        Writer::new(out)
            .u8(self.region as u8)
            .u32(self.freq_hz)
            .i8(self.tx_power)
            .f32(self.antenna_gain)
            .u8(self.sf)
            .u8(self.cr as u8)
            .u16(self.preamble)
            .u8(self.bandwidth as u8)
            .u8(self.payload_len)
            .bool(self.tx_inv_iq)
            .bool(self.rx_inv_iq)
            .bool(self.crc_on)
            .u16(self.symb_timeout)
            .u32(self.tx_timeout_ms)
            .u32(self.rx_timeout_ms);
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut r = Reader::new(bytes);
        let region = Region::from_u8(r.u8()).unwrap_or_default();
        let defaults = Self::for_region(region);
        Self {
            region,
            freq_hz: r.u32(),
            tx_power: r.i8(),
            antenna_gain: r.f32(),
            sf: r.u8(),
            cr: CodingRate::from_u8(r.u8()).unwrap_or(defaults.cr),
            preamble: r.u16(),
            bandwidth: Bandwidth::from_u8(r.u8()).unwrap_or(defaults.bandwidth),
            payload_len: r.u8(),
            tx_inv_iq: r.bool(),
            rx_inv_iq: r.bool(),
            crc_on: r.bool(),
            symb_timeout: r.u16(),
            tx_timeout_ms: r.u32(),
            rx_timeout_ms: r.u32(),
        }
    }

    fn defaults() -> Self {
        Self::default()
    }
}

/// Identifies one raw radio parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawParamKind {
    Region,
    Freq,
    TxPower,
    AntennaGain,
    Sf,
    Cr,
    Preamble,
    Bandwidth,
    PayloadLen,
    TxInvIq,
    RxInvIq,
    CrcOn,
    SymbTimeout,
    TxTimeoutMs,
    RxTimeoutMs,
}

/// One raw radio parameter with its value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawParam {
    Region(Region),
    /// Channel in Hz
    Freq(u32),
    /// Radiated power in dBm
    TxPower(i8),
    /// dBi
    AntennaGain(f32),
    Sf(u8),
    Cr(CodingRate),
    Preamble(u16),
    Bandwidth(Bandwidth),
    PayloadLen(u8),
    TxInvIq(bool),
    RxInvIq(bool),
    CrcOn(bool),
    SymbTimeout(u16),
    TxTimeoutMs(u32),
    RxTimeoutMs(u32),
}

impl RawParam {
    pub fn kind(&self) -> RawParamKind {
        match self {
            Self::Region(_) => RawParamKind::Region,
            Self::Freq(_) => RawParamKind::Freq,
            Self::TxPower(_) => RawParamKind::TxPower,
            Self::AntennaGain(_) => RawParamKind::AntennaGain,
            Self::Sf(_) => RawParamKind::Sf,
            Self::Cr(_) => RawParamKind::Cr,
            Self::Preamble(_) => RawParamKind::Preamble,
            Self::Bandwidth(_) => RawParamKind::Bandwidth,
            Self::PayloadLen(_) => RawParamKind::PayloadLen,
            Self::TxInvIq(_) => RawParamKind::TxInvIq,
            Self::RxInvIq(_) => RawParamKind::RxInvIq,
            Self::CrcOn(_) => RawParamKind::CrcOn,
            Self::SymbTimeout(_) => RawParamKind::SymbTimeout,
            Self::TxTimeoutMs(_) => RawParamKind::TxTimeoutMs,
            Self::RxTimeoutMs(_) => RawParamKind::RxTimeoutMs,
        }
    }
}

/// A parameter value rejected by verification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamError(pub RawParam);

impl fmt::Display for ParamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid radio parameter {:?}", self.0)
    }
}

impl std::error::Error for ParamError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = RadioParams::for_region(Region::Eu868);
        assert_eq!(p.freq_hz, 868_000_000);
        assert_eq!(p.tx_power, 14);
        assert_eq!(p.sf, 7);
        assert_eq!(p.cr, CodingRate::Cr4_5);
        assert_eq!(p.bandwidth, Bandwidth::Khz125);
        assert_eq!(p.payload_len, 64);
        assert!(p.crc_on);
        assert_eq!(p.tx_timeout(), Duration::from_millis(6000));
    }

    #[test]
    fn test_tx_power_clamped_to_region() {
        assert_eq!(RadioParams::for_region(Region::Cn779).tx_power, 12);
        assert_eq!(RadioParams::for_region(Region::Us915).tx_power, 14);
    }

    #[test]
    fn test_time_on_air_is_doubled_airtime() {
        let p = RadioParams::default();
        let single = airtime(64, &p.modulation());
        assert_eq!(p.time_on_air(), single * 2);
    }

    #[test]
    fn test_verify_rules() {
        let p = RadioParams::default();
        let eu = Region::Eu868;
        assert!(p.verify(eu, &RawParam::Freq(868_500_000)));
        assert!(!p.verify(eu, &RawParam::Freq(915_000_000)));
        assert!(p.verify(eu, &RawParam::TxPower(16)));
        assert!(!p.verify(eu, &RawParam::TxPower(17)));
        assert!(!p.verify(eu, &RawParam::TxPower(-20)));
        assert!(p.verify(Region::Us915, &RawParam::TxPower(22)));
        assert!(p.verify(eu, &RawParam::AntennaGain(0.0)));
        assert!(p.verify(eu, &RawParam::AntennaGain(2.15)));
        assert!(!p.verify(eu, &RawParam::AntennaGain(3.0)));
        assert!(!p.verify(eu, &RawParam::AntennaGain(-1.0)));
        assert!(p.verify(eu, &RawParam::Sf(6)));
        assert!(!p.verify(eu, &RawParam::Sf(13)));
        assert!(p.verify(eu, &RawParam::Preamble(0)));
    }

    #[test]
    fn test_set_rejects_invalid() {
        let mut p = RadioParams::default();
        assert_eq!(p.set(RawParam::Sf(5)), Err(ParamError(RawParam::Sf(5))));
        assert_eq!(p.sf, 7);
        p.set(RawParam::Sf(10)).unwrap();
        assert_eq!(p.get(RawParamKind::Sf), RawParam::Sf(10));
    }

    #[test]
    fn test_region_change_loads_region_defaults() {
        let mut p = RadioParams::default();
        p.set(RawParam::Sf(12)).unwrap();
        p.set(RawParam::Region(Region::Us915)).unwrap();
        assert_eq!(p.region, Region::Us915);
        assert_eq!(p.freq_hz, 915_000_000);
        assert_eq!(p.sf, 7);
    }

    #[test]
    fn test_record_roundtrip() {
        let mut p = RadioParams::for_region(Region::Kr920);
        p.set(RawParam::Sf(9)).unwrap();
        p.set(RawParam::RxInvIq(true)).unwrap();
        let mut buf = [0u8; RadioParams::SIZE];
        p.encode(&mut buf);
        assert_eq!(RadioParams::decode(&buf), p);
    }

    #[test]
    fn test_effective_power_removes_antenna_gain() {
        let p = RadioParams::default();
        assert_eq!(p.effective_tx_power(), 11);
    }
}
