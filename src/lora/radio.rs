//! Radio transceiver surface consumed by the raw mode.

use super::airtime::{airtime, Bandwidth, CodingRate, Modulation};
use super::params::RadioParams;
use crate::event::RxPacket;
use std::sync::Arc;
use std::time::Duration;

/// Called from interrupt context when the transceiver raises an IRQ line.
pub type IrqNotifier = Arc<dyn Fn() + Send + Sync>;

/// Pending interrupt sources as reported by the transceiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqFlags(pub u16);

impl IrqFlags {
    pub const TX_DONE: u16 = 1 << 0;
    pub const RX_DONE: u16 = 1 << 1;
    pub const PREAMBLE_DETECTED: u16 = 1 << 2;
    pub const HEADER_VALID: u16 = 1 << 4;
    pub const HEADER_ERROR: u16 = 1 << 5;
    pub const CRC_ERROR: u16 = 1 << 6;
    pub const CAD_DONE: u16 = 1 << 7;
    pub const TIMEOUT: u16 = 1 << 9;

    pub fn contains(self, bits: u16) -> bool {
        self.0 & bits == bits
    }

    /// Header received, payload still on air.
    pub fn header_only(self) -> bool {
        self.contains(Self::HEADER_VALID) && !self.contains(Self::RX_DONE)
    }
}

/// Events reported by [`Radio::process_irqs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    TxDone,
    TxTimeout,
    RxDone(RxPacket),
    RxTimeout,
    RxError,
    CadDone(bool),
}

/// Transmit configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxConfig {
    /// Chip output power in dBm
    pub power: i8,
    pub bandwidth: Bandwidth,
    pub sf: u8,
    pub cr: CodingRate,
    pub preamble: u16,
    pub crc_on: bool,
    pub inv_iq: bool,
    pub timeout: Duration,
}

/// Receive configuration. Reception is continuous until stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RxConfig {
    pub bandwidth: Bandwidth,
    pub sf: u8,
    pub cr: CodingRate,
    pub preamble: u16,
    pub symb_timeout: u16,
    pub payload_len: u8,
    pub crc_on: bool,
    pub inv_iq: bool,
}

impl RadioParams {
    pub fn tx_config(&self) -> TxConfig {
        TxConfig {
            power: self.effective_tx_power(),
            bandwidth: self.bandwidth,
            sf: self.sf,
            cr: self.cr,
            preamble: self.preamble,
            crc_on: self.crc_on,
            inv_iq: self.tx_inv_iq,
            timeout: self.tx_timeout(),
        }
    }

    pub fn rx_config(&self) -> RxConfig {
        RxConfig {
            bandwidth: self.bandwidth,
            sf: self.sf,
            cr: self.cr,
            preamble: self.preamble,
            symb_timeout: self.symb_timeout,
            payload_len: self.payload_len,
            crc_on: self.crc_on,
            inv_iq: self.rx_inv_iq,
        }
    }
}

/// LoRa transceiver driver.
///
/// Implementations never call back into the stack except through the
/// [`IrqNotifier`] handed to [`Radio::init`]; completed operations are
/// collected by [`Radio::process_irqs`] on the consumer thread.
pub trait Radio: Send {
    fn init(&mut self, notifier: IrqNotifier);
    fn set_channel(&mut self, freq_hz: u32);
    fn set_tx_config(&mut self, config: &TxConfig);
    fn set_rx_config(&mut self, config: &RxConfig);
    fn send(&mut self, data: &[u8]);
    /// Start continuous reception.
    fn recv(&mut self);
    fn sleep(&mut self);
    /// Unmodulated carrier for `duration`, then a tx-timeout event.
    fn tx_cont_wave(&mut self, freq_hz: u32, power: i8, duration: Duration);
    fn irq_flags(&self) -> IrqFlags;
    fn process_irqs(&mut self) -> Vec<RadioEvent>;

    fn time_on_air(&self, modulation: &Modulation, payload_len: usize) -> Duration {
        airtime(payload_len, modulation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_only() {
        assert!(IrqFlags(IrqFlags::HEADER_VALID).header_only());
        assert!(!IrqFlags(IrqFlags::HEADER_VALID | IrqFlags::RX_DONE).header_only());
        assert!(!IrqFlags::default().header_only());
    }

    #[test]
    fn test_configs_follow_params() {
        let params = RadioParams::default();
        let tx = params.tx_config();
        assert_eq!(tx.power, params.effective_tx_power());
        assert_eq!(tx.timeout, Duration::from_millis(6000));
        let rx = params.rx_config();
        assert_eq!(rx.symb_timeout, 5);
        assert_eq!(rx.payload_len, 64);
    }
}
