//! Simulated transceiver for host builds and tests.
//!
//! [`SimRadio`] is handed to the stack; the paired [`SimRadioHandle`]
//! injects interrupts and inspects what the stack did with the radio.

use super::radio::{IrqFlags, IrqNotifier, Radio, RadioEvent, RxConfig, TxConfig};
use crate::event::RxPacket;
use crate::lock;
use log::debug;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the simulated chip is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    Sleep,
    Tx,
    Rx,
    ContinuousWave,
}

#[derive(Default)]
struct SimState {
    notifier: Option<IrqNotifier>,
    events: VecDeque<RadioEvent>,
    flags: IrqFlags,
    sent: Vec<Vec<u8>>,
    loopback: VecDeque<Vec<u8>>,
    mode: Option<SimMode>,
    channel: u32,
    tx_config: Option<TxConfig>,
    rx_config: Option<RxConfig>,
    inits: usize,
    sleeps: usize,
    auto_tx_done: bool,
    echo: bool,
}

/// Simulated LoRa transceiver.
pub struct SimRadio {
    state: Arc<Mutex<SimState>>,
}

/// Test-side control of a [`SimRadio`].
#[derive(Clone)]
pub struct SimRadioHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimRadio {
    /// Radio that completes every transmission immediately.
    pub fn new() -> (Self, SimRadioHandle) {
        let state = Arc::new(Mutex::new(SimState {
            auto_tx_done: true,
            ..SimState::default()
        }));
        (
            Self {
                state: state.clone(),
            },
            SimRadioHandle { state },
        )
    }

    /// Radio that also hears its own transmissions on the next receive.
    pub fn loopback() -> (Self, SimRadioHandle) {
        let (radio, handle) = Self::new();
        lock(&radio.state).echo = true;
        (radio, handle)
    }

    fn raise(state: &Arc<Mutex<SimState>>, event: Option<RadioEvent>, flags: u16) {
        let notifier = {
            let mut s = lock(state);
            if let Some(event) = event {
                s.events.push_back(event);
            }
            s.flags = IrqFlags(s.flags.0 | flags);
            s.notifier.clone()
        };
        if let Some(notify) = notifier {
            notify();
        }
    }
}

fn flags_for(event: &RadioEvent) -> u16 {
    match event {
        RadioEvent::TxDone => IrqFlags::TX_DONE,
        RadioEvent::RxDone(_) => IrqFlags::RX_DONE | IrqFlags::HEADER_VALID,
        RadioEvent::TxTimeout | RadioEvent::RxTimeout => IrqFlags::TIMEOUT,
        RadioEvent::RxError => IrqFlags::CRC_ERROR,
        RadioEvent::CadDone(_) => IrqFlags::CAD_DONE,
    }
}

impl Radio for SimRadio {
    fn init(&mut self, notifier: IrqNotifier) {
        let mut s = lock(&self.state);
        s.notifier = Some(notifier);
        s.inits += 1;
        s.mode = Some(SimMode::Sleep);
    }

    fn set_channel(&mut self, freq_hz: u32) {
        lock(&self.state).channel = freq_hz;
    }

    fn set_tx_config(&mut self, config: &TxConfig) {
        lock(&self.state).tx_config = Some(*config);
    }

    fn set_rx_config(&mut self, config: &RxConfig) {
        lock(&self.state).rx_config = Some(*config);
    }

    fn send(&mut self, data: &[u8]) {
        let auto = {
            let mut s = lock(&self.state);
            debug!("sim radio: send {} bytes", data.len());
            s.sent.push(data.to_vec());
            if s.echo {
                s.loopback.push_back(data.to_vec());
            }
            s.mode = Some(SimMode::Tx);
            s.auto_tx_done
        };
        if auto {
            Self::raise(&self.state, Some(RadioEvent::TxDone), IrqFlags::TX_DONE);
        }
    }

    fn recv(&mut self) {
        let echoed = {
            let mut s = lock(&self.state);
            s.mode = Some(SimMode::Rx);
            s.loopback.pop_front()
        };
        if let Some(data) = echoed {
            let packet = RxPacket {
                data,
                rssi: -40,
                snr: 9,
            };
            let event = RadioEvent::RxDone(packet);
            let flags = flags_for(&event);
            Self::raise(&self.state, Some(event), flags);
        }
    }

    fn sleep(&mut self) {
        let mut s = lock(&self.state);
        s.mode = Some(SimMode::Sleep);
        s.sleeps += 1;
    }

    fn tx_cont_wave(&mut self, freq_hz: u32, power: i8, duration: Duration) {
        debug!(
            "sim radio: carrier at {} Hz, {} dBm for {:?}",
            freq_hz, power, duration
        );
        let mut s = lock(&self.state);
        s.channel = freq_hz;
        s.mode = Some(SimMode::ContinuousWave);
    }

    fn irq_flags(&self) -> IrqFlags {
        lock(&self.state).flags
    }

    fn process_irqs(&mut self) -> Vec<RadioEvent> {
        let mut s = lock(&self.state);
        s.flags = IrqFlags::default();
        s.events.drain(..).collect()
    }
}

impl SimRadioHandle {
    /// Queue a driver event and raise the interrupt line.
    pub fn inject(&self, event: RadioEvent) {
        let flags = flags_for(&event);
        SimRadio::raise(&self.state, Some(event), flags);
    }

    /// Raise the interrupt line with `flags` and no completed event, as
    /// happens when a header is detected.
    pub fn raise_flags(&self, flags: u16) {
        SimRadio::raise(&self.state, None, flags);
    }

    /// Stop completing transmissions automatically.
    pub fn set_auto_tx_done(&self, enabled: bool) {
        lock(&self.state).auto_tx_done = enabled;
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.state).sent.clone()
    }

    pub fn mode(&self) -> Option<SimMode> {
        lock(&self.state).mode
    }

    pub fn channel(&self) -> u32 {
        lock(&self.state).channel
    }

    pub fn tx_config(&self) -> Option<TxConfig> {
        lock(&self.state).tx_config
    }

    pub fn rx_config(&self) -> Option<RxConfig> {
        lock(&self.state).rx_config
    }

    pub fn inits(&self) -> usize {
        lock(&self.state).inits
    }

    pub fn sleeps(&self) -> usize {
        lock(&self.state).sleeps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_init(radio: &mut SimRadio) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        radio.init(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    #[test]
    fn test_send_raises_tx_done() {
        let (mut radio, handle) = SimRadio::new();
        let irqs = counting_init(&mut radio);
        radio.send(b"hi");
        assert_eq!(irqs.load(Ordering::SeqCst), 1);
        assert!(radio.irq_flags().contains(IrqFlags::TX_DONE));
        assert_eq!(radio.process_irqs(), vec![RadioEvent::TxDone]);
        assert_eq!(radio.irq_flags(), IrqFlags::default());
        assert_eq!(handle.sent(), vec![b"hi".to_vec()]);
    }

    #[test]
    fn test_loopback_echoes_on_recv() {
        let (mut radio, _handle) = SimRadio::loopback();
        counting_init(&mut radio);
        radio.send(b"echo");
        radio.process_irqs();
        radio.recv();
        match radio.process_irqs().as_slice() {
            [RadioEvent::RxDone(p)] => assert_eq!(p.data, b"echo"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_header_flags_without_event() {
        let (mut radio, handle) = SimRadio::new();
        let irqs = counting_init(&mut radio);
        handle.raise_flags(IrqFlags::HEADER_VALID);
        assert_eq!(irqs.load(Ordering::SeqCst), 1);
        assert!(radio.irq_flags().header_only());
        assert!(radio.process_irqs().is_empty());
    }
}
