//! LoRaWAN mode.
//!
//! Applications queue messages on ports ([`port`]); a consumer thread
//! ([`process`]) takes them to the MAC on every duty cycle and turns MAC
//! results into per-port indications.

pub mod arena;
pub mod commission;
pub mod duty;
pub mod mac;
pub mod port;
mod process;
pub mod settings;

pub use commission::{Activation, AbpKeys, Commission, LoraWanVersion, OtaaKeys};
pub use mac::{Mac, MacEvents, MacStatus, RxStatus, SharedMac, SimMac, SimMacHandle, TxStatus};
pub use port::{IndKind, Indication, PortTable, PortUsage, RxInfo, TxInfo};
pub use process::{State, WanRequest};
pub use settings::{DeviceClass, WanSettings};

use crate::context::StackContext;
use crate::error::{LoraError, PortError};
use crate::event::{EventCallback, LoraEvent, PortSelector, RxPacket, RxParams, TxParams};
use crate::event_loop::{EventLoop, Mailbox};
use crate::lock;
use crate::lora::Region;
use crate::nvm::{NvmRecord, NvmStore};
use crate::raw::SharedRadio;
use crate::sync_pool::SyncPool;
use duty::Duty;
use log::{info, warn};
use port::Terminal;
use process::Processor;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// WAN setting addressed by get/set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WanParamKind {
    Region,
    Class,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WanParam {
    Region(Region),
    Class(DeviceClass),
}

#[derive(Debug, Default)]
pub(crate) struct WanCounters {
    pub requests: AtomicU32,
    pub ignored: AtomicU32,
    pub tx_done: AtomicU32,
    pub tx_confirm: AtomicU32,
    pub tx_fail: AtomicU32,
    pub tx_timeout: AtomicU32,
    pub rx_data: AtomicU32,
}

impl WanCounters {
    pub fn record(&self, kind: IndKind) {
        let counter = match kind {
            IndKind::TxDone => &self.tx_done,
            IndKind::TxConfirm => &self.tx_confirm,
            IndKind::TxFail => &self.tx_fail,
            IndKind::TxTimeout => &self.tx_timeout,
            IndKind::RxDone | IndKind::RxTimeout => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// WAN mode snapshot for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WanStats {
    pub state: &'static str,
    pub joined: bool,
    pub region: String,
    pub class: String,
    pub duty_running: bool,
    pub duty_period_ms: u64,
    pub pending_tx: bool,
    pub requests: u32,
    pub ignored: u32,
    pub tx_done: u32,
    pub tx_confirm: u32,
    pub tx_fail: u32,
    pub tx_timeout: u32,
    pub rx_data: u32,
    pub ports: PortUsage,
}

pub(crate) struct WanShared {
    pub ports: Arc<PortTable>,
    pub mac: SharedMac,
    pub radio: SharedRadio,
    pub duty: Arc<Duty>,
    pub commission: Mutex<NvmRecord<Commission>>,
    pub settings: Mutex<NvmRecord<WanSettings>>,
    pub store: Arc<NvmStore>,
    pub sync: Arc<SyncPool>,
    pub state: AtomicU8,
    pub rx_listening: AtomicBool,
    /// An uplink is with the MAC.
    pub processing: AtomicBool,
    pub counters: WanCounters,
    mailbox: Mailbox<WanRequest>,
    running: AtomicBool,
}

impl WanShared {
    pub fn post(&self, request: WanRequest) -> bool {
        let name = request.name();
        if !self.mailbox.post(request) {
            warn!("wan: dropped {}, consumer gone", name);
            return false;
        }
        true
    }

    pub fn mac<T>(&self, f: impl FnOnce(&mut dyn Mac) -> T) -> T {
        let mut mac = lock(&self.mac);
        f(&mut **mac)
    }

    pub fn settings(&self) -> WanSettings {
        *lock(&self.settings).get()
    }
}

/// LoRaWAN mode instance.
pub struct WanMode {
    shared: Arc<WanShared>,
    event_loop: EventLoop<WanRequest>,
}

impl WanMode {
    /// Load credentials and settings, hand them to the MAC and start the
    /// consumer. An ABP device starts joined; the duty cycle runs from the
    /// start and is held while not joined.
    pub fn new(ctx: &StackContext, radio: SharedRadio, mac: SharedMac) -> Result<Self, LoraError> {
        let commission = NvmRecord::<Commission>::load(&ctx.store)?;
        let settings = NvmRecord::<WanSettings>::load(&ctx.store)?;
        let (mailbox, inbox) = Mailbox::channel();
        let duty = Duty::new(
            ctx.store.clone(),
            ctx.runtime.clone(),
            mailbox.clone(),
            ctx.config.duty_cycle(),
        )?;

        let joined = commission.get().is_abp();
        {
            let mut mac = lock(&mac);
            mac.init(MacEvents::new(mailbox.clone()), commission.get(), settings.get());
        }
        info!(
            "wan: {:?}, {} {}",
            commission.get(),
            settings.get().region,
            settings.get().class
        );

        let shared = Arc::new(WanShared {
            ports: PortTable::new(ctx),
            mac,
            radio,
            duty,
            commission: Mutex::new(commission),
            settings: Mutex::new(settings),
            store: ctx.store.clone(),
            sync: ctx.sync.clone(),
            state: AtomicU8::new((if joined { State::Joined } else { State::NotJoined }) as u8),
            rx_listening: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            counters: WanCounters::default(),
            mailbox: mailbox.clone(),
            running: AtomicBool::new(true),
        });

        let weak = Arc::downgrade(&shared);
        lock(&shared.radio).init(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.post(WanRequest::RadioEvt);
            }
        }));

        let mut processor = Processor::new(shared.clone(), ctx.runtime.clone(), joined);
        let event_loop = EventLoop::spawn("lora-wan", mailbox, inbox, move |request| {
            processor.handle(request)
        })
        .map_err(|e| {
            warn!("wan: cannot start consumer: {}", e);
            LoraError::Error
        })?;

        if !joined {
            shared.duty.suspend();
        }
        shared.duty.start();
        info!("wan mode started");
        Ok(Self { shared, event_loop })
    }

    fn check_running(&self) -> Result<(), LoraError> {
        if self.shared.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(LoraError::PoweredOff)
        }
    }

    /// Queue an uplink. A synchronous send resolves with the message's
    /// terminal event.
    pub fn tx(&self, tx: &TxParams<'_>) -> Result<(), LoraError> {
        self.check_running()?;
        let sent = self.shared.ports.send(tx)?;
        match sent.terminal {
            None => Ok(()),
            Some(Terminal::Event(IndKind::TxDone | IndKind::TxConfirm)) => Ok(()),
            Some(Terminal::Event(IndKind::TxTimeout)) => Err(LoraError::Timeout),
            Some(Terminal::Event(IndKind::TxFail)) if tx.confirm => Err(LoraError::TxNotConfirmed),
            Some(Terminal::Event(_)) => Err(LoraError::Error),
            Some(Terminal::Closed) => Err(PortError::NotOpened.into()),
        }
    }

    /// Take downlink data from a port. A synchronous receive waits up to
    /// the timeout (forever when zero).
    pub fn rx(&self, rx: &RxParams) -> Result<Option<RxPacket>, LoraError> {
        self.check_running()?;
        match self
            .shared
            .ports
            .receive(rx.port, rx.max_len, rx.sync, rx.timeout)
        {
            Ok(packet) => Ok(Some(packet)),
            Err(PortError::NoRxData) if rx.sync => Err(LoraError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_callback(&self, selector: PortSelector, callback: EventCallback) -> Result<(), LoraError> {
        self.shared.ports.set_callback(selector, callback)?;
        Ok(())
    }

    /// Store new credentials and restart the session with them.
    pub fn commission(&self, commission: Commission) -> Result<(), LoraError> {
        self.check_running()?;
        {
            let mut record = lock(&self.shared.commission);
            *record.get_mut() = commission;
            record.sync(&self.shared.store)?;
        }
        self.post(WanRequest::Commission)
    }

    pub fn join(&self) -> Result<(), LoraError> {
        self.check_running()?;
        self.post(WanRequest::JoinReq)
    }

    /// Ask the consumer whether the device is joined.
    pub fn join_status(&self) -> Result<bool, LoraError> {
        self.check_running()?;
        let handle = self.shared.sync.acquire("lora-wan-join-status");
        let reply = Arc::new(AtomicBool::new(false));
        if !self.shared.post(WanRequest::JoinStatus {
            handle,
            reply: reply.clone(),
        }) {
            self.shared.sync.release(handle);
            return Err(LoraError::PoweredOff);
        }
        self.shared.sync.wait(&handle);
        Ok(reply.load(Ordering::Acquire))
    }

    pub fn duty_set(&self, period: Duration) -> Result<(), LoraError> {
        self.shared.duty.set(period)?;
        Ok(())
    }

    pub fn duty_get(&self) -> Duration {
        self.shared.duty.period()
    }

    /// Start the duty cycle. It stays held while not joined.
    pub fn duty_start(&self) {
        self.shared.duty.start();
    }

    pub fn duty_stop(&self) {
        self.shared.duty.stop();
    }

    /// Messages are queued or the MAC still works on one.
    pub fn is_pending_tx(&self) -> bool {
        self.shared.ports.is_pending_tx()
            || self.shared.processing.load(Ordering::Relaxed)
            || self.shared.mac(|m| m.is_busy())
    }

    /// With rx listening on, a duty cycle with nothing queued sends an
    /// empty frame so the network can deliver downlinks.
    pub fn set_rx_listening(&self, enabled: bool) {
        self.shared.rx_listening.store(enabled, Ordering::Relaxed);
    }

    pub fn port_open(&self, num: u8) -> Result<(), LoraError> {
        self.shared.ports.open(num)?;
        Ok(())
    }

    pub fn port_close(&self, num: u8) -> Result<(), LoraError> {
        self.shared.ports.close(num)?;
        Ok(())
    }

    pub fn get_ind_params(&self) -> Indication {
        self.shared.ports.get_ind_params()
    }

    /// Callback logging every event and draining the indications it
    /// announces.
    pub fn logging_callback(&self) -> EventCallback {
        let ports = Arc::downgrade(&self.shared.ports);
        Arc::new(move |event: LoraEvent, _: Option<&RxPacket>| {
            info!("wan: event {}", event);
            if event != LoraEvent::Indication {
                return;
            }
            let Some(ports) = ports.upgrade() else {
                return;
            };
            loop {
                match ports.get_ind_params() {
                    Indication::None => break,
                    ind => info!("wan: {:?}", ind),
                }
            }
        })
    }

    pub fn get_param(&self, kind: WanParamKind) -> WanParam {
        let settings = self.shared.settings();
        match kind {
            WanParamKind::Region => WanParam::Region(settings.region),
            WanParamKind::Class => WanParam::Class(settings.class),
        }
    }

    /// Persist a setting. A new region drops the session; a new class is
    /// negotiated when joined and applied on the next join otherwise.
    pub fn set_param(&self, param: WanParam) -> Result<(), LoraError> {
        self.check_running()?;
        {
            let mut record = lock(&self.shared.settings);
            match param {
                WanParam::Region(region) => record.get_mut().region = region,
                WanParam::Class(class) => record.get_mut().class = class,
            }
            record.sync(&self.shared.store)?;
        }
        match param {
            WanParam::Region(region) => self.post(WanRequest::Restart(region)),
            WanParam::Class(class) if self.state() == State::NotJoined => {
                self.shared.mac(|m| m.set_class(class));
                Ok(())
            }
            WanParam::Class(class) => self.post(WanRequest::ReqClass(class)),
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.shared.state.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> WanStats {
        let c = &self.shared.counters;
        let settings = self.shared.settings();
        let state = self.state();
        WanStats {
            state: state.name(),
            joined: state != State::NotJoined,
            region: settings.region.to_string(),
            class: settings.class.to_string(),
            duty_running: self.shared.duty.is_running(),
            duty_period_ms: self.shared.duty.period().as_millis() as u64,
            pending_tx: self.is_pending_tx(),
            requests: c.requests.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            tx_done: c.tx_done.load(Ordering::Relaxed),
            tx_confirm: c.tx_confirm.load(Ordering::Relaxed),
            tx_fail: c.tx_fail.load(Ordering::Relaxed),
            tx_timeout: c.tx_timeout.load(Ordering::Relaxed),
            rx_data: c.rx_data.load(Ordering::Relaxed),
            ports: self.shared.ports.usage(),
        }
    }

    fn post(&self, request: WanRequest) -> Result<(), LoraError> {
        if self.shared.post(request) {
            Ok(())
        } else {
            Err(LoraError::PoweredOff)
        }
    }
}

impl WanMode {
    /// Refuse new requests, close every port (releasing queued and
    /// in-flight senders and waiting receivers) and quiet the MAC and the
    /// radio. Calling it again is a no-op.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.duty.stop();
        self.event_loop.stop();
        self.shared.ports.close_all();
        self.shared.mac(|m| m.cancel());
        lock(&self.shared.radio).sleep();
        info!("wan mode stopped");
    }
}

impl Drop for WanMode {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoraConfig;
    use crate::context::fixtures;
    use crate::lora::{Radio, SimRadio};
    use crate::nvm::MemStorage;
    use std::thread;
    use std::time::Instant;

    struct Harness {
        wan: WanMode,
        mac: SimMacHandle,
        storage: MemStorage,
    }

    fn start() -> Harness {
        let config = LoraConfig {
            duty_cycle_ms: 20,
            ..LoraConfig::default()
        };
        let (ctx, storage) = fixtures::context_with(config);
        let (radio, _) = SimRadio::new();
        let (mac, handle) = SimMac::new();
        let radio: SharedRadio = Arc::new(Mutex::new(Box::new(radio) as Box<dyn Radio>));
        let mac: SharedMac = Arc::new(Mutex::new(Box::new(mac) as Box<dyn Mac>));
        Harness {
            wan: WanMode::new(&ctx, radio, mac).unwrap(),
            mac: handle,
            storage,
        }
    }

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn joined() -> Harness {
        let h = start();
        h.wan.join().unwrap();
        wait_for("join", || h.wan.state() == State::Joined);
        h
    }

    #[test]
    fn test_sync_ping_on_port_5() {
        let h = joined();
        assert!(h.wan.join_status().unwrap());
        h.wan.port_open(5).unwrap();

        h.wan.tx(&TxParams::new(b"ping").port(5).sync()).unwrap();

        assert_eq!(h.mac.sent(), vec![(5, b"ping".to_vec(), false)]);
        match h.wan.get_ind_params() {
            Indication::Tx { port, event, info } => {
                assert_eq!(port, 5);
                assert_eq!(event, LoraEvent::TxDone);
                assert_eq!(info.ul_frame_counter, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!h.wan.is_pending_tx());
        assert_eq!(h.wan.stats().tx_done, 1);
    }

    #[test]
    fn test_confirmed_uplink_retries_then_fails() {
        let h = joined();
        h.wan.port_open(2).unwrap();
        h.mac.script_tx(MacStatus::Ok, false);
        h.mac.script_tx(MacStatus::Ok, false);

        let result = h.wan.tx(&TxParams::new(b"conf").port(2).sync().confirmed(1));

        assert_eq!(result, Err(LoraError::TxNotConfirmed));
        assert_eq!(h.mac.sent().len(), 2);
        assert!(h.mac.sent().iter().all(|(_, _, confirm)| *confirm));
    }

    #[test]
    fn test_confirmed_uplink_acked_on_retry() {
        let h = joined();
        h.wan.port_open(2).unwrap();
        h.mac.script_tx(MacStatus::Error, false);

        h.wan
            .tx(&TxParams::new(b"conf").port(2).sync().confirmed(3))
            .unwrap();
        assert_eq!(h.mac.sent().len(), 2);
        assert_eq!(h.wan.stats().tx_confirm, 1);
    }

    #[test]
    fn test_message_deadline_with_silent_mac() {
        let h = joined();
        h.wan.port_open(4).unwrap();
        h.mac.set_silent(true);

        let result = h.wan.tx(
            &TxParams::new(b"lost")
                .port(4)
                .sync()
                .timeout(Duration::from_millis(100)),
        );

        assert_eq!(result, Err(LoraError::Timeout));
        wait_for("joined again", || h.wan.state() == State::Joined);
        assert!(h.mac.cancels() >= 1);
    }

    #[test]
    fn test_downlink_reaches_port() {
        let h = joined();
        h.wan.port_open(5).unwrap();
        h.mac.queue_downlink(5, b"hello");

        h.wan.tx(&TxParams::new(b"up").port(5)).unwrap();
        let packet = h
            .wan
            .rx(&RxParams {
                max_len: 3,
                port: 5,
                timeout: Duration::from_secs(1),
                sync: true,
            })
            .unwrap()
            .unwrap();

        assert_eq!(packet.data, b"hel");
        assert_eq!(packet.rssi, -60);
    }

    #[test]
    fn test_receive_without_data() {
        let h = joined();
        h.wan.port_open(6).unwrap();
        let rx = RxParams {
            max_len: 16,
            port: 6,
            ..RxParams::default()
        };
        assert_eq!(h.wan.rx(&rx), Err(LoraError::Port(PortError::NoRxData)));

        let rx = RxParams {
            sync: true,
            timeout: Duration::from_millis(30),
            ..rx
        };
        assert_eq!(h.wan.rx(&rx), Err(LoraError::Timeout));
    }

    #[test]
    fn test_empty_frames_while_listening() {
        let h = joined();
        h.wan.set_rx_listening(true);
        wait_for("empty uplink", || {
            h.mac.sent().iter().any(|(port, data, _)| *port == 0 && data.is_empty())
        });
        h.wan.set_rx_listening(false);
    }

    #[test]
    fn test_join_retries_after_failure() {
        let h = start();
        assert!(!h.wan.join_status().unwrap());
        h.mac.fail_joins(2);
        h.wan.join().unwrap();

        wait_for("join", || h.wan.state() == State::Joined);
        assert_eq!(h.mac.joins(), 3);
        assert!(h.mac.resets() >= 2);
    }

    #[test]
    fn test_abp_commission_joins_without_join_request() {
        let h = start();
        let abp = Commission::abp(LoraWanVersion::V1_0, 0x2601_0001, [1; 8], [2; 16], [3; 16]);
        h.wan.commission(abp).unwrap();

        wait_for("abp session", || h.wan.state() == State::Joined);
        assert_eq!(h.mac.joins(), 0);
        assert!(h.storage.raw(commission::COMMISSION_KEY).is_some());
    }

    #[test]
    fn test_class_change_when_joined() {
        let h = joined();
        h.wan.set_param(WanParam::Class(DeviceClass::C)).unwrap();

        wait_for("class c", || h.mac.class() == DeviceClass::C);
        wait_for("joined", || h.wan.state() == State::Joined);
        assert_eq!(
            h.wan.get_param(WanParamKind::Class),
            WanParam::Class(DeviceClass::C)
        );
    }

    #[test]
    fn test_class_set_before_join_applies_directly() {
        let h = start();
        h.wan.set_param(WanParam::Class(DeviceClass::B)).unwrap();
        assert_eq!(h.mac.class(), DeviceClass::B);
        assert_eq!(h.wan.state(), State::NotJoined);
    }

    #[test]
    fn test_region_change_drops_session() {
        let h = joined();
        h.wan.set_param(WanParam::Region(Region::Us915)).unwrap();

        wait_for("session dropped", || h.wan.state() == State::NotJoined);
        assert_eq!(h.mac.region(), Some(Region::Us915));
        assert_eq!(
            h.wan.get_param(WanParamKind::Region),
            WanParam::Region(Region::Us915)
        );
    }

    #[test]
    fn test_close_releases_queued_sync_send() {
        let h = start();
        h.wan.port_open(7).unwrap();
        let wan = Arc::new(h.wan);

        let sender = {
            let wan = wan.clone();
            thread::spawn(move || wan.tx(&TxParams::new(b"stuck").port(7).sync()))
        };
        wait_for("queued", || wan.is_pending_tx());
        wan.port_close(7).unwrap();

        assert_eq!(
            sender.join().unwrap(),
            Err(LoraError::Port(PortError::NotOpened))
        );
    }

    #[test]
    fn test_stop_fails_uplink_in_flight() {
        let h = joined();
        h.wan.port_open(3).unwrap();
        h.mac.set_silent(true);

        thread::scope(|s| {
            let sender = s.spawn(|| h.wan.tx(&TxParams::new(b"lost").port(3).sync()));
            wait_for("in flight", || h.mac.sent().len() == 1);
            h.wan.stop();
            assert_eq!(sender.join().unwrap(), Err(LoraError::Error));
        });
        assert_eq!(
            h.wan.tx(&TxParams::new(b"late").port(3)),
            Err(LoraError::PoweredOff)
        );
    }

    #[test]
    fn test_stop_releases_queued_sender() {
        let h = start();
        h.wan.port_open(7).unwrap();

        thread::scope(|s| {
            let sender = s.spawn(|| h.wan.tx(&TxParams::new(b"queued").port(7).sync()));
            wait_for("queued", || h.wan.is_pending_tx());
            h.wan.stop();
            assert_eq!(
                sender.join().unwrap(),
                Err(LoraError::Port(PortError::NotOpened))
            );
        });
        // A second stop, and the one in drop, do nothing.
        h.wan.stop();
    }

    #[test]
    fn test_logging_callback_drains_indications() {
        let h = joined();
        h.wan.port_open(5).unwrap();
        h.wan
            .set_callback(PortSelector::Any, h.wan.logging_callback())
            .unwrap();

        h.wan.tx(&TxParams::new(b"x").port(5).sync()).unwrap();
        wait_for("drained", || h.wan.stats().ports.ind_queued == 0);
        assert_eq!(h.wan.get_ind_params(), Indication::None);
    }

    #[test]
    fn test_duty_period_persists() {
        let h = start();
        h.wan.duty_set(Duration::from_millis(50)).unwrap();
        assert_eq!(h.wan.duty_get(), Duration::from_millis(50));
        h.wan.duty_stop();
        assert!(!h.wan.stats().duty_running);
        assert!(h.storage.raw(duty::DUTY_KEY).is_some());
    }
}
